use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dsc_adapters::{
    load_raw_documents, load_shop_urls, output_file_name, CourseCatalog, CrawlStatus, Extractor,
    HtmlExtractor, ReviewService, StaticReviewService, VocabularyNormalizer,
};
use dsc_core::RawShopDocument;
use dsc_storage::HttpFetcher;
use dsc_sync::{
    build_backends, prepare_documents, reconcile, write_snapshot, write_snapshot_manifest,
    PipelineConfig, RunSummary, SyncPipeline,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "dsc-cli")]
#[command(about = "Dive shop catalog: extract, reconcile and persist shop listings")]
struct Cli {
    /// Use the in-memory table store and local blobs regardless of configuration.
    #[arg(long, global = true)]
    dry_run: bool,

    #[arg(long, global = true, env = "DSC_INPUT_DIR")]
    input_dir: Option<PathBuf>,

    #[arg(long, global = true, env = "DSC_SNAPSHOT_PATH")]
    snapshot: Option<PathBuf>,

    #[arg(long, global = true, env = "DSC_CATALOG_PATH")]
    catalog: Option<PathBuf>,

    /// JSON file of `{shop name: {reviews, rating, review_count}}`.
    #[arg(long, global = true, env = "DSC_REVIEWS_PATH")]
    reviews: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch shop pages into raw documents. The list is either `shop_urls.json`
    /// (`[{"url", "name"}]`) or plain text with one URL per line.
    Extract {
        urls_file: PathBuf,
        #[arg(long, default_value = "shop_status.json")]
        status_file: PathBuf,
    },
    /// Reconcile raw documents into the snapshot file.
    Reconcile,
    /// Persist the snapshot file and ingest its images.
    Persist,
    /// Reconcile, persist and ingest in one go.
    Run,
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

impl Cli {
    fn pipeline_config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::from_env();
        if let Some(dir) = &self.input_dir {
            config.input_dir = dir.clone();
        }
        if let Some(path) = &self.snapshot {
            config.snapshot_path = path.clone();
        }
        if let Some(path) = &self.catalog {
            config.catalog_path = path.clone();
        }
        config
    }
}

fn load_catalog(path: &Path) -> Result<CourseCatalog> {
    if !path.exists() {
        warn!(
            path = %path.display(),
            "course catalog not found; course names pass through unchanged"
        );
        return Ok(CourseCatalog::default());
    }
    CourseCatalog::load(path)
}

async fn load_prepared_documents(
    config: &PipelineConfig,
    reviews_path: Option<&Path>,
) -> Result<Vec<RawShopDocument>> {
    let loaded = load_raw_documents(&config.input_dir)?;
    if !loaded.skipped_files.is_empty() {
        warn!(skipped = loaded.skipped_files.len(), "some document files were skipped");
    }
    let catalog = load_catalog(&config.catalog_path)?;
    let reviews = reviews_path.map(StaticReviewService::load).transpose()?;

    let mut documents = loaded.documents;
    prepare_documents(
        &mut documents,
        reviews.as_ref().map(|r| r as &dyn ReviewService),
        &VocabularyNormalizer::default(),
        &catalog,
    )
    .await;
    Ok(documents)
}

async fn extract(config: &PipelineConfig, urls_file: &Path, status_file: &Path) -> Result<()> {
    let entries = load_shop_urls(urls_file)?;

    let fetcher = Arc::new(HttpFetcher::new(config.http_client_config())?);
    let extractor = HtmlExtractor::new(fetcher);
    let mut status = CrawlStatus::load(status_file)?;
    tokio::fs::create_dir_all(&config.input_dir)
        .await
        .with_context(|| format!("creating {}", config.input_dir.display()))?;

    let (mut extracted, mut failed) = (0usize, 0usize);
    for entry in &entries {
        let url = entry.url.trim();
        let shop = entry.label();
        if status.is_done(url) {
            info!(shop, url, "already extracted");
            continue;
        }
        info!(shop, url, "extracting");
        match extractor.extract(url).await {
            Ok(doc) => {
                let path = config.input_dir.join(output_file_name(url));
                let json = serde_json::to_vec_pretty(&doc).context("serializing document")?;
                tokio::fs::write(&path, json)
                    .await
                    .with_context(|| format!("writing {}", path.display()))?;
                status.mark_done(url);
                status.save()?;
                extracted += 1;
            }
            Err(err) => {
                failed += 1;
                warn!(shop, url, error = %err, "extraction failed; will retry next run");
            }
        }
    }
    println!(
        "extract complete: extracted={extracted} failed={failed} status={}",
        status.path().display()
    );
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!(
        "run complete: run_id={} shops={} courses={} images_stored={} images_failed={} reports={}",
        summary.run_id,
        summary.persistence.shops.len(),
        summary.persistence.courses.len(),
        summary.images.stored(),
        summary.images.failed(),
        summary.reports_dir.display()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("info")?;
    let cli = Cli::parse();
    let config = cli.pipeline_config();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Extract {
            urls_file,
            status_file,
        } => extract(&config, &urls_file, &status_file).await?,
        Commands::Reconcile => {
            let documents = load_prepared_documents(&config, cli.reviews.as_deref()).await?;
            let reconciled = reconcile(&documents);
            write_snapshot(&config.snapshot_path, &reconciled.records)?;
            let manifest =
                write_snapshot_manifest(&config.snapshot_path, reconciled.records.len())?;
            println!(
                "reconcile complete: shops={} duplicate_courses={} snapshot={} sha256={}",
                reconciled.records.len(),
                reconciled.duplicate_courses,
                config.snapshot_path.display(),
                manifest.sha256
            );
        }
        Commands::Persist => {
            let backends = build_backends(&config, cli.dry_run).await?;
            let summary = SyncPipeline::new(config, backends)
                .run_from_snapshot()
                .await?;
            print_summary(&summary);
        }
        Commands::Run => {
            let documents = load_prepared_documents(&config, cli.reviews.as_deref()).await?;
            let backends = build_backends(&config, cli.dry_run).await?;
            let summary = SyncPipeline::new(config, backends)
                .run_once(&documents)
                .await?;
            print_summary(&summary);
        }
    }

    Ok(())
}
