//! Run orchestration: prepare raw documents, reconcile, snapshot, persist,
//! ingest images, and write the run reports.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use dsc_adapters::{attach_reviews, normalize_courses, CourseCatalog, Normalizer, ReviewService};
use dsc_core::{CanonicalShopRecord, RawShopDocument};
use dsc_storage::{
    BlobStore, HttpFetcher, LocalBlobStore, MemoryTableStore, PgTableStore, RemoteBlobStore,
    ResourceFetcher, TableStore,
};
use serde::Serialize;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::images::{ImageIngestionReport, ImageIngestor, ImageOutcome};
use crate::persist::{PersistOutcome, PersistenceReport, UpsertCoordinator};
use crate::reconcile::{reconcile, Reconciled};
use crate::snapshot::{read_snapshot, write_snapshot, write_snapshot_manifest};

const PG_MAX_CONNECTIONS: u32 = 5;

/// The collaborators a pipeline writes through.
pub struct PipelineBackends {
    pub store: Arc<dyn TableStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub fetcher: Arc<dyn ResourceFetcher>,
    /// Human label for reports, e.g. `postgres` or `memory`.
    pub table_backend: String,
}

/// Postgres when `DATABASE_URL` is set and this is not a dry run, otherwise the
/// in-memory store. Remote object storage likewise needs both URL and key.
pub async fn build_backends(config: &PipelineConfig, dry_run: bool) -> Result<PipelineBackends> {
    let (store, table_backend): (Arc<dyn TableStore>, &str) = match &config.database_url {
        Some(url) if !dry_run => {
            let pg = PgTableStore::connect(url, PG_MAX_CONNECTIONS)
                .await
                .context("connecting to postgres")?;
            pg.ensure_schema().await.context("ensuring table schema")?;
            let store: Arc<dyn TableStore> = Arc::new(pg);
            (store, "postgres")
        }
        _ => {
            let store: Arc<dyn TableStore> = Arc::new(MemoryTableStore::new());
            (store, "memory")
        }
    };

    let blobs: Arc<dyn BlobStore> = match config.remote_blob_config() {
        Some(remote) if !dry_run => {
            Arc::new(RemoteBlobStore::new(remote).context("building remote blob client")?)
        }
        _ => Arc::new(LocalBlobStore::new(
            config.blob_dir.clone(),
            config.blob_public_base_url.clone(),
        )),
    };

    let fetcher = Arc::new(HttpFetcher::new(config.http_client_config())?);
    info!(table_backend, dry_run, "pipeline backends ready");
    Ok(PipelineBackends {
        store,
        blobs,
        fetcher,
        table_backend: table_backend.to_string(),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PrepareStats {
    pub documents: usize,
    pub renamed_courses: usize,
    pub reviewed_shops: usize,
    pub review_errors: usize,
}

/// Overlay reviews and normalize course names on raw documents. A failed
/// review lookup leaves that document as scraped.
pub async fn prepare_documents(
    documents: &mut [RawShopDocument],
    reviews: Option<&dyn ReviewService>,
    normalizer: &dyn Normalizer,
    catalog: &CourseCatalog,
) -> PrepareStats {
    let mut stats = PrepareStats {
        documents: documents.len(),
        ..Default::default()
    };
    for doc in documents.iter_mut() {
        if let Some(service) = reviews {
            match attach_reviews(doc, service).await {
                Ok(true) => stats.reviewed_shops += 1,
                Ok(false) => {}
                Err(err) => {
                    stats.review_errors += 1;
                    warn!(
                        shop = doc.name.as_deref().unwrap_or("-"),
                        error = %err,
                        "review lookup failed"
                    );
                }
            }
        }
        stats.renamed_courses += normalize_courses(doc, normalizer, catalog);
    }
    info!(
        documents = stats.documents,
        renamed_courses = stats.renamed_courses,
        reviewed_shops = stats.reviewed_shops,
        "documents prepared"
    );
    stats
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub table_backend: String,
    /// `None` when the run started from an existing snapshot.
    pub reconcile: Option<ReconcileStats>,
    pub records: usize,
    pub persistence: PersistenceReport,
    pub images: ImageIngestionReport,
    pub reports_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub documents: usize,
    pub shops: usize,
    pub duplicate_courses: usize,
    pub nameless_documents: usize,
}

impl ReconcileStats {
    fn new(documents: usize, reconciled: &Reconciled) -> Self {
        Self {
            documents,
            shops: reconciled.records.len(),
            duplicate_courses: reconciled.duplicate_courses,
            nameless_documents: reconciled.nameless_documents,
        }
    }
}

pub struct SyncPipeline {
    config: PipelineConfig,
    table_backend: String,
    coordinator: UpsertCoordinator,
    images: ImageIngestor,
}

impl SyncPipeline {
    pub fn new(config: PipelineConfig, backends: PipelineBackends) -> Self {
        let coordinator = UpsertCoordinator::new(backends.store.clone());
        let images = ImageIngestor::new(backends.store, backends.blobs, backends.fetcher);
        Self {
            config,
            table_backend: backends.table_backend,
            coordinator,
            images,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Reconcile and write the snapshot (plus its manifest).
    pub fn reconcile_to_snapshot(&self, documents: &[RawShopDocument]) -> Result<Reconciled> {
        let reconciled = reconcile(documents);
        let path = &self.config.snapshot_path;
        write_snapshot(path, &reconciled.records)
            .with_context(|| format!("writing snapshot {}", path.display()))?;
        write_snapshot_manifest(path, reconciled.records.len())
            .with_context(|| format!("writing manifest for {}", path.display()))?;
        Ok(reconciled)
    }

    /// Full run from raw documents.
    pub async fn run_once(&self, documents: &[RawShopDocument]) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let reconciled = self.reconcile_to_snapshot(documents)?;
        let stats = ReconcileStats::new(documents.len(), &reconciled);
        self.persist_and_report(run_id, started_at, Some(stats), &reconciled.records)
            .await
    }

    /// Persist whatever the configured snapshot holds.
    pub async fn run_from_snapshot(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let path = &self.config.snapshot_path;
        let records =
            read_snapshot(path).with_context(|| format!("reading snapshot {}", path.display()))?;
        self.persist_and_report(run_id, started_at, None, &records)
            .await
    }

    async fn persist_and_report(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        reconcile: Option<ReconcileStats>,
        records: &[CanonicalShopRecord],
    ) -> Result<RunSummary> {
        let persistence = self
            .coordinator
            .persist(records)
            .instrument(info_span!("persist", %run_id, records = records.len()))
            .await;

        let images = self
            .images
            .ingest_shop_images(&persistence.shops, self.config.image_concurrency)
            .instrument(info_span!("images", %run_id, shops = persistence.shops.len()))
            .await;

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            table_backend: self.table_backend.clone(),
            reconcile,
            records: records.len(),
            persistence,
            images,
            reports_dir: PathBuf::new(),
        };
        summary.reports_dir = self.write_reports(&summary).await?;

        if let PersistOutcome::Failed { phase, message } = &summary.persistence.outcome {
            bail!("persistence failed in {phase:?} phase: {message}");
        }
        info!(
            %run_id,
            shops = summary.persistence.shops.len(),
            courses = summary.persistence.courses.len(),
            images_stored = summary.images.stored(),
            "run finished"
        );
        Ok(summary)
    }

    async fn write_reports(&self, summary: &RunSummary) -> Result<PathBuf> {
        let reports_dir = self.config.reports_dir.join(summary.run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let json = serde_json::to_vec_pretty(summary).context("serializing run report")?;
        fs::write(reports_dir.join("run_report.json"), json)
            .await
            .context("writing run_report.json")?;
        fs::write(reports_dir.join("summary.md"), summary_markdown(summary))
            .await
            .context("writing summary.md")?;
        Ok(reports_dir)
    }
}

pub fn summary_markdown(summary: &RunSummary) -> String {
    let persistence = &summary.persistence;
    let outcome = match &persistence.outcome {
        PersistOutcome::Completed => "completed".to_string(),
        PersistOutcome::PartialFailure { phase, message } => {
            format!("partial failure ({phase:?}): {message}")
        }
        PersistOutcome::Failed { phase, message } => format!("failed ({phase:?}): {message}"),
    };

    let mut out = format!(
        "# Dive Shop Catalog Run\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Table backend: {}\n- Outcome: {}\n",
        summary.run_id, summary.started_at, summary.finished_at, summary.table_backend, outcome
    );
    if let Some(stats) = &summary.reconcile {
        out.push_str(&format!(
            "\n## Reconcile\n- Documents: {}\n- Shops: {}\n- Duplicate courses discarded: {}\n- Nameless documents: {}\n",
            stats.documents, stats.shops, stats.duplicate_courses, stats.nameless_documents
        ));
    }
    out.push_str(&format!(
        "\n## Persist\n- Shops: {} submitted, {} stored\n- Courses: {} submitted, {} stored\n- Collapsed duplicates: {}\n",
        persistence.shops_submitted,
        persistence.shops.len(),
        persistence.courses_submitted,
        persistence.courses.len(),
        persistence.collapsed_duplicates
    ));
    if !persistence.unresolved_shops.is_empty() {
        out.push_str("\n### Unresolved shops\n");
        for name in &persistence.unresolved_shops {
            out.push_str(&format!("- {name}\n"));
        }
    }
    if !persistence.dropped_courses.is_empty() {
        out.push_str("\n### Dropped courses\n");
        for dropped in &persistence.dropped_courses {
            out.push_str(&format!(
                "- {} / {} ({:?})\n",
                dropped.shop_name, dropped.title, dropped.reason
            ));
        }
    }

    out.push_str(&format!(
        "\n## Images\n- Stored: {}\n- Skipped: {}\n- Failed: {}\n",
        summary.images.stored(),
        summary.images.skipped(),
        summary.images.failed()
    ));
    let failures: Vec<_> = summary
        .images
        .attempts
        .iter()
        .filter_map(|a| match &a.outcome {
            ImageOutcome::Failed { stage, message } => {
                Some(format!("- {} ({:?}): {}\n", a.url, stage, message))
            }
            _ => None,
        })
        .collect();
    if !failures.is_empty() {
        out.push_str("\n### Failed images\n");
        out.extend(failures);
    }
    out
}
