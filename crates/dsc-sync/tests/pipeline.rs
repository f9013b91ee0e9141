use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dsc_adapters::{
    load_raw_documents, CourseCatalog, ReviewService, StaticReviewService, VocabularyNormalizer,
};
use dsc_core::{
    CourseRow, ImageRecord, PersistedCourse, PersistedShop, RawShopDocument, ShopRow,
};
use dsc_storage::{
    FetchError, FetchedResponse, LocalBlobStore, MemoryTableStore, ResourceFetcher, StoreError,
    TableStore,
};
use dsc_sync::{
    prepare_documents, read_snapshot, PersistOutcome, PipelineBackends, PipelineConfig,
    RunSummary, SkipReason, SyncPipeline,
};
use tempfile::TempDir;
use uuid::Uuid;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// Serves a tiny PNG for every URL except ones containing `missing`.
#[derive(Default)]
struct FixtureFetcher {
    calls: AtomicUsize,
}

#[async_trait]
impl ResourceFetcher for FixtureFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if url.contains("missing") {
            return Err(FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            });
        }
        Ok(FetchedResponse {
            status: 200,
            final_url: url.to_string(),
            content_type: None,
            body: b"\x89PNG fixture".to_vec(),
        })
    }
}

struct Env {
    dir: TempDir,
    store: Arc<MemoryTableStore>,
    fetcher: Arc<FixtureFetcher>,
    pipeline: SyncPipeline,
}

fn config_in(dir: &Path) -> PipelineConfig {
    PipelineConfig {
        snapshot_path: dir.join("output").join("merged_shops.csv"),
        blob_dir: dir.join("blobs"),
        blob_public_base_url: "http://cdn.test/shop-images".into(),
        reports_dir: dir.join("reports"),
        image_concurrency: 2,
        ..Default::default()
    }
}

fn env() -> Env {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config_in(dir.path());
    let store = Arc::new(MemoryTableStore::new());
    let fetcher = Arc::new(FixtureFetcher::default());
    let backends = PipelineBackends {
        store: store.clone(),
        blobs: Arc::new(LocalBlobStore::new(
            config.blob_dir.clone(),
            config.blob_public_base_url.clone(),
        )),
        fetcher: fetcher.clone(),
        table_backend: "memory".into(),
    };
    Env {
        dir,
        store,
        fetcher,
        pipeline: SyncPipeline::new(config, backends),
    }
}

async fn prepared_fixture_documents() -> Vec<RawShopDocument> {
    let root = workspace_root();
    let loaded = load_raw_documents(root.join("fixtures/raw")).expect("load fixtures");
    assert_eq!(loaded.skipped_files.len(), 1, "broken.json is skipped");

    let catalog = CourseCatalog::load(root.join("course_catalog.yaml")).expect("catalog");
    let reviews = StaticReviewService::load(root.join("fixtures/reviews.json")).expect("reviews");
    let mut documents = loaded.documents;
    let stats = prepare_documents(
        &mut documents,
        Some(&reviews as &dyn ReviewService),
        &VocabularyNormalizer::default(),
        &catalog,
    )
    .await;
    assert_eq!(stats.reviewed_shops, 2);
    assert_eq!(stats.renamed_courses, 2);
    documents
}

fn course_titles(summary: &RunSummary, shop: &str) -> Vec<String> {
    let id = summary
        .persistence
        .shops
        .iter()
        .find(|s| s.name == shop)
        .map(|s| s.id)
        .expect("shop persisted");
    summary
        .persistence
        .courses
        .iter()
        .filter(|c| c.shop_id == id)
        .map(|c| c.title.clone())
        .collect()
}

#[tokio::test]
async fn fixture_run_persists_reconciled_catalog_and_images() {
    let env = env();
    let documents = prepared_fixture_documents().await;

    let summary = env.pipeline.run_once(&documents).await.expect("run");
    assert_eq!(summary.persistence.outcome, PersistOutcome::Completed);

    let stats = summary.reconcile.as_ref().expect("reconcile stats");
    assert_eq!(stats.shops, 2);
    assert_eq!(stats.nameless_documents, 1);
    assert_eq!(stats.duplicate_courses, 1);

    assert_eq!(
        course_titles(&summary, "Blue Ocean Okinawa"),
        ["OWD", "AOW", "オープン・ウォーター・ダイバー"]
    );
    let courses = env.store.courses().await;
    let owd = courses.iter().find(|c| c.title == "OWD").expect("owd");
    assert_eq!(owd.price, 39800);
    let open_water = courses
        .iter()
        .find(|c| c.title == "オープン・ウォーター・ダイバー")
        .expect("normalized");
    assert_eq!(open_water.price, 45000);
    assert_eq!(open_water.level, "unknown");
    assert_eq!(open_water.min_days, Some(3));
    let night = courses
        .iter()
        .find(|c| c.title == "ナイト・ダイバー")
        .expect("reef course");
    assert_eq!(night.price, 12000);

    let shops = env.store.shops().await;
    let blue = shops
        .iter()
        .find(|s| s.name == "Blue Ocean Okinawa")
        .expect("blue");
    assert_eq!(blue.city, "那覇市");
    assert_eq!(blue.rating, 4.7);
    assert_eq!(blue.review_count, 212);

    assert_eq!(summary.images.stored(), 2);
    assert_eq!(summary.images.skipped(), 1);
    assert_eq!(summary.images.failed(), 1);
    let images = env.store.images().await;
    assert_eq!(images.len(), 2);
    assert!(images.iter().all(|i| i.shop_id == blue.id));
    assert!(images
        .iter()
        .all(|i| i.public_url.starts_with("http://cdn.test/shop-images/")
            && i.storage_path.starts_with(&blue.id.to_string())));

    let snapshot = read_snapshot(&env.pipeline.config().snapshot_path).expect("snapshot");
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].course_list.len(), 3);

    assert!(summary.reports_dir.join("run_report.json").exists());
    let markdown =
        std::fs::read_to_string(summary.reports_dir.join("summary.md")).expect("summary.md");
    assert!(markdown.contains("https://reef.example.jp/missing.jpg"));
}

#[tokio::test]
async fn second_run_converges_and_skips_ingested_images() {
    let env = env();
    let documents = prepared_fixture_documents().await;

    let first = env.pipeline.run_once(&documents).await.expect("first run");
    let second = env.pipeline.run_once(&documents).await.expect("second run");

    assert_eq!(env.store.shops().await.len(), 2);
    assert_eq!(env.store.courses().await.len(), 4);
    assert_eq!(env.store.images().await.len(), 2);
    assert_eq!(
        first.persistence.shops.iter().map(|s| s.id).collect::<Vec<_>>(),
        second.persistence.shops.iter().map(|s| s.id).collect::<Vec<_>>()
    );

    assert_eq!(second.images.stored(), 0);
    let already = second
        .images
        .attempts
        .iter()
        .filter(|a| {
            a.outcome
                == dsc_sync::ImageOutcome::Skipped {
                    reason: SkipReason::AlreadyIngested,
                }
        })
        .count();
    assert_eq!(already, 2);
    // Only the failing URL is fetched again.
    assert_eq!(env.fetcher.calls.load(Ordering::SeqCst), 4);
    assert_ne!(first.run_id, second.run_id);
}

#[tokio::test]
async fn persisting_from_a_snapshot_matches_a_direct_run() {
    let direct = env();
    let documents = prepared_fixture_documents().await;
    let expected = direct.pipeline.run_once(&documents).await.expect("run");

    let replay = env();
    std::fs::create_dir_all(replay.dir.path().join("output")).expect("mkdir");
    std::fs::copy(
        &direct.pipeline.config().snapshot_path,
        &replay.pipeline.config().snapshot_path,
    )
    .expect("copy snapshot");

    let summary = replay.pipeline.run_from_snapshot().await.expect("replay");
    assert!(summary.reconcile.is_none());
    assert_eq!(summary.records, expected.records);
    assert_eq!(
        course_titles(&summary, "Blue Ocean Okinawa"),
        course_titles(&expected, "Blue Ocean Okinawa")
    );
    assert_eq!(replay.store.courses().await.len(), 4);
}

/// Every write fails; lookups see an empty index.
struct OfflineStore;

#[async_trait]
impl TableStore for OfflineStore {
    async fn upsert_shops(&self, _rows: &[ShopRow]) -> Result<Vec<PersistedShop>, StoreError> {
        Err(StoreError::Backend("connection refused".into()))
    }

    async fn upsert_courses(
        &self,
        _rows: &[CourseRow],
    ) -> Result<Vec<PersistedCourse>, StoreError> {
        Err(StoreError::Backend("connection refused".into()))
    }

    async fn find_image(
        &self,
        _shop_id: Uuid,
        _original_url: &str,
    ) -> Result<Option<ImageRecord>, StoreError> {
        Ok(None)
    }

    async fn insert_image(&self, _record: &ImageRecord) -> Result<bool, StoreError> {
        Err(StoreError::Backend("connection refused".into()))
    }
}

#[tokio::test]
async fn shop_phase_failure_writes_reports_then_fails_the_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config_in(dir.path());
    let reports_root = config.reports_dir.clone();
    let fetcher = Arc::new(FixtureFetcher::default());
    let backends = PipelineBackends {
        store: Arc::new(OfflineStore),
        blobs: Arc::new(LocalBlobStore::new(
            config.blob_dir.clone(),
            config.blob_public_base_url.clone(),
        )),
        fetcher: fetcher.clone(),
        table_backend: "offline".into(),
    };
    let pipeline = SyncPipeline::new(config, backends);
    let documents = prepared_fixture_documents().await;

    let err = pipeline.run_once(&documents).await.expect_err("shop phase fails");
    assert!(format!("{err:#}").contains("connection refused"), "{err:#}");
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);

    let runs: Vec<PathBuf> = std::fs::read_dir(&reports_root)
        .expect("reports dir")
        .map(|entry| entry.expect("entry").path())
        .collect();
    assert_eq!(runs.len(), 1);
    let report: serde_json::Value = serde_json::from_slice(
        &std::fs::read(runs[0].join("run_report.json")).expect("run_report.json"),
    )
    .expect("json");
    assert_eq!(report["persistence"]["outcome"]["status"], "failed");
    assert_eq!(report["persistence"]["outcome"]["phase"], "shops");
    let markdown = std::fs::read_to_string(runs[0].join("summary.md")).expect("summary.md");
    assert!(markdown.contains("failed (Shops)"));
}
