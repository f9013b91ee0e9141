//! Catalog sync: reconcile raw scrapes, snapshot them, persist shops and
//! courses, and ingest shop images.

pub mod config;
pub mod images;
pub mod persist;
pub mod pipeline;
pub mod reconcile;
pub mod snapshot;

pub use config::PipelineConfig;
pub use images::{
    extension_for, ImageAttempt, ImageIngestionReport, ImageIngestor, ImageOutcome, ImageStage,
    SkipReason,
};
pub use persist::{
    DropReason, DroppedCourse, PersistOutcome, PersistPhase, PersistenceReport, UpsertCoordinator,
};
pub use pipeline::{
    build_backends, prepare_documents, summary_markdown, PipelineBackends, PrepareStats,
    ReconcileStats, RunSummary, SyncPipeline,
};
pub use reconcile::{reconcile, Reconciled};
pub use snapshot::{
    decode_csv, encode_csv, manifest_path_for, read_snapshot, write_snapshot,
    write_snapshot_manifest, SnapshotError, SnapshotFormat, SnapshotManifest,
};

pub const CRATE_NAME: &str = "dsc-sync";
