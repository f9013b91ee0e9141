//! Collaborator contracts around the pipeline core (extraction, reviews, name
//! normalization) and loading of raw scraped documents.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use dsc_core::{RawShopDocument, ReviewSummary};
use dsc_storage::FetchError;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub mod catalog;
pub mod html;
pub mod reviews;
pub mod status;

pub use catalog::{CourseCatalog, CourseDetail, VocabularyNormalizer};
pub use html::HtmlExtractor;
pub use reviews::StaticReviewService;
pub use status::{load_shop_urls, output_file_name, parse_shop_urls, CrawlStatus, ShopUrlEntry};

pub const CRATE_NAME: &str = "dsc-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Turns a shop page into a raw document.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, url: &str) -> Result<RawShopDocument, AdapterError>;
}

/// Third-party rating lookup keyed by shop name.
#[async_trait]
pub trait ReviewService: Send + Sync {
    async fn lookup(&self, shop_name: &str) -> Result<Option<ReviewSummary>, AdapterError>;
}

/// Maps a free-text course name onto its spelling in `vocabulary`, or returns it unchanged.
pub trait Normalizer: Send + Sync {
    fn normalize(&self, text: &str, vocabulary: &[String]) -> String;
}

/// Look up reviews for the document's shop and overlay them. Returns whether
/// anything was found.
pub async fn attach_reviews(
    doc: &mut RawShopDocument,
    service: &dyn ReviewService,
) -> Result<bool, AdapterError> {
    let Some(name) = doc.name.clone() else {
        return Ok(false);
    };
    match service.lookup(&name).await? {
        Some(summary) => {
            doc.apply_reviews(summary);
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Normalize course names against the catalog vocabulary, then fill catalog
/// details. Runs before reconciliation so spelling variants share a dedup key.
/// Returns the number of renamed courses.
pub fn normalize_courses(
    doc: &mut RawShopDocument,
    normalizer: &dyn Normalizer,
    catalog: &CourseCatalog,
) -> usize {
    let mut renamed = 0usize;
    for course in &mut doc.course_list {
        let normalized = normalizer.normalize(&course.name, catalog.vocabulary());
        if normalized != course.name {
            debug!(from = %course.name, to = %normalized, "normalized course name");
            course.name = normalized;
            renamed += 1;
        }
        catalog.enrich(course);
    }
    renamed
}

#[derive(Debug, Default)]
pub struct LoadedDocuments {
    pub documents: Vec<RawShopDocument>,
    pub skipped_files: Vec<PathBuf>,
}

/// Read every `*.json` file under `dir` in file-name order. A file may hold a
/// single document or an array of documents; unreadable files are skipped.
pub fn load_raw_documents(dir: impl AsRef<Path>) -> Result<LoadedDocuments> {
    let dir = dir.as_ref();
    let mut paths = fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
        .collect::<Vec<_>>();
    paths.sort();

    let mut loaded = LoadedDocuments::default();
    for path in paths {
        match read_documents_file(&path) {
            Ok(docs) => loaded.documents.extend(docs),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping unreadable document file");
                loaded.skipped_files.push(path);
            }
        }
    }
    Ok(loaded)
}

fn read_documents_file(path: &Path) -> Result<Vec<RawShopDocument>> {
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let value: JsonValue =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    let items = match value {
        JsonValue::Array(items) => items,
        obj @ JsonValue::Object(_) => vec![obj],
        _ => anyhow::bail!("{} is neither an object nor an array", path.display()),
    };
    Ok(items
        .into_iter()
        .filter(JsonValue::is_object)
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect())
}
