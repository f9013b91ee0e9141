//! Fetch shop images, copy them into blob storage and index them, at most once
//! per `(shop_id, original_url)`.

use std::collections::HashMap;
use std::sync::Arc;

use dsc_core::{ImageKind, ImageRecord, PersistedShop};
use dsc_storage::{BlobStore, ResourceFetcher, TableStore};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

const DEFAULT_EXTENSION: &str = "jpg";
const DEFAULT_CONTENT_TYPE: &str = "image/jpeg";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    InvalidUrl,
    AlreadyIngested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStage {
    Lookup,
    Fetch,
    Upload,
    Index,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ImageOutcome {
    Stored {
        public_url: String,
        storage_path: String,
    },
    Skipped {
        reason: SkipReason,
    },
    Failed {
        stage: ImageStage,
        message: String,
    },
}

impl ImageOutcome {
    pub fn public_url(&self) -> Option<&str> {
        match self {
            Self::Stored { public_url, .. } => Some(public_url),
            _ => None,
        }
    }

    fn failed(stage: ImageStage, err: impl std::fmt::Display) -> Self {
        Self::Failed {
            stage,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageAttempt {
    pub shop_id: Uuid,
    pub url: String,
    pub kind: ImageKind,
    pub outcome: ImageOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImageIngestionReport {
    pub attempts: Vec<ImageAttempt>,
}

impl ImageIngestionReport {
    pub fn stored(&self) -> usize {
        self.count(|o| matches!(o, ImageOutcome::Stored { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, ImageOutcome::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, ImageOutcome::Failed { .. }))
    }

    fn count(&self, pred: impl Fn(&ImageOutcome) -> bool) -> usize {
        self.attempts.iter().filter(|a| pred(&a.outcome)).count()
    }
}

/// Lower-cased last-path-segment extension when it is 1-5 ASCII alphanumerics.
pub fn extension_for(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|segment| segment.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .filter(|ext| {
            (1..=5).contains(&ext.len()) && ext.chars().all(|c| c.is_ascii_alphanumeric())
        })
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

fn parse_image_url(raw: &str) -> Option<Url> {
    let url = Url::parse(raw.trim()).ok()?;
    let web = matches!(url.scheme(), "http" | "https");
    (web && url.host_str().is_some_and(|h| !h.is_empty())).then_some(url)
}

type IngestKey = (Uuid, String);

pub struct ImageIngestor {
    store: Arc<dyn TableStore>,
    blobs: Arc<dyn BlobStore>,
    fetcher: Arc<dyn ResourceFetcher>,
    in_flight: Mutex<HashMap<IngestKey, Arc<Mutex<()>>>>,
}

impl ImageIngestor {
    pub fn new(
        store: Arc<dyn TableStore>,
        blobs: Arc<dyn BlobStore>,
        fetcher: Arc<dyn ResourceFetcher>,
    ) -> Self {
        Self {
            store,
            blobs,
            fetcher,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    async fn key_lock(&self, key: &IngestKey) -> Arc<Mutex<()>> {
        let mut map = self.in_flight.lock().await;
        map.entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn release_key(&self, key: &IngestKey, lock: Arc<Mutex<()>>) {
        let mut map = self.in_flight.lock().await;
        // One reference in the map, one held here: nobody else is waiting.
        if Arc::strong_count(&lock) <= 2 {
            map.remove(key);
        }
    }

    pub async fn ingest_image(
        &self,
        shop_id: Uuid,
        original_url: &str,
        kind: ImageKind,
    ) -> ImageOutcome {
        let Some(url) = parse_image_url(original_url) else {
            debug!(%shop_id, url = original_url, "skipping invalid image url");
            return ImageOutcome::Skipped {
                reason: SkipReason::InvalidUrl,
            };
        };

        let key = (shop_id, original_url.to_string());
        let lock = self.key_lock(&key).await;
        let outcome = {
            let _guard = lock.lock().await;
            self.ingest_locked(shop_id, original_url, &url).await
        };
        self.release_key(&key, lock).await;

        match &outcome {
            ImageOutcome::Stored { storage_path, .. } => {
                info!(%shop_id, url = original_url, ?kind, storage_path, "image stored")
            }
            ImageOutcome::Failed { stage, message } => warn!(
                %shop_id,
                url = original_url,
                ?kind,
                ?stage,
                error = %message,
                "image ingestion failed"
            ),
            ImageOutcome::Skipped { reason } => {
                debug!(%shop_id, url = original_url, ?reason, "image skipped")
            }
        }
        outcome
    }

    async fn ingest_locked(&self, shop_id: Uuid, original_url: &str, url: &Url) -> ImageOutcome {
        match self.store.find_image(shop_id, original_url).await {
            Ok(Some(_)) => {
                return ImageOutcome::Skipped {
                    reason: SkipReason::AlreadyIngested,
                }
            }
            Ok(None) => {}
            Err(err) => return ImageOutcome::failed(ImageStage::Lookup, err),
        }

        let response = match self.fetcher.fetch(url.as_str()).await {
            Ok(response) => response,
            Err(err) => return ImageOutcome::failed(ImageStage::Fetch, err),
        };

        let storage_path = format!("{shop_id}/{}.{}", Uuid::new_v4(), extension_for(url));
        let content_type = response
            .content_type
            .as_deref()
            .map(str::trim)
            .filter(|ct| !ct.is_empty())
            .unwrap_or(DEFAULT_CONTENT_TYPE);
        let stored = match self
            .blobs
            .put(&storage_path, &response.body, content_type)
            .await
        {
            Ok(stored) => stored,
            Err(err) => return ImageOutcome::failed(ImageStage::Upload, err),
        };
        debug!(
            %shop_id,
            key = %stored.key,
            sha256 = %stored.content_hash,
            bytes = stored.byte_size,
            content_type = %stored.content_type,
            "image blob uploaded"
        );

        let record = ImageRecord {
            shop_id,
            original_url: original_url.to_string(),
            storage_path: storage_path.clone(),
            public_url: self.blobs.public_url(&storage_path),
        };
        match self.store.insert_image(&record).await {
            Ok(true) => ImageOutcome::Stored {
                public_url: record.public_url,
                storage_path,
            },
            Ok(false) => {
                // Another writer indexed the same url first; our blob is unreferenced.
                warn!(
                    %shop_id,
                    url = original_url,
                    storage_path,
                    "image indexed concurrently; orphan blob left behind"
                );
                ImageOutcome::Skipped {
                    reason: SkipReason::AlreadyIngested,
                }
            }
            Err(err) => ImageOutcome::failed(ImageStage::Index, err),
        }
    }

    /// Thumbnail (`image_url`) then gallery (`site_images`) for every shop,
    /// at most `concurrency` in flight. Report order follows input order.
    pub async fn ingest_shop_images(
        &self,
        shops: &[PersistedShop],
        concurrency: usize,
    ) -> ImageIngestionReport {
        let jobs: Vec<(Uuid, String, ImageKind)> = shops
            .iter()
            .flat_map(|shop| {
                let thumbnail = Some(shop.image_url.trim())
                    .filter(|u| !u.is_empty())
                    .map(|u| (shop.id, u.to_string(), ImageKind::Thumbnail));
                let gallery = shop
                    .site_images
                    .iter()
                    .map(|u| (shop.id, u.clone(), ImageKind::Gallery));
                thumbnail.into_iter().chain(gallery)
            })
            .collect();

        let attempts: Vec<ImageAttempt> = stream::iter(jobs)
            .map(|(shop_id, url, kind)| async move {
                let outcome = self.ingest_image(shop_id, &url, kind).await;
                ImageAttempt {
                    shop_id,
                    url,
                    kind,
                    outcome,
                }
            })
            .buffered(concurrency.max(1))
            .collect()
            .await;

        let report = ImageIngestionReport { attempts };
        info!(
            shops = shops.len(),
            stored = report.stored(),
            skipped = report.skipped(),
            failed = report.failed(),
            "image ingestion finished"
        );
        report
    }
}
