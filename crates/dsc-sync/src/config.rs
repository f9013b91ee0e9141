use std::path::PathBuf;
use std::time::Duration;

use dsc_storage::{HttpClientConfig, RemoteBlobConfig, DEFAULT_BUCKET};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// `None` selects the in-memory table store.
    pub database_url: Option<String>,
    pub input_dir: PathBuf,
    pub snapshot_path: PathBuf,
    pub blob_dir: PathBuf,
    pub blob_public_base_url: String,
    pub storage_url: Option<String>,
    pub storage_key: Option<String>,
    pub storage_bucket: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub image_concurrency: usize,
    pub catalog_path: PathBuf,
    pub reports_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            input_dir: PathBuf::from("./output"),
            snapshot_path: PathBuf::from("./output/merged_shops.csv"),
            blob_dir: PathBuf::from("./blobs"),
            blob_public_base_url: "http://localhost:8000/shop-images".to_string(),
            storage_url: None,
            storage_key: None,
            storage_bucket: DEFAULT_BUCKET.to_string(),
            http_timeout_secs: 10,
            user_agent: "dsc-bot/0.1".to_string(),
            image_concurrency: 4,
            catalog_path: PathBuf::from("./course_catalog.yaml"),
            reports_dir: PathBuf::from("./reports"),
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: non_empty_var("DATABASE_URL"),
            input_dir: non_empty_var("DSC_INPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.input_dir),
            snapshot_path: non_empty_var("DSC_SNAPSHOT_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.snapshot_path),
            blob_dir: non_empty_var("DSC_BLOB_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.blob_dir),
            blob_public_base_url: non_empty_var("DSC_BLOB_PUBLIC_BASE_URL")
                .unwrap_or(defaults.blob_public_base_url),
            storage_url: non_empty_var("DSC_STORAGE_URL"),
            storage_key: non_empty_var("DSC_STORAGE_KEY"),
            storage_bucket: non_empty_var("DSC_STORAGE_BUCKET").unwrap_or(defaults.storage_bucket),
            http_timeout_secs: non_empty_var("DSC_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: non_empty_var("DSC_USER_AGENT").unwrap_or(defaults.user_agent),
            image_concurrency: non_empty_var("DSC_IMAGE_CONCURRENCY")
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.image_concurrency),
            catalog_path: non_empty_var("DSC_CATALOG_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.catalog_path),
            reports_dir: non_empty_var("DSC_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    /// Remote object storage is used only when both URL and key are set.
    pub fn remote_blob_config(&self) -> Option<RemoteBlobConfig> {
        let base_url = self.storage_url.clone()?;
        let api_key = self.storage_key.clone()?;
        Some(RemoteBlobConfig {
            base_url,
            api_key,
            bucket: self.storage_bucket.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_storage_needs_url_and_key() {
        let mut config = PipelineConfig {
            storage_url: Some("https://proj.supabase.test".into()),
            ..Default::default()
        };
        assert!(config.remote_blob_config().is_none());

        config.storage_key = Some("service-key".into());
        let remote = config.remote_blob_config().expect("remote");
        assert_eq!(remote.bucket, DEFAULT_BUCKET);
        assert_eq!(remote.timeout, Duration::from_secs(10));
    }

    #[test]
    fn http_config_carries_timeout_and_agent() {
        let config = PipelineConfig {
            http_timeout_secs: 3,
            ..Default::default()
        };
        let http = config.http_client_config();
        assert_eq!(http.timeout, Duration::from_secs(3));
        assert_eq!(http.user_agent.as_deref(), Some("dsc-bot/0.1"));
    }
}
