//! Blob storage for shop images: a local directory tree or a remote object API.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub const DEFAULT_BUCKET: &str = "shop-images";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub key: String,
    pub content_hash: String,
    pub content_type: String,
    pub byte_size: usize,
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("invalid blob key {0:?}")]
    InvalidKey(String),
    #[error("blob {0} already exists")]
    AlreadyExists(String),
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("object storage request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("object storage rejected {key} with status {status}: {body}")]
    Rejected { key: String, status: u16, body: String },
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `key`. Existing keys are never overwritten.
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str)
        -> Result<StoredBlob, BlobError>;

    fn public_url(&self, key: &str) -> String;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Keys are relative `/`-separated paths without empty, `.` or `..` segments.
pub fn validate_key(key: &str) -> Result<(), BlobError> {
    let valid = !key.is_empty()
        && !key.starts_with('/')
        && key
            .split('/')
            .all(|seg| !seg.is_empty() && seg != "." && seg != ".." && !seg.contains('\\'));
    if valid {
        Ok(())
    } else {
        Err(BlobError::InvalidKey(key.to_string()))
    }
}

fn io_err<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(std::io::Error) -> BlobError + 'a {
    move |source| BlobError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into(),
        }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        key.split('/').fold(self.root.clone(), |acc, seg| acc.join(seg))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    /// Writes through a temp file and an atomic rename so a crash never leaves
    /// a truncated blob under the final key.
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<StoredBlob, BlobError> {
        validate_key(key)?;
        let absolute_path = self.path_for(key);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .map_err(io_err("creating blob directory", &parent))?;

        if fs::try_exists(&absolute_path)
            .await
            .map_err(io_err("checking blob path", &absolute_path))?
        {
            return Err(BlobError::AlreadyExists(key.to_string()));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err("opening temp blob", &temp_path))?;
        let written = async {
            file.write_all(bytes).await?;
            file.flush().await
        }
        .await;
        drop(file);
        if let Err(source) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err("writing temp blob", &temp_path)(source));
        }

        if let Err(source) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err("renaming temp blob into place", &absolute_path)(source));
        }

        Ok(StoredBlob {
            key: key.to_string(),
            content_hash: sha256_hex(bytes),
            content_type: content_type.to_string(),
            byte_size: bytes.len(),
        })
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url.trim_end_matches('/'), key)
    }
}

#[derive(Debug, Clone)]
pub struct RemoteBlobConfig {
    pub base_url: String,
    pub api_key: String,
    pub bucket: String,
    pub timeout: Duration,
}

/// Client for a Supabase-storage compatible object API.
#[derive(Debug, Clone)]
pub struct RemoteBlobStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    bucket: String,
}

impl RemoteBlobStore {
    pub fn new(config: RemoteBlobConfig) -> Result<Self, BlobError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            bucket: config.bucket,
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.base_url, self.bucket, key)
    }
}

#[async_trait]
impl BlobStore for RemoteBlobStore {
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<StoredBlob, BlobError> {
        validate_key(key)?;
        let resp = self
            .client
            .post(self.object_url(key))
            .bearer_auth(&self.api_key)
            .header("apikey", &self.api_key)
            .header(header::CONTENT_TYPE, content_type)
            .header("x-upsert", "false")
            .body(bytes.to_vec())
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BlobError::Rejected {
                key: key.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        Ok(StoredBlob {
            key: key.to_string(),
            content_hash: sha256_hex(bytes),
            content_type: content_type.to_string(),
            byte_size: bytes.len(),
        })
    }

    fn public_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url, self.bucket, key
        )
    }
}
