//! Resume bookkeeping for the extraction loop.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use url::Url;

/// One entry of the URL list driving extraction.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ShopUrlEntry {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl ShopUrlEntry {
    /// The shop name when the list has one, otherwise the URL.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.url)
    }
}

/// Accepts a JSON array of `{"url", "name"}` objects, or plain text with one
/// URL per line (blank lines and `#` comments ignored).
pub fn parse_shop_urls(text: &str) -> Result<Vec<ShopUrlEntry>> {
    if text.trim_start().starts_with('[') {
        let entries: Vec<ShopUrlEntry> =
            serde_json::from_str(text).context("parsing shop url list")?;
        return Ok(entries
            .into_iter()
            .filter(|e| !e.url.trim().is_empty())
            .collect());
    }
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|url| ShopUrlEntry {
            url: url.to_string(),
            name: None,
        })
        .collect())
}

pub fn load_shop_urls(path: impl AsRef<Path>) -> Result<Vec<ShopUrlEntry>> {
    let path = path.as_ref();
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_shop_urls(&text).with_context(|| format!("loading {}", path.display()))
}

/// `url -> processed` map persisted as JSON. Only successful URLs are marked,
/// so failures are retried on the next run.
#[derive(Debug, Clone)]
pub struct CrawlStatus {
    path: PathBuf,
    done: BTreeMap<String, bool>,
}

impl CrawlStatus {
    /// A missing file means nothing has been processed yet.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let done = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, done })
    }

    pub fn is_done(&self, url: &str) -> bool {
        self.done.get(url).copied().unwrap_or(false)
    }

    pub fn mark_done(&mut self, url: &str) {
        self.done.insert(url.to_string(), true);
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(&self.done).context("serializing crawl status")?;
        std::fs::write(&self.path, text).with_context(|| format!("writing {}", self.path.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `{host with dots as underscores}_{path with slashes as underscores | index}.json`
pub fn output_file_name(url: &str) -> String {
    let (host, path) = match Url::parse(url) {
        Ok(parsed) => (
            parsed.host_str().unwrap_or_default().to_string(),
            parsed.path().trim_matches('/').to_string(),
        ),
        Err(_) => (String::new(), url.trim_matches('/').to_string()),
    };
    let domain = host.replace('.', "_");
    let path = if path.is_empty() {
        "index".to_string()
    } else {
        path.replace('/', "_")
    };
    format!("{domain}_{path}.json")
}
