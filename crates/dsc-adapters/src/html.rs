use std::sync::Arc;

use async_trait::async_trait;
use dsc_core::RawShopDocument;
use dsc_storage::HttpFetcher;
use scraper::{Html, Selector};
use url::Url;

use crate::{AdapterError, Extractor};

/// Gallery images kept per page.
const MAX_SITE_IMAGES: usize = 10;

/// Metadata-only extractor: reads the shop's name, description and images from
/// page markup. Course lists need a richer extractor.
#[derive(Debug, Clone)]
pub struct HtmlExtractor {
    http: Arc<HttpFetcher>,
}

impl HtmlExtractor {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Extractor for HtmlExtractor {
    async fn extract(&self, url: &str) -> Result<RawShopDocument, AdapterError> {
        let page = self.http.fetch_bytes(url).await?;
        let html = String::from_utf8_lossy(&page.body);
        extract_from_html(&html, url)
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|err| AdapterError::Message(format!("selector {css}: {err}")))
}

fn meta_content(doc: &Html, css: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(doc
        .select(&sel)
        .filter_map(|el| el.value().attr("content"))
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string))
}

/// `website` is always the requested URL, whatever the page claims.
pub fn extract_from_html(html: &str, page_url: &str) -> Result<RawShopDocument, AdapterError> {
    let base = Url::parse(page_url)
        .map_err(|err| AdapterError::Message(format!("invalid page url {page_url}: {err}")))?;
    let doc = Html::parse_document(html);

    let title = {
        let sel = selector("title")?;
        doc.select(&sel)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|t| !t.is_empty())
    };
    let name = meta_content(&doc, r#"meta[property="og:site_name"]"#)?.or(title);
    let description = match meta_content(&doc, r#"meta[name="description"]"#)? {
        Some(d) => Some(d),
        None => meta_content(&doc, r#"meta[property="og:description"]"#)?,
    };
    let image_url = meta_content(&doc, r#"meta[property="og:image"]"#)?
        .and_then(|src| base.join(&src).ok())
        .map(String::from);

    let img = selector("img[src]")?;
    let mut site_images: Vec<String> = Vec::new();
    for src in doc.select(&img).filter_map(|el| el.value().attr("src")) {
        let Ok(resolved) = base.join(src.trim()) else {
            continue;
        };
        if !matches!(resolved.scheme(), "http" | "https") {
            continue;
        }
        let resolved = String::from(resolved);
        if !site_images.contains(&resolved) {
            site_images.push(resolved);
        }
        if site_images.len() >= MAX_SITE_IMAGES {
            break;
        }
    }

    Ok(RawShopDocument {
        name,
        description,
        website: Some(page_url.to_string()),
        image_url,
        site_images,
        ..Default::default()
    })
}
