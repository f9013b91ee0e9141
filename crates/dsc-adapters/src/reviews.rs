use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dsc_core::ReviewSummary;

use crate::{AdapterError, ReviewService};

pub const MAX_REVIEWS: usize = 10;

/// Review lookups answered from a pre-fetched JSON file keyed by shop name.
#[derive(Debug, Clone, Default)]
pub struct StaticReviewService {
    by_name: HashMap<String, ReviewSummary>,
}

impl StaticReviewService {
    pub fn new(by_name: HashMap<String, ReviewSummary>) -> Self {
        Self { by_name }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let by_name = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self { by_name })
    }
}

#[async_trait]
impl ReviewService for StaticReviewService {
    async fn lookup(&self, shop_name: &str) -> Result<Option<ReviewSummary>, AdapterError> {
        Ok(self.by_name.get(shop_name).cloned().map(|mut summary| {
            summary.reviews.truncate(MAX_REVIEWS);
            summary
        }))
    }
}
