//! Relational persistence seam: batched upserts that hand back generated ids.

use async_trait::async_trait;
use dsc_core::{CourseRow, ImageRecord, PersistedCourse, PersistedShop, ShopRow};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait TableStore: Send + Sync {
    /// Insert-or-update on `name`. Returns the stored rows including ids; a row
    /// the backend refused is simply absent from the result.
    async fn upsert_shops(&self, rows: &[ShopRow]) -> Result<Vec<PersistedShop>, StoreError>;

    /// Insert-or-update on `(shop_id, title)`.
    async fn upsert_courses(&self, rows: &[CourseRow])
        -> Result<Vec<PersistedCourse>, StoreError>;

    async fn find_image(
        &self,
        shop_id: Uuid,
        original_url: &str,
    ) -> Result<Option<ImageRecord>, StoreError>;

    /// Insert unless `(shop_id, original_url)` exists. Returns whether a row was written.
    async fn insert_image(&self, record: &ImageRecord) -> Result<bool, StoreError>;
}
