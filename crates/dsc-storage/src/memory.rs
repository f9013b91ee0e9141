//! In-process table store with the same conflict semantics as the Postgres one.

use std::collections::HashMap;

use async_trait::async_trait;
use dsc_core::{CourseRow, ImageRecord, PersistedCourse, PersistedShop, ShopRow};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::table::{StoreError, TableStore};

#[derive(Debug, Default)]
struct Tables {
    shops: Vec<PersistedShop>,
    shop_by_name: HashMap<String, usize>,
    courses: Vec<PersistedCourse>,
    course_by_key: HashMap<(Uuid, String), usize>,
    images: Vec<ImageRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryTableStore {
    tables: Mutex<Tables>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn shops(&self) -> Vec<PersistedShop> {
        self.tables.lock().await.shops.clone()
    }

    pub async fn courses(&self) -> Vec<PersistedCourse> {
        self.tables.lock().await.courses.clone()
    }

    pub async fn images(&self) -> Vec<ImageRecord> {
        self.tables.lock().await.images.clone()
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn upsert_shops(&self, rows: &[ShopRow]) -> Result<Vec<PersistedShop>, StoreError> {
        let mut tables = self.tables.lock().await;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let idx = match tables.shop_by_name.get(&row.name).copied() {
                Some(idx) => {
                    let id = tables.shops[idx].id;
                    tables.shops[idx] = PersistedShop::from_row(id, row.clone());
                    idx
                }
                None => {
                    tables
                        .shops
                        .push(PersistedShop::from_row(Uuid::new_v4(), row.clone()));
                    let idx = tables.shops.len() - 1;
                    tables.shop_by_name.insert(row.name.clone(), idx);
                    idx
                }
            };
            out.push(tables.shops[idx].clone());
        }
        Ok(out)
    }

    async fn upsert_courses(
        &self,
        rows: &[CourseRow],
    ) -> Result<Vec<PersistedCourse>, StoreError> {
        let mut tables = self.tables.lock().await;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            if !tables.shops.iter().any(|s| s.id == row.shop_id) {
                return Err(StoreError::Backend(format!(
                    "course {:?} references unknown shop {}",
                    row.title, row.shop_id
                )));
            }
            let key = (row.shop_id, row.title.clone());
            let idx = match tables.course_by_key.get(&key).copied() {
                Some(idx) => {
                    let id = tables.courses[idx].id;
                    tables.courses[idx] = PersistedCourse::from_row(id, row.clone());
                    idx
                }
                None => {
                    tables
                        .courses
                        .push(PersistedCourse::from_row(Uuid::new_v4(), row.clone()));
                    let idx = tables.courses.len() - 1;
                    tables.course_by_key.insert(key, idx);
                    idx
                }
            };
            out.push(tables.courses[idx].clone());
        }
        Ok(out)
    }

    async fn find_image(
        &self,
        shop_id: Uuid,
        original_url: &str,
    ) -> Result<Option<ImageRecord>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .images
            .iter()
            .find(|img| img.shop_id == shop_id && img.original_url == original_url)
            .cloned())
    }

    async fn insert_image(&self, record: &ImageRecord) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        let exists = tables
            .images
            .iter()
            .any(|img| img.shop_id == record.shop_id && img.original_url == record.original_url);
        if exists {
            return Ok(false);
        }
        tables.images.push(record.clone());
        Ok(true)
    }
}
