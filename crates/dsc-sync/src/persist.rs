//! Two-phase upsert: shops first, then courses re-keyed on the ids the shop
//! phase handed back.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dsc_core::{CanonicalShopRecord, CourseRow, PersistedCourse, PersistedShop, ShopRow};
use dsc_storage::TableStore;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistPhase {
    Shops,
    Courses,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PersistOutcome {
    Completed,
    /// Shops were written; the course batch was not.
    PartialFailure { phase: PersistPhase, message: String },
    /// Nothing was written.
    Failed { phase: PersistPhase, message: String },
}

impl PersistOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// The owning shop has no row in the shop-phase result.
    UnresolvedShop,
    MissingTitle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedCourse {
    pub shop_name: String,
    pub title: String,
    pub reason: DropReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersistenceReport {
    pub outcome: PersistOutcome,
    pub shops_submitted: usize,
    pub shops: Vec<PersistedShop>,
    pub courses_submitted: usize,
    pub courses: Vec<PersistedCourse>,
    pub dropped_courses: Vec<DroppedCourse>,
    pub unresolved_shops: Vec<String>,
    /// Shop rows and course rows folded into an earlier row with the same key.
    pub collapsed_duplicates: usize,
}

impl PersistenceReport {
    fn empty() -> Self {
        Self {
            outcome: PersistOutcome::Completed,
            shops_submitted: 0,
            shops: Vec::new(),
            courses_submitted: 0,
            courses: Vec::new(),
            dropped_courses: Vec::new(),
            unresolved_shops: Vec::new(),
            collapsed_duplicates: 0,
        }
    }
}

pub struct UpsertCoordinator {
    store: Arc<dyn TableStore>,
}

impl UpsertCoordinator {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self { store }
    }

    /// Never returns an error: store failures are folded into
    /// [`PersistenceReport::outcome`], and the whole call is safe to repeat.
    pub async fn persist(&self, records: &[CanonicalShopRecord]) -> PersistenceReport {
        let mut report = PersistenceReport::empty();

        let mut seen_names = HashSet::new();
        let mut shop_rows = Vec::with_capacity(records.len());
        for record in records {
            if seen_names.insert(record.name.as_str()) {
                shop_rows.push(ShopRow::from_canonical(record));
            } else {
                report.collapsed_duplicates += 1;
                warn!(shop = %record.name, "duplicate shop name in batch; keeping the first");
            }
        }
        report.shops_submitted = shop_rows.len();

        if shop_rows.is_empty() {
            info!("no shops to persist");
            return report;
        }

        report.shops = match self.store.upsert_shops(&shop_rows).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, shops = shop_rows.len(), "shop upsert failed");
                report.outcome = PersistOutcome::Failed {
                    phase: PersistPhase::Shops,
                    message: err.to_string(),
                };
                return report;
            }
        };
        info!(
            submitted = report.shops_submitted,
            stored = report.shops.len(),
            "shops upserted"
        );

        let shop_ids: HashMap<&str, Uuid> = report
            .shops
            .iter()
            .map(|shop| (shop.name.as_str(), shop.id))
            .collect();

        let mut course_rows = Vec::new();
        let mut seen_courses: HashSet<(Uuid, String)> = HashSet::new();
        let mut dropped = Vec::new();
        let mut unresolved = Vec::new();
        let mut collapsed = 0usize;
        let mut handled_shops = HashSet::new();
        for record in records {
            // Later duplicates of a name were never submitted.
            if !handled_shops.insert(record.name.as_str()) {
                continue;
            }
            let Some(&shop_id) = shop_ids.get(record.name.as_str()) else {
                warn!(
                    shop = %record.name,
                    courses = record.course_list.len(),
                    "shop missing from upsert result; dropping its courses"
                );
                unresolved.push(record.name.clone());
                dropped.extend(record.course_list.iter().map(|course| DroppedCourse {
                    shop_name: record.name.clone(),
                    title: course.name.clone(),
                    reason: DropReason::UnresolvedShop,
                }));
                continue;
            };

            for course in &record.course_list {
                let row = CourseRow::from_entry(shop_id, course);
                if row.title.trim().is_empty() {
                    dropped.push(DroppedCourse {
                        shop_name: record.name.clone(),
                        title: row.title,
                        reason: DropReason::MissingTitle,
                    });
                    continue;
                }
                if seen_courses.insert((shop_id, row.title.clone())) {
                    course_rows.push(row);
                } else {
                    collapsed += 1;
                }
            }
        }
        report.dropped_courses = dropped;
        report.unresolved_shops = unresolved;
        report.collapsed_duplicates += collapsed;
        report.courses_submitted = course_rows.len();

        if course_rows.is_empty() {
            return report;
        }

        match self.store.upsert_courses(&course_rows).await {
            Ok(rows) => {
                info!(
                    submitted = report.courses_submitted,
                    stored = rows.len(),
                    dropped = report.dropped_courses.len(),
                    "courses upserted"
                );
                report.courses = rows;
            }
            Err(err) => {
                warn!(error = %err, courses = course_rows.len(), "course upsert failed");
                report.outcome = PersistOutcome::PartialFailure {
                    phase: PersistPhase::Courses,
                    message: err.to_string(),
                };
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dsc_core::{CourseEntry, ImageRecord, RawShopDocument};
    use dsc_storage::{MemoryTableStore, StoreError};

    fn record(name: &str, courses: &[(&str, Option<i64>)]) -> CanonicalShopRecord {
        let mut record = CanonicalShopRecord::from_template(name, &RawShopDocument::default());
        record.course_list = courses
            .iter()
            .map(|(title, price)| CourseEntry::new(*title, *price, None))
            .collect();
        record
    }

    /// Delegates to the memory store but can refuse a shop or fail either upsert.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryTableStore,
        refuse_shop: Option<&'static str>,
        fail_shops: bool,
        fail_courses: bool,
    }

    #[async_trait]
    impl TableStore for FlakyStore {
        async fn upsert_shops(&self, rows: &[ShopRow]) -> Result<Vec<PersistedShop>, StoreError> {
            if self.fail_shops {
                return Err(StoreError::Backend("shop table offline".into()));
            }
            let kept: Vec<_> = rows
                .iter()
                .filter(|r| Some(r.name.as_str()) != self.refuse_shop)
                .cloned()
                .collect();
            self.inner.upsert_shops(&kept).await
        }

        async fn upsert_courses(
            &self,
            rows: &[CourseRow],
        ) -> Result<Vec<PersistedCourse>, StoreError> {
            if self.fail_courses {
                return Err(StoreError::Backend("course table offline".into()));
            }
            self.inner.upsert_courses(rows).await
        }

        async fn find_image(
            &self,
            shop_id: Uuid,
            original_url: &str,
        ) -> Result<Option<ImageRecord>, StoreError> {
            self.inner.find_image(shop_id, original_url).await
        }

        async fn insert_image(&self, record: &ImageRecord) -> Result<bool, StoreError> {
            self.inner.insert_image(record).await
        }
    }

    #[tokio::test]
    async fn repeated_persist_converges() {
        let store = Arc::new(MemoryTableStore::new());
        let coordinator = UpsertCoordinator::new(store.clone());
        let records = vec![
            record("Blue Ocean Okinawa", &[("OWD", Some(39800)), ("AOW", Some(49800))]),
            record("Reef", &[("OWD", None)]),
        ];

        let first = coordinator.persist(&records).await;
        let second = coordinator.persist(&records).await;
        assert!(first.outcome.is_completed());
        assert!(second.outcome.is_completed());

        let shops = store.shops().await;
        let courses = store.courses().await;
        assert_eq!(shops.len(), 2);
        assert_eq!(courses.len(), 3);
        assert_eq!(
            first.shops.iter().map(|s| s.id).collect::<Vec<_>>(),
            second.shops.iter().map(|s| s.id).collect::<Vec<_>>()
        );
        let reef = shops.iter().find(|s| s.name == "Reef").expect("reef");
        let reef_owd = courses
            .iter()
            .find(|c| c.shop_id == reef.id)
            .expect("reef course");
        assert_eq!(reef_owd.price, 0);
        assert_eq!(reef_owd.level, dsc_core::UNKNOWN_LEVEL);
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let store = Arc::new(MemoryTableStore::new());
        let report = UpsertCoordinator::new(store.clone()).persist(&[]).await;
        assert!(report.outcome.is_completed());
        assert!(report.shops.is_empty());
        assert!(store.shops().await.is_empty());
    }

    #[tokio::test]
    async fn courses_of_a_refused_shop_are_dropped_and_reported() {
        let store = Arc::new(FlakyStore {
            inner: MemoryTableStore::new(),
            refuse_shop: Some("Ghost"),
            ..Default::default()
        });
        let records = vec![
            record("Reef", &[("OWD", Some(1))]),
            record("Ghost", &[("OWD", Some(2)), ("Night", Some(3))]),
        ];

        let report = UpsertCoordinator::new(store.clone()).persist(&records).await;
        assert!(report.outcome.is_completed());
        assert_eq!(report.unresolved_shops, ["Ghost"]);
        assert_eq!(report.dropped_courses.len(), 2);
        assert!(report
            .dropped_courses
            .iter()
            .all(|d| d.reason == DropReason::UnresolvedShop));

        let reef_id = report.shops[0].id;
        let courses = store.inner.courses().await;
        assert_eq!(courses.len(), 1);
        assert!(courses.iter().all(|c| c.shop_id == reef_id));
    }

    #[tokio::test]
    async fn failing_course_phase_reports_partial_failure() {
        let store = Arc::new(FlakyStore {
            inner: MemoryTableStore::new(),
            fail_courses: true,
            ..Default::default()
        });
        let report = UpsertCoordinator::new(store.clone())
            .persist(&[record("Reef", &[("OWD", Some(1))])])
            .await;

        assert!(matches!(
            report.outcome,
            PersistOutcome::PartialFailure {
                phase: PersistPhase::Courses,
                ..
            }
        ));
        assert_eq!(store.inner.shops().await.len(), 1);
        assert!(store.inner.courses().await.is_empty());
    }

    #[tokio::test]
    async fn duplicates_and_blank_titles_are_collapsed_before_upsert() {
        let store = Arc::new(MemoryTableStore::new());
        let records = vec![
            record("Reef", &[("OWD", Some(1)), ("  ", Some(5)), ("OWD", Some(2))]),
            record("Reef", &[("Deep", Some(3))]),
        ];

        let report = UpsertCoordinator::new(store.clone()).persist(&records).await;
        assert_eq!(report.shops_submitted, 1);
        assert_eq!(report.courses_submitted, 1);
        assert_eq!(report.collapsed_duplicates, 2);
        assert_eq!(report.dropped_courses[0].reason, DropReason::MissingTitle);
        assert_eq!(store.courses().await[0].price, 1);
    }

    #[tokio::test]
    async fn failing_shop_phase_is_a_total_failure() {
        let store = Arc::new(FlakyStore {
            fail_shops: true,
            ..Default::default()
        });
        let report = UpsertCoordinator::new(store.clone())
            .persist(&[record("Reef", &[("OWD", Some(1))])])
            .await;

        match &report.outcome {
            PersistOutcome::Failed { phase, message } => {
                assert_eq!(*phase, PersistPhase::Shops);
                assert!(message.contains("shop table offline"), "{message}");
            }
            other => panic!("expected total failure, got {other:?}"),
        }
        assert!(!report.outcome.is_completed());
        assert_eq!(report.shops_submitted, 1);
        assert!(report.shops.is_empty());
        assert_eq!(report.courses_submitted, 0);
        assert!(store.inner.shops().await.is_empty());
        assert!(store.inner.courses().await.is_empty());
    }
}
