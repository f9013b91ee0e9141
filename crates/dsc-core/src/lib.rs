//! Core domain model for the dive shop catalog: raw scrapes, canonical records,
//! and the rows persisted into the table store.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod lenient;

pub const CRATE_NAME: &str = "dsc-core";

/// Level assigned to persisted courses that arrive without one.
pub const UNKNOWN_LEVEL: &str = "unknown";

/// One course offered by a shop. `name` is the dedup key within a shop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseEntry {
    pub name: String,
    #[serde(default, deserialize_with = "lenient::opt_int")]
    pub price: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_text")]
    pub level: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_int",
        skip_serializing_if = "Option::is_none"
    )]
    pub min_days: Option<i64>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub description: Option<String>,
}

impl CourseEntry {
    pub fn new(name: impl Into<String>, price: Option<i64>, level: Option<&str>) -> Self {
        Self {
            name: name.into(),
            price,
            level: level.map(str::to_string),
            min_days: None,
            description: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub text: String,
}

/// Review/rating lookup result merged into a document before reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ReviewSummary {
    #[serde(default, deserialize_with = "lenient::review_list")]
    pub reviews: Vec<Review>,
    #[serde(default, deserialize_with = "lenient::opt_float")]
    pub rating: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_int")]
    pub review_count: Option<i64>,
}

/// One extraction result for one shop page. Immutable pipeline input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RawShopDocument {
    #[serde(default, deserialize_with = "lenient::opt_text")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_text")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_text")]
    pub location: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_text")]
    pub prefecture: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_text")]
    pub city: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_text")]
    pub address: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_text")]
    pub phone: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_text")]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_text")]
    pub website: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_text")]
    pub image_url: Option<String>,
    #[serde(default, deserialize_with = "lenient::string_list")]
    pub site_images: Vec<String>,
    #[serde(default, deserialize_with = "lenient::opt_float")]
    pub rating: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_int")]
    pub review_count: Option<i64>,
    #[serde(default, deserialize_with = "lenient::review_list")]
    pub reviews: Vec<Review>,
    #[serde(default, deserialize_with = "lenient::course_list")]
    pub course_list: Vec<CourseEntry>,
}

impl RawShopDocument {
    /// Overlay a review lookup; present values replace the scraped ones.
    pub fn apply_reviews(&mut self, summary: ReviewSummary) {
        self.reviews = summary.reviews;
        if summary.rating.is_some() {
            self.rating = summary.rating;
        }
        if summary.review_count.is_some() {
            self.review_count = summary.review_count;
        }
    }
}

/// The merged representation of every raw document sharing one `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalShopRecord {
    pub name: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub prefecture: Option<String>,
    pub city: Option<String>,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub website: Option<String>,
    pub image_url: Option<String>,
    pub site_images: Vec<String>,
    pub rating: Option<f64>,
    pub review_count: Option<i64>,
    pub course_list: Vec<CourseEntry>,
}

impl CanonicalShopRecord {
    /// Copy the scalar attributes of `template`; the course list starts empty.
    pub fn from_template(name: impl Into<String>, template: &RawShopDocument) -> Self {
        Self {
            name: name.into(),
            description: template.description.clone(),
            location: template.location.clone(),
            prefecture: template.prefecture.clone(),
            city: template.city.clone(),
            address: template.address.clone(),
            phone: template.phone.clone(),
            email: template.email.clone(),
            website: template.website.clone(),
            image_url: template.image_url.clone(),
            site_images: template.site_images.clone(),
            rating: template.rating,
            review_count: template.review_count,
            course_list: Vec::new(),
        }
    }
}

/// Shop row as written to the table store, conflict key `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShopRow {
    pub name: String,
    pub description: String,
    pub location: String,
    pub prefecture: String,
    pub city: String,
    pub address: String,
    pub phone: String,
    pub email: String,
    pub website: String,
    pub image_url: String,
    pub site_images: Vec<String>,
    pub rating: f64,
    pub review_count: i64,
}

impl ShopRow {
    /// Project a canonical record onto the shop schema, defaulting absent scalars.
    pub fn from_canonical(record: &CanonicalShopRecord) -> Self {
        let text = |v: &Option<String>| v.clone().unwrap_or_default();
        Self {
            name: record.name.clone(),
            description: text(&record.description),
            location: text(&record.location),
            prefecture: text(&record.prefecture),
            city: text(&record.city),
            address: text(&record.address),
            phone: text(&record.phone),
            email: text(&record.email),
            website: text(&record.website),
            image_url: text(&record.image_url),
            site_images: record.site_images.clone(),
            rating: record.rating.filter(|r| r.is_finite()).unwrap_or(0.0),
            review_count: record.review_count.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedShop {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub location: String,
    pub prefecture: String,
    pub city: String,
    pub address: String,
    pub phone: String,
    pub email: String,
    pub website: String,
    pub image_url: String,
    pub site_images: Vec<String>,
    pub rating: f64,
    pub review_count: i64,
}

impl PersistedShop {
    pub fn from_row(id: Uuid, row: ShopRow) -> Self {
        Self {
            id,
            name: row.name,
            description: row.description,
            location: row.location,
            prefecture: row.prefecture,
            city: row.city,
            address: row.address,
            phone: row.phone,
            email: row.email,
            website: row.website,
            image_url: row.image_url,
            site_images: row.site_images,
            rating: row.rating,
            review_count: row.review_count,
        }
    }
}

/// Course row as written to the table store, conflict key `(shop_id, title)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseRow {
    pub shop_id: Uuid,
    pub title: String,
    pub price: i64,
    pub level: String,
    pub min_days: Option<i64>,
    pub description: Option<String>,
}

impl CourseRow {
    /// Re-key a course against its persisted shop. `name` becomes `title`.
    pub fn from_entry(shop_id: Uuid, entry: &CourseEntry) -> Self {
        Self {
            shop_id,
            title: entry.name.clone(),
            price: entry.price.unwrap_or(0),
            level: entry
                .level
                .clone()
                .unwrap_or_else(|| UNKNOWN_LEVEL.to_string()),
            min_days: entry.min_days,
            description: entry.description.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedCourse {
    pub id: Uuid,
    pub shop_id: Uuid,
    pub title: String,
    pub price: i64,
    pub level: String,
    pub min_days: Option<i64>,
    pub description: Option<String>,
}

impl PersistedCourse {
    pub fn from_row(id: Uuid, row: CourseRow) -> Self {
        Self {
            id,
            shop_id: row.shop_id,
            title: row.title,
            price: row.price,
            level: row.level,
            min_days: row.min_days,
            description: row.description,
        }
    }
}

/// Index entry for an ingested image, unique on `(shop_id, original_url)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub shop_id: Uuid,
    pub original_url: String,
    pub storage_path: String,
    pub public_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
    Thumbnail,
    Gallery,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn raw_document_tolerates_odd_shapes() {
        let doc: RawShopDocument = serde_json::from_value(json!({
            "name": "Blue Ocean Okinawa",
            "description": "",
            "phone": 981234567,
            "site_images": "http://x/a.jpg",
            "rating": "4.6",
            "review_count": 120.0,
            "course_list": "none"
        }))
        .expect("lenient parse");

        assert_eq!(doc.name.as_deref(), Some("Blue Ocean Okinawa"));
        assert_eq!(doc.description, None);
        assert_eq!(doc.phone.as_deref(), Some("981234567"));
        assert!(doc.site_images.is_empty());
        assert_eq!(doc.rating, Some(4.6));
        assert_eq!(doc.review_count, Some(120));
        assert!(doc.course_list.is_empty());
    }

    #[test]
    fn shop_row_defaults_missing_scalars() {
        let doc = RawShopDocument {
            name: Some("Reef".into()),
            city: Some("Naha".into()),
            ..Default::default()
        };
        let record = CanonicalShopRecord::from_template("Reef", &doc);
        let row = ShopRow::from_canonical(&record);
        assert_eq!(row.city, "Naha");
        assert_eq!(row.description, "");
        assert_eq!(row.image_url, "");
        assert_eq!(row.rating, 0.0);
        assert_eq!(row.review_count, 0);
    }

    #[test]
    fn course_row_renames_and_defaults() {
        let shop_id = Uuid::new_v4();
        let row = CourseRow::from_entry(shop_id, &CourseEntry::new("OWD", None, None));
        assert_eq!(row.title, "OWD");
        assert_eq!(row.price, 0);
        assert_eq!(row.level, UNKNOWN_LEVEL);
        assert_eq!(row.min_days, None);
    }

    #[test]
    fn review_overlay_keeps_scraped_rating_when_lookup_has_none() {
        let mut doc = RawShopDocument {
            rating: Some(4.1),
            ..Default::default()
        };
        doc.apply_reviews(ReviewSummary {
            reviews: vec![Review {
                author: "a".into(),
                text: "great".into(),
            }],
            rating: None,
            review_count: Some(8),
        });
        assert_eq!(doc.rating, Some(4.1));
        assert_eq!(doc.review_count, Some(8));
        assert_eq!(doc.reviews.len(), 1);
    }
}
