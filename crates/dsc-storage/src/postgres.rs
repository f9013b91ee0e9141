//! Postgres table store: `ON CONFLICT .. DO UPDATE .. RETURNING` batch upserts.

use async_trait::async_trait;
use dsc_core::{CourseRow, ImageRecord, PersistedCourse, PersistedShop, ShopRow};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::info;
use uuid::Uuid;

use crate::table::{StoreError, TableStore};

/// Postgres caps bind parameters at 65535 per statement.
const ROWS_PER_STATEMENT: usize = 1000;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS diving_shops (
  id            uuid PRIMARY KEY DEFAULT gen_random_uuid(),
  name          text NOT NULL UNIQUE,
  description   text NOT NULL DEFAULT '',
  location      text NOT NULL DEFAULT '',
  prefecture    text NOT NULL DEFAULT '',
  city          text NOT NULL DEFAULT '',
  address       text NOT NULL DEFAULT '',
  phone         text NOT NULL DEFAULT '',
  email         text NOT NULL DEFAULT '',
  website       text NOT NULL DEFAULT '',
  image_url     text NOT NULL DEFAULT '',
  site_images   text[] NOT NULL DEFAULT '{}',
  rating        double precision NOT NULL DEFAULT 0,
  review_count  bigint NOT NULL DEFAULT 0,
  created_at    timestamptz NOT NULL DEFAULT now(),
  updated_at    timestamptz NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS diving_courses (
  id            uuid PRIMARY KEY DEFAULT gen_random_uuid(),
  shop_id       uuid NOT NULL REFERENCES diving_shops (id) ON DELETE CASCADE,
  title         text NOT NULL,
  price         bigint NOT NULL DEFAULT 0,
  level         text NOT NULL DEFAULT 'unknown',
  min_days      bigint,
  description   text,
  created_at    timestamptz NOT NULL DEFAULT now(),
  updated_at    timestamptz NOT NULL DEFAULT now(),
  UNIQUE (shop_id, title)
);
CREATE TABLE IF NOT EXISTS images (
  id            uuid PRIMARY KEY DEFAULT gen_random_uuid(),
  shop_id       uuid NOT NULL REFERENCES diving_shops (id) ON DELETE CASCADE,
  original_url  text NOT NULL,
  storage_path  text NOT NULL,
  public_url    text NOT NULL,
  created_at    timestamptz NOT NULL DEFAULT now(),
  UNIQUE (shop_id, original_url)
);
"#;

const SHOP_COLUMNS: &str = "id, name, description, location, prefecture, city, address, phone, \
                            email, website, image_url, site_images, rating, review_count";
const COURSE_COLUMNS: &str = "id, shop_id, title, price, level, min_days, description";

#[derive(Debug, Clone)]
pub struct PgTableStore {
    pool: PgPool,
}

impl PgTableStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Creates the shop, course and image tables if absent. Safe on every boot.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        info!("table schema ensured");
        Ok(())
    }
}

fn shop_from_row(row: &PgRow) -> Result<PersistedShop, sqlx::Error> {
    Ok(PersistedShop {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        location: row.try_get("location")?,
        prefecture: row.try_get("prefecture")?,
        city: row.try_get("city")?,
        address: row.try_get("address")?,
        phone: row.try_get("phone")?,
        email: row.try_get("email")?,
        website: row.try_get("website")?,
        image_url: row.try_get("image_url")?,
        site_images: row.try_get("site_images")?,
        rating: row.try_get("rating")?,
        review_count: row.try_get("review_count")?,
    })
}

fn course_from_row(row: &PgRow) -> Result<PersistedCourse, sqlx::Error> {
    Ok(PersistedCourse {
        id: row.try_get("id")?,
        shop_id: row.try_get("shop_id")?,
        title: row.try_get("title")?,
        price: row.try_get("price")?,
        level: row.try_get("level")?,
        min_days: row.try_get("min_days")?,
        description: row.try_get("description")?,
    })
}

fn image_from_row(row: &PgRow) -> Result<ImageRecord, sqlx::Error> {
    Ok(ImageRecord {
        shop_id: row.try_get("shop_id")?,
        original_url: row.try_get("original_url")?,
        storage_path: row.try_get("storage_path")?,
        public_url: row.try_get("public_url")?,
    })
}

#[async_trait]
impl TableStore for PgTableStore {
    async fn upsert_shops(&self, rows: &[ShopRow]) -> Result<Vec<PersistedShop>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let mut persisted = Vec::with_capacity(rows.len());
        for chunk in rows.chunks(ROWS_PER_STATEMENT) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO diving_shops (name, description, location, prefecture, city, \
                 address, phone, email, website, image_url, site_images, rating, review_count) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.name.clone())
                    .push_bind(row.description.clone())
                    .push_bind(row.location.clone())
                    .push_bind(row.prefecture.clone())
                    .push_bind(row.city.clone())
                    .push_bind(row.address.clone())
                    .push_bind(row.phone.clone())
                    .push_bind(row.email.clone())
                    .push_bind(row.website.clone())
                    .push_bind(row.image_url.clone())
                    .push_bind(row.site_images.clone())
                    .push_bind(row.rating)
                    .push_bind(row.review_count);
            });
            qb.push(
                " ON CONFLICT (name) DO UPDATE SET \
                 description = EXCLUDED.description, location = EXCLUDED.location, \
                 prefecture = EXCLUDED.prefecture, city = EXCLUDED.city, \
                 address = EXCLUDED.address, phone = EXCLUDED.phone, email = EXCLUDED.email, \
                 website = EXCLUDED.website, image_url = EXCLUDED.image_url, \
                 site_images = EXCLUDED.site_images, rating = EXCLUDED.rating, \
                 review_count = EXCLUDED.review_count, updated_at = now() RETURNING ",
            );
            qb.push(SHOP_COLUMNS);

            let returned = qb.build().fetch_all(&mut *tx).await?;
            for row in &returned {
                persisted.push(shop_from_row(row)?);
            }
        }
        tx.commit().await?;
        Ok(persisted)
    }

    async fn upsert_courses(
        &self,
        rows: &[CourseRow],
    ) -> Result<Vec<PersistedCourse>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let mut persisted = Vec::with_capacity(rows.len());
        for chunk in rows.chunks(ROWS_PER_STATEMENT) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO diving_courses (shop_id, title, price, level, min_days, description) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.shop_id)
                    .push_bind(row.title.clone())
                    .push_bind(row.price)
                    .push_bind(row.level.clone())
                    .push_bind(row.min_days)
                    .push_bind(row.description.clone());
            });
            qb.push(
                " ON CONFLICT (shop_id, title) DO UPDATE SET \
                 price = EXCLUDED.price, level = EXCLUDED.level, \
                 min_days = EXCLUDED.min_days, description = EXCLUDED.description, \
                 updated_at = now() RETURNING ",
            );
            qb.push(COURSE_COLUMNS);

            let returned = qb.build().fetch_all(&mut *tx).await?;
            for row in &returned {
                persisted.push(course_from_row(row)?);
            }
        }
        tx.commit().await?;
        Ok(persisted)
    }

    async fn find_image(
        &self,
        shop_id: Uuid,
        original_url: &str,
    ) -> Result<Option<ImageRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT shop_id, original_url, storage_path, public_url FROM images \
             WHERE shop_id = $1 AND original_url = $2 LIMIT 1",
        )
        .bind(shop_id)
        .bind(original_url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(image_from_row).transpose()?)
    }

    async fn insert_image(&self, record: &ImageRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO images (shop_id, original_url, storage_path, public_url) \
             VALUES ($1, $2, $3, $4) ON CONFLICT (shop_id, original_url) DO NOTHING",
        )
        .bind(record.shop_id)
        .bind(&record.original_url)
        .bind(&record.storage_path)
        .bind(&record.public_url)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
