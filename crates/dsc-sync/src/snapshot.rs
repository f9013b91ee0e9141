//! Flat tabular snapshots of canonical records (CSV or Parquet).
//!
//! List-valued fields (`site_images`, `course_list`) are stored as JSON array
//! text inside a single cell. On decode, a cell counts as a list only when its
//! trimmed text is bracketed; anything else decodes to an empty list. Bracketed
//! cells written as Python literals (`[{'name': 'OWD', 'min_days': nan}]`) by
//! older exports are accepted too.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::{Array, ArrayRef, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{ArrowError, DataType, Field as ArrowField, Schema};
use dsc_core::lenient::{courses_from_value, parse_int};
use dsc_core::{CanonicalShopRecord, CourseEntry};
use dsc_storage::sha256_hex;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::errors::ParquetError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("csv snapshot: {0}")]
    Csv(#[from] csv::Error),
    #[error("encoding list cell: {0}")]
    Json(#[from] serde_json::Error),
    #[error("parquet snapshot: {0}")]
    Parquet(#[from] ParquetError),
    #[error("arrow batch: {0}")]
    Arrow(#[from] ArrowError),
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot column {0} is missing or has the wrong type")]
    Column(String),
}

fn io_err<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(std::io::Error) -> SnapshotError + 'a {
    move |source| SnapshotError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFormat {
    Csv,
    Parquet,
}

impl SnapshotFormat {
    /// `.parquet` selects Parquet; everything else is CSV.
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("parquet") => Self::Parquet,
            _ => Self::Csv,
        }
    }
}

fn looks_like_list(cell: &str) -> bool {
    let t = cell.trim();
    t.starts_with('[') && t.ends_with(']')
}

fn parse_list_cell(cell: &str) -> Option<JsonValue> {
    if !looks_like_list(cell) {
        return None;
    }
    let cell = cell.trim();
    let err = match serde_json::from_str(cell) {
        Ok(value) => return Some(value),
        Err(err) => err,
    };
    let literal = python_literal_to_json(cell).and_then(|t| serde_json::from_str(&t).ok());
    if literal.is_some() {
        return literal;
    }
    warn!(error = %err, "unparsable list cell decoded as empty");
    None
}

/// Rewrites a Python `repr` of lists, dicts, strings and numbers as JSON text.
/// `None`, `nan` and `inf` become `null`. Returns `None` on any other bare word.
fn python_literal_to_json(text: &str) -> Option<String> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                let mut value = String::new();
                loop {
                    match chars.next()? {
                        '\\' => match chars.next()? {
                            'n' => value.push('\n'),
                            't' => value.push('\t'),
                            'r' => value.push('\r'),
                            other @ ('\\' | '\'' | '"') => value.push(other),
                            other => {
                                value.push('\\');
                                value.push(other);
                            }
                        },
                        q if q == c => break,
                        other => value.push(other),
                    }
                }
                out.push_str(&serde_json::to_string(&value).ok()?);
            }
            // Exponents (`1e5`) stay with their number.
            c if c.is_ascii_alphabetic() && !out.ends_with(|p: char| p.is_ascii_digit()) => {
                let mut word = String::from(c);
                while let Some(&next) = chars.peek() {
                    if !next.is_ascii_alphanumeric() && next != '_' {
                        break;
                    }
                    word.push(next);
                    chars.next();
                }
                out.push_str(match word.as_str() {
                    "None" | "nan" | "NaN" | "inf" => "null",
                    "True" => "true",
                    "False" => "false",
                    _ => return None,
                });
            }
            other => out.push(other),
        }
    }
    Some(out)
}

pub fn encode_list_cell<T: Serialize>(items: &[T]) -> Result<String, SnapshotError> {
    Ok(serde_json::to_string(items)?)
}

pub fn decode_course_cell(cell: &str) -> Vec<CourseEntry> {
    parse_list_cell(cell)
        .map(courses_from_value)
        .unwrap_or_default()
}

pub fn decode_string_list_cell(cell: &str) -> Vec<String> {
    match parse_list_cell(cell) {
        Some(JsonValue::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                JsonValue::String(s) => Some(s),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// One CSV line. Every column is optional on read so older or hand-edited
/// files still load.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CsvRow {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    prefecture: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    website: Option<String>,
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default)]
    site_images: String,
    #[serde(default)]
    rating: Option<String>,
    #[serde(default)]
    review_count: Option<String>,
    #[serde(default)]
    course_list: String,
}

impl CsvRow {
    fn from_record(record: &CanonicalShopRecord) -> Result<Self, SnapshotError> {
        Ok(Self {
            name: record.name.clone(),
            description: record.description.clone(),
            location: record.location.clone(),
            prefecture: record.prefecture.clone(),
            city: record.city.clone(),
            address: record.address.clone(),
            phone: record.phone.clone(),
            email: record.email.clone(),
            website: record.website.clone(),
            image_url: record.image_url.clone(),
            site_images: encode_list_cell(&record.site_images)?,
            rating: record.rating.map(|r| r.to_string()),
            review_count: record.review_count.map(|c| c.to_string()),
            course_list: encode_list_cell(&record.course_list)?,
        })
    }

    fn into_record(self) -> CanonicalShopRecord {
        let text = |v: Option<String>| v.filter(|s| !s.is_empty());
        CanonicalShopRecord {
            name: self.name,
            description: text(self.description),
            location: text(self.location),
            prefecture: text(self.prefecture),
            city: text(self.city),
            address: text(self.address),
            phone: text(self.phone),
            email: text(self.email),
            website: text(self.website),
            image_url: text(self.image_url),
            site_images: decode_string_list_cell(&self.site_images),
            rating: self
                .rating
                .as_deref()
                .and_then(|r| r.trim().parse::<f64>().ok()),
            review_count: self.review_count.as_deref().and_then(parse_int),
            course_list: decode_course_cell(&self.course_list),
        }
    }
}

pub fn encode_csv(records: &[CanonicalShopRecord]) -> Result<Vec<u8>, SnapshotError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for record in records {
        writer.serialize(CsvRow::from_record(record)?)?;
    }
    writer
        .into_inner()
        .map_err(|err| SnapshotError::Csv(err.into_error().into()))
}

/// Rows with an empty `name` are skipped.
pub fn decode_csv(bytes: &[u8]) -> Result<Vec<CanonicalShopRecord>, SnapshotError> {
    let mut reader = csv::Reader::from_reader(bytes);
    let mut records = Vec::new();
    for row in reader.deserialize::<CsvRow>() {
        let row = row?;
        if row.name.trim().is_empty() {
            warn!("skipping snapshot row without a shop name");
            continue;
        }
        records.push(row.into_record());
    }
    Ok(records)
}

fn snapshot_schema() -> Schema {
    let text = |name: &str| ArrowField::new(name, DataType::Utf8, true);
    Schema::new(vec![
        ArrowField::new("name", DataType::Utf8, false),
        text("description"),
        text("location"),
        text("prefecture"),
        text("city"),
        text("address"),
        text("phone"),
        text("email"),
        text("website"),
        text("image_url"),
        ArrowField::new("site_images", DataType::Utf8, false),
        ArrowField::new("rating", DataType::Float64, true),
        ArrowField::new("review_count", DataType::Int64, true),
        ArrowField::new("course_list", DataType::Utf8, false),
    ])
}

fn text_column(
    records: &[CanonicalShopRecord],
    get: impl Fn(&CanonicalShopRecord) -> Option<&str>,
) -> ArrayRef {
    Arc::new(StringArray::from(records.iter().map(get).collect::<Vec<_>>()))
}

pub fn encode_record_batch(records: &[CanonicalShopRecord]) -> Result<RecordBatch, SnapshotError> {
    let site_images = records
        .iter()
        .map(|r| encode_list_cell(&r.site_images))
        .collect::<Result<Vec<_>, _>>()?;
    let course_lists = records
        .iter()
        .map(|r| encode_list_cell(&r.course_list))
        .collect::<Result<Vec<_>, _>>()?;

    let columns: Vec<ArrayRef> = vec![
        text_column(records, |r| Some(r.name.as_str())),
        text_column(records, |r| r.description.as_deref()),
        text_column(records, |r| r.location.as_deref()),
        text_column(records, |r| r.prefecture.as_deref()),
        text_column(records, |r| r.city.as_deref()),
        text_column(records, |r| r.address.as_deref()),
        text_column(records, |r| r.phone.as_deref()),
        text_column(records, |r| r.email.as_deref()),
        text_column(records, |r| r.website.as_deref()),
        text_column(records, |r| r.image_url.as_deref()),
        Arc::new(StringArray::from(site_images)),
        Arc::new(Float64Array::from(
            records.iter().map(|r| r.rating).collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(
            records.iter().map(|r| r.review_count).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(course_lists)),
    ];
    Ok(RecordBatch::try_new(Arc::new(snapshot_schema()), columns)?)
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray, SnapshotError> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| SnapshotError::Column(name.to_string()))
}

fn opt_text(col: &StringArray, i: usize) -> Option<String> {
    if col.is_null(i) {
        None
    } else {
        Some(col.value(i).to_string()).filter(|s| !s.is_empty())
    }
}

pub fn decode_record_batch(batch: &RecordBatch) -> Result<Vec<CanonicalShopRecord>, SnapshotError> {
    let name = string_column(batch, "name")?;
    let description = string_column(batch, "description")?;
    let location = string_column(batch, "location")?;
    let prefecture = string_column(batch, "prefecture")?;
    let city = string_column(batch, "city")?;
    let address = string_column(batch, "address")?;
    let phone = string_column(batch, "phone")?;
    let email = string_column(batch, "email")?;
    let website = string_column(batch, "website")?;
    let image_url = string_column(batch, "image_url")?;
    let site_images = string_column(batch, "site_images")?;
    let course_list = string_column(batch, "course_list")?;
    let rating = batch
        .column_by_name("rating")
        .and_then(|c| c.as_any().downcast_ref::<Float64Array>())
        .ok_or_else(|| SnapshotError::Column("rating".to_string()))?;
    let review_count = batch
        .column_by_name("review_count")
        .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
        .ok_or_else(|| SnapshotError::Column("review_count".to_string()))?;

    let mut records = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let Some(shop_name) = opt_text(name, i) else {
            warn!(row = i, "skipping snapshot row without a shop name");
            continue;
        };
        records.push(CanonicalShopRecord {
            name: shop_name,
            description: opt_text(description, i),
            location: opt_text(location, i),
            prefecture: opt_text(prefecture, i),
            city: opt_text(city, i),
            address: opt_text(address, i),
            phone: opt_text(phone, i),
            email: opt_text(email, i),
            website: opt_text(website, i),
            image_url: opt_text(image_url, i),
            site_images: opt_text(site_images, i)
                .map(|cell| decode_string_list_cell(&cell))
                .unwrap_or_default(),
            rating: (!rating.is_null(i)).then(|| rating.value(i)),
            review_count: (!review_count.is_null(i)).then(|| review_count.value(i)),
            course_list: opt_text(course_list, i)
                .map(|cell| decode_course_cell(&cell))
                .unwrap_or_default(),
        });
    }
    Ok(records)
}

fn ensure_parent(path: &Path) -> Result<(), SnapshotError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err("creating", parent))?;
    }
    Ok(())
}

pub fn write_snapshot(path: &Path, records: &[CanonicalShopRecord]) -> Result<(), SnapshotError> {
    ensure_parent(path)?;
    match SnapshotFormat::for_path(path) {
        SnapshotFormat::Csv => {
            let bytes = encode_csv(records)?;
            std::fs::write(path, bytes).map_err(io_err("writing", path))?;
        }
        SnapshotFormat::Parquet => {
            let batch = encode_record_batch(records)?;
            let file = File::create(path).map_err(io_err("creating", path))?;
            let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
            writer.write(&batch)?;
            writer.close()?;
        }
    }
    info!(path = %path.display(), records = records.len(), "snapshot written");
    Ok(())
}

pub fn read_snapshot(path: &Path) -> Result<Vec<CanonicalShopRecord>, SnapshotError> {
    let records = match SnapshotFormat::for_path(path) {
        SnapshotFormat::Csv => {
            let bytes = std::fs::read(path).map_err(io_err("reading", path))?;
            decode_csv(&bytes)?
        }
        SnapshotFormat::Parquet => {
            let file = File::open(path).map_err(io_err("opening", path))?;
            let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
            let mut records = Vec::new();
            for batch in reader {
                records.extend(decode_record_batch(&batch?)?);
            }
            records
        }
    };
    info!(path = %path.display(), records = records.len(), "snapshot loaded");
    Ok(records)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub record_count: usize,
    pub file: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Sibling manifest path: `merged_shops.csv` -> `merged_shops.csv.manifest.json`.
pub fn manifest_path_for(snapshot: &Path) -> PathBuf {
    let mut name = snapshot.file_name().unwrap_or_default().to_os_string();
    name.push(".manifest.json");
    snapshot.with_file_name(name)
}

pub fn write_snapshot_manifest(
    snapshot: &Path,
    record_count: usize,
) -> Result<SnapshotManifest, SnapshotError> {
    let bytes = std::fs::read(snapshot).map_err(io_err("reading", snapshot))?;
    let manifest = SnapshotManifest {
        schema_version: SNAPSHOT_SCHEMA_VERSION,
        record_count,
        file: snapshot
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    };
    let path = manifest_path_for(snapshot);
    let text = serde_json::to_vec_pretty(&manifest)?;
    std::fs::write(&path, text).map_err(io_err("writing", &path))?;
    Ok(manifest)
}
