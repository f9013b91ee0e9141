//! Persistence backends (tables + blobs) and HTTP fetch utilities for the catalog.

pub mod blob;
pub mod fetch;
pub mod memory;
pub mod postgres;
pub mod table;

pub use blob::{
    sha256_hex, BlobError, BlobStore, LocalBlobStore, RemoteBlobConfig, RemoteBlobStore,
    StoredBlob, DEFAULT_BUCKET,
};
pub use fetch::{
    BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, ResourceFetcher,
};
pub use memory::MemoryTableStore;
pub use postgres::PgTableStore;
pub use table::{StoreError, TableStore};

pub const CRATE_NAME: &str = "dsc-storage";
