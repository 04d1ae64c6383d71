//! FaceFindr storage: event buckets on disk and the SQLite photo catalog.

pub mod bucket;
pub mod catalog;

pub use bucket::BucketStore;
pub use catalog::{event_bucket, Event, Photo, PhotoCatalog, PhotoLocation};

use facefindr_core::provider::{is_image_name, CandidateSource, ProviderError};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid name: {0:?}")]
    InvalidName(String),
    #[error("bucket not found: {0}")]
    BucketNotFound(String),
    #[error("object not found: {0}")]
    ObjectNotFound(String),
    #[error("event not found: {0}")]
    EventNotFound(i64),
    #[error("photo not found: {0}")]
    PhotoNotFound(i64),
}

/// Candidates for a catalog event: photo ids from the catalog, bytes from the
/// bucket store at the cataloged location.
#[derive(Clone)]
pub struct CatalogSource {
    catalog: Arc<PhotoCatalog>,
    buckets: Arc<BucketStore>,
}

impl CatalogSource {
    pub fn new(catalog: Arc<PhotoCatalog>, buckets: Arc<BucketStore>) -> Self {
        Self { catalog, buckets }
    }
}

fn parse_id(raw: &str) -> Option<i64> {
    raw.trim().parse().ok()
}

impl CandidateSource for CatalogSource {
    fn list(&self, event: &str) -> Result<Vec<String>, ProviderError> {
        let event_id = parse_id(event).ok_or_else(|| ProviderError::EventNotFound(event.to_string()))?;
        self.catalog.event(event_id)?;
        let ids = self
            .catalog
            .photos_for_event(event_id)?
            .into_iter()
            .filter(|p| is_image_name(&p.object_key))
            .map(|p| p.id.to_string())
            .collect();
        Ok(ids)
    }

    fn fetch(&self, event: &str, id: &str) -> Result<Vec<u8>, ProviderError> {
        let photo_id = parse_id(id).ok_or_else(|| ProviderError::ObjectNotFound(id.to_string()))?;
        let location = self.catalog.resolve(photo_id)?;
        if parse_id(event) != Some(location.event_id) {
            return Err(ProviderError::ObjectNotFound(format!("photo {photo_id} is not in event {event}")));
        }
        Ok(self.buckets.get(&location.bucket, &location.object_key)?)
    }
}

/// Store a new photo for `event_id` under a fresh object key and catalog it.
/// `extension` is the file extension without the dot.
pub fn ingest_photo(
    catalog: &PhotoCatalog,
    buckets: &BucketStore,
    event_id: i64,
    bytes: &[u8],
    extension: &str,
) -> Result<Photo, StoreError> {
    let event = catalog.event(event_id)?;
    let extension = extension.trim_start_matches('.').to_ascii_lowercase();
    let object_key = format!("{}.{extension}", uuid::Uuid::new_v4());

    let bucket = event.bucket();
    buckets.create_bucket(&bucket)?;
    buckets.put(&bucket, &object_key, bytes)?;
    catalog.add_photo(event_id, &object_key)
}
