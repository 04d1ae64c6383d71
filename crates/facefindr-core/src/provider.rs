//! Candidate images for a match scan.
//!
//! A [`CandidateSource`] lists the objects stored for an event and fetches
//! their bytes. [`lazy_candidates`] turns a source into the lazy sequence the
//! matcher consumes, fetching one object at a time.

use std::collections::BTreeMap;
use thiserror::Error;

/// Object name suffixes treated as photos.
pub const IMAGE_EXTENSIONS: [&str; 3] = [".jpg", ".jpeg", ".png"];

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("event not found: {0}")]
    EventNotFound(String),
    #[error("object not found: {0}")]
    ObjectNotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// A fetched candidate image.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: String,
    pub bytes: Vec<u8>,
}

/// A candidate that could not be fetched. Recovered by skipping it.
#[derive(Error, Debug, Clone)]
#[error("failed to fetch candidate {id}: {reason}")]
pub struct CandidateFetchError {
    pub id: String,
    pub reason: String,
}

pub type CandidateResult = Result<Candidate, CandidateFetchError>;

/// Storage the matcher draws candidates from, keyed by event.
pub trait CandidateSource: Send + Sync {
    /// Identifiers of the candidate photos stored for `event`, in a stable
    /// order. Sources backed by raw object listings should keep only names
    /// accepted by [`is_image_name`].
    fn list(&self, event: &str) -> Result<Vec<String>, ProviderError>;

    /// Raw bytes of one object.
    fn fetch(&self, event: &str, id: &str) -> Result<Vec<u8>, ProviderError>;
}

/// True if the object name has a photo extension (case-insensitive).
pub fn is_image_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Lazy candidate sequence over one event.
///
/// Listing happens up front and its failure is returned to the caller;
/// fetches happen as the iterator advances and their failures become
/// `Err` items.
pub struct LazyCandidates<'a, S: CandidateSource + ?Sized> {
    source: &'a S,
    event: String,
    ids: std::vec::IntoIter<String>,
}

impl<'a, S: CandidateSource + ?Sized> Iterator for LazyCandidates<'a, S> {
    type Item = CandidateResult;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.ids.next()?;
        Some(match self.source.fetch(&self.event, &id) {
            Ok(bytes) => Ok(Candidate { id, bytes }),
            Err(e) => {
                tracing::warn!(event = %self.event, id = %id, error = %e, "candidate fetch failed");
                Err(CandidateFetchError {
                    id,
                    reason: e.to_string(),
                })
            }
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.ids.size_hint()
    }
}

/// Build the lazy candidate sequence for `event`.
pub fn lazy_candidates<'a, S: CandidateSource + ?Sized>(
    source: &'a S,
    event: &str,
) -> Result<LazyCandidates<'a, S>, ProviderError> {
    let ids = source.list(event)?;
    tracing::info!(event, candidates = ids.len(), "listed candidates");

    Ok(LazyCandidates {
        source,
        event: event.to_string(),
        ids: ids.into_iter(),
    })
}

/// In-memory candidate source. Photo objects are listed in name order.
#[derive(Debug, Default, Clone)]
pub struct MemorySource {
    events: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, event: &str, id: &str, bytes: Vec<u8>) {
        self.events
            .entry(event.to_string())
            .or_default()
            .insert(id.to_string(), bytes);
    }
}

impl CandidateSource for MemorySource {
    fn list(&self, event: &str) -> Result<Vec<String>, ProviderError> {
        self.events
            .get(event)
            .map(|objects| objects.keys().filter(|k| is_image_name(k)).cloned().collect())
            .ok_or_else(|| ProviderError::EventNotFound(event.to_string()))
    }

    fn fetch(&self, event: &str, id: &str) -> Result<Vec<u8>, ProviderError> {
        self.events
            .get(event)
            .and_then(|objects| objects.get(id))
            .cloned()
            .ok_or_else(|| ProviderError::ObjectNotFound(format!("{event}/{id}")))
    }
}
