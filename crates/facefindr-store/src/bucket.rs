//! Directory-backed object store. Each bucket is one sub-directory of the
//! store root and holds one event's photos.

use crate::StoreError;
use facefindr_core::provider::{is_image_name, CandidateSource, ProviderError};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub struct BucketStore {
    root: PathBuf,
}

/// Bucket and object names are single path components.
fn validate_name(name: &str) -> Result<(), StoreError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

impl BucketStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        tracing::debug!(root = %root.display(), "opened bucket store");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf, StoreError> {
        validate_name(bucket)?;
        Ok(self.root.join(bucket))
    }

    fn object_path(&self, bucket: &str, object: &str) -> Result<PathBuf, StoreError> {
        validate_name(object)?;
        Ok(self.bucket_dir(bucket)?.join(object))
    }

    pub fn bucket_exists(&self, bucket: &str) -> Result<bool, StoreError> {
        Ok(self.bucket_dir(bucket)?.is_dir())
    }

    /// Create a bucket. Creating an existing bucket is not an error.
    pub fn create_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        let dir = self.bucket_dir(bucket)?;
        if dir.is_dir() {
            tracing::info!(bucket, "bucket already exists");
        } else {
            fs::create_dir_all(&dir)?;
            tracing::info!(bucket, "bucket created");
        }
        Ok(())
    }

    /// Store `bytes` as `bucket/object`, replacing any previous object.
    pub fn put(&self, bucket: &str, object: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.object_path(bucket, object)?;
        if !self.bucket_exists(bucket)? {
            return Err(StoreError::BucketNotFound(bucket.to_string()));
        }
        // Write-then-rename so readers never see a partial object.
        let tmp = path.with_file_name(format!(".{object}.partial"));
        if let Err(e) = fs::write(&tmp, bytes).and_then(|()| fs::rename(&tmp, &path)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        tracing::info!(bucket, object, size = bytes.len(), "object stored");
        Ok(())
    }

    /// Object names in a bucket, sorted.
    pub fn list(&self, bucket: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.bucket_dir(bucket)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::BucketNotFound(bucket.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.ends_with(".partial") {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        tracing::debug!(bucket, objects = names.len(), "listed bucket");
        Ok(names)
    }

    pub fn get(&self, bucket: &str, object: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.object_path(bucket, object)?;
        fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => StoreError::ObjectNotFound(format!("{bucket}/{object}")),
            _ => StoreError::Io(e),
        })
    }
}

impl From<StoreError> for ProviderError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::BucketNotFound(b) => ProviderError::EventNotFound(b),
            StoreError::EventNotFound(id) => ProviderError::EventNotFound(id.to_string()),
            StoreError::ObjectNotFound(o) => ProviderError::ObjectNotFound(o),
            StoreError::PhotoNotFound(id) => ProviderError::ObjectNotFound(format!("photo {id}")),
            other => ProviderError::Storage(other.to_string()),
        }
    }
}

/// Bucket = event. Only photo objects are offered as candidates.
impl CandidateSource for BucketStore {
    fn list(&self, event: &str) -> Result<Vec<String>, ProviderError> {
        let names = BucketStore::list(self, event)?;
        Ok(names.into_iter().filter(|n| is_image_name(n)).collect())
    }

    fn fetch(&self, event: &str, id: &str) -> Result<Vec<u8>, ProviderError> {
        Ok(self.get(event, id)?)
    }
}
