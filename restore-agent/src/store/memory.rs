//! In-process object store.
//!
//! Keeps objects in a shared ordered map so that every connected session sees
//! the same bucket. Used by the test suite and for dry runs against fixtures;
//! download failures can be injected per key.

use super::{Listing, ObjectStore, RemoteObject, StoreConnector};
use crate::utils::errors::{RestoreError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone)]
struct StoredObject {
    body: Bytes,
    last_modified: DateTime<Utc>,
    metadata: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct Bucket {
    objects: BTreeMap<String, StoredObject>,
    /// Remaining injected download failures per key
    failures: HashMap<String, usize>,
    /// Download attempts per key, failed ones included
    downloads: HashMap<String, usize>,
}

/// Shared in-memory bucket. Cloning yields another handle to the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    bucket: Arc<Mutex<Bucket>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket(&self) -> MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an object, replacing any previous one under the same key.
    pub fn put(&self, key: &str, body: impl Into<Bytes>, last_modified: DateTime<Utc>) {
        self.put_with_metadata(key, body, last_modified, HashMap::new());
    }

    pub fn put_with_metadata(
        &self,
        key: &str,
        body: impl Into<Bytes>,
        last_modified: DateTime<Utc>,
        metadata: HashMap<String, String>,
    ) {
        self.bucket().objects.insert(
            key.to_string(),
            StoredObject {
                body: body.into(),
                last_modified,
                metadata,
            },
        );
    }

    /// Make the next `times` downloads of `key` fail. `usize::MAX` fails forever.
    pub fn fail_downloads(&self, key: &str, times: usize) {
        self.bucket().failures.insert(key.to_string(), times);
    }

    /// Download attempts made for `key` so far.
    pub fn download_attempts(&self, key: &str) -> usize {
        self.bucket().downloads.get(key).copied().unwrap_or(0)
    }

    /// Download attempts made across all keys.
    pub fn total_download_attempts(&self) -> usize {
        self.bucket().downloads.values().sum()
    }

    fn describe(key: &str, object: &StoredObject) -> RemoteObject {
        RemoteObject {
            key: key.to_string(),
            last_modified: object.last_modified,
            size: object.body.len() as u64,
        }
    }

    fn lookup(&self, key: &str) -> Result<StoredObject> {
        self.bucket()
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| RestoreError::NotFound(key.to_string()))
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list(&self, prefix: &str, delimiter: Option<&str>) -> Result<Listing> {
        let bucket = self.bucket();
        let mut listing = Listing::default();
        let mut prefixes = BTreeSet::new();

        for (key, object) in bucket.objects.range(prefix.to_string()..) {
            let Some(rest) = key.strip_prefix(prefix) else {
                break;
            };
            match delimiter.and_then(|d| rest.find(d).map(|idx| idx + d.len())) {
                Some(end) => {
                    prefixes.insert(format!("{}{}", prefix, &rest[..end]));
                }
                None => listing.objects.push(Self::describe(key, object)),
            }
        }

        listing.prefixes = prefixes.into_iter().collect();
        Ok(listing)
    }

    async fn get_object(&self, key: &str) -> Result<RemoteObject> {
        let object = self.lookup(key)?;
        Ok(Self::describe(key, &object))
    }

    async fn get_content(&self, key: &str) -> Result<Vec<u8>> {
        Ok(self.lookup(key)?.body.to_vec())
    }

    async fn get_metadata(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.lookup(key)?.metadata)
    }

    async fn download_to_file(&self, key: &str, path: &Path) -> Result<u64> {
        let body = {
            let mut bucket = self.bucket();
            *bucket.downloads.entry(key.to_string()).or_insert(0) += 1;

            if let Some(remaining) = bucket.failures.get_mut(key) {
                if *remaining > 0 {
                    if *remaining != usize::MAX {
                        *remaining -= 1;
                    }
                    return Err(RestoreError::Store(format!("injected failure for {}", key)));
                }
            }

            bucket
                .objects
                .get(key)
                .map(|o| o.body.clone())
                .ok_or_else(|| RestoreError::NotFound(key.to_string()))?
        };

        tokio::fs::write(path, &body).await?;
        Ok(body.len() as u64)
    }
}

#[async_trait]
impl StoreConnector for MemoryStore {
    async fn connect(&self) -> Result<Box<dyn ObjectStore>> {
        Ok(Box::new(self.clone()))
    }
}
