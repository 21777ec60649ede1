//! Object store client contract.
//!
//! The resolver and scheduler only ever talk to storage through
//! [`ObjectStore`]. Each download worker opens its own session through a
//! [`StoreConnector`], since store clients are not assumed to be safe for
//! reuse across workers.

pub mod memory;
pub mod s3;

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;

/// Delimiter separating "directory" levels in remote keys.
pub const DELIMITER: &str = "/";

/// A listed remote object. Read-only once returned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    /// Full key path
    pub key: String,

    /// Last-modified timestamp reported by the store
    pub last_modified: DateTime<Utc>,

    /// Size in bytes
    pub size: u64,
}

/// Result of a listing call.
///
/// With a delimiter, `objects` holds only direct children and `prefixes`
/// holds the child "directories" (each ending in the delimiter).
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub objects: Vec<RemoteObject>,
    pub prefixes: Vec<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List keys under `prefix`, optionally grouped by `delimiter`.
    async fn list(&self, prefix: &str, delimiter: Option<&str>) -> Result<Listing>;

    /// Fetch object attributes. Missing keys yield `RestoreError::NotFound`.
    async fn get_object(&self, key: &str) -> Result<RemoteObject>;

    /// Fetch the full object body.
    async fn get_content(&self, key: &str) -> Result<Vec<u8>>;

    /// Fetch user metadata attached to the object.
    async fn get_metadata(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Write the object body to `path`, returning the number of bytes written.
    async fn download_to_file(&self, key: &str, path: &Path) -> Result<u64>;
}

/// Opens independent store sessions.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ObjectStore>>;
}

/// Join a prefix and a relative name with exactly one delimiter.
pub fn join_key(prefix: &str, name: &str) -> String {
    format!(
        "{}{}{}",
        prefix.trim_end_matches(DELIMITER),
        DELIMITER,
        name.trim_start_matches(DELIMITER)
    )
}

/// Prefix with a trailing delimiter, as expected by listing calls.
pub fn dir_prefix(prefix: &str) -> String {
    format!("{}{}", prefix.trim_end_matches(DELIMITER), DELIMITER)
}

/// Last path component of a key.
pub fn base_name(key: &str) -> &str {
    key.rsplit(DELIMITER).next().unwrap_or(key)
}

/// Number of delimiter-separated levels in a key.
pub fn key_depth(key: &str) -> usize {
    key.matches(DELIMITER).count()
}
