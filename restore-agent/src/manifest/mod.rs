//! Manifest types and remote naming conventions.
//!
//! A manifest is a `-listdir.json` object uploaded alongside a table's data
//! files. Its body maps a key (usually the source directory) to the ordered
//! list of filenames that made up that directory when it was listed:
//!
//! ```json
//! { "/var/lib/cassandra/data/ks/tbl": ["mc-1-big-Data.db", "mc-1-big-Index.db"] }
//! ```

pub mod resolver;

use crate::utils::errors::{RestoreError, Result};
use serde_json::{Map, Value};

/// Suffix identifying manifest keys.
pub const MANIFEST_SUFFIX: &str = "-listdir.json";

/// Whether `key` names a manifest.
pub fn is_manifest_key(key: &str) -> bool {
    key.ends_with(MANIFEST_SUFFIX)
}

/// Parsed manifest body, keys kept in document order.
#[derive(Debug, Clone)]
pub struct ManifestBody {
    key: String,
    lists: Map<String, Value>,
}

impl ManifestBody {
    /// Parse the raw body of the manifest stored under `key`.
    pub fn parse(key: &str, body: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| RestoreError::corrupt(key, format!("invalid JSON: {}", e)))?;

        let Value::Object(lists) = value else {
            return Err(RestoreError::corrupt(key, "body is not a JSON object"));
        };

        Ok(Self {
            key: key.to_string(),
            lists,
        })
    }

    /// Fileset of the first list in the body. Additional lists are ignored.
    pub fn first_fileset(&self) -> Result<Vec<String>> {
        let (_, list) = self
            .lists
            .iter()
            .next()
            .ok_or_else(|| RestoreError::corrupt(&self.key, "manifest holds no file list"))?;
        self.to_fileset(list)
    }

    /// Fileset stored under `origin`.
    pub fn fileset_for(&self, origin: &str) -> Result<Vec<String>> {
        let list = self.lists.get(origin).ok_or_else(|| {
            RestoreError::corrupt(&self.key, format!("no file list for origin {}", origin))
        })?;
        self.to_fileset(list)
    }

    fn to_fileset(&self, list: &Value) -> Result<Vec<String>> {
        let entries = list
            .as_array()
            .ok_or_else(|| RestoreError::corrupt(&self.key, "file list is not an array"))?;

        entries
            .iter()
            .map(|entry| {
                entry.as_str().map(str::to_string).ok_or_else(|| {
                    RestoreError::corrupt(&self.key, format!("non-string file entry {}", entry))
                })
            })
            .collect()
    }
}

/// A commit-log segment name, `CommitLog-<version>-<timestamp>.log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CommitLogSegment {
    pub version: u64,
    /// Epoch milliseconds embedded in the name
    pub timestamp_ms: i64,
}

impl CommitLogSegment {
    /// Parse a segment base name. Returns `None` for anything else.
    pub fn parse(name: &str) -> Option<Self> {
        let stem = name.strip_prefix("CommitLog-")?.strip_suffix(".log")?;
        let (version, timestamp) = stem.split_once('-')?;

        if !is_digits(version) || !is_digits(timestamp) {
            return None;
        }

        Some(Self {
            version: version.parse().ok()?,
            timestamp_ms: timestamp.parse().ok()?,
        })
    }
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fileset() {
        let body = br#"{"1": ["mc-1-big-Data.db", "mc-1-big-Index.db"]}"#;
        let manifest = ManifestBody::parse("mc-1-big-Data.db-listdir.json", body).unwrap();
        assert_eq!(
            manifest.first_fileset().unwrap(),
            vec!["mc-1-big-Data.db", "mc-1-big-Index.db"]
        );
    }

    #[test]
    fn test_first_key_in_document_order() {
        let body = br#"{"zzz": ["a"], "aaa": ["b"]}"#;
        let manifest = ManifestBody::parse("m-listdir.json", body).unwrap();
        assert_eq!(manifest.first_fileset().unwrap(), vec!["a"]);
        assert_eq!(manifest.fileset_for("aaa").unwrap(), vec!["b"]);
    }

    #[test]
    fn test_corrupt_bodies() {
        let cases: [&[u8]; 4] = [b"not json", b"[1, 2]", b"{}", br#"{"k": [1]}"#];
        for body in cases {
            let result = ManifestBody::parse("m-listdir.json", body).and_then(|m| m.first_fileset());
            assert!(
                matches!(result, Err(RestoreError::CorruptManifest { .. })),
                "body {:?} should be corrupt",
                String::from_utf8_lossy(body)
            );
        }
    }

    #[test]
    fn test_missing_origin_is_corrupt() {
        let manifest = ManifestBody::parse("m-listdir.json", br#"{"a": []}"#).unwrap();
        assert!(matches!(
            manifest.fileset_for("b"),
            Err(RestoreError::CorruptManifest { .. })
        ));
    }

    #[test]
    fn test_commit_log_segment_parse() {
        assert_eq!(
            CommitLogSegment::parse("CommitLog-6-1000.log"),
            Some(CommitLogSegment { version: 6, timestamp_ms: 1000 })
        );
        assert_eq!(CommitLogSegment::parse("CommitLog-6-.log"), None);
        assert_eq!(CommitLogSegment::parse("CommitLog-6-10x0.log"), None);
        assert_eq!(CommitLogSegment::parse("x-listdir.json"), None);
    }

    #[test]
    fn test_is_manifest_key() {
        assert!(is_manifest_key("h:/d/ks/tbl/mc-1-big-Data.db-listdir.json"));
        assert!(!is_manifest_key("h:/d/ks/tbl/mc-1-big-Data.db"));
    }
}
