//! Manifest fileset resolution.
//!
//! Turns a remote namespace into the exact set of keys to restore, in one of
//! three modes:
//! - every table below a data prefix (`<prefix>/<keyspace>/<table>/`)
//! - a single directory, optionally pinned to one manifest
//! - the commit-log segments written after the oldest table snapshot

use super::{is_manifest_key, CommitLogSegment, ManifestBody};
use crate::store::{
    base_name, dir_prefix, join_key, key_depth, ObjectStore, RemoteObject, DELIMITER,
};
use crate::utils::errors::{RestoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Identifier used for the snapshot produced by commit-log resolution.
pub const COMMIT_LOG_TABLE: &str = "commitlog";

/// A resolved restore unit: which files to fetch and where they live.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Table identifier (`keyspace/table`), or the source directory name
    pub table: String,

    /// Remote prefix the filenames are relative to
    pub remote_prefix: String,

    /// Manifest the fileset was taken from (absent for commit-log windows)
    pub manifest: Option<RemoteObject>,

    /// Relative filenames, in manifest order
    pub files: Vec<String>,
}

/// How commit-log segments are scanned against the watermark.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogScan {
    /// Stop at the first segment at or below the watermark. Only correct when
    /// descending segment order is also descending timestamp order.
    #[default]
    StopAtFirstMiss,

    /// Check every segment.
    FullFilter,
}

pub struct ManifestResolver<'a> {
    store: &'a dyn ObjectStore,
}

impl<'a> ManifestResolver<'a> {
    pub fn new(store: &'a dyn ObjectStore) -> Self {
        Self { store }
    }

    /// Resolve the latest manifest of every `<keyspace>/<table>` below `prefix`.
    ///
    /// Tables without a manifest are skipped. Fails with `NotFound` when no
    /// table has one.
    pub async fn resolve_all_tables(&self, prefix: &str) -> Result<BTreeMap<String, Snapshot>> {
        let root = dir_prefix(prefix);
        let mut snapshots = BTreeMap::new();

        let keyspaces = self.store.list(&root, Some(DELIMITER)).await?.prefixes;
        for keyspace in keyspaces {
            let tables = self.store.list(&keyspace, Some(DELIMITER)).await?.prefixes;

            for table_prefix in tables {
                let candidates: Vec<RemoteObject> = self
                    .store
                    .list(&table_prefix, Some(DELIMITER))
                    .await?
                    .objects
                    .into_iter()
                    .filter(|o| is_manifest_key(&o.key))
                    .collect();

                let Some(manifest) = latest(candidates) else {
                    debug!("No manifest under {}, skipping", table_prefix);
                    continue;
                };

                let table = table_prefix
                    .strip_prefix(&root)
                    .unwrap_or(&table_prefix)
                    .trim_end_matches(DELIMITER)
                    .to_string();

                let files = self.read_manifest(&manifest.key).await?.first_fileset()?;
                info!("Selected {} for table {} ({} files)", manifest.key, table, files.len());

                snapshots.insert(
                    table.clone(),
                    Snapshot {
                        table,
                        remote_prefix: table_prefix.trim_end_matches(DELIMITER).to_string(),
                        manifest: Some(manifest),
                        files,
                    },
                );
            }
        }

        if snapshots.is_empty() {
            return Err(RestoreError::NotFound(format!("no table manifests under {}", root)));
        }

        Ok(snapshots)
    }

    /// Resolve a single directory.
    ///
    /// With `explicit` set, that manifest is fetched directly. Otherwise the
    /// most recent manifest sitting directly under `prefix` is used; manifests
    /// of nested directories are ignored.
    pub async fn resolve_one(
        &self,
        prefix: &str,
        explicit: Option<&str>,
        origin: &str,
    ) -> Result<Snapshot> {
        let prefix = prefix.trim_end_matches(DELIMITER);

        let manifest = match explicit {
            Some(name) => self.store.get_object(&join_key(prefix, name)).await?,
            None => {
                let depth = key_depth(prefix) + 1;
                let candidates: Vec<RemoteObject> = self
                    .store
                    .list(&dir_prefix(prefix), None)
                    .await?
                    .objects
                    .into_iter()
                    .filter(|o| is_manifest_key(&o.key) && key_depth(&o.key) == depth)
                    .collect();

                latest(candidates).ok_or_else(|| {
                    RestoreError::NotFound(format!("no manifest under {}", prefix))
                })?
            }
        };

        let files = self.read_manifest(&manifest.key).await?.fileset_for(origin)?;
        info!("Selected {} ({} files)", manifest.key, files.len());

        Ok(Snapshot {
            table: base_name(prefix).to_string(),
            remote_prefix: prefix.to_string(),
            manifest: Some(manifest),
            files,
        })
    }

    /// Resolve the commit-log segments newer than every table snapshot.
    ///
    /// The watermark is the oldest selected manifest timestamp across all
    /// tables under `data_prefix`. Segments are visited newest name first.
    pub async fn resolve_commit_log_window(
        &self,
        data_prefix: &str,
        log_prefix: &str,
        scan: LogScan,
    ) -> Result<Snapshot> {
        let tables = self.resolve_all_tables(data_prefix).await?;
        let watermark = tables
            .values()
            .filter_map(|s| s.manifest.as_ref())
            .map(|m| m.last_modified.timestamp_millis())
            .min()
            .ok_or_else(|| RestoreError::NotFound(format!("no manifests under {}", data_prefix)))?;

        let log_root = dir_prefix(log_prefix);
        let mut segments: Vec<(CommitLogSegment, String)> = Vec::new();
        for object in self.store.list(&log_root, Some(DELIMITER)).await?.objects {
            let name = base_name(&object.key).to_string();
            match CommitLogSegment::parse(&name) {
                Some(segment) => segments.push((segment, name)),
                None => debug!("Ignoring non-segment key {}", object.key),
            }
        }
        segments.sort_by(|a, b| b.cmp(a));

        let files = select_segments(&segments, watermark, scan);
        info!(
            "Selected {} of {} commit-log segments newer than {} ms",
            files.len(),
            segments.len(),
            watermark
        );

        Ok(Snapshot {
            table: COMMIT_LOG_TABLE.to_string(),
            remote_prefix: log_prefix.trim_end_matches(DELIMITER).to_string(),
            manifest: None,
            files,
        })
    }

    async fn read_manifest(&self, key: &str) -> Result<ManifestBody> {
        let body = self.store.get_content(key).await?;
        ManifestBody::parse(key, &body)
    }
}

/// Most recent candidate; on equal timestamps the last one listed wins.
fn latest(mut candidates: Vec<RemoteObject>) -> Option<RemoteObject> {
    candidates.sort_by_key(|o| o.last_modified);
    candidates.pop()
}

/// Pick segments strictly newer than `watermark` from a newest-first list.
fn select_segments(
    segments: &[(CommitLogSegment, String)],
    watermark: i64,
    scan: LogScan,
) -> Vec<String> {
    let newer = |(segment, _): &&(CommitLogSegment, String)| segment.timestamp_ms > watermark;

    match scan {
        LogScan::StopAtFirstMiss => segments
            .iter()
            .take_while(newer)
            .map(|(_, name)| name.clone())
            .collect(),
        LogScan::FullFilter => segments
            .iter()
            .filter(newer)
            .map(|(_, name)| name.clone())
            .collect(),
    }
}
