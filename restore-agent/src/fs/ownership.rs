//! Ownership of restored files.
//!
//! The owner is decided once per run, before any download starts: either the
//! `stat` metadata recorded at upload time (first object in the fileset that
//! carries it) or the configured owner/group. Names must map to local
//! accounts, otherwise the run is rejected up front.

use crate::store::{join_key, ObjectStore};
use crate::utils::errors::{RestoreError, Result};
use nix::unistd::{Gid, Group, Uid, User};
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info, warn};

/// Object metadata entry holding the uploader's `{"user", "group"}`.
pub const STAT_METADATA_KEY: &str = "stat";

#[derive(Debug, Deserialize)]
struct StatMetadata {
    user: String,
    group: String,
}

/// Resolved owner applied to every restored file and the target directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipDecision {
    pub user: String,
    pub group: String,
    pub uid: Uid,
    pub gid: Gid,
}

impl OwnershipDecision {
    /// Map account names to local ids.
    pub fn lookup(user: &str, group: &str) -> Result<Self> {
        let uid = User::from_name(user)
            .map_err(|e| RestoreError::Configuration(format!("user lookup {}: {}", user, e)))?
            .ok_or_else(|| RestoreError::Configuration(format!("unknown user {}", user)))?
            .uid;
        let gid = Group::from_name(group)
            .map_err(|e| RestoreError::Configuration(format!("group lookup {}: {}", group, e)))?
            .ok_or_else(|| RestoreError::Configuration(format!("unknown group {}", group)))?
            .gid;

        Ok(Self {
            user: user.to_string(),
            group: group.to_string(),
            uid,
            gid,
        })
    }

}

/// Sets the owner of a restored path.
pub trait ApplyOwnership: Send + Sync {
    fn apply(&self, path: &Path) -> Result<()>;
}

impl ApplyOwnership for OwnershipDecision {
    /// chown `path` to this owner.
    fn apply(&self, path: &Path) -> Result<()> {
        nix::unistd::chown(path, Some(self.uid), Some(self.gid)).map_err(|e| {
            RestoreError::PermissionApply {
                path: path.display().to_string(),
                reason: e.to_string(),
            }
        })
    }
}

/// Decides the owner of a run's files.
#[derive(Debug, Clone)]
pub struct OwnershipResolver {
    preserve: bool,
    owner: String,
    group: String,
}

impl OwnershipResolver {
    pub fn new(preserve: bool, owner: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            preserve,
            owner: owner.into(),
            group: group.into(),
        }
    }

    /// Pick the owner for `files` (relative to `remote_prefix`).
    ///
    /// Assumes the fileset is homogeneously owned: the first recorded `stat`
    /// applies to every file.
    pub async fn resolve(
        &self,
        store: &dyn ObjectStore,
        remote_prefix: &str,
        files: &[String],
    ) -> Result<OwnershipDecision> {
        if self.preserve {
            if let Some(stat) = find_stat(store, remote_prefix, files).await {
                info!("Preserving recorded ownership {}:{}", stat.user, stat.group);
                return OwnershipDecision::lookup(&stat.user, &stat.group);
            }
            info!("No recorded ownership found, using {}:{}", self.owner, self.group);
        }

        OwnershipDecision::lookup(&self.owner, &self.group)
    }
}

async fn find_stat(
    store: &dyn ObjectStore,
    remote_prefix: &str,
    files: &[String],
) -> Option<StatMetadata> {
    for file in files {
        let key = join_key(remote_prefix, file);
        let metadata = match store.get_metadata(&key).await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("Failed to read metadata of {}: {}", key, e);
                continue;
            }
        };

        let Some(raw) = metadata.get(STAT_METADATA_KEY) else {
            continue;
        };
        match serde_json::from_str::<StatMetadata>(raw) {
            Ok(stat) => return Some(stat),
            Err(e) => debug!("Ignoring malformed stat metadata on {}: {}", key, e),
        }
    }
    None
}
