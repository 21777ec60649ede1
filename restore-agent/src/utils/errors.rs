//! Error types for the restore agent.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RestoreError {
    /// No manifest or key could be located.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Manifest body is unparsable or lacks the expected file list.
    #[error("Corrupt manifest {key}: {reason}")]
    CorruptManifest { key: String, reason: String },

    /// Invalid owner/group or other setup-time misconfiguration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Transport failure talking to the object store.
    #[error("Object store error: {0}")]
    Store(String),

    /// Ownership could not be applied to a restored path.
    #[error("Permission apply error on {path}: {reason}")]
    PermissionApply { path: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RestoreError {
    pub fn corrupt(key: impl Into<String>, reason: impl Into<String>) -> Self {
        RestoreError::CorruptManifest {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RestoreError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, RestoreError>;
