//! Restore Agent Library
//!
//! Restores table snapshots and commit-log segments described by
//! `-listdir.json` manifests from object storage to local disk.

pub mod config;
pub mod executor;
pub mod fs;
pub mod manifest;
pub mod restore;
pub mod shutdown;
pub mod store;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use restore::{RestoreContext, RestoreJob, RestoreMode, RestoreReport};
pub use utils::errors::RestoreError;
pub type Result<T> = std::result::Result<T, RestoreError>;
