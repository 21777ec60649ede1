//! Restore runs - resolve what to fetch, decide ownership, then download.
//!
//! A [`RestoreContext`] carries everything a run needs (store connector and
//! restore options); nothing is kept in process-wide state.

use crate::config::RestoreConfig;
use crate::executor::{DownloadScheduler, RunSummary, SchedulerOptions};
use crate::fs::ownership::{OwnershipDecision, OwnershipResolver};
use crate::manifest::resolver::{ManifestResolver, Snapshot};
use crate::store::StoreConnector;
use crate::utils::errors::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// What to restore from the job's prefix.
#[derive(Debug, Clone)]
pub enum RestoreMode {
    /// Every `<keyspace>/<table>` below the prefix, each into its own subdirectory
    AllTables,

    /// The directory at the prefix itself
    Single {
        /// Pin a manifest by name instead of taking the most recent
        manifest: Option<String>,
        /// Manifest key holding the file list
        origin: String,
    },

    /// Commit-log segments newer than every table snapshot below the prefix
    CommitLogs { log_prefix: String },
}

#[derive(Debug, Clone)]
pub struct RestoreJob {
    /// Remote namespace, `<host>:<source path>`
    pub prefix: String,
    pub target_dir: PathBuf,
    pub mode: RestoreMode,
}

/// Per-target results of a restore run
#[derive(Debug, Default)]
pub struct RestoreReport {
    pub targets: Vec<(String, RunSummary)>,
    pub duration_secs: u64,
}

impl RestoreReport {
    pub fn downloaded(&self) -> usize {
        self.targets.iter().map(|(_, s)| s.downloaded).sum()
    }

    pub fn skipped(&self) -> usize {
        self.targets.iter().map(|(_, s)| s.skipped).sum()
    }

    pub fn bytes(&self) -> u64 {
        self.targets.iter().map(|(_, s)| s.bytes).sum()
    }

    /// Abandoned files as `<target>/<file>`
    pub fn abandoned(&self) -> Vec<String> {
        self.targets
            .iter()
            .flat_map(|(target, s)| s.abandoned.iter().map(move |f| format!("{}/{}", target, f)))
            .collect()
    }
}

struct Plan {
    snapshot: Snapshot,
    target_dir: PathBuf,
    ownership: OwnershipDecision,
}

pub struct RestoreContext {
    connector: Arc<dyn StoreConnector>,
    options: RestoreConfig,
}

impl RestoreContext {
    pub fn new(connector: Arc<dyn StoreConnector>, options: RestoreConfig) -> Self {
        Self { connector, options }
    }

    /// Execute a restore job.
    ///
    /// Resolution and ownership errors abort the job before any file is
    /// transferred. Per-file failures only show up in the report.
    pub async fn execute(&self, job: &RestoreJob) -> Result<RestoreReport> {
        let start_time = Instant::now();
        let store = self.connector.connect().await?;
        let resolver = ManifestResolver::new(store.as_ref());

        let resolved: Vec<(Snapshot, PathBuf)> = match &job.mode {
            RestoreMode::AllTables => resolver
                .resolve_all_tables(&job.prefix)
                .await?
                .into_values()
                .map(|snapshot| {
                    let dir = job.target_dir.join(&snapshot.table);
                    (snapshot, dir)
                })
                .collect(),
            RestoreMode::Single { manifest, origin } => {
                let snapshot = resolver
                    .resolve_one(&job.prefix, manifest.as_deref(), origin)
                    .await?;
                vec![(snapshot, job.target_dir.clone())]
            }
            RestoreMode::CommitLogs { log_prefix } => {
                let snapshot = resolver
                    .resolve_commit_log_window(&job.prefix, log_prefix, self.options.commitlog_scan)
                    .await?;
                vec![(snapshot, job.target_dir.clone())]
            }
        };

        let ownership = OwnershipResolver::new(
            self.options.preserve_ownership,
            &self.options.owner,
            &self.options.group,
        );
        let mut plans = Vec::with_capacity(resolved.len());
        for (snapshot, target_dir) in resolved {
            let decision = ownership
                .resolve(store.as_ref(), &snapshot.remote_prefix, &snapshot.files)
                .await?;
            plans.push(Plan {
                snapshot,
                target_dir,
                ownership: decision,
            });
        }
        drop(store);

        let mut report = RestoreReport::default();
        for plan in plans {
            let scheduler = DownloadScheduler::new(
                Arc::clone(&self.connector),
                plan.snapshot.remote_prefix.as_str(),
                plan.target_dir,
                plan.ownership,
                SchedulerOptions {
                    max_attempts: self.options.max_attempts,
                    force: self.options.force,
                },
            );
            scheduler.enqueue(&plan.snapshot.files);
            let summary = scheduler.run(self.options.concurrency).await?;
            report.targets.push((plan.snapshot.table, summary));
        }
        report.duration_secs = start_time.elapsed().as_secs();

        info!(
            "Restore completed: {} targets, {} files downloaded ({} bytes), {} skipped, {}s",
            report.targets.len(),
            report.downloaded(),
            report.bytes(),
            report.skipped(),
            report.duration_secs
        );
        for file in report.abandoned() {
            warn!("Not restored: {}", file);
        }

        Ok(report)
    }
}
