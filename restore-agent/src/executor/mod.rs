//! Download scheduler - fetches a resolved fileset into a local directory.
//!
//! A fixed pool of workers drains one shared queue of [`DownloadTask`]s.
//! Every worker opens its own store session. Per-file failures are retried by
//! re-queueing the task and never escape the run; a file that keeps failing is
//! abandoned after `max_attempts` tries and reported in the [`RunSummary`].
//!
//! There is no cancellation: a run ends when every task is done or abandoned.

pub mod queue;

use crate::fs::ownership::ApplyOwnership;
use crate::store::{base_name, join_key, ObjectStore, StoreConnector};
use crate::utils::errors::{RestoreError, Result};
use queue::WorkQueue;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

/// Attempts per file before it is abandoned.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// One file waiting to be restored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    /// Filename relative to the run's remote prefix
    pub filename: String,

    /// Failed attempts so far
    pub attempts: u32,
}

impl DownloadTask {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            attempts: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub max_attempts: u32,

    /// Download even when a same-sized local copy exists
    pub force: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            force: false,
        }
    }
}

/// Outcome of a scheduler run
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub downloaded: usize,
    pub skipped: usize,
    pub bytes: u64,
    /// Failed attempts across all files, retried ones included
    pub failed_attempts: usize,
    /// Files given up on after exhausting their attempts
    pub abandoned: Vec<String>,
}

impl RunSummary {
    pub fn is_complete(&self) -> bool {
        self.abandoned.is_empty()
    }
}

#[derive(Default)]
struct Counters {
    downloaded: AtomicUsize,
    skipped: AtomicUsize,
    bytes: AtomicU64,
    failed_attempts: AtomicUsize,
    abandoned: Mutex<Vec<String>>,
}

enum Outcome {
    Downloaded(u64),
    Skipped,
}

struct RunShared {
    connector: Arc<dyn StoreConnector>,
    remote_prefix: String,
    target_dir: PathBuf,
    ownership: Box<dyn ApplyOwnership>,
    options: SchedulerOptions,
    queue: WorkQueue<DownloadTask>,
    counters: Counters,
}

pub struct DownloadScheduler {
    shared: Arc<RunShared>,
}

impl DownloadScheduler {
    pub fn new(
        connector: Arc<dyn StoreConnector>,
        remote_prefix: impl Into<String>,
        target_dir: impl Into<PathBuf>,
        ownership: impl ApplyOwnership + 'static,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            shared: Arc::new(RunShared {
                connector,
                remote_prefix: remote_prefix.into(),
                target_dir: target_dir.into(),
                ownership: Box::new(ownership),
                options,
                queue: WorkQueue::new(),
                counters: Counters::default(),
            }),
        }
    }

    /// Queue one task per filename.
    pub fn enqueue(&self, fileset: &[String]) {
        for filename in fileset {
            self.shared.queue.push(DownloadTask::new(filename.as_str()));
        }
    }

    /// Run `concurrency` workers until every task is done or abandoned.
    ///
    /// The target directory is created and chowned before any worker starts.
    /// Only setup failures are returned: the target directory cannot be
    /// created, or no worker could open a store session. A worker that panics
    /// is logged and its current file is neither retried nor reported.
    pub async fn run(self, concurrency: usize) -> Result<RunSummary> {
        let shared = self.shared;
        let total = shared.queue.pending();

        tokio::fs::create_dir_all(&shared.target_dir).await?;
        if let Err(e) = shared.ownership.apply(&shared.target_dir) {
            warn!("{}", e);
        }

        let workers = concurrency.max(1);
        info!(
            "Restoring {} files from {} into {} with {} workers",
            total,
            shared.remote_prefix,
            shared.target_dir.display(),
            workers
        );

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let shared = Arc::clone(&shared);
            handles.push(tokio::spawn(async move { worker(id, shared).await }));
        }

        let mut connected = 0usize;
        for handle in handles {
            match handle.await {
                Ok(true) => connected += 1,
                Ok(false) => {}
                Err(e) => error!("Download worker panicked: {}", e),
            }
        }

        if connected == 0 && total > 0 {
            return Err(RestoreError::Store(format!(
                "no worker could connect to restore {}",
                shared.remote_prefix
            )));
        }

        let counters = &shared.counters;
        let summary = RunSummary {
            downloaded: counters.downloaded.load(Ordering::Relaxed),
            skipped: counters.skipped.load(Ordering::Relaxed),
            bytes: counters.bytes.load(Ordering::Relaxed),
            failed_attempts: counters.failed_attempts.load(Ordering::Relaxed),
            abandoned: std::mem::take(
                &mut *counters.abandoned.lock().unwrap_or_else(PoisonError::into_inner),
            ),
        };

        info!(
            "Restore of {} finished: {} downloaded ({} bytes), {} skipped, {} abandoned",
            shared.remote_prefix,
            summary.downloaded,
            summary.bytes,
            summary.skipped,
            summary.abandoned.len()
        );

        Ok(summary)
    }
}

/// Worker loop. Returns false when no store session could be opened.
async fn worker(id: usize, shared: Arc<RunShared>) -> bool {
    let store = match shared.connector.connect().await {
        Ok(store) => store,
        Err(e) => {
            error!("Worker {} failed to connect: {}", id, e);
            return false;
        }
    };

    while let Some((task, in_flight)) = shared.queue.pop().await {
        process(&shared, store.as_ref(), task).await;
        drop(in_flight);
    }

    debug!("Worker {} finished", id);
    true
}

async fn process(shared: &RunShared, store: &dyn ObjectStore, mut task: DownloadTask) {
    if task.attempts >= shared.options.max_attempts {
        error!("Abandoning {} after {} attempts", task.filename, task.attempts);
        shared
            .counters
            .abandoned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task.filename);
        return;
    }

    match fetch(shared, store, &task.filename).await {
        Ok(Outcome::Downloaded(bytes)) => {
            shared.counters.downloaded.fetch_add(1, Ordering::Relaxed);
            shared.counters.bytes.fetch_add(bytes, Ordering::Relaxed);
        }
        Ok(Outcome::Skipped) => {
            shared.counters.skipped.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            task.attempts += 1;
            shared.counters.failed_attempts.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Failed to restore {} (attempt {}/{}): {}",
                task.filename, task.attempts, shared.options.max_attempts, e
            );
            shared.queue.push(task);
        }
    }
}

async fn fetch(shared: &RunShared, store: &dyn ObjectStore, filename: &str) -> Result<Outcome> {
    let key = join_key(&shared.remote_prefix, filename);
    let dest = shared.target_dir.join(base_name(filename));

    if !needs_download(store, &key, &dest, shared.options.force).await? {
        debug!("Skipping {}, local copy is current", dest.display());
        return Ok(Outcome::Skipped);
    }

    let partial = partial_path(&dest);
    let bytes = match store.download_to_file(&key, &partial).await {
        Ok(bytes) => bytes,
        Err(e) => {
            discard(&partial).await;
            return Err(e);
        }
    };
    if let Err(e) = tokio::fs::rename(&partial, &dest).await {
        discard(&partial).await;
        return Err(e.into());
    }

    // Ownership failures are logged only; the file itself is restored.
    if let Err(e) = shared.ownership.apply(&dest) {
        warn!("{}", e);
    }

    info!("Restored {} ({} bytes)", dest.display(), bytes);
    Ok(Outcome::Downloaded(bytes))
}

async fn needs_download(
    store: &dyn ObjectStore,
    key: &str,
    dest: &Path,
    force: bool,
) -> Result<bool> {
    if force {
        return Ok(true);
    }

    let local = match tokio::fs::metadata(dest).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    };

    let remote = store.get_object(key).await?;
    Ok(local.len() != remote.size)
}

/// Temporary path the body is streamed into before being moved into place.
fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

async fn discard(partial: &Path) {
    match tokio::fs::remove_file(partial).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial file {}: {}", partial.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::ownership::OwnershipDecision;
    use crate::store::memory::MemoryStore;
    use crate::store::{Listing, RemoteObject};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::time::Duration;
    use nix::unistd::{getgid, getuid, Group, User};
    use tempfile::TempDir;

    const PREFIX: &str = "db1:/var/lib/cassandra/data/ks/tbl";

    fn own_decision() -> OwnershipDecision {
        let user = User::from_uid(getuid()).unwrap().unwrap().name;
        let group = Group::from_gid(getgid()).unwrap().unwrap().name;
        OwnershipDecision::lookup(&user, &group).unwrap()
    }

    fn fixture(files: &[(&str, &str)]) -> (MemoryStore, Vec<String>) {
        let store = MemoryStore::new();
        for (name, body) in files {
            store.put(&join_key(PREFIX, name), body.to_string(), Utc::now());
        }
        let fileset = files.iter().map(|(name, _)| name.to_string()).collect();
        (store, fileset)
    }

    async fn restore(
        store: &MemoryStore,
        fileset: &[String],
        target: &Path,
        options: SchedulerOptions,
    ) -> RunSummary {
        let scheduler = DownloadScheduler::new(
            Arc::new(store.clone()),
            PREFIX,
            target,
            own_decision(),
            options,
        );
        scheduler.enqueue(fileset);
        scheduler.run(3).await.unwrap()
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/restore/mc-1-big-Data.db")),
            PathBuf::from("/restore/mc-1-big-Data.db.part")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_restores_every_file() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("ks").join("tbl");
        let (store, fileset) = fixture(&[
            ("mc-1-big-Data.db", "data"),
            ("mc-1-big-Index.db", "index!"),
            ("mc-1-big-Summary.db", "s"),
        ]);

        let summary = restore(&store, &fileset, &target, SchedulerOptions::default()).await;

        assert_eq!(summary.downloaded, 3);
        assert_eq!(summary.bytes, 11);
        assert!(summary.is_complete());
        assert_eq!(std::fs::read(target.join("mc-1-big-Index.db")).unwrap(), b"index!");
        assert!(!target.join("mc-1-big-Index.db.part").exists());
    }

    #[tokio::test]
    async fn test_second_run_transfers_nothing() {
        let dir = TempDir::new().unwrap();
        let (store, fileset) = fixture(&[("a.db", "aaaa"), ("b.db", "bb")]);

        restore(&store, &fileset, dir.path(), SchedulerOptions::default()).await;
        assert_eq!(store.total_download_attempts(), 2);

        let summary = restore(&store, &fileset, dir.path(), SchedulerOptions::default()).await;
        assert_eq!(summary.downloaded, 0);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.bytes, 0);
        assert_eq!(store.total_download_attempts(), 2);
    }

    #[tokio::test]
    async fn test_size_mismatch_and_force_download_again() {
        let dir = TempDir::new().unwrap();
        let (store, fileset) = fixture(&[("a.db", "aaaa")]);
        std::fs::write(dir.path().join("a.db"), b"stale-and-longer").unwrap();

        let summary = restore(&store, &fileset, dir.path(), SchedulerOptions::default()).await;
        assert_eq!(summary.downloaded, 1);
        assert_eq!(std::fs::read(dir.path().join("a.db")).unwrap(), b"aaaa");

        let forced = SchedulerOptions {
            force: true,
            ..SchedulerOptions::default()
        };
        let summary = restore(&store, &fileset, dir.path(), forced).await;
        assert_eq!(summary.downloaded, 1);
        assert_eq!(store.download_attempts(&join_key(PREFIX, "a.db")), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_persistent_failure_is_abandoned_after_five_attempts() {
        let dir = TempDir::new().unwrap();
        let (store, fileset) = fixture(&[("good.db", "ok"), ("bad.db", "never"), ("also.db", "ok")]);
        let bad_key = join_key(PREFIX, "bad.db");
        store.fail_downloads(&bad_key, usize::MAX);

        let summary = restore(&store, &fileset, dir.path(), SchedulerOptions::default()).await;

        assert_eq!(store.download_attempts(&bad_key), 5);
        assert_eq!(summary.abandoned, vec!["bad.db".to_string()]);
        assert_eq!(summary.failed_attempts, 5);
        assert_eq!(summary.downloaded, 2);
        assert!(!dir.path().join("bad.db").exists());
        assert!(!dir.path().join("bad.db.part").exists());
    }

    #[tokio::test]
    async fn test_success_on_last_attempt_is_not_abandoned() {
        let dir = TempDir::new().unwrap();
        let (store, fileset) = fixture(&[("flaky.db", "finally")]);
        let key = join_key(PREFIX, "flaky.db");
        store.fail_downloads(&key, 4);

        let summary = restore(&store, &fileset, dir.path(), SchedulerOptions::default()).await;

        assert_eq!(store.download_attempts(&key), 5);
        assert!(summary.is_complete());
        assert_eq!(summary.downloaded, 1);
        assert_eq!(std::fs::read(dir.path().join("flaky.db")).unwrap(), b"finally");
    }

    #[tokio::test]
    async fn test_missing_remote_key_is_abandoned() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let fileset = vec!["ghost.db".to_string()];

        let summary = restore(&store, &fileset, dir.path(), SchedulerOptions::default()).await;
        assert_eq!(summary.abandoned, fileset);
        assert_eq!(store.download_attempts(&join_key(PREFIX, "ghost.db")), 5);
    }

    #[tokio::test]
    async fn test_nested_filenames_land_in_target_dir() {
        let dir = TempDir::new().unwrap();
        let (store, fileset) = fixture(&[("snapshots/1/a.db", "a")]);

        let summary = restore(&store, &fileset, dir.path(), SchedulerOptions::default()).await;
        assert_eq!(summary.downloaded, 1);
        assert!(dir.path().join("a.db").exists());
    }

    /// Memory store whose download of one key panics.
    #[derive(Clone)]
    struct PanickingStore {
        inner: MemoryStore,
        panic_key: String,
    }

    #[async_trait]
    impl ObjectStore for PanickingStore {
        async fn list(&self, prefix: &str, delimiter: Option<&str>) -> Result<Listing> {
            self.inner.list(prefix, delimiter).await
        }

        async fn get_object(&self, key: &str) -> Result<RemoteObject> {
            self.inner.get_object(key).await
        }

        async fn get_content(&self, key: &str) -> Result<Vec<u8>> {
            self.inner.get_content(key).await
        }

        async fn get_metadata(&self, key: &str) -> Result<HashMap<String, String>> {
            self.inner.get_metadata(key).await
        }

        async fn download_to_file(&self, key: &str, path: &Path) -> Result<u64> {
            if key == self.panic_key {
                panic!("download of {} blew up", key);
            }
            self.inner.download_to_file(key, path).await
        }
    }

    #[async_trait]
    impl StoreConnector for PanickingStore {
        async fn connect(&self) -> Result<Box<dyn ObjectStore>> {
            Ok(Box::new(self.clone()))
        }
    }

    #[tokio::test]
    async fn test_run_finishes_when_a_worker_panics() {
        let dir = TempDir::new().unwrap();
        let (store, fileset) = fixture(&[("boom.db", "x"), ("other.db", "y")]);
        store.fail_downloads(&join_key(PREFIX, "other.db"), usize::MAX);
        let connector = PanickingStore {
            inner: store.clone(),
            panic_key: join_key(PREFIX, "boom.db"),
        };

        let scheduler = DownloadScheduler::new(
            Arc::new(connector),
            PREFIX,
            dir.path(),
            own_decision(),
            SchedulerOptions::default(),
        );
        scheduler.enqueue(&fileset);
        let summary = tokio::time::timeout(Duration::from_secs(10), scheduler.run(2))
            .await
            .expect("run hung after a worker panicked")
            .unwrap();

        assert_eq!(summary.abandoned, vec!["other.db".to_string()]);
        assert_eq!(store.download_attempts(&join_key(PREFIX, "other.db")), 5);
        assert!(!dir.path().join("boom.db").exists());
    }

    /// Records every chown request; refuses everything but directories.
    #[derive(Clone, Default)]
    struct DirOnlyOwner {
        /// (path, was a directory, entries in it at the time)
        calls: Arc<Mutex<Vec<(PathBuf, bool, usize)>>>,
    }

    impl ApplyOwnership for DirOnlyOwner {
        fn apply(&self, path: &Path) -> Result<()> {
            let is_dir = path.is_dir();
            let entries = std::fs::read_dir(path).map(|d| d.count()).unwrap_or(0);
            self.calls
                .lock()
                .unwrap()
                .push((path.to_path_buf(), is_dir, entries));
            if is_dir {
                Ok(())
            } else {
                Err(RestoreError::PermissionApply {
                    path: path.display().to_string(),
                    reason: "operation not permitted".to_string(),
                })
            }
        }
    }

    #[tokio::test]
    async fn test_target_dir_chowned_first_and_file_chown_failure_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("ks").join("tbl");
        let (store, fileset) = fixture(&[("a.db", "aaaa"), ("b.db", "bb")]);
        let owner = DirOnlyOwner::default();

        let scheduler = DownloadScheduler::new(
            Arc::new(store.clone()),
            PREFIX,
            &target,
            owner.clone(),
            SchedulerOptions::default(),
        );
        scheduler.enqueue(&fileset);
        let summary = scheduler.run(2).await.unwrap();

        assert_eq!(summary.downloaded, 2);
        assert_eq!(summary.bytes, 6);
        assert_eq!(summary.failed_attempts, 0);
        assert!(summary.is_complete());
        assert_eq!(store.total_download_attempts(), 2);
        assert_eq!(std::fs::read(target.join("a.db")).unwrap(), b"aaaa");

        let calls = owner.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0], (target.clone(), true, 0));
        assert!(calls[1..].iter().all(|(path, is_dir, _)| !is_dir && path.starts_with(&target)));
    }
}
