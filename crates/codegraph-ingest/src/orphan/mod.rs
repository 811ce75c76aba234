// ABOUTME: Tracks individual files outside any indexed project under a hard population cap
// ABOUTME: Emits change records for watched files, evicts idle ones, and restores state from a store

pub mod fs_watch;
pub mod store;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::change::ChangeRecord;
use crate::config::OrphanConfig;
use crate::error::Result;

pub use fs_watch::{notify_factory, NotifyPathWatcher, PathEvent, PathWatcher, WatcherFactory};
pub use store::{JsonFileWatchStore, MemoryWatchStore, WatchStateStore, WatchedFileRecord};

/// Consumer of filesystem-observed changes to orphan files
pub type FileChangeHandler = Arc<dyn Fn(ChangeRecord) + Send + Sync>;

/// Orphan tracker statistics
#[derive(Debug, Clone, Serialize)]
pub struct OrphanStats {
    pub watched_count: usize,
    pub max_files: usize,
    pub oldest_access: Option<DateTime<Utc>>,
    pub newest_access: Option<DateTime<Utc>>,
    pub is_watching: bool,
    pub persistence_enabled: bool,
}

/// Watches files that callers touched but that belong to no ingested project.
///
/// Watch state is mirrored into a [`WatchStateStore`] on a best-effort basis:
/// store failures are logged and the tracker keeps working from memory.
#[derive(Clone)]
pub struct OrphanFileTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    config: OrphanConfig,
    store: Option<Arc<dyn WatchStateStore>>,
    factory: WatcherFactory,
    state: Mutex<TrackerState>,
    handler: RwLock<Option<FileChangeHandler>>,
}

#[derive(Default)]
struct TrackerState {
    files: HashMap<PathBuf, WatchedFileRecord>,
    watcher: Option<Box<dyn PathWatcher>>,
    pump: Option<JoinHandle<()>>,
    initialized: bool,
    stopped: bool,
}

enum WatchOutcome {
    Refreshed,
    AtCapacity,
    Added(WatchedFileRecord),
    Failed,
    Stopped,
}

impl OrphanFileTracker {
    /// Tracker using the notify-backed watch primitive
    pub fn new(config: OrphanConfig, store: Option<Arc<dyn WatchStateStore>>) -> Self {
        Self::with_watcher_factory(config, store, notify_factory())
    }

    pub fn with_watcher_factory(
        config: OrphanConfig,
        store: Option<Arc<dyn WatchStateStore>>,
        factory: WatcherFactory,
    ) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                config,
                store,
                factory,
                state: Mutex::new(TrackerState::default()),
                handler: RwLock::new(None),
            }),
        }
    }

    pub fn config(&self) -> &OrphanConfig {
        &self.inner.config
    }

    /// Restore previously watched files from the store. Returns how many were
    /// restored; subsequent calls do nothing until [`stop`](Self::stop).
    pub async fn initialize(&self) -> usize {
        {
            let mut state = self.inner.state.lock();
            if state.initialized {
                return 0;
            }
            state.initialized = true;
            state.stopped = false;
        }

        let Some(store) = self.inner.persistent_store() else {
            info!(target: "codegraph::ingest::orphan", "Orphan tracker initialized (memory only)");
            return 0;
        };

        let records = match store.load_watched_files(&self.inner.config.scope_id).await {
            Ok(records) => records,
            Err(e) => {
                warn!(
                    target: "codegraph::ingest::orphan",
                    error = %e,
                    "Failed to load watch state, continuing in memory-only mode"
                );
                return 0;
            }
        };

        let mut restored = 0;
        for record in records {
            if !tokio::fs::try_exists(&record.path).await.unwrap_or(false) {
                debug!(
                    target: "codegraph::ingest::orphan",
                    path = %record.path.display(),
                    "Dropping vanished file from watch state"
                );
                self.inner.forget_persisted(&record.path).await;
                continue;
            }

            let path = record.path.clone();
            let added = {
                let mut state = self.inner.state.lock();
                if state.files.len() >= self.inner.config.max_files {
                    false
                } else if state.files.contains_key(&path) {
                    true
                } else {
                    match self.attach(&mut state, &path) {
                        Ok(()) => {
                            state.files.insert(path.clone(), record);
                            true
                        }
                        Err(e) => {
                            warn!(
                                target: "codegraph::ingest::orphan",
                                path = %path.display(),
                                error = %e,
                                "Failed to restore watch"
                            );
                            false
                        }
                    }
                }
            };
            if added {
                restored += 1;
            }
        }

        info!(
            target: "codegraph::ingest::orphan",
            restored,
            max_files = self.inner.config.max_files,
            "Orphan tracker initialized"
        );
        restored
    }

    /// Start watching `path`, or refresh its access time if already watched.
    ///
    /// Returns `false` when the tracker is full or the watch could not be
    /// installed.
    pub async fn watch(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref().to_path_buf();
        let now = Utc::now();

        let outcome = {
            let mut state = self.inner.state.lock();
            if state.stopped {
                WatchOutcome::Stopped
            } else if let Some(existing) = state.files.get_mut(&path) {
                existing.last_accessed = now;
                WatchOutcome::Refreshed
            } else if state.files.len() >= self.inner.config.max_files {
                WatchOutcome::AtCapacity
            } else {
                match self.attach(&mut state, &path) {
                    Ok(()) => {
                        let record = WatchedFileRecord::new(path.clone(), now);
                        state.files.insert(path.clone(), record.clone());
                        WatchOutcome::Added(record)
                    }
                    Err(e) => {
                        warn!(
                            target: "codegraph::ingest::orphan",
                            path = %path.display(),
                            error = %e,
                            "Failed to watch orphan file"
                        );
                        WatchOutcome::Failed
                    }
                }
            }
        };

        match outcome {
            WatchOutcome::Refreshed => {
                self.inner.touch_persisted(&path, now).await;
                true
            }
            WatchOutcome::AtCapacity => {
                warn!(
                    target: "codegraph::ingest::orphan",
                    path = %path.display(),
                    max_files = self.inner.config.max_files,
                    "Orphan watch limit reached"
                );
                false
            }
            WatchOutcome::Added(record) => {
                debug!(target: "codegraph::ingest::orphan", path = %path.display(), "Watching orphan file");
                self.inner.persist(&record).await;
                true
            }
            WatchOutcome::Failed => false,
            WatchOutcome::Stopped => {
                warn!(
                    target: "codegraph::ingest::orphan",
                    path = %path.display(),
                    "Orphan tracker stopped, call initialize before watching"
                );
                false
            }
        }
    }

    /// Stop watching `path`. Returns whether it was tracked.
    pub async fn unwatch(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        if !self.inner.detach(path) {
            return false;
        }
        debug!(target: "codegraph::ingest::orphan", path = %path.display(), "Unwatched orphan file");
        self.inner.forget_persisted(path).await;
        true
    }

    /// Register the consumer of file changes, replacing any previous one
    pub fn on_file_change<F>(&self, handler: F)
    where
        F: Fn(ChangeRecord) + Send + Sync + 'static,
    {
        *self.inner.handler.write() = Some(Arc::new(handler));
    }

    /// Unwatch every file not accessed within `retention_days`
    pub async fn cleanup_stale(&self, retention_days: u32) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let stale: Vec<PathBuf> = self
            .inner
            .state
            .lock()
            .files
            .values()
            .filter(|record| record.last_accessed < cutoff)
            .map(|record| record.path.clone())
            .collect();

        let mut removed = 0;
        for path in stale {
            if self.unwatch(&path).await {
                removed += 1;
            }
        }

        if removed > 0 {
            info!(
                target: "codegraph::ingest::orphan",
                removed,
                retention_days,
                "Cleaned up stale orphan files"
            );
        }
        removed
    }

    pub async fn cleanup_stale_default(&self) -> usize {
        self.cleanup_stale(self.inner.config.retention_days).await
    }

    pub fn file_status(&self, path: impl AsRef<Path>) -> Option<WatchedFileRecord> {
        self.inner.state.lock().files.get(path.as_ref()).cloned()
    }

    pub fn is_watched(&self, path: impl AsRef<Path>) -> bool {
        self.inner.state.lock().files.contains_key(path.as_ref())
    }

    /// Watched paths, sorted
    pub fn watched_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = self.inner.state.lock().files.keys().cloned().collect();
        files.sort();
        files
    }

    pub fn stats(&self) -> OrphanStats {
        let state = self.inner.state.lock();
        OrphanStats {
            watched_count: state.files.len(),
            max_files: self.inner.config.max_files,
            oldest_access: state.files.values().map(|r| r.last_accessed).min(),
            newest_access: state.files.values().map(|r| r.last_accessed).max(),
            is_watching: state.watcher.is_some(),
            persistence_enabled: self.inner.persistent_store().is_some(),
        }
    }

    /// Tear down the watch primitive and forget in-memory state. Persisted
    /// state is kept so a later `initialize` restores it; `watch` returns
    /// `false` until then.
    pub fn stop(&self) {
        let (watcher, pump, count) = {
            let mut state = self.inner.state.lock();
            let count = state.files.len();
            state.files.clear();
            state.initialized = false;
            state.stopped = true;
            (state.watcher.take(), state.pump.take(), count)
        };
        drop(watcher);
        if let Some(pump) = pump {
            pump.abort();
        }
        info!(target: "codegraph::ingest::orphan", released = count, "Orphan tracker stopped");
    }

    /// Install the watch primitive on first use, then add `path` to it
    fn attach(&self, state: &mut TrackerState, path: &Path) -> Result<()> {
        if state.watcher.is_none() {
            let (tx, rx) = mpsc::unbounded_channel();
            let watcher = (self.inner.factory)(tx)?;
            state.watcher = Some(watcher);
            state.pump = Some(tokio::spawn(run_event_pump(Arc::downgrade(&self.inner), rx)));
        }
        match state.watcher.as_mut() {
            Some(watcher) => watcher.add_path(path),
            None => Ok(()),
        }
    }
}

async fn run_event_pump(inner: Weak<TrackerInner>, mut events: mpsc::UnboundedReceiver<PathEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_event(event).await;
    }
}

impl TrackerInner {
    fn persistent_store(&self) -> Option<&Arc<dyn WatchStateStore>> {
        if self.config.persist_to_store {
            self.store.as_ref()
        } else {
            None
        }
    }

    async fn handle_event(&self, event: PathEvent) {
        match event {
            PathEvent::Changed(path) => self.handle_changed(path).await,
            PathEvent::Removed(path) => {
                // A file replaced in place is still live
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    self.handle_changed(path).await;
                    return;
                }
                if !self.detach(&path) {
                    return;
                }
                debug!(target: "codegraph::ingest::orphan", path = %path.display(), "Orphan file removed");
                self.emit(ChangeRecord::deleted(path.clone()));
                self.forget_persisted(&path).await;
            }
            PathEvent::Error(message) => {
                warn!(target: "codegraph::ingest::orphan", error = %message, "Orphan file watcher error");
            }
        }
    }

    async fn handle_changed(&self, path: PathBuf) {
        let now = Utc::now();
        let tracked = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            match state.files.get_mut(&path) {
                Some(record) => {
                    record.last_accessed = now;
                    // The watch follows the inode; re-point it at the current file
                    if let Some(watcher) = state.watcher.as_mut() {
                        let _ = watcher.remove_path(&path);
                        if let Err(e) = watcher.add_path(&path) {
                            debug!(
                                target: "codegraph::ingest::orphan",
                                path = %path.display(),
                                error = %e,
                                "Failed to re-watch file"
                            );
                        }
                    }
                    true
                }
                None => false,
            }
        };
        if !tracked {
            debug!(target: "codegraph::ingest::orphan", path = %path.display(), "Ignoring event for untracked path");
            return;
        }
        self.emit(ChangeRecord::updated(path.clone()));
        self.touch_persisted(&path, now).await;
    }

    /// Remove bookkeeping and the watch for `path`. Returns whether it was tracked.
    fn detach(&self, path: &Path) -> bool {
        let mut state = self.state.lock();
        if state.files.remove(path).is_none() {
            return false;
        }
        if let Some(watcher) = state.watcher.as_mut() {
            if let Err(e) = watcher.remove_path(path) {
                debug!(
                    target: "codegraph::ingest::orphan",
                    path = %path.display(),
                    error = %e,
                    "Failed to remove watch"
                );
            }
        }
        true
    }

    fn emit(&self, record: ChangeRecord) {
        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => handler(record),
            None => debug!(
                target: "codegraph::ingest::orphan",
                path = %record.path.display(),
                "No file change handler registered"
            ),
        }
    }

    async fn persist(&self, record: &WatchedFileRecord) {
        let Some(store) = self.persistent_store() else {
            return;
        };
        if let Err(e) = store.upsert_watched_file(record, &self.config.scope_id).await {
            warn!(
                target: "codegraph::ingest::orphan",
                path = %record.path.display(),
                error = %e,
                "Failed to persist watched file"
            );
        }
    }

    async fn touch_persisted(&self, path: &Path, at: DateTime<Utc>) {
        let Some(store) = self.persistent_store() else {
            return;
        };
        if let Err(e) = store.touch_access(path, &self.config.scope_id, at).await {
            warn!(
                target: "codegraph::ingest::orphan",
                path = %path.display(),
                error = %e,
                "Failed to update access time"
            );
        }
    }

    async fn forget_persisted(&self, path: &Path) {
        let Some(store) = self.persistent_store() else {
            return;
        };
        if let Err(e) = store.mark_unwatched(path, &self.config.scope_id).await {
            warn!(
                target: "codegraph::ingest::orphan",
                path = %path.display(),
                error = %e,
                "Failed to remove watched file from store"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeType;
    use crate::error::IngestError;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct MockWatch {
        paths: Arc<Mutex<HashSet<PathBuf>>>,
        sender: Arc<Mutex<Option<mpsc::UnboundedSender<PathEvent>>>>,
        created: Arc<Mutex<usize>>,
    }

    struct MockWatcher {
        paths: Arc<Mutex<HashSet<PathBuf>>>,
    }

    impl PathWatcher for MockWatcher {
        fn add_path(&mut self, path: &Path) -> Result<()> {
            self.paths.lock().insert(path.to_path_buf());
            Ok(())
        }

        fn remove_path(&mut self, path: &Path) -> Result<()> {
            self.paths.lock().remove(path);
            Ok(())
        }
    }

    impl MockWatch {
        fn factory(&self) -> WatcherFactory {
            let mock = self.clone();
            Arc::new(move |tx| {
                *mock.sender.lock() = Some(tx);
                *mock.created.lock() += 1;
                Ok(Box::new(MockWatcher {
                    paths: mock.paths.clone(),
                }) as Box<dyn PathWatcher>)
            })
        }

        fn send(&self, event: PathEvent) {
            let sender = self.sender.lock().clone().expect("watcher not created");
            sender.send(event).unwrap();
        }

        fn watching(&self, path: &Path) -> bool {
            self.paths.lock().contains(path)
        }
    }

    struct FailingStore;

    #[async_trait]
    impl WatchStateStore for FailingStore {
        async fn load_watched_files(&self, _scope_id: &str) -> Result<Vec<WatchedFileRecord>> {
            Err(IngestError::Store("unreachable".to_string()))
        }

        async fn upsert_watched_file(&self, _record: &WatchedFileRecord, _scope_id: &str) -> Result<()> {
            Err(IngestError::Store("unreachable".to_string()))
        }

        async fn mark_unwatched(&self, _path: &Path, _scope_id: &str) -> Result<()> {
            Err(IngestError::Store("unreachable".to_string()))
        }

        async fn touch_access(&self, _path: &Path, _scope_id: &str, _at: DateTime<Utc>) -> Result<()> {
            Err(IngestError::Store("unreachable".to_string()))
        }
    }

    fn config(max_files: usize) -> OrphanConfig {
        OrphanConfig {
            max_files,
            ..OrphanConfig::default()
        }
    }

    fn tracker_with(
        max_files: usize,
        store: Option<Arc<dyn WatchStateStore>>,
    ) -> (OrphanFileTracker, MockWatch) {
        let mock = MockWatch::default();
        let tracker = OrphanFileTracker::with_watcher_factory(config(max_files), store, mock.factory());
        (tracker, mock)
    }

    async fn next_change(rx: &mut mpsc::UnboundedReceiver<ChangeRecord>) -> ChangeRecord {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no change within timeout")
            .unwrap()
    }

    #[tokio::test]
    async fn test_watch_rejects_beyond_capacity() {
        let (tracker, _mock) = tracker_with(100, None);
        for i in 0..100 {
            assert!(tracker.watch(format!("/tmp/orphan_{i}.rs")).await);
        }
        assert!(!tracker.watch("/tmp/orphan_100.rs").await);
        assert_eq!(tracker.stats().watched_count, 100);
        assert!(!tracker.is_watched("/tmp/orphan_100.rs"));

        // Already tracked paths are still accepted at capacity
        assert!(tracker.watch("/tmp/orphan_0.rs").await);
    }

    #[tokio::test]
    async fn test_watch_refreshes_existing() {
        let store = Arc::new(MemoryWatchStore::new());
        let (tracker, mock) = tracker_with(10, Some(store.clone()));

        assert!(tracker.watch("/tmp/a.rs").await);
        let first = tracker.file_status("/tmp/a.rs").unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(tracker.watch("/tmp/a.rs").await);
        let second = tracker.file_status("/tmp/a.rs").unwrap();

        assert_eq!(tracker.watched_files(), vec![PathBuf::from("/tmp/a.rs")]);
        assert_eq!(first.first_accessed, second.first_accessed);
        assert!(second.last_accessed > first.last_accessed);
        assert_eq!(
            store.get(Path::new("/tmp/a.rs"), "orphans").unwrap().last_accessed,
            second.last_accessed
        );
        assert_eq!(*mock.created.lock(), 1);
        assert!(mock.watching(Path::new("/tmp/a.rs")));
    }

    #[tokio::test]
    async fn test_unwatch_removes_everywhere() {
        let store = Arc::new(MemoryWatchStore::new());
        let (tracker, mock) = tracker_with(10, Some(store.clone()));

        tracker.watch("/tmp/a.rs").await;
        assert_eq!(store.len("orphans"), 1);

        assert!(tracker.unwatch("/tmp/a.rs").await);
        assert!(!tracker.is_watched("/tmp/a.rs"));
        assert!(!mock.watching(Path::new("/tmp/a.rs")));
        assert_eq!(store.len("orphans"), 0);

        assert!(!tracker.unwatch("/tmp/a.rs").await);
    }

    #[tokio::test]
    async fn test_change_event_emits_updated() {
        let (tracker, mock) = tracker_with(10, None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        tracker.on_file_change(move |record| {
            let _ = tx.send(record);
        });

        tracker.watch("/tmp/a.rs").await;
        mock.send(PathEvent::Changed("/tmp/a.rs".into()));

        let change = next_change(&mut rx).await;
        assert_eq!(change.change_type, ChangeType::Updated);
        assert_eq!(change.path, PathBuf::from("/tmp/a.rs"));
        assert!(tracker.is_watched("/tmp/a.rs"));
    }

    #[tokio::test]
    async fn test_removal_event_emits_deleted_and_drops_file() {
        let store = Arc::new(MemoryWatchStore::new());
        let (tracker, mock) = tracker_with(10, Some(store.clone()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        tracker.on_file_change(move |record| {
            let _ = tx.send(record);
        });

        tracker.watch("/tmp/a.rs").await;
        mock.send(PathEvent::Removed("/tmp/a.rs".into()));

        let change = next_change(&mut rx).await;
        assert_eq!(change.change_type, ChangeType::Deleted);
        assert!(!tracker.is_watched("/tmp/a.rs"));
        assert!(!mock.watching(Path::new("/tmp/a.rs")));
        assert_eq!(store.len("orphans"), 0);
    }

    #[tokio::test]
    async fn test_removal_of_replaced_file_is_an_update() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("notes.rs");
        std::fs::write(&file, "saved").unwrap();

        let store = Arc::new(MemoryWatchStore::new());
        let (tracker, mock) = tracker_with(10, Some(store.clone()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        tracker.on_file_change(move |record| {
            let _ = tx.send(record);
        });

        assert!(tracker.watch(&file).await);
        mock.paths.lock().clear();
        mock.send(PathEvent::Removed(file.clone()));

        let change = next_change(&mut rx).await;
        assert_eq!(change.change_type, ChangeType::Updated);
        assert!(tracker.is_watched(&file));
        assert!(mock.watching(&file));
        assert_eq!(store.len("orphans"), 1);
    }

    #[tokio::test]
    async fn test_later_handler_replaces_earlier() {
        let (tracker, mock) = tracker_with(10, None);
        let (first_tx, mut first_rx) = mpsc::unbounded_channel();
        let (second_tx, mut second_rx) = mpsc::unbounded_channel();
        tracker.on_file_change(move |record| {
            let _ = first_tx.send(record);
        });
        tracker.on_file_change(move |record| {
            let _ = second_tx.send(record);
        });

        tracker.watch("/tmp/a.rs").await;
        mock.send(PathEvent::Changed("/tmp/a.rs".into()));

        next_change(&mut second_rx).await;
        assert!(first_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_events_for_untracked_paths_are_ignored() {
        let (tracker, mock) = tracker_with(10, None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        tracker.on_file_change(move |record| {
            let _ = tx.send(record);
        });

        tracker.watch("/tmp/a.rs").await;
        mock.send(PathEvent::Changed("/tmp/other.rs".into()));
        mock.send(PathEvent::Error("overflow".into()));
        mock.send(PathEvent::Changed("/tmp/a.rs".into()));

        let change = next_change(&mut rx).await;
        assert_eq!(change.path, PathBuf::from("/tmp/a.rs"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_initialize_restores_existing_files_within_cap() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryWatchStore::new());
        let now = Utc::now();
        for name in ["a.rs", "b.rs", "c.rs"] {
            let path = dir.path().join(name);
            std::fs::write(&path, "fn main() {}").unwrap();
            store
                .upsert_watched_file(&WatchedFileRecord::new(path, now), "orphans")
                .await
                .unwrap();
        }
        let vanished = dir.path().join("gone.rs");
        store
            .upsert_watched_file(&WatchedFileRecord::new(vanished.clone(), now), "orphans")
            .await
            .unwrap();

        let (tracker, mock) = tracker_with(2, Some(store.clone()));
        assert_eq!(tracker.initialize().await, 2);
        assert_eq!(tracker.stats().watched_count, 2);
        assert!(!tracker.is_watched(&vanished));
        assert!(store.get(&vanished, "orphans").is_none());
        for path in tracker.watched_files() {
            assert!(mock.watching(&path));
        }

        // Second call is a no-op
        assert_eq!(tracker.initialize().await, 0);
        assert_eq!(tracker.stats().watched_count, 2);
    }

    #[tokio::test]
    async fn test_cleanup_stale_evicts_idle_files() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryWatchStore::new());
        let old = dir.path().join("old.rs");
        std::fs::write(&old, "").unwrap();
        let long_ago = Utc::now() - chrono::Duration::days(10);
        store
            .upsert_watched_file(&WatchedFileRecord::new(old.clone(), long_ago), "orphans")
            .await
            .unwrap();

        let (tracker, _mock) = tracker_with(10, Some(store.clone()));
        tracker.initialize().await;
        tracker.watch("/tmp/fresh.rs").await;

        assert_eq!(tracker.cleanup_stale(7).await, 1);
        assert!(!tracker.is_watched(&old));
        assert!(tracker.is_watched("/tmp/fresh.rs"));
        assert!(store.get(&old, "orphans").is_none());

        assert_eq!(tracker.cleanup_stale_default().await, 0);
    }

    #[tokio::test]
    async fn test_store_failures_do_not_surface() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.rs");
        std::fs::write(&file, "").unwrap();

        let (tracker, _mock) = tracker_with(10, Some(Arc::new(FailingStore)));
        assert_eq!(tracker.initialize().await, 0);
        assert!(tracker.watch(&file).await);
        assert!(tracker.watch(&file).await);
        assert!(tracker.unwatch(&file).await);
        assert!(!tracker.is_watched(&file));
    }

    #[tokio::test]
    async fn test_persistence_disabled_skips_store() {
        let store = Arc::new(MemoryWatchStore::new());
        let mock = MockWatch::default();
        let tracker = OrphanFileTracker::with_watcher_factory(
            OrphanConfig {
                persist_to_store: false,
                ..OrphanConfig::default()
            },
            Some(store.clone() as Arc<dyn WatchStateStore>),
            mock.factory(),
        );

        tracker.watch("/tmp/a.rs").await;
        assert_eq!(store.len("orphans"), 0);
        assert!(!tracker.stats().persistence_enabled);
    }

    #[tokio::test]
    async fn test_stop_clears_tracking() {
        let store = Arc::new(MemoryWatchStore::new());
        let (tracker, mock) = tracker_with(10, Some(store.clone()));
        tracker.watch("/tmp/a.rs").await;
        assert!(tracker.stats().is_watching);

        tracker.stop();
        let stats = tracker.stats();
        assert_eq!(stats.watched_count, 0);
        assert!(!stats.is_watching);
        // Persisted state survives a stop
        assert_eq!(store.len("orphans"), 1);

        assert!(!tracker.watch("/tmp/b.rs").await);
        assert!(!tracker.is_watched("/tmp/b.rs"));
        assert_eq!(*mock.created.lock(), 1);

        tracker.initialize().await;
        assert!(tracker.watch("/tmp/b.rs").await);
        assert_eq!(*mock.created.lock(), 2);
    }
}
