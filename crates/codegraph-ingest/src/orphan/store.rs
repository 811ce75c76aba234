use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::Result;

/// Persisted watch state for one orphan file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedFileRecord {
    pub path: PathBuf,
    pub first_accessed: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl WatchedFileRecord {
    pub fn new(path: impl Into<PathBuf>, now: DateTime<Utc>) -> Self {
        Self {
            path: path.into(),
            first_accessed: now,
            last_accessed: now,
        }
    }
}

/// Backing store for the orphan watch list, partitioned by scope id
#[async_trait]
pub trait WatchStateStore: Send + Sync {
    async fn load_watched_files(&self, scope_id: &str) -> Result<Vec<WatchedFileRecord>>;

    async fn upsert_watched_file(&self, record: &WatchedFileRecord, scope_id: &str) -> Result<()>;

    async fn mark_unwatched(&self, path: &Path, scope_id: &str) -> Result<()>;

    async fn touch_access(&self, path: &Path, scope_id: &str, at: DateTime<Utc>) -> Result<()>;
}

type ScopeMap = HashMap<String, HashMap<PathBuf, WatchedFileRecord>>;

/// In-process store; state lives as long as the value
#[derive(Default)]
pub struct MemoryWatchStore {
    scopes: Mutex<ScopeMap>,
}

impl MemoryWatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, scope_id: &str) -> usize {
        self.scopes.lock().get(scope_id).map_or(0, HashMap::len)
    }

    pub fn get(&self, path: &Path, scope_id: &str) -> Option<WatchedFileRecord> {
        self.scopes
            .lock()
            .get(scope_id)
            .and_then(|files| files.get(path).cloned())
    }
}

#[async_trait]
impl WatchStateStore for MemoryWatchStore {
    async fn load_watched_files(&self, scope_id: &str) -> Result<Vec<WatchedFileRecord>> {
        Ok(self
            .scopes
            .lock()
            .get(scope_id)
            .map(|files| files.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert_watched_file(&self, record: &WatchedFileRecord, scope_id: &str) -> Result<()> {
        self.scopes
            .lock()
            .entry(scope_id.to_string())
            .or_default()
            .insert(record.path.clone(), record.clone());
        Ok(())
    }

    async fn mark_unwatched(&self, path: &Path, scope_id: &str) -> Result<()> {
        if let Some(files) = self.scopes.lock().get_mut(scope_id) {
            files.remove(path);
        }
        Ok(())
    }

    async fn touch_access(&self, path: &Path, scope_id: &str, at: DateTime<Utc>) -> Result<()> {
        if let Some(record) = self
            .scopes
            .lock()
            .get_mut(scope_id)
            .and_then(|files| files.get_mut(path))
        {
            record.last_accessed = at;
        }
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    scopes: BTreeMap<String, BTreeMap<String, WatchedFileRecord>>,
}

/// Store backed by a single JSON document on disk.
///
/// Every mutation rewrites the whole document; the watch list is capped so the
/// file stays small.
pub struct JsonFileWatchStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileWatchStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_document(&self) -> Result<StoreDocument> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(StoreDocument::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreDocument::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_document(&self, document: &StoreDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let bytes = serde_json::to_vec_pretty(document)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(
            target: "codegraph::ingest::orphan",
            path = %self.path.display(),
            "Wrote watch state"
        );
        Ok(())
    }

    async fn modify<F>(&self, scope_id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeMap<String, WatchedFileRecord>) + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut document = self.read_document().await?;
        f(document.scopes.entry(scope_id.to_string()).or_default());
        self.write_document(&document).await
    }
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[async_trait]
impl WatchStateStore for JsonFileWatchStore {
    async fn load_watched_files(&self, scope_id: &str) -> Result<Vec<WatchedFileRecord>> {
        let document = self.read_document().await?;
        Ok(document
            .scopes
            .get(scope_id)
            .map(|files| files.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert_watched_file(&self, record: &WatchedFileRecord, scope_id: &str) -> Result<()> {
        let record = record.clone();
        self.modify(scope_id, move |files| {
            files.insert(path_key(&record.path), record);
        })
        .await
    }

    async fn mark_unwatched(&self, path: &Path, scope_id: &str) -> Result<()> {
        let key = path_key(path);
        self.modify(scope_id, move |files| {
            files.remove(&key);
        })
        .await
    }

    async fn touch_access(&self, path: &Path, scope_id: &str, at: DateTime<Utc>) -> Result<()> {
        let key = path_key(path);
        self.modify(scope_id, move |files| {
            if let Some(record) = files.get_mut(&key) {
                record.last_accessed = at;
            }
        })
        .await
    }
}
