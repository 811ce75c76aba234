// ABOUTME: Ingestion coordination layer for live CodeGraph indexing
// ABOUTME: Change batching, operation locking and orphan file tracking shared by watcher, ingester and queries

pub mod batcher;
pub mod change;
pub mod config;
pub mod error;
pub mod operation_lock;
pub mod orphan;
pub mod telemetry;

pub use batcher::{BatchSink, ChangeBatcher};
pub use change::{ChangeBatch, ChangeRecord, ChangeType, QueueStatus, ORPHAN_PROJECT_KEY};
pub use config::{BatcherConfig, IngestConfig, LockConfig, LoggingConfig, OrphanConfig};
pub use error::{IngestError, Result};
pub use operation_lock::{
    AcquireOptions, LockStatus, OperationGuard, OperationLock, OperationStatus, OperationType,
    PendingOperation,
};
pub use orphan::{
    FileChangeHandler, JsonFileWatchStore, MemoryWatchStore, NotifyPathWatcher, OrphanFileTracker,
    OrphanStats, PathEvent, PathWatcher, WatchStateStore, WatchedFileRecord, WatcherFactory,
};
pub use telemetry::init_tracing;
