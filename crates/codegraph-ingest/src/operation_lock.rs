// ABOUTME: Operation lock tracking in-flight index mutations so queries know when the graph is stale
// ABOUTME: Idempotent keyed acquire, fail-open per-operation timeouts, and shared unlock waiters

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::LockConfig;

/// Kind of operation holding the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    InitialIngest,
    ManualReindex,
    WatcherBatch,
    InteractiveEdit,
    OrphanUpdate,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::InitialIngest => "initial_ingest",
            OperationType::ManualReindex => "manual_reindex",
            OperationType::WatcherBatch => "watcher_batch",
            OperationType::InteractiveEdit => "interactive_edit",
            OperationType::OrphanUpdate => "orphan_update",
        }
    }

    /// Ranking constant. Only used to order status output; active operations
    /// are never preempted or reordered by it.
    pub fn priority(&self) -> u8 {
        match self {
            OperationType::InitialIngest => 100,
            OperationType::ManualReindex => 80,
            OperationType::WatcherBatch => 50,
            OperationType::InteractiveEdit => 40,
            OperationType::OrphanUpdate => 20,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            OperationType::InitialIngest => "Initial ingestion",
            OperationType::ManualReindex => "Manual re-index",
            OperationType::WatcherBatch => "File watcher batch",
            OperationType::InteractiveEdit => "Interactive edit",
            OperationType::OrphanUpdate => "Orphan file update",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-acquire options
#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    /// `None` uses the lock's default timeout, `Some(0)` disables the timeout
    pub timeout_ms: Option<u64>,
    /// Human readable description; defaults to "<label>: <identifier>"
    pub description: Option<String>,
}

impl AcquireOptions {
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn no_timeout(self) -> Self {
        self.timeout_ms(0)
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// An operation currently holding the lock
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOperation {
    pub key: String,
    pub op_type: OperationType,
    pub content_hash: String,
    pub description: String,
    pub started_at: DateTime<Utc>,
    pub has_timeout: bool,
}

/// Status entry for one active operation
#[derive(Debug, Clone, Serialize)]
pub struct OperationStatus {
    pub key: String,
    pub op_type: OperationType,
    pub priority: u8,
    pub description: String,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub has_timeout: bool,
}

/// Snapshot of the lock
#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    pub is_locked: bool,
    pub active_count: usize,
    /// Highest priority first, then oldest first
    pub operations: Vec<OperationStatus>,
}

type StatusListener = Arc<dyn Fn(&LockStatus) + Send + Sync>;

/// Tracks concurrently in-flight operations against one logical index.
///
/// The lock is held while at least one operation is active. Operations that
/// outlive their timeout are force-released so a stuck caller cannot starve
/// readers. Clone the handle to share it between subsystems.
#[derive(Clone)]
pub struct OperationLock {
    inner: Arc<LockInner>,
}

struct LockInner {
    config: LockConfig,
    active: Mutex<HashMap<String, ActiveOperation>>,
    /// Bumped on every transition to unlocked
    unlock_tx: watch::Sender<UnlockState>,
    listener: RwLock<Option<StatusListener>>,
    next_id: Mutex<u64>,
}

struct ActiveOperation {
    id: u64,
    operation: PendingOperation,
    started: Instant,
    timer: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy, Default)]
struct UnlockState {
    active: usize,
    epoch: u64,
}

enum ReleaseReason {
    Released,
    TimedOut,
}

impl OperationLock {
    pub fn new(config: LockConfig) -> Self {
        let (unlock_tx, _) = watch::channel(UnlockState::default());
        Self {
            inner: Arc::new(LockInner {
                config,
                active: Mutex::new(HashMap::new()),
                unlock_tx,
                listener: RwLock::new(None),
                next_id: Mutex::new(0),
            }),
        }
    }

    /// Key under which `identifier` is tracked for `op_type`
    pub fn operation_key(op_type: OperationType, identifier: &str) -> String {
        format!("{}:{}", op_type.as_str(), content_hash(identifier))
    }

    /// Register a status-change listener, replacing any previous one
    pub fn on_status_change<F>(&self, listener: F)
    where
        F: Fn(&LockStatus) + Send + Sync + 'static,
    {
        *self.inner.listener.write() = Some(Arc::new(listener));
    }

    /// Declare an operation in flight and return its key.
    ///
    /// Acquiring an already active key is idempotent: the same key is returned
    /// and a single `release` clears it.
    pub fn acquire(
        &self,
        op_type: OperationType,
        identifier: &str,
        options: AcquireOptions,
    ) -> String {
        self.acquire_with_id(op_type, identifier, options).0
    }

    /// Acquire, also returning the id of the acquisition now holding the key
    fn acquire_with_id(
        &self,
        op_type: OperationType,
        identifier: &str,
        options: AcquireOptions,
    ) -> (String, u64) {
        let hash = content_hash(identifier);
        let key = format!("{}:{}", op_type.as_str(), hash);

        let id = {
            let mut active = self.inner.active.lock();
            if let Some(existing) = active.get(&key) {
                warn!(
                    target: "codegraph::ingest::lock",
                    key = %key,
                    "Operation already active, ignoring duplicate acquire"
                );
                let id = existing.id;
                return (key, id);
            }

            let timeout_ms = options
                .timeout_ms
                .unwrap_or(self.inner.config.default_timeout_ms);
            let id = {
                let mut next = self.inner.next_id.lock();
                *next += 1;
                *next
            };
            let description = options
                .description
                .unwrap_or_else(|| format!("{}: {}", op_type.label(), identifier));

            let timer = if timeout_ms > 0 {
                LockInner::arm_timeout(&self.inner, key.clone(), id, Duration::from_millis(timeout_ms))
            } else {
                None
            };

            active.insert(
                key.clone(),
                ActiveOperation {
                    id,
                    operation: PendingOperation {
                        key: key.clone(),
                        op_type,
                        content_hash: hash,
                        description,
                        started_at: Utc::now(),
                        has_timeout: timeout_ms > 0,
                    },
                    started: Instant::now(),
                    timer,
                },
            );
            self.inner.publish(active.len(), false);

            info!(
                target: "codegraph::ingest::lock",
                key = %key,
                op_type = %op_type,
                timeout_ms,
                active = active.len(),
                "Operation acquired"
            );
            id
        };

        self.inner.notify_listener();
        (key, id)
    }

    /// Acquire and return a guard that releases the operation when dropped
    pub fn acquire_guard(
        &self,
        op_type: OperationType,
        identifier: &str,
        options: AcquireOptions,
    ) -> OperationGuard {
        let (key, id) = self.acquire_with_id(op_type, identifier, options);
        OperationGuard {
            lock: self.clone(),
            key: Some(key),
            id,
        }
    }

    /// Release an operation. Unknown keys are logged and ignored.
    pub fn release(&self, key: &str) -> bool {
        self.inner.remove(key, None, ReleaseReason::Released)
    }

    pub fn is_locked(&self) -> bool {
        !self.inner.active.lock().is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.lock().len()
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.inner.active.lock().contains_key(key)
    }

    pub fn operation(&self, key: &str) -> Option<PendingOperation> {
        self.inner
            .active
            .lock()
            .get(key)
            .map(|op| op.operation.clone())
    }

    /// Wait until no operations are active.
    ///
    /// Returns `true` immediately when unlocked, `true` when the lock becomes
    /// unlocked within `timeout`, `false` otherwise. Every waiter is woken by
    /// the same unlock, even if another operation starts right after it.
    pub async fn wait_for_unlock(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.unlock_tx.subscribe();
        let start_epoch = {
            let state = rx.borrow_and_update();
            if state.active == 0 {
                return true;
            }
            state.epoch
        };

        debug!(
            target: "codegraph::ingest::lock",
            timeout_ms = timeout.as_millis() as u64,
            "Waiting for operation lock"
        );

        let unlocked = rx.wait_for(|state| state.active == 0 || state.epoch > start_epoch);
        let outcome = tokio::time::timeout(timeout, unlocked)
            .await
            .map(|waited| waited.map(|_| ()));
        match outcome {
            Ok(Ok(())) => true,
            // Sender lives as long as the lock itself
            Ok(Err(_)) => true,
            Err(_) => {
                debug!(
                    target: "codegraph::ingest::lock",
                    "Timed out waiting for operation lock"
                );
                false
            }
        }
    }

    pub fn status(&self) -> LockStatus {
        self.inner.snapshot()
    }

    /// One-line summary of what is holding the lock
    pub fn description(&self) -> String {
        let status = self.status();
        if !status.is_locked {
            return "No active operations".to_string();
        }
        let parts: Vec<String> = status
            .operations
            .iter()
            .map(|op| format!("{} ({})", op.description, format_elapsed(op.elapsed)))
            .collect();
        format!(
            "{} active operation{}: {}",
            status.active_count,
            if status.active_count == 1 { "" } else { "s" },
            parts.join(", ")
        )
    }

    /// Message for query callers explaining why results may be stale, or
    /// `None` when the index is not being modified.
    pub fn blocking_message(&self) -> Option<String> {
        let status = self.status();
        let first = status.operations.first()?;
        let others = status.active_count - 1;
        let mut message = format!(
            "The code graph is being updated ({}, running for {}).",
            first.description,
            format_elapsed(first.elapsed)
        );
        if others > 0 {
            message.push_str(&format!(
                " {} more operation{} in progress.",
                others,
                if others == 1 { " is" } else { "s are" }
            ));
        }
        message.push_str(" Results may not reflect the latest changes.");
        Some(message)
    }
}

impl LockInner {
    fn arm_timeout(this: &Arc<Self>, key: String, id: u64, timeout: Duration) -> Option<JoinHandle<()>> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                target: "codegraph::ingest::lock",
                key = %key,
                "No Tokio runtime available, operation timeout disabled"
            );
            return None;
        };
        let weak: Weak<Self> = Arc::downgrade(this);
        Some(runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(&key, id, timeout);
            }
        }))
    }

    fn expire(&self, key: &str, id: u64, timeout: Duration) {
        // Only the acquisition that armed this timer may be expired
        if self.remove(key, Some(id), ReleaseReason::TimedOut) {
            debug!(
                target: "codegraph::ingest::lock",
                key = %key,
                timeout_ms = timeout.as_millis() as u64,
                "Operation timeout elapsed"
            );
        }
    }

    /// Remove `key`, or with `expected_id` only the acquisition carrying that
    /// id. The check and the removal happen under one guard.
    fn remove(&self, key: &str, expected_id: Option<u64>, reason: ReleaseReason) -> bool {
        {
            let mut active = self.active.lock();
            let current = active.get(key).map(|op| op.id);
            let op = match (current, expected_id) {
                (Some(current), Some(expected)) if current != expected => None,
                (Some(_), _) => active.remove(key),
                (None, _) => None,
            };
            let Some(op) = op else {
                if current.is_none() && expected_id.is_none() {
                    warn!(
                        target: "codegraph::ingest::lock",
                        key = %key,
                        "Release of unknown operation ignored"
                    );
                }
                return false;
            };

            if let Some(timer) = op.timer {
                if matches!(reason, ReleaseReason::Released) {
                    timer.abort();
                }
            }

            let remaining = active.len();
            match reason {
                ReleaseReason::Released => info!(
                    target: "codegraph::ingest::lock",
                    key = %key,
                    held_ms = op.started.elapsed().as_millis() as u64,
                    active = remaining,
                    "Operation released"
                ),
                ReleaseReason::TimedOut => warn!(
                    target: "codegraph::ingest::lock",
                    key = %key,
                    held_ms = op.started.elapsed().as_millis() as u64,
                    active = remaining,
                    "Operation force-released after timeout"
                ),
            }
            self.publish(remaining, remaining == 0);
        }

        self.notify_listener();
        true
    }

    fn publish(&self, active: usize, unlocked: bool) {
        self.unlock_tx.send_modify(|state| {
            state.active = active;
            if unlocked {
                state.epoch += 1;
            }
        });
    }

    fn snapshot(&self) -> LockStatus {
        let active = self.active.lock();
        let mut operations: Vec<OperationStatus> = active
            .values()
            .map(|op| OperationStatus {
                key: op.operation.key.clone(),
                op_type: op.operation.op_type,
                priority: op.operation.op_type.priority(),
                description: op.operation.description.clone(),
                started_at: op.operation.started_at,
                elapsed: op.started.elapsed(),
                has_timeout: op.operation.has_timeout,
            })
            .collect();
        operations.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.started_at.cmp(&b.started_at))
        });
        LockStatus {
            is_locked: !operations.is_empty(),
            active_count: operations.len(),
            operations,
        }
    }

    fn notify_listener(&self) {
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener(&self.snapshot());
        }
    }
}

/// Releases its operation when dropped
pub struct OperationGuard {
    lock: OperationLock,
    key: Option<String>,
    id: u64,
}

impl OperationGuard {
    pub fn key(&self) -> &str {
        self.key.as_deref().unwrap_or_default()
    }

    /// Release now instead of at drop
    pub fn release(mut self) -> bool {
        match self.key.take() {
            Some(key) => self.lock.inner.remove(&key, Some(self.id), ReleaseReason::Released),
            None => false,
        }
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        // After a forced release the key may belong to a newer acquisition
        if let Some(key) = self.key.take() {
            self.lock.inner.remove(&key, Some(self.id), ReleaseReason::Released);
        }
    }
}

/// First 16 hex digits of the SHA-256 of `identifier`
fn content_hash(identifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identifier.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{}s", secs)
    } else {
        format!("{}ms", elapsed.as_millis())
    }
}
