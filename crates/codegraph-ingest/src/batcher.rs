// ABOUTME: Change batcher that collapses bursts of file change events into ingestion batches
// ABOUTME: Priority-biased per-path merging, quiet-period timer, size-triggered flush, single-flight handler

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::change::{group_by_project, ChangeBatch, ChangeRecord, QueueStatus};
use crate::config::BatcherConfig;

/// Receives flushed batches (the ingestion pipeline)
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn process_batch(&self, records: Vec<ChangeRecord>) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> BatchSink for F
where
    F: Fn(Vec<ChangeRecord>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn process_batch(&self, records: Vec<ChangeRecord>) -> anyhow::Result<()> {
        (self)(records).await
    }
}

/// Deduplicates change records per path and hands them to a [`BatchSink`]
/// after a quiet period or once `max_batch_size` records are pending.
///
/// Cloning yields another handle to the same queue. Timers run on the ambient
/// Tokio runtime.
#[derive(Clone)]
pub struct ChangeBatcher {
    inner: Arc<BatcherInner>,
}

struct BatcherInner {
    config: BatcherConfig,
    state: Mutex<BatcherState>,
    processing: AtomicBool,
    handler: RwLock<Option<Arc<dyn BatchSink>>>,
}

#[derive(Default)]
struct BatcherState {
    pending: HashMap<PathBuf, ChangeRecord>,
    timer: Option<FlushTimer>,
    next_timer_id: u64,
}

struct FlushTimer {
    id: u64,
    deadline: Instant,
    handle: JoinHandle<()>,
}

/// Clears the processing flag however the handler invocation ends
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ChangeBatcher {
    pub fn new(config: BatcherConfig) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                config,
                state: Mutex::new(BatcherState::default()),
                processing: AtomicBool::new(false),
                handler: RwLock::new(None),
            }),
        }
    }

    pub fn with_handler(config: BatcherConfig, handler: impl BatchSink + 'static) -> Self {
        let batcher = Self::new(config);
        batcher.set_handler(handler);
        batcher
    }

    /// Register the batch sink, replacing any previous one
    pub fn set_handler(&self, handler: impl BatchSink + 'static) {
        *self.inner.handler.write() = Some(Arc::new(handler));
    }

    pub fn config(&self) -> &BatcherConfig {
        &self.inner.config
    }

    /// Merge a change into the pending set
    pub fn add(&self, record: ChangeRecord) {
        let reached_max = {
            let mut state = self.inner.state.lock();
            match state.pending.entry(record.path.clone()) {
                Entry::Vacant(slot) => {
                    trace!(
                        target: "codegraph::ingest::batcher",
                        path = %record.path.display(),
                        change = %record.change_type,
                        "Queued change"
                    );
                    slot.insert(record);
                }
                Entry::Occupied(mut slot) => {
                    if slot.get().superseded_by(&record) {
                        trace!(
                            target: "codegraph::ingest::batcher",
                            path = %record.path.display(),
                            from = %slot.get().change_type,
                            to = %record.change_type,
                            "Merged change"
                        );
                        slot.insert(record);
                    }
                }
            }

            if state.timer.is_none() {
                BatcherInner::arm_timer(&self.inner, &mut state);
            }
            state.pending.len() >= self.inner.config.max_batch_size
        };

        if reached_max {
            debug!(
                target: "codegraph::ingest::batcher",
                max_batch_size = self.inner.config.max_batch_size,
                "Batch size reached, flushing immediately"
            );
            BatcherInner::spawn_flush(&self.inner);
        }
    }

    pub fn add_batch<I>(&self, records: I)
    where
        I: IntoIterator<Item = ChangeRecord>,
    {
        for record in records {
            self.add(record);
        }
    }

    /// Take and clear the pending set without invoking the handler
    pub fn flush(&self) -> Vec<ChangeRecord> {
        self.inner.take_pending()
    }

    /// Flush pending changes to the handler.
    ///
    /// A no-op returning `Ok(0)` while another handler invocation is running.
    /// Handler errors are returned to the caller.
    pub async fn flush_now(&self) -> anyhow::Result<usize> {
        BatcherInner::flush_now(&self.inner).await
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.inner.state.lock();
        QueueStatus {
            pending_count: state.pending.len(),
            is_processing: self.inner.processing.load(Ordering::Acquire),
            time_until_flush: state
                .timer
                .as_ref()
                .map(|t| t.deadline.saturating_duration_since(Instant::now())),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn pending_for(&self, path: impl AsRef<Path>) -> Option<ChangeRecord> {
        self.inner.state.lock().pending.get(path.as_ref()).cloned()
    }

    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::Acquire)
    }

    /// Pending changes grouped by project id (`_orphan` for none)
    pub fn changes_by_project(&self) -> HashMap<String, Vec<ChangeRecord>> {
        let records: Vec<ChangeRecord> = self.inner.state.lock().pending.values().cloned().collect();
        group_by_project(records)
    }

    pub fn create_batch(&self) -> ChangeBatch {
        let records: Vec<ChangeRecord> = self.inner.state.lock().pending.values().cloned().collect();
        ChangeBatch::from_records(records)
    }

    /// Cancel the flush timer; pending changes are kept
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        BatcherInner::cancel_timer(&mut state);
    }

    /// Cancel the flush timer and discard pending changes
    pub fn clear(&self) -> usize {
        let mut state = self.inner.state.lock();
        BatcherInner::cancel_timer(&mut state);
        let discarded = state.pending.len();
        state.pending.clear();
        if discarded > 0 {
            info!(
                target: "codegraph::ingest::batcher",
                discarded,
                "Cleared pending changes without flushing"
            );
        }
        discarded
    }
}

impl BatcherInner {
    fn take_pending(&self) -> Vec<ChangeRecord> {
        let mut state = self.state.lock();
        Self::cancel_timer(&mut state);
        state.pending.drain().map(|(_, record)| record).collect()
    }

    fn cancel_timer(state: &mut BatcherState) {
        if let Some(timer) = state.timer.take() {
            timer.handle.abort();
        }
    }

    fn arm_timer(this: &Arc<Self>, state: &mut BatcherState) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                target: "codegraph::ingest::batcher",
                "No Tokio runtime available, changes stay pending until flushed explicitly"
            );
            return;
        };

        state.next_timer_id += 1;
        let id = state.next_timer_id;
        let deadline = Instant::now() + this.config.batch_interval();
        let weak: Weak<Self> = Arc::downgrade(this);

        let handle = runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                let mut state = inner.state.lock();
                if state.timer.as_ref().map(|t| t.id) != Some(id) {
                    return;
                }
                state.timer = None;
            }
            if let Err(e) = Self::flush_now(&inner).await {
                error!(
                    target: "codegraph::ingest::batcher",
                    error = %e,
                    "Timed batch flush failed"
                );
            }
        });

        state.timer = Some(FlushTimer {
            id,
            deadline,
            handle,
        });
    }

    fn spawn_flush(this: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                target: "codegraph::ingest::batcher",
                "No Tokio runtime available for size-triggered flush"
            );
            return;
        };
        let inner = Arc::clone(this);
        runtime.spawn(async move {
            if let Err(e) = Self::flush_now(&inner).await {
                error!(
                    target: "codegraph::ingest::batcher",
                    error = %e,
                    "Size-triggered batch flush failed"
                );
            }
        });
    }

    async fn flush_now(this: &Arc<Self>) -> anyhow::Result<usize> {
        if this
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(
                target: "codegraph::ingest::batcher",
                "Batch handler already running, changes keep accumulating"
            );
            return Ok(0);
        }
        let guard = ProcessingGuard(&this.processing);

        let handler = this.handler.read().clone();
        let Some(handler) = handler else {
            warn!(
                target: "codegraph::ingest::batcher",
                pending = this.state.lock().pending.len(),
                "No batch handler registered, keeping changes pending"
            );
            return Ok(0);
        };

        let records = this.take_pending();
        if records.is_empty() {
            return Ok(0);
        }

        let count = records.len();
        let started = std::time::Instant::now();
        debug!(
            target: "codegraph::ingest::batcher",
            changes = count,
            "Flushing change batch"
        );

        let result = handler.process_batch(records).await;
        drop(guard);

        match &result {
            Ok(()) => info!(
                target: "codegraph::ingest::batcher",
                changes = count,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Batch processed"
            ),
            Err(e) => warn!(
                target: "codegraph::ingest::batcher",
                changes = count,
                error = %e,
                "Batch handler failed"
            ),
        }

        // Changes that arrived while the handler ran may have lost their timer
        // to the single-flight check above.
        {
            let mut state = this.state.lock();
            if !state.pending.is_empty() && state.timer.is_none() {
                Self::arm_timer(this, &mut state);
            }
        }

        result.map(|()| count)
    }
}
