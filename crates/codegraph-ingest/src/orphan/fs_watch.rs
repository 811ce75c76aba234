// ABOUTME: Per-file watch primitive used by the orphan tracker
// ABOUTME: Wraps notify's recommended watcher and forwards simplified events over a Tokio channel

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::Result;

/// Filesystem event relevant to a watched file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathEvent {
    /// Content or metadata changed, or the file was (re)created
    Changed(PathBuf),
    /// The file was removed or renamed away
    Removed(PathBuf),
    /// The underlying watcher reported an error
    Error(String),
}

/// Something that can watch individual paths
pub trait PathWatcher: Send {
    fn add_path(&mut self, path: &Path) -> Result<()>;

    fn remove_path(&mut self, path: &Path) -> Result<()>;
}

/// Builds a watcher that reports into the given channel
pub type WatcherFactory =
    Arc<dyn Fn(mpsc::UnboundedSender<PathEvent>) -> Result<Box<dyn PathWatcher>> + Send + Sync>;

/// Factory producing [`NotifyPathWatcher`]s
pub fn notify_factory() -> WatcherFactory {
    Arc::new(|events| Ok(Box::new(NotifyPathWatcher::new(events)?) as Box<dyn PathWatcher>))
}

/// notify-backed watcher, one non-recursive watch per file
pub struct NotifyPathWatcher {
    watcher: RecommendedWatcher,
}

impl NotifyPathWatcher {
    pub fn new(events: mpsc::UnboundedSender<PathEvent>) -> Result<Self> {
        let watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    for path_event in translate_event(event) {
                        // Receiver gone means the tracker stopped
                        let _ = events.send(path_event);
                    }
                }
                Err(e) => {
                    error!(target: "codegraph::ingest::orphan", "File watcher error: {:?}", e);
                    let _ = events.send(PathEvent::Error(e.to_string()));
                }
            }
        })?;
        Ok(Self { watcher })
    }
}

impl PathWatcher for NotifyPathWatcher {
    fn add_path(&mut self, path: &Path) -> Result<()> {
        self.watcher.watch(path, RecursiveMode::NonRecursive)?;
        debug!(target: "codegraph::ingest::orphan", path = %path.display(), "Watching file");
        Ok(())
    }

    fn remove_path(&mut self, path: &Path) -> Result<()> {
        self.watcher.unwatch(path)?;
        debug!(target: "codegraph::ingest::orphan", path = %path.display(), "Stopped watching file");
        Ok(())
    }
}

fn translate_event(event: Event) -> Vec<PathEvent> {
    match event.kind {
        EventKind::Create(_) => event.paths.into_iter().map(PathEvent::Changed).collect(),
        // Atomic saves replace the file by renaming over it, which unlinks the
        // watched inode while the path stays valid
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)) => {
            event.paths.into_iter().map(classify_by_existence).collect()
        }
        EventKind::Modify(_) => event.paths.into_iter().map(PathEvent::Changed).collect(),
        _ => Vec::new(),
    }
}

fn classify_by_existence(path: PathBuf) -> PathEvent {
    if path.exists() {
        PathEvent::Changed(path)
    } else {
        PathEvent::Removed(path)
    }
}
