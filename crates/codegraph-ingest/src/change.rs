use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Grouping key for changes that do not belong to a registered project
pub const ORPHAN_PROJECT_KEY: &str = "_orphan";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

impl ChangeType {
    /// Merge priority: a pending change is only displaced by one of equal or
    /// higher priority.
    pub fn priority(self) -> u8 {
        match self {
            ChangeType::Created => 0,
            ChangeType::Updated => 1,
            ChangeType::Deleted => 2,
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeType::Created => write!(f, "created"),
            ChangeType::Updated => write!(f, "updated"),
            ChangeType::Deleted => write!(f, "deleted"),
        }
    }
}

/// A single file change waiting to be ingested. Identity is `path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub path: PathBuf,
    pub change_type: ChangeType,
    #[serde(default)]
    pub project_id: Option<String>,
}

impl ChangeRecord {
    pub fn new(path: impl Into<PathBuf>, change_type: ChangeType) -> Self {
        Self {
            path: path.into(),
            change_type,
            project_id: None,
        }
    }

    pub fn created(path: impl Into<PathBuf>) -> Self {
        Self::new(path, ChangeType::Created)
    }

    pub fn updated(path: impl Into<PathBuf>) -> Self {
        Self::new(path, ChangeType::Updated)
    }

    pub fn deleted(path: impl Into<PathBuf>) -> Self {
        Self::new(path, ChangeType::Deleted)
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Key used when grouping by project
    pub fn project_key(&self) -> &str {
        self.project_id.as_deref().unwrap_or(ORPHAN_PROJECT_KEY)
    }

    /// Whether `incoming` should displace `self` in the pending set.
    ///
    /// Higher priority always wins. At equal priority the latest record wins,
    /// except for `Created`, where the first record is kept.
    pub fn superseded_by(&self, incoming: &ChangeRecord) -> bool {
        let (current, next) = (self.change_type.priority(), incoming.change_type.priority());
        next > current || (next == current && self.change_type != ChangeType::Created)
    }
}

/// Pending changes grouped by project, built on demand
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub by_project: HashMap<String, Vec<ChangeRecord>>,
    pub created_at: DateTime<Utc>,
    pub total_changes: usize,
}

impl ChangeBatch {
    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = ChangeRecord>,
    {
        let by_project = group_by_project(records);
        let total_changes = by_project.values().map(Vec::len).sum();
        Self {
            by_project,
            created_at: Utc::now(),
            total_changes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_changes == 0
    }

    pub fn project_ids(&self) -> impl Iterator<Item = &str> {
        self.by_project.keys().map(String::as_str)
    }
}

/// Snapshot of the batcher queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    pub pending_count: usize,
    pub is_processing: bool,
    pub time_until_flush: Option<Duration>,
}

pub(crate) fn group_by_project<I>(records: I) -> HashMap<String, Vec<ChangeRecord>>
where
    I: IntoIterator<Item = ChangeRecord>,
{
    let mut grouped: HashMap<String, Vec<ChangeRecord>> = HashMap::new();
    for record in records {
        grouped
            .entry(record.project_key().to_string())
            .or_default()
            .push(record);
    }
    grouped
}
