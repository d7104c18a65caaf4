//! Persistent, key-indexed storage for execution records.
//!
//! The engine depends only on upsert/get/list-by-filter. Two backends are
//! provided: an in-memory map for tests and single-process use, and SQLite.

mod error;
mod memory;
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{ExecutionStatus, WorkflowExecution};

pub use error::{StorageError, StorageResult};
pub use memory::InMemoryExecutionStore;
pub use sqlite::SqliteExecutionStore;

/// Store for workflow execution records, keyed by workflow id.
///
/// Implementations must tolerate concurrent upserts from independent
/// workflows.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Inserts or replaces the record with the same id.
    async fn upsert_execution(&self, execution: &WorkflowExecution) -> StorageResult<()>;

    /// Fetches a record by workflow id.
    async fn get_execution(&self, workflow_id: &str) -> StorageResult<Option<WorkflowExecution>>;

    /// Lists records matching the filter, newest first.
    async fn list_executions(&self, filter: &ExecutionFilter) -> StorageResult<Vec<WorkflowExecution>>;
}

/// Selection criteria for [`ExecutionStore::list_executions`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionFilter {
    /// Match any of these statuses (empty = all).
    pub statuses: Vec<ExecutionStatus>,
    pub business_record_id: Option<String>,
    /// Inclusive lower bound on `started_at`.
    pub started_after: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `started_at`.
    pub started_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl ExecutionFilter {
    /// Filter that matches everything.
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = ExecutionStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    #[must_use]
    pub fn for_record(mut self, business_record_id: impl Into<String>) -> Self {
        self.business_record_id = Some(business_record_id.into());
        self
    }

    #[must_use]
    pub fn started_after(mut self, at: DateTime<Utc>) -> Self {
        self.started_after = Some(at);
        self
    }

    #[must_use]
    pub fn started_before(mut self, at: DateTime<Utc>) -> Self {
        self.started_before = Some(at);
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Checks a record against every criterion except `limit`.
    pub fn matches(&self, execution: &WorkflowExecution) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&execution.status) {
            return false;
        }
        if let Some(record) = &self.business_record_id {
            if execution.business_record_id.as_deref() != Some(record.as_str()) {
                return false;
            }
        }
        if self.started_after.is_some_and(|after| execution.started_at < after) {
            return false;
        }
        if self.started_before.is_some_and(|before| execution.started_at >= before) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matches_status_and_record() {
        let mut exec = WorkflowExecution::new("wf-1", None, Utc::now());
        exec.business_record_id = Some("rec-1".to_string());

        assert!(ExecutionFilter::all().matches(&exec));
        assert!(ExecutionFilter::all().for_record("rec-1").matches(&exec));
        assert!(!ExecutionFilter::all().for_record("rec-2").matches(&exec));
        assert!(
            !ExecutionFilter::all()
                .with_statuses([ExecutionStatus::Failed])
                .matches(&exec)
        );
    }

    #[test]
    fn test_filter_time_bounds() {
        let now = Utc::now();
        let exec = WorkflowExecution::new("wf-1", None, now);
        assert!(ExecutionFilter::all().started_after(now).matches(&exec));
        assert!(!ExecutionFilter::all().started_before(now).matches(&exec));
    }
}
