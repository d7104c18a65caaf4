//! In-memory execution store.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ExecutionFilter, ExecutionStore, StorageResult};
use crate::models::WorkflowExecution;

/// Execution store backed by a `HashMap` behind an async `RwLock`.
#[derive(Clone, Default)]
pub struct InMemoryExecutionStore {
    records: Arc<RwLock<HashMap<String, WorkflowExecution>>>,
}

impl fmt::Debug for InMemoryExecutionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryExecutionStore")
            .field("record_count", &self.records.try_read().map(|r| r.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl InMemoryExecutionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn upsert_execution(&self, execution: &WorkflowExecution) -> StorageResult<()> {
        let mut records = self.records.write().await;
        records.insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn get_execution(&self, workflow_id: &str) -> StorageResult<Option<WorkflowExecution>> {
        let records = self.records.read().await;
        Ok(records.get(workflow_id).cloned())
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> StorageResult<Vec<WorkflowExecution>> {
        let records = self.records.read().await;
        let mut matching: Vec<WorkflowExecution> =
            records.values().filter(|exec| filter.matches(exec)).cloned().collect();
        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if let Some(limit) = filter.limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExecutionStatus;
    use chrono::Utc;

    #[tokio::test]
    async fn test_upsert_replaces_by_id() {
        let store = InMemoryExecutionStore::new();
        let mut exec = WorkflowExecution::new("wf-1", None, Utc::now());
        store.upsert_execution(&exec).await.unwrap();

        exec.transition_to(ExecutionStatus::Detecting).unwrap();
        store.upsert_execution(&exec).await.unwrap();

        assert_eq!(store.len().await, 1);
        let loaded = store.get_execution("wf-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Detecting);
    }

    #[tokio::test]
    async fn test_list_newest_first_with_limit() {
        let store = InMemoryExecutionStore::new();
        let base = Utc::now();
        for n in 0..5 {
            let exec = WorkflowExecution::new(format!("wf-{n}"), None, base + chrono::Duration::seconds(n));
            store.upsert_execution(&exec).await.unwrap();
        }

        let listed = store.list_executions(&ExecutionFilter::all().limit(2)).await.unwrap();
        let ids: Vec<_> = listed.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["wf-4", "wf-3"]);
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let store = InMemoryExecutionStore::new();
        assert!(store.get_execution("nope").await.unwrap().is_none());
    }
}
