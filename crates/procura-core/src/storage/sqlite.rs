//! SQLite-backed execution store.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use tracing::{debug, info};

use super::{ExecutionFilter, ExecutionStore, StorageError, StorageResult};
use crate::models::WorkflowExecution;

/// Execution store persisting one row per execution.
///
/// Query columns are kept alongside the full JSON record so filters run in
/// SQL while the record shape stays free to evolve.
pub struct SqliteExecutionStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteExecutionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteExecutionStore").finish_non_exhaustive()
    }
}

impl SqliteExecutionStore {
    /// Opens (or creates) a database file and initializes the schema.
    ///
    /// # Errors
    /// * `StorageError::Database` - If the connection or schema creation fails
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Opens an in-memory database for testing.
    ///
    /// # Errors
    /// * `StorageError::Database` - If the connection fails
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> StorageResult<Self> {
        init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }
}

fn init_schema(conn: &Connection) -> StorageResult<()> {
    info!("Initializing execution store schema");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS workflow_executions (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            business_record_id TEXT,
            started_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            record_json TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_executions_status ON workflow_executions(status);
        CREATE INDEX IF NOT EXISTS idx_executions_record ON workflow_executions(business_record_id);
        CREATE INDEX IF NOT EXISTS idx_executions_started ON workflow_executions(started_at);
        "#,
    )?;

    Ok(())
}

/// Fixed-width timestamp text so lexical order matches time order.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode(json: &str) -> StorageResult<WorkflowExecution> {
    Ok(serde_json::from_str(json)?)
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn upsert_execution(&self, execution: &WorkflowExecution) -> StorageResult<()> {
        let json = serde_json::to_string(execution)?;
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO workflow_executions
                (id, status, business_record_id, started_at, updated_at, record_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                business_record_id = excluded.business_record_id,
                started_at = excluded.started_at,
                updated_at = excluded.updated_at,
                record_json = excluded.record_json
            "#,
            params![
                execution.id,
                execution.status.as_str(),
                execution.business_record_id,
                timestamp(execution.started_at),
                timestamp(execution.updated_at),
                json,
            ],
        )?;
        debug!(workflow_id = %execution.id, status = %execution.status, "Execution persisted");
        Ok(())
    }

    async fn get_execution(&self, workflow_id: &str) -> StorageResult<Option<WorkflowExecution>> {
        let conn = self.lock()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT record_json FROM workflow_executions WHERE id = ?1",
                params![workflow_id],
                |row| row.get(0),
            )
            .optional()?;
        json.as_deref().map(decode).transpose()
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> StorageResult<Vec<WorkflowExecution>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<String> = Vec::new();

        if !filter.statuses.is_empty() {
            let placeholders: Vec<String> = filter
                .statuses
                .iter()
                .map(|status| {
                    values.push(status.as_str().to_string());
                    format!("?{}", values.len())
                })
                .collect();
            clauses.push(format!("status IN ({})", placeholders.join(", ")));
        }
        if let Some(record) = &filter.business_record_id {
            values.push(record.clone());
            clauses.push(format!("business_record_id = ?{}", values.len()));
        }
        if let Some(after) = filter.started_after {
            values.push(timestamp(after));
            clauses.push(format!("started_at >= ?{}", values.len()));
        }
        if let Some(before) = filter.started_before {
            values.push(timestamp(before));
            clauses.push(format!("started_at < ?{}", values.len()));
        }

        let mut sql = String::from("SELECT record_json FROM workflow_executions");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY started_at DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))?;

        let mut executions = Vec::new();
        for row in rows {
            executions.push(decode(&row?)?);
        }
        Ok(executions)
    }
}
