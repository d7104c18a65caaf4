//! Execution store selection.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use procura_core::{EngineConfig, ExecutionStore, InMemoryExecutionStore, SqliteExecutionStore, StorageBackend};

/// Store used by `simulate`: an explicit `--db` wins, then the configured backend.
pub fn for_simulation(config: &EngineConfig, db: Option<PathBuf>) -> anyhow::Result<Arc<dyn ExecutionStore>> {
    match (db, config.storage.backend) {
        (Some(path), _) => sqlite(path),
        (None, StorageBackend::Sqlite) => sqlite(config.storage.path.clone()),
        (None, StorageBackend::Memory) => Ok(Arc::new(InMemoryExecutionStore::new())),
    }
}

/// Store read by the inspection commands. Always SQLite, since an in-memory
/// store has nothing to inspect across processes.
pub fn for_inspection(config: &EngineConfig, db: Option<PathBuf>) -> anyhow::Result<Arc<dyn ExecutionStore>> {
    sqlite(db.unwrap_or_else(|| config.storage.path.clone()))
}

fn sqlite(path: PathBuf) -> anyhow::Result<Arc<dyn ExecutionStore>> {
    let store = SqliteExecutionStore::open(&path)
        .with_context(|| format!("failed to open execution database at {}", path.display()))?;
    Ok(Arc::new(store))
}
