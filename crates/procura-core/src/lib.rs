//! Procura Core - domain model and persistence for the procura workflow engine.
//!
//! This crate provides:
//! - The execution record, its status machine and step history
//! - Narrow collaborator ports (detection, contact, responses, delivery, tasks)
//! - A [`Clock`] abstraction so long waits can be fast-forwarded
//! - Engine configuration loaded from TOML
//! - In-memory and SQLite execution stores
//!
//! # Example
//!
//! ```rust,no_run
//! use procura_core::{EngineConfig, InMemoryExecutionStore};
//!
//! let config = EngineConfig::from_env()?;
//! let store = InMemoryExecutionStore::new();
//! # Ok::<(), procura_core::ConfigError>(())
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod models;
pub mod ports;
pub mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    BreakerSettings, EarlyExitPolicy, EngineConfig, MonitorSettings, OrchestratorSettings,
    RecoverySettings, RetryPolicyConfig, StepThresholds, StorageBackend, StorageSettings,
    TelemetrySettings,
};
pub use error::{ConfigError, ServiceError, TransitionError};
pub use models::{
    AlertContext, AlertType, BottleneckContext, DeliverableRef, DiagnosticCategory,
    DiagnosticContext, Diagnosis, ErrorEntry, ExecutionStatus, FailureContext, FailureReason,
    RecoveryContext, ResponseMetrics, Severity, StepName, StepStatus, WorkflowExecution,
    WorkflowOutcome, WorkflowStep,
};
pub use ports::{
    Artifact, BusinessRecords, ContactService, DeliverableService, DeliveryReceipt,
    DeliveryService, Detection, DetectionService, HumanTask, NotificationSink, RecordStatus,
    Response, ResponseCount, ResponseQuery, ServiceResult, TaskPriority, TaskSink,
    TracingNotifier,
};
pub use storage::{
    ExecutionFilter, ExecutionStore, InMemoryExecutionStore, SqliteExecutionStore, StorageError,
    StorageResult,
};
