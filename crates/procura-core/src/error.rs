//! Error types shared by the engine and its collaborators.

use std::path::PathBuf;

use thiserror::Error;

use crate::models::ExecutionStatus;

/// Error returned by any external collaborator (detection, contact, delivery, ...).
///
/// Carries an optional machine-readable code alongside the human-readable
/// message so that retry policies can match on either.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ServiceError {
    /// Machine-readable error code (e.g. `ETIMEDOUT`, `rate_limited`).
    pub code: Option<String>,
    /// Human-readable error message.
    pub message: String,
}

impl ServiceError {
    /// Creates an error with a message and no code.
    pub fn new(message: impl Into<String>) -> Self {
        Self { code: None, message: message.into() }
    }

    /// Creates an error with both a code and a message.
    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: Some(code.into()), message: message.into() }
    }

    /// Shorthand for a timeout-class failure.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::with_code("ETIMEDOUT", format!("timeout: {}", message.into()))
    }

    /// Shorthand for a network-class failure.
    pub fn network(message: impl Into<String>) -> Self {
        Self::with_code("ECONNRESET", format!("network error: {}", message.into()))
    }
}

/// Attempted an execution status change that the state machine forbids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid status transition {from} -> {to}")]
pub struct TransitionError {
    /// Status before the attempted change.
    pub from: ExecutionStatus,
    /// Requested status.
    pub to: ExecutionStatus,
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or does not match the schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The values parsed but are inconsistent.
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_error_display_uses_message() {
        let err = ServiceError::with_code("E42", "detector unavailable");
        assert_eq!(err.to_string(), "detector unavailable");
        assert_eq!(err.code.as_deref(), Some("E42"));
    }

    #[test]
    fn test_service_error_shorthands() {
        assert!(ServiceError::timeout("detector").message.contains("timeout"));
        assert!(ServiceError::network("mailer").message.contains("network"));
    }

    #[test]
    fn test_transition_error_display() {
        let err = TransitionError { from: ExecutionStatus::Completed, to: ExecutionStatus::Detecting };
        assert_eq!(err.to_string(), "invalid status transition completed -> detecting");
    }
}
