//! Diagnostic and alert vocabularies stored on executions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::StepName;

/// Severity shared by diagnoses and alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Medium,
    High,
    Critical,
}

/// Known failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticCategory {
    CircuitBreakerOpen,
    NoRecipientsAvailable,
    TimeoutExceeded,
    DeliveryServiceFailure,
    DeliverableGenerationFailure,
    NoResponses,
    /// Anything the classifier rules did not match.
    Unclassified,
}

impl DiagnosticCategory {
    /// Severity assigned to the category.
    pub fn severity(&self) -> Severity {
        match self {
            Self::NoRecipientsAvailable => Severity::Critical,
            Self::CircuitBreakerOpen
            | Self::DeliveryServiceFailure
            | Self::DeliverableGenerationFailure
            | Self::Unclassified => Severity::High,
            Self::TimeoutExceeded | Self::NoResponses => Severity::Medium,
        }
    }

    /// Whether an automated recovery attempt applies.
    pub fn is_auto_recoverable(&self) -> bool {
        matches!(
            self,
            Self::CircuitBreakerOpen
                | Self::TimeoutExceeded
                | Self::DeliveryServiceFailure
                | Self::NoResponses
        )
    }

    /// Canned remediation suggestion for the operator.
    pub fn remediation(&self) -> &'static str {
        match self {
            Self::CircuitBreakerOpen => {
                "Dependency is failing repeatedly; check its health and retry once the cooldown has elapsed"
            }
            Self::NoRecipientsAvailable => {
                "No eligible recipients matched this request; review recipient coverage for the record's category and region"
            }
            Self::TimeoutExceeded => {
                "Phase exceeded its deadline; retry with an extended deadline or check the dependency latency"
            }
            Self::DeliveryServiceFailure => {
                "Delivery service rejected or failed the send; verify the recipient address and delivery credentials"
            }
            Self::DeliverableGenerationFailure => {
                "Deliverable could not be generated; inspect the collected responses and the generation service logs"
            }
            Self::NoResponses => {
                "No recipient replied in time; nudge non-responders or widen the recipient pool"
            }
            Self::Unclassified => "Unexpected failure; inspect the error history and step log",
        }
    }

    /// Kebab-case identifier used in notifications.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CircuitBreakerOpen => "circuit-breaker-open",
            Self::NoRecipientsAvailable => "no-recipients-available",
            Self::TimeoutExceeded => "timeout-exceeded",
            Self::DeliveryServiceFailure => "delivery-service-failure",
            Self::DeliverableGenerationFailure => "deliverable-generation-failure",
            Self::NoResponses => "no-responses",
            Self::Unclassified => "unclassified",
        }
    }
}

/// Structured result of diagnosing a failed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub category: DiagnosticCategory,
    pub severity: Severity,
    pub auto_recoverable: bool,
    pub remediation: String,
    pub step: StepName,
    pub error: String,
    pub diagnosed_at: DateTime<Utc>,
}

impl Diagnosis {
    /// Builds a diagnosis with the category's canned attributes.
    pub fn new(
        category: DiagnosticCategory,
        step: StepName,
        error: impl Into<String>,
        diagnosed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            category,
            severity: category.severity(),
            auto_recoverable: category.is_auto_recoverable(),
            remediation: category.remediation().to_string(),
            step,
            error: error.into(),
            diagnosed_at,
        }
    }
}

/// Kinds of alert the telemetry engine raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    /// Active execution without progress for too long.
    Stuck,
    /// Rolling response rate below the floor.
    RecipientNonResponse,
    /// Downstream acceptance of deliverables below the floor.
    DecliningAcceptance,
    /// Share of failed executions above the ceiling.
    HighFailureRate,
}

impl AlertType {
    /// Snake-case identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stuck => "stuck",
            Self::RecipientNonResponse => "recipient_non_response",
            Self::DecliningAcceptance => "declining_acceptance",
            Self::HighFailureRate => "high_failure_rate",
        }
    }
}
