//! Automated recovery plans for auto-recoverable failure categories.

use std::time::Duration;

use procura_core::{DiagnosticCategory, EngineConfig, RetryPolicyConfig, StepName};
use serde::Serialize;

/// What the orchestrator does to recover one failed phase.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecoveryPlan {
    /// Wait out what is left of the breaker cooldown, then retry the phase once.
    RetryAfterCooldown { step: StepName, cooldown: Duration },
    /// Retry the phase; a response wait gets a longer window.
    RetryWithExtendedDeadline { step: StepName, response_window: Option<Duration> },
    /// Retry the phase with a more patient delivery retry policy.
    RetryDelivery { step: StepName, policy: RetryPolicyConfig },
    /// Nudge non-responders, wait once more, then continue forward.
    NudgeAndExtend { extension: Duration },
}

impl RecoveryPlan {
    /// Plan for a diagnosed failure, or `None` when the category is not
    /// auto-recoverable.
    pub fn for_failure(category: DiagnosticCategory, step: StepName, config: &EngineConfig) -> Option<Self> {
        match category {
            DiagnosticCategory::CircuitBreakerOpen => {
                Some(Self::RetryAfterCooldown { step, cooldown: config.breaker.cooldown() })
            }
            DiagnosticCategory::TimeoutExceeded => {
                let response_window = (step == StepName::ResponseWait).then(|| {
                    config
                        .monitor
                        .response_window()
                        .mul_f64(config.recovery.timeout_extension_factor)
                });
                Some(Self::RetryWithExtendedDeadline { step, response_window })
            }
            DiagnosticCategory::DeliveryServiceFailure => {
                Some(Self::RetryDelivery { step, policy: config.recovery.delivery_retry.clone() })
            }
            DiagnosticCategory::NoResponses => {
                Some(Self::NudgeAndExtend { extension: config.recovery.response_extension() })
            }
            DiagnosticCategory::NoRecipientsAvailable
            | DiagnosticCategory::DeliverableGenerationFailure
            | DiagnosticCategory::Unclassified => None,
        }
    }

    /// Phase the forward path resumes from after the recovery action.
    pub fn resume_step(&self) -> StepName {
        match self {
            Self::RetryAfterCooldown { step, .. }
            | Self::RetryWithExtendedDeadline { step, .. }
            | Self::RetryDelivery { step, .. } => *step,
            Self::NudgeAndExtend { .. } => StepName::ResponseWait,
        }
    }

    /// Human-readable actions recorded on the execution.
    pub fn actions(&self) -> Vec<String> {
        match self {
            Self::RetryAfterCooldown { step, cooldown } => vec![
                format!("waited out circuit breaker cooldown of {}s", cooldown.as_secs()),
                format!("retried {step}"),
            ],
            Self::RetryWithExtendedDeadline { step, response_window } => match response_window {
                Some(window) => vec![format!("retried {step} with response window extended to {}s", window.as_secs())],
                None => vec![format!("retried {step}")],
            },
            Self::RetryDelivery { step, policy } => {
                vec![format!("retried {step} with up to {} delivery retries", policy.max_retries)]
            }
            Self::NudgeAndExtend { extension } => vec![
                "nudged non-responding recipients".to_string(),
                format!("extended response wait by {}s", extension.as_secs()),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plans_for_recoverable_categories() {
        let config = EngineConfig::default();

        let plan = RecoveryPlan::for_failure(DiagnosticCategory::CircuitBreakerOpen, StepName::Contact, &config).unwrap();
        assert_eq!(plan, RecoveryPlan::RetryAfterCooldown { step: StepName::Contact, cooldown: Duration::from_secs(300) });

        let plan = RecoveryPlan::for_failure(DiagnosticCategory::NoResponses, StepName::Generation, &config).unwrap();
        assert_eq!(plan.resume_step(), StepName::ResponseWait);
        assert_eq!(plan.actions().len(), 2);
    }

    #[test]
    fn test_timeout_extends_response_window() {
        let config = EngineConfig::default();
        let plan =
            RecoveryPlan::for_failure(DiagnosticCategory::TimeoutExceeded, StepName::ResponseWait, &config).unwrap();
        assert_eq!(
            plan,
            RecoveryPlan::RetryWithExtendedDeadline {
                step: StepName::ResponseWait,
                response_window: Some(Duration::from_secs(72 * 3600)),
            }
        );
    }

    #[test]
    fn test_unrecoverable_categories_have_no_plan() {
        let config = EngineConfig::default();
        assert!(
            RecoveryPlan::for_failure(DiagnosticCategory::NoRecipientsAvailable, StepName::Contact, &config).is_none()
        );
        assert!(RecoveryPlan::for_failure(DiagnosticCategory::Unclassified, StepName::Approval, &config).is_none());
    }
}
