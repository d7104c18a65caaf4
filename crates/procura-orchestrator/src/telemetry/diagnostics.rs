//! Failure classification.
//!
//! A prioritized list of `(predicate, category)` rules. The first matching
//! rule wins; nothing matching yields [`DiagnosticCategory::Unclassified`].

use procura_core::{DiagnosticCategory, FailureReason, StepName};

/// Facts about a failure available to classification rules.
#[derive(Debug, Clone, Copy)]
pub struct FailureSignal<'a> {
    pub reason: Option<FailureReason>,
    pub step: Option<StepName>,
    pub message: &'a str,
}

impl<'a> FailureSignal<'a> {
    pub fn new(reason: Option<FailureReason>, step: Option<StepName>, message: &'a str) -> Self {
        Self { reason, step, message }
    }

    fn mentions(&self, needles: &[&str]) -> bool {
        let message = self.message.to_lowercase();
        needles.iter().any(|needle| message.contains(needle))
    }
}

/// Rule predicate.
pub type Predicate = fn(&FailureSignal<'_>) -> bool;

/// Ordered failure classifier.
#[derive(Debug, Clone)]
pub struct FailureClassifier {
    rules: Vec<(Predicate, DiagnosticCategory)>,
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self {
            rules: vec![
                (is_circuit_open, DiagnosticCategory::CircuitBreakerOpen),
                (is_no_recipients, DiagnosticCategory::NoRecipientsAvailable),
                (is_no_responses, DiagnosticCategory::NoResponses),
                (is_timeout, DiagnosticCategory::TimeoutExceeded),
                (is_delivery_failure, DiagnosticCategory::DeliveryServiceFailure),
                (is_generation_failure, DiagnosticCategory::DeliverableGenerationFailure),
            ],
        }
    }
}

impl FailureClassifier {
    /// Classifier with no rules; everything is unclassified.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Appends a rule at the lowest priority.
    #[must_use]
    pub fn with_rule(mut self, predicate: Predicate, category: DiagnosticCategory) -> Self {
        self.rules.push((predicate, category));
        self
    }

    pub fn classify(&self, signal: &FailureSignal<'_>) -> DiagnosticCategory {
        self.rules
            .iter()
            .find(|(predicate, _)| predicate(signal))
            .map_or(DiagnosticCategory::Unclassified, |(_, category)| *category)
    }
}

fn is_circuit_open(signal: &FailureSignal<'_>) -> bool {
    signal.reason == Some(FailureReason::CircuitOpen) || signal.mentions(&["circuit breaker open", "circuit open"])
}

fn is_no_recipients(signal: &FailureSignal<'_>) -> bool {
    signal.reason == Some(FailureReason::NoEligibleRecipients)
        || signal.mentions(&["no eligible recipients", "no recipients"])
}

fn is_no_responses(signal: &FailureSignal<'_>) -> bool {
    signal.reason == Some(FailureReason::NoResponsesReceived) || signal.mentions(&["no responses"])
}

fn is_timeout(signal: &FailureSignal<'_>) -> bool {
    signal.reason == Some(FailureReason::Timeout) || signal.mentions(&["timeout", "timed out", "deadline exceeded"])
}

/// Only the send itself. Bookkeeping after a successful send also fails in
/// the send step but must not trigger a resend.
fn is_delivery_failure(signal: &FailureSignal<'_>) -> bool {
    signal.reason == Some(FailureReason::DeliveryFailed)
        || signal.mentions(&["delivery-send", "delivery rejected", "send failed"])
}

fn is_generation_failure(signal: &FailureSignal<'_>) -> bool {
    signal.reason == Some(FailureReason::GenerationFailed)
        || signal.step == Some(StepName::Generation)
        || signal.mentions(&["generat"])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(reason: Option<FailureReason>, step: Option<StepName>, message: &str) -> DiagnosticCategory {
        FailureClassifier::default().classify(&FailureSignal::new(reason, step, message))
    }

    #[test]
    fn test_reason_codes_map_to_categories() {
        assert_eq!(
            classify(Some(FailureReason::CircuitOpen), Some(StepName::Send), "x"),
            DiagnosticCategory::CircuitBreakerOpen
        );
        assert_eq!(
            classify(Some(FailureReason::NoEligibleRecipients), Some(StepName::Contact), "x"),
            DiagnosticCategory::NoRecipientsAvailable
        );
        assert_eq!(
            classify(Some(FailureReason::NoResponsesReceived), Some(StepName::Generation), "x"),
            DiagnosticCategory::NoResponses
        );
    }

    #[test]
    fn test_message_patterns() {
        assert_eq!(classify(None, None, "upstream timed out"), DiagnosticCategory::TimeoutExceeded);
        assert_eq!(classify(None, None, "Delivery rejected: bounced"), DiagnosticCategory::DeliveryServiceFailure);
        assert_eq!(classify(None, None, "generator crashed"), DiagnosticCategory::DeliverableGenerationFailure);
        assert_eq!(classify(None, None, "disk full"), DiagnosticCategory::Unclassified);
    }

    #[test]
    fn test_priority_order() {
        // A timeout during send is a timeout, not a delivery failure.
        assert_eq!(
            classify(Some(FailureReason::Timeout), Some(StepName::Send), "send timeout"),
            DiagnosticCategory::TimeoutExceeded
        );
        // Zero responses surfaces in the generation step but is not a generation failure.
        assert_eq!(
            classify(Some(FailureReason::NoResponsesReceived), Some(StepName::Generation), "no responses"),
            DiagnosticCategory::NoResponses
        );
    }

    #[test]
    fn test_send_step_bookkeeping_is_not_a_delivery_failure() {
        assert_eq!(
            classify(Some(FailureReason::StepError), Some(StepName::Send), "business-records call failed: calendar offline"),
            DiagnosticCategory::Unclassified
        );
        assert_eq!(
            classify(Some(FailureReason::DeliveryFailed), Some(StepName::Send), "delivery-send call failed: bounced"),
            DiagnosticCategory::DeliveryServiceFailure
        );
        assert_eq!(
            classify(Some(FailureReason::StepError), Some(StepName::Send), "delivery rejected: mailbox full"),
            DiagnosticCategory::DeliveryServiceFailure
        );
    }

    #[test]
    fn test_custom_rule_is_additive() {
        fn is_disk_full(signal: &FailureSignal<'_>) -> bool {
            signal.message.contains("disk full")
        }
        let classifier = FailureClassifier::default().with_rule(is_disk_full, DiagnosticCategory::TimeoutExceeded);
        let signal = FailureSignal::new(None, None, "disk full");
        assert_eq!(classifier.classify(&signal), DiagnosticCategory::TimeoutExceeded);
        assert_eq!(FailureClassifier::empty().classify(&signal), DiagnosticCategory::Unclassified);
    }
}
