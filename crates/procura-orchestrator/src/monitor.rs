//! Response collection against a deadline.

use std::sync::Arc;
use std::time::Duration;

use procura_core::clock::elapsed_between;
use procura_core::{Clock, EarlyExitPolicy, MonitorSettings, ResponseCount, ResponseQuery};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, Result};
use crate::resilience::RetryPolicy;
use crate::telemetry::Telemetry;

/// Why the collection loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionReason {
    AllResponded,
    TimeoutWithPartialResponses,
    TimeoutReached,
    NoRecipients,
}

impl CollectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AllResponded => "all_responded",
            Self::TimeoutWithPartialResponses => "timeout_with_partial_responses",
            Self::TimeoutReached => "timeout_reached",
            Self::NoRecipients => "no_recipients",
        }
    }
}

/// Outcome of [`ResponseMonitor::collect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionResult {
    pub responses_received: u32,
    pub contacted: u32,
    pub timed_out: bool,
    pub reason: CollectionReason,
}

/// Polls for replies until everyone answered, the early-exit policy fires,
/// or the window closes.
pub struct ResponseMonitor {
    responses: Arc<dyn ResponseQuery>,
    telemetry: Arc<Telemetry>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    window: Duration,
    poll_interval: Duration,
    early_exit: EarlyExitPolicy,
}

impl std::fmt::Debug for ResponseMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseMonitor")
            .field("window", &self.window)
            .field("poll_interval", &self.poll_interval)
            .field("early_exit", &self.early_exit)
            .finish_non_exhaustive()
    }
}

impl ResponseMonitor {
    pub fn new(
        settings: &MonitorSettings,
        responses: Arc<dyn ResponseQuery>,
        telemetry: Arc<Telemetry>,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            responses,
            telemetry,
            retry,
            clock,
            window: settings.response_window(),
            poll_interval: settings.poll_interval(),
            early_exit: settings.early_exit,
        }
    }

    /// Overrides the early-exit policy.
    #[must_use]
    pub fn with_early_exit(mut self, policy: EarlyExitPolicy) -> Self {
        self.early_exit = policy;
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Collects responses over the configured window.
    pub async fn collect(&self, business_record_id: &str, workflow_id: &str) -> Result<CollectionResult> {
        self.collect_within(business_record_id, workflow_id, self.window).await
    }

    /// Collects responses over an explicit window.
    pub async fn collect_within(
        &self,
        business_record_id: &str,
        workflow_id: &str,
        window: Duration,
    ) -> Result<CollectionResult> {
        let started = self.clock.now();
        let max_iterations = self.max_iterations(window);
        let mut last = ResponseCount::default();

        for iteration in 1..=max_iterations {
            let count = self
                .retry
                .execute(|| self.responses.count_responses(business_record_id))
                .await
                .map_err(OrchestratorError::service("response-query"))?;
            last = count;

            if let Err(err) =
                self.telemetry.update_response_metrics(workflow_id, count.contacted, count.responded).await
            {
                warn!(workflow_id = %workflow_id, error = %err, "Could not record response metrics");
            }

            if count.contacted == 0 {
                return Ok(Self::finish(count, true, CollectionReason::NoRecipients));
            }
            if count.responded >= count.contacted {
                return Ok(Self::finish(count, false, CollectionReason::AllResponded));
            }

            let elapsed = elapsed_between(started, self.clock.now());
            if self.early_exit.should_exit(count.responded, count.contacted, elapsed, window) {
                return Ok(Self::finish(count, true, CollectionReason::TimeoutWithPartialResponses));
            }
            if elapsed >= window {
                return Ok(Self::finish(count, true, CollectionReason::TimeoutReached));
            }

            debug!(
                workflow_id = %workflow_id,
                iteration,
                responded = count.responded,
                contacted = count.contacted,
                elapsed_secs = elapsed.as_secs(),
                "Waiting for responses"
            );
            self.clock.sleep(self.poll_interval.min(window - elapsed)).await;
        }

        warn!(workflow_id = %workflow_id, max_iterations, "Response wait hit its iteration bound");
        Ok(Self::finish(last, true, CollectionReason::TimeoutReached))
    }

    /// Enough polls to cover the window, plus the final check at its end.
    fn max_iterations(&self, window: Duration) -> u64 {
        let interval = self.poll_interval.as_secs_f64().max(1.0);
        (window.as_secs_f64() / interval).ceil() as u64 + 1
    }

    fn finish(count: ResponseCount, timed_out: bool, reason: CollectionReason) -> CollectionResult {
        info!(
            responded = count.responded,
            contacted = count.contacted,
            timed_out,
            reason = reason.as_str(),
            "Response collection finished"
        );
        CollectionResult {
            responses_received: count.responded,
            contacted: count.contacted,
            timed_out,
            reason,
        }
    }
}
