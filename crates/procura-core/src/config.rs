//! Engine configuration.
//!
//! Every field carries a serde default, so an empty TOML file yields the
//! stock tuning. Durations are expressed in whole units (`_ms`, `_secs`,
//! `_hours`) and exposed as [`std::time::Duration`] through accessors.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::models::StepName;

/// Environment variable naming a config file.
pub const CONFIG_ENV_VAR: &str = "PROCURA_CONFIG";

/// Orchestrator identity and gating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Name used on notifications.
    pub agent_name: String,
    /// Owner assigned to escalation tasks.
    pub escalation_owner: String,
    /// Below this confidence a trigger is not applicable.
    pub min_confidence: f64,
    /// Above this confidence the workflow proceeds without review.
    pub auto_proceed_confidence: f64,
    /// Days between delivery and the scheduled follow-up.
    pub follow_up_days: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            agent_name: "procura".to_string(),
            escalation_owner: "operations".to_string(),
            min_confidence: 0.5,
            auto_proceed_confidence: 0.8,
            follow_up_days: 3,
        }
    }
}

/// Circuit breaker tuning, shared by every dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

impl BreakerSettings {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self { failure_threshold: 3, cooldown_secs: 300 }
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Fraction of the delay applied as symmetric jitter.
    pub jitter_fraction: f64,
    /// Error codes or message substrings treated as retryable. Empty means
    /// every error is retryable.
    pub retryable_errors: Vec<String>,
}

impl RetryPolicyConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_fraction: 0.1,
            retryable_errors: vec![
                "ETIMEDOUT".to_string(),
                "ECONNRESET".to_string(),
                "ECONNREFUSED".to_string(),
                "EAI_AGAIN".to_string(),
                "rate limit".to_string(),
                "unavailable".to_string(),
            ],
        }
    }
}

/// Early return from the response wait once enough replies arrived late
/// enough in the window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EarlyExitPolicy {
    pub min_response_ratio: f64,
    pub min_elapsed_ratio: f64,
}

impl EarlyExitPolicy {
    /// Whether the wait may end now.
    pub fn should_exit(&self, responded: u32, contacted: u32, elapsed: Duration, window: Duration) -> bool {
        if contacted == 0 || window.is_zero() {
            return false;
        }
        let response_ratio = f64::from(responded) / f64::from(contacted);
        let elapsed_ratio = elapsed.as_secs_f64() / window.as_secs_f64();
        response_ratio >= self.min_response_ratio && elapsed_ratio >= self.min_elapsed_ratio
    }
}

impl Default for EarlyExitPolicy {
    fn default() -> Self {
        Self { min_response_ratio: 0.5, min_elapsed_ratio: 0.75 }
    }
}

/// Response collection window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub response_window_secs: u64,
    pub poll_interval_secs: u64,
    pub early_exit: EarlyExitPolicy,
}

impl MonitorSettings {
    pub fn response_window(&self) -> Duration {
        Duration::from_secs(self.response_window_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self { response_window_secs: 48 * 3600, poll_interval_secs: 3600, early_exit: EarlyExitPolicy::default() }
    }
}

/// Per-phase duration thresholds in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepThresholds {
    pub detection_secs: u64,
    pub contact_secs: u64,
    pub response_wait_secs: u64,
    pub generation_secs: u64,
    pub approval_secs: u64,
    pub send_secs: u64,
}

impl StepThresholds {
    pub fn for_step(&self, step: StepName) -> Duration {
        let secs = match step {
            StepName::Detection => self.detection_secs,
            StepName::Contact => self.contact_secs,
            StepName::ResponseWait => self.response_wait_secs,
            StepName::Generation => self.generation_secs,
            StepName::Approval => self.approval_secs,
            StepName::Send => self.send_secs,
        };
        Duration::from_secs(secs)
    }
}

impl Default for StepThresholds {
    fn default() -> Self {
        Self {
            detection_secs: 5 * 60,
            contact_secs: 10 * 60,
            response_wait_secs: 48 * 3600,
            generation_secs: 30 * 60,
            approval_secs: 4 * 3600,
            send_secs: 5 * 60,
        }
    }
}

/// Bottleneck, alerting and trend tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub thresholds: StepThresholds,
    /// Time without progress after which an active execution is stuck.
    pub stuck_after_hours: u64,
    /// Alert when the rolling response rate drops below this.
    pub response_rate_floor: f64,
    /// Alert when deliverable acceptance drops below this.
    pub acceptance_floor: f64,
    /// Alert when the failure share of recent executions exceeds this.
    pub failure_rate_ceiling: f64,
    pub trend_window_days: u32,
    /// Executions needed in the window before a trend alert can fire.
    pub min_sample: usize,
    pub error_history_bound: usize,
}

impl TelemetrySettings {
    pub fn stuck_after(&self) -> Duration {
        Duration::from_secs(self.stuck_after_hours * 3600)
    }

    pub fn trend_window(&self) -> Duration {
        Duration::from_secs(u64::from(self.trend_window_days) * 24 * 3600)
    }
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            thresholds: StepThresholds::default(),
            stuck_after_hours: 24,
            response_rate_floor: 0.5,
            acceptance_floor: 0.3,
            failure_rate_ceiling: 0.25,
            trend_window_days: 7,
            min_sample: 3,
            error_history_bound: 10,
        }
    }
}

/// Automated recovery tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    /// Extra wait granted after nudging non-responders.
    pub response_extension_hours: u64,
    /// Multiplier on the response window when retrying a timed-out wait.
    pub timeout_extension_factor: f64,
    /// Retry policy used when recovering a failed delivery. Retries every
    /// error by default.
    pub delivery_retry: RetryPolicyConfig,
}

impl RecoverySettings {
    pub fn response_extension(&self) -> Duration {
        Duration::from_secs(self.response_extension_hours * 3600)
    }
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            response_extension_hours: 24,
            timeout_extension_factor: 1.5,
            delivery_retry: RetryPolicyConfig {
                max_retries: 5,
                initial_delay_ms: 2000,
                max_delay_ms: 60_000,
                retryable_errors: Vec::new(),
                ..RetryPolicyConfig::default()
            },
        }
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    pub path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self { backend: StorageBackend::Memory, path: PathBuf::from("procura.db") }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub orchestrator: OrchestratorSettings,
    pub breaker: BreakerSettings,
    pub retry: RetryPolicyConfig,
    pub monitor: MonitorSettings,
    pub telemetry: TelemetrySettings,
    pub recovery: RecoverySettings,
    pub storage: StorageSettings,
}

impl EngineConfig {
    /// Parses and validates configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` for malformed TOML and
    /// `ConfigError::Invalid` for inconsistent values.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        debug!(path = %path.display(), "Loaded engine config");
        Self::from_toml_str(&text)
    }

    /// Loads from the file named by `PROCURA_CONFIG`, or defaults when unset.
    ///
    /// # Errors
    ///
    /// Returns an error if the named file cannot be loaded.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => Self::load(PathBuf::from(path)),
            None => Ok(Self::default()),
        }
    }

    /// Rejects inconsistent gates, ratios and windows.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let gates = &self.orchestrator;
        if !(0.0..=1.0).contains(&gates.min_confidence) || !(0.0..=1.0).contains(&gates.auto_proceed_confidence) {
            return Err(ConfigError::Invalid("confidence gates must lie in [0, 1]".to_string()));
        }
        if gates.min_confidence > gates.auto_proceed_confidence {
            return Err(ConfigError::Invalid(
                "min_confidence must not exceed auto_proceed_confidence".to_string(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid("breaker failure_threshold must be at least 1".to_string()));
        }
        validate_retry("retry", &self.retry)?;
        validate_retry("recovery.delivery_retry", &self.recovery.delivery_retry)?;
        if self.monitor.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("monitor poll_interval_secs must be positive".to_string()));
        }
        let early = &self.monitor.early_exit;
        for (name, ratio) in [
            ("early_exit.min_response_ratio", early.min_response_ratio),
            ("early_exit.min_elapsed_ratio", early.min_elapsed_ratio),
            ("telemetry.response_rate_floor", self.telemetry.response_rate_floor),
            ("telemetry.acceptance_floor", self.telemetry.acceptance_floor),
            ("telemetry.failure_rate_ceiling", self.telemetry.failure_rate_ceiling),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(ConfigError::Invalid(format!("{name} must lie in [0, 1]")));
            }
        }
        if self.telemetry.error_history_bound == 0 {
            return Err(ConfigError::Invalid("telemetry error_history_bound must be positive".to_string()));
        }
        if self.recovery.timeout_extension_factor < 1.0 {
            return Err(ConfigError::Invalid("recovery timeout_extension_factor must be >= 1".to_string()));
        }
        Ok(())
    }
}

fn validate_retry(section: &str, retry: &RetryPolicyConfig) -> Result<(), ConfigError> {
    if retry.backoff_multiplier < 1.0 {
        return Err(ConfigError::Invalid(format!("{section}.backoff_multiplier must be >= 1")));
    }
    if !(0.0..=1.0).contains(&retry.jitter_fraction) {
        return Err(ConfigError::Invalid(format!("{section}.jitter_fraction must lie in [0, 1]")));
    }
    if retry.initial_delay_ms > retry.max_delay_ms {
        return Err(ConfigError::Invalid(format!("{section}.initial_delay_ms exceeds max_delay_ms")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.cooldown(), Duration::from_secs(300));
        assert_eq!(config.monitor.response_window(), Duration::from_secs(48 * 3600));
        assert_eq!(config.orchestrator.follow_up_days, 3);
    }

    #[test]
    fn test_default_step_thresholds() {
        let thresholds = StepThresholds::default();
        assert_eq!(thresholds.for_step(StepName::Contact), Duration::from_secs(600));
        assert_eq!(thresholds.for_step(StepName::Approval), Duration::from_secs(4 * 3600));
    }

    #[test]
    fn test_partial_sections_override() {
        let config = EngineConfig::from_toml_str(
            r#"
            [retry]
            max_retries = 5

            [monitor.early_exit]
            min_response_ratio = 0.6

            [storage]
            backend = "sqlite"
            path = "/tmp/executions.db"
            "#,
        )
        .unwrap();

        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.initial_delay_ms, 1000);
        assert!((config.monitor.early_exit.min_response_ratio - 0.6).abs() < f64::EPSILON);
        assert!((config.monitor.early_exit.min_elapsed_ratio - 0.75).abs() < f64::EPSILON);
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
    }

    #[test]
    fn test_inverted_gates_rejected() {
        let err = EngineConfig::from_toml_str(
            r#"
            [orchestrator]
            min_confidence = 0.9
            auto_proceed_confidence = 0.8
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let err = EngineConfig::from_toml_str("[retry\nmax_retries = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[breaker]\nfailure_threshold = 5").unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.breaker.failure_threshold, 5);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = EngineConfig::load("/nonexistent/procura.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_early_exit_policy() {
        let policy = EarlyExitPolicy::default();
        let window = Duration::from_secs(48 * 3600);
        assert!(policy.should_exit(2, 4, Duration::from_secs(36 * 3600), window));
        assert!(!policy.should_exit(2, 4, Duration::from_secs(35 * 3600), window));
        assert!(!policy.should_exit(1, 4, Duration::from_secs(40 * 3600), window));
        assert!(!policy.should_exit(0, 0, window, window));
    }
}
