use serde::{Deserialize, Serialize};
use switchyard_agent::RuntimeConfig;
use switchyard_core::{RetryPolicy, SwitchyardError, SwitchyardResult};

/// Orchestrator timeouts and topics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Deadline for an agent's `initialize` during register or restart.
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    /// Deadline for a routed request's reply.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// How long `deregister` waits for in-flight work.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Topic the orchestrator receives replies on.
    #[serde(default = "default_reply_topic")]
    pub reply_topic: String,
    /// Worker pool settings applied to every registered agent.
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

fn default_startup_timeout_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_drain_timeout_ms() -> u64 {
    10_000
}

fn default_reply_topic() -> String {
    "orchestrator.replies".to_string()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            startup_timeout_ms: default_startup_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            reply_topic: default_reply_topic(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Reject values that would make routing or lifecycle calls meaningless.
    pub fn validate(&self) -> SwitchyardResult<()> {
        if self.startup_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err(SwitchyardError::Config(
                "startup_timeout_ms and request_timeout_ms must be > 0".into(),
            ));
        }
        if self.reply_topic.trim().is_empty() {
            return Err(SwitchyardError::Config("reply_topic must not be empty".into()));
        }
        if self.runtime.max_concurrency == 0 {
            return Err(SwitchyardError::Config(
                "runtime.max_concurrency must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Health monitor cadence, failure detection and restart budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,
    /// Consecutive missed checks tolerated before an agent is marked failed.
    #[serde(default = "default_miss_threshold")]
    pub miss_threshold: u32,
    /// Automatic restarts attempted before alerting.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,
    #[serde(default = "default_restart_backoff_max_ms")]
    pub restart_backoff_max_ms: u64,
    /// Topic that receives exhausted-restart alerts.
    #[serde(default = "default_alert_topic")]
    pub alert_topic: String,
}

fn default_interval_ms() -> u64 {
    5_000
}

fn default_check_timeout_ms() -> u64 {
    1_000
}

fn default_miss_threshold() -> u32 {
    2
}

fn default_max_restarts() -> u32 {
    3
}

fn default_restart_backoff_ms() -> u64 {
    500
}

fn default_restart_backoff_max_ms() -> u64 {
    30_000
}

fn default_alert_topic() -> String {
    "system.alerts".to_string()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            check_timeout_ms: default_check_timeout_ms(),
            miss_threshold: default_miss_threshold(),
            max_restarts: default_max_restarts(),
            restart_backoff_ms: default_restart_backoff_ms(),
            restart_backoff_max_ms: default_restart_backoff_max_ms(),
            alert_topic: default_alert_topic(),
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> SwitchyardResult<()> {
        if self.interval_ms == 0 || self.check_timeout_ms == 0 {
            return Err(SwitchyardError::Config(
                "interval_ms and check_timeout_ms must be > 0".into(),
            ));
        }
        if self.alert_topic.trim().is_empty() {
            return Err(SwitchyardError::Config("alert_topic must not be empty".into()));
        }
        Ok(())
    }

    /// Backoff schedule for restart attempts.
    pub fn restart_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_restarts,
            backoff_base_ms: self.restart_backoff_ms,
            backoff_max_ms: self.restart_backoff_max_ms,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        OrchestratorConfig::default().validate().unwrap();
        HealthConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let cfg: OrchestratorConfig = serde_json::from_str(r#"{"request_timeout_ms": 250}"#).unwrap();
        assert_eq!(cfg.request_timeout_ms, 250);
        assert_eq!(cfg.reply_topic, "orchestrator.replies");
        assert_eq!(cfg.runtime.max_concurrency, 4);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let cfg = OrchestratorConfig {
            request_timeout_ms: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(SwitchyardError::Config(_))));
    }

    #[test]
    fn test_restart_policy_backoff() {
        let cfg = HealthConfig {
            restart_backoff_ms: 100,
            restart_backoff_max_ms: 250,
            ..Default::default()
        };
        let policy = cfg.restart_policy();
        assert_eq!(policy.backoff(0).as_millis(), 100);
        assert_eq!(policy.backoff(1).as_millis(), 200);
        assert_eq!(policy.backoff(5).as_millis(), 250);
    }
}
