use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_role_timeout_ms() -> u64 {
    30_000
}

fn default_confidence_threshold() -> f64 {
    0.5
}

fn default_approval_threshold() -> f64 {
    0.7
}

fn default_checkpoint_interval_ms() -> u64 {
    10_000
}

fn default_checkpoint_history() -> usize {
    10
}

fn default_health_probe_timeout_ms() -> u64 {
    2_000
}

fn default_escalation_timeout_ms() -> u64 {
    5_000
}

fn default_breaker_failure_threshold() -> u32 {
    5
}

fn default_breaker_recovery_ms() -> u64 {
    30_000
}

fn default_archive_limit() -> usize {
    100
}

/// Coordinator tunables. Per-role fallback chains override the role
/// timeout and confidence threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Timeout for roles without a fallback chain.
    #[serde(default = "default_role_timeout_ms")]
    pub role_timeout_ms: u64,
    /// Degraded-confidence threshold for roles without a fallback chain.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// Recorded on decisions made without a quorum.
    #[serde(default = "default_approval_threshold")]
    pub approval_threshold: f64,
    #[serde(default = "default_checkpoint_interval_ms")]
    pub checkpoint_interval_ms: u64,
    /// Snapshots kept per role and incident.
    #[serde(default = "default_checkpoint_history")]
    pub checkpoint_history: usize,
    #[serde(default = "default_health_probe_timeout_ms")]
    pub health_probe_timeout_ms: u64,
    /// Upper bound on one escalation fan-out, on top of the per-channel bound.
    #[serde(default = "default_escalation_timeout_ms")]
    pub escalation_timeout_ms: u64,
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,
    #[serde(default = "default_breaker_recovery_ms")]
    pub breaker_recovery_ms: u64,
    /// Completed workflows kept for status and timeline queries.
    #[serde(default = "default_archive_limit")]
    pub archive_limit: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            role_timeout_ms: default_role_timeout_ms(),
            confidence_threshold: default_confidence_threshold(),
            approval_threshold: default_approval_threshold(),
            checkpoint_interval_ms: default_checkpoint_interval_ms(),
            checkpoint_history: default_checkpoint_history(),
            health_probe_timeout_ms: default_health_probe_timeout_ms(),
            escalation_timeout_ms: default_escalation_timeout_ms(),
            breaker_failure_threshold: default_breaker_failure_threshold(),
            breaker_recovery_ms: default_breaker_recovery_ms(),
            archive_limit: default_archive_limit(),
        }
    }
}

impl CoordinatorConfig {
    pub fn role_timeout(&self) -> Duration {
        Duration::from_millis(self.role_timeout_ms)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    pub fn health_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.health_probe_timeout_ms)
    }

    pub fn escalation_timeout(&self) -> Duration {
        Duration::from_millis(self.escalation_timeout_ms)
    }

    pub fn breaker_recovery(&self) -> Duration {
        Duration::from_millis(self.breaker_recovery_ms)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.checkpoint_history, 10);
        assert_eq!(config.role_timeout(), Duration::from_secs(30));
        assert_eq!(config.health_probe_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: CoordinatorConfig =
            serde_json::from_str(r#"{"role_timeout_ms": 250, "archive_limit": 3}"#).unwrap();
        assert_eq!(config.role_timeout(), Duration::from_millis(250));
        assert_eq!(config.archive_limit, 3);
        assert_eq!(config.escalation_timeout(), Duration::from_secs(5));
        assert_eq!(config.breaker_failure_threshold, 5);
    }
}
