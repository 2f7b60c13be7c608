use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for a PBFT node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PbftConfig {
    /// Suspicion events inside the window after which a node is isolated.
    pub suspicion_threshold: usize,
    /// Sliding window for suspicion events, in seconds.
    pub suspicion_window_secs: u64,
    /// Reputation lost per suspicion event. Reputation is floored at 0.
    pub reputation_penalty: f64,
    /// Confidence below which a decision is flagged for human approval.
    pub approval_threshold: f64,
    /// Default wait for a round to decide, in milliseconds.
    pub consensus_timeout_ms: u64,
}

impl Default for PbftConfig {
    fn default() -> Self {
        Self {
            suspicion_threshold: 3,
            suspicion_window_secs: 300,
            reputation_penalty: 0.1,
            approval_threshold: 0.7,
            consensus_timeout_ms: 5_000,
        }
    }
}

impl PbftConfig {
    pub fn suspicion_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(Duration::from_secs(self.suspicion_window_secs))
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn consensus_timeout(&self) -> Duration {
        Duration::from_millis(self.consensus_timeout_ms)
    }
}
