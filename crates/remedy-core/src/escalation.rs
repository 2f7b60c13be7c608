//! Escalation payloads and the notification port.
//!
//! These types live in `remedy-core` so that both `remedy-orchestrator`
//! (which raises escalations) and `remedy-channels` (which delivers them)
//! can share them without depending on each other.

use crate::execution::{AgentExecution, ProcessingState};
use chrono::{DateTime, Utc};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Everything a human needs to pick up a role whose fallbacks ran out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationPayload {
    pub workflow_id: Uuid,
    pub incident_id: Uuid,
    pub failed_role: String,
    pub error: String,
    pub state: ProcessingState,
    /// Most recent checkpointed executions, newest last.
    pub checkpoints: Vec<AgentExecution>,
    pub raised_at: DateTime<Utc>,
}

/// Per-channel delivery outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum ChannelOutcome {
    Success,
    Failure { reason: String },
}

impl ChannelOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ChannelOutcome::Success)
    }
}

/// Fans an escalation out to human-facing channels.
///
/// Best effort: implementations bound every channel by a timeout and report
/// per-channel results instead of failing as a whole.
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn escalate(&self, payload: &EscalationPayload) -> BTreeMap<String, ChannelOutcome>;
}
