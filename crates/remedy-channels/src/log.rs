use crate::channel::NotificationChannel;
use async_trait::async_trait;
use remedy_core::{EscalationPayload, RemedyResult};
use tracing::warn;

/// Writes escalations to the structured log at `warn` level.
pub struct LogChannel {
    name: String,
}

impl LogChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for LogChannel {
    fn default() -> Self {
        Self::new("log")
    }
}

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, payload: &EscalationPayload) -> RemedyResult<()> {
        warn!(
            channel = %self.name,
            workflow_id = %payload.workflow_id,
            incident_id = %payload.incident_id,
            failed_role = %payload.failed_role,
            error = %payload.error,
            phase = %payload.state.phase,
            checkpoints = payload.checkpoints.len(),
            "Escalation: human intervention required"
        );
        Ok(())
    }
}
