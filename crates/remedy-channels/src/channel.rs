use async_trait::async_trait;
use remedy_core::{EscalationPayload, RemedyResult};

/// A single destination for escalations (pager, chat, ticketing, ...).
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, payload: &EscalationPayload) -> RemedyResult<()>;
}
