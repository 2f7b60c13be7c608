use crate::channel::NotificationChannel;
use async_trait::async_trait;
use futures_util::future::join_all;
use remedy_core::{
    ChannelOutcome, EscalationPayload, NotificationGateway, RemedyError, RemedyResult,
};
use std::collections::BTreeMap;
use std::time::Duration;

/// Manages the notification channels escalations are fanned out to.
///
/// Every channel send is bounded by `per_channel_timeout`; a slow or failing
/// channel never holds up the others or the caller for longer than that.
pub struct ChannelManager {
    channels: BTreeMap<String, Box<dyn NotificationChannel>>,
    per_channel_timeout: Duration,
}

impl ChannelManager {
    pub fn new(per_channel_timeout: Duration) -> Self {
        Self {
            channels: BTreeMap::new(),
            per_channel_timeout,
        }
    }

    /// Add a channel; a channel with the same name is replaced.
    pub fn add_channel(&mut self, channel: Box<dyn NotificationChannel>) {
        let name = channel.name().to_string();
        self.channels.insert(name, channel);
    }

    /// Get a reference to a channel by name.
    pub fn get(&self, name: &str) -> Option<&dyn NotificationChannel> {
        self.channels.get(name).map(std::convert::AsRef::as_ref)
    }

    /// Send to one named channel, bounded by the per-channel timeout.
    pub async fn send_to(&self, channel_name: &str, payload: &EscalationPayload) -> RemedyResult<()> {
        let channel = self.channels.get(channel_name).ok_or_else(|| {
            RemedyError::Channel(format!("Channel '{channel_name}' not found"))
        })?;
        self.bounded_send(channel.as_ref(), payload).await
    }

    /// Send to every channel concurrently and collect one outcome per channel.
    pub async fn broadcast(&self, payload: &EscalationPayload) -> BTreeMap<String, ChannelOutcome> {
        let sends = self.channels.iter().map(|(name, channel)| async move {
            let outcome = match self.bounded_send(channel.as_ref(), payload).await {
                Ok(()) => ChannelOutcome::Success,
                Err(e) => {
                    tracing::warn!(channel = %name, error = %e, "Escalation send failed");
                    ChannelOutcome::Failure {
                        reason: e.to_string(),
                    }
                }
            };
            (name.clone(), outcome)
        });
        join_all(sends).await.into_iter().collect()
    }

    async fn bounded_send(
        &self,
        channel: &dyn NotificationChannel,
        payload: &EscalationPayload,
    ) -> RemedyResult<()> {
        match tokio::time::timeout(self.per_channel_timeout, channel.send(payload)).await {
            Ok(result) => result,
            Err(_) => Err(RemedyError::Channel(format!(
                "Channel '{}' timed out after {}ms",
                channel.name(),
                self.per_channel_timeout.as_millis()
            ))),
        }
    }

    /// List all registered channel names.
    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.keys().map(String::as_str).collect()
    }

    /// Get the number of registered channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl NotificationGateway for ChannelManager {
    async fn escalate(&self, payload: &EscalationPayload) -> BTreeMap<String, ChannelOutcome> {
        self.broadcast(payload).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use remedy_core::{Incident, ProcessingState, Severity};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Mock channel that counts sends and can be told to fail or stall.
    struct MockChannel {
        name: String,
        send_count: Arc<AtomicUsize>,
        fail: bool,
        delay: Option<Duration>,
    }

    impl MockChannel {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                send_count: Arc::new(AtomicUsize::new(0)),
                fail: false,
                delay: None,
            }
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        fn stalled(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }
    }

    #[async_trait]
    impl NotificationChannel for MockChannel {
        fn name(&self) -> &str {
            &self.name
        }

        async fn send(&self, _payload: &EscalationPayload) -> RemedyResult<()> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.send_count.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(RemedyError::Channel("pager API returned 503".into()));
            }
            Ok(())
        }
    }

    fn payload() -> EscalationPayload {
        let incident = Incident::new("Disk full", Severity::High);
        let state = ProcessingState::new(incident.clone());
        EscalationPayload {
            workflow_id: state.workflow_id,
            incident_id: incident.id,
            failed_role: "diagnosis".into(),
            error: "fallback chain exhausted".into(),
            state,
            checkpoints: Vec::new(),
            raised_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_add_and_count() {
        let mut mgr = ChannelManager::default();
        assert_eq!(mgr.channel_count(), 0);
        mgr.add_channel(Box::new(MockChannel::new("pager")));
        mgr.add_channel(Box::new(MockChannel::new("chat")));
        assert_eq!(mgr.channel_count(), 2);
        assert_eq!(mgr.channel_names(), vec!["chat", "pager"]);
        assert!(mgr.get("pager").is_some());
        assert!(mgr.get("email").is_none());
    }

    #[tokio::test]
    async fn test_send_to_unknown_channel() {
        let mgr = ChannelManager::default();
        let result = mgr.send_to("nonexistent", &payload()).await;
        assert!(matches!(result, Err(RemedyError::Channel(_))));
    }

    #[tokio::test]
    async fn test_broadcast_reports_per_channel_outcomes() {
        let ok = MockChannel::new("chat");
        let ok_count = ok.send_count.clone();
        let bad = MockChannel::new("pager").failing();
        let bad_count = bad.send_count.clone();

        let mut mgr = ChannelManager::default();
        mgr.add_channel(Box::new(ok));
        mgr.add_channel(Box::new(bad));

        let outcomes = mgr.escalate(&payload()).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes["chat"].is_success());
        assert!(matches!(
            &outcomes["pager"],
            ChannelOutcome::Failure { reason } if reason.contains("503")
        ));
        assert_eq!(ok_count.load(Ordering::SeqCst), 1);
        assert_eq!(bad_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_channel_is_bounded() {
        let mut mgr = ChannelManager::new(Duration::from_millis(20));
        mgr.add_channel(Box::new(
            MockChannel::new("ticketing").stalled(Duration::from_secs(5)),
        ));
        mgr.add_channel(Box::new(MockChannel::new("chat")));

        let started = std::time::Instant::now();
        let outcomes = mgr.broadcast(&payload()).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(outcomes["chat"].is_success());
        assert!(matches!(
            &outcomes["ticketing"],
            ChannelOutcome::Failure { reason } if reason.contains("timed out")
        ));
    }
}
