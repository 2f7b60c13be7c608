use remedy_core::ExecutionStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Whether a role is currently busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Working,
}

/// Health derived from a role's most recent outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleHealthState {
    Healthy,
    /// Produced output, but through a fallback or below its confidence threshold.
    Degraded,
    /// Failed or needed human intervention last time.
    Unavailable,
}

impl RoleHealthState {
    fn from_outcome(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Completed => RoleHealthState::Healthy,
            ExecutionStatus::Degraded | ExecutionStatus::FallbackSuccess => {
                RoleHealthState::Degraded
            }
            _ => RoleHealthState::Unavailable,
        }
    }
}

/// Counters for one role across incidents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleMetrics {
    pub processed: u64,
    pub errors: u64,
    pub fallbacks: u64,
    pub escalations: u64,
    pub last_duration_ms: u64,
    pub total_duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleState {
    pub role: String,
    pub status: WorkerStatus,
    pub health: RoleHealthState,
    pub current_incident: Option<Uuid>,
    pub last_outcome: Option<ExecutionStatus>,
    pub metrics: RoleMetrics,
}

impl RoleState {
    fn new(role: &str) -> Self {
        Self {
            role: role.to_string(),
            status: WorkerStatus::Idle,
            health: RoleHealthState::Healthy,
            current_incident: None,
            last_outcome: None,
            metrics: RoleMetrics::default(),
        }
    }
}

/// Tracks state and counters for every workflow role.
pub struct RoleMonitor {
    states: Arc<RwLock<HashMap<String, RoleState>>>,
}

impl RoleMonitor {
    pub fn new<'a>(roles: impl IntoIterator<Item = &'a str>) -> Self {
        let states = roles
            .into_iter()
            .map(|role| (role.to_string(), RoleState::new(role)))
            .collect();
        Self {
            states: Arc::new(RwLock::new(states)),
        }
    }

    /// Mark a role as working on an incident.
    pub async fn start_task(&self, role: &str, incident_id: Uuid) {
        let mut states = self.states.write().await;
        let state = states
            .entry(role.to_string())
            .or_insert_with(|| RoleState::new(role));
        state.current_incident = Some(incident_id);
        state.status = WorkerStatus::Working;
    }

    /// Mark a role idle with the terminal status it reached.
    pub async fn finish_task(&self, role: &str, outcome: ExecutionStatus, duration_ms: u64) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(role) {
            state.current_incident = None;
            state.status = WorkerStatus::Idle;
            state.last_outcome = Some(outcome);
            state.health = RoleHealthState::from_outcome(outcome);
            state.metrics.processed += 1;
            state.metrics.last_duration_ms = duration_ms;
            state.metrics.total_duration_ms += duration_ms;
            match outcome {
                ExecutionStatus::FallbackSuccess => state.metrics.fallbacks += 1,
                ExecutionStatus::RequiresHumanIntervention => state.metrics.escalations += 1,
                _ => {}
            }
        }
    }

    /// Record a failed invocation attempt.
    pub async fn record_error(&self, role: &str) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(role) {
            state.metrics.errors += 1;
        }
    }

    /// Get a snapshot of all role states, sorted by role.
    pub async fn snapshot(&self) -> Vec<RoleState> {
        let states = self.states.read().await;
        let mut snapshot: Vec<RoleState> = states.values().cloned().collect();
        snapshot.sort_by(|a, b| a.role.cmp(&b.role));
        snapshot
    }

    pub async fn get_state(&self, role: &str) -> Option<RoleState> {
        let states = self.states.read().await;
        states.get(role).cloned()
    }

    /// Aggregate counters across all roles.
    pub async fn aggregate_metrics(&self) -> RoleMetrics {
        let states = self.states.read().await;
        let mut total = RoleMetrics::default();
        for state in states.values() {
            total.processed += state.metrics.processed;
            total.errors += state.metrics.errors;
            total.fallbacks += state.metrics.fallbacks;
            total.escalations += state.metrics.escalations;
            total.total_duration_ms += state.metrics.total_duration_ms;
        }
        total
    }

    pub async fn to_json(&self) -> serde_json::Value {
        let states = self.snapshot().await;
        let aggregate = self.aggregate_metrics().await;
        serde_json::json!({
            "roles": states,
            "aggregate": aggregate,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn monitor() -> RoleMonitor {
        RoleMonitor::new(["detection", "diagnosis", "prediction"])
    }

    #[tokio::test]
    async fn test_initial_state() {
        let states = monitor().snapshot().await;
        assert_eq!(states.len(), 3);
        assert_eq!(states[0].role, "detection");
        for state in &states {
            assert_eq!(state.status, WorkerStatus::Idle);
            assert_eq!(state.health, RoleHealthState::Healthy);
        }
    }

    #[tokio::test]
    async fn test_start_and_finish_task() {
        let monitor = monitor();
        let incident_id = Uuid::new_v4();

        monitor.start_task("diagnosis", incident_id).await;
        let state = monitor.get_state("diagnosis").await.unwrap();
        assert_eq!(state.status, WorkerStatus::Working);
        assert_eq!(state.current_incident, Some(incident_id));

        monitor
            .finish_task("diagnosis", ExecutionStatus::FallbackSuccess, 40)
            .await;
        let state = monitor.get_state("diagnosis").await.unwrap();
        assert_eq!(state.status, WorkerStatus::Idle);
        assert_eq!(state.health, RoleHealthState::Degraded);
        assert_eq!(state.metrics.fallbacks, 1);
        assert_eq!(state.metrics.last_duration_ms, 40);
    }

    #[tokio::test]
    async fn test_health_recovers_after_success() {
        let monitor = monitor();
        monitor.record_error("prediction").await;
        monitor
            .finish_task("prediction", ExecutionStatus::RequiresHumanIntervention, 5)
            .await;
        assert_eq!(
            monitor.get_state("prediction").await.unwrap().health,
            RoleHealthState::Unavailable
        );
        monitor
            .finish_task("prediction", ExecutionStatus::Completed, 5)
            .await;
        let state = monitor.get_state("prediction").await.unwrap();
        assert_eq!(state.health, RoleHealthState::Healthy);
        assert_eq!(state.metrics.errors, 1);
        assert_eq!(state.metrics.escalations, 1);
        assert_eq!(state.metrics.processed, 2);
    }

    #[tokio::test]
    async fn test_aggregate_and_json() {
        let monitor = monitor();
        monitor.finish_task("detection", ExecutionStatus::Completed, 10).await;
        monitor.finish_task("diagnosis", ExecutionStatus::Degraded, 20).await;
        monitor.record_error("diagnosis").await;

        let agg = monitor.aggregate_metrics().await;
        assert_eq!(agg.processed, 2);
        assert_eq!(agg.errors, 1);
        assert_eq!(agg.total_duration_ms, 30);

        let json = monitor.to_json().await;
        assert!(json["roles"].is_array());
        assert!(json["aggregate"].is_object());
    }
}
