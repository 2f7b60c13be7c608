use parking_lot::Mutex;
use remedy_core::{AgentExecution, ProcessingState};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use uuid::Uuid;

/// Bounded per-role history of [`AgentExecution`] snapshots.
#[derive(Debug)]
pub struct CheckpointStore {
    history: Mutex<HashMap<Uuid, BTreeMap<String, VecDeque<AgentExecution>>>>,
    limit: usize,
}

impl CheckpointStore {
    pub fn new(limit: usize) -> Self {
        Self {
            history: Mutex::new(HashMap::new()),
            limit: limit.max(1),
        }
    }

    /// Snapshot every role's current execution. Returns the number of roles
    /// whose snapshot changed.
    pub fn record(&self, state: &ProcessingState) -> usize {
        let mut history = self.history.lock();
        let roles = history.entry(state.incident.id).or_default();
        let mut changed = 0;
        for (role, execution) in &state.executions {
            let entries = roles.entry(role.clone()).or_default();
            if entries.back() == Some(execution) {
                continue;
            }
            entries.push_back(execution.clone());
            while entries.len() > self.limit {
                entries.pop_front();
            }
            changed += 1;
        }
        changed
    }

    /// Snapshots of one role, oldest first.
    pub fn history(&self, incident_id: Uuid, role: &str) -> Vec<AgentExecution> {
        self.history
            .lock()
            .get(&incident_id)
            .and_then(|roles| roles.get(role))
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Latest snapshot of every role, ordered by start time.
    pub fn latest(&self, incident_id: Uuid) -> Vec<AgentExecution> {
        let mut latest: Vec<AgentExecution> = self
            .history
            .lock()
            .get(&incident_id)
            .map(|roles| roles.values().filter_map(|e| e.back().cloned()).collect())
            .unwrap_or_default();
        latest.sort_by_key(|e| e.started_at);
        latest
    }

    pub fn forget(&self, incident_id: Uuid) {
        self.history.lock().remove(&incident_id);
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// Snapshot `state` into `store` every `interval` until the handle is aborted.
pub fn spawn_checkpointer(
    store: Arc<CheckpointStore>,
    state: Arc<Mutex<ProcessingState>>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let snapshot = state.lock().clone();
            let changed = store.record(&snapshot);
            if changed > 0 {
                debug!(incident_id = %snapshot.incident.id, changed, "Checkpoint recorded");
            }
        }
    })
}
