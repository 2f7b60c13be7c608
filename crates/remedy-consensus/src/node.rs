//! Participant registry, quorum arithmetic and Byzantine suspicion tracking.

use crate::crypto::PublicKey;
use chrono::{DateTime, Utc};
use remedy_core::{RemedyError, RemedyResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Maximum number of Byzantine nodes `n` participants tolerate: `floor((n-1)/3)`.
pub fn fault_tolerance(total_nodes: usize) -> usize {
    total_nodes.saturating_sub(1) / 3
}

/// Matching votes needed to prepare or commit: `2f + 1`.
pub fn quorum_size(total_nodes: usize) -> usize {
    2 * fault_tolerance(total_nodes) + 1
}

/// Trust state of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// No suspicion inside the current window.
    Normal,
    /// At least one suspicion event inside the current window.
    Suspected,
    /// Crossed the suspicion threshold. Terminal for the node's lifetime.
    Isolated,
}

/// One participant as seen by the local node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantNode {
    /// Node id, also the sort key for primary rotation.
    pub id: String,
    /// Key every message from this node must verify against.
    pub public_key: PublicKey,
    /// Current trust state.
    pub state: NodeState,
    /// Timestamps of suspicion events still inside the window.
    pub suspicion_events: VecDeque<DateTime<Utc>>,
    /// Suspicion events over the node's lifetime.
    pub suspicious_total: u64,
    /// Starts at 1.0 and drops by the penalty on every suspicion event.
    pub reputation: f64,
    /// Reason given for the most recent suspicion event.
    pub last_suspicion: Option<String>,
    /// When the node crossed the suspicion threshold.
    pub isolated_at: Option<DateTime<Utc>>,
}

impl ParticipantNode {
    pub fn new(id: impl Into<String>, public_key: PublicKey) -> Self {
        Self {
            id: id.into(),
            public_key,
            state: NodeState::Normal,
            suspicion_events: VecDeque::new(),
            suspicious_total: 0,
            reputation: 1.0,
            last_suspicion: None,
            isolated_at: None,
        }
    }

    pub fn is_isolated(&self) -> bool {
        self.state == NodeState::Isolated
    }

    /// Suspicion events currently inside the window.
    pub fn suspicion_count(&self) -> usize {
        self.suspicion_events.len()
    }

    /// Record one suspicion event at `at`.
    ///
    /// Returns `true` when this event isolated the node.
    pub fn record_suspicion(
        &mut self,
        at: DateTime<Utc>,
        reason: &str,
        window: chrono::Duration,
        threshold: usize,
        penalty: f64,
    ) -> bool {
        self.suspicious_total += 1;
        self.reputation = (self.reputation - penalty).max(0.0);
        self.last_suspicion = Some(reason.to_string());
        if self.is_isolated() {
            return false;
        }

        self.suspicion_events.push_back(at);
        while let Some(oldest) = self.suspicion_events.front() {
            if at - *oldest > window {
                self.suspicion_events.pop_front();
            } else {
                break;
            }
        }

        if self.suspicion_events.len() >= threshold {
            self.state = NodeState::Isolated;
            self.isolated_at = Some(at);
            true
        } else {
            self.state = NodeState::Suspected;
            false
        }
    }
}

/// The fixed membership of a cluster, keyed and ordered by node id.
#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    nodes: BTreeMap<String, ParticipantNode>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a participant. Re-registering an id with the same key is a
    /// no-op; with a different key it is a configuration error.
    pub fn register(&mut self, id: impl Into<String>, public_key: PublicKey) -> RemedyResult<()> {
        let id = id.into();
        if let Some(existing) = self.nodes.get(&id) {
            if existing.public_key == public_key {
                return Ok(());
            }
            return Err(RemedyError::Configuration(format!(
                "Node '{id}' is already registered with a different key"
            )));
        }
        self.nodes.insert(id.clone(), ParticipantNode::new(id, public_key));
        Ok(())
    }

    pub fn total(&self) -> usize {
        self.nodes.len()
    }

    pub fn fault_tolerance(&self) -> usize {
        fault_tolerance(self.total())
    }

    pub fn quorum_size(&self) -> usize {
        quorum_size(self.total())
    }

    pub fn get(&self, id: &str) -> Option<&ParticipantNode> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ParticipantNode> {
        self.nodes.get_mut(id)
    }

    /// Node ids in ascending order.
    pub fn sorted_ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Primary of `view`: `sorted_ids[view mod n]`. Isolated nodes keep their slot.
    pub fn primary_for(&self, view: u64) -> Option<&str> {
        let n = self.nodes.len() as u64;
        if n == 0 {
            return None;
        }
        let index = usize::try_from(view % n).ok()?;
        self.nodes.keys().nth(index).map(String::as_str)
    }

    pub fn is_isolated(&self, id: &str) -> bool {
        self.nodes.get(id).is_some_and(ParticipantNode::is_isolated)
    }

    pub fn isolated_ids(&self) -> BTreeSet<String> {
        self.nodes
            .values()
            .filter(|n| n.is_isolated())
            .map(|n| n.id.clone())
            .collect()
    }

    pub fn isolated_count(&self) -> usize {
        self.nodes.values().filter(|n| n.is_isolated()).count()
    }

    pub fn active_count(&self) -> usize {
        self.total() - self.isolated_count()
    }

    /// Whether enough non-isolated nodes remain to ever form a quorum.
    pub fn check_quorum_possible(&self) -> RemedyResult<()> {
        let active = self.active_count();
        let required = self.quorum_size();
        if active < required {
            return Err(RemedyError::InsufficientQuorum { active, required });
        }
        Ok(())
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ParticipantNode> {
        self.nodes.values()
    }
}
