use crate::recommendation::RiskLevel;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The binding outcome of a consensus round. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusDecision {
    /// Incident the decision applies to.
    pub incident_id: Uuid,
    /// Action id the cluster agreed on.
    pub selected_action: String,
    /// Category of the selected action.
    pub action_type: String,
    /// Risk level carried over from the winning recommendation.
    pub risk_level: RiskLevel,
    /// 1.0 for quorum-based decisions; a weighted score for voting strategies.
    pub final_confidence: f64,
    /// Node ids (PBFT) or roles (weighted voting) whose votes formed the decision.
    pub participating_agents: Vec<String>,
    /// Strategy tag, e.g. `pbft` or `weighted_voting`.
    pub method: String,
    /// The recommendations disagreed on the action.
    pub conflicts_detected: bool,
    /// Action roles wait for a human when set.
    pub requires_human_approval: bool,
    /// Confidence below which a decision needs approval.
    pub approval_threshold: f64,
    /// Time from proposal to decision.
    pub processing_duration_ms: u64,
    /// Participants isolated when the decision was made.
    pub byzantine_nodes_detected: usize,
    /// Matching votes that were required: `2f + 1` for PBFT.
    pub quorum_size: usize,
    /// Cluster size, or the number of voters.
    pub total_nodes: usize,
    /// Consensus sequence number, when produced by a sequenced protocol.
    #[serde(default)]
    pub sequence: Option<u64>,
}

impl ConsensusDecision {
    /// Mark the decision as needing human sign-off before resolution runs.
    pub fn flag_for_approval(mut self) -> Self {
        self.requires_human_approval = true;
        self
    }
}
