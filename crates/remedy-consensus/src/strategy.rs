//! Consensus strategies the coordinator can plug in.
//!
//! - [`PbftStrategy`] runs a round on a [`PbftCluster`].
//! - [`WeightedVotingStrategy`] scores recommendations by confidence and role weight.
//! - [`FailoverConsensus`] falls back from one strategy to another when the
//!   first cannot reach a quorum.

use crate::cluster::PbftCluster;
use async_trait::async_trait;
use remedy_core::{
    AgentRecommendation, ConsensusDecision, Incident, RemedyError, RemedyResult, RiskLevel,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Turns the recommendations of one workflow into a single decision.
#[async_trait]
pub trait ConsensusStrategy: Send + Sync {
    /// Tag recorded in [`ConsensusDecision::method`].
    fn method(&self) -> &str;

    async fn decide(
        &self,
        incident: &Incident,
        recommendations: &[AgentRecommendation],
    ) -> RemedyResult<ConsensusDecision>;
}

/// Group recommendations by action and sum their scores.
fn tally<'a>(
    recommendations: &'a [AgentRecommendation],
    weight: impl Fn(&AgentRecommendation) -> f64,
) -> BTreeMap<&'a str, (f64, Vec<&'a AgentRecommendation>)> {
    let mut groups: BTreeMap<&str, (f64, Vec<&AgentRecommendation>)> = BTreeMap::new();
    for rec in recommendations {
        let entry = groups.entry(rec.action_id.as_str()).or_default();
        entry.0 += weight(rec);
        entry.1.push(rec);
    }
    groups
}

/// Highest-scoring group; ties go to the lexicographically smallest action id.
fn winner<'a>(
    groups: &BTreeMap<&'a str, (f64, Vec<&'a AgentRecommendation>)>,
) -> Option<(&'a str, f64, &'a AgentRecommendation)> {
    let mut best: Option<(&'a str, f64, &'a AgentRecommendation)> = None;
    for (action, (score, members)) in groups {
        let Some(representative) = members
            .iter()
            .copied()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
        else {
            continue;
        };
        if best.map_or(true, |(_, top, _)| *score > top) {
            best = Some((*action, *score, representative));
        }
    }
    best
}

/// The recommendation to put forward: the action with the largest summed
/// confidence, represented by its most confident proposer.
pub fn select_proposal(recommendations: &[AgentRecommendation]) -> Option<AgentRecommendation> {
    let groups = tally(recommendations, |r| r.confidence);
    winner(&groups).map(|(_, _, rec)| rec.clone())
}

/// Whether the recommendations disagree on the action to take.
pub fn has_conflicts(recommendations: &[AgentRecommendation]) -> bool {
    recommendations
        .iter()
        .map(|r| r.action_id.as_str())
        .collect::<BTreeSet<_>>()
        .len()
        > 1
}

/// Decision built without a quorum, for a human to confirm.
///
/// Used when consensus cannot be reached so the workflow still records
/// what the agents proposed.
pub fn unresolved_decision(
    incident: &Incident,
    recommendations: &[AgentRecommendation],
    approval_threshold: f64,
) -> Option<ConsensusDecision> {
    let proposal = select_proposal(recommendations)?;
    let participating: BTreeSet<String> = recommendations
        .iter()
        .filter(|r| r.action_id == proposal.action_id)
        .map(|r| r.role.clone())
        .collect();
    Some(ConsensusDecision {
        incident_id: incident.id,
        selected_action: proposal.action_id,
        action_type: proposal.action_type,
        risk_level: proposal.risk_level,
        final_confidence: proposal.confidence,
        participating_agents: participating.into_iter().collect(),
        method: "unresolved".into(),
        conflicts_detected: has_conflicts(recommendations),
        requires_human_approval: true,
        approval_threshold,
        processing_duration_ms: 0,
        byzantine_nodes_detected: 0,
        quorum_size: 0,
        total_nodes: 0,
        sequence: None,
    })
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Agreement through a PBFT round on the current primary.
pub struct PbftStrategy {
    cluster: Arc<PbftCluster>,
    timeout: Duration,
    /// Actions at or above this risk always need human approval.
    approval_risk: RiskLevel,
}

impl PbftStrategy {
    pub fn new(cluster: Arc<PbftCluster>, timeout: Duration) -> Self {
        Self {
            cluster,
            timeout,
            approval_risk: RiskLevel::Critical,
        }
    }

    pub fn with_approval_risk(mut self, risk: RiskLevel) -> Self {
        self.approval_risk = risk;
        self
    }

    pub fn cluster(&self) -> &Arc<PbftCluster> {
        &self.cluster
    }
}

#[async_trait]
impl ConsensusStrategy for PbftStrategy {
    fn method(&self) -> &str {
        "pbft"
    }

    async fn decide(
        &self,
        incident: &Incident,
        recommendations: &[AgentRecommendation],
    ) -> RemedyResult<ConsensusDecision> {
        let started = Instant::now();
        let proposal = select_proposal(recommendations).ok_or(RemedyError::NoRecommendations {
            incident_id: incident.id,
        })?;
        let primary = self.cluster.primary().cloned().ok_or_else(|| {
            RemedyError::Configuration("PBFT cluster has no primary".into())
        })?;

        let sequence = primary.propose_action(incident, &proposal).await?;
        let mut decision = match primary.wait_for_consensus(sequence, self.timeout).await {
            Ok(decision) => decision,
            Err(e) => {
                if matches!(e, RemedyError::ConsensusTimeout { .. }) {
                    // Give the next primary a chance for later rounds.
                    for engine in self.cluster.engines() {
                        engine.request_view_change().await;
                    }
                }
                return Err(e);
            }
        };

        decision.conflicts_detected = has_conflicts(recommendations);
        decision.requires_human_approval = decision.risk_level >= self.approval_risk;
        decision.processing_duration_ms = elapsed_ms(started);
        info!(
            incident_id = %incident.id,
            sequence,
            action = %decision.selected_action,
            conflicts = decision.conflicts_detected,
            "PBFT decision"
        );
        Ok(decision)
    }
}

/// Confidence-weighted voting across roles.
///
/// Each recommendation scores `confidence * role weight` (weight 1.0 unless
/// configured). The final confidence is the winner's share of the total
/// score; below `approval_threshold` the decision needs human approval.
pub struct WeightedVotingStrategy {
    role_weights: HashMap<String, f64>,
    approval_threshold: f64,
}

impl WeightedVotingStrategy {
    pub fn new(approval_threshold: f64) -> Self {
        Self {
            role_weights: HashMap::new(),
            approval_threshold,
        }
    }

    pub fn with_role_weight(mut self, role: impl Into<String>, weight: f64) -> Self {
        self.role_weights.insert(role.into(), weight.max(0.0));
        self
    }

    fn weight(&self, rec: &AgentRecommendation) -> f64 {
        rec.confidence * self.role_weights.get(&rec.role).copied().unwrap_or(1.0)
    }
}

#[async_trait]
impl ConsensusStrategy for WeightedVotingStrategy {
    fn method(&self) -> &str {
        "weighted_voting"
    }

    async fn decide(
        &self,
        incident: &Incident,
        recommendations: &[AgentRecommendation],
    ) -> RemedyResult<ConsensusDecision> {
        let started = Instant::now();
        let groups = tally(recommendations, |r| self.weight(r));
        let (action, score, representative) =
            winner(&groups).ok_or(RemedyError::NoRecommendations {
                incident_id: incident.id,
            })?;

        let total: f64 = groups.values().map(|(s, _)| s).sum();
        let final_confidence = if total > 0.0 { score / total } else { 0.0 };
        let voters: BTreeSet<&str> = recommendations.iter().map(|r| r.role.as_str()).collect();
        let participating: BTreeSet<String> = groups
            .get(action)
            .map(|(_, members)| members.iter().map(|r| r.role.clone()).collect())
            .unwrap_or_default();

        let requires_human_approval = final_confidence < self.approval_threshold
            || representative.risk_level >= RiskLevel::Critical;
        Ok(ConsensusDecision {
            incident_id: incident.id,
            selected_action: representative.action_id.clone(),
            action_type: representative.action_type.clone(),
            risk_level: representative.risk_level,
            final_confidence,
            participating_agents: participating.into_iter().collect(),
            method: self.method().to_string(),
            conflicts_detected: groups.len() > 1,
            requires_human_approval,
            approval_threshold: self.approval_threshold,
            processing_duration_ms: elapsed_ms(started),
            byzantine_nodes_detected: 0,
            quorum_size: 0,
            total_nodes: voters.len(),
            sequence: None,
        })
    }
}

/// Tries `primary`, then `fallback` when the primary reports that consensus
/// is impossible or timed out.
///
/// A fallback decision is always flagged for human approval.
pub struct FailoverConsensus {
    primary: Arc<dyn ConsensusStrategy>,
    fallback: Arc<dyn ConsensusStrategy>,
    method: String,
}

impl FailoverConsensus {
    pub fn new(primary: Arc<dyn ConsensusStrategy>, fallback: Arc<dyn ConsensusStrategy>) -> Self {
        let method = format!("{}+{}", primary.method(), fallback.method());
        Self {
            primary,
            fallback,
            method,
        }
    }
}

#[async_trait]
impl ConsensusStrategy for FailoverConsensus {
    fn method(&self) -> &str {
        &self.method
    }

    async fn decide(
        &self,
        incident: &Incident,
        recommendations: &[AgentRecommendation],
    ) -> RemedyResult<ConsensusDecision> {
        match self.primary.decide(incident, recommendations).await {
            Ok(decision) => Ok(decision),
            Err(e) if e.requires_human_approval() => {
                warn!(
                    incident_id = %incident.id,
                    primary = self.primary.method(),
                    fallback = self.fallback.method(),
                    error = %e,
                    "Consensus failed, falling back"
                );
                let decision = self.fallback.decide(incident, recommendations).await?;
                Ok(decision.flag_for_approval())
            }
            Err(e) => Err(e),
        }
    }
}
