use async_trait::async_trait;
use remedy_core::{AgentRecommendation, ConsensusDecision, Incident, RemedyResult};
use serde::{Deserialize, Serialize};

/// What an agent is asked to work on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub incident: Incident,
    /// Role being invoked. For fallback strategies, the role they stand in for.
    pub role: String,
    /// Recommendations produced by earlier levels.
    #[serde(default)]
    pub upstream: Vec<AgentRecommendation>,
    /// The consensus decision, for roles that run after consensus.
    #[serde(default)]
    pub decision: Option<ConsensusDecision>,
}

impl AgentRequest {
    pub fn new(incident: Incident, role: impl Into<String>) -> Self {
        Self {
            incident,
            role: role.into(),
            upstream: Vec::new(),
            decision: None,
        }
    }

    pub fn with_upstream(mut self, upstream: Vec<AgentRecommendation>) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn with_decision(mut self, decision: Option<ConsensusDecision>) -> Self {
        self.decision = decision;
        self
    }

    pub(crate) fn for_role(&self, role: &str) -> Self {
        Self {
            role: role.to_string(),
            ..self.clone()
        }
    }
}

/// Something that can play a workflow role: an agent or a fallback strategy.
///
/// The coordinator bounds every call with the role's timeout, so an
/// implementation may simply await its backend.
#[async_trait]
pub trait AgentInvocable: Send + Sync {
    async fn invoke(&self, request: &AgentRequest) -> RemedyResult<Vec<AgentRecommendation>>;

    /// Liveness probe used by the coordinator health check.
    async fn health_check(&self) -> bool {
        true
    }
}
