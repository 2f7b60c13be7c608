use crate::config::AgentBehaviour;
use async_trait::async_trait;
use remedy_core::{AgentRecommendation, RemedyError, RemedyResult};
use remedy_orchestrator::{AgentInvocable, AgentRequest};
use std::time::Duration;

/// An agent that answers from its configured behaviour.
pub struct SimulatedAgent {
    behaviour: AgentBehaviour,
}

impl SimulatedAgent {
    pub fn new(behaviour: AgentBehaviour) -> Self {
        Self { behaviour }
    }
}

#[async_trait]
impl AgentInvocable for SimulatedAgent {
    async fn invoke(&self, request: &AgentRequest) -> RemedyResult<Vec<AgentRecommendation>> {
        let b = &self.behaviour;
        if b.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(b.delay_ms)).await;
        }
        if b.fail {
            return Err(RemedyError::AgentInvocation {
                role: request.role.clone(),
                message: format!("simulated failure in '{}'", b.name),
            });
        }

        let reasoning = match &request.decision {
            Some(decision) => format!(
                "{} acting on decided action {}",
                b.name, decision.selected_action
            ),
            None => format!(
                "{} analysed '{}' with {} upstream recommendations",
                b.name,
                request.incident.title,
                request.upstream.len()
            ),
        };
        let rec = AgentRecommendation::new(
            request.role.as_str(),
            b.action.as_str(),
            b.action_type.as_str(),
            b.confidence,
        )
        .with_risk(b.risk)
        .with_reasoning(reasoning)
        .with_evidence(format!("severity:{}", request.incident.severity));
        Ok(vec![rec])
    }

    async fn health_check(&self) -> bool {
        self.behaviour.healthy
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use remedy_core::{Incident, RiskLevel, Severity};

    fn behaviour() -> AgentBehaviour {
        AgentBehaviour {
            name: "diagnosis".into(),
            action: "scale_database_connections".into(),
            risk: RiskLevel::High,
            ..AgentBehaviour::default()
        }
    }

    #[tokio::test]
    async fn test_recommends_configured_action() {
        let agent = SimulatedAgent::new(behaviour());
        let request = AgentRequest::new(Incident::new("db down", Severity::High), "diagnosis");
        let recs = agent.invoke(&request).await.unwrap();

        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].role, "diagnosis");
        assert_eq!(recs[0].action_id, "scale_database_connections");
        assert_eq!(recs[0].risk_level, RiskLevel::High);
        assert_eq!(recs[0].evidence, vec!["severity:high"]);
        assert!(agent.health_check().await);
    }

    #[tokio::test]
    async fn test_failing_behaviour() {
        let agent = SimulatedAgent::new(AgentBehaviour {
            fail: true,
            healthy: false,
            ..behaviour()
        });
        let request = AgentRequest::new(Incident::new("db down", Severity::High), "diagnosis");
        let err = agent.invoke(&request).await.unwrap_err();
        assert!(err.is_agent_failure());
        assert!(!agent.health_check().await);
    }
}
