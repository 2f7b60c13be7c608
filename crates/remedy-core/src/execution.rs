use crate::decision::ConsensusDecision;
use crate::incident::Incident;
use crate::recommendation::AgentRecommendation;
use crate::timeline::Timeline;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Phase of an incident workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    /// Level 0 of the plan: roles without prerequisites.
    Detection,
    /// Remaining pre-consensus levels (diagnosis, prediction, ...).
    Analysis,
    Consensus,
    /// Post-consensus levels (resolution, communication, ...).
    Resolution,
    Completed,
    Failed,
}

impl WorkflowPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowPhase::Completed | WorkflowPhase::Failed)
    }
}

impl std::fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowPhase::Detection => write!(f, "detection"),
            WorkflowPhase::Analysis => write!(f, "analysis"),
            WorkflowPhase::Consensus => write!(f, "consensus"),
            WorkflowPhase::Resolution => write!(f, "resolution"),
            WorkflowPhase::Completed => write!(f, "completed"),
            WorkflowPhase::Failed => write!(f, "failed"),
        }
    }
}

/// Status of a single role's execution for one incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    /// Completed, but confidence fell below the role's fallback threshold.
    Degraded,
    /// The primary invocation failed and a fallback strategy succeeded.
    FallbackSuccess,
    Failed,
    /// The fallback chain was exhausted and the role was escalated.
    RequiresHumanIntervention,
    /// The level was never dispatched because the workflow failed earlier.
    Skipped,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }

    /// Whether recommendations from an execution in this status are usable.
    pub fn produced_output(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Degraded | ExecutionStatus::FallbackSuccess
        )
    }
}

/// Per-role, per-incident execution record.
///
/// Written by exactly one task (the one driving the role) and frozen once
/// its status is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentExecution {
    pub role: String,
    pub incident_id: Uuid,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recommendations: Vec<AgentRecommendation>,
    /// Last error seen, retained even when a fallback later succeeded.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Fallback strategy that produced the output, if any.
    #[serde(default)]
    pub fallback_strategy: Option<String>,
}

impl AgentExecution {
    pub fn pending(role: impl Into<String>, incident_id: Uuid) -> Self {
        Self {
            role: role.into(),
            incident_id,
            status: ExecutionStatus::Pending,
            started_at: None,
            completed_at: None,
            recommendations: Vec::new(),
            last_error: None,
            fallback_strategy: None,
        }
    }

    pub fn start(&mut self) {
        self.status = ExecutionStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Move to a terminal status. Calls on an already terminal record are ignored.
    pub fn finish(&mut self, status: ExecutionStatus) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Aggregate state of one incident workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingState {
    pub workflow_id: Uuid,
    pub incident: Incident,
    pub phase: WorkflowPhase,
    pub executions: BTreeMap<String, AgentExecution>,
    pub timeline: Timeline,
    #[serde(default)]
    pub decision: Option<ConsensusDecision>,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProcessingState {
    pub fn new(incident: Incident) -> Self {
        let timeline = Timeline::new(incident.id);
        Self {
            workflow_id: Uuid::new_v4(),
            incident,
            phase: WorkflowPhase::Detection,
            executions: BTreeMap::new(),
            timeline,
            decision: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// All usable recommendations collected so far, in role order.
    pub fn recommendations(&self) -> Vec<AgentRecommendation> {
        self.executions
            .values()
            .filter(|e| e.status.produced_output())
            .flat_map(|e| e.recommendations.iter().cloned())
            .collect()
    }

    /// Roles grouped by execution status, for status summaries.
    pub fn execution_summary(&self) -> BTreeMap<String, ExecutionStatus> {
        self.executions
            .iter()
            .map(|(role, e)| (role.clone(), e.status))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incident::Severity;

    #[test]
    fn test_execution_lifecycle() {
        let mut exec = AgentExecution::pending("detection", Uuid::new_v4());
        assert_eq!(exec.status, ExecutionStatus::Pending);
        exec.start();
        assert_eq!(exec.status, ExecutionStatus::Running);
        exec.finish(ExecutionStatus::Completed);
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert!(exec.duration_ms().is_some());

        // Frozen once terminal
        exec.finish(ExecutionStatus::Failed);
        assert_eq!(exec.status, ExecutionStatus::Completed);
    }

    #[test]
    fn test_recommendations_skip_failed_roles() {
        let incident = Incident::new("latency", Severity::High);
        let mut state = ProcessingState::new(incident.clone());

        let mut ok = AgentExecution::pending("detection", incident.id);
        ok.recommendations
            .push(AgentRecommendation::new("detection", "restart", "restart", 0.9));
        ok.finish(ExecutionStatus::Completed);

        let mut bad = AgentExecution::pending("diagnosis", incident.id);
        bad.recommendations
            .push(AgentRecommendation::new("diagnosis", "noop", "noop", 0.9));
        bad.finish(ExecutionStatus::Failed);

        state.executions.insert("detection".into(), ok);
        state.executions.insert("diagnosis".into(), bad);

        let recs = state.recommendations();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].action_id, "restart");
        assert_eq!(state.execution_summary()["diagnosis"], ExecutionStatus::Failed);
    }
}
