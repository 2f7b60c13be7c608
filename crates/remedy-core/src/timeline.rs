use crate::execution::WorkflowPhase;
use crate::RemedyResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Kind of a timeline entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventType {
    IncidentStarted,
    PhaseStarted,
    AgentStarted,
    AgentCompleted,
    AgentDegraded,
    AgentFailed,
    CircuitOpen,
    FallbackAttempted,
    FallbackSucceeded,
    FallbackExhausted,
    EscalationSent,
    ConsensusStarted,
    ConsensusReached,
    ConsensusFailed,
    HumanApprovalRequired,
    LevelSkipped,
    IncidentCompleted,
    IncidentFailed,
}

impl TimelineEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimelineEventType::IncidentStarted => "incident_started",
            TimelineEventType::PhaseStarted => "phase_started",
            TimelineEventType::AgentStarted => "agent_started",
            TimelineEventType::AgentCompleted => "agent_completed",
            TimelineEventType::AgentDegraded => "agent_degraded",
            TimelineEventType::AgentFailed => "agent_failed",
            TimelineEventType::CircuitOpen => "circuit_open",
            TimelineEventType::FallbackAttempted => "fallback_attempted",
            TimelineEventType::FallbackSucceeded => "fallback_succeeded",
            TimelineEventType::FallbackExhausted => "fallback_exhausted",
            TimelineEventType::EscalationSent => "escalation_sent",
            TimelineEventType::ConsensusStarted => "consensus_started",
            TimelineEventType::ConsensusReached => "consensus_reached",
            TimelineEventType::ConsensusFailed => "consensus_failed",
            TimelineEventType::HumanApprovalRequired => "human_approval_required",
            TimelineEventType::LevelSkipped => "level_skipped",
            TimelineEventType::IncidentCompleted => "incident_completed",
            TimelineEventType::IncidentFailed => "incident_failed",
        }
    }
}

impl std::fmt::Display for TimelineEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable timeline entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    /// Position in the incident's timeline, starting at 0.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: TimelineEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<WorkflowPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Query over a timeline. Every set field must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimelineFilter {
    #[serde(default)]
    pub event_type: Option<TimelineEventType>,
    #[serde(default)]
    pub phase: Option<WorkflowPhase>,
    #[serde(default)]
    pub role: Option<String>,
    /// Case-insensitive substring searched in the event type, role and metadata.
    #[serde(default)]
    pub text: Option<String>,
}

impl TimelineFilter {
    pub fn event_type(mut self, event_type: TimelineEventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn phase(mut self, phase: WorkflowPhase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn matches(&self, event: &TimelineEvent) -> bool {
        if let Some(event_type) = self.event_type {
            if event.event_type != event_type {
                return false;
            }
        }
        if let Some(phase) = self.phase {
            if event.phase != Some(phase) {
                return false;
            }
        }
        if let Some(role) = &self.role {
            if event.role.as_deref() != Some(role.as_str()) {
                return false;
            }
        }
        if let Some(text) = &self.text {
            let needle = text.to_lowercase();
            let in_type = event.event_type.as_str().contains(&needle);
            let in_role = event
                .role
                .as_deref()
                .is_some_and(|r| r.to_lowercase().contains(&needle));
            let in_metadata = serde_json::to_string(&event.metadata)
                .map(|m| m.to_lowercase().contains(&needle))
                .unwrap_or(false);
            if !(in_type || in_role || in_metadata) {
                return false;
            }
        }
        true
    }
}

/// Append-only, totally ordered event log for one incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    pub incident_id: Uuid,
    events: Vec<TimelineEvent>,
}

impl Timeline {
    pub fn new(incident_id: Uuid) -> Self {
        Self {
            incident_id,
            events: Vec::new(),
        }
    }

    /// Append an event and return a copy of it.
    ///
    /// Timestamps never go backwards: a clock step back reuses the previous
    /// event's timestamp so that sequence order and time order agree.
    pub fn append(
        &mut self,
        event_type: TimelineEventType,
        phase: Option<WorkflowPhase>,
        role: Option<&str>,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> TimelineEvent {
        let mut timestamp = Utc::now();
        if let Some(last) = self.events.last() {
            if timestamp < last.timestamp {
                timestamp = last.timestamp;
            }
        }
        let event = TimelineEvent {
            sequence: self.events.len() as u64,
            timestamp,
            event_type,
            phase,
            role: role.map(str::to_string),
            metadata,
        };
        self.events.push(event.clone());
        event
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events matching `filter`, in timeline order.
    pub fn filter(&self, filter: &TimelineFilter) -> Vec<TimelineEvent> {
        self.events
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    /// Number of events of the given type.
    pub fn count(&self, event_type: TimelineEventType) -> usize {
        self.events
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn to_json(&self) -> RemedyResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> RemedyResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Build a metadata map from `(key, value)` pairs.
pub fn metadata<I, K>(pairs: I) -> BTreeMap<String, serde_json::Value>
where
    I: IntoIterator<Item = (K, serde_json::Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Timeline {
        let mut timeline = Timeline::new(Uuid::new_v4());
        timeline.append(
            TimelineEventType::IncidentStarted,
            Some(WorkflowPhase::Detection),
            None,
            metadata([("severity", json!("critical"))]),
        );
        timeline.append(
            TimelineEventType::AgentStarted,
            Some(WorkflowPhase::Detection),
            Some("detection"),
            BTreeMap::new(),
        );
        timeline.append(
            TimelineEventType::AgentFailed,
            Some(WorkflowPhase::Analysis),
            Some("diagnosis"),
            metadata([("error", json!("Upstream timeout from metrics API"))]),
        );
        timeline
    }

    #[test]
    fn test_sequences_are_dense_and_ordered() {
        let timeline = sample();
        for (i, event) in timeline.events().iter().enumerate() {
            assert_eq!(event.sequence, i as u64);
        }
        for pair in timeline.events().windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[test]
    fn test_filter_by_role_and_phase() {
        let timeline = sample();
        let by_role = timeline.filter(&TimelineFilter::default().role("diagnosis"));
        assert_eq!(by_role.len(), 1);
        let by_phase = timeline.filter(&TimelineFilter::default().phase(WorkflowPhase::Detection));
        assert_eq!(by_phase.len(), 2);
        let combined = timeline.filter(
            &TimelineFilter::default()
                .phase(WorkflowPhase::Detection)
                .event_type(TimelineEventType::AgentStarted),
        );
        assert_eq!(combined.len(), 1);
    }

    #[test]
    fn test_free_text_search_covers_metadata() {
        let timeline = sample();
        let hits = timeline.filter(&TimelineFilter::default().text("UPSTREAM"));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].role.as_deref(), Some("diagnosis"));
        let hits = timeline.filter(&TimelineFilter::default().text("incident_started"));
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_json_roundtrip_preserves_events() {
        let timeline = sample();
        let json = timeline.to_json().unwrap();
        let parsed = Timeline::from_json(&json).unwrap();
        assert_eq!(parsed, timeline);
        assert_eq!(parsed.events()[2].metadata["error"], "Upstream timeout from metrics API");
    }
}
