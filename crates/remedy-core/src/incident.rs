use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// How severe an incident is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Lifecycle status of an incident. Only the coordinator changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Open,
    Processing,
    AwaitingApproval,
    Resolved,
    Failed,
}

/// Business impact metrics attached to an incident.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusinessImpact {
    /// Number of users affected.
    #[serde(default)]
    pub affected_users: u64,
    /// Estimated revenue lost per minute, in the reporting currency.
    #[serde(default)]
    pub revenue_loss_per_minute: f64,
    /// Services touched by the incident.
    #[serde(default)]
    pub affected_services: Vec<String>,
}

/// An incident handed to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    #[serde(default)]
    pub business_impact: BusinessImpact,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub status: IncidentStatus,
    pub detected_at: DateTime<Utc>,
}

impl Incident {
    /// Create an open incident with a fresh id.
    pub fn new(title: impl Into<String>, severity: Severity) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: String::new(),
            severity,
            business_impact: BusinessImpact::default(),
            tags: Vec::new(),
            metadata: HashMap::new(),
            status: IncidentStatus::Open,
            detected_at: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_impact(mut self, impact: BusinessImpact) -> Self {
        self.business_impact = impact;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}
