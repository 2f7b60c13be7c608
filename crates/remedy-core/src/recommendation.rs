use serde::{Deserialize, Serialize};

/// Risk of carrying out a recommended action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Lenient parse used for config files; unknown values map to `Medium`.
    pub fn parse_level(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "low" => RiskLevel::Low,
            "medium" => RiskLevel::Medium,
            "high" => RiskLevel::High,
            "critical" => RiskLevel::Critical,
            _ => RiskLevel::Medium,
        }
    }
}

/// A remediation proposal produced by one agent role.
///
/// Owned by the coordinator until handed to consensus; read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecommendation {
    /// Role that produced the recommendation.
    pub role: String,
    /// Identifier of the proposed action, e.g. `scale_database_connections`.
    pub action_id: String,
    /// Category of the action, e.g. `scaling` or `rollback`.
    pub action_type: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    pub risk_level: RiskLevel,
    pub reasoning: String,
    #[serde(default)]
    pub evidence: Vec<String>,
}

impl AgentRecommendation {
    /// Create a recommendation; `confidence` is clamped into `[0, 1]`.
    pub fn new(
        role: impl Into<String>,
        action_id: impl Into<String>,
        action_type: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            role: role.into(),
            action_id: action_id.into(),
            action_type: action_type.into(),
            confidence: clamp_confidence(confidence),
            risk_level: RiskLevel::Medium,
            reasoning: String::new(),
            evidence: Vec::new(),
        }
    }

    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk_level = risk;
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence.push(evidence.into());
        self
    }
}

fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
