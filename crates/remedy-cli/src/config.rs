use remedy_consensus::PbftConfig;
use remedy_core::RiskLevel;
use remedy_orchestrator::{
    default_fallback_chains, default_roles, CoordinatorConfig, FallbackChain, RoleSpec,
};
use serde::Deserialize;
use std::path::Path;

/// Contents of `remedy.toml`.
#[derive(Debug, Deserialize)]
pub struct RemedyConfig {
    #[serde(default = "default_roles")]
    pub roles: Vec<RoleSpec>,
    #[serde(default = "default_fallback_chains")]
    pub fallbacks: Vec<FallbackChain>,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub consensus: ConsensusSettings,
    /// Simulated primary agents, one per role. Roles without an entry get
    /// [`AgentBehaviour::default`].
    #[serde(default)]
    pub agents: Vec<AgentBehaviour>,
    /// Simulated fallback strategies, keyed by strategy name.
    #[serde(default)]
    pub strategies: Vec<AgentBehaviour>,
    #[serde(default)]
    pub channels: ChannelSettings,
}

impl RemedyConfig {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// The configured behaviour for `role`, or the default one.
    pub fn agent_for(&self, role: &str) -> AgentBehaviour {
        self.agents
            .iter()
            .find(|a| a.name == role)
            .cloned()
            .unwrap_or_else(|| AgentBehaviour {
                name: role.to_string(),
                ..AgentBehaviour::default()
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusMethod {
    #[default]
    Pbft,
    Weighted,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsensusSettings {
    #[serde(default)]
    pub method: ConsensusMethod,
    #[serde(default = "default_nodes")]
    pub nodes: usize,
    #[serde(default = "default_consensus_timeout_ms")]
    pub timeout_ms: u64,
    /// Fall back to weighted voting when PBFT cannot reach a quorum.
    #[serde(default = "default_true")]
    pub weighted_fallback: bool,
    /// Share of the weighted score below which a vote needs approval.
    #[serde(default = "default_approval_threshold")]
    pub approval_threshold: f64,
    #[serde(default)]
    pub pbft: PbftConfig,
}

impl Default for ConsensusSettings {
    fn default() -> Self {
        Self {
            method: ConsensusMethod::default(),
            nodes: default_nodes(),
            timeout_ms: default_consensus_timeout_ms(),
            weighted_fallback: true,
            approval_threshold: default_approval_threshold(),
            pbft: PbftConfig::default(),
        }
    }
}

/// How a simulated agent or fallback strategy answers.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentBehaviour {
    /// Role or strategy name.
    pub name: String,
    #[serde(default = "default_action")]
    pub action: String,
    #[serde(default = "default_action_type")]
    pub action_type: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default = "default_risk")]
    pub risk: RiskLevel,
    #[serde(default)]
    pub delay_ms: u64,
    /// Answer every invocation with an error.
    #[serde(default)]
    pub fail: bool,
    #[serde(default = "default_true")]
    pub healthy: bool,
}

impl Default for AgentBehaviour {
    fn default() -> Self {
        Self {
            name: String::new(),
            action: default_action(),
            action_type: default_action_type(),
            confidence: default_confidence(),
            risk: default_risk(),
            delay_ms: 0,
            fail: false,
            healthy: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelSettings {
    /// Names of tracing-backed channels to escalate to.
    #[serde(default = "default_channel_names")]
    pub log: Vec<String>,
    #[serde(default = "default_channel_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            log: default_channel_names(),
            timeout_ms: default_channel_timeout_ms(),
        }
    }
}

fn default_nodes() -> usize {
    4
}
fn default_consensus_timeout_ms() -> u64 {
    5_000
}
fn default_true() -> bool {
    true
}
fn default_approval_threshold() -> f64 {
    0.7
}
fn default_action() -> String {
    "restart_service".to_string()
}
fn default_action_type() -> String {
    "remediation".to_string()
}
fn default_confidence() -> f64 {
    0.8
}
fn default_risk() -> RiskLevel {
    RiskLevel::Medium
}
fn default_channel_names() -> Vec<String> {
    vec!["log".to_string()]
}
fn default_channel_timeout_ms() -> u64 {
    2_000
}
