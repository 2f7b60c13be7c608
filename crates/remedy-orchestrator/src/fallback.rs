use remedy_core::{RemedyError, RemedyResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

fn default_confidence_threshold() -> f64 {
    0.5
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// Ordered degradation strategies for one role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackChain {
    pub primary_role: String,
    /// Strategy names, attempted in this order.
    #[serde(default)]
    pub strategies: Vec<String>,
    /// Confidence below which a successful result is marked degraded.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// Bound on the primary invocation and on each strategy attempt.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl FallbackChain {
    pub fn new(primary_role: impl Into<String>, strategies: &[&str]) -> Self {
        Self {
            primary_role: primary_role.into(),
            strategies: strategies.iter().map(|s| s.to_string()).collect(),
            confidence_threshold: default_confidence_threshold(),
            timeout_ms: default_timeout_ms(),
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Fallback chains keyed by primary role. Read-only once the coordinator
/// is built.
#[derive(Debug, Clone, Default)]
pub struct FallbackRegistry {
    chains: HashMap<String, FallbackChain>,
}

impl FallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a chain. A role may only have one chain.
    pub fn register(&mut self, chain: FallbackChain) -> RemedyResult<()> {
        if self.chains.contains_key(&chain.primary_role) {
            return Err(RemedyError::Configuration(format!(
                "Fallback chain for '{}' is defined twice",
                chain.primary_role
            )));
        }
        self.chains.insert(chain.primary_role.clone(), chain);
        Ok(())
    }

    pub fn from_chains(chains: impl IntoIterator<Item = FallbackChain>) -> RemedyResult<Self> {
        let mut registry = Self::new();
        for chain in chains {
            registry.register(chain)?;
        }
        Ok(registry)
    }

    pub fn get(&self, role: &str) -> Option<&FallbackChain> {
        self.chains.get(role)
    }

    /// Every strategy name referenced by any chain.
    pub fn strategy_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .chains
            .values()
            .flat_map(|c| c.strategies.iter().map(String::as_str))
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.chains.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_defaults_from_toml_like_json() {
        let chain: FallbackChain = serde_json::from_str(
            r#"{"primary_role": "diagnosis", "strategies": ["pattern_matching_diagnosis"]}"#,
        )
        .unwrap();
        assert_eq!(chain.confidence_threshold, 0.5);
        assert_eq!(chain.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = FallbackRegistry::new();
        registry
            .register(FallbackChain::new("diagnosis", &["a", "b"]))
            .unwrap();
        assert!(registry
            .register(FallbackChain::new("diagnosis", &["c"]))
            .is_err());
        assert_eq!(registry.get("diagnosis").unwrap().strategies, vec!["a", "b"]);
        assert!(registry.get("prediction").is_none());
    }

    #[test]
    fn test_strategy_names_are_unique() {
        let registry = FallbackRegistry::from_chains([
            FallbackChain::new("diagnosis", &["rules", "history"]),
            FallbackChain::new("prediction", &["history"]),
        ])
        .unwrap();
        assert_eq!(registry.strategy_names(), vec!["history", "rules"]);
    }
}
