use crate::fallback::FallbackChain;
use crate::graph::RoleSpec;

/// The standard incident-response roles.
///
/// Detection runs alone, diagnosis and prediction run concurrently on its
/// output, and resolution and communication act on the consensus decision.
pub fn default_roles() -> Vec<RoleSpec> {
    vec![
        RoleSpec::analysis("detection", &[]),
        RoleSpec::analysis("diagnosis", &["detection"]),
        RoleSpec::analysis("prediction", &["detection"]),
        RoleSpec::action("resolution", &["diagnosis", "prediction"]),
        RoleSpec::action("communication", &["diagnosis", "prediction"]),
    ]
}

/// Fallback chains for [`default_roles`].
pub fn default_fallback_chains() -> Vec<FallbackChain> {
    vec![
        detection_chain(),
        diagnosis_chain(),
        prediction_chain(),
        resolution_chain(),
        communication_chain(),
    ]
}

fn detection_chain() -> FallbackChain {
    FallbackChain::new("detection", &["threshold_detection", "rule_based_detection"])
        .with_threshold(0.8)
        .with_timeout_ms(15_000)
}

fn diagnosis_chain() -> FallbackChain {
    FallbackChain::new(
        "diagnosis",
        &["pattern_matching_diagnosis", "historical_diagnosis"],
    )
    .with_threshold(0.7)
    .with_timeout_ms(30_000)
}

fn prediction_chain() -> FallbackChain {
    FallbackChain::new("prediction", &["trend_extrapolation_prediction"])
        .with_threshold(0.6)
        .with_timeout_ms(30_000)
}

fn resolution_chain() -> FallbackChain {
    FallbackChain::new("resolution", &["runbook_resolution"])
        .with_threshold(0.8)
        .with_timeout_ms(60_000)
}

fn communication_chain() -> FallbackChain {
    FallbackChain::new("communication", &["template_communication"])
        .with_threshold(0.5)
        .with_timeout_ms(10_000)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::fallback::FallbackRegistry;
    use crate::graph::{DependencyGraph, Stage};

    #[test]
    fn test_default_roles_form_valid_graph() {
        let graph = DependencyGraph::new(default_roles()).unwrap();
        let plan = graph.execution_plan();
        assert_eq!(plan.detection_roles(), ["detection".to_string()]);
        assert_eq!(plan.analysis[1], vec!["diagnosis", "prediction"]);
        assert_eq!(plan.action, vec![vec!["communication", "resolution"]]);
        assert_eq!(graph.get("resolution").unwrap().stage, Stage::Action);
    }

    #[test]
    fn test_every_default_role_has_a_chain() {
        let registry = FallbackRegistry::from_chains(default_fallback_chains()).unwrap();
        for role in default_roles() {
            let chain = registry.get(&role.name).unwrap();
            assert!(!chain.strategies.is_empty());
        }
        assert_eq!(
            registry.get("diagnosis").unwrap().strategies[0],
            "pattern_matching_diagnosis"
        );
    }
}
