use crate::config::PbftConfig;
use crate::crypto::NodeKeypair;
use crate::engine::PbftEngine;
use crate::node::NodeRegistry;
use crate::transport::LocalNetwork;
use remedy_core::{RemedyError, RemedyResult};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// A set of in-process PBFT nodes wired together over a [`LocalNetwork`].
///
/// Each node gets a freshly generated Ed25519 keypair; every registry holds
/// all public keys, so membership is fixed for the cluster's lifetime.
pub struct PbftCluster {
    engines: Vec<Arc<PbftEngine>>,
    network: Arc<LocalNetwork>,
    pumps: Vec<JoinHandle<()>>,
}

impl PbftCluster {
    /// Start `size` nodes named `node-0` .. `node-{size-1}`.
    pub fn start(size: usize, config: PbftConfig) -> RemedyResult<Self> {
        if size == 0 {
            return Err(RemedyError::Configuration(
                "PBFT cluster needs at least one node".into(),
            ));
        }

        let width = (size - 1).to_string().len();
        let identities: Vec<(String, NodeKeypair)> = (0..size)
            .map(|i| (format!("node-{i:0width$}"), NodeKeypair::generate()))
            .collect();
        let mut registry = NodeRegistry::new();
        for (id, keypair) in &identities {
            registry.register(id.clone(), keypair.public_key())?;
        }

        let network = LocalNetwork::new();
        let mut engines = Vec::with_capacity(size);
        let mut pumps = Vec::with_capacity(size);
        for (id, keypair) in identities {
            let engine = Arc::new(PbftEngine::new(
                id,
                keypair,
                registry.clone(),
                network.clone(),
                config.clone(),
            )?);
            pumps.push(network.connect(engine.clone()));
            engines.push(engine);
        }

        info!(
            nodes = size,
            fault_tolerance = registry.fault_tolerance(),
            quorum = registry.quorum_size(),
            "PBFT cluster started"
        );
        Ok(Self {
            engines,
            network,
            pumps,
        })
    }

    pub fn engines(&self) -> &[Arc<PbftEngine>] {
        &self.engines
    }

    pub fn engine(&self, node_id: &str) -> Option<&Arc<PbftEngine>> {
        self.engines.iter().find(|e| e.node_id() == node_id)
    }

    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }

    pub fn size(&self) -> usize {
        self.engines.len()
    }

    /// The engine that considers itself primary in the most advanced view.
    pub fn primary(&self) -> Option<&Arc<PbftEngine>> {
        self.engines
            .iter()
            .filter(|e| e.is_primary())
            .max_by_key(|e| e.current_view())
    }
}

impl Drop for PbftCluster {
    fn drop(&mut self) {
        self.network.shutdown();
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use remedy_core::{AgentRecommendation, Incident, Severity};
    use std::time::Duration;

    #[tokio::test]
    async fn test_cluster_decides() {
        let cluster = PbftCluster::start(4, PbftConfig::default()).unwrap();
        assert_eq!(cluster.size(), 4);
        let primary = cluster.primary().unwrap().clone();
        assert_eq!(primary.node_id(), "node-0");

        let incident = Incident::new("DB connection pool exhausted", Severity::High);
        let rec = AgentRecommendation::new("diagnosis", "scale_database_connections", "scale", 0.85);
        let sequence = primary.propose_action(&incident, &rec).await.unwrap();
        let decision = primary
            .wait_for_consensus(sequence, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(decision.selected_action, "scale_database_connections");
        assert_eq!(decision.method, "pbft");
        assert!((decision.final_confidence - 1.0).abs() < f64::EPSILON);
        assert!(decision.participating_agents.len() >= 3);
        assert_eq!(decision.quorum_size, 3);
        assert_eq!(decision.total_nodes, 4);
        assert_eq!(decision.sequence, Some(sequence));

        // Every backup converges on the same decision
        for engine in cluster.engines() {
            let local = engine
                .wait_for_consensus(sequence, Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(local.selected_action, decision.selected_action);
        }
        assert_eq!(primary.completed_rounds().len(), 1);
    }

    #[tokio::test]
    async fn test_backup_cannot_propose() {
        let cluster = PbftCluster::start(4, PbftConfig::default()).unwrap();
        let backup = cluster.engine("node-2").unwrap();
        let incident = Incident::new("latency", Severity::Low);
        let rec = AgentRecommendation::new("diagnosis", "restart", "restart", 0.5);
        let err = backup.propose_action(&incident, &rec).await.unwrap_err();
        assert!(matches!(
            err,
            RemedyError::NotPrimary { ref primary, .. } if primary == "node-0"
        ));
    }

    #[test]
    fn test_empty_cluster_rejected() {
        assert!(matches!(
            PbftCluster::start(0, PbftConfig::default()),
            Err(RemedyError::Configuration(_))
        ));
    }
}
