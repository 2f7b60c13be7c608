mod agents;
mod config;

use agents::SimulatedAgent;
use clap::{Parser, Subcommand};
use config::{ConsensusMethod, RemedyConfig};
use remedy_channels::{ChannelManager, LogChannel};
use remedy_consensus::{
    ConsensusStrategy, FailoverConsensus, PbftCluster, PbftStrategy, WeightedVotingStrategy,
};
use remedy_core::{Incident, Severity};
use remedy_orchestrator::{Coordinator, DependencyGraph, FallbackRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "remedy", about = "Remedy: incident-response coordination with Byzantine consensus")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "remedy.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one incident through the workflow and print its final state
    Run {
        #[arg(long, default_value = "Unlabelled incident")]
        title: String,
        /// low, medium, high or critical
        #[arg(long, default_value = "high", value_parser = parse_severity)]
        severity: Severity,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Print the role dependency graph and its execution levels
    Graph,
    /// Probe the agents and print per-role health
    Health,
}

fn parse_severity(s: &str) -> Result<Severity, String> {
    match s.to_lowercase().as_str() {
        "low" => Ok(Severity::Low),
        "medium" => Ok(Severity::Medium),
        "high" => Ok(Severity::High),
        "critical" => Ok(Severity::Critical),
        other => Err(format!("unknown severity '{other}'")),
    }
}

fn build_consensus(config: &RemedyConfig) -> anyhow::Result<Arc<dyn ConsensusStrategy>> {
    let settings = &config.consensus;
    let weighted: Arc<dyn ConsensusStrategy> =
        Arc::new(WeightedVotingStrategy::new(settings.approval_threshold));
    match settings.method {
        ConsensusMethod::Weighted => Ok(weighted),
        ConsensusMethod::Pbft => {
            let cluster = Arc::new(PbftCluster::start(settings.nodes, settings.pbft.clone())?);
            info!(nodes = cluster.size(), "PBFT cluster started");
            let pbft: Arc<dyn ConsensusStrategy> = Arc::new(PbftStrategy::new(
                cluster,
                Duration::from_millis(settings.timeout_ms),
            ));
            if settings.weighted_fallback {
                Ok(Arc::new(FailoverConsensus::new(pbft, weighted)))
            } else {
                Ok(pbft)
            }
        }
    }
}

fn build_coordinator(config: &RemedyConfig) -> anyhow::Result<Coordinator> {
    let graph = DependencyGraph::new(config.roles.clone())?;
    let fallbacks = FallbackRegistry::from_chains(config.fallbacks.clone())?;
    let consensus = build_consensus(config)?;

    let mut channels = ChannelManager::new(Duration::from_millis(config.channels.timeout_ms));
    for name in &config.channels.log {
        channels.add_channel(Box::new(LogChannel::new(name.as_str())));
    }

    let coordinator = Coordinator::new(graph, fallbacks, consensus, config.coordinator.clone())?
        .with_gateway(Arc::new(channels));

    let roles: Vec<String> = coordinator
        .dependency_graph()
        .roles()
        .map(|r| r.name.clone())
        .collect();
    for role in &roles {
        let agent = SimulatedAgent::new(config.agent_for(role));
        coordinator.register(role, Arc::new(agent))?;
    }
    for strategy in &config.strategies {
        coordinator.register_fallback(&strategy.name, Arc::new(SimulatedAgent::new(strategy.clone())));
    }
    Ok(coordinator)
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = RemedyConfig::load(&cli.config).await?;
    let coordinator = build_coordinator(&config)?;

    match cli.command {
        Commands::Run {
            title,
            severity,
            description,
            tags,
        } => {
            let mut incident = Incident::new(title, severity).with_description(description);
            for tag in tags {
                incident = incident.with_tag(tag);
            }
            let state = coordinator.run(incident).await?;
            print_json(&state)?;
        }
        Commands::Graph => {
            print_json(&coordinator.graph())?;
        }
        Commands::Health => {
            let healthy = coordinator.health_check().await;
            let roles = coordinator.role_health().await;
            print_json(&serde_json::json!({ "healthy": healthy, "roles": roles }))?;
        }
    }

    Ok(())
}
