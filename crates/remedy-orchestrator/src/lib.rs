//! Incident workflow coordination over a static role dependency graph.
//!
//! Roles are grouped into levels that run concurrently behind a barrier.
//! Failed or slow agents are gated by circuit breakers and degraded through
//! ordered fallback chains; a chain that runs out escalates to humans
//! instead of failing the workflow.
//!
//! # Main types
//!
//! - [`Coordinator`]: Runs workflows and answers status, timeline, graph and health queries.
//! - [`DependencyGraph`]: Validated role graph and its [`ExecutionPlan`].
//! - [`FallbackRegistry`]: Per-role [`FallbackChain`]s.
//! - [`CircuitBreakerRegistry`]: Default [`CircuitBreakerGate`].
//! - [`AgentInvocable`]: Port implemented by agents and fallback strategies.
//! - [`RoleMonitor`]: Per-role health and counters.

/// Agent invocation port.
pub mod agent;
/// Circuit breakers.
pub mod breaker;
/// Execution checkpoints.
pub mod checkpoint;
/// Coordinator configuration.
pub mod config;
/// The workflow coordinator.
pub mod engine;
/// Fallback chains.
pub mod fallback;
/// Role dependency graph and execution planning.
pub mod graph;
/// Role health and metrics monitoring.
pub mod monitor;
/// Default incident-response roles and fallback chains.
pub mod profiles;
/// Supervised join-all over spawned tasks.
pub mod supervisor;

pub use agent::{AgentInvocable, AgentRequest};
pub use breaker::{BreakerState, CircuitBreakerGate, CircuitBreakerRegistry};
pub use checkpoint::{spawn_checkpointer, CheckpointStore};
pub use config::CoordinatorConfig;
pub use engine::{Coordinator, ExecutionSummary, IncidentStatusView, RoleHealth};
pub use fallback::{FallbackChain, FallbackRegistry};
pub use graph::{DependencyGraph, ExecutionPlan, GraphView, RoleSpec, Stage};
pub use monitor::{RoleHealthState, RoleMetrics, RoleMonitor, RoleState, WorkerStatus};
pub use profiles::{default_fallback_chains, default_roles};
pub use supervisor::{partition, supervise, TaskOutcome};
