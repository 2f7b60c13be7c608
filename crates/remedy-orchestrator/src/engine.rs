use crate::agent::{AgentInvocable, AgentRequest};
use crate::breaker::{BreakerState, CircuitBreakerGate, CircuitBreakerRegistry};
use crate::checkpoint::{spawn_checkpointer, CheckpointStore};
use crate::config::CoordinatorConfig;
use crate::fallback::{FallbackChain, FallbackRegistry};
use crate::graph::{DependencyGraph, ExecutionPlan, GraphView};
use crate::monitor::{RoleHealthState, RoleMonitor};
use crate::supervisor::supervise;
use chrono::Utc;
use futures_util::future::join_all;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use remedy_consensus::{unresolved_decision, ConsensusStrategy};
use remedy_core::timeline::metadata;
use remedy_core::{
    AgentExecution, AgentRecommendation, ConsensusDecision, EscalationPayload, ExecutionStatus,
    Incident, IncidentStatus, NotificationGateway, ProcessingState, RemedyError, RemedyResult,
    TimelineEvent, TimelineEventType, TimelineFilter, WorkflowPhase,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

type Invocables = HashMap<String, Arc<dyn AgentInvocable>>;

/// Per-role line of a status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub status: ExecutionStatus,
    pub recommendations: usize,
    pub duration_ms: Option<i64>,
    pub last_error: Option<String>,
    pub fallback_strategy: Option<String>,
}

impl From<&AgentExecution> for ExecutionSummary {
    fn from(execution: &AgentExecution) -> Self {
        Self {
            status: execution.status,
            recommendations: execution.recommendations.len(),
            duration_ms: execution.duration_ms(),
            last_error: execution.last_error.clone(),
            fallback_strategy: execution.fallback_strategy.clone(),
        }
    }
}

/// Answer to a per-incident status query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentStatusView {
    pub incident_id: Uuid,
    pub workflow_id: Uuid,
    pub phase: WorkflowPhase,
    pub incident_status: IncidentStatus,
    pub executions: BTreeMap<String, ExecutionSummary>,
    pub decision: Option<ConsensusDecision>,
    pub error: Option<String>,
    pub timeline_events: usize,
    /// Whether the workflow is still running.
    pub active: bool,
}

impl IncidentStatusView {
    fn from_state(state: &ProcessingState, active: bool) -> Self {
        Self {
            incident_id: state.incident.id,
            workflow_id: state.workflow_id,
            phase: state.phase,
            incident_status: state.incident.status,
            executions: state
                .executions
                .iter()
                .map(|(role, e)| (role.clone(), ExecutionSummary::from(e)))
                .collect(),
            decision: state.decision.clone(),
            error: state.error.clone(),
            timeline_events: state.timeline.len(),
            active,
        }
    }
}

/// Answer to a per-role health query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleHealth {
    pub role: String,
    pub healthy: bool,
    pub health: RoleHealthState,
    pub breaker: BreakerState,
    pub registered: bool,
    pub processed: u64,
    pub errors: u64,
    pub fallbacks: u64,
    pub escalations: u64,
}

#[derive(Default)]
struct Archive {
    states: HashMap<Uuid, ProcessingState>,
    order: VecDeque<Uuid>,
}

/// Runs incident workflows over a static role dependency graph.
///
/// Analysis levels run first, each level concurrently and behind a barrier.
/// Their recommendations go to the consensus strategy, and action levels run
/// on the decision unless it needs human approval. Agent failures walk the
/// role's fallback chain and end in an escalation rather than an error.
pub struct Coordinator {
    graph: DependencyGraph,
    plan: ExecutionPlan,
    fallbacks: Arc<FallbackRegistry>,
    config: CoordinatorConfig,
    consensus: Arc<dyn ConsensusStrategy>,
    agents: RwLock<Invocables>,
    strategies: RwLock<Invocables>,
    breaker: Arc<dyn CircuitBreakerGate>,
    gateway: Option<Arc<dyn NotificationGateway>>,
    monitor: Arc<RoleMonitor>,
    checkpoints: Arc<CheckpointStore>,
    active: RwLock<HashMap<Uuid, Arc<Mutex<ProcessingState>>>>,
    archive: RwLock<Archive>,
}

impl Coordinator {
    /// Build a coordinator. Fails if a fallback chain names a role that is
    /// not in the graph.
    pub fn new(
        graph: DependencyGraph,
        fallbacks: FallbackRegistry,
        consensus: Arc<dyn ConsensusStrategy>,
        config: CoordinatorConfig,
    ) -> RemedyResult<Self> {
        if let Some(unknown) = fallbacks.roles().find(|role| !graph.contains(role)) {
            return Err(RemedyError::Configuration(format!(
                "Fallback chain defined for unknown role '{unknown}'"
            )));
        }

        let plan = graph.execution_plan();
        let monitor = RoleMonitor::new(graph.roles().map(|r| r.name.as_str()));
        let breaker = CircuitBreakerRegistry::new(
            config.breaker_failure_threshold,
            config.breaker_recovery(),
        );
        info!(
            roles = graph.len(),
            analysis_levels = plan.analysis.len(),
            action_levels = plan.action.len(),
            consensus = consensus.method(),
            "Coordinator ready"
        );

        Ok(Self {
            checkpoints: Arc::new(CheckpointStore::new(config.checkpoint_history)),
            graph,
            plan,
            fallbacks: Arc::new(fallbacks),
            config,
            consensus,
            agents: RwLock::new(HashMap::new()),
            strategies: RwLock::new(HashMap::new()),
            breaker: Arc::new(breaker),
            gateway: None,
            monitor: Arc::new(monitor),
            active: RwLock::new(HashMap::new()),
            archive: RwLock::new(Archive::default()),
        })
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn NotificationGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Replace the default counting circuit breakers.
    pub fn with_breaker(mut self, breaker: Arc<dyn CircuitBreakerGate>) -> Self {
        self.breaker = breaker;
        self
    }

    /// Bind `role` to its agent. Registering a role again replaces the agent.
    pub fn register(&self, role: &str, agent: Arc<dyn AgentInvocable>) -> RemedyResult<()> {
        if !self.graph.contains(role) {
            return Err(RemedyError::NotFound(format!("Role '{role}'")));
        }
        self.agents.write().insert(role.to_string(), agent);
        info!(role, "Agent registered");
        Ok(())
    }

    /// Bind a fallback strategy name to its implementation.
    pub fn register_fallback(&self, strategy: &str, invocable: Arc<dyn AgentInvocable>) {
        self.strategies.write().insert(strategy.to_string(), invocable);
    }

    pub fn is_registered(&self, role: &str) -> bool {
        self.agents.read().contains_key(role)
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn dependency_graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Nodes, edges, topological order and levels of the role graph.
    pub fn graph(&self) -> GraphView {
        self.graph.introspect()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<RoleMonitor> {
        &self.monitor
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    pub fn breaker(&self) -> &Arc<dyn CircuitBreakerGate> {
        &self.breaker
    }

    /// Run the full workflow for `incident` and return its archived state.
    ///
    /// Agent, fallback and quorum failures are absorbed into the returned
    /// state; only an attempt to run an incident that is already running
    /// is an error.
    pub async fn run(&self, incident: Incident) -> RemedyResult<ProcessingState> {
        let incident_id = incident.id;
        let state = {
            let mut active = self.active.write();
            if active.contains_key(&incident_id) {
                return Err(RemedyError::Configuration(format!(
                    "Incident {incident_id} is already being processed"
                )));
            }
            let mut state = ProcessingState::new(incident);
            state.incident.status = IncidentStatus::Processing;
            let state = Arc::new(Mutex::new(state));
            active.insert(incident_id, state.clone());
            state
        };

        {
            let mut guard = state.lock();
            let meta = metadata([
                ("title", json!(guard.incident.title)),
                ("severity", json!(guard.incident.severity)),
                ("workflow_id", json!(guard.workflow_id)),
            ]);
            guard.timeline.append(
                TimelineEventType::IncidentStarted,
                Some(WorkflowPhase::Detection),
                None,
                meta,
            );
            info!(
                incident_id = %incident_id,
                severity = %guard.incident.severity,
                "Workflow started"
            );
        }

        let runner = Arc::new(RoleRunner {
            state: state.clone(),
            agents: self.agents.read().clone(),
            strategies: self.strategies.read().clone(),
            fallbacks: self.fallbacks.clone(),
            breaker: self.breaker.clone(),
            gateway: self.gateway.clone(),
            monitor: self.monitor.clone(),
            checkpoints: self.checkpoints.clone(),
            config: self.config.clone(),
        });
        let ticker = spawn_checkpointer(
            self.checkpoints.clone(),
            state.clone(),
            self.config.checkpoint_interval(),
        );

        self.drive(&runner).await;
        ticker.abort();

        let finished = state.lock().clone();
        self.checkpoints.record(&finished);
        self.archive(finished.clone());
        info!(
            incident_id = %incident_id,
            phase = %finished.phase,
            events = finished.timeline.len(),
            "Workflow finished"
        );
        Ok(finished)
    }

    async fn drive(&self, runner: &Arc<RoleRunner>) {
        let incident_id = runner.incident_id();

        for (index, roles) in self.plan.analysis.iter().enumerate() {
            let phase = if index == 0 {
                WorkflowPhase::Detection
            } else {
                WorkflowPhase::Analysis
            };
            let request = runner.enter_level(phase, index, roles, None);
            runner.run_level(roles, phase, request).await;

            if index == 0 && runner.state.lock().recommendations().is_empty() {
                self.fail(runner, RemedyError::NoRecommendations { incident_id });
                return;
            }
        }

        let (incident, recommendations) = {
            let guard = runner.state.lock();
            (guard.incident.clone(), guard.recommendations())
        };
        if recommendations.is_empty() {
            self.fail(runner, RemedyError::NoRecommendations { incident_id });
            return;
        }

        let Some(decision) = self.reach_consensus(runner, &incident, &recommendations).await else {
            return;
        };

        if decision.requires_human_approval {
            {
                let mut guard = runner.state.lock();
                let meta = metadata([
                    ("action", json!(decision.selected_action)),
                    ("method", json!(decision.method)),
                    ("risk_level", json!(decision.risk_level)),
                ]);
                guard.timeline.append(
                    TimelineEventType::HumanApprovalRequired,
                    Some(WorkflowPhase::Consensus),
                    None,
                    meta,
                );
                skip_levels(&mut guard, &self.plan.action, "awaiting human approval");
            }
            warn!(
                incident_id = %incident_id,
                action = %decision.selected_action,
                "Decision requires human approval, action roles skipped"
            );
        } else {
            for (index, roles) in self.plan.action.iter().enumerate() {
                let request =
                    runner.enter_level(WorkflowPhase::Resolution, index, roles, Some(&decision));
                runner
                    .run_level(roles, WorkflowPhase::Resolution, request)
                    .await;
            }
        }

        self.complete(runner, &decision);
    }

    /// Ask the consensus strategy for a decision. Quorum-impossibility errors
    /// become an unresolved decision flagged for approval; anything else
    /// fails the workflow.
    async fn reach_consensus(
        &self,
        runner: &RoleRunner,
        incident: &Incident,
        recommendations: &[AgentRecommendation],
    ) -> Option<ConsensusDecision> {
        {
            let mut guard = runner.state.lock();
            guard.phase = WorkflowPhase::Consensus;
            let meta = metadata([
                ("recommendations", json!(recommendations.len())),
                ("method", json!(self.consensus.method())),
            ]);
            guard.timeline.append(
                TimelineEventType::ConsensusStarted,
                Some(WorkflowPhase::Consensus),
                None,
                meta,
            );
        }

        let decision = match self.consensus.decide(incident, recommendations).await {
            Ok(decision) => {
                let meta = metadata([
                    ("action", json!(decision.selected_action)),
                    ("final_confidence", json!(decision.final_confidence)),
                    ("method", json!(decision.method)),
                    ("participants", json!(decision.participating_agents)),
                    ("quorum_size", json!(decision.quorum_size)),
                    ("total_nodes", json!(decision.total_nodes)),
                    ("requires_human_approval", json!(decision.requires_human_approval)),
                ]);
                runner.record(
                    TimelineEventType::ConsensusReached,
                    WorkflowPhase::Consensus,
                    None,
                    meta,
                );
                info!(
                    incident_id = %incident.id,
                    action = %decision.selected_action,
                    method = %decision.method,
                    "Consensus reached"
                );
                decision
            }
            Err(e) if e.requires_human_approval() => {
                warn!(incident_id = %incident.id, error = %e, "Consensus not reached");
                let Some(decision) =
                    unresolved_decision(incident, recommendations, self.config.approval_threshold)
                else {
                    self.fail(runner, e);
                    return None;
                };
                let meta = metadata([
                    ("error", json!(e.to_string())),
                    ("proposed_action", json!(decision.selected_action)),
                ]);
                runner.record(
                    TimelineEventType::ConsensusFailed,
                    WorkflowPhase::Consensus,
                    None,
                    meta,
                );
                decision
            }
            Err(e) => {
                let meta = metadata([("error", json!(e.to_string()))]);
                runner.record(
                    TimelineEventType::ConsensusFailed,
                    WorkflowPhase::Consensus,
                    None,
                    meta,
                );
                self.fail(runner, e);
                return None;
            }
        };

        runner.state.lock().decision = Some(decision.clone());
        Some(decision)
    }

    fn complete(&self, runner: &RoleRunner, decision: &ConsensusDecision) {
        let mut guard = runner.state.lock();
        let needs_human = decision.requires_human_approval
            || guard
                .executions
                .values()
                .any(|e| e.status == ExecutionStatus::RequiresHumanIntervention);
        guard.incident.status = if needs_human {
            IncidentStatus::AwaitingApproval
        } else {
            IncidentStatus::Resolved
        };
        guard.phase = WorkflowPhase::Completed;
        let now = Utc::now();
        guard.completed_at = Some(now);
        let duration_ms = (now - guard.started_at).num_milliseconds();
        let meta = metadata([
            ("action", json!(decision.selected_action)),
            ("incident_status", json!(guard.incident.status)),
            ("duration_ms", json!(duration_ms)),
        ]);
        guard.timeline.append(
            TimelineEventType::IncidentCompleted,
            Some(WorkflowPhase::Completed),
            None,
            meta,
        );
    }

    /// Fail the workflow; every role that was never dispatched is skipped.
    fn fail(&self, runner: &RoleRunner, error: RemedyError) {
        let mut guard = runner.state.lock();
        let message = error.to_string();
        let levels: Vec<Vec<String>> = self
            .plan
            .analysis
            .iter()
            .chain(self.plan.action.iter())
            .cloned()
            .collect();
        skip_levels(&mut guard, &levels, &message);
        guard.error = Some(message.clone());
        guard.phase = WorkflowPhase::Failed;
        guard.incident.status = IncidentStatus::Failed;
        guard.completed_at = Some(Utc::now());
        guard.timeline.append(
            TimelineEventType::IncidentFailed,
            Some(WorkflowPhase::Failed),
            None,
            metadata([("error", json!(message))]),
        );
        error!(incident_id = %guard.incident.id, error = %message, "Workflow failed");
    }

    fn archive(&self, state: ProcessingState) {
        let incident_id = state.incident.id;
        self.active.write().remove(&incident_id);

        let mut archive = self.archive.write();
        if archive.states.insert(incident_id, state).is_none() {
            archive.order.push_back(incident_id);
        }
        while archive.order.len() > self.config.archive_limit.max(1) {
            if let Some(evicted) = archive.order.pop_front() {
                archive.states.remove(&evicted);
                self.checkpoints.forget(evicted);
            }
        }
    }

    fn shared_state(&self, incident_id: Uuid) -> Option<Arc<Mutex<ProcessingState>>> {
        self.active.read().get(&incident_id).cloned()
    }

    /// Current or archived state of an incident.
    pub fn processing_state(&self, incident_id: Uuid) -> RemedyResult<ProcessingState> {
        if let Some(shared) = self.shared_state(incident_id) {
            return Ok(shared.lock().clone());
        }
        self.archive
            .read()
            .states
            .get(&incident_id)
            .cloned()
            .ok_or_else(|| RemedyError::NotFound(format!("Incident {incident_id}")))
    }

    /// Phase, per-role summary and consensus outcome of an incident.
    pub fn status(&self, incident_id: Uuid) -> RemedyResult<IncidentStatusView> {
        if let Some(shared) = self.shared_state(incident_id) {
            let guard = shared.lock();
            return Ok(IncidentStatusView::from_state(&guard, true));
        }
        self.archive
            .read()
            .states
            .get(&incident_id)
            .map(|state| IncidentStatusView::from_state(state, false))
            .ok_or_else(|| RemedyError::NotFound(format!("Incident {incident_id}")))
    }

    /// Timeline events of an incident matching `filter`.
    pub fn timeline(
        &self,
        incident_id: Uuid,
        filter: &TimelineFilter,
    ) -> RemedyResult<Vec<TimelineEvent>> {
        if let Some(shared) = self.shared_state(incident_id) {
            return Ok(shared.lock().timeline.filter(filter));
        }
        self.archive
            .read()
            .states
            .get(&incident_id)
            .map(|state| state.timeline.filter(filter))
            .ok_or_else(|| RemedyError::NotFound(format!("Incident {incident_id}")))
    }

    pub fn active_incidents(&self) -> Vec<Uuid> {
        self.active.read().keys().copied().collect()
    }

    /// Snapshot the executions of a running incident into the checkpoint
    /// history. Returns the number of roles whose snapshot changed.
    pub fn checkpoint(&self, incident_id: Uuid) -> RemedyResult<usize> {
        let shared = self
            .shared_state(incident_id)
            .ok_or_else(|| RemedyError::NotFound(format!("Active incident {incident_id}")))?;
        let snapshot = shared.lock().clone();
        Ok(self.checkpoints.record(&snapshot))
    }

    /// Healthy iff at least one detection agent (an analysis role without
    /// prerequisites) answers its probe positively within the probe timeout.
    pub async fn health_check(&self) -> bool {
        let agents = self.agents.read().clone();
        let probe_timeout = self.config.health_probe_timeout();
        let probes = self
            .plan
            .detection_roles()
            .iter()
            .filter_map(|role| agents.get(role).cloned().map(|agent| (role.as_str(), agent)))
            .map(|(role, agent)| async move {
                match tokio::time::timeout(probe_timeout, agent.health_check()).await {
                    Ok(healthy) => healthy,
                    Err(_) => {
                        warn!(role, "Health probe timed out");
                        false
                    }
                }
            });
        join_all(probes).await.into_iter().any(|healthy| healthy)
    }

    /// Health, breaker state and counters of every role.
    pub async fn role_health(&self) -> Vec<RoleHealth> {
        let mut report = Vec::with_capacity(self.graph.len());
        for spec in self.graph.roles() {
            let role = spec.name.as_str();
            let breaker = self.breaker.state(role);
            let registered = self.is_registered(role);
            let state = self.monitor.get_state(role).await;
            let (health, metrics) = state
                .map(|s| (s.health, s.metrics))
                .unwrap_or((RoleHealthState::Healthy, Default::default()));
            report.push(RoleHealth {
                role: role.to_string(),
                healthy: registered
                    && breaker != BreakerState::Open
                    && health != RoleHealthState::Unavailable,
                health,
                breaker,
                registered,
                processed: metrics.processed,
                errors: metrics.errors,
                fallbacks: metrics.fallbacks,
                escalations: metrics.escalations,
            });
        }
        report
    }
}

/// Mark the roles of `levels` that never started as skipped, one timeline
/// event per level that had any.
fn skip_levels(state: &mut ProcessingState, levels: &[Vec<String>], reason: &str) {
    let incident_id = state.incident.id;
    for roles in levels {
        let skipped: Vec<&String> = roles
            .iter()
            .filter(|role| !state.executions.contains_key(*role))
            .collect();
        if skipped.is_empty() {
            continue;
        }
        for role in &skipped {
            let mut execution = AgentExecution::pending(role.as_str(), incident_id);
            execution.finish(ExecutionStatus::Skipped);
            state.executions.insert((*role).clone(), execution);
        }
        state.timeline.append(
            TimelineEventType::LevelSkipped,
            Some(state.phase),
            None,
            metadata([("roles", json!(skipped)), ("reason", json!(reason))]),
        );
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Invoke with a bound; timeouts, panics and foreign errors become agent
/// failures, so each one goes through the fallback chain.
async fn invoke_bounded(
    invocable: &dyn AgentInvocable,
    request: &AgentRequest,
    role: &str,
    timeout: Duration,
) -> RemedyResult<Vec<AgentRecommendation>> {
    let guarded = AssertUnwindSafe(invocable.invoke(request)).catch_unwind();
    match tokio::time::timeout(timeout, guarded).await {
        Ok(Ok(Ok(recommendations))) => Ok(recommendations),
        Ok(Ok(Err(e))) if e.is_agent_failure() => Err(e),
        Ok(Ok(Err(e))) => Err(RemedyError::AgentInvocation {
            role: role.to_string(),
            message: e.to_string(),
        }),
        Ok(Err(_)) => {
            error!(role, "Agent panicked");
            Err(RemedyError::AgentInvocation {
                role: role.to_string(),
                message: "agent panicked".into(),
            })
        }
        Err(_) => Err(RemedyError::AgentTimeout {
            role: role.to_string(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

/// Everything one workflow run needs, shared by the tasks of each level.
struct RoleRunner {
    state: Arc<Mutex<ProcessingState>>,
    agents: Invocables,
    strategies: Invocables,
    fallbacks: Arc<FallbackRegistry>,
    breaker: Arc<dyn CircuitBreakerGate>,
    gateway: Option<Arc<dyn NotificationGateway>>,
    monitor: Arc<RoleMonitor>,
    checkpoints: Arc<CheckpointStore>,
    config: CoordinatorConfig,
}

impl RoleRunner {
    fn incident_id(&self) -> Uuid {
        self.state.lock().incident.id
    }

    fn record(
        &self,
        event_type: TimelineEventType,
        phase: WorkflowPhase,
        role: Option<&str>,
        meta: BTreeMap<String, serde_json::Value>,
    ) {
        self.state
            .lock()
            .timeline
            .append(event_type, Some(phase), role, meta);
    }

    /// Move to `phase`, log the level start and build the level's request.
    fn enter_level(
        &self,
        phase: WorkflowPhase,
        index: usize,
        roles: &[String],
        decision: Option<&ConsensusDecision>,
    ) -> AgentRequest {
        let mut guard = self.state.lock();
        guard.phase = phase;
        guard.timeline.append(
            TimelineEventType::PhaseStarted,
            Some(phase),
            None,
            metadata([("level", json!(index)), ("roles", json!(roles))]),
        );
        AgentRequest::new(guard.incident.clone(), "")
            .with_upstream(guard.recommendations())
            .with_decision(decision.cloned())
    }

    /// Run every role of a level concurrently and wait for all of them.
    async fn run_level(self: &Arc<Self>, roles: &[String], phase: WorkflowPhase, request: AgentRequest) {
        let tasks = roles
            .iter()
            .map(|role| {
                let runner = self.clone();
                let request = request.for_role(role);
                let role = role.clone();
                let label = role.clone();
                (label, async move { runner.execute(&role, phase, request).await })
            })
            .collect();

        for outcome in supervise(tasks).await {
            if let Err(reason) = outcome.result {
                self.mark_crashed(&outcome.label, phase, &reason).await;
            }
        }
    }

    async fn execute(&self, role: &str, phase: WorkflowPhase, request: AgentRequest) -> ExecutionStatus {
        let incident_id = request.incident.id;
        {
            let mut guard = self.state.lock();
            let mut execution = AgentExecution::pending(role, incident_id);
            execution.start();
            guard.executions.insert(role.to_string(), execution);
            guard.timeline.append(
                TimelineEventType::AgentStarted,
                Some(phase),
                Some(role),
                BTreeMap::new(),
            );
        }
        self.monitor.start_task(role, incident_id).await;
        let started = Instant::now();

        let chain = self.fallbacks.get(role);
        let timeout = chain.map_or(self.config.role_timeout(), FallbackChain::timeout);
        let threshold = chain.map_or(self.config.confidence_threshold, |c| c.confidence_threshold);

        let status = match self.invoke_primary(role, phase, &request, timeout).await {
            Ok(recommendations) => self.accept(role, phase, recommendations, threshold),
            Err(e) => self.recover(role, phase, &request, chain, e).await,
        };

        self.monitor
            .finish_task(role, status, elapsed_ms(started))
            .await;
        status
    }

    async fn invoke_primary(
        &self,
        role: &str,
        phase: WorkflowPhase,
        request: &AgentRequest,
        timeout: Duration,
    ) -> RemedyResult<Vec<AgentRecommendation>> {
        if !self.breaker.can_execute(role) {
            let state = self.breaker.state(role);
            self.record(
                TimelineEventType::CircuitOpen,
                phase,
                Some(role),
                metadata([("breaker", json!(state))]),
            );
            warn!(role, breaker = %state, "Circuit breaker rejected invocation");
            return Err(RemedyError::AgentInvocation {
                role: role.to_string(),
                message: format!("circuit breaker {state}"),
            });
        }

        let result = match self.agents.get(role) {
            Some(agent) => invoke_bounded(agent.as_ref(), request, role, timeout).await,
            None => Err(RemedyError::AgentInvocation {
                role: role.to_string(),
                message: "no agent registered".into(),
            }),
        };

        match result {
            Ok(recommendations) => {
                self.breaker.record_success(role);
                Ok(recommendations)
            }
            Err(e) => {
                self.breaker.record_failure(role);
                self.monitor.record_error(role).await;
                self.record(
                    TimelineEventType::AgentFailed,
                    phase,
                    Some(role),
                    metadata([("error", json!(e.to_string()))]),
                );
                warn!(role, error = %e, "Agent invocation failed");
                Err(e)
            }
        }
    }

    /// Store a primary result; below the threshold it is kept but degraded.
    fn accept(
        &self,
        role: &str,
        phase: WorkflowPhase,
        recommendations: Vec<AgentRecommendation>,
        threshold: f64,
    ) -> ExecutionStatus {
        let best = recommendations
            .iter()
            .map(|r| r.confidence)
            .fold(None, |best: Option<f64>, c| Some(best.map_or(c, |b| b.max(c))));
        let degraded = best.map_or(true, |confidence| confidence < threshold);
        let (status, event_type) = if degraded {
            (ExecutionStatus::Degraded, TimelineEventType::AgentDegraded)
        } else {
            (ExecutionStatus::Completed, TimelineEventType::AgentCompleted)
        };

        let meta = metadata([
            ("recommendations", json!(recommendations.len())),
            ("confidence", json!(best)),
            ("threshold", json!(threshold)),
        ]);
        let mut guard = self.state.lock();
        if let Some(execution) = guard.executions.get_mut(role) {
            execution.recommendations = recommendations;
            execution.finish(status);
        }
        guard
            .timeline
            .append(event_type, Some(phase), Some(role), meta);
        status
    }

    /// Walk the fallback chain in order; escalate once if it runs out.
    async fn recover(
        &self,
        role: &str,
        phase: WorkflowPhase,
        request: &AgentRequest,
        chain: Option<&FallbackChain>,
        error: RemedyError,
    ) -> ExecutionStatus {
        let original = error.to_string();
        if let Some(execution) = self.state.lock().executions.get_mut(role) {
            execution.last_error = Some(original.clone());
        }

        let strategies = chain.map(|c| c.strategies.as_slice()).unwrap_or(&[]);
        let timeout = chain.map_or(self.config.role_timeout(), FallbackChain::timeout);
        for (index, strategy) in strategies.iter().enumerate() {
            let attempt = index + 1;
            self.record(
                TimelineEventType::FallbackAttempted,
                phase,
                Some(role),
                metadata([("strategy", json!(strategy)), ("attempt", json!(attempt))]),
            );
            let result = match self.strategies.get(strategy) {
                Some(invocable) => invoke_bounded(invocable.as_ref(), request, role, timeout).await,
                None => Err(RemedyError::AgentInvocation {
                    role: role.to_string(),
                    message: format!("fallback strategy '{strategy}' is not registered"),
                }),
            };

            match result {
                Ok(mut recommendations) => {
                    for rec in &mut recommendations {
                        rec.role = role.to_string();
                        rec.evidence.push(format!("fallback:{strategy}"));
                    }
                    let meta = metadata([
                        ("strategy", json!(strategy)),
                        ("attempt", json!(attempt)),
                        ("recommendations", json!(recommendations.len())),
                    ]);
                    {
                        let mut guard = self.state.lock();
                        if let Some(execution) = guard.executions.get_mut(role) {
                            execution.recommendations = recommendations;
                            execution.fallback_strategy = Some(strategy.clone());
                            execution.finish(ExecutionStatus::FallbackSuccess);
                        }
                        guard.timeline.append(
                            TimelineEventType::FallbackSucceeded,
                            Some(phase),
                            Some(role),
                            meta,
                        );
                    }
                    info!(role, strategy = %strategy, attempt, "Fallback succeeded");
                    return ExecutionStatus::FallbackSuccess;
                }
                Err(e) => {
                    warn!(role, strategy = %strategy, attempt, error = %e, "Fallback failed");
                }
            }
        }

        let exhausted = RemedyError::FallbackExhausted {
            role: role.to_string(),
            attempts: strategies.len(),
        };
        {
            let mut guard = self.state.lock();
            if let Some(execution) = guard.executions.get_mut(role) {
                execution.finish(ExecutionStatus::RequiresHumanIntervention);
            }
            guard.timeline.append(
                TimelineEventType::FallbackExhausted,
                Some(phase),
                Some(role),
                metadata([
                    ("attempts", json!(strategies.len())),
                    ("error", json!(original)),
                ]),
            );
        }
        error!(role, error = %exhausted, "Escalating to human operators");
        self.escalate(role, phase, &original).await;
        ExecutionStatus::RequiresHumanIntervention
    }

    /// Best-effort hand-off to the notification gateway.
    async fn escalate(&self, role: &str, phase: WorkflowPhase, error: &str) {
        let state = self.state.lock().clone();
        self.checkpoints.record(&state);
        let mut checkpoints = self.checkpoints.latest(state.incident.id);
        let keep = self.config.checkpoint_history;
        if checkpoints.len() > keep {
            checkpoints.drain(..checkpoints.len() - keep);
        }

        let payload = EscalationPayload {
            workflow_id: state.workflow_id,
            incident_id: state.incident.id,
            failed_role: role.to_string(),
            error: error.to_string(),
            checkpoints,
            state,
            raised_at: Utc::now(),
        };

        let meta = match &self.gateway {
            Some(gateway) => {
                match tokio::time::timeout(
                    self.config.escalation_timeout(),
                    gateway.escalate(&payload),
                )
                .await
                {
                    Ok(outcomes) => {
                        let delivered = outcomes.values().filter(|o| o.is_success()).count();
                        metadata([
                            ("channels", serde_json::to_value(&outcomes).unwrap_or_default()),
                            ("delivered", json!(delivered)),
                        ])
                    }
                    Err(_) => {
                        warn!(role, "Escalation fan-out timed out");
                        metadata([("delivered", json!(0)), ("timed_out", json!(true))])
                    }
                }
            }
            None => {
                warn!(role, "No notification gateway configured");
                metadata([("delivered", json!(0))])
            }
        };
        self.record(TimelineEventType::EscalationSent, phase, Some(role), meta);
    }

    /// A role task that panicked never reached a terminal status itself.
    async fn mark_crashed(&self, role: &str, phase: WorkflowPhase, reason: &str) {
        {
            let mut guard = self.state.lock();
            if let Some(execution) = guard.executions.get_mut(role) {
                execution.last_error = Some(reason.to_string());
                execution.finish(ExecutionStatus::Failed);
            }
            guard.timeline.append(
                TimelineEventType::AgentFailed,
                Some(phase),
                Some(role),
                metadata([("error", json!(reason)), ("panicked", json!(true))]),
            );
        }
        self.breaker.record_failure(role);
        self.monitor.record_error(role).await;
        self.monitor
            .finish_task(role, ExecutionStatus::Failed, 0)
            .await;
    }
}
