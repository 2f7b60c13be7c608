//! The PBFT state machine of a single node.
//!
//! Normal case: the primary of the current view assigns a sequence number
//! and broadcasts PRE_PREPARE; backups answer with PREPARE; once a node holds
//! `quorum - 1` matching PREPAREs it broadcasts COMMIT, and `quorum` matching
//! COMMITs decide the round. Each sequence has its own lock, so independent
//! rounds progress concurrently while handlers for one round serialize.
//!
//! Handlers never send while holding a lock. They collect outbound messages,
//! suspicion reports and decisions into `Effects`, which `PbftEngine::drive`
//! applies afterwards.

use crate::config::PbftConfig;
use crate::crypto::{self, NodeKeypair};
use crate::message::{MessageKind, MessagePayload, PreparedProposal, Proposal, SignedMessage};
use crate::node::{NodeRegistry, ParticipantNode};
use crate::round::{ConsensusRound, RoundStatus};
use crate::transport::Transport;
use crate::view_change::{highest_sequence, merge_certificates, ViewChangeTracker};
use chrono::Utc;
use parking_lot::Mutex;
use remedy_core::{
    AgentRecommendation, ConsensusDecision, Incident, RemedyError, RemedyResult,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Future-view messages kept while this node catches up.
const MAX_DEFERRED: usize = 1024;

/// Decided sequences, counted back from the newest, reported in VIEW_CHANGE.
const CERTIFICATE_WINDOW: u64 = 64;

/// How far past the highest proposed sequence a message may open a round.
const SEQUENCE_WINDOW: u64 = 256;

struct ViewState {
    view: u64,
    last_sequence: u64,
    tracker: ViewChangeTracker,
    deferred: Vec<SignedMessage>,
}

struct RoundSlot {
    round: tokio::sync::Mutex<ConsensusRound>,
    decided: watch::Sender<Option<ConsensusDecision>>,
}

impl RoundSlot {
    fn new(sequence: u64) -> Self {
        let (decided, _) = watch::channel(None);
        Self {
            round: tokio::sync::Mutex::new(ConsensusRound::new(sequence)),
            decided,
        }
    }
}

/// Rounds keyed by sequence. `low_watermark` is the highest sequence below
/// which every round is decided; nothing at or under it is reopened.
#[derive(Default)]
struct RoundTable {
    active: HashMap<u64, Arc<RoundSlot>>,
    completed: BTreeMap<u64, ConsensusRound>,
    low_watermark: u64,
}

enum SlotRef {
    Active(Arc<RoundSlot>),
    Decided(Option<ConsensusDecision>),
}

/// Side effects collected by handlers and applied once locks are released.
#[derive(Default)]
struct Effects {
    outbox: Vec<SignedMessage>,
    suspicious: Vec<(String, String)>,
    decided: Vec<(Arc<RoundSlot>, ConsensusRound)>,
    replay: Vec<SignedMessage>,
    view_change: Option<u64>,
}

impl Effects {
    /// Flag `sender` and build the error the handler returns.
    fn reject(&mut self, sender: &str, reason: impl Into<String>) -> RemedyError {
        let reason = reason.into();
        self.suspicious.push((sender.to_string(), reason.clone()));
        RemedyError::MessageVerification {
            sender: sender.to_string(),
            reason,
        }
    }

    fn request_view_change(&mut self, view: u64) {
        self.view_change = Some(self.view_change.map_or(view, |v| v.max(view)));
    }
}

/// One PBFT participant.
pub struct PbftEngine {
    node_id: String,
    keypair: NodeKeypair,
    config: PbftConfig,
    transport: Arc<dyn Transport>,
    registry: Mutex<NodeRegistry>,
    view: Mutex<ViewState>,
    rounds: Mutex<RoundTable>,
}

impl PbftEngine {
    /// Create a node. `registry` must already contain `node_id` with the
    /// public half of `keypair`.
    pub fn new(
        node_id: impl Into<String>,
        keypair: NodeKeypair,
        registry: NodeRegistry,
        transport: Arc<dyn Transport>,
        config: PbftConfig,
    ) -> RemedyResult<Self> {
        let node_id = node_id.into();
        match registry.get(&node_id) {
            Some(node) if node.public_key == keypair.public_key() => {}
            Some(_) => {
                return Err(RemedyError::Configuration(format!(
                    "Registered key for '{node_id}' does not match its keypair"
                )))
            }
            None => {
                return Err(RemedyError::Configuration(format!(
                    "Node '{node_id}' is not in the registry"
                )))
            }
        }

        Ok(Self {
            node_id,
            keypair,
            config,
            transport,
            registry: Mutex::new(registry),
            view: Mutex::new(ViewState {
                view: 0,
                last_sequence: 0,
                tracker: ViewChangeTracker::new(),
                deferred: Vec::new(),
            }),
            rounds: Mutex::new(RoundTable::default()),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &PbftConfig {
        &self.config
    }

    pub fn current_view(&self) -> u64 {
        self.view.lock().view
    }

    /// Highest sequence number this node has seen proposed.
    pub fn last_sequence(&self) -> u64 {
        self.view.lock().last_sequence
    }

    /// Primary of the current view.
    pub fn primary(&self) -> String {
        self.primary_for(self.current_view())
    }

    pub fn is_primary(&self) -> bool {
        self.primary() == self.node_id
    }

    pub fn total_nodes(&self) -> usize {
        self.registry.lock().total()
    }

    pub fn fault_tolerance(&self) -> usize {
        self.registry.lock().fault_tolerance()
    }

    pub fn quorum_size(&self) -> usize {
        self.registry.lock().quorum_size()
    }

    /// Snapshot of every participant as seen by this node.
    pub fn nodes(&self) -> Vec<ParticipantNode> {
        self.registry.lock().nodes().cloned().collect()
    }

    pub fn node(&self, node_id: &str) -> Option<ParticipantNode> {
        self.registry.lock().get(node_id).cloned()
    }

    /// Decided rounds, in sequence order.
    pub fn completed_rounds(&self) -> Vec<ConsensusRound> {
        self.rounds.lock().completed.values().cloned().collect()
    }

    pub fn decision(&self, sequence: u64) -> Option<ConsensusDecision> {
        self.rounds
            .lock()
            .completed
            .get(&sequence)
            .and_then(|r| r.decision.clone())
    }

    /// Rounds opened but not yet decided.
    pub fn active_rounds(&self) -> usize {
        self.rounds.lock().active.len()
    }

    /// Snapshot of a round, decided or not.
    pub async fn round(&self, sequence: u64) -> Option<ConsensusRound> {
        let slot = {
            let table = self.rounds.lock();
            if let Some(round) = table.completed.get(&sequence) {
                return Some(round.clone());
            }
            table.active.get(&sequence).cloned()?
        };
        let round = slot.round.lock().await;
        Some(round.clone())
    }

    /// Start a round for `recommendation`. Only the primary may propose.
    ///
    /// Returns the sequence number to pass to [`Self::wait_for_consensus`].
    pub async fn propose_action(
        &self,
        incident: &Incident,
        recommendation: &AgentRecommendation,
    ) -> RemedyResult<u64> {
        let view = self.current_view();
        let primary = self.primary_for(view);
        if primary != self.node_id {
            return Err(RemedyError::NotPrimary {
                node_id: self.node_id.clone(),
                primary,
            });
        }
        self.registry.lock().check_quorum_possible()?;

        let proposal = Proposal::new(incident.id, recommendation.clone());
        let digest = proposal.digest()?;
        let sequence = {
            let mut state = self.view.lock();
            state.last_sequence += 1;
            state.last_sequence
        };
        let message = self.sign(
            view,
            sequence,
            &digest,
            MessagePayload::PrePrepare {
                proposal: proposal.clone(),
            },
        )?;

        info!(
            node = %self.node_id,
            view,
            sequence,
            action = %recommendation.action_id,
            "Proposing action"
        );

        let mut fx = Effects::default();
        fx.outbox.push(message);
        let node_id = self.node_id.clone();
        let result = self
            .accept_proposal(view, sequence, digest, proposal, &node_id, &mut fx)
            .await;
        self.drive(fx).await;
        result.map(|()| sequence)
    }

    /// Process one inbound message.
    ///
    /// Messages that fail validation are dropped, their sender is flagged,
    /// and the reason comes back as [`RemedyError::MessageVerification`].
    pub async fn handle_message(&self, message: SignedMessage) -> RemedyResult<()> {
        if message.sender == self.node_id {
            return Ok(());
        }
        let mut fx = Effects::default();
        let result = self.dispatch(message, &mut fx).await;
        self.drive(fx).await;
        result
    }

    /// Wait until `sequence` is decided locally.
    pub async fn wait_for_consensus(
        &self,
        sequence: u64,
        timeout: Duration,
    ) -> RemedyResult<ConsensusDecision> {
        let slot = match self.slot(sequence) {
            Some(SlotRef::Decided(decision)) => {
                return decision
                    .ok_or_else(|| RemedyError::NotFound(format!("decision for sequence {sequence}")))
            }
            Some(SlotRef::Active(slot)) => Some(slot),
            None => None,
        };
        self.registry.lock().check_quorum_possible()?;
        let slot = slot.ok_or_else(|| {
            RemedyError::NotFound(format!("round for sequence {sequence}"))
        })?;

        let mut rx = slot.decided.subscribe();
        let decided = match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(decision)) => decision.clone(),
            _ => None,
        };
        decided.ok_or_else(|| {
            warn!(node = %self.node_id, sequence, "Consensus timed out");
            RemedyError::ConsensusTimeout {
                sequence,
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }
        })
    }

    /// Record a suspicion event against `node_id` from outside the protocol.
    pub async fn flag_suspicious(&self, node_id: &str, reason: &str) {
        let mut fx = Effects::default();
        fx.suspicious.push((node_id.to_string(), reason.to_string()));
        self.drive(fx).await;
    }

    /// Ask the cluster to move to the next view, e.g. after a round timed out.
    pub async fn request_view_change(&self) {
        let mut fx = Effects::default();
        fx.request_view_change(self.current_view() + 1);
        self.drive(fx).await;
    }

    // --- internals ---

    fn primary_for(&self, view: u64) -> String {
        self.registry
            .lock()
            .primary_for(view)
            .unwrap_or_default()
            .to_string()
    }

    fn isolated_ids(&self) -> BTreeSet<String> {
        self.registry.lock().isolated_ids()
    }

    fn sign(
        &self,
        view: u64,
        sequence: u64,
        digest: &str,
        payload: MessagePayload,
    ) -> RemedyResult<SignedMessage> {
        SignedMessage::sign(&self.keypair, &self.node_id, view, sequence, digest, payload)
    }

    /// Look up the round for `sequence`, opening it when the sequence lies
    /// between the watermarks. `None` means the sequence is out of range.
    fn slot(&self, sequence: u64) -> Option<SlotRef> {
        let high = self.last_sequence().saturating_add(SEQUENCE_WINDOW);
        let mut table = self.rounds.lock();
        if let Some(round) = table.completed.get(&sequence) {
            return Some(SlotRef::Decided(round.decision.clone()));
        }
        if let Some(slot) = table.active.get(&sequence) {
            return Some(SlotRef::Active(slot.clone()));
        }
        if sequence <= table.low_watermark || sequence > high {
            return None;
        }
        let slot = Arc::new(RoundSlot::new(sequence));
        table.active.insert(sequence, slot.clone());
        Some(SlotRef::Active(slot))
    }

    /// Apply effects until nothing is left: send, publish decisions, record
    /// suspicion, replay deferred messages and run requested view changes.
    async fn drive(&self, mut fx: Effects) {
        loop {
            for message in std::mem::take(&mut fx.outbox) {
                self.transport.broadcast(message).await;
            }
            for (slot, round) in std::mem::take(&mut fx.decided) {
                self.publish(&slot, round);
            }
            for (node_id, reason) in std::mem::take(&mut fx.suspicious) {
                if let Some(view) = self.record_suspicion(&node_id, &reason) {
                    fx.request_view_change(view);
                }
            }

            let replay = std::mem::take(&mut fx.replay);
            let view_change = fx.view_change.take();
            if replay.is_empty() && view_change.is_none() {
                break;
            }

            let mut next = Effects::default();
            for message in replay {
                if let Err(e) = self.dispatch(message, &mut next).await {
                    debug!(node = %self.node_id, error = %e, "Deferred message rejected");
                }
            }
            if let Some(view) = view_change {
                self.start_view_change(view, &mut next).await;
            }
            fx = next;
        }
    }

    async fn dispatch(&self, message: SignedMessage, fx: &mut Effects) -> RemedyResult<()> {
        self.authenticate(&message, fx)?;
        match message.payload.clone() {
            MessagePayload::PrePrepare { proposal } => {
                self.on_pre_prepare(message, proposal, fx).await
            }
            MessagePayload::Prepare | MessagePayload::Commit => self.on_vote(message, fx).await,
            MessagePayload::ViewChange { new_view, prepared } => {
                self.on_view_change(message, new_view, prepared, fx).await
            }
            MessagePayload::NewView {
                view_changes,
                reproposals,
            } => {
                self.on_new_view(message, view_changes, reproposals, fx)
                    .await
            }
        }
    }

    fn authenticate(&self, message: &SignedMessage, fx: &mut Effects) -> RemedyResult<()> {
        let registry = self.registry.lock();
        let Some(node) = registry.get(&message.sender) else {
            return Err(RemedyError::MessageVerification {
                sender: message.sender.clone(),
                reason: "unknown sender".into(),
            });
        };
        if node.is_isolated() {
            return Err(fx.reject(&message.sender, "sender is isolated"));
        }
        if let Err(reason) = message.verify(&node.public_key) {
            return Err(fx.reject(&message.sender, reason));
        }
        Ok(())
    }

    async fn on_pre_prepare(
        &self,
        message: SignedMessage,
        proposal: Proposal,
        fx: &mut Effects,
    ) -> RemedyResult<()> {
        let view = {
            let mut state = self.view.lock();
            if message.view > state.view {
                if state.deferred.len() < MAX_DEFERRED {
                    state.deferred.push(message);
                }
                return Ok(());
            }
            state.view
        };
        if message.view < view {
            debug!(node = %self.node_id, sequence = message.sequence, "Stale PRE_PREPARE ignored");
            return Ok(());
        }

        let primary = self.primary_for(view);
        if message.sender != primary {
            return Err(fx.reject(
                &message.sender,
                format!("PRE_PREPARE from non-primary in view {view}"),
            ));
        }
        if proposal.digest()? != message.digest {
            return Err(fx.reject(&message.sender, "digest does not match proposal"));
        }
        self.accept_proposal(view, message.sequence, message.digest, proposal, &primary, fx)
            .await
    }

    /// Install a validated proposal for `sequence` and, on backups, answer
    /// with PREPARE. Buffered votes are replayed against it.
    async fn accept_proposal(
        &self,
        view: u64,
        sequence: u64,
        digest: String,
        proposal: Proposal,
        primary: &str,
        fx: &mut Effects,
    ) -> RemedyResult<()> {
        let slot = match self.slot(sequence) {
            Some(SlotRef::Active(slot)) => slot,
            Some(SlotRef::Decided(_)) => {
                self.vote_again(view, sequence, &digest, primary, fx);
                return Ok(());
            }
            None => {
                return Err(fx.reject(
                    primary,
                    format!("PRE_PREPARE for sequence {sequence} outside watermarks"),
                ))
            }
        };
        let isolated = self.isolated_ids();
        let mut round = slot.round.lock().await;
        if round.is_decided() || round.view > view {
            return Ok(());
        }
        if round.view == view {
            if let Some(existing) = &round.digest {
                if *existing == digest {
                    return Ok(());
                }
                return Err(fx.reject(
                    primary,
                    format!("conflicting PRE_PREPARE for sequence {sequence}"),
                ));
            }
        }

        round.install(view, digest.clone(), proposal, primary);
        {
            let mut state = self.view.lock();
            state.last_sequence = state.last_sequence.max(sequence);
        }
        debug!(node = %self.node_id, view, sequence, "PRE_PREPARE accepted");

        if self.node_id != primary {
            let prepare = self.sign(view, sequence, &digest, MessagePayload::Prepare)?;
            round.record_vote(prepare.clone());
            fx.outbox.push(prepare);
        }
        for pending in round.take_pending() {
            if let Err(e) = self.apply_vote(&mut round, pending, fx) {
                debug!(node = %self.node_id, sequence, error = %e, "Buffered vote rejected");
            }
        }
        self.advance(&slot, &mut round, &isolated, fx)
    }

    /// A sequence decided here is re-proposed in a later view: vote for the
    /// same digest again so nodes that never decided it can catch up.
    fn vote_again(&self, view: u64, sequence: u64, digest: &str, primary: &str, fx: &mut Effects) {
        let decided_view = {
            let table = self.rounds.lock();
            table
                .completed
                .get(&sequence)
                .filter(|r| r.digest.as_deref() == Some(digest))
                .map(|r| r.view)
        };
        if !decided_view.is_some_and(|decided| view > decided) {
            return;
        }
        let mut payloads = vec![MessagePayload::Commit];
        if self.node_id != primary {
            payloads.insert(0, MessagePayload::Prepare);
        }
        for payload in payloads {
            match self.sign(view, sequence, digest, payload) {
                Ok(message) => fx.outbox.push(message),
                Err(e) => warn!(node = %self.node_id, sequence, error = %e, "Could not re-vote"),
            }
        }
    }

    async fn on_vote(&self, message: SignedMessage, fx: &mut Effects) -> RemedyResult<()> {
        let slot = match self.slot(message.sequence) {
            Some(SlotRef::Active(slot)) => slot,
            Some(SlotRef::Decided(_)) => return Ok(()),
            None => {
                return Err(fx.reject(
                    &message.sender,
                    format!(
                        "{} for sequence {} outside watermarks",
                        message.kind(),
                        message.sequence
                    ),
                ))
            }
        };
        let isolated = self.isolated_ids();
        let mut round = slot.round.lock().await;
        if round.is_decided() {
            return Ok(());
        }
        self.apply_vote(&mut round, message, fx)?;
        self.advance(&slot, &mut round, &isolated, fx)
    }

    fn apply_vote(
        &self,
        round: &mut ConsensusRound,
        message: SignedMessage,
        fx: &mut Effects,
    ) -> RemedyResult<()> {
        let Some(digest) = round.digest.clone() else {
            round.buffer(message);
            return Ok(());
        };
        if message.view < round.view {
            return Ok(());
        }
        if message.view > round.view {
            round.buffer(message);
            return Ok(());
        }
        if message.digest != digest {
            return Err(fx.reject(
                &message.sender,
                format!(
                    "{} digest mismatch for sequence {}",
                    message.kind(),
                    round.sequence
                ),
            ));
        }
        if message.kind() == MessageKind::Prepare
            && round.primary.as_deref() == Some(message.sender.as_str())
        {
            return Err(fx.reject(&message.sender, "PREPARE from the primary"));
        }
        round.record_vote(message);
        Ok(())
    }

    /// Move the round forward: send COMMIT once prepared, decide once a
    /// commit quorum is in.
    fn advance(
        &self,
        slot: &Arc<RoundSlot>,
        round: &mut ConsensusRound,
        isolated: &BTreeSet<String>,
        fx: &mut Effects,
    ) -> RemedyResult<()> {
        let (Some(digest), Some(proposal)) = (round.digest.clone(), round.proposal.clone()) else {
            return Ok(());
        };
        let (quorum, total) = {
            let registry = self.registry.lock();
            (registry.quorum_size(), registry.total())
        };

        if round.status == RoundStatus::PrePrepared
            && round.prepare_count(isolated) >= quorum.saturating_sub(1)
        {
            round.status = RoundStatus::Prepared;
            let commit = self.sign(round.view, round.sequence, &digest, MessagePayload::Commit)?;
            round.record_vote(commit.clone());
            fx.outbox.push(commit);
            debug!(node = %self.node_id, sequence = round.sequence, "Prepared");
        }

        if round.status == RoundStatus::Prepared && round.commit_count(isolated) >= quorum {
            let elapsed = (Utc::now() - round.started_at).num_milliseconds();
            let recommendation = proposal.recommendation;
            let decision = ConsensusDecision {
                incident_id: proposal.incident_id,
                selected_action: recommendation.action_id,
                action_type: recommendation.action_type,
                risk_level: recommendation.risk_level,
                final_confidence: 1.0,
                participating_agents: round.committers(isolated),
                method: "pbft".into(),
                conflicts_detected: false,
                requires_human_approval: false,
                approval_threshold: self.config.approval_threshold,
                processing_duration_ms: u64::try_from(elapsed).unwrap_or(0),
                byzantine_nodes_detected: isolated.len(),
                quorum_size: quorum,
                total_nodes: total,
                sequence: Some(round.sequence),
            };
            info!(
                node = %self.node_id,
                sequence = round.sequence,
                view = round.view,
                action = %decision.selected_action,
                "Consensus reached"
            );
            round.status = RoundStatus::Committed;
            round.decision = Some(decision);
            fx.decided.push((slot.clone(), round.clone()));
        }
        Ok(())
    }

    /// Archive a decided round and wake its waiters.
    fn publish(&self, slot: &RoundSlot, round: ConsensusRound) {
        let decision = round.decision.clone();
        {
            let mut table = self.rounds.lock();
            table.active.remove(&round.sequence);
            table.completed.insert(round.sequence, round);
            while table.completed.contains_key(&(table.low_watermark + 1)) {
                table.low_watermark += 1;
            }
        }
        slot.decided.send_replace(decision);
    }

    /// Returns the view to move to when the isolated node was the primary.
    fn record_suspicion(&self, node_id: &str, reason: &str) -> Option<u64> {
        if node_id == self.node_id {
            return None;
        }
        let view = self.current_view();
        let mut registry = self.registry.lock();
        let primary = registry.primary_for(view).map(str::to_string);
        let node = registry.get_mut(node_id)?;
        let isolated = node.record_suspicion(
            Utc::now(),
            reason,
            self.config.suspicion_window(),
            self.config.suspicion_threshold,
            self.config.reputation_penalty,
        );
        warn!(
            node = %self.node_id,
            suspect = %node_id,
            reason,
            suspicion_count = node.suspicion_count(),
            "Suspicious behaviour recorded"
        );
        if !isolated {
            return None;
        }

        warn!(node = %self.node_id, suspect = %node_id, "Node isolated");
        if let Err(e) = registry.check_quorum_possible() {
            warn!(node = %self.node_id, error = %e, "Quorum no longer reachable");
        }
        (primary.as_deref() == Some(node_id)).then_some(view + 1)
    }

    /// Certificates for every undecided round plus recently decided ones,
    /// so a new primary can never reuse a decided sequence for another value.
    async fn view_certificates(&self) -> Vec<PreparedProposal> {
        let floor = self.last_sequence().saturating_sub(CERTIFICATE_WINDOW);
        let (slots, decided) = {
            let table = self.rounds.lock();
            let slots: Vec<Arc<RoundSlot>> = table.active.values().cloned().collect();
            let decided: Vec<ConsensusRound> =
                table.completed.range(floor..).map(|(_, r)| r.clone()).collect();
            (slots, decided)
        };

        let mut certificates: Vec<PreparedProposal> =
            decided.iter().filter_map(certificate).collect();
        for slot in slots {
            let round = slot.round.lock().await;
            if let Some(cert) = certificate(&round) {
                certificates.push(cert);
            }
        }
        certificates.sort_by_key(|c| c.sequence);
        certificates.dedup_by_key(|c| c.sequence);
        certificates
    }

    /// Distinct valid PREPAREs backing `cert`, excluding the view's primary.
    fn proof_count(&self, cert: &PreparedProposal) -> usize {
        let registry = self.registry.lock();
        let primary = registry.primary_for(cert.view);
        cert.prepares
            .iter()
            .filter(|m| {
                m.kind() == MessageKind::Prepare
                    && m.view == cert.view
                    && m.sequence == cert.sequence
                    && m.digest == cert.digest
                    && Some(m.sender.as_str()) != primary
            })
            .filter(|m| {
                registry
                    .get(&m.sender)
                    .is_some_and(|node| m.verify(&node.public_key).is_ok())
            })
            .map(|m| m.sender.as_str())
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Check that every certificate's digest matches its proposal and that
    /// prepared ones carry a prepare quorum.
    fn validate_certificates(
        &self,
        sender: &str,
        certificates: &[PreparedProposal],
        fx: &mut Effects,
    ) -> RemedyResult<()> {
        let needed = self.quorum_size().saturating_sub(1);
        for cert in certificates {
            if cert.proposal.digest()? != cert.digest {
                return Err(fx.reject(
                    sender,
                    format!("certificate digest mismatch for sequence {}", cert.sequence),
                ));
            }
            if cert.prepared && self.proof_count(cert) < needed {
                return Err(fx.reject(
                    sender,
                    format!("unproven prepared certificate for sequence {}", cert.sequence),
                ));
            }
        }
        Ok(())
    }

    async fn start_view_change(&self, new_view: u64, fx: &mut Effects) {
        let last_sequence = {
            let state = self.view.lock();
            if new_view <= state.view || state.tracker.has_sent(new_view) {
                return;
            }
            state.last_sequence
        };

        let prepared = self.view_certificates().await;
        let message = match crypto::digest(&prepared).and_then(|digest| {
            self.sign(
                new_view,
                last_sequence,
                &digest,
                MessagePayload::ViewChange { new_view, prepared },
            )
        }) {
            Ok(message) => message,
            Err(e) => {
                warn!(node = %self.node_id, error = %e, "Could not build VIEW_CHANGE");
                return;
            }
        };

        {
            let mut state = self.view.lock();
            if state.tracker.has_sent(new_view) {
                return;
            }
            state.tracker.mark_sent(new_view);
            state.tracker.record(new_view, message.clone());
        }
        info!(node = %self.node_id, new_view, "Requesting view change");
        fx.outbox.push(message);
        self.try_new_view(new_view, fx).await;
    }

    /// On the primary of `new_view`: once a quorum asked for it, announce
    /// NEW_VIEW and re-propose every undecided sequence.
    async fn try_new_view(&self, new_view: u64, fx: &mut Effects) {
        if self.primary_for(new_view) != self.node_id {
            return;
        }
        let isolated = self.isolated_ids();
        let quorum = self.quorum_size();
        let view_changes = {
            let mut state = self.view.lock();
            if new_view <= state.view
                || state.tracker.has_sent_new_view(new_view)
                || state.tracker.count(new_view, &isolated) < quorum
            {
                return;
            }
            state.tracker.mark_new_view_sent(new_view);
            let view_changes = state.tracker.messages(new_view, &isolated);
            state.last_sequence = state.last_sequence.max(highest_sequence(&view_changes));
            view_changes
        };
        let reproposals = merge_certificates(&view_changes);
        let highest = highest_sequence(&view_changes);

        let message = match crypto::digest(&reproposals).and_then(|digest| {
            self.sign(
                new_view,
                highest,
                &digest,
                MessagePayload::NewView {
                    view_changes,
                    reproposals: reproposals.clone(),
                },
            )
        }) {
            Ok(message) => message,
            Err(e) => {
                warn!(node = %self.node_id, error = %e, "Could not build NEW_VIEW");
                return;
            }
        };
        fx.outbox.push(message);
        self.install_view(new_view, fx);

        let node_id = self.node_id.clone();
        for carried in reproposals {
            let sequence = carried.sequence;
            if let Err(e) = self
                .accept_proposal(new_view, sequence, carried.digest, carried.proposal, &node_id, fx)
                .await
            {
                warn!(node = %self.node_id, sequence, error = %e, "Re-proposal failed");
            }
        }
    }

    fn install_view(&self, new_view: u64, fx: &mut Effects) {
        let ready = {
            let mut state = self.view.lock();
            if new_view <= state.view {
                return;
            }
            state.view = new_view;
            state.tracker.prune(new_view);
            let (ready, later): (Vec<_>, Vec<_>) = std::mem::take(&mut state.deferred)
                .into_iter()
                .filter(|m| m.view >= new_view)
                .partition(|m| m.view == new_view);
            state.deferred = later;
            ready
        };
        fx.replay.extend(ready);

        let primary = self.primary_for(new_view);
        info!(node = %self.node_id, view = new_view, primary = %primary, "Installed new view");
        if self.registry.lock().is_isolated(&primary) {
            fx.request_view_change(new_view + 1);
        }
    }

    async fn on_view_change(
        &self,
        message: SignedMessage,
        new_view: u64,
        prepared: Vec<PreparedProposal>,
        fx: &mut Effects,
    ) -> RemedyResult<()> {
        if message.view != new_view {
            return Err(fx.reject(&message.sender, "VIEW_CHANGE view mismatch"));
        }
        if new_view <= self.current_view() {
            return Ok(());
        }
        if crypto::digest(&prepared)? != message.digest {
            return Err(fx.reject(&message.sender, "VIEW_CHANGE digest mismatch"));
        }
        self.validate_certificates(&message.sender, &prepared, fx)?;

        let isolated = self.isolated_ids();
        let sender = message.sender.clone();
        let (count, joined) = {
            let mut state = self.view.lock();
            state.tracker.record(new_view, message);
            (
                state.tracker.count(new_view, &isolated),
                state.tracker.has_sent(new_view),
            )
        };
        debug!(node = %self.node_id, from = %sender, new_view, count, "VIEW_CHANGE received");

        if !joined && count > self.fault_tolerance() {
            self.start_view_change(new_view, fx).await;
        } else {
            self.try_new_view(new_view, fx).await;
        }
        Ok(())
    }

    async fn on_new_view(
        &self,
        message: SignedMessage,
        view_changes: Vec<SignedMessage>,
        reproposals: Vec<PreparedProposal>,
        fx: &mut Effects,
    ) -> RemedyResult<()> {
        let new_view = message.view;
        if new_view <= self.current_view() {
            return Ok(());
        }
        if message.sender != self.primary_for(new_view) {
            return Err(fx.reject(&message.sender, "NEW_VIEW from non-primary"));
        }
        if crypto::digest(&reproposals)? != message.digest {
            return Err(fx.reject(&message.sender, "NEW_VIEW digest mismatch"));
        }

        let mut voters = BTreeSet::new();
        for vote in &view_changes {
            let MessagePayload::ViewChange {
                new_view: target,
                prepared,
            } = &vote.payload
            else {
                return Err(fx.reject(&message.sender, "NEW_VIEW carries a non VIEW_CHANGE"));
            };
            let signed = {
                let registry = self.registry.lock();
                registry
                    .get(&vote.sender)
                    .is_some_and(|node| vote.verify(&node.public_key).is_ok())
            };
            if *target != new_view
                || vote.view != new_view
                || !signed
                || crypto::digest(prepared)? != vote.digest
            {
                return Err(fx.reject(&message.sender, "NEW_VIEW carries an invalid VIEW_CHANGE"));
            }
            self.validate_certificates(&message.sender, prepared, fx)?;
            voters.insert(vote.sender.as_str());
        }
        if voters.len() < self.quorum_size() {
            return Err(fx.reject(&message.sender, "NEW_VIEW without a view-change quorum"));
        }
        if merge_certificates(&view_changes) != reproposals {
            return Err(fx.reject(
                &message.sender,
                "NEW_VIEW re-proposals do not follow from its view changes",
            ));
        }

        {
            let mut state = self.view.lock();
            state.last_sequence = state.last_sequence.max(highest_sequence(&view_changes));
        }
        self.install_view(new_view, fx);
        for carried in reproposals {
            let sequence = carried.sequence;
            if let Err(e) = self
                .accept_proposal(
                    new_view,
                    sequence,
                    carried.digest,
                    carried.proposal,
                    &message.sender,
                    fx,
                )
                .await
            {
                warn!(node = %self.node_id, sequence, error = %e, "Carried proposal rejected");
            }
        }
        Ok(())
    }
}

fn certificate(round: &ConsensusRound) -> Option<PreparedProposal> {
    let (digest, proposal) = (round.digest.clone()?, round.proposal.clone()?);
    let prepared = round.status >= RoundStatus::Prepared;
    Some(PreparedProposal {
        sequence: round.sequence,
        view: round.view,
        digest,
        proposal,
        prepared,
        prepares: if prepared {
            round.prepares.values().cloned().collect()
        } else {
            Vec::new()
        },
    })
}

impl std::fmt::Debug for PbftEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PbftEngine")
            .field("node_id", &self.node_id)
            .field("view", &self.current_view())
            .finish_non_exhaustive()
    }
}
