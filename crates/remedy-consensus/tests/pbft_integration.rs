#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use remedy_consensus::*;
use remedy_core::{AgentRecommendation, Incident, RemedyError, Severity};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Harness: a transport that queues (recipient, message) pairs so tests decide
// when, in which order and how often each message is delivered.
// ---------------------------------------------------------------------------

struct QueueTransport {
    members: Vec<String>,
    queue: parking_lot::Mutex<Vec<(String, SignedMessage)>>,
}

impl QueueTransport {
    fn new(members: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            members,
            queue: parking_lot::Mutex::new(Vec::new()),
        })
    }

    fn push_to(&self, recipient: &str, message: SignedMessage) {
        self.queue.lock().push((recipient.to_string(), message));
    }

    fn drain(&self) -> Vec<(String, SignedMessage)> {
        std::mem::take(&mut *self.queue.lock())
    }

    fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

#[async_trait]
impl Transport for QueueTransport {
    async fn broadcast(&self, message: SignedMessage) {
        let mut queue = self.queue.lock();
        for member in &self.members {
            if *member != message.sender {
                queue.push((member.clone(), message.clone()));
            }
        }
    }
}

struct Harness {
    keys: BTreeMap<String, NodeKeypair>,
    engines: BTreeMap<String, Arc<PbftEngine>>,
    transport: Arc<QueueTransport>,
}

impl Harness {
    /// `n` registered nodes; engines are created only for `honest` ids.
    fn new(n: usize, honest: &[&str]) -> Self {
        let ids: Vec<String> = (0..n).map(|i| format!("node-{i}")).collect();
        let secrets: BTreeMap<String, [u8; 32]> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let mut secret = [0u8; 32];
                secret[0] = u8::try_from(i + 1).unwrap();
                (id.clone(), secret)
            })
            .collect();

        let mut registry = NodeRegistry::new();
        for (id, secret) in &secrets {
            registry
                .register(id.clone(), NodeKeypair::from_secret_bytes(secret).public_key())
                .unwrap();
        }

        let transport = QueueTransport::new(ids.clone());
        let engines = honest
            .iter()
            .map(|id| {
                let engine = PbftEngine::new(
                    *id,
                    NodeKeypair::from_secret_bytes(&secrets[*id]),
                    registry.clone(),
                    transport.clone(),
                    PbftConfig::default(),
                )
                .unwrap();
                (id.to_string(), Arc::new(engine))
            })
            .collect();
        let keys = secrets
            .iter()
            .map(|(id, secret)| (id.clone(), NodeKeypair::from_secret_bytes(secret)))
            .collect();

        Self {
            keys,
            engines,
            transport,
        }
    }

    fn engine(&self, id: &str) -> &Arc<PbftEngine> {
        &self.engines[id]
    }

    /// A message signed with `sender`'s real key.
    fn forge(
        &self,
        sender: &str,
        view: u64,
        sequence: u64,
        digest: &str,
        payload: MessagePayload,
    ) -> SignedMessage {
        SignedMessage::sign(&self.keys[sender], sender, view, sequence, digest, payload).unwrap()
    }

    /// Deliver queued messages in FIFO order until the queue is empty.
    async fn settle(&self) {
        loop {
            let batch = self.transport.drain();
            if batch.is_empty() {
                break;
            }
            for (recipient, message) in batch {
                if let Some(engine) = self.engines.get(&recipient) {
                    let _ = engine.handle_message(message).await;
                }
            }
        }
    }
}

fn proposal(action: &str) -> Proposal {
    Proposal::new(
        Uuid::nil(),
        AgentRecommendation::new("diagnosis", action, "scale", 0.85),
    )
}

// ---------------------------------------------------------------------------
// 1. Normal case over the queue transport
// ---------------------------------------------------------------------------

#[tokio::test]
async fn four_honest_nodes_decide() {
    let harness = Harness::new(4, &["node-0", "node-1", "node-2", "node-3"]);
    let incident = Incident::new("DB connection pool exhausted", Severity::High);
    let rec = AgentRecommendation::new("diagnosis", "scale_database_connections", "scale", 0.85);

    let sequence = harness
        .engine("node-0")
        .propose_action(&incident, &rec)
        .await
        .unwrap();
    assert_eq!(sequence, 1);
    harness.settle().await;

    for engine in harness.engines.values() {
        let decision = engine.decision(sequence).unwrap();
        assert_eq!(decision.selected_action, "scale_database_connections");
        assert_eq!(decision.incident_id, incident.id);
        assert_eq!(engine.completed_rounds().len(), 1);
    }
}

// ---------------------------------------------------------------------------
// 2. A PREPARE whose digest differs is rejected and its sender flagged once
// ---------------------------------------------------------------------------

#[tokio::test]
async fn prepare_with_wrong_digest_is_rejected() {
    let harness = Harness::new(4, &["node-1"]);
    let backup = harness.engine("node-1");
    let accepted = proposal("scale_database_connections");
    let digest = accepted.digest().unwrap();

    let pre_prepare = harness.forge(
        "node-0",
        0,
        1,
        &digest,
        MessagePayload::PrePrepare { proposal: accepted },
    );
    backup.handle_message(pre_prepare).await.unwrap();
    let before = backup.round(1).await.unwrap().prepares.len();
    assert_eq!(before, 1, "backup records its own PREPARE");

    let other_digest = proposal("restart_service").digest().unwrap();
    let bad = harness.forge("node-2", 0, 1, &other_digest, MessagePayload::Prepare);
    let err = backup.handle_message(bad).await.unwrap_err();

    assert!(matches!(err, RemedyError::MessageVerification { ref sender, .. } if sender == "node-2"));
    assert_eq!(backup.round(1).await.unwrap().prepares.len(), before);
    let suspect = backup.node("node-2").unwrap();
    assert_eq!(suspect.suspicion_count(), 1);
    assert_eq!(suspect.state, NodeState::Suspected);
}

// ---------------------------------------------------------------------------
// 3. Three bad signatures inside the window isolate a node
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeated_bad_signatures_isolate_sender() {
    let harness = Harness::new(4, &["node-1"]);
    let backup = harness.engine("node-1");

    for sequence in 1..=3 {
        let mut msg = harness.forge("node-3", 0, sequence, "00", MessagePayload::Commit);
        msg.signature = "ab".repeat(64);
        assert!(backup.handle_message(msg).await.is_err());
    }
    let node = backup.node("node-3").unwrap();
    assert!(node.is_isolated());
    assert_eq!(node.suspicious_total, 3);

    // A correctly signed message from the isolated node is discarded too
    let valid = harness.forge("node-3", 0, 4, "00", MessagePayload::Commit);
    let err = backup.handle_message(valid).await.unwrap_err();
    assert!(err.to_string().contains("isolated"));
    assert!(backup.round(4).await.is_none());
}

#[tokio::test]
async fn isolated_sender_keeps_accruing_suspicion() {
    let harness = Harness::new(4, &["node-1"]);
    let backup = harness.engine("node-1");
    for _ in 0..3 {
        backup.flag_suspicious("node-3", "equivocation").await;
    }
    let isolated = backup.node("node-3").unwrap();
    assert!(isolated.is_isolated());

    for sequence in 1..=2 {
        let valid = harness.forge("node-3", 0, sequence, "00", MessagePayload::Prepare);
        let err = backup.handle_message(valid).await.unwrap_err();
        assert!(matches!(err, RemedyError::MessageVerification { ref reason, .. } if reason.contains("isolated")));
    }

    let after = backup.node("node-3").unwrap();
    assert_eq!(after.suspicious_total, isolated.suspicious_total + 2);
    assert!(after.reputation < isolated.reputation);
    assert_eq!(after.last_suspicion.as_deref(), Some("sender is isolated"));
    assert_eq!(backup.active_rounds(), 0);
}

// ---------------------------------------------------------------------------
// 3b. Sequence numbers must fall between the watermarks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn far_future_votes_open_no_rounds_and_isolate_sender() {
    let harness = Harness::new(4, &["node-1"]);
    let backup = harness.engine("node-1");

    for i in 1..=50u64 {
        let msg = harness.forge("node-3", 0, 1_000_000 + i * 1_000, "00", MessagePayload::Commit);
        assert!(backup.handle_message(msg).await.is_err());
    }
    assert_eq!(backup.active_rounds(), 0);
    let node = backup.node("node-3").unwrap();
    assert!(node.is_isolated());
    assert_eq!(node.suspicious_total, 50);

    let zero = harness.forge("node-2", 0, 0, "00", MessagePayload::Commit);
    let err = backup.handle_message(zero).await.unwrap_err();
    assert!(err.to_string().contains("outside watermarks"));
}

#[tokio::test]
async fn open_rounds_are_bounded_by_the_sequence_window() {
    let harness = Harness::new(4, &["node-1"]);
    let backup = harness.engine("node-1");

    let mut rejected = 0;
    for sequence in 1..=300u64 {
        let msg = harness.forge("node-2", 0, sequence, "00", MessagePayload::Commit);
        if backup.handle_message(msg).await.is_err() {
            rejected += 1;
        }
    }
    assert_eq!(backup.active_rounds(), 256);
    assert_eq!(rejected, 44);
    assert!(backup.node("node-2").unwrap().is_isolated());
}

#[tokio::test]
async fn decided_sequence_is_not_reopened() {
    let harness = Harness::new(4, &["node-0", "node-1", "node-2", "node-3"]);
    let incident = Incident::new("DB connection pool exhausted", Severity::High);
    let rec = AgentRecommendation::new("diagnosis", "scale_database_connections", "scale", 0.85);
    let sequence = harness
        .engine("node-0")
        .propose_action(&incident, &rec)
        .await
        .unwrap();
    harness.settle().await;

    let backup = harness.engine("node-1");
    assert_eq!(backup.active_rounds(), 0);
    let late = harness.forge("node-3", 0, sequence, "00", MessagePayload::Commit);
    backup.handle_message(late).await.unwrap();
    assert_eq!(backup.active_rounds(), 0);
    assert!(backup.decision(sequence).is_some());
}

#[tokio::test]
async fn unknown_sender_is_rejected_without_flagging() {
    let harness = Harness::new(4, &["node-1"]);
    let stranger = NodeKeypair::generate();
    let msg = SignedMessage::sign(&stranger, "node-9", 0, 1, "00", MessagePayload::Prepare).unwrap();
    let err = harness.engine("node-1").handle_message(msg).await.unwrap_err();
    assert!(err.to_string().contains("unknown sender"));
}

// ---------------------------------------------------------------------------
// 4. Only the primary may PRE_PREPARE, and the primary never PREPAREs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pre_prepare_from_backup_is_rejected() {
    let harness = Harness::new(4, &["node-1"]);
    let p = proposal("restart_service");
    let digest = p.digest().unwrap();
    let msg = harness.forge("node-2", 0, 1, &digest, MessagePayload::PrePrepare { proposal: p });

    let err = harness.engine("node-1").handle_message(msg).await.unwrap_err();
    assert!(err.to_string().contains("non-primary"));
    assert_eq!(harness.engine("node-1").node("node-2").unwrap().suspicion_count(), 1);
}

#[tokio::test]
async fn pre_prepare_digest_must_match_proposal() {
    let harness = Harness::new(4, &["node-1"]);
    let msg = harness.forge(
        "node-0",
        0,
        1,
        &"0".repeat(64),
        MessagePayload::PrePrepare {
            proposal: proposal("restart_service"),
        },
    );
    assert!(harness.engine("node-1").handle_message(msg).await.is_err());
    assert_eq!(harness.engine("node-1").node("node-0").unwrap().suspicion_count(), 1);
}

#[tokio::test]
async fn prepare_from_primary_is_not_counted() {
    let harness = Harness::new(4, &["node-1"]);
    let p = proposal("restart_service");
    let digest = p.digest().unwrap();
    let backup = harness.engine("node-1");
    backup
        .handle_message(harness.forge("node-0", 0, 1, &digest, MessagePayload::PrePrepare { proposal: p }))
        .await
        .unwrap();

    let from_primary = harness.forge("node-0", 0, 1, &digest, MessagePayload::Prepare);
    assert!(backup.handle_message(from_primary).await.is_err());
    assert_eq!(backup.round(1).await.unwrap().prepares.len(), 1);
}

// ---------------------------------------------------------------------------
// 5. Votes that overtake their PRE_PREPARE are buffered and replayed
// ---------------------------------------------------------------------------

#[tokio::test]
async fn out_of_order_votes_are_replayed() {
    let harness = Harness::new(4, &["node-1"]);
    let backup = harness.engine("node-1");
    let p = proposal("scale_database_connections");
    let digest = p.digest().unwrap();

    for sender in ["node-2", "node-3"] {
        backup
            .handle_message(harness.forge(sender, 0, 1, &digest, MessagePayload::Prepare))
            .await
            .unwrap();
    }
    for sender in ["node-0", "node-2", "node-3"] {
        backup
            .handle_message(harness.forge(sender, 0, 1, &digest, MessagePayload::Commit))
            .await
            .unwrap();
    }
    assert!(backup.decision(1).is_none());

    backup
        .handle_message(harness.forge("node-0", 0, 1, &digest, MessagePayload::PrePrepare { proposal: p }))
        .await
        .unwrap();

    let decision = backup.wait_for_consensus(1, Duration::from_secs(1)).await.unwrap();
    assert_eq!(decision.selected_action, "scale_database_connections");
    assert_eq!(decision.participating_agents.len(), 4);
    let round = backup.round(1).await.unwrap();
    assert_eq!(round.status, RoundStatus::Committed);
}

#[tokio::test]
async fn duplicate_votes_do_not_reach_quorum() {
    let harness = Harness::new(4, &["node-1"]);
    let backup = harness.engine("node-1");
    let p = proposal("restart_service");
    let digest = p.digest().unwrap();
    backup
        .handle_message(harness.forge("node-0", 0, 1, &digest, MessagePayload::PrePrepare { proposal: p }))
        .await
        .unwrap();

    for _ in 0..3 {
        backup
            .handle_message(harness.forge("node-2", 0, 1, &digest, MessagePayload::Prepare))
            .await
            .unwrap();
    }
    // own + node-2 = 2 = quorum - 1, so the backup commits exactly once
    let round = backup.round(1).await.unwrap();
    assert_eq!(round.prepares.len(), 2);
    assert_eq!(round.status, RoundStatus::Prepared);

    for _ in 0..3 {
        backup
            .handle_message(harness.forge("node-2", 0, 1, &digest, MessagePayload::Commit))
            .await
            .unwrap();
    }
    assert!(backup.decision(1).is_none());
}

// ---------------------------------------------------------------------------
// 6. Timeouts and impossible quorums
// ---------------------------------------------------------------------------

#[tokio::test]
async fn wait_times_out_without_votes() {
    let harness = Harness::new(4, &["node-0"]);
    let primary = harness.engine("node-0");
    let incident = Incident::new("latency", Severity::Medium);
    let rec = AgentRecommendation::new("diagnosis", "restart_service", "restart", 0.7);

    let sequence = primary.propose_action(&incident, &rec).await.unwrap();
    assert_eq!(harness.transport.len(), 3, "PRE_PREPARE queued for each backup");

    let err = primary
        .wait_for_consensus(sequence, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, RemedyError::ConsensusTimeout { sequence: 1, timeout_ms: 50 }));
    assert!(err.requires_human_approval());
}

#[tokio::test]
async fn insufficient_quorum_is_reported() {
    let harness = Harness::new(4, &["node-0"]);
    let primary = harness.engine("node-0");
    for suspect in ["node-2", "node-3"] {
        for _ in 0..3 {
            primary.flag_suspicious(suspect, "equivocation").await;
        }
    }
    assert_eq!(primary.nodes().iter().filter(|n| n.is_isolated()).count(), 2);

    let incident = Incident::new("latency", Severity::Medium);
    let rec = AgentRecommendation::new("diagnosis", "restart_service", "restart", 0.7);
    let err = primary.propose_action(&incident, &rec).await.unwrap_err();
    assert!(matches!(err, RemedyError::InsufficientQuorum { active: 2, required: 3 }));

    let err = primary
        .wait_for_consensus(7, Duration::from_millis(10))
        .await
        .unwrap_err();
    assert!(matches!(err, RemedyError::InsufficientQuorum { .. }));
}

// ---------------------------------------------------------------------------
// 7. View change replaces an isolated primary and carries undecided rounds
// ---------------------------------------------------------------------------

#[tokio::test]
async fn isolated_primary_is_replaced_and_round_carried_over() {
    let harness = Harness::new(4, &["node-0", "node-1", "node-2", "node-3"]);
    let incident = Incident::new("DB connection pool exhausted", Severity::High);
    let rec = AgentRecommendation::new("diagnosis", "scale_database_connections", "scale", 0.85);

    // Only node-1 sees the PRE_PREPARE before the primary goes bad
    let sequence = harness
        .engine("node-0")
        .propose_action(&incident, &rec)
        .await
        .unwrap();
    for (recipient, message) in harness.transport.drain() {
        if recipient == "node-1" {
            harness.engine("node-1").handle_message(message).await.unwrap();
        }
    }
    harness.transport.drain();

    for id in ["node-1", "node-2", "node-3"] {
        for _ in 0..3 {
            harness.engine(id).flag_suspicious("node-0", "stalled round").await;
        }
    }
    harness.settle().await;

    for id in ["node-1", "node-2", "node-3"] {
        let engine = harness.engine(id);
        assert_eq!(engine.current_view(), 1, "{id} moved to view 1");
        assert_eq!(engine.primary(), "node-1");
        let decision = engine.decision(sequence).expect("carried round decided");
        assert_eq!(decision.selected_action, "scale_database_connections");
        assert_eq!(decision.byzantine_nodes_detected, 1);
    }

    // The new primary keeps numbering after the carried sequence
    let next = harness
        .engine("node-1")
        .propose_action(&incident, &rec.clone().with_reasoning("second attempt"))
        .await
        .unwrap();
    assert_eq!(next, sequence + 1);
    harness.settle().await;
    assert!(harness.engine("node-3").decision(next).is_some());
}

#[tokio::test]
async fn single_view_change_request_does_not_move_view() {
    let harness = Harness::new(4, &["node-0", "node-1", "node-2", "node-3"]);
    harness.engine("node-3").request_view_change().await;
    harness.settle().await;
    for engine in harness.engines.values() {
        assert_eq!(engine.current_view(), 0);
    }
}

#[tokio::test]
async fn view_change_with_unproven_certificate_is_rejected() {
    let harness = Harness::new(4, &["node-2"]);
    let p = proposal("restart_service");
    let forged = PreparedProposal {
        sequence: 1,
        view: 0,
        digest: p.digest().unwrap(),
        proposal: p,
        prepared: true,
        prepares: Vec::new(),
    };
    let prepared = vec![forged];
    let digest = crypto::digest(&prepared).unwrap();
    let msg = harness.forge(
        "node-3",
        1,
        1,
        &digest,
        MessagePayload::ViewChange {
            new_view: 1,
            prepared,
        },
    );

    let err = harness.engine("node-2").handle_message(msg).await.unwrap_err();
    assert!(err.to_string().contains("unproven"));
    assert_eq!(harness.engine("node-2").node("node-3").unwrap().suspicion_count(), 1);
}

#[tokio::test]
async fn new_view_without_quorum_is_rejected() {
    let harness = Harness::new(4, &["node-2"]);
    let lone_vote = harness.forge(
        "node-3",
        1,
        0,
        &crypto::digest(&Vec::<PreparedProposal>::new()).unwrap(),
        MessagePayload::ViewChange {
            new_view: 1,
            prepared: Vec::new(),
        },
    );
    let reproposals: Vec<PreparedProposal> = Vec::new();
    let msg = harness.forge(
        "node-1",
        1,
        0,
        &crypto::digest(&reproposals).unwrap(),
        MessagePayload::NewView {
            view_changes: vec![lone_vote],
            reproposals,
        },
    );

    let backup = harness.engine("node-2");
    let err = backup.handle_message(msg).await.unwrap_err();
    assert!(err.to_string().contains("quorum"));
    assert_eq!(backup.current_view(), 0);
}

// ---------------------------------------------------------------------------
// 8. Safety under an equivocating primary, duplication and reordering
// ---------------------------------------------------------------------------

async fn run_equivocation(n: usize, byzantine: &[&str], seed: u64, stories: (Proposal, Proposal)) {
    let ids: Vec<String> = (0..n).map(|i| format!("node-{i}")).collect();
    let honest: Vec<&str> = ids
        .iter()
        .map(String::as_str)
        .filter(|id| !byzantine.contains(id))
        .collect();
    let harness = Harness::new(n, &honest);
    let mut rng = StdRng::seed_from_u64(seed);

    let (a, b) = stories;
    let (da, db) = (a.digest().unwrap(), b.digest().unwrap());

    // node-0 is the primary and tells each honest node a different story
    for id in &honest {
        let (p, d) = if rng.gen_bool(0.5) { (&a, &da) } else { (&b, &db) };
        let msg = harness.forge("node-0", 0, 1, d, MessagePayload::PrePrepare { proposal: p.clone() });
        harness.transport.push_to(id, msg);
    }
    // Every Byzantine node votes for both digests
    for bad in byzantine {
        for id in &honest {
            for d in [&da, &db] {
                if *bad != "node-0" {
                    harness
                        .transport
                        .push_to(id, harness.forge(bad, 0, 1, d, MessagePayload::Prepare));
                }
                harness
                    .transport
                    .push_to(id, harness.forge(bad, 0, 1, d, MessagePayload::Commit));
            }
        }
    }

    let mut pending: Vec<(String, SignedMessage)> = Vec::new();
    for _ in 0..10_000 {
        pending.extend(harness.transport.drain());
        if pending.is_empty() {
            break;
        }
        let index = rng.gen_range(0..pending.len());
        let (recipient, message) = pending.swap_remove(index);
        if rng.gen_bool(0.2) {
            pending.push((recipient.clone(), message.clone()));
        }
        if let Some(engine) = harness.engines.get(&recipient) {
            let _ = engine.handle_message(message).await;
        }
    }

    let decided: Vec<(String, Uuid)> = harness
        .engines
        .values()
        .filter_map(|e| e.decision(1))
        .map(|d| (d.selected_action, d.incident_id))
        .collect();
    let first = decided.first().cloned();
    assert!(
        decided.iter().all(|d| Some(d) == first.as_ref()),
        "seed {seed}: honest nodes decided differently: {decided:?}"
    );
}

fn conflicting_actions() -> (Proposal, Proposal) {
    (proposal("scale_database_connections"), proposal("restart_service"))
}

#[tokio::test]
async fn equivocating_primary_cannot_split_four_nodes() {
    for seed in 0..25 {
        run_equivocation(4, &["node-0"], seed, conflicting_actions()).await;
    }
}

#[tokio::test]
async fn two_byzantine_nodes_cannot_split_seven_nodes() {
    for seed in 0..25 {
        run_equivocation(7, &["node-0", "node-6"], seed, conflicting_actions()).await;
    }
}

#[tokio::test]
async fn same_action_for_different_incidents_cannot_split_nodes() {
    let rec = AgentRecommendation::new("diagnosis", "scale_database_connections", "scale", 0.85);
    for seed in 0..25 {
        let stories = (
            Proposal::new(Uuid::new_v4(), rec.clone()),
            Proposal::new(Uuid::new_v4(), rec.clone()),
        );
        run_equivocation(4, &["node-0"], seed, stories).await;
    }
}

#[tokio::test]
async fn pre_prepare_reusing_another_incidents_digest_is_rejected() {
    let harness = Harness::new(4, &["node-1", "node-2", "node-3"]);
    let rec = AgentRecommendation::new("diagnosis", "scale_database_connections", "scale", 0.85);
    let first = Proposal::new(Uuid::new_v4(), rec.clone());
    let second = Proposal::new(Uuid::new_v4(), rec);
    let digest = first.digest().unwrap();
    assert_ne!(digest, second.digest().unwrap());

    // The primary sends the second incident under the first incident's digest
    for (id, p) in [("node-1", &first), ("node-2", &second), ("node-3", &second)] {
        let msg = harness.forge("node-0", 0, 1, &digest, MessagePayload::PrePrepare { proposal: p.clone() });
        harness.transport.push_to(id, msg);
    }
    harness.settle().await;

    for id in ["node-2", "node-3"] {
        let engine = harness.engine(id);
        assert_eq!(engine.node("node-0").unwrap().suspicion_count(), 1);
        assert!(engine.round(1).await.map_or(true, |r| r.proposal.is_none()));
    }
    for engine in harness.engines.values() {
        if let Some(decision) = engine.decision(1) {
            assert_eq!(decision.incident_id, first.incident_id);
        }
    }
}
