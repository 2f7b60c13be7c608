use crate::message::{MessageKind, Proposal, SignedMessage};
use chrono::{DateTime, Utc};
use remedy_core::ConsensusDecision;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Progress of a round at the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    /// No PRE_PREPARE accepted yet; votes are buffered.
    Waiting,
    /// A PRE_PREPARE was accepted for the current view.
    PrePrepared,
    /// A prepare quorum was seen and this node sent its COMMIT.
    Prepared,
    /// A commit quorum was seen and the round is decided.
    Committed,
}

/// Per-sequence consensus state.
///
/// Votes are keyed by sender, so a replayed message never counts twice.
#[derive(Debug, Clone, Serialize)]
pub struct ConsensusRound {
    /// Sequence number the primary assigned.
    pub sequence: u64,
    /// View of the accepted PRE_PREPARE.
    pub view: u64,
    /// Digest of the accepted proposal.
    pub digest: Option<String>,
    /// Proposal carried by the accepted PRE_PREPARE.
    pub proposal: Option<Proposal>,
    /// Sender of the accepted PRE_PREPARE.
    pub primary: Option<String>,
    /// Accepted PREPAREs by sender.
    pub prepares: BTreeMap<String, SignedMessage>,
    /// Accepted COMMITs by sender.
    pub commits: BTreeMap<String, SignedMessage>,
    /// Local progress of the round.
    pub status: RoundStatus,
    /// Set once a commit quorum decides the round.
    pub decision: Option<ConsensusDecision>,
    /// When the round was opened or last re-installed.
    pub started_at: DateTime<Utc>,
    /// PREPARE/COMMIT messages that arrived ahead of their PRE_PREPARE.
    #[serde(skip)]
    pending: BTreeMap<(MessageKind, String), SignedMessage>,
}

impl ConsensusRound {
    /// An empty round waiting for its PRE_PREPARE.
    pub fn new(sequence: u64) -> Self {
        Self {
            sequence,
            view: 0,
            digest: None,
            proposal: None,
            primary: None,
            prepares: BTreeMap::new(),
            commits: BTreeMap::new(),
            status: RoundStatus::Waiting,
            decision: None,
            started_at: Utc::now(),
            pending: BTreeMap::new(),
        }
    }

    /// Whether a commit quorum decided the round.
    pub fn is_decided(&self) -> bool {
        self.decision.is_some()
    }

    /// Accept a PRE_PREPARE for `view`, discarding votes from older views.
    pub fn install(&mut self, view: u64, digest: String, proposal: Proposal, primary: &str) {
        if view != self.view {
            self.prepares.clear();
            self.commits.clear();
            self.pending.retain(|_, msg| msg.view >= view);
        }
        self.view = view;
        self.digest = Some(digest);
        self.proposal = Some(proposal);
        self.primary = Some(primary.to_string());
        self.status = RoundStatus::PrePrepared;
        self.started_at = Utc::now();
    }

    /// Hold a vote until the round can evaluate it. First copy per sender wins.
    pub fn buffer(&mut self, message: SignedMessage) {
        self.pending
            .entry((message.kind(), message.sender.clone()))
            .or_insert(message);
    }

    /// Drain buffered votes for replay.
    pub fn take_pending(&mut self) -> Vec<SignedMessage> {
        std::mem::take(&mut self.pending).into_values().collect()
    }

    /// Votes waiting for the round to catch up.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Record a vote. Returns `false` for a duplicate from the same sender.
    pub fn record_vote(&mut self, message: SignedMessage) -> bool {
        let bucket = match message.kind() {
            MessageKind::Prepare => &mut self.prepares,
            MessageKind::Commit => &mut self.commits,
            _ => return false,
        };
        if bucket.contains_key(&message.sender) {
            return false;
        }
        bucket.insert(message.sender.clone(), message);
        true
    }

    /// PREPAREs from senders that are not isolated.
    pub fn prepare_count(&self, isolated: &BTreeSet<String>) -> usize {
        self.prepares.keys().filter(|s| !isolated.contains(*s)).count()
    }

    /// COMMITs from senders that are not isolated.
    pub fn commit_count(&self, isolated: &BTreeSet<String>) -> usize {
        self.commits.keys().filter(|s| !isolated.contains(*s)).count()
    }

    /// Senders of COMMITs that are not isolated.
    pub fn committers(&self, isolated: &BTreeSet<String>) -> Vec<String> {
        self.commits
            .keys()
            .filter(|s| !isolated.contains(*s))
            .cloned()
            .collect()
    }
}
