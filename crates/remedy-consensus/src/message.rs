//! Signed protocol messages exchanged between PBFT nodes.

use crate::crypto::{self, NodeKeypair, PublicKey};
use chrono::{DateTime, Utc};
use remedy_core::{AgentRecommendation, RemedyResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message type tag, as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    PrePrepare,
    Prepare,
    Commit,
    ViewChange,
    NewView,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::PrePrepare => write!(f, "PRE_PREPARE"),
            MessageKind::Prepare => write!(f, "PREPARE"),
            MessageKind::Commit => write!(f, "COMMIT"),
            MessageKind::ViewChange => write!(f, "VIEW_CHANGE"),
            MessageKind::NewView => write!(f, "NEW_VIEW"),
        }
    }
}

/// The action a primary asks the cluster to agree on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub incident_id: Uuid,
    pub recommendation: AgentRecommendation,
}

impl Proposal {
    pub fn new(incident_id: Uuid, recommendation: AgentRecommendation) -> Self {
        Self {
            incident_id,
            recommendation,
        }
    }

    /// Digest every vote for this proposal must carry. Covers the incident
    /// id as well as the recommendation.
    pub fn digest(&self) -> RemedyResult<String> {
        crypto::digest(self)
    }
}

/// A sequence's accepted proposal as reported in a VIEW_CHANGE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedProposal {
    pub sequence: u64,
    /// View in which the proposal was accepted.
    pub view: u64,
    pub digest: String,
    pub proposal: Proposal,
    /// Whether the reporting node had collected a prepare quorum for it.
    pub prepared: bool,
    /// The signed PREPAREs backing a prepared certificate.
    #[serde(default)]
    pub prepares: Vec<SignedMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessagePayload {
    PrePrepare {
        proposal: Proposal,
    },
    Prepare,
    Commit,
    ViewChange {
        new_view: u64,
        prepared: Vec<PreparedProposal>,
    },
    NewView {
        /// The VIEW_CHANGE messages that justify the new view.
        view_changes: Vec<SignedMessage>,
        /// Undecided sequences re-proposed in the new view, derived from
        /// `view_changes`.
        reproposals: Vec<PreparedProposal>,
    },
}

impl MessagePayload {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessagePayload::PrePrepare { .. } => MessageKind::PrePrepare,
            MessagePayload::Prepare => MessageKind::Prepare,
            MessagePayload::Commit => MessageKind::Commit,
            MessagePayload::ViewChange { .. } => MessageKind::ViewChange,
            MessagePayload::NewView { .. } => MessageKind::NewView,
        }
    }
}

/// A protocol message plus its sender's signature.
///
/// The signature covers the canonical JSON of every other field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedMessage {
    pub view: u64,
    pub sequence: u64,
    pub digest: String,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    pub payload: MessagePayload,
    pub signature: String,
}

#[derive(Serialize)]
struct SigningView<'a> {
    view: u64,
    sequence: u64,
    digest: &'a str,
    sender: &'a str,
    timestamp: &'a DateTime<Utc>,
    payload: &'a MessagePayload,
}

impl SignedMessage {
    /// Build and sign a message.
    pub fn sign(
        keypair: &NodeKeypair,
        sender: impl Into<String>,
        view: u64,
        sequence: u64,
        digest: impl Into<String>,
        payload: MessagePayload,
    ) -> RemedyResult<Self> {
        let mut message = Self {
            view,
            sequence,
            digest: digest.into(),
            sender: sender.into(),
            timestamp: Utc::now(),
            payload,
            signature: String::new(),
        };
        message.signature = keypair.sign(&message.signing_bytes()?);
        Ok(message)
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    fn signing_bytes(&self) -> RemedyResult<Vec<u8>> {
        crypto::canonical_bytes(&SigningView {
            view: self.view,
            sequence: self.sequence,
            digest: &self.digest,
            sender: &self.sender,
            timestamp: &self.timestamp,
            payload: &self.payload,
        })
    }

    /// Verify the signature against the sender's registered key.
    pub fn verify(&self, key: &PublicKey) -> Result<(), String> {
        let bytes = self
            .signing_bytes()
            .map_err(|e| format!("Unserializable message: {e}"))?;
        key.verify(&bytes, &self.signature)
    }
}
