//! Byzantine fault-tolerant agreement on remediation actions.
//!
//! A cluster of `n` nodes tolerates `f = floor((n-1)/3)` Byzantine members.
//! The primary of view `v` is `sorted_ids[v mod n]`; it orders proposals and
//! drives the three-phase PRE_PREPARE / PREPARE / COMMIT exchange. Nodes
//! whose messages repeatedly fail validation are isolated, and an isolated
//! primary is replaced through a view change.
//!
//! # Main types
//!
//! - [`PbftEngine`]: One node's protocol state machine.
//! - [`PbftCluster`]: In-process cluster of engines over a [`LocalNetwork`].
//! - [`SignedMessage`]: Ed25519-signed protocol message.
//! - [`ConsensusStrategy`]: Port the coordinator uses to reach a decision.

/// In-process clusters of engines.
pub mod cluster;
/// Suspicion and isolation settings.
pub mod config;
/// Ed25519 keys, signatures and canonical digests.
pub mod crypto;
/// The per-node PBFT state machine.
pub mod engine;
/// Signed protocol messages.
pub mod message;
/// Participant registry and quorum arithmetic.
pub mod node;
/// Per-sequence round state.
pub mod round;
/// Consensus strategies used by the coordinator.
pub mod strategy;
/// Message delivery between nodes.
pub mod transport;
/// View-change certificates.
pub mod view_change;

pub use cluster::PbftCluster;
pub use config::PbftConfig;
pub use crypto::{NodeKeypair, PublicKey};
pub use engine::PbftEngine;
pub use message::{MessageKind, MessagePayload, PreparedProposal, Proposal, SignedMessage};
pub use node::{fault_tolerance, quorum_size, NodeRegistry, NodeState, ParticipantNode};
pub use round::{ConsensusRound, RoundStatus};
pub use strategy::{
    has_conflicts, select_proposal, unresolved_decision, ConsensusStrategy, FailoverConsensus,
    PbftStrategy, WeightedVotingStrategy,
};
pub use transport::{LocalNetwork, Transport};
