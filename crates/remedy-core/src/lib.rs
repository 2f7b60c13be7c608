//! Core types and error definitions for the remedy incident coordinator.
//!
//! This crate holds the data model shared by the workflow coordinator, the
//! consensus engine and the notification gateway, so none of them has to
//! depend on another just to exchange values.
//!
//! # Main types
//!
//! - [`RemedyError`]: Unified error enum covering configuration, agent, and consensus failures.
//! - [`RemedyResult`]: Convenience alias for `Result<T, RemedyError>`.
//! - [`Incident`]: The incident a workflow is run for.
//! - [`AgentRecommendation`]: A single remediation proposal produced by an agent role.
//! - [`AgentExecution`]: Per-role, per-incident execution record.
//! - [`ProcessingState`]: Aggregate state of one incident workflow.
//! - [`Timeline`]: Append-only, totally ordered event log of a workflow.
//! - [`ConsensusDecision`]: The binding output of a consensus round.
//! - [`NotificationGateway`]: Port through which escalations reach humans.

/// Consensus decision artifact.
pub mod decision;
/// Escalation payloads and the notification gateway port.
pub mod escalation;
/// Agent execution records and aggregate workflow state.
pub mod execution;
/// Incident value objects.
pub mod incident;
/// Agent recommendations and risk levels.
pub mod recommendation;
/// Append-only workflow timeline.
pub mod timeline;

pub use decision::ConsensusDecision;
pub use escalation::{ChannelOutcome, EscalationPayload, NotificationGateway};
pub use execution::{AgentExecution, ExecutionStatus, ProcessingState, WorkflowPhase};
pub use incident::{BusinessImpact, Incident, IncidentStatus, Severity};
pub use recommendation::{AgentRecommendation, RiskLevel};
pub use timeline::{Timeline, TimelineEvent, TimelineEventType, TimelineFilter};

use uuid::Uuid;

// --- Error types ---

/// Top-level error type for the remedy coordinator.
///
/// Recoverable variants are absorbed by the coordinator and turned into state
/// transitions; only configuration and quorum-impossibility errors are meant
/// to reach an operator.
#[derive(Debug, thiserror::Error)]
pub enum RemedyError {
    /// The role dependency graph or another startup input is invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An agent invocation returned an error.
    #[error("Agent '{role}' failed: {message}")]
    AgentInvocation {
        /// Role whose invocation failed.
        role: String,
        /// Error reported by the invocable.
        message: String,
    },

    /// An agent invocation did not finish within its bounded timeout.
    #[error("Agent '{role}' timed out after {timeout_ms}ms")]
    AgentTimeout {
        /// Role whose invocation timed out.
        role: String,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// Every fallback strategy configured for a role failed.
    #[error("Fallback chain for '{role}' exhausted after {attempts} attempts")]
    FallbackExhausted {
        /// Role whose chain was exhausted.
        role: String,
        /// Number of strategies attempted.
        attempts: usize,
    },

    /// No usable recommendation was produced before consensus.
    #[error("No recommendations produced for incident {incident_id}")]
    NoRecommendations {
        /// Incident the workflow ran for.
        incident_id: Uuid,
    },

    /// A protocol message failed signature, digest or sender validation.
    #[error("Message from '{sender}' rejected: {reason}")]
    MessageVerification {
        /// Claimed sender of the message.
        sender: String,
        /// Why the message was dropped.
        reason: String,
    },

    /// A proposal was submitted to a node that is not the current primary.
    #[error("Node '{node_id}' is not the primary (primary is '{primary}')")]
    NotPrimary {
        /// Node the proposal was submitted to.
        node_id: String,
        /// Primary of the current view.
        primary: String,
    },

    /// Too many participants are isolated for a quorum to be possible.
    #[error("Insufficient quorum: {active} active nodes, {required} required")]
    InsufficientQuorum {
        /// Nodes that are not isolated.
        active: usize,
        /// Quorum size.
        required: usize,
    },

    /// A consensus round did not decide within the allotted time.
    #[error("Consensus for sequence {sequence} timed out after {timeout_ms}ms")]
    ConsensusTimeout {
        /// Sequence number that was awaited.
        sequence: u64,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// A notification channel failed to deliver.
    #[error("Channel error: {0}")]
    Channel(String),

    /// A lookup for an incident, role or node found nothing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemedyError {
    /// Whether this error means consensus could not be reached and the
    /// outcome has to be confirmed by a human rather than treated as a crash.
    pub fn requires_human_approval(&self) -> bool {
        matches!(
            self,
            RemedyError::InsufficientQuorum { .. } | RemedyError::ConsensusTimeout { .. }
        )
    }

    /// Whether this error is a recoverable agent failure that should trigger
    /// the role's fallback chain.
    pub fn is_agent_failure(&self) -> bool {
        matches!(
            self,
            RemedyError::AgentInvocation { .. } | RemedyError::AgentTimeout { .. }
        )
    }
}

/// A convenience `Result` alias using [`RemedyError`].
pub type RemedyResult<T> = Result<T, RemedyError>;
