//! Error types for pipewrite
//!
//! `Error` is what the key write path surfaces to its caller. The
//! collaborator-facing failures (`ReplicationFailure`, `AllocationError`,
//! `CommitError`) are kept separate so the writer can match on them
//! exhaustively before deciding whether anything reaches the caller.

use crate::types::{BlockId, ContainerId, KeyNameError, NodeId, PipelineId};
use thiserror::Error;

/// Common result type for pipewrite operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error returned by the key write path
#[derive(Debug, Error)]
pub enum Error {
    // Fatal write errors
    #[error("block allocation exhausted for key {key}: {reason}")]
    AllocationExhausted { key: String, reason: String },

    #[error("write retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: ReplicationFailure,
    },

    #[error("key commit failed: {0}")]
    CommitFailed(#[from] CommitError),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    // Caller errors
    #[error("invalid key name: {0}")]
    InvalidKeyName(#[from] KeyNameError),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("key already closed: {0}")]
    KeyClosed(String),

    #[error("key write aborted: {0}")]
    KeyAborted(String),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether the write was lost and the key must be treated as not written
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AllocationExhausted { .. }
                | Self::RetriesExhausted { .. }
                | Self::CommitFailed(_)
                | Self::ServiceUnavailable(_)
                | Self::KeyAborted(_)
        )
    }

    /// Check if retrying the whole key write later may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ServiceUnavailable(_) | Self::RetriesExhausted { .. } => true,
            Self::CommitFailed(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Failure reported by the replication layer for one block
///
/// A closed set: the writer classifies every variant explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicationFailure {
    /// The block's container no longer accepts writes
    #[error("container {container} is closed")]
    ContainerClosed { container: ContainerId },

    /// The pipeline lost quorum or was torn down
    #[error("pipeline {pipeline} failed ({} unreachable nodes)", .unreachable.len())]
    PipelineFailed {
        pipeline: PipelineId,
        /// Members known to be unreachable; may be empty when unknown
        unreachable: Vec<NodeId>,
    },

    /// Specific members are down; the rest of the pipeline may still commit
    #[error("{} pipeline nodes unavailable", .nodes.len())]
    NodeUnavailable { nodes: Vec<NodeId> },

    /// Node-local hiccup worth retrying against the same block
    #[error("transient failure: {reason}")]
    Transient { reason: String },
}

impl ReplicationFailure {
    /// Create a transient failure
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    /// Whether the session that saw this failure can no longer be used
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Transient { .. })
    }

    /// Short label used in logs and stats
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ContainerClosed { .. } => "container_closed",
            Self::PipelineFailed { .. } => "pipeline_failed",
            Self::NodeUnavailable { .. } => "node_unavailable",
            Self::Transient { .. } => "transient",
        }
    }
}

/// Failure returned by the control plane when asked for a block
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    /// Every eligible pipeline/container is excluded or unusable
    #[error("no eligible pipeline: {0}")]
    Exhausted(String),

    /// The control plane could not be reached
    #[error("allocator unavailable: {0}")]
    Unavailable(String),
}

/// Failure returned by the metadata service on key commit
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitError {
    #[error("metadata service rejected commit: {0}")]
    Rejected(String),

    #[error("metadata service unavailable: {0}")]
    Unavailable(String),

    #[error("block {block} is unknown to the metadata service")]
    UnknownBlock { block: BlockId },
}

impl CommitError {
    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_fatal() {
        let exhausted = Error::AllocationExhausted {
            key: "k".into(),
            reason: "all pipelines excluded".into(),
        };
        assert!(exhausted.is_fatal());
        assert!(!exhausted.is_retryable());
        assert!(Error::CommitFailed(CommitError::Rejected("x".into())).is_fatal());
        assert!(!Error::invalid_state("closed").is_fatal());
    }

    #[test]
    fn test_error_retryable() {
        assert!(Error::ServiceUnavailable("scm".into()).is_retryable());
        assert!(Error::CommitFailed(CommitError::Unavailable("om".into())).is_retryable());
        assert!(!Error::CommitFailed(CommitError::Rejected("om".into())).is_retryable());
    }

    #[test]
    fn test_replication_failure_terminal() {
        assert!(!ReplicationFailure::transient("timeout").is_terminal());
        assert!(ReplicationFailure::ContainerClosed {
            container: ContainerId::new(1)
        }
        .is_terminal());
        assert_eq!(
            ReplicationFailure::NodeUnavailable { nodes: vec![] }.kind(),
            "node_unavailable"
        );
    }

    #[test]
    fn test_invalid_key_name_is_caller_error() {
        let err: Error = crate::types::KeyName::new("").unwrap_err().into();
        assert!(matches!(err, Error::InvalidKeyName(KeyNameError::Empty)));
        assert!(!err.is_fatal());
        assert!(!err.is_retryable());
    }
}
