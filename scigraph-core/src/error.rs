//! Error types for the document core.
//!
//! Failures fall into two groups:
//!
//! - Structural failures (`CycleDetected`, `UnknownOperation`, missing
//!   references) reject a proposed mutation before anything is recorded.
//! - Per-computation failures (`ComputationError`) are recorded on the
//!   computation and never abort the rest of a recompute batch.

use crate::graph::{ComputationId, ConnectionId};
use crate::store::DataItemId;

/// Convenience alias used throughout the crate.
pub type Result<T, E = DocumentError> = std::result::Result<T, E>;

/// Main error type for document operations.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    /// Reference to a data item that does not exist.
    #[error("data item {0} not found")]
    ItemNotFound(DataItemId),

    /// Reference to a computation that does not exist.
    #[error("computation {0} not found")]
    ComputationNotFound(ComputationId),

    /// Reference to a connection that does not exist.
    #[error("connection {0} not found")]
    ConnectionNotFound(ConnectionId),

    /// The proposed edge would close a cycle in the dependency graph.
    #[error("binding would create a dependency cycle through {0}")]
    CycleDetected(String),

    /// No operation is registered under the given identifier.
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),

    /// An operation failed while executing.
    #[error(transparent)]
    Computation(#[from] ComputationError),

    /// The settle loop did not reach a fixed point within the round bound.
    #[error("recompute did not converge after {rounds} rounds ({pending} still dirty)")]
    RecomputeDivergence {
        /// Number of rounds executed.
        rounds: usize,
        /// Number of computations still needing a run.
        pending: usize,
    },

    /// The storage adapter failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Undo requested with nothing to undo.
    #[error("nothing to undo")]
    EmptyUndoStack,

    /// Redo requested with nothing to redo.
    #[error("nothing to redo")]
    EmptyRedoStack,

    /// Delete requested for an item that computations or connections still use.
    #[error("data item {item} is still referenced by {references} graph node(s)")]
    ItemReferenced {
        /// The item that was to be deleted.
        item: DataItemId,
        /// How many computations/connections reference it.
        references: usize,
    },

    /// The output item already has a producing computation.
    #[error("data item {item} is already the output of computation {producer}")]
    OutputAlreadyProduced {
        /// The contested output item.
        item: DataItemId,
        /// Its existing producer.
        producer: ComputationId,
    },

    /// A transaction is already open on this document.
    #[error("transaction {0} is already open")]
    TransactionInProgress(u64),

    /// Commit or cancel requested with no open transaction.
    #[error("no transaction is open")]
    NoOpenTransaction,

    /// The handle does not belong to the open transaction.
    #[error("transaction handle {0} is not the open transaction")]
    StaleTransactionHandle(u64),

    /// A buffer's element count does not match its shape.
    #[error("invalid buffer: {0}")]
    InvalidBuffer(String),

    /// A region does not fit the buffer it is applied to.
    #[error("invalid region: {0}")]
    InvalidRegion(String),

    /// The document has been closed.
    #[error("document is closed")]
    DocumentClosed,

    /// Configuration failed validation or parsing.
    #[error("configuration error: {0}")]
    Config(String),
}

impl DocumentError {
    /// Whether the error rejected a mutation before it was recorded.
    #[must_use]
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::ItemNotFound(_)
                | Self::ComputationNotFound(_)
                | Self::ConnectionNotFound(_)
                | Self::CycleDetected(_)
                | Self::UnknownOperation(_)
                | Self::ItemReferenced { .. }
                | Self::OutputAlreadyProduced { .. }
                | Self::InvalidRegion(_)
                | Self::InvalidBuffer(_)
        )
    }
}

/// Failure raised by an operation during execution.
///
/// Recorded on the computation, which then enters the errored state.
#[derive(Debug, Clone, PartialEq, thiserror::Error, serde::Serialize, serde::Deserialize)]
pub enum ComputationError {
    /// The operation received the wrong number of inputs.
    #[error("expected {expected} input(s), got {actual}")]
    InputCount {
        /// Inputs the operation needs.
        expected: usize,
        /// Inputs it was given.
        actual: usize,
    },

    /// A required parameter is missing or has the wrong type.
    #[error("parameter '{0}' is missing or invalid")]
    Parameter(String),

    /// An input buffer cannot be processed by the operation.
    #[error("unsupported input: {0}")]
    UnsupportedInput(String),

    /// The operation failed for another reason.
    #[error("{0}")]
    Failed(String),
}

impl ComputationError {
    /// Create a generic failure from a message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Failure reported by a storage adapter.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    /// Nothing is stored under the key.
    #[error("no stored record for {0}")]
    Missing(String),

    /// The stored record could not be encoded or decoded.
    #[error("codec error for {key}: {message}")]
    Codec {
        /// Record key.
        key: String,
        /// Codec message.
        message: String,
    },

    /// The backing store failed.
    #[error("i/o error for {key}: {message}")]
    Io {
        /// Record key.
        key: String,
        /// Backend message.
        message: String,
    },
}
