//! Connections
//!
//! A connection keeps one value in sync with a metadata entry of a source
//! item, e.g. a crop region parameter following a graphic overlay. It is
//! scheduled like a computation whose operation is an identity copy.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::computation::ComputationId;
use super::node::NodeRef;
use crate::store::DataItemId;

/// Stable identifier of a connection within a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ConnectionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection#{}", self.0)
    }
}

/// Where a connection writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionTarget {
    /// A parameter of a computation.
    Parameter {
        computation: ComputationId,
        name: String,
    },

    /// A metadata entry of another item.
    Metadata { item: DataItemId, key: String },
}

impl ConnectionTarget {
    /// The graph node written by the connection.
    pub fn node(&self) -> NodeRef {
        match self {
            Self::Parameter { computation, .. } => NodeRef::Computation(*computation),
            Self::Metadata { item, .. } => NodeRef::Item(*item),
        }
    }
}

/// A one-way value binding from an item's metadata to a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    id: ConnectionId,
    source: DataItemId,
    source_key: String,
    target: ConnectionTarget,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        source: DataItemId,
        source_key: impl Into<String>,
        target: ConnectionTarget,
    ) -> Self {
        Self {
            id,
            source,
            source_key: source_key.into(),
            target,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The item read.
    pub fn source(&self) -> DataItemId {
        self.source
    }

    /// The metadata key read on the source.
    pub fn source_key(&self) -> &str {
        &self.source_key
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    /// Whether the connection reads or writes `item`.
    pub fn touches_item(&self, item: DataItemId) -> bool {
        self.source == item || self.target.node() == NodeRef::Item(item)
    }
}
