//! Storage Adapter interface.
//!
//! The document persists whole data items (buffer, metadata and counter)
//! and one manifest describing the graph structure. File layout and formats
//! belong to the adapter.
//!
//! Adapter failures are reported per item. The document logs them and keeps
//! going; in-memory state is never rolled back because a write failed.

mod memory;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::graph::{Computation, Connection};
use crate::store::{DataItem, DataItemId};

pub use memory::MemoryStorage;

/// Result type for adapter calls.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Persisted graph structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphManifest {
    pub computations: Vec<Computation>,
    pub connections: Vec<Connection>,
}

/// Persistence contract consumed by the document.
pub trait StorageAdapter: Send + Sync {
    /// Load one item.
    fn load(&self, id: DataItemId) -> StorageResult<DataItem>;

    /// Store one item, replacing any previous record.
    fn save(&self, item: &DataItem) -> StorageResult<()>;

    /// Forget one item. Deleting a missing item is not an error.
    fn delete(&self, id: DataItemId) -> StorageResult<()>;

    /// Identities of every stored item.
    fn list(&self) -> StorageResult<Vec<DataItemId>>;

    /// The stored graph structure, if any was saved.
    fn load_manifest(&self) -> StorageResult<Option<GraphManifest>>;

    fn save_manifest(&self, manifest: &GraphManifest) -> StorageResult<()>;
}
