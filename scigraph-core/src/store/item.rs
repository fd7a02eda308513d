//! Data Items
//!
//! A data item is a versioned array with metadata. Items are referenced by
//! [`DataItemId`] everywhere outside the store; nothing else owns them.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::buffer::ArrayBuffer;
use crate::value::{Metadata, Value};

/// Stable identifier of a data item within a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DataItemId(u64);

impl DataItemId {
    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl From<u64> for DataItemId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for DataItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "item#{}", self.0)
    }
}

/// A data item: array buffer, metadata and modification counter.
///
/// Cloning is cheap; the element storage is shared until written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataItem {
    id: DataItemId,
    buffer: ArrayBuffer,
    metadata: Metadata,
    modified: u64,
}

impl DataItem {
    pub(crate) fn new(id: DataItemId, buffer: ArrayBuffer, metadata: Metadata) -> Self {
        Self {
            id,
            buffer,
            metadata,
            modified: 1,
        }
    }

    pub fn id(&self) -> DataItemId {
        self.id
    }

    pub fn buffer(&self) -> &ArrayBuffer {
        &self.buffer
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Look up one metadata entry.
    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Modification counter. Starts at 1 and increases with every update.
    /// This is the item's modification timestamp, as a logical clock.
    pub fn modified(&self) -> u64 {
        self.modified
    }

    /// Whether buffer and metadata are identical to `other`'s, ignoring the counter.
    pub fn content_eq(&self, other: &Self) -> bool {
        self.metadata == other.metadata && self.buffer.bit_eq(&other.buffer)
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut ArrayBuffer {
        &mut self.buffer
    }

    pub(crate) fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    pub(crate) fn bump(&mut self) -> u64 {
        self.modified += 1;
        self.modified
    }

    /// The state this item moves to when its content is replaced.
    pub(crate) fn successor(&self, buffer: ArrayBuffer, metadata: Metadata) -> DataItem {
        DataItem {
            id: self.id,
            buffer,
            metadata,
            modified: self.modified + 1,
        }
    }

    /// Take over `other`'s content and counter, keeping this item's storage
    /// where the layout allows.
    pub(crate) fn restore_from(&mut self, other: &DataItem) {
        self.buffer.assign(&other.buffer);
        self.metadata.clone_from(&other.metadata);
        self.modified = other.modified;
    }
}

/// A change to an item's content.
#[derive(Debug, Clone, Default)]
pub struct ItemUpdate {
    /// Replacement buffer, if any.
    pub buffer: Option<ArrayBuffer>,
    /// Replacement metadata, if any.
    pub metadata: Option<Metadata>,
}

impl ItemUpdate {
    /// Replace the buffer.
    pub fn buffer(buffer: ArrayBuffer) -> Self {
        Self {
            buffer: Some(buffer),
            metadata: None,
        }
    }

    /// Replace the metadata.
    pub fn metadata(metadata: Metadata) -> Self {
        Self {
            buffer: None,
            metadata: Some(metadata),
        }
    }

    /// Replace both.
    pub fn both(buffer: ArrayBuffer, metadata: Metadata) -> Self {
        Self {
            buffer: Some(buffer),
            metadata: Some(metadata),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_none() && self.metadata.is_none()
    }
}
