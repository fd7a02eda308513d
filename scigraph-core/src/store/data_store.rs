//! Data Item Store
//!
//! The store owns every data item of a document and assigns identities.
//! It knows nothing about computations: reference checks on delete are the
//! document's job, because only the dependency graph knows who consumes
//! what.
//!
//! Every successful create, update and remove is logged as an
//! [`ItemChange`]; the document drains the log to seed invalidation.

use std::collections::BTreeMap;

use tracing::trace;

use super::buffer::{ArrayBuffer, ArrayValues};
use super::item::{DataItem, DataItemId, ItemUpdate};
use crate::error::{DocumentError, Result};
use crate::value::{Metadata, Value};

/// A change notification emitted by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemChange {
    Created(DataItemId),
    Modified(DataItemId),
    Removed(DataItemId),
}

impl ItemChange {
    /// The item concerned.
    pub fn item(&self) -> DataItemId {
        match *self {
            Self::Created(id) | Self::Modified(id) | Self::Removed(id) => id,
        }
    }
}

/// Owner of all data items in a document.
#[derive(Debug, Default)]
pub struct DataItemStore {
    items: BTreeMap<DataItemId, DataItem>,
    next_id: u64,
    changes: Vec<ItemChange>,
}

impl DataItemStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new item and return its identity.
    pub fn create(&mut self, buffer: ArrayBuffer, metadata: Metadata) -> DataItemId {
        let id = self.allocate();
        self.items.insert(id, DataItem::new(id, buffer, metadata));
        self.changes.push(ItemChange::Created(id));
        trace!(item = %id, "data item created");
        id
    }

    /// Reserve an identity without creating the item.
    pub(crate) fn allocate(&mut self) -> DataItemId {
        self.next_id += 1;
        DataItemId::from(self.next_id)
    }

    /// Insert a fully formed item, keeping its identity and counter.
    ///
    /// Used when restoring from history or storage.
    pub fn insert(&mut self, item: DataItem) {
        let id = item.id();
        self.next_id = self.next_id.max(id.raw());
        self.items.insert(id, item);
        self.changes.push(ItemChange::Created(id));
    }

    /// Look up an item.
    pub fn get(&self, id: DataItemId) -> Result<&DataItem> {
        self.items.get(&id).ok_or(DocumentError::ItemNotFound(id))
    }

    pub fn contains(&self, id: DataItemId) -> bool {
        self.items.contains_key(&id)
    }

    /// Current modification counter of an item.
    pub fn counter(&self, id: DataItemId) -> Result<u64> {
        self.get(id).map(DataItem::modified)
    }

    /// Replace buffer and/or metadata, returning the new counter.
    ///
    /// A buffer with the same shape and type is written into the existing
    /// storage; otherwise the storage is replaced. Identity is preserved
    /// either way.
    pub fn update(&mut self, id: DataItemId, update: ItemUpdate) -> Result<u64> {
        let item = self.items.get_mut(&id).ok_or(DocumentError::ItemNotFound(id))?;
        if let Some(buffer) = &update.buffer {
            item.buffer_mut().assign(buffer);
        }
        if let Some(metadata) = update.metadata {
            *item.metadata_mut() = metadata;
        }
        let counter = item.bump();
        self.changes.push(ItemChange::Modified(id));
        trace!(item = %id, counter, "data item updated");
        Ok(counter)
    }

    /// Mutate the elements in place, returning the new counter.
    ///
    /// Fails with `InvalidBuffer`, leaving the item untouched, if `f` changes
    /// the element count or type.
    pub fn mutate_values<F>(&mut self, id: DataItemId, f: F) -> Result<u64>
    where
        F: FnOnce(&mut ArrayValues),
    {
        let item = self.items.get_mut(&id).ok_or(DocumentError::ItemNotFound(id))?;
        item.buffer_mut().mutate_values(f)?;
        let counter = item.bump();
        self.changes.push(ItemChange::Modified(id));
        Ok(counter)
    }

    /// Set one metadata entry, returning the new counter.
    pub fn set_metadata_value(
        &mut self,
        id: DataItemId,
        key: &str,
        value: Value,
    ) -> Result<u64> {
        let item = self.items.get_mut(&id).ok_or(DocumentError::ItemNotFound(id))?;
        item.metadata_mut().insert(key.to_string(), value);
        let counter = item.bump();
        self.changes.push(ItemChange::Modified(id));
        Ok(counter)
    }

    /// Put an item back to a recorded state, counter included.
    pub fn restore(&mut self, state: &DataItem) -> Result<()> {
        let id = state.id();
        let item = self.items.get_mut(&id).ok_or(DocumentError::ItemNotFound(id))?;
        item.restore_from(state);
        self.changes.push(ItemChange::Modified(id));
        Ok(())
    }

    /// Remove an item and hand it back.
    pub fn remove(&mut self, id: DataItemId) -> Result<DataItem> {
        let item = self.items.remove(&id).ok_or(DocumentError::ItemNotFound(id))?;
        self.changes.push(ItemChange::Removed(id));
        trace!(item = %id, "data item removed");
        Ok(item)
    }

    /// Drain the change log.
    pub fn take_changes(&mut self) -> Vec<ItemChange> {
        std::mem::take(&mut self.changes)
    }

    /// Iterate items in identity order.
    pub fn iter(&self) -> impl Iterator<Item = &DataItem> {
        self.items.values()
    }

    pub fn ids(&self) -> Vec<DataItemId> {
        self.items.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DType;

    fn store_with_item() -> (DataItemStore, DataItemId) {
        let mut store = DataItemStore::new();
        let id = store.create(ArrayBuffer::from_f64(vec![1.0, 2.0, 3.0]), Metadata::new());
        (store, id)
    }

    #[test]
    fn create_assigns_distinct_ids() {
        let mut store = DataItemStore::new();
        let a = store.create(ArrayBuffer::from_f64(vec![]), Metadata::new());
        let b = store.create(ArrayBuffer::from_f64(vec![]), Metadata::new());
        assert_ne!(a, b);
        assert!(a < b);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn update_increments_counter() {
        let (mut store, id) = store_with_item();
        assert_eq!(store.counter(id).unwrap(), 1);
        let counter = store
            .update(id, ItemUpdate::buffer(ArrayBuffer::from_f64(vec![4.0, 5.0, 6.0])))
            .unwrap();
        assert_eq!(counter, 2);
        assert_eq!(
            store.get(id).unwrap().buffer().values().to_f64_vec(),
            vec![4.0, 5.0, 6.0]
        );
    }

    #[test]
    fn shape_change_keeps_identity() {
        let (mut store, id) = store_with_item();
        store
            .update(id, ItemUpdate::buffer(ArrayBuffer::zeros(&[2, 2], DType::U8)))
            .unwrap();
        let item = store.get(id).unwrap();
        assert_eq!(item.id(), id);
        assert_eq!(item.buffer().shape(), &[2, 2]);
    }

    #[test]
    fn mutate_values_in_place() {
        let (mut store, id) = store_with_item();
        store
            .mutate_values(id, |values| {
                if let ArrayValues::F64(v) = values {
                    v[0] = 10.0;
                }
            })
            .unwrap();
        assert_eq!(store.get(id).unwrap().buffer().values().to_f64_vec()[0], 10.0);
        assert_eq!(store.counter(id).unwrap(), 2);
    }

    #[test]
    fn snapshot_survives_in_place_mutation() {
        let (mut store, id) = store_with_item();
        let snapshot = store.get(id).unwrap().clone();
        store
            .mutate_values(id, |values| {
                if let ArrayValues::F64(v) = values {
                    v[1] = -1.0;
                }
            })
            .unwrap();
        assert_eq!(snapshot.buffer().values().to_f64_vec(), vec![1.0, 2.0, 3.0]);
        store.restore(&snapshot).unwrap();
        assert_eq!(store.counter(id).unwrap(), 1);
        assert!(store.get(id).unwrap().content_eq(&snapshot));
    }

    #[test]
    fn mutation_must_keep_layout() {
        let (mut store, id) = store_with_item();
        let truncated = store.mutate_values(id, |values| {
            if let ArrayValues::F64(v) = values {
                v.truncate(1);
            }
        });
        assert!(matches!(truncated, Err(DocumentError::InvalidBuffer(_))));

        let retyped = store.mutate_values(id, |values| *values = ArrayValues::I32(vec![1, 2, 3]));
        assert!(matches!(retyped, Err(DocumentError::InvalidBuffer(_))));

        let item = store.get(id).unwrap();
        assert_eq!(item.buffer().values().to_f64_vec(), vec![1.0, 2.0, 3.0]);
        assert_eq!(item.buffer().dtype(), DType::F64);
        assert_eq!(store.counter(id).unwrap(), 1);
        assert!(store.take_changes().iter().all(|c| !matches!(c, ItemChange::Modified(_))));
    }

    #[test]
    fn missing_item_is_not_found() {
        let mut store = DataItemStore::new();
        let ghost = DataItemId::from(99);
        assert!(matches!(store.get(ghost), Err(DocumentError::ItemNotFound(_))));
        assert!(store.update(ghost, ItemUpdate::default()).is_err());
        assert!(store.remove(ghost).is_err());
    }

    #[test]
    fn changes_are_logged_in_order() {
        let (mut store, id) = store_with_item();
        store.set_metadata_value(id, "title", Value::from("x")).unwrap();
        store.remove(id).unwrap();
        assert_eq!(
            store.take_changes(),
            vec![
                ItemChange::Created(id),
                ItemChange::Modified(id),
                ItemChange::Removed(id)
            ]
        );
        assert!(store.take_changes().is_empty());
    }

    #[test]
    fn insert_advances_allocator() {
        let mut store = DataItemStore::new();
        let item = DataItem::new(
            DataItemId::from(7),
            ArrayBuffer::from_f64(vec![]),
            Metadata::new(),
        );
        store.insert(item);
        let next = store.create(ArrayBuffer::from_f64(vec![]), Metadata::new());
        assert_eq!(next.raw(), 8);
    }
}
