//! In-memory storage adapter.
//!
//! Records are MessagePack-encoded so a round trip exercises the same
//! serialization a file-backed adapter would. Writes can be made to fail,
//! per item or globally, to test failure handling.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{GraphManifest, StorageAdapter, StorageResult};
use crate::error::StorageError;
use crate::store::{DataItem, DataItemId};

const MANIFEST_KEY: &str = "manifest";

/// Thread-safe adapter keeping encoded records in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: DashMap<DataItemId, Vec<u8>>,
    manifest: Mutex<Option<Vec<u8>>>,
    failing: DashSet<DataItemId>,
    fail_writes: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write for `id` fail until [`heal`](Self::heal) is called.
    pub fn fail_item(&self, id: DataItemId) {
        self.failing.insert(id);
    }

    pub fn heal(&self, id: DataItemId) {
        self.failing.remove(&id);
    }

    /// Make every write fail, manifest included.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful item saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn contains(&self, id: DataItemId) -> bool {
        self.items.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn check_writable(&self, key: &str, id: Option<DataItemId>) -> StorageResult<()> {
        let item_failing = id.is_some_and(|id| self.failing.contains(&id));
        if item_failing || self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Io {
                key: key.to_string(),
                message: "write failure injected".to_string(),
            });
        }
        Ok(())
    }
}

fn encode<T: Serialize>(key: &str, value: &T) -> StorageResult<Vec<u8>> {
    rmp_serde::to_vec_named(value).map_err(|e| StorageError::Codec {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> StorageResult<T> {
    rmp_serde::from_slice(bytes).map_err(|e| StorageError::Codec {
        key: key.to_string(),
        message: e.to_string(),
    })
}

impl StorageAdapter for MemoryStorage {
    fn load(&self, id: DataItemId) -> StorageResult<DataItem> {
        let key = id.to_string();
        let bytes = self
            .items
            .get(&id)
            .ok_or_else(|| StorageError::Missing(key.clone()))?;
        decode(&key, bytes.value())
    }

    fn save(&self, item: &DataItem) -> StorageResult<()> {
        let key = item.id().to_string();
        self.check_writable(&key, Some(item.id()))?;
        let bytes = encode(&key, item)?;
        self.items.insert(item.id(), bytes);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete(&self, id: DataItemId) -> StorageResult<()> {
        self.check_writable(&id.to_string(), Some(id))?;
        self.items.remove(&id);
        Ok(())
    }

    fn list(&self) -> StorageResult<Vec<DataItemId>> {
        let mut ids: Vec<_> = self.items.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        Ok(ids)
    }

    fn load_manifest(&self) -> StorageResult<Option<GraphManifest>> {
        self.manifest
            .lock()
            .as_deref()
            .map(|bytes| decode(MANIFEST_KEY, bytes))
            .transpose()
    }

    fn save_manifest(&self, manifest: &GraphManifest) -> StorageResult<()> {
        self.check_writable(MANIFEST_KEY, None)?;
        let bytes = encode(MANIFEST_KEY, manifest)?;
        *self.manifest.lock() = Some(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Computation, ComputationId, InputBinding};
    use crate::store::{ArrayBuffer, DataItemStore};
    use crate::value::{Metadata, Parameters, Region, Value};

    fn item() -> DataItem {
        let mut store = DataItemStore::new();
        let mut metadata = Metadata::new();
        metadata.insert("title".into(), Value::from("spectrum"));
        metadata.insert("roi".into(), Value::from(Region::new(&[1], &[2])));
        let id = store.create(ArrayBuffer::from_f64(vec![1.5, 2.5]), metadata);
        store.get(id).unwrap().clone()
    }

    #[test]
    fn save_and_load_item() {
        let storage = MemoryStorage::new();
        let original = item();
        storage.save(&original).unwrap();

        let loaded = storage.load(original.id()).unwrap();
        assert!(loaded.content_eq(&original));
        assert_eq!(loaded.modified(), original.modified());
        assert_eq!(storage.list().unwrap(), vec![original.id()]);
        assert_eq!(storage.save_count(), 1);
    }

    #[test]
    fn missing_item() {
        let storage = MemoryStorage::new();
        assert!(matches!(
            storage.load(DataItemId::from(5)),
            Err(StorageError::Missing(_))
        ));
    }

    #[test]
    fn injected_failure_is_per_item() {
        let storage = MemoryStorage::new();
        let original = item();
        storage.fail_item(original.id());
        assert!(matches!(storage.save(&original), Err(StorageError::Io { .. })));
        assert!(!storage.contains(original.id()));

        storage.heal(original.id());
        storage.save(&original).unwrap();
        assert!(storage.contains(original.id()));
    }

    #[test]
    fn manifest_round_trip() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.load_manifest().unwrap(), None);

        let manifest = GraphManifest {
            computations: vec![Computation::new(
                ComputationId::from(1),
                "crop",
                vec![InputBinding::cropped(DataItemId::from(1), Region::new(&[0], &[1]))],
                DataItemId::from(2),
                Parameters::new(),
            )],
            connections: Vec::new(),
        };
        storage.save_manifest(&manifest).unwrap();
        assert_eq!(storage.load_manifest().unwrap(), Some(manifest));

        storage.set_fail_writes(true);
        assert!(storage.save_manifest(&GraphManifest::default()).is_err());
    }
}
