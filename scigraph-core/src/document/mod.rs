//! The document: one owner for items, graph, history and events.
//!
//! A [`Document`] is the single serialization point for all mutation.
//! Every edit goes through the same pipeline:
//!
//! ```text
//! edit ─► primitive ─► store / graph ─► scheduler seeds ─► transaction
//!                                                             │
//!                       events ◄─ settle (recompute) ◄─ commit┘
//! ```
//!
//! Edits made outside an explicit transaction are committed as their own
//! transaction. Recompute runs once per commit, not once per edit.
//!
//! # Example
//!
//! ```
//! use scigraph_core::{
//!     ArrayBuffer, ComputationError, ComputationSpec, Document, DocumentConfig, ItemUpdate,
//!     Metadata, OperationInput, OperationOutput, OperationRegistry, Parameters,
//! };
//!
//! fn double(
//!     inputs: &[OperationInput],
//!     _: &Parameters,
//! ) -> Result<OperationOutput, ComputationError> {
//!     let values = inputs[0].buffer.values().to_f64_vec();
//!     Ok(OperationOutput::new(ArrayBuffer::from_f64(
//!         values.into_iter().map(|v| v * 2.0).collect(),
//!     )))
//! }
//!
//! let registry = OperationRegistry::new().with("double", double);
//! let mut doc = Document::new(DocumentConfig::default(), registry).unwrap();
//! let source = doc.create_item(ArrayBuffer::from_f64(vec![1.0, 2.0]), Metadata::new()).unwrap();
//! let comp = doc.add_computation(ComputationSpec::new("double").input(source)).unwrap();
//! let output = doc.computation(comp).unwrap().output();
//! assert_eq!(doc.item(output).unwrap().buffer().values().to_f64_vec(), vec![2.0, 4.0]);
//!
//! doc.update_item(source, ItemUpdate::buffer(ArrayBuffer::from_f64(vec![5.0, 5.0]))).unwrap();
//! assert_eq!(doc.item(output).unwrap().buffer().values().to_f64_vec(), vec![10.0, 10.0]);
//!
//! doc.undo().unwrap();
//! assert_eq!(doc.item(output).unwrap().buffer().values().to_f64_vec(), vec![2.0, 4.0]);
//! ```

mod history;
mod settle;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::compute::{ComputationEngine, OperationRegistry};
use crate::config::{DocumentConfig, OutputRemovalPolicy};
use crate::error::{DocumentError, Result, StorageError};
use crate::events::{DocumentEvent, EventBus, ListenerId};
use crate::graph::{
    Computation, ComputationId, ComputationSpec, ComputationState, Connection, ConnectionId,
    ConnectionTarget, DependencyGraph, InputBinding, NodeRef, RecomputeScheduler,
};
use crate::storage::{GraphManifest, StorageAdapter};
use crate::store::{
    ArrayBuffer, ArrayValues, DType, DataItem, DataItemId, DataItemStore, ItemUpdate,
};
use crate::undo::{Primitive, TransactionLog};
use crate::value::{Metadata, Value};

use self::history::Recording;

pub use settle::SettleReport;
pub(crate) use settle::ExecutionBudget;

/// One write that failed during [`Document::flush`].
#[derive(Debug, Clone, PartialEq)]
pub struct FlushFailure {
    /// The item concerned, or `None` for the graph manifest.
    pub item: Option<DataItemId>,
    pub error: StorageError,
}

/// Outcome of writing pending changes to storage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    pub saved: usize,
    pub deleted: usize,
    pub manifest_saved: bool,
    pub failures: Vec<FlushFailure>,
}

impl FlushReport {
    /// Whether every write succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A live computation graph over data items.
pub struct Document {
    config: DocumentConfig,
    store: DataItemStore,
    graph: DependencyGraph,
    engine: ComputationEngine,
    scheduler: RecomputeScheduler,
    log: TransactionLog,
    events: EventBus,
    storage: Option<Arc<dyn StorageAdapter>>,
    /// Computations with a run in flight, keyed to the serial of that run.
    running: BTreeMap<ComputationId, u64>,
    next_run: u64,
    /// Items created or modified since the last flush.
    unsaved_items: BTreeSet<DataItemId>,
    /// Items removed since the last flush.
    deleted_items: BTreeSet<DataItemId>,
    /// Whether the graph changed since the last flush.
    structure_dirty: bool,
    auto_settle: bool,
    closed: bool,
}

impl Document {
    /// Create an empty document.
    pub fn new(config: DocumentConfig, registry: OperationRegistry) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            log: TransactionLog::new(config.undo_limit),
            config,
            store: DataItemStore::new(),
            graph: DependencyGraph::new(),
            engine: ComputationEngine::new(registry),
            scheduler: RecomputeScheduler::new(),
            events: EventBus::new(),
            storage: None,
            running: BTreeMap::new(),
            next_run: 0,
            unsaved_items: BTreeSet::new(),
            deleted_items: BTreeSet::new(),
            structure_dirty: false,
            auto_settle: true,
            closed: false,
        })
    }

    /// Load a document from storage and settle it.
    ///
    /// Items that fail to load are skipped with a warning, as are
    /// computations and connections that refer to them. A settle that does
    /// not converge is logged; the document still opens.
    #[instrument(skip_all, level = "debug")]
    pub fn open(
        config: DocumentConfig,
        registry: OperationRegistry,
        storage: Arc<dyn StorageAdapter>,
    ) -> Result<Self> {
        let mut doc = Self::new(config, registry)?;

        for id in storage.list()? {
            match storage.load(id) {
                Ok(item) => doc.store.insert(item),
                Err(error) => warn!(item = %id, %error, "item failed to load"),
            }
        }

        let manifest = storage.load_manifest()?.unwrap_or_default();
        for comp in manifest.computations {
            let id = comp.id();
            let missing = comp
                .input_items()
                .chain(std::iter::once(comp.output()))
                .find(|item| !doc.store.contains(*item));
            if let Some(item) = missing {
                warn!(computation = %id, %item, "computation skipped: item missing");
                continue;
            }
            if let Err(error) = doc.graph.add_computation(comp) {
                warn!(computation = %id, %error, "computation skipped");
            }
        }
        for conn in manifest.connections {
            let id = conn.id();
            if !doc.store.contains(conn.source()) {
                warn!(connection = %id, "connection skipped: source missing");
                continue;
            }
            if let Err(error) = doc.graph.add_connection(conn) {
                warn!(connection = %id, %error, "connection skipped");
            }
        }

        // everything loaded is already persisted
        doc.store.take_changes();
        doc.storage = Some(storage);
        let nodes: Vec<NodeRef> = doc
            .graph
            .computations()
            .map(|c| NodeRef::Computation(c.id()))
            .chain(doc.graph.connections().map(|c| NodeRef::Connection(c.id())))
            .collect();
        for node in nodes {
            doc.scheduler.invalidate_node(node);
        }

        match doc.settle_inner() {
            Ok(_) => {}
            Err(error @ DocumentError::RecomputeDivergence { .. }) => {
                warn!(%error, "document opened unsettled");
            }
            Err(other) => return Err(other),
        }
        doc.events.clear_pending();
        info!(
            items = doc.store.len(),
            computations = doc.graph.computation_count(),
            "document opened"
        );
        Ok(doc)
    }

    /// Write pending item changes, deletions and the graph manifest.
    ///
    /// Failures are collected per item and logged; failed items stay
    /// pending for the next flush. Without storage this does nothing.
    pub fn flush(&mut self) -> FlushReport {
        let mut report = FlushReport::default();
        let Some(storage) = self.storage.clone() else {
            return report;
        };
        self.absorb_changes();

        for id in std::mem::take(&mut self.deleted_items) {
            match storage.delete(id) {
                Ok(()) => report.deleted += 1,
                Err(error) => {
                    warn!(item = %id, %error, "delete failed");
                    self.deleted_items.insert(id);
                    report.failures.push(FlushFailure {
                        item: Some(id),
                        error,
                    });
                }
            }
        }

        for id in std::mem::take(&mut self.unsaved_items) {
            let Ok(item) = self.store.get(id) else {
                continue;
            };
            match storage.save(item) {
                Ok(()) => report.saved += 1,
                Err(error) => {
                    warn!(item = %id, %error, "save failed");
                    self.unsaved_items.insert(id);
                    report.failures.push(FlushFailure {
                        item: Some(id),
                        error,
                    });
                }
            }
        }

        if self.structure_dirty {
            match storage.save_manifest(&self.manifest()) {
                Ok(()) => {
                    self.structure_dirty = false;
                    report.manifest_saved = true;
                }
                Err(error) => {
                    warn!(%error, "manifest save failed");
                    report.failures.push(FlushFailure { item: None, error });
                }
            }
        }

        debug!(
            saved = report.saved,
            deleted = report.deleted,
            failures = report.failures.len(),
            "flushed"
        );
        report
    }

    /// Settle, flush and close. Later edits fail with `DocumentClosed`.
    #[instrument(skip(self), level = "debug")]
    pub fn close(&mut self) -> Result<FlushReport> {
        self.ensure_idle()?;
        if let Err(error) = self.settle_inner() {
            warn!(%error, "closing unsettled");
        }
        self.events.flush();
        let report = self.flush();
        self.closed = true;
        info!(failures = report.failures.len(), "document closed");
        Ok(report)
    }

    /// The graph structure as persisted.
    pub fn manifest(&self) -> GraphManifest {
        GraphManifest {
            computations: self.graph.computations().cloned().collect(),
            connections: self.graph.connections().cloned().collect(),
        }
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(DocumentError::DocumentClosed)
        } else {
            Ok(())
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether commits settle immediately. On by default; a caller driving
    /// recompute itself turns it off and calls [`settle`](Self::settle).
    pub fn set_auto_settle(&mut self, enabled: bool) {
        self.auto_settle = enabled;
    }

    // ------------------------------------------------------------------
    // Data items
    // ------------------------------------------------------------------

    /// Create a data item.
    pub fn create_item(&mut self, buffer: ArrayBuffer, metadata: Metadata) -> Result<DataItemId> {
        self.edit("Create data item", |doc| {
            let id = doc.store.allocate();
            doc.apply(
                Primitive::InsertItem(DataItem::new(id, buffer, metadata)),
                Recording::User,
            )?;
            Ok(id)
        })
    }

    /// Replace an item's buffer and/or metadata. Returns the new counter.
    ///
    /// A buffer of the same shape and type is written into the existing
    /// storage when no snapshot shares it.
    pub fn update_item(&mut self, id: DataItemId, update: ItemUpdate) -> Result<u64> {
        if update.is_empty() {
            return self.store.counter(id);
        }
        self.edit("Update data item", |doc| {
            let before = doc.store.get(id)?.clone();
            doc.store.update(id, update)?;
            let after = doc.store.get(id)?.clone();
            let counter = after.modified();
            doc.record_applied(Primitive::ModifyItem { before, after }, Recording::User)?;
            Ok(counter)
        })
    }

    /// Mutate an item's elements in place. Returns the new counter.
    pub fn mutate_item_values<F>(&mut self, id: DataItemId, f: F) -> Result<u64>
    where
        F: FnOnce(&mut ArrayValues),
    {
        self.edit("Edit data item values", |doc| {
            let before = doc.store.get(id)?.clone();
            let counter = doc.store.mutate_values(id, f)?;
            let after = doc.store.get(id)?.clone();
            doc.record_applied(Primitive::ModifyItem { before, after }, Recording::User)?;
            Ok(counter)
        })
    }

    /// Set one metadata entry. Returns the new counter.
    pub fn set_item_metadata(
        &mut self,
        id: DataItemId,
        key: &str,
        value: impl Into<Value>,
    ) -> Result<u64> {
        let value = value.into();
        self.edit("Set metadata", |doc| {
            let before = doc.store.get(id)?.clone();
            let counter = doc.store.set_metadata_value(id, key, value)?;
            let after = doc.store.get(id)?.clone();
            doc.record_applied(Primitive::ModifyItem { before, after }, Recording::User)?;
            Ok(counter)
        })
    }

    /// Delete an item.
    ///
    /// Fails with `ItemReferenced` while computations or connections use it,
    /// unless `force` is set: then those connections are unbound and those
    /// computations removed first, their outputs following the removal
    /// policy.
    pub fn delete_item(&mut self, id: DataItemId, force: bool) -> Result<()> {
        self.edit("Delete data item", |doc| {
            doc.store.get(id)?;
            let references = doc.graph.references_to(id);
            if !references.is_empty() && !force {
                return Err(DocumentError::ItemReferenced {
                    item: id,
                    references: references.len(),
                });
            }

            let producer = doc.graph.producer_of(id);
            for node in &references {
                if let NodeRef::Connection(conn) = node {
                    doc.unbind_inner(*conn)?;
                }
            }
            for node in &references {
                if let NodeRef::Computation(comp) = node {
                    if Some(*comp) != producer && doc.graph.computation(*comp).is_ok() {
                        doc.remove_computation_inner(*comp)?;
                    }
                }
            }
            if let Some(comp) = producer {
                if doc.graph.computation(comp).is_ok() {
                    doc.remove_computation_inner(comp)?;
                }
            }

            // the removal policy may already have taken it
            if let Ok(item) = doc.store.get(id) {
                let item = item.clone();
                doc.apply(Primitive::RemoveItem(item), Recording::User)?;
            }
            Ok(())
        })
    }

    pub fn item(&self, id: DataItemId) -> Result<&DataItem> {
        self.store.get(id)
    }

    /// Iterate items in identity order.
    pub fn items(&self) -> impl Iterator<Item = &DataItem> {
        self.store.iter()
    }

    pub fn item_count(&self) -> usize {
        self.store.len()
    }

    // ------------------------------------------------------------------
    // Computations
    // ------------------------------------------------------------------

    /// Add a computation.
    ///
    /// Without an explicit output a new empty item is created for it. The
    /// computation starts dirty and runs when the edit commits; a failing
    /// first run leaves it errored but still added.
    pub fn add_computation(&mut self, spec: ComputationSpec) -> Result<ComputationId> {
        self.engine.registry().lookup(&spec.operation)?;
        for binding in &spec.inputs {
            self.store.get(binding.item)?;
        }
        if let Some(output) = spec.output {
            self.store.get(output)?;
        }

        self.edit("Add computation", |doc| {
            let output = match spec.output {
                Some(output) => output,
                None => {
                    let id = doc.store.allocate();
                    let empty =
                        DataItem::new(id, ArrayBuffer::zeros(&[0], DType::F64), Metadata::new());
                    doc.apply(Primitive::InsertItem(empty), Recording::User)?;
                    id
                }
            };
            let id = doc.graph.allocate_computation_id();
            let comp = Computation::new(id, spec.operation, spec.inputs, output, spec.parameters);
            doc.apply(Primitive::InsertComputation(comp), Recording::User)?;
            Ok(id)
        })
    }

    /// Set one parameter of a computation.
    pub fn set_parameter(
        &mut self,
        id: ComputationId,
        name: &str,
        value: impl Into<Value>,
    ) -> Result<()> {
        let value = value.into();
        self.edit("Set parameter", |doc| {
            let before = doc.graph.computation(id)?.clone();
            let mut after = before.clone();
            if after.set_parameter(name, value) {
                doc.apply(Primitive::ModifyComputation { before, after }, Recording::User)?;
            }
            Ok(())
        })
    }

    /// Replace a computation's inputs.
    pub fn rebind_inputs(&mut self, id: ComputationId, inputs: Vec<InputBinding>) -> Result<()> {
        for binding in &inputs {
            self.store.get(binding.item)?;
        }
        self.edit("Rebind inputs", |doc| {
            let before = doc.graph.computation(id)?.clone();
            let mut after = before.clone();
            after.set_inputs(inputs);
            doc.apply(Primitive::ModifyComputation { before, after }, Recording::User)
        })
    }

    /// Remove a computation. Its output is kept or deleted according to
    /// the configured [`OutputRemovalPolicy`].
    pub fn remove_computation(&mut self, id: ComputationId) -> Result<()> {
        self.edit("Remove computation", |doc| doc.remove_computation_inner(id))
    }

    fn remove_computation_inner(&mut self, id: ComputationId) -> Result<()> {
        for conn in self.graph.connections_into(id) {
            self.unbind_inner(conn)?;
        }
        let comp = self.graph.computation(id)?.clone();
        let output = comp.output();
        self.apply(Primitive::RemoveComputation(comp), Recording::User)?;

        match self.config.removal_policy {
            OutputRemovalPolicy::Delete if self.graph.references_to(output).is_empty() => {
                if let Ok(item) = self.store.get(output) {
                    let item = item.clone();
                    self.apply(Primitive::RemoveItem(item), Recording::User)?;
                }
            }
            OutputRemovalPolicy::Delete => {
                debug!(item = %output, "output still referenced, orphaned");
            }
            OutputRemovalPolicy::Orphan => {}
        }
        Ok(())
    }

    pub fn computation(&self, id: ComputationId) -> Result<&Computation> {
        self.graph.computation(id)
    }

    /// Iterate computations in identity order.
    pub fn computations(&self) -> impl Iterator<Item = &Computation> {
        self.graph.computations()
    }

    /// The computation's state, `Running` while a run is in flight.
    pub fn computation_state(&self, id: ComputationId) -> Result<ComputationState> {
        let comp = self.graph.computation(id)?;
        if self.running.contains_key(&id) {
            Ok(ComputationState::Running)
        } else {
            Ok(comp.state())
        }
    }

    /// Whether the output does not reflect the current inputs and
    /// parameters.
    pub fn is_dirty(&self, id: ComputationId) -> Result<bool> {
        let comp = self.graph.computation(id)?;
        let version = ComputationEngine::current_version(comp, &self.store)?;
        Ok(comp.is_dirty(&version))
    }

    /// Whether any edit is waiting to be settled.
    pub fn has_pending_recompute(&self) -> bool {
        self.scheduler.has_pending() || !self.running.is_empty()
    }

    /// Computations that consume `item`.
    pub fn inputs_of(&self, item: DataItemId) -> BTreeSet<ComputationId> {
        self.graph.inputs_of(item)
    }

    /// Computations affected by a change to `item`, in recompute order.
    pub fn affected_by(&self, item: DataItemId) -> Vec<ComputationId> {
        self.graph.affected_by(item)
    }

    pub fn producer_of(&self, item: DataItemId) -> Option<ComputationId> {
        self.graph.producer_of(item)
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Keep `target` in sync with the metadata entry `source_key` of
    /// `source`.
    pub fn bind_connection(
        &mut self,
        source: DataItemId,
        source_key: impl Into<String>,
        target: ConnectionTarget,
    ) -> Result<ConnectionId> {
        self.store.get(source)?;
        match &target {
            ConnectionTarget::Parameter { computation, .. } => {
                self.graph.computation(*computation)?;
            }
            ConnectionTarget::Metadata { item, .. } => {
                self.store.get(*item)?;
            }
        }
        let source_key = source_key.into();
        self.edit("Bind connection", |doc| {
            let id = doc.graph.allocate_connection_id();
            let conn = Connection::new(id, source, source_key, target);
            doc.apply(Primitive::BindConnection(conn), Recording::User)?;
            Ok(id)
        })
    }

    pub fn unbind_connection(&mut self, id: ConnectionId) -> Result<()> {
        self.edit("Unbind connection", |doc| doc.unbind_inner(id))
    }

    fn unbind_inner(&mut self, id: ConnectionId) -> Result<()> {
        let conn = self.graph.connection(id)?.clone();
        self.apply(Primitive::UnbindConnection(conn), Recording::User)
    }

    pub fn connection(&self, id: ConnectionId) -> Result<&Connection> {
        self.graph.connection(id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.graph.connections()
    }

    // ------------------------------------------------------------------
    // Events and accessors
    // ------------------------------------------------------------------

    /// Register a change listener.
    pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
    where
        F: Fn(&DocumentEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.events.unsubscribe(id)
    }

    pub(crate) fn flush_events(&mut self) {
        self.events.flush();
    }

    pub fn config(&self) -> &DocumentConfig {
        &self.config
    }

    pub fn registry(&self) -> &OperationRegistry {
        self.engine.registry()
    }

    /// Read access to the dependency graph.
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("items", &self.store.len())
            .field("computations", &self.graph.computation_count())
            .field("running", &self.running)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
