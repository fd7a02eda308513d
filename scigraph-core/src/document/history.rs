//! The mutation pipeline: applying primitives, transactions, undo and redo.
//!
//! Every change to the document, live or replayed, goes through
//! [`Document::apply`]. It mutates the store or graph, seeds the scheduler,
//! queues the matching event and records the primitive according to its
//! [`Recording`] mode.

use tracing::{debug, info, instrument, warn};

use super::Document;
use crate::error::{DocumentError, Result};
use crate::graph::NodeRef;
use crate::store::ItemChange;
use crate::undo::{Primitive, TransactionHandle};

/// Where an applied primitive goes in the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Recording {
    /// A user edit; recorded in the open transaction.
    User,
    /// A recompute result; see `TransactionLog::record_derived`.
    Derived,
    /// Undo, redo and rollback; not recorded.
    Replay,
}

impl Document {
    /// Apply a primitive and record it.
    pub(crate) fn apply(&mut self, primitive: Primitive, recording: Recording) -> Result<()> {
        self.apply_raw(&primitive)?;
        self.record_applied(primitive, recording)
    }

    /// Record a primitive whose effect has already been made.
    pub(crate) fn record_applied(
        &mut self,
        primitive: Primitive,
        recording: Recording,
    ) -> Result<()> {
        self.absorb_changes();
        self.events.queue(primitive.event());
        match recording {
            Recording::User => self.log.record(primitive)?,
            Recording::Derived => self.log.record_derived(primitive),
            Recording::Replay => {}
        }
        Ok(())
    }

    /// Make the primitive's post-state current.
    ///
    /// Each arm performs one fallible step before touching anything else, so
    /// a failure leaves the document unchanged.
    fn apply_raw(&mut self, primitive: &Primitive) -> Result<()> {
        match primitive {
            Primitive::InsertItem(item) => {
                self.store.insert(item.clone());
            }
            Primitive::RemoveItem(item) => {
                self.store.remove(item.id())?;
            }
            Primitive::ModifyItem { after, .. } => {
                self.store.restore(after)?;
            }
            Primitive::InsertComputation(comp) => {
                self.graph.add_computation(comp.clone())?;
                self.scheduler.invalidate_node(NodeRef::Computation(comp.id()));
                self.structure_dirty = true;
            }
            Primitive::RemoveComputation(comp) => {
                self.graph.remove_computation(comp.id())?;
                self.running.remove(&comp.id());
                self.structure_dirty = true;
            }
            Primitive::ModifyComputation { after, .. } => {
                self.graph.replace_computation(after.clone())?;
                self.scheduler.invalidate_node(NodeRef::Computation(after.id()));
                self.structure_dirty = true;
            }
            Primitive::BindConnection(conn) => {
                self.graph.add_connection(conn.clone())?;
                self.scheduler.invalidate_node(NodeRef::Connection(conn.id()));
                self.structure_dirty = true;
            }
            Primitive::UnbindConnection(conn) => {
                self.graph.remove_connection(conn.id())?;
                self.structure_dirty = true;
            }
        }
        Ok(())
    }

    /// Turn store notifications into invalidation seeds and pending writes.
    pub(crate) fn absorb_changes(&mut self) {
        for change in self.store.take_changes() {
            match change {
                ItemChange::Created(id) | ItemChange::Modified(id) => {
                    self.scheduler.invalidate_item(id);
                    self.deleted_items.remove(&id);
                    self.unsaved_items.insert(id);
                }
                ItemChange::Removed(id) => {
                    self.unsaved_items.remove(&id);
                    self.deleted_items.insert(id);
                }
            }
        }
    }

    /// Apply inverses of `primitives`, last first, without recording.
    fn rollback(&mut self, primitives: &[Primitive]) {
        for primitive in primitives.iter().rev() {
            if let Err(error) = self.apply_raw(&primitive.inverse()) {
                warn!(kind = primitive.kind(), %error, "rollback step failed");
            }
        }
        self.absorb_changes();
    }

    /// Run `f` as one undoable step.
    ///
    /// Inside an explicit transaction the step joins it; otherwise it gets
    /// its own transaction, committed (and settled) when `f` succeeds. On
    /// failure everything `f` applied is rolled back.
    pub(crate) fn edit<T>(
        &mut self,
        description: &str,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.ensure_open()?;
        let implicit = if self.log.is_open() {
            None
        } else {
            Some(self.log.begin(description)?)
        };
        let mark = self.log.open_len();
        let event_mark = self.events.pending().len();

        match f(self) {
            Ok(value) => {
                if let Some(handle) = implicit {
                    self.log.commit(handle)?;
                    self.after_commit()?;
                }
                Ok(value)
            }
            Err(error) => {
                let applied = self.log.truncate_open(mark);
                self.rollback(&applied);
                self.events.truncate_pending(event_mark);
                if let Some(handle) = implicit {
                    self.log.cancel(handle)?;
                }
                debug!(description, %error, "edit rejected");
                Err(error)
            }
        }
    }

    /// Settle (when enabled) and deliver queued events.
    fn after_commit(&mut self) -> Result<()> {
        let settled = if self.auto_settle {
            self.settle_inner().map(|_| ())
        } else {
            Ok(())
        };
        self.events.flush();
        settled
    }

    /// Open an explicit transaction. Edits made until it is committed form
    /// one undo step, and recomputation waits for the commit.
    pub fn begin_transaction(
        &mut self,
        description: impl Into<String>,
    ) -> Result<TransactionHandle> {
        self.ensure_open()?;
        self.log.begin(description)
    }

    /// Seal the open transaction, then settle.
    ///
    /// The transaction is committed even if settling fails; the error
    /// reports the recompute.
    pub fn commit(&mut self, handle: TransactionHandle) -> Result<()> {
        self.log.commit(handle)?;
        self.after_commit()
    }

    /// Discard the open transaction, rolling back its edits. Its queued
    /// events are dropped and runs in flight are abandoned.
    pub fn cancel(&mut self, handle: TransactionHandle) -> Result<()> {
        let transaction = self.log.cancel(handle)?;
        let primitives = transaction.into_primitives();
        self.rollback(&primitives);
        self.abandon_all_runs();
        self.events.clear_pending();
        Ok(())
    }

    /// Apply `primitives` in order without recording. On failure the ones
    /// already applied are rolled back and their events dropped.
    fn replay(&mut self, primitives: Vec<Primitive>) -> Result<()> {
        let event_mark = self.events.pending().len();
        let mut applied = Vec::with_capacity(primitives.len());
        for primitive in primitives {
            if let Err(error) = self.apply_raw(&primitive) {
                warn!(kind = primitive.kind(), %error, "replay step failed");
                self.rollback(&applied);
                self.events.truncate_pending(event_mark);
                return Err(error);
            }
            self.record_applied(primitive.clone(), Recording::Replay)?;
            applied.push(primitive);
        }
        Ok(())
    }

    /// Revert the most recent transaction and re-settle. Runs in flight are
    /// abandoned.
    #[instrument(skip(self), level = "debug")]
    pub fn undo(&mut self) -> Result<()> {
        self.ensure_idle()?;
        let transaction = self.log.pop_undo()?;
        let inverses = transaction
            .primitives()
            .iter()
            .rev()
            .map(Primitive::inverse)
            .collect();
        if let Err(error) = self.replay(inverses) {
            self.log.push_undo(transaction);
            return Err(error);
        }
        self.abandon_all_runs();
        info!(
            transaction = transaction.id(),
            description = transaction.description(),
            "undo"
        );
        self.log.push_redo(transaction);
        self.after_commit()
    }

    /// Re-apply the most recently undone transaction and re-settle.
    #[instrument(skip(self), level = "debug")]
    pub fn redo(&mut self) -> Result<()> {
        self.ensure_idle()?;
        let transaction = self.log.pop_redo()?;
        if let Err(error) = self.replay(transaction.primitives().to_vec()) {
            self.log.push_redo(transaction);
            return Err(error);
        }
        self.abandon_all_runs();
        info!(
            transaction = transaction.id(),
            description = transaction.description(),
            "redo"
        );
        self.log.push_undo(transaction);
        self.after_commit()
    }

    pub fn can_undo(&self) -> bool {
        self.log.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.log.can_redo()
    }

    pub fn undo_description(&self) -> Option<&str> {
        self.log.undo_description()
    }

    pub fn redo_description(&self) -> Option<&str> {
        self.log.redo_description()
    }

    /// Whether an explicit transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.log.is_open()
    }

    /// Fail unless the document is open with no transaction in progress.
    pub(crate) fn ensure_idle(&self) -> Result<()> {
        self.ensure_open()?;
        match self.log.open_transaction() {
            Some(open) => Err(DocumentError::TransactionInProgress(open.id())),
            None => Ok(()),
        }
    }
}
