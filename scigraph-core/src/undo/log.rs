//! Undo/Redo Transaction Log
//!
//! At most one transaction is open at a time. Committing seals it onto the
//! undo stack and invalidates the redo stack. Undo and redo move sealed
//! transactions between the two stacks; the document applies them.

use std::collections::VecDeque;

use tracing::debug;

use super::primitive::Primitive;
use crate::error::{DocumentError, Result};

/// Proof that a transaction was opened. Required to commit or cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionHandle(u64);

impl TransactionHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// An ordered group of primitives forming one undoable step.
#[derive(Debug, Clone)]
pub struct Transaction {
    id: u64,
    description: String,
    primitives: Vec<Primitive>,
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Primitives in application order.
    pub fn primitives(&self) -> &[Primitive] {
        &self.primitives
    }

    pub fn len(&self) -> usize {
        self.primitives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primitives.is_empty()
    }

    pub(crate) fn push(&mut self, primitive: Primitive) {
        self.primitives.push(primitive);
    }

    pub(crate) fn into_primitives(self) -> Vec<Primitive> {
        self.primitives
    }
}

/// Undo and redo stacks plus the open transaction.
#[derive(Debug, Default)]
pub struct TransactionLog {
    open: Option<Transaction>,
    undo: VecDeque<Transaction>,
    redo: Vec<Transaction>,
    next_id: u64,
    limit: Option<usize>,
}

impl TransactionLog {
    /// Create a log keeping at most `limit` undo entries.
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    /// Open a transaction.
    pub fn begin(&mut self, description: impl Into<String>) -> Result<TransactionHandle> {
        if let Some(open) = &self.open {
            return Err(DocumentError::TransactionInProgress(open.id));
        }
        self.next_id += 1;
        self.open = Some(Transaction {
            id: self.next_id,
            description: description.into(),
            primitives: Vec::new(),
        });
        Ok(TransactionHandle(self.next_id))
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// The open transaction, if any.
    pub fn open_transaction(&self) -> Option<&Transaction> {
        self.open.as_ref()
    }

    /// Number of primitives in the open transaction.
    pub(crate) fn open_len(&self) -> usize {
        self.open.as_ref().map_or(0, Transaction::len)
    }

    /// Remove and return the open transaction's primitives past `len`.
    pub(crate) fn truncate_open(&mut self, len: usize) -> Vec<Primitive> {
        match self.open.as_mut() {
            Some(open) if open.primitives.len() > len => open.primitives.split_off(len),
            _ => Vec::new(),
        }
    }

    /// Append to the open transaction.
    pub fn record(&mut self, primitive: Primitive) -> Result<()> {
        let open = self.open.as_mut().ok_or(DocumentError::NoOpenTransaction)?;
        open.push(primitive);
        Ok(())
    }

    /// Record a write made by recomputation.
    ///
    /// Goes into the open transaction if there is one, else onto the entry
    /// that produced the current state. A document with no history yet does
    /// not record it.
    pub fn record_derived(&mut self, primitive: Primitive) {
        if let Some(open) = self.open.as_mut() {
            open.push(primitive);
        } else if let Some(top) = self.undo.back_mut() {
            top.push(primitive);
        }
    }

    /// Seal the open transaction.
    ///
    /// An empty transaction is dropped without touching either stack.
    pub fn commit(&mut self, handle: TransactionHandle) -> Result<()> {
        let transaction = self.take_open(handle)?;
        if transaction.is_empty() {
            return Ok(());
        }
        debug!(
            transaction = transaction.id,
            description = %transaction.description,
            primitives = transaction.len(),
            "transaction committed"
        );
        self.redo.clear();
        self.push_undo(transaction);
        Ok(())
    }

    /// Close the open transaction without sealing it and hand it back so
    /// its primitives can be rolled back.
    pub fn cancel(&mut self, handle: TransactionHandle) -> Result<Transaction> {
        let transaction = self.take_open(handle)?;
        debug!(transaction = transaction.id, "transaction cancelled");
        Ok(transaction)
    }

    fn take_open(&mut self, handle: TransactionHandle) -> Result<Transaction> {
        match &self.open {
            None => Err(DocumentError::NoOpenTransaction),
            Some(open) if open.id != handle.0 => {
                Err(DocumentError::StaleTransactionHandle(handle.0))
            }
            Some(_) => self.open.take().ok_or(DocumentError::NoOpenTransaction),
        }
    }

    pub fn pop_undo(&mut self) -> Result<Transaction> {
        self.undo.pop_back().ok_or(DocumentError::EmptyUndoStack)
    }

    pub fn pop_redo(&mut self) -> Result<Transaction> {
        self.redo.pop().ok_or(DocumentError::EmptyRedoStack)
    }

    pub fn push_redo(&mut self, transaction: Transaction) {
        self.redo.push(transaction);
    }

    /// Push onto the undo stack, dropping the oldest entries over the limit.
    /// The redo stack is left alone.
    pub fn push_undo(&mut self, transaction: Transaction) {
        self.undo.push_back(transaction);
        if let Some(limit) = self.limit {
            while self.undo.len() > limit {
                if let Some(dropped) = self.undo.pop_front() {
                    debug!(transaction = dropped.id, "undo entry dropped");
                }
            }
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_description(&self) -> Option<&str> {
        self.undo.back().map(Transaction::description)
    }

    pub fn redo_description(&self) -> Option<&str> {
        self.redo.last().map(Transaction::description)
    }

    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }

    /// Forget all history. The open transaction, if any, is kept.
    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }
}
