//! Change notifications.
//!
//! The document queues one [`DocumentEvent`] per applied primitive and
//! delivers the queue once the enclosing transaction is sealed, so a
//! listener never observes a half-applied edit. Events of one transaction
//! arrive in the order their primitives were applied.
//!
//! Listeners run synchronously while the document is borrowed; they cannot
//! call back into it.

use std::fmt;

use indexmap::IndexMap;
use tracing::trace;

use crate::error::ComputationError;
use crate::graph::{ComputationId, ConnectionId};
use crate::store::DataItemId;

/// A typed change notification.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentEvent {
    DataItemCreated(DataItemId),
    DataItemModified(DataItemId),
    DataItemDeleted(DataItemId),
    ComputationCreated(ComputationId),
    /// Inputs or parameters changed; the output is stale until the next run.
    ComputationDirtied(ComputationId),
    ComputationCompleted(ComputationId),
    ComputationErrored {
        computation: ComputationId,
        error: ComputationError,
    },
    ComputationDeleted(ComputationId),
    ConnectionBound(ConnectionId),
    ConnectionUnbound(ConnectionId),
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type Listener = Box<dyn Fn(&DocumentEvent) + Send + Sync>;

/// Listener registry plus the queue of undelivered events.
#[derive(Default)]
pub struct EventBus {
    listeners: IndexMap<ListenerId, Listener>,
    pending: Vec<DocumentEvent>,
    next_id: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Listeners are called in registration order.
    pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
    where
        F: Fn(&DocumentEvent) + Send + Sync + 'static,
    {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners.insert(id, Box::new(listener));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.listeners.shift_remove(&id).is_some()
    }

    pub fn queue(&mut self, event: DocumentEvent) {
        self.pending.push(event);
    }

    /// Events queued but not yet delivered.
    pub fn pending(&self) -> &[DocumentEvent] {
        &self.pending
    }

    /// Drop queued events without delivering them.
    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    /// Drop queued events past the first `len`.
    pub(crate) fn truncate_pending(&mut self, len: usize) {
        self.pending.truncate(len);
    }

    /// Deliver and clear the queue. Returns the number of events delivered.
    pub fn flush(&mut self) -> usize {
        let events = std::mem::take(&mut self.pending);
        for event in &events {
            for listener in self.listeners.values() {
                listener(event);
            }
        }
        if !events.is_empty() {
            trace!(events = events.len(), listeners = self.listeners.len(), "events delivered");
        }
        events.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.len())
            .field("pending", &self.pending)
            .finish()
    }
}
