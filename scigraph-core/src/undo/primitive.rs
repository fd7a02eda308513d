//! Primitive mutation records.
//!
//! Every change to the document is one of these. Records carry absolute
//! snapshots rather than deltas, so applying a record or its inverse always
//! lands on exactly the recorded state, modification counters included.

use crate::error::ComputationError;
use crate::events::DocumentEvent;
use crate::graph::{Computation, ComputationState, Connection};
use crate::store::DataItem;

/// One reversible change.
#[derive(Debug, Clone)]
pub enum Primitive {
    InsertItem(DataItem),
    RemoveItem(DataItem),
    ModifyItem { before: DataItem, after: DataItem },
    InsertComputation(Computation),
    RemoveComputation(Computation),
    ModifyComputation { before: Computation, after: Computation },
    BindConnection(Connection),
    UnbindConnection(Connection),
}

impl Primitive {
    /// The record that undoes this one.
    #[must_use]
    pub fn inverse(&self) -> Self {
        match self {
            Self::InsertItem(item) => Self::RemoveItem(item.clone()),
            Self::RemoveItem(item) => Self::InsertItem(item.clone()),
            Self::ModifyItem { before, after } => Self::ModifyItem {
                before: after.clone(),
                after: before.clone(),
            },
            Self::InsertComputation(comp) => Self::RemoveComputation(comp.clone()),
            Self::RemoveComputation(comp) => Self::InsertComputation(comp.clone()),
            Self::ModifyComputation { before, after } => Self::ModifyComputation {
                before: after.clone(),
                after: before.clone(),
            },
            Self::BindConnection(conn) => Self::UnbindConnection(conn.clone()),
            Self::UnbindConnection(conn) => Self::BindConnection(conn.clone()),
        }
    }

    /// The notification emitted when this record is applied.
    pub fn event(&self) -> DocumentEvent {
        match self {
            Self::InsertItem(item) => DocumentEvent::DataItemCreated(item.id()),
            Self::RemoveItem(item) => DocumentEvent::DataItemDeleted(item.id()),
            Self::ModifyItem { after, .. } => DocumentEvent::DataItemModified(after.id()),
            Self::InsertComputation(comp) => DocumentEvent::ComputationCreated(comp.id()),
            Self::RemoveComputation(comp) => DocumentEvent::ComputationDeleted(comp.id()),
            Self::ModifyComputation { after, .. } => match after.state() {
                ComputationState::Clean => DocumentEvent::ComputationCompleted(after.id()),
                ComputationState::Errored => DocumentEvent::ComputationErrored {
                    computation: after.id(),
                    error: after
                        .last_error()
                        .cloned()
                        .unwrap_or_else(|| ComputationError::failed("unknown error")),
                },
                ComputationState::Dirty | ComputationState::Running => {
                    DocumentEvent::ComputationDirtied(after.id())
                }
            },
            Self::BindConnection(conn) => DocumentEvent::ConnectionBound(conn.id()),
            Self::UnbindConnection(conn) => DocumentEvent::ConnectionUnbound(conn.id()),
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InsertItem(_) => "insert_item",
            Self::RemoveItem(_) => "remove_item",
            Self::ModifyItem { .. } => "modify_item",
            Self::InsertComputation(_) => "insert_computation",
            Self::RemoveComputation(_) => "remove_computation",
            Self::ModifyComputation { .. } => "modify_computation",
            Self::BindConnection(_) => "bind_connection",
            Self::UnbindConnection(_) => "unbind_connection",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ComputationId, InputBinding, VersionVector};
    use crate::store::DataItemId;
    use crate::value::Parameters;

    fn comp() -> Computation {
        Computation::new(
            ComputationId::from(4),
            "op",
            vec![InputBinding::whole(DataItemId::from(1))],
            DataItemId::from(2),
            Parameters::new(),
        )
    }

    #[test]
    fn inverse_swaps_direction() {
        let c = comp();
        let mut after = c.clone();
        after.mark_clean(VersionVector::default());
        let modify = Primitive::ModifyComputation {
            before: c.clone(),
            after: after.clone(),
        };
        match modify.inverse() {
            Primitive::ModifyComputation { before, after: a } => {
                assert_eq!(before, after);
                assert_eq!(a, c);
            }
            other => panic!("unexpected inverse {other:?}"),
        }
        assert!(matches!(
            Primitive::InsertComputation(c).inverse(),
            Primitive::RemoveComputation(_)
        ));
    }

    #[test]
    fn computation_events_follow_new_state() {
        let before = comp();
        let mut clean = before.clone();
        clean.mark_clean(VersionVector::default());
        let mut errored = before.clone();
        errored.mark_errored(VersionVector::default(), ComputationError::failed("nan"));

        let completed = Primitive::ModifyComputation {
            before: before.clone(),
            after: clean.clone(),
        };
        assert_eq!(
            completed.event(),
            DocumentEvent::ComputationCompleted(ComputationId::from(4))
        );
        assert_eq!(
            completed.inverse().event(),
            DocumentEvent::ComputationDirtied(ComputationId::from(4))
        );

        let failed = Primitive::ModifyComputation {
            before,
            after: errored,
        };
        assert_eq!(
            failed.event(),
            DocumentEvent::ComputationErrored {
                computation: ComputationId::from(4),
                error: ComputationError::failed("nan"),
            }
        );
    }
}
