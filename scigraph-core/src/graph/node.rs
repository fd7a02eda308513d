//! Graph Nodes
//!
//! This module defines the node types that live in the dependency graph.
//! Data items, computations and connections all appear as nodes; edges
//! always point from producer to consumer.

use std::collections::BTreeSet;
use std::fmt;

use super::computation::ComputationId;
use super::connection::ConnectionId;
use crate::store::DataItemId;

/// Reference to a node in the dependency graph.
///
/// The derived ordering (items, then computations, then connections, each
/// by ascending id) is the tie-break used for deterministic scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeRef {
    /// A data item. Items only relay changes; they are never executed.
    Item(DataItemId),

    /// A computation. Consumes items, produces exactly one item.
    Computation(ComputationId),

    /// A connection. Copies one value from a source item to a target.
    Connection(ConnectionId),
}

impl NodeRef {
    /// Whether the scheduler executes this node.
    pub fn is_processor(&self) -> bool {
        !matches!(self, Self::Item(_))
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Item(id) => id.fmt(f),
            Self::Computation(id) => id.fmt(f),
            Self::Connection(id) => id.fmt(f),
        }
    }
}

/// A node in the dependency graph.
#[derive(Debug, Clone)]
pub struct Node {
    /// Which item, computation or connection this node stands for.
    id: NodeRef,

    /// Nodes this node reads from (parents in the DAG).
    dependencies: BTreeSet<NodeRef>,

    /// Nodes that read from this node (children in the DAG).
    dependents: BTreeSet<NodeRef>,
}

impl Node {
    /// Create a node with no edges.
    pub fn new(id: NodeRef) -> Self {
        Self {
            id,
            dependencies: BTreeSet::new(),
            dependents: BTreeSet::new(),
        }
    }

    /// Get the node's reference.
    pub fn id(&self) -> NodeRef {
        self.id
    }

    /// Add a dependency (a node that this node reads from).
    pub fn add_dependency(&mut self, node: NodeRef) {
        self.dependencies.insert(node);
    }

    /// Remove a dependency.
    pub fn remove_dependency(&mut self, node: NodeRef) {
        self.dependencies.remove(&node);
    }

    /// Get all dependencies.
    pub fn dependencies(&self) -> &BTreeSet<NodeRef> {
        &self.dependencies
    }

    /// Add a dependent (a node that reads from this node).
    pub fn add_dependent(&mut self, node: NodeRef) {
        self.dependents.insert(node);
    }

    /// Remove a dependent.
    pub fn remove_dependent(&mut self, node: NodeRef) {
        self.dependents.remove(&node);
    }

    /// Get all dependents.
    pub fn dependents(&self) -> &BTreeSet<NodeRef> {
        &self.dependents
    }

    /// Whether the node has no edges at all.
    pub fn is_isolated(&self) -> bool {
        self.dependencies.is_empty() && self.dependents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_nodes_are_not_processors() {
        assert!(!NodeRef::Item(DataItemId::from(1)).is_processor());
        assert!(NodeRef::Computation(ComputationId::from(1)).is_processor());
        assert!(NodeRef::Connection(ConnectionId::from(1)).is_processor());
    }

    #[test]
    fn ordering_breaks_ties_by_kind_then_id() {
        let mut refs = vec![
            NodeRef::Computation(ComputationId::from(2)),
            NodeRef::Connection(ConnectionId::from(1)),
            NodeRef::Computation(ComputationId::from(1)),
            NodeRef::Item(DataItemId::from(9)),
        ];
        refs.sort();
        assert_eq!(
            refs,
            vec![
                NodeRef::Item(DataItemId::from(9)),
                NodeRef::Computation(ComputationId::from(1)),
                NodeRef::Computation(ComputationId::from(2)),
                NodeRef::Connection(ConnectionId::from(1)),
            ]
        );
    }

    #[test]
    fn dependency_management() {
        let mut node = Node::new(NodeRef::Computation(ComputationId::from(1)));
        let dep1 = NodeRef::Item(DataItemId::from(1));
        let dep2 = NodeRef::Item(DataItemId::from(2));

        node.add_dependency(dep1);
        node.add_dependency(dep2);
        node.add_dependency(dep2);
        assert_eq!(node.dependencies().len(), 2);

        node.remove_dependency(dep1);
        assert!(!node.dependencies().contains(&dep1));
        assert!(!node.is_isolated());

        node.remove_dependency(dep2);
        assert!(node.is_isolated());
    }
}
