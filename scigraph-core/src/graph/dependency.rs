//! Dependency Graph
//!
//! The graph owns every computation and connection of a document and keeps
//! the edges between them and the data items they read and write:
//!
//! - input binding: `Item -> Computation`
//! - output: `Computation -> Item` (each item has at most one producer)
//! - connection: `Item -> Connection -> Computation | Item`
//!
//! Every proposed edge is checked before it is committed: the graph must
//! stay acyclic. The check is a depth-first search from the edge's head
//! looking for its tail, so it only visits the part of the graph downstream
//! of the change.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::debug;

use super::computation::{Computation, ComputationId};
use super::connection::{Connection, ConnectionId, ConnectionTarget};
use super::node::{Node, NodeRef};
use crate::error::{DocumentError, Result};
use crate::store::DataItemId;

/// The document's dependency graph.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// All nodes in the graph, indexed by reference.
    nodes: HashMap<NodeRef, Node>,

    computations: BTreeMap<ComputationId, Computation>,

    connections: BTreeMap<ConnectionId, Connection>,

    /// Output item -> producing computation.
    producers: HashMap<DataItemId, ComputationId>,

    next_computation: u64,
    next_connection: u64,
}

impl DependencyGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn allocate_computation_id(&mut self) -> ComputationId {
        self.next_computation += 1;
        ComputationId::from(self.next_computation)
    }

    pub(crate) fn allocate_connection_id(&mut self) -> ConnectionId {
        self.next_connection += 1;
        ConnectionId::from(self.next_connection)
    }

    // ------------------------------------------------------------------
    // Computations
    // ------------------------------------------------------------------

    /// Check that `comp` could be added (or could replace the computation
    /// with the same id) without sharing an output or closing a cycle.
    pub fn check_computation(&self, comp: &Computation) -> Result<()> {
        let output = comp.output();
        if let Some(&producer) = self.producers.get(&output) {
            if producer != comp.id() {
                return Err(DocumentError::OutputAlreadyProduced {
                    item: output,
                    producer,
                });
            }
        }
        for input in comp.input_items() {
            if input == output || self.is_ancestor(NodeRef::Item(output), NodeRef::Item(input)) {
                return Err(DocumentError::CycleDetected(format!(
                    "{} reads {} which depends on its output {}",
                    comp.id(),
                    input,
                    output
                )));
            }
        }
        Ok(())
    }

    /// Add a computation and its edges.
    ///
    /// Fails with `CycleDetected` if any input is downstream of the output.
    pub fn add_computation(&mut self, comp: Computation) -> Result<()> {
        self.check_computation(&comp)?;
        let id = comp.id();
        let node = NodeRef::Computation(id);
        self.nodes.entry(node).or_insert_with(|| Node::new(node));
        for input in comp.input_items() {
            self.add_edge(NodeRef::Item(input), node);
        }
        self.add_edge(node, NodeRef::Item(comp.output()));
        self.producers.insert(comp.output(), id);
        self.next_computation = self.next_computation.max(id.raw());
        debug!(computation = %id, operation = comp.operation(), "computation added");
        self.computations.insert(id, comp);
        Ok(())
    }

    /// Replace a computation's definition, rewiring its input edges.
    ///
    /// Returns the previous definition.
    pub fn replace_computation(&mut self, comp: Computation) -> Result<Computation> {
        let id = comp.id();
        let previous = self
            .computations
            .get(&id)
            .ok_or(DocumentError::ComputationNotFound(id))?;
        self.check_computation(&comp)?;

        let node = NodeRef::Computation(id);
        let old_output = previous.output();
        let old_inputs: BTreeSet<_> = previous.input_items().collect();
        let new_inputs: BTreeSet<_> = comp.input_items().collect();
        for &gone in old_inputs.difference(&new_inputs) {
            self.remove_edge(NodeRef::Item(gone), node);
        }
        for &added in new_inputs.difference(&old_inputs) {
            self.add_edge(NodeRef::Item(added), node);
        }
        if old_output != comp.output() {
            self.remove_edge(node, NodeRef::Item(old_output));
            self.producers.remove(&old_output);
            self.add_edge(node, NodeRef::Item(comp.output()));
            self.producers.insert(comp.output(), id);
        }
        self.computations
            .insert(id, comp)
            .ok_or(DocumentError::ComputationNotFound(id))
    }

    /// Remove a computation and all its edges.
    ///
    /// Connections that target the computation must be removed first.
    pub fn remove_computation(&mut self, id: ComputationId) -> Result<Computation> {
        let comp = self
            .computations
            .remove(&id)
            .ok_or(DocumentError::ComputationNotFound(id))?;
        let node = NodeRef::Computation(id);
        if let Some(removed) = self.nodes.remove(&node) {
            for dep in removed.dependencies() {
                self.detach(*dep, node, true);
            }
            for dependent in removed.dependents() {
                self.detach(node, *dependent, false);
            }
        }
        self.producers.remove(&comp.output());
        debug!(computation = %id, "computation removed");
        Ok(comp)
    }

    pub fn computation(&self, id: ComputationId) -> Result<&Computation> {
        self.computations
            .get(&id)
            .ok_or(DocumentError::ComputationNotFound(id))
    }

    /// Iterate computations in identity order.
    pub fn computations(&self) -> impl Iterator<Item = &Computation> {
        self.computations.values()
    }

    pub fn computation_count(&self) -> usize {
        self.computations.len()
    }

    /// The computation writing `item`, if any.
    pub fn producer_of(&self, item: DataItemId) -> Option<ComputationId> {
        self.producers.get(&item).copied()
    }

    /// Computations that consume `item` directly.
    pub fn inputs_of(&self, item: DataItemId) -> BTreeSet<ComputationId> {
        self.nodes
            .get(&NodeRef::Item(item))
            .map(|node| {
                node.dependents()
                    .iter()
                    .filter_map(|d| match d {
                        NodeRef::Computation(id) => Some(*id),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Check that `conn` could be bound without closing a cycle.
    pub fn check_connection(&self, conn: &Connection) -> Result<()> {
        if let ConnectionTarget::Parameter { computation, .. } = conn.target() {
            self.computation(*computation)?;
        }
        let source = NodeRef::Item(conn.source());
        let target = conn.target().node();
        if target == source || self.is_ancestor(target, source) {
            return Err(DocumentError::CycleDetected(format!(
                "{} would feed {} back into its source {}",
                conn.id(),
                target,
                conn.source()
            )));
        }
        Ok(())
    }

    /// Bind a connection.
    pub fn add_connection(&mut self, conn: Connection) -> Result<()> {
        self.check_connection(&conn)?;
        let id = conn.id();
        let node = NodeRef::Connection(id);
        self.add_edge(NodeRef::Item(conn.source()), node);
        self.add_edge(node, conn.target().node());
        self.next_connection = self.next_connection.max(id.raw());
        self.connections.insert(id, conn);
        Ok(())
    }

    /// Unbind a connection.
    pub fn remove_connection(&mut self, id: ConnectionId) -> Result<Connection> {
        let conn = self
            .connections
            .remove(&id)
            .ok_or(DocumentError::ConnectionNotFound(id))?;
        let node = NodeRef::Connection(id);
        self.remove_edge(NodeRef::Item(conn.source()), node);
        self.remove_edge(node, conn.target().node());
        self.nodes.remove(&node);
        Ok(conn)
    }

    pub fn connection(&self, id: ConnectionId) -> Result<&Connection> {
        self.connections
            .get(&id)
            .ok_or(DocumentError::ConnectionNotFound(id))
    }

    /// Iterate connections in identity order.
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// Connections writing a parameter of `computation`.
    pub fn connections_into(&self, computation: ComputationId) -> Vec<ConnectionId> {
        self.connections
            .values()
            .filter(|c| c.target().node() == NodeRef::Computation(computation))
            .map(Connection::id)
            .collect()
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Every computation and connection that reads or writes `item`.
    pub fn references_to(&self, item: DataItemId) -> Vec<NodeRef> {
        let Some(node) = self.nodes.get(&NodeRef::Item(item)) else {
            return Vec::new();
        };
        node.dependencies()
            .iter()
            .chain(node.dependents())
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Whether there is a path of one or more edges from `a` to `b`.
    pub fn is_ancestor(&self, a: NodeRef, b: NodeRef) -> bool {
        let mut visited = BTreeSet::new();
        let mut stack: Vec<NodeRef> = match self.nodes.get(&a) {
            Some(node) => node.dependents().iter().copied().collect(),
            None => return false,
        };
        while let Some(current) = stack.pop() {
            if current == b {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                stack.extend(node.dependents().iter().copied());
            }
        }
        false
    }

    /// Computations affected by a change to `item`, in recomputation order.
    pub fn affected_by(&self, item: DataItemId) -> Vec<ComputationId> {
        self.affected_nodes([NodeRef::Item(item)])
            .into_iter()
            .filter_map(|n| match n {
                NodeRef::Computation(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Processors reachable from `seeds` (seeds included), in topological
    /// order. Ties are broken by ascending [`NodeRef`].
    pub fn affected_nodes(&self, seeds: impl IntoIterator<Item = NodeRef>) -> Vec<NodeRef> {
        let mut reachable = BTreeSet::new();
        let mut stack: Vec<NodeRef> = seeds
            .into_iter()
            .filter(|s| self.nodes.contains_key(s))
            .collect();
        while let Some(current) = stack.pop() {
            if reachable.insert(current) {
                if let Some(node) = self.nodes.get(&current) {
                    stack.extend(node.dependents().iter().copied());
                }
            }
        }

        self.topological_sort(&reachable)
            .into_iter()
            .filter(NodeRef::is_processor)
            .collect()
    }

    /// Processors one item away upstream of `node` (or directly upstream).
    pub fn upstream_processors(&self, node: NodeRef) -> BTreeSet<NodeRef> {
        let mut upstream = BTreeSet::new();
        let Some(n) = self.nodes.get(&node) else {
            return upstream;
        };
        for dep in n.dependencies() {
            if dep.is_processor() {
                upstream.insert(*dep);
            } else if let Some(item) = self.nodes.get(dep) {
                upstream.extend(item.dependencies().iter().copied());
            }
        }
        upstream
    }

    /// Get a node.
    pub fn node(&self, node: NodeRef) -> Option<&Node> {
        self.nodes.get(&node)
    }

    /// Get the total number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Kahn's algorithm restricted to `subset`, smallest ready node first.
    fn topological_sort(&self, subset: &BTreeSet<NodeRef>) -> Vec<NodeRef> {
        let mut in_degree: HashMap<NodeRef, usize> = HashMap::with_capacity(subset.len());
        let mut ready = BTreeSet::new();
        let mut result = Vec::with_capacity(subset.len());

        // in-degrees only count edges inside the subset
        for &node_ref in subset {
            let degree = self.nodes.get(&node_ref).map_or(0, |node| {
                node.dependencies()
                    .iter()
                    .filter(|d| subset.contains(d))
                    .count()
            });
            in_degree.insert(node_ref, degree);
            if degree == 0 {
                ready.insert(node_ref);
            }
        }

        while let Some(node_ref) = ready.pop_first() {
            result.push(node_ref);
            if let Some(node) = self.nodes.get(&node_ref) {
                for dependent in node.dependents() {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            ready.insert(*dependent);
                        }
                    }
                }
            }
        }

        result
    }

    // ------------------------------------------------------------------
    // Edges
    // ------------------------------------------------------------------

    fn add_edge(&mut self, from: NodeRef, to: NodeRef) {
        self.nodes
            .entry(from)
            .or_insert_with(|| Node::new(from))
            .add_dependent(to);
        self.nodes
            .entry(to)
            .or_insert_with(|| Node::new(to))
            .add_dependency(from);
    }

    fn remove_edge(&mut self, from: NodeRef, to: NodeRef) {
        self.detach(from, to, true);
        self.detach(from, to, false);
    }

    /// Remove one half of an edge and prune item nodes left without edges.
    fn detach(&mut self, from: NodeRef, to: NodeRef, on_source: bool) {
        let key = if on_source { from } else { to };
        let Some(node) = self.nodes.get_mut(&key) else {
            return;
        };
        if on_source {
            node.remove_dependent(to);
        } else {
            node.remove_dependency(from);
        }
        if !key.is_processor() && node.is_isolated() {
            self.nodes.remove(&key);
        }
    }
}
