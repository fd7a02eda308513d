//! Recompute Scheduler
//!
//! The scheduler collects invalidation seeds between settles and turns them
//! into an execution plan:
//!
//! 1. An edit seeds the item (or the computation) it touched.
//! 2. Planning walks everything downstream of the seeds.
//! 3. The reachable processors are sorted topologically, ties broken by
//!    ascending [`NodeRef`], so the same graph and the same edits always
//!    produce the same order.
//!
//! The plan is an upper bound. Whether a node really runs is decided at
//! execution time from its version vector, so a computation whose inputs
//! did not actually change is skipped and does not dirty its dependents.

use std::collections::BTreeSet;

use tracing::trace;

use super::dependency::DependencyGraph;
use super::node::NodeRef;
use crate::store::DataItemId;

/// Pending invalidations of one document.
#[derive(Debug, Default, Clone)]
pub struct RecomputeScheduler {
    seeds: BTreeSet<NodeRef>,
}

impl RecomputeScheduler {
    /// Create a scheduler with nothing pending.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that an item's content changed.
    pub fn invalidate_item(&mut self, item: DataItemId) {
        self.invalidate_node(NodeRef::Item(item));
    }

    /// Record that a node changed or must be reconsidered.
    pub fn invalidate_node(&mut self, node: NodeRef) {
        if self.seeds.insert(node) {
            trace!(%node, "seeded");
        }
    }

    /// Whether any seed is waiting to be planned.
    pub fn has_pending(&self) -> bool {
        !self.seeds.is_empty()
    }

    pub fn seeds(&self) -> &BTreeSet<NodeRef> {
        &self.seeds
    }

    /// Processors downstream of the seeds, dependencies first.
    pub fn plan(&self, graph: &DependencyGraph) -> Vec<NodeRef> {
        graph.affected_nodes(self.seeds.iter().copied())
    }

    /// Plan and clear the seeds.
    pub fn take_plan(&mut self, graph: &DependencyGraph) -> Vec<NodeRef> {
        let plan = self.plan(graph);
        self.seeds.clear();
        plan
    }

    /// Drop every pending seed.
    pub fn clear(&mut self) {
        self.seeds.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::computation::{Computation, ComputationId, InputBinding};
    use crate::value::Parameters;

    fn chain() -> DependencyGraph {
        // 1 -> c1 -> 2 -> c2 -> 3
        let mut graph = DependencyGraph::new();
        for (id, input, output) in [(1, 1, 2), (2, 2, 3)] {
            graph
                .add_computation(Computation::new(
                    ComputationId::from(id),
                    "op",
                    vec![InputBinding::whole(DataItemId::from(input))],
                    DataItemId::from(output),
                    Parameters::new(),
                ))
                .unwrap();
        }
        graph
    }

    #[test]
    fn plan_follows_dependencies() {
        let graph = chain();
        let mut scheduler = RecomputeScheduler::new();
        scheduler.invalidate_item(DataItemId::from(1));
        assert!(scheduler.has_pending());

        let plan = scheduler.take_plan(&graph);
        assert_eq!(
            plan,
            vec![
                NodeRef::Computation(ComputationId::from(1)),
                NodeRef::Computation(ComputationId::from(2)),
            ]
        );
        assert!(!scheduler.has_pending());
    }

    #[test]
    fn seeding_a_computation_includes_it() {
        let graph = chain();
        let mut scheduler = RecomputeScheduler::new();
        scheduler.invalidate_node(NodeRef::Computation(ComputationId::from(2)));
        assert_eq!(
            scheduler.plan(&graph),
            vec![NodeRef::Computation(ComputationId::from(2))]
        );
    }

    #[test]
    fn overlapping_seeds_are_planned_once() {
        let graph = chain();
        let mut scheduler = RecomputeScheduler::new();
        scheduler.invalidate_item(DataItemId::from(1));
        scheduler.invalidate_item(DataItemId::from(2));
        scheduler.invalidate_item(DataItemId::from(1));
        assert_eq!(scheduler.seeds().len(), 2);
        assert_eq!(scheduler.plan(&graph).len(), 2);
    }

    #[test]
    fn unknown_item_plans_nothing() {
        let graph = chain();
        let mut scheduler = RecomputeScheduler::new();
        scheduler.invalidate_item(DataItemId::from(77));
        assert!(scheduler.take_plan(&graph).is_empty());
    }
}
