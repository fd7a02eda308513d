//! Property tests for the dependency graph.

use std::collections::{BTreeMap, BTreeSet};

use proptest::prelude::*;

use scigraph_core::graph::{Computation, DependencyGraph};
use scigraph_core::{ComputationId, DataItemId, DocumentError, InputBinding, Parameters};

const ITEMS: u64 = 8;

/// Item-level reachability over the accepted computations, kept outside the graph.
#[derive(Default)]
struct Model {
    edges: BTreeMap<u64, BTreeSet<u64>>,
    produced: BTreeSet<u64>,
}

impl Model {
    fn reaches(&self, from: u64, to: u64) -> bool {
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if seen.insert(current) {
                if let Some(next) = self.edges.get(&current) {
                    stack.extend(next.iter().copied());
                }
            }
        }
        false
    }
}

fn computation(id: u64, inputs: &[u64], output: u64) -> Computation {
    Computation::new(
        ComputationId::from(id),
        "op",
        inputs
            .iter()
            .map(|&i| InputBinding::whole(DataItemId::from(i)))
            .collect(),
        DataItemId::from(output),
        Parameters::new(),
    )
}

proptest! {
    #[test]
    fn prop_graph_rejects_exactly_the_cycles(
        specs in proptest::collection::vec(
            (proptest::collection::vec(0..ITEMS, 1..3), 0..ITEMS),
            0..40,
        )
    ) {
        let mut graph = DependencyGraph::new();
        let mut model = Model::default();

        for (n, (inputs, output)) in specs.into_iter().enumerate() {
            let comp = computation(n as u64 + 1, &inputs, output);
            let shared = model.produced.contains(&output);
            let cyclic = inputs.iter().any(|&i| model.reaches(output, i));

            match graph.add_computation(comp) {
                Ok(()) => {
                    prop_assert!(!shared && !cyclic);
                    model.produced.insert(output);
                    for i in inputs {
                        model.edges.entry(i).or_default().insert(output);
                    }
                }
                Err(DocumentError::OutputAlreadyProduced { .. }) => prop_assert!(shared),
                Err(DocumentError::CycleDetected(_)) => prop_assert!(!shared && cyclic),
                Err(other) => prop_assert!(false, "unexpected error {other}"),
            }
        }
    }

    #[test]
    fn prop_affected_order_is_topological(
        specs in proptest::collection::vec(
            (proptest::collection::vec(0..ITEMS, 1..3), 0..ITEMS),
            0..40,
        )
    ) {
        let mut graph = DependencyGraph::new();
        for (n, (inputs, output)) in specs.into_iter().enumerate() {
            let _ = graph.add_computation(computation(n as u64 + 1, &inputs, output));
        }

        for item in 0..ITEMS {
            let order = graph.affected_by(DataItemId::from(item));
            let position: BTreeMap<ComputationId, usize> =
                order.iter().enumerate().map(|(i, &c)| (c, i)).collect();
            prop_assert_eq!(position.len(), order.len());

            for &id in &order {
                let comp = graph.computation(id).unwrap();
                for input in comp.input_items() {
                    if let Some(producer) = graph.producer_of(input) {
                        if let Some(&before) = position.get(&producer) {
                            prop_assert!(before < position[&id]);
                        }
                    }
                }
            }
        }
    }
}

#[test]
fn removing_a_computation_reopens_the_edge() {
    let mut graph = DependencyGraph::new();
    graph.add_computation(computation(1, &[0], 1)).unwrap();
    assert!(graph.add_computation(computation(2, &[1], 0)).is_err());

    graph.remove_computation(ComputationId::from(1)).unwrap();
    graph.add_computation(computation(2, &[1], 0)).unwrap();
    assert_eq!(graph.producer_of(DataItemId::from(0)), Some(ComputationId::from(2)));
}
