use std::collections::HashSet;

use dagwave::dag::topology::topological_sort;
use dagwave::dag::{Graph, Node, TopologyError};
use proptest::prelude::*;

/// Random DAG: node `i` may depend on any `j < i`.
fn arb_dag() -> impl Strategy<Value = Graph> {
    (1usize..25)
        .prop_flat_map(|n| {
            let deps = (0..n)
                .map(|i| proptest::collection::vec(0..i.max(1), 0..=i.min(4)))
                .collect::<Vec<_>>();
            (Just(n), deps)
        })
        .prop_map(|(n, deps)| {
            let mut builder = Graph::builder("prop");
            for (i, dep_idx) in deps.into_iter().enumerate().take(n) {
                let mut node = Node::new(format!("n{i}"));
                for j in dep_idx {
                    if j < i {
                        node = node.depends_on(format!("n{j}"));
                    }
                }
                builder.add_node(node);
            }
            builder.build().expect("generated ids are unique")
        })
}

/// A ring of `k` nodes plus a few acyclic hangers-on.
fn arb_cyclic() -> impl Strategy<Value = Graph> {
    (2usize..8, 0usize..5).prop_map(|(k, extra)| {
        let mut builder = Graph::builder("ring");
        for i in 0..k {
            builder.add_node(Node::new(format!("r{i}")).depends_on(format!("r{}", (i + 1) % k)));
        }
        for e in 0..extra {
            builder.add_node(Node::new(format!("x{e}")).depends_on(format!("r{}", e % k)));
        }
        builder.build().expect("generated ids are unique")
    })
}

proptest! {
    #[test]
    fn waves_partition_nodes_and_respect_dependencies(graph in arb_dag()) {
        let order = topological_sort(&graph).expect("generated graph is acyclic");

        let mut seen = HashSet::new();
        for wave in &order.waves {
            for id in &wave.node_ids {
                prop_assert!(seen.insert(id.clone()), "node {} placed twice", id);
            }
        }
        prop_assert_eq!(seen.len(), graph.len());

        let wave_of = order.wave_of();
        for node in graph.nodes() {
            for dep in &node.dependencies {
                prop_assert!(wave_of[dep.as_str()] < wave_of[node.id.as_str()]);
            }
        }
    }

    #[test]
    fn reported_cycles_are_real(graph in arb_cyclic()) {
        match topological_sort(&graph) {
            Err(TopologyError::Cycle(cycle)) => {
                prop_assert!(cycle.len() >= 2);
                prop_assert_eq!(cycle.first(), cycle.last());
                for pair in cycle.windows(2) {
                    prop_assert!(graph.dependencies_of(&pair[0]).contains(&pair[1]));
                }
            }
            other => prop_assert!(false, "expected a cycle, got {:?}", other),
        }
    }
}
