#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

mod common;

use common::{CONFIGURATION, ImmediateDispatcher, cycle, graph, graph_with_offset, value};
use fge::{
    config::JobSizing,
    factory::MultipleNodeExecutorFactory,
    graph::{ComputationTarget, ComputationTargetType, DependencyGraph, DependencyNode},
    plan::ExecutionPlan,
    types::{HashMap, NodeId},
};
use std::sync::Arc;

const DIAMOND: &[&[u32]] = &[&[], &[1], &[1], &[2, 3]];

fn per_node() -> MultipleNodeExecutorFactory {
    MultipleNodeExecutorFactory::new(JobSizing {
        maximum_job_items: 1,
        maximum_concurrency: 0,
        ..JobSizing::default()
    })
    .unwrap()
}

/// Chain 1 -> 2 -> 3 requesting the outputs of `terminals`.
fn chain_requesting(terminals: &[u32]) -> DependencyGraph {
    let target = ComputationTarget::new(ComputationTargetType::Primitive, "P");
    let mut builder = DependencyGraph::builder(CONFIGURATION);
    for id in 1..=3 {
        builder.add_node(
            DependencyNode::new(NodeId(id), format!("f{id}"), target.clone())
                .with_inputs((id > 1).then_some(NodeId(id - 1)))
                .with_outputs([value(id)]),
        );
    }
    for &id in terminals {
        builder.add_terminal_output(value(id));
    }
    builder.build()
}

/// Dispatch order of running `plan` on `graph` with synchronous completion.
fn dispatch_order(plan: &ExecutionPlan, graph: DependencyGraph) -> Vec<Vec<NodeId>> {
    let dispatcher = ImmediateDispatcher::new();
    plan.run(Arc::new(graph), &cycle(dispatcher.clone()), None)
        .wait()
        .unwrap();
    dispatcher.order.lock().clone()
}

#[test]
fn rebound_plan_matches_a_fresh_partition() {
    let factory = per_node();
    let first = factory.plan(&graph(DIAMOND)).unwrap();
    assert_eq!(factory.cached_plan_count(), 1);

    let shifted = graph_with_offset(DIAMOND, 100);
    let rebound = factory.plan(&shifted).unwrap();
    assert_eq!(factory.cached_plan_count(), 1);
    assert_ne!(rebound, first);

    let fresh = per_node().plan(&shifted).unwrap();
    assert_eq!(rebound, fresh);
    assert_eq!(rebound.fragment_count(), 4);
    assert_eq!(rebound.node_count(), 4);
    assert_eq!(
        dispatch_order(&rebound, graph_with_offset(DIAMOND, 100)),
        dispatch_order(&fresh, graph_with_offset(DIAMOND, 100)),
    );
}

#[test]
fn structural_mapping_pairs_equivalent_nodes() {
    let mapping = graph(DIAMOND)
        .structural_mapping(&graph_with_offset(DIAMOND, 100))
        .unwrap();
    assert_eq!(mapping.len(), 4);
    for id in 1..=4 {
        assert_eq!(mapping[&NodeId(id)], NodeId(100 + id));
    }
}

#[test]
fn unmapped_fragments_are_dropped() {
    let plan = per_node().plan(&graph(&[&[], &[1], &[2]])).unwrap();
    let ExecutionPlan::Multiple(multiple) = &plan else {
        panic!("expected a multi-fragment plan, got {plan:?}");
    };
    let (&last, _) = multiple
        .fragments()
        .iter()
        .find(|(_, descriptor)| descriptor.nodes() == [NodeId(3)])
        .unwrap();

    let mapping: HashMap<NodeId, NodeId> = [(NodeId(1), NodeId(11)), (NodeId(2), NodeId(12))]
        .into_iter()
        .collect();
    let rebound = plan.with_nodes(&mapping);
    assert_eq!(rebound.fragment_count(), 2);
    assert_eq!(rebound.node_count(), 2);

    let ExecutionPlan::Multiple(rebound) = rebound else {
        panic!("rebinding changed the plan kind");
    };
    assert!(!rebound.fragments().contains_key(&last));
    for descriptor in rebound.fragments().values() {
        assert!(!descriptor.inputs().contains(&last));
        assert!(!descriptor.outputs().contains(&last));
        assert!(!descriptor.tail().contains(&last));
        assert!(
            descriptor
                .nodes()
                .iter()
                .all(|node| [NodeId(11), NodeId(12)].contains(node))
        );
    }
}

#[test]
fn unmapped_single_plan_becomes_empty() {
    let plan = ExecutionPlan::single(&graph(&[&[], &[1]])).unwrap();
    assert_eq!(plan.fragment_count(), 1);
    let rebound = plan.with_nodes(&HashMap::default());
    assert_eq!(rebound.fragment_count(), 0);
    assert_eq!(rebound.node_count(), 0);
}

#[test]
fn small_graphs_get_a_single_plan() {
    let factory = MultipleNodeExecutorFactory::new(JobSizing {
        minimum_job_items: 4,
        maximum_job_items: 1,
        ..JobSizing::default()
    });
    assert!(factory.is_err());

    let factory = MultipleNodeExecutorFactory::new(JobSizing {
        minimum_job_items: 4,
        ..JobSizing::default()
    })
    .unwrap();
    let plan = factory.plan(&graph(DIAMOND)).unwrap();
    assert!(matches!(plan, ExecutionPlan::Single(_)));
    assert_eq!(factory.cached_plan_count(), 0);
}

#[test]
fn requesting_more_outputs_does_not_reuse_the_plan() {
    let factory = MultipleNodeExecutorFactory::default();
    let narrow = factory.plan(&chain_requesting(&[3])).unwrap();
    let wide = factory.plan(&chain_requesting(&[2, 3])).unwrap();
    assert_eq!(factory.cached_plan_count(), 2);
    let fresh = MultipleNodeExecutorFactory::default()
        .plan(&chain_requesting(&[2, 3]))
        .unwrap();
    assert_eq!(wide, fresh);

    let hint_of = |plan: &ExecutionPlan| {
        let ExecutionPlan::Multiple(multiple) = plan else {
            panic!("expected a multi-fragment plan, got {plan:?}");
        };
        // The whole chain collapses into one fragment.
        assert_eq!(multiple.fragments().len(), 1);
        multiple.fragments().values().next().unwrap().cache_hint().clone()
    };
    assert!(hint_of(&narrow).is_private(&value(2)));
    assert!(!hint_of(&wide).is_private(&value(2)));
    assert!(!hint_of(&wide).is_private(&value(3)));
}
