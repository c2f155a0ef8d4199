//! Partitions a dependency graph into fragments, the units dispatched to a
//! compute node as one job.
//!
//! Partitioning starts from one fragment per node and then:
//! - collapses chains: a fragment whose only output has it as its only input
//!   absorbs that output, within the job-size maxima;
//! - merges undersized siblings that share exactly the same inputs;
//! - chains tails: an output whose only input is this fragment is sent along
//!   with it to the same compute node, at most `maximum_concurrency` of them;
//! - derives each fragment's cache-selection hint.
//!
//! Every fragment without outputs feeds the synthetic terminal root
//! [`FragmentId::ROOT`].

use crate::{
    config::JobSizing,
    error::GraphError,
    graph::{DependencyGraph, DependencyNode},
    job::CacheSelectHint,
    types::{HashMap, IndexMap, IndexSet, NodeId},
};
use core::mem;
use derive_more::Debug;
use rustc_hash::FxBuildHasher;
use std::sync::Arc;

pub use crate::types::FragmentId;

/// Estimated cost, in nanoseconds, of invoking a node.
pub trait NodeCostEstimator: Send + Sync {
    fn estimate(&self, node: &DependencyNode) -> u64;
}

/// Every node costs the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformCost(pub u64);

impl Default for UniformCost {
    fn default() -> Self {
        Self(1)
    }
}

impl NodeCostEstimator for UniformCost {
    fn estimate(&self, _node: &DependencyNode) -> u64 {
        self.0
    }
}

/// A set of nodes scheduled and dispatched together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphFragment {
    id: FragmentId,
    /// In topological order.
    nodes: Vec<NodeId>,
    inputs: Vec<FragmentId>,
    outputs: Vec<FragmentId>,
    tail: Vec<FragmentId>,
    cache_hint: CacheSelectHint,
    cost: u64,
}

impl GraphFragment {
    #[must_use]
    pub fn id(&self) -> FragmentId {
        self.id
    }

    #[must_use]
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Fragments that must complete before this one is submitted.
    #[must_use]
    pub fn inputs(&self) -> &[FragmentId] {
        &self.inputs
    }

    /// Fragments notified when this one completes.
    #[must_use]
    pub fn outputs(&self) -> &[FragmentId] {
        &self.outputs
    }

    /// Fragments chained onto this fragment's job.
    #[must_use]
    pub fn tail(&self) -> &[FragmentId] {
        &self.tail
    }

    #[must_use]
    pub fn cache_hint(&self) -> &CacheSelectHint {
        &self.cache_hint
    }

    #[must_use]
    pub fn cost(&self) -> u64 {
        self.cost
    }

    /// Pending inputs before this fragment becomes executable.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.inputs.len()
    }
}

/// Partition of one graph: fragments keyed by id, terminal root included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentTree {
    fragments: IndexMap<FragmentId, GraphFragment>,
}

impl FragmentTree {
    #[must_use]
    pub fn root(&self) -> &GraphFragment {
        &self.fragments[&FragmentId::ROOT]
    }

    #[must_use]
    pub fn get(&self, id: FragmentId) -> Option<&GraphFragment> {
        self.fragments.get(&id)
    }

    /// Real fragments, in topological order; the root is excluded.
    pub fn fragments(&self) -> impl Iterator<Item = &GraphFragment> {
        self.fragments
            .values()
            .filter(|fragment| fragment.id != FragmentId::ROOT)
    }

    /// Number of real fragments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fragments.len() - 1
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct WorkingFragment {
    nodes: Vec<NodeId>,
    cost: u64,
    inputs: IndexSet<usize>,
    outputs: IndexSet<usize>,
    alive: bool,
}

/// Splits graphs according to a [`JobSizing`].
#[derive(Debug, Clone)]
pub struct FragmentPartitioner {
    sizing: JobSizing,
    #[debug(skip)]
    cost: Arc<dyn NodeCostEstimator>,
}

impl FragmentPartitioner {
    pub fn new(sizing: JobSizing, cost: Arc<dyn NodeCostEstimator>) -> Self {
        Self { sizing, cost }
    }

    #[must_use]
    pub fn sizing(&self) -> &JobSizing {
        &self.sizing
    }

    /// Total estimated cost of the graph.
    #[must_use]
    pub fn estimate(&self, graph: &DependencyGraph) -> u64 {
        graph
            .nodes()
            .map(|node| self.cost.estimate(node))
            .fold(0, u64::saturating_add)
    }

    /// # Errors
    /// If the graph contains cycle(s).
    pub fn partition(&self, graph: &DependencyGraph) -> Result<FragmentTree, GraphError> {
        let order = graph.topological_order()?;

        // One fragment per node, indexed in topological order.
        let mut node_fragment: HashMap<NodeId, usize> =
            HashMap::with_capacity_and_hasher(order.len(), FxBuildHasher);
        let mut work: Vec<WorkingFragment> = Vec::with_capacity(order.len());
        for (idx, &id) in order.iter().enumerate() {
            let node = graph.node(id).expect("FragmentPartitioner::partition: [1]");
            let inputs: IndexSet<usize> = node
                .inputs()
                .iter()
                .filter_map(|input| node_fragment.get(input).copied())
                .collect();
            for &input in &inputs {
                work[input].outputs.insert(idx);
            }
            work.push(WorkingFragment {
                nodes: vec![id],
                cost: self.cost.estimate(node),
                inputs,
                outputs: IndexSet::default(),
                alive: true,
            });
            node_fragment.insert(id, idx);
        }

        self.collapse_chains(&mut work);
        self.merge_siblings(&mut work);
        let tails = self.chain_tails(&work);
        Ok(Self::assemble(graph, work, &tails))
    }

    fn collapse_chains(&self, work: &mut [WorkingFragment]) {
        for idx in 0..work.len() {
            if !work[idx].alive {
                continue;
            }
            while work[idx].outputs.len() == 1 {
                let output = *work[idx]
                    .outputs
                    .first()
                    .expect("FragmentPartitioner::collapse_chains: [1]");
                if work[output].inputs.len() != 1 {
                    break;
                }
                let items = work[idx].nodes.len() + work[output].nodes.len();
                let cost = work[idx].cost.saturating_add(work[output].cost);
                if !self.sizing.fits(items, cost) {
                    break;
                }
                absorb(work, idx, output);
            }
        }
    }

    fn merge_siblings(&self, work: &mut [WorkingFragment]) {
        let mut groups: IndexMap<Vec<usize>, Vec<usize>> = IndexMap::default();
        for (idx, fragment) in work.iter().enumerate() {
            if fragment.alive && self.sizing.is_undersized(fragment.nodes.len(), fragment.cost) {
                let mut key: Vec<usize> = fragment.inputs.iter().copied().collect();
                key.sort_unstable();
                groups.entry(key).or_default().push(idx);
            }
        }
        for members in groups.into_values() {
            let mut accumulator: Option<usize> = None;
            for idx in members {
                match accumulator {
                    Some(into)
                        if self.sizing.fits(
                            work[into].nodes.len() + work[idx].nodes.len(),
                            work[into].cost.saturating_add(work[idx].cost),
                        ) =>
                    {
                        absorb(work, into, idx);
                    }
                    _ => accumulator = Some(idx),
                }
            }
        }
    }

    fn chain_tails(&self, work: &[WorkingFragment]) -> HashMap<usize, Vec<usize>> {
        let mut tails: HashMap<usize, Vec<usize>> = HashMap::default();
        if self.sizing.maximum_concurrency == 0 {
            return tails;
        }
        for (idx, fragment) in work.iter().enumerate() {
            if !fragment.alive {
                continue;
            }
            let chained: Vec<usize> = fragment
                .outputs
                .iter()
                .copied()
                .filter(|&output| work[output].inputs.len() == 1)
                .take(self.sizing.maximum_concurrency)
                .collect();
            if !chained.is_empty() {
                tails.insert(idx, chained);
            }
        }
        tails
    }

    fn assemble(
        graph: &DependencyGraph,
        work: Vec<WorkingFragment>,
        tails: &HashMap<usize, Vec<usize>>,
    ) -> FragmentTree {
        // Surviving fragments keep topological order; ids start after the root.
        let ids: HashMap<usize, FragmentId> = work
            .iter()
            .enumerate()
            .filter(|(_, fragment)| fragment.alive)
            .enumerate()
            .map(|(seq, (idx, _))| {
                let id = u32::try_from(seq + 1).expect("FragmentPartitioner::assemble: [1]");
                (idx, FragmentId(id))
            })
            .collect();
        let mut node_fragment: HashMap<NodeId, usize> = HashMap::default();
        for (idx, fragment) in work.iter().enumerate().filter(|(_, f)| f.alive) {
            for &node in &fragment.nodes {
                node_fragment.insert(node, idx);
            }
        }

        let mut fragments: IndexMap<FragmentId, GraphFragment> = IndexMap::default();
        let mut root_inputs = Vec::new();
        for (idx, fragment) in work.into_iter().enumerate() {
            if !fragment.alive {
                continue;
            }
            let id = ids[&idx];
            let mut outputs: Vec<FragmentId> =
                fragment.outputs.iter().map(|output| ids[output]).collect();
            if outputs.is_empty() {
                outputs.push(FragmentId::ROOT);
                root_inputs.push(id);
            }
            let cache_hint = cache_hint(graph, &fragment.nodes, idx, &node_fragment);
            fragments.insert(
                id,
                GraphFragment {
                    id,
                    inputs: fragment.inputs.iter().map(|input| ids[input]).collect(),
                    outputs,
                    tail: tails
                        .get(&idx)
                        .map(|tail| tail.iter().map(|t| ids[t]).collect())
                        .unwrap_or_default(),
                    cache_hint,
                    cost: fragment.cost,
                    nodes: fragment.nodes,
                },
            );
        }
        fragments.shift_insert(
            0,
            FragmentId::ROOT,
            GraphFragment {
                id: FragmentId::ROOT,
                nodes: Vec::new(),
                inputs: root_inputs,
                outputs: Vec::new(),
                tail: Vec::new(),
                cache_hint: CacheSelectHint::AllShared,
                cost: 0,
            },
        );
        FragmentTree { fragments }
    }
}

/// Moves everything of `from` into `into` and rewires the neighbours.
fn absorb(work: &mut [WorkingFragment], into: usize, from: usize) {
    let taken = mem::take(&mut work[from]);
    for input in taken.inputs {
        if input == into {
            continue;
        }
        work[input].outputs.swap_remove(&from);
        work[input].outputs.insert(into);
        work[into].inputs.insert(input);
    }
    for output in taken.outputs {
        if output == into {
            continue;
        }
        work[output].inputs.swap_remove(&from);
        work[output].inputs.insert(into);
        work[into].outputs.insert(output);
    }
    let target = &mut work[into];
    target.inputs.swap_remove(&from);
    target.outputs.swap_remove(&from);
    target.nodes.extend(taken.nodes);
    target.cost = target.cost.saturating_add(taken.cost);
}

/// A value is private when it is not terminal and every consumer lives in the
/// same fragment.
pub(crate) fn cache_hint(
    graph: &DependencyGraph,
    nodes: &[NodeId],
    fragment: usize,
    node_fragment: &HashMap<NodeId, usize>,
) -> CacheSelectHint {
    let mut private = Vec::new();
    let mut shared = Vec::new();
    for &id in nodes {
        let Some(node) = graph.node(id) else {
            continue;
        };
        let consumed_locally = graph
            .dependents(id)
            .iter()
            .all(|dependent| node_fragment.get(dependent) == Some(&fragment));
        for output in node.outputs() {
            if consumed_locally && !graph.is_terminal(output) {
                private.push(output.clone());
            } else {
                shared.push(output.clone());
            }
        }
    }
    CacheSelectHint::from_split(private, shared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        graph::{ComputationTarget, ComputationTargetType},
        types::{TargetId, ValueSpecification},
    };

    fn value(name: &str) -> ValueSpecification {
        ValueSpecification::new(name, TargetId::new("P"))
    }

    /// `edges[i]` lists the inputs of node `i + 1`; the last node's output is
    /// terminal.
    fn graph(edges: &[&[u32]]) -> DependencyGraph {
        let target = ComputationTarget::new(ComputationTargetType::Primitive, "P");
        let mut builder = DependencyGraph::builder("Default");
        for (idx, inputs) in edges.iter().enumerate() {
            let id = u32::try_from(idx + 1).unwrap();
            builder.add_node(
                DependencyNode::new(NodeId(id), format!("f{id}"), target.clone())
                    .with_inputs(inputs.iter().map(|&input| NodeId(input)))
                    .with_outputs([value(&format!("v{id}"))]),
            );
        }
        builder.add_terminal_output(value(&format!("v{}", edges.len())));
        builder.build()
    }

    fn partition(graph: &DependencyGraph, sizing: JobSizing) -> FragmentTree {
        FragmentPartitioner::new(sizing, Arc::new(UniformCost::default()))
            .partition(graph)
            .unwrap()
    }

    fn nodes(tree: &FragmentTree) -> Vec<Vec<u32>> {
        tree.fragments()
            .map(|fragment| fragment.nodes().iter().map(|node| node.0).collect())
            .collect()
    }

    #[test]
    fn chain_collapses_into_one_fragment() {
        let tree = partition(&graph(&[&[], &[1], &[2]]), JobSizing::default());
        assert_eq!(nodes(&tree), [vec![1, 2, 3]]);
        assert_eq!(tree.root().inputs(), [FragmentId(1)]);

        let fragment = tree.get(FragmentId(1)).unwrap();
        assert_eq!(fragment.outputs(), [FragmentId::ROOT]);
        assert_eq!(fragment.cost(), 3);
        assert_eq!(
            fragment.cache_hint(),
            &CacheSelectHint::SharedValues(Arc::from([value("v3")]))
        );
        assert!(fragment.cache_hint().is_private(&value("v1")));
    }

    #[test]
    fn maximum_items_keeps_one_fragment_per_node() {
        let sizing = JobSizing {
            maximum_job_items: 1,
            maximum_concurrency: 0,
            ..JobSizing::default()
        };
        let tree = partition(&graph(&[&[], &[1], &[2]]), sizing);
        assert_eq!(nodes(&tree), [vec![1], vec![2], vec![3]]);
        let second = tree.get(FragmentId(2)).unwrap();
        assert_eq!(second.inputs(), [FragmentId(1)]);
        assert_eq!(second.outputs(), [FragmentId(3)]);
        assert_eq!(second.block_count(), 1);
        assert!(second.tail().is_empty());
        assert_eq!(second.cache_hint(), &CacheSelectHint::AllShared);
    }

    #[test]
    fn single_input_outputs_become_tails() {
        let sizing = JobSizing {
            maximum_job_items: 1,
            maximum_concurrency: 1,
            ..JobSizing::default()
        };
        // 1 -> {2, 3}, {2, 3} -> 4
        let tree = partition(&graph(&[&[], &[1], &[1], &[2, 3]]), sizing);
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.get(FragmentId(1)).unwrap().tail(), [FragmentId(2)]);
        assert!(tree.get(FragmentId(2)).unwrap().tail().is_empty());
        assert!(tree.get(FragmentId(4)).is_some_and(|f| f.block_count() == 2));
    }

    #[test]
    fn undersized_siblings_are_merged() {
        let sizing = JobSizing {
            minimum_job_items: 2,
            maximum_job_items: 2,
            maximum_concurrency: 0,
            ..JobSizing::default()
        };
        // 1 -> {2, 3}
        let tree = partition(&graph(&[&[], &[1], &[1]]), sizing);
        assert_eq!(nodes(&tree), [vec![1], vec![2, 3]]);
        let siblings = tree.get(FragmentId(2)).unwrap();
        assert_eq!(siblings.inputs(), [FragmentId(1)]);
        assert_eq!(tree.get(FragmentId(1)).unwrap().outputs(), [FragmentId(2)]);
        assert_eq!(tree.root().inputs(), [FragmentId(2)]);
    }

    #[test]
    fn empty_graph_has_only_the_root() {
        let tree = partition(&graph(&[]), JobSizing::default());
        assert!(tree.is_empty());
        assert!(tree.root().inputs().is_empty());
    }

    #[test]
    fn cycles_are_rejected() {
        let err = FragmentPartitioner::new(JobSizing::default(), Arc::new(UniformCost(5)))
            .partition(&graph(&[&[2], &[1]]))
            .unwrap_err();
        assert_eq!(err, GraphError::Cycle);
    }
}
