//! Reusable execution plans.
//!
//! A plan describes how a graph is split into jobs, independently of the graph
//! instance it was built from. Rebinding a plan onto a structurally identical
//! graph through [`ExecutionPlan::with_nodes`] avoids partitioning again on
//! every cycle.

use crate::{
    context::CycleContext,
    error::GraphError,
    executor::{ExecutionSummary, plan::PlanExecutor},
    fragment::{self, FragmentTree},
    future::ExecutionFuture,
    graph::DependencyGraph,
    job::CacheSelectHint,
    statistics::StatisticsSink,
    types::{FragmentId, HashMap, HashSet, IndexMap, NodeId},
};
use rustc_hash::FxBuildHasher;
use std::sync::Arc;
use tracing::warn;

/// How a graph is split into jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionPlan {
    /// The whole graph as one job.
    Single(SingleFragmentPlan),
    Multiple(MultipleFragmentPlan),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleFragmentPlan {
    nodes: Vec<NodeId>,
    cache_hint: CacheSelectHint,
}

/// One fragment of a [`MultipleFragmentPlan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentDescriptor {
    nodes: Vec<NodeId>,
    cache_hint: CacheSelectHint,
    inputs: Vec<FragmentId>,
    /// Empty when the fragment only feeds the terminal root.
    outputs: Vec<FragmentId>,
    tail: Vec<FragmentId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipleFragmentPlan {
    fragments: IndexMap<FragmentId, FragmentDescriptor>,
}

impl SingleFragmentPlan {
    /// # Errors
    /// If the graph contains cycle(s).
    pub fn new(graph: &DependencyGraph) -> Result<Self, GraphError> {
        let nodes = graph.topological_order()?;
        let node_fragment: HashMap<NodeId, usize> = nodes.iter().map(|&id| (id, 0)).collect();
        let cache_hint = fragment::cache_hint(graph, &nodes, 0, &node_fragment);
        Ok(Self { nodes, cache_hint })
    }

    /// In topological order.
    #[must_use]
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    #[must_use]
    pub fn cache_hint(&self) -> &CacheSelectHint {
        &self.cache_hint
    }

    fn with_nodes(&self, mapping: &HashMap<NodeId, NodeId>) -> Self {
        match rebind(&self.nodes, mapping) {
            Ok(nodes) => Self {
                nodes,
                cache_hint: self.cache_hint.clone(),
            },
            Err(node) => {
                warn!(%node, "node has no counterpart in the rebound graph, dropping the single fragment");
                Self {
                    nodes: Vec::new(),
                    cache_hint: CacheSelectHint::AllShared,
                }
            }
        }
    }
}

impl FragmentDescriptor {
    #[must_use]
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    #[must_use]
    pub fn cache_hint(&self) -> &CacheSelectHint {
        &self.cache_hint
    }

    #[must_use]
    pub fn inputs(&self) -> &[FragmentId] {
        &self.inputs
    }

    #[must_use]
    pub fn outputs(&self) -> &[FragmentId] {
        &self.outputs
    }

    #[must_use]
    pub fn tail(&self) -> &[FragmentId] {
        &self.tail
    }
}

impl MultipleFragmentPlan {
    /// Records every fragment reachable from the root once, walking inputs
    /// depth first. Descriptors are kept in fragment id order, which is a
    /// topological order of the tree.
    #[must_use]
    pub fn from_tree(tree: &FragmentTree) -> Self {
        let mut fragments: IndexMap<FragmentId, FragmentDescriptor> =
            IndexMap::with_capacity_and_hasher(tree.len(), FxBuildHasher);
        let mut visited: HashSet<FragmentId> = HashSet::default();
        let mut stack: Vec<FragmentId> = tree.root().inputs().to_vec();
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let Some(fragment) = tree.get(id) else {
                continue;
            };
            stack.extend(fragment.inputs().iter().copied());
            fragments.insert(
                id,
                FragmentDescriptor {
                    nodes: fragment.nodes().to_vec(),
                    cache_hint: fragment.cache_hint().clone(),
                    inputs: fragment.inputs().to_vec(),
                    outputs: fragment
                        .outputs()
                        .iter()
                        .copied()
                        .filter(|&output| output != FragmentId::ROOT)
                        .collect(),
                    tail: fragment.tail().to_vec(),
                },
            );
        }
        fragments.sort_keys();
        Self { fragments }
    }

    #[must_use]
    pub fn fragments(&self) -> &IndexMap<FragmentId, FragmentDescriptor> {
        &self.fragments
    }

    fn with_nodes(&self, mapping: &HashMap<NodeId, NodeId>) -> Self {
        let mut dropped: HashSet<FragmentId> = HashSet::default();
        let mut fragments: IndexMap<FragmentId, FragmentDescriptor> =
            IndexMap::with_capacity_and_hasher(self.fragments.len(), FxBuildHasher);
        for (&id, descriptor) in &self.fragments {
            match rebind(&descriptor.nodes, mapping) {
                Ok(nodes) => {
                    fragments.insert(
                        id,
                        FragmentDescriptor {
                            nodes,
                            ..descriptor.clone()
                        },
                    );
                }
                Err(node) => {
                    warn!(fragment = %id, %node, "node has no counterpart in the rebound graph, dropping fragment");
                    dropped.insert(id);
                }
            }
        }
        if !dropped.is_empty() {
            for descriptor in fragments.values_mut() {
                descriptor.inputs.retain(|id| !dropped.contains(id));
                descriptor.outputs.retain(|id| !dropped.contains(id));
                descriptor.tail.retain(|id| !dropped.contains(id));
            }
        }
        Self { fragments }
    }
}

fn rebind(nodes: &[NodeId], mapping: &HashMap<NodeId, NodeId>) -> Result<Vec<NodeId>, NodeId> {
    nodes
        .iter()
        .map(|node| mapping.get(node).copied().ok_or(*node))
        .collect()
}

impl From<&FragmentTree> for ExecutionPlan {
    fn from(tree: &FragmentTree) -> Self {
        Self::Multiple(MultipleFragmentPlan::from_tree(tree))
    }
}

impl ExecutionPlan {
    /// # Errors
    /// If the graph contains cycle(s).
    pub fn single(graph: &DependencyGraph) -> Result<Self, GraphError> {
        SingleFragmentPlan::new(graph).map(Self::Single)
    }

    /// An equivalent plan whose nodes are those of another, structurally
    /// identical graph. `mapping` goes from this plan's nodes to the other
    /// graph's. Fragments with an unmapped node are logged and dropped.
    #[must_use]
    pub fn with_nodes(&self, mapping: &HashMap<NodeId, NodeId>) -> Self {
        match self {
            Self::Single(plan) => Self::Single(plan.with_nodes(mapping)),
            Self::Multiple(plan) => Self::Multiple(plan.with_nodes(mapping)),
        }
    }

    /// Number of jobs the plan dispatches, tails included.
    #[must_use]
    pub fn fragment_count(&self) -> usize {
        match self {
            Self::Single(plan) => usize::from(!plan.nodes.is_empty()),
            Self::Multiple(plan) => plan.fragments.len(),
        }
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        match self {
            Self::Single(plan) => plan.nodes.len(),
            Self::Multiple(plan) => plan.fragments.values().map(|d| d.nodes.len()).sum(),
        }
    }

    /// Starts executing `graph`, which must be the graph the plan is bound to.
    pub fn run(
        &self,
        graph: Arc<DependencyGraph>,
        cycle: &Arc<CycleContext>,
        statistics: Option<Arc<dyn StatisticsSink>>,
    ) -> ExecutionFuture<ExecutionSummary> {
        PlanExecutor::new(self, graph, cycle.clone(), statistics).start()
    }
}
