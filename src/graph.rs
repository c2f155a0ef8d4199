//! The dependency graph consumed by the planner and executors.
//!
//! Graph compilation happens elsewhere; this module only models the result:
//! nodes with a computation target, a function reference, output values and
//! edges to the input nodes they depend on. Inputs that are not part of the
//! graph are treated as already resolved (typically market data sourced by an
//! earlier step).

use crate::{
    error::GraphError,
    job::CalculationJobItem,
    log::ExecutionLogMode,
    types::{HashMap, HashSet, IndexMap, NodeId, TargetId, ValueSpecification},
};
use core::hash::{Hash, Hasher};
use derive_more::Display;
use rustc_hash::{FxBuildHasher, FxHasher};
use std::{collections::VecDeque, sync::Arc};

/// Classification of what a node computes a value for.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ComputationTargetType {
    #[display("PRIMITIVE")]
    Primitive,
    #[display("SECURITY")]
    Security,
    #[display("POSITION")]
    Position,
    #[display("PORTFOLIO_NODE")]
    PortfolioNode,
}

#[derive(Debug, Display, Clone, PartialEq, Eq, Hash)]
#[display("{kind}:{id}")]
pub struct ComputationTarget {
    pub kind: ComputationTargetType,
    pub id: TargetId,
}

impl ComputationTarget {
    pub fn new(kind: ComputationTargetType, id: impl Into<Arc<str>>) -> Self {
        Self {
            kind,
            id: TargetId::new(id),
        }
    }
}

/// Structural identity of a node: function, parameters, target and the keys of
/// its inputs in order. Equal across structurally identical graph instances.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("{_0:016x}")]
pub struct NodeKey(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyNode {
    id: NodeId,
    function: Arc<str>,
    parameters: Arc<str>,
    target: ComputationTarget,
    inputs: Vec<NodeId>,
    outputs: Vec<ValueSpecification>,
    market_data: bool,
}

impl DependencyNode {
    pub fn new(id: NodeId, function: impl Into<Arc<str>>, target: ComputationTarget) -> Self {
        Self {
            id,
            function: function.into(),
            parameters: Arc::from(""),
            target,
            inputs: Vec::new(),
            outputs: Vec::new(),
            market_data: false,
        }
    }

    #[must_use]
    pub fn with_parameters(mut self, parameters: impl Into<Arc<str>>) -> Self {
        self.parameters = parameters.into();
        self
    }

    #[must_use]
    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = NodeId>) -> Self {
        self.inputs.extend(inputs);
        self
    }

    #[must_use]
    pub fn with_outputs(mut self, outputs: impl IntoIterator<Item = ValueSpecification>) -> Self {
        self.outputs.extend(outputs);
        self
    }

    /// Marks the node as sourcing market data, i.e. a leaf that is resolved
    /// before any security-level pass runs.
    #[must_use]
    pub fn market_data(mut self) -> Self {
        self.market_data = true;
        self
    }

    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[must_use]
    pub fn function(&self) -> &str {
        &self.function
    }

    #[must_use]
    pub fn parameters(&self) -> &str {
        &self.parameters
    }

    #[must_use]
    pub fn target(&self) -> &ComputationTarget {
        &self.target
    }

    #[must_use]
    pub fn target_type(&self) -> ComputationTargetType {
        self.target.kind
    }

    #[must_use]
    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    #[must_use]
    pub fn outputs(&self) -> &[ValueSpecification] {
        &self.outputs
    }

    #[must_use]
    pub fn is_market_data(&self) -> bool {
        self.market_data
    }

    pub(crate) fn job_item(
        &self,
        inputs: Vec<ValueSpecification>,
        log_mode: ExecutionLogMode,
    ) -> CalculationJobItem {
        CalculationJobItem {
            node: self.id,
            function: self.function.clone(),
            parameters: self.parameters.clone(),
            target: self.target.clone(),
            inputs,
            outputs: self.outputs.clone(),
            log_mode,
        }
    }
}

/// A fully built dependency graph for one calculation configuration.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    calculation_configuration: Arc<str>,
    nodes: IndexMap<NodeId, DependencyNode>,
    dependents: HashMap<NodeId, Vec<NodeId>>,
    terminal_outputs: HashSet<ValueSpecification>,
    /// Outputs of inputs left behind by [`DependencyGraph::sub_graph`].
    resolved_inputs: HashMap<NodeId, Vec<ValueSpecification>>,
}

/// Accumulates nodes for a [`DependencyGraph`].
#[derive(Debug)]
pub struct DependencyGraphBuilder {
    calculation_configuration: Arc<str>,
    nodes: IndexMap<NodeId, DependencyNode>,
    terminal_outputs: HashSet<ValueSpecification>,
}

impl DependencyGraphBuilder {
    /// # Panics
    /// If a node with the same id was already added.
    pub fn add_node(&mut self, node: DependencyNode) -> &mut Self {
        let id = node.id;
        let replaced = self.nodes.insert(id, node);
        assert!(replaced.is_none(), "Node {id} is added twice");
        self
    }

    /// Marks a value as requested by the cycle, so it is always published to
    /// the shared value cache.
    pub fn add_terminal_output(&mut self, value: ValueSpecification) -> &mut Self {
        self.terminal_outputs.insert(value);
        self
    }

    #[must_use]
    pub fn build(self) -> DependencyGraph {
        let Self {
            calculation_configuration,
            nodes,
            terminal_outputs,
        } = self;
        DependencyGraph::assemble(
            calculation_configuration,
            nodes,
            terminal_outputs,
            HashMap::default(),
        )
    }
}

impl DependencyGraph {
    pub fn builder(calculation_configuration: impl Into<Arc<str>>) -> DependencyGraphBuilder {
        DependencyGraphBuilder {
            calculation_configuration: calculation_configuration.into(),
            nodes: IndexMap::default(),
            terminal_outputs: HashSet::default(),
        }
    }

    fn assemble(
        calculation_configuration: Arc<str>,
        nodes: IndexMap<NodeId, DependencyNode>,
        terminal_outputs: HashSet<ValueSpecification>,
        resolved_inputs: HashMap<NodeId, Vec<ValueSpecification>>,
    ) -> Self {
        let mut dependents: HashMap<NodeId, Vec<NodeId>> =
            HashMap::with_capacity_and_hasher(nodes.len(), FxBuildHasher);
        for node in nodes.values() {
            for input in &node.inputs {
                if nodes.contains_key(input) {
                    dependents.entry(*input).or_default().push(node.id);
                }
            }
        }
        Self {
            calculation_configuration,
            nodes,
            dependents,
            terminal_outputs,
            resolved_inputs,
        }
    }

    #[must_use]
    pub fn calculation_configuration(&self) -> &str {
        &self.calculation_configuration
    }

    #[must_use]
    pub(crate) fn calculation_configuration_arc(&self) -> &Arc<str> {
        &self.calculation_configuration
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&DependencyNode> {
        self.nodes.get(&id)
    }

    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// All nodes in insertion order.
    pub fn nodes(&self) -> impl ExactSizeIterator<Item = &DependencyNode> {
        self.nodes.values()
    }

    /// Input nodes of `id` that are part of this graph.
    pub fn graph_inputs(&self, id: NodeId) -> impl Iterator<Item = &DependencyNode> {
        self.nodes
            .get(&id)
            .into_iter()
            .flat_map(|node| node.inputs.iter())
            .filter_map(|input| self.nodes.get(input))
    }

    /// Nodes of this graph that consume an output of `id`.
    #[must_use]
    pub fn dependents(&self, id: NodeId) -> &[NodeId] {
        self.dependents.get(&id).map_or(&[], Vec::as_slice)
    }

    /// Values consumed by `id`: outputs of its in-graph inputs, plus those of
    /// inputs that were resolved by an earlier stage when this graph was cut
    /// out of a larger one.
    pub fn input_values(&self, id: NodeId) -> impl Iterator<Item = &ValueSpecification> {
        self.nodes
            .get(&id)
            .into_iter()
            .flat_map(|node| node.inputs.iter())
            .flat_map(|input| {
                self.nodes
                    .get(input)
                    .map(|node| node.outputs.as_slice())
                    .or_else(|| self.resolved_inputs.get(input).map(Vec::as_slice))
                    .unwrap_or_default()
            })
    }

    #[must_use]
    pub fn is_terminal(&self, value: &ValueSpecification) -> bool {
        self.terminal_outputs.contains(value)
    }

    pub fn terminal_outputs(&self) -> impl Iterator<Item = &ValueSpecification> {
        self.terminal_outputs.iter()
    }

    /// Kahn ordering: every node appears after all of its in-graph inputs.
    /// Roots keep their insertion order.
    ///
    /// # Errors
    /// If the graph contains cycle(s).
    pub fn topological_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let mut pending: HashMap<NodeId, usize> =
            HashMap::with_capacity_and_hasher(self.nodes.len(), FxBuildHasher);
        let mut ready = VecDeque::new();
        for node in self.nodes.values() {
            let count = node
                .inputs
                .iter()
                .filter(|input| self.nodes.contains_key(*input))
                .count();
            if count == 0 {
                ready.push_back(node.id);
            } else {
                pending.insert(node.id, count);
            }
        }
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_front() {
            order.push(id);
            for dependent in self.dependents(id) {
                let left = pending
                    .get_mut(dependent)
                    .expect("DependencyGraph::topological_order: [1]");
                *left -= 1;
                if *left == 0 {
                    pending.remove(dependent);
                    ready.push_back(*dependent);
                }
            }
        }
        if order.len() == self.nodes.len() {
            Ok(order)
        } else {
            Err(GraphError::Cycle)
        }
    }

    /// Induced sub-graph over `ids`. Inputs outside the subset stay as
    /// resolved references; outputs consumed outside the subset are marked
    /// terminal so they keep being published to the shared cache.
    #[must_use]
    pub fn sub_graph(&self, ids: impl IntoIterator<Item = NodeId>) -> Self {
        let nodes: IndexMap<_, _> = ids
            .into_iter()
            .filter_map(|id| self.nodes.get(&id).map(|node| (id, node.clone())))
            .collect();
        let mut terminal_outputs = HashSet::default();
        let mut resolved_inputs: HashMap<NodeId, Vec<ValueSpecification>> = HashMap::default();
        for node in nodes.values() {
            for input in &node.inputs {
                if nodes.contains_key(input) || resolved_inputs.contains_key(input) {
                    continue;
                }
                if let Some(outputs) = self
                    .nodes
                    .get(input)
                    .map(|producer| producer.outputs.clone())
                    .or_else(|| self.resolved_inputs.get(input).cloned())
                {
                    resolved_inputs.insert(*input, outputs);
                }
            }
            let consumed_outside = self
                .dependents(node.id)
                .iter()
                .any(|dependent| !nodes.contains_key(dependent));
            for output in &node.outputs {
                if consumed_outside || self.terminal_outputs.contains(output) {
                    terminal_outputs.insert(output.clone());
                }
            }
        }
        Self::assemble(
            self.calculation_configuration.clone(),
            nodes,
            terminal_outputs,
            resolved_inputs,
        )
    }

    /// Structural key of every node.
    ///
    /// # Errors
    /// If the graph contains cycle(s).
    pub fn node_keys(&self) -> Result<HashMap<NodeId, NodeKey>, GraphError> {
        let order = self.topological_order()?;
        let mut keys: HashMap<NodeId, NodeKey> =
            HashMap::with_capacity_and_hasher(order.len(), FxBuildHasher);
        for id in order {
            let node = &self.nodes[&id];
            let mut hasher = FxHasher::default();
            node.function.hash(&mut hasher);
            node.parameters.hash(&mut hasher);
            node.target.hash(&mut hasher);
            node.market_data.hash(&mut hasher);
            for input in &node.inputs {
                // Out-of-graph inputs are resolved values; only their presence
                // is structural.
                keys.get(input).copied().hash(&mut hasher);
            }
            keys.insert(id, NodeKey(hasher.finish()));
        }
        Ok(keys)
    }

    /// Order-insensitive key over all node keys, the terminal outputs and the
    /// configuration name. Graphs sharing it partition identically, cache
    /// hints included.
    ///
    /// # Errors
    /// If the graph contains cycle(s).
    pub fn structure_key(&self) -> Result<u64, GraphError> {
        self.node_keys().map(|keys| self.structure_key_of(&keys))
    }

    /// [`structure_key`](Self::structure_key) over already computed node keys.
    pub(crate) fn structure_key_of(&self, keys: &HashMap<NodeId, NodeKey>) -> u64 {
        let mut keys: Vec<NodeKey> = keys.values().copied().collect();
        keys.sort_unstable();
        let mut terminal: Vec<&ValueSpecification> = self.terminal_outputs.iter().collect();
        terminal.sort_unstable();
        let mut hasher = FxHasher::default();
        self.calculation_configuration.hash(&mut hasher);
        keys.hash(&mut hasher);
        terminal.hash(&mut hasher);
        hasher.finish()
    }

    /// Maps each node of `self` to the node of `other` with the same
    /// structural key. Nodes without a counterpart are absent from the result.
    ///
    /// # Errors
    /// If either graph contains cycle(s).
    pub fn structural_mapping(
        &self,
        other: &Self,
    ) -> Result<HashMap<NodeId, NodeId>, GraphError> {
        let ours = self.node_keys()?;
        let theirs = key_index(&other.node_keys()?);
        Ok(ours
            .into_iter()
            .filter_map(|(id, key)| theirs.get(&key).map(|&other_id| (id, other_id)))
            .collect())
    }
}

/// Inverts a node-key map. When keys collide the lowest node id wins.
pub(crate) fn key_index(keys: &HashMap<NodeId, NodeKey>) -> HashMap<NodeKey, NodeId> {
    let mut index: HashMap<NodeKey, NodeId> =
        HashMap::with_capacity_and_hasher(keys.len(), FxBuildHasher);
    for (&id, &key) in keys {
        index
            .entry(key)
            .and_modify(|existing| *existing = (*existing).min(id))
            .or_insert(id);
    }
    index
}
