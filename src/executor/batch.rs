//! Staged execution by computation-target type.
//!
//! Valuation functions are mostly parallel within a target, and across targets
//! once their security-level inputs are resolved. The batch executor therefore
//! runs coarse stages separated by barriers:
//!
//! 1. every PRIMITIVE node;
//! 2. pass by pass, one sub-execution per target, concurrently within a pass;
//! 3. every PORTFOLIO_NODE node.
//!
//! Each stage is delegated to an inner executor, and the batch waits for it
//! before starting the next.

use crate::{
    error::{ExecutionError, StructureError},
    executor::{DependencyGraphExecutor, ExecutionSummary},
    future::ExecutionFuture,
    graph::{ComputationTargetType, DependencyGraph, DependencyNode},
    types::{HashMap, IndexMap, NodeId, TargetId},
};
use derive_more::Debug;
use rayon::prelude::*;
use rustc_hash::FxBuildHasher;
use std::{sync::Arc, time::Instant};
use tracing::{debug, error, info};

/// Nodes of a graph grouped into batch stages.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchPartition {
    primitive: Vec<NodeId>,
    /// Per pass, SECURITY and POSITION nodes keyed by the security target
    /// they belong to.
    passes: Vec<IndexMap<TargetId, Vec<NodeId>>>,
    portfolio: Vec<NodeId>,
    pass_numbers: HashMap<NodeId, usize>,
}

impl BatchPartition {
    /// Validates the target-type layering and assigns pass numbers.
    ///
    /// # Errors
    /// [`ExecutionError::Structure`] if a node depends on a node it must not
    /// depend on, or a position does not depend on exactly one security;
    /// [`ExecutionError::Graph`] if the graph contains cycle(s).
    pub fn new(graph: &DependencyGraph) -> Result<Self, ExecutionError> {
        let order = graph.topological_order()?;
        let mut partition = Self {
            pass_numbers: HashMap::with_capacity_and_hasher(order.len(), FxBuildHasher),
            ..Self::default()
        };
        // Target group of every SECURITY or POSITION node.
        let mut groups: HashMap<NodeId, TargetId> =
            HashMap::with_capacity_and_hasher(order.len(), FxBuildHasher);
        for id in order {
            let node = graph.node(id).expect("BatchPartition::new: [1]");
            validate(graph, node)?;
            match node.target_type() {
                ComputationTargetType::Primitive => partition.primitive.push(id),
                ComputationTargetType::PortfolioNode => partition.portfolio.push(id),
                ComputationTargetType::Security => {
                    let pass = partition.security_pass(graph, node);
                    partition.assign(id, pass, node.target().id.clone());
                    groups.insert(id, node.target().id.clone());
                }
                ComputationTargetType::Position => {
                    let security = graph
                        .graph_inputs(id)
                        .find(|input| input.target_type() == ComputationTargetType::Security)
                        .expect("BatchPartition::new: [2]");
                    let pass = partition.pass_numbers[&security.id()];
                    let group = groups[&security.id()].clone();
                    partition.assign(id, pass, group.clone());
                    groups.insert(id, group);
                }
            }
        }
        Ok(partition)
    }

    /// 0 when every SECURITY input is resolved market data; otherwise the
    /// highest input pass, one further for inputs on another target.
    fn security_pass(&self, graph: &DependencyGraph, node: &DependencyNode) -> usize {
        graph
            .graph_inputs(node.id())
            .filter(|input| {
                input.target_type() == ComputationTargetType::Security && !input.is_market_data()
            })
            .map(|input| {
                let pass = self.pass_numbers[&input.id()];
                if input.target().id == node.target().id {
                    pass
                } else {
                    pass + 1
                }
            })
            .max()
            .unwrap_or(0)
    }

    fn assign(&mut self, id: NodeId, pass: usize, group: TargetId) {
        self.pass_numbers.insert(id, pass);
        if self.passes.len() <= pass {
            self.passes.resize_with(pass + 1, IndexMap::default);
        }
        self.passes[pass].entry(group).or_default().push(id);
    }

    #[must_use]
    pub fn primitive(&self) -> &[NodeId] {
        &self.primitive
    }

    #[must_use]
    pub fn passes(&self) -> &[IndexMap<TargetId, Vec<NodeId>>] {
        &self.passes
    }

    #[must_use]
    pub fn portfolio(&self) -> &[NodeId] {
        &self.portfolio
    }

    /// Pass of a SECURITY or POSITION node.
    #[must_use]
    pub fn pass_of(&self, id: NodeId) -> Option<usize> {
        self.pass_numbers.get(&id).copied()
    }
}

fn validate(graph: &DependencyGraph, node: &DependencyNode) -> Result<(), StructureError> {
    use ComputationTargetType::{PortfolioNode, Position, Primitive, Security};

    let kind = node.target_type();
    let allowed = |input: ComputationTargetType| match kind {
        Primitive => input == Primitive,
        Security | Position => matches!(input, Primitive | Security),
        PortfolioNode => true,
    };
    for input in graph.graph_inputs(node.id()) {
        if !allowed(input.target_type()) {
            return Err(StructureError::IllegalDependency {
                node: node.id(),
                kind,
                input: input.id(),
                input_kind: input.target_type(),
            });
        }
    }
    if kind == Position {
        let found = graph
            .graph_inputs(node.id())
            .filter(|input| input.target_type() == Security)
            .count();
        if found != 1 {
            return Err(StructureError::PositionSecurityInputs {
                node: node.id(),
                found,
            });
        }
    }
    Ok(())
}

/// Runs graphs in target-type stages through an inner executor.
///
/// Execution happens synchronously inside [`execute`](DependencyGraphExecutor::execute);
/// the returned handle is already complete and cannot be cancelled.
#[derive(Debug)]
pub struct BatchExecutor {
    #[debug(skip)]
    inner: Arc<dyn DependencyGraphExecutor>,
}

impl BatchExecutor {
    pub fn new(inner: Arc<dyn DependencyGraphExecutor>) -> Self {
        Self { inner }
    }

    fn run(&self, graph: &DependencyGraph) -> Result<ExecutionSummary, ExecutionError> {
        let started = Instant::now();
        let partition = BatchPartition::new(graph)?;
        info!(
            calculation_configuration = graph.calculation_configuration(),
            primitive = partition.primitive.len(),
            passes = partition.passes.len(),
            portfolio = partition.portfolio.len(),
            "executing dependency graph in batch stages",
        );
        let mut summary = ExecutionSummary::empty(graph.calculation_configuration_arc().clone());

        self.run_stage(graph, "PRIMITIVE", &partition.primitive, &mut summary)?;
        for (pass, targets) in partition.passes.iter().enumerate() {
            let stage = format!("pass {pass}");
            debug!(%stage, targets = targets.len(), "starting batch pass");
            let groups: Vec<(&TargetId, &Vec<NodeId>)> = targets.iter().collect();
            let futures: Vec<(&TargetId, ExecutionFuture<ExecutionSummary>)> = groups
                .into_par_iter()
                .map(|(target, nodes)| {
                    let sub_graph = Arc::new(graph.sub_graph(nodes.iter().copied()));
                    (target, self.inner.execute(sub_graph))
                })
                .collect();
            for (idx, (target, future)) in futures.iter().enumerate() {
                match future.wait() {
                    Ok(done) => summary.absorb(&done),
                    Err(err) => {
                        for (_, pending) in &futures[idx + 1..] {
                            pending.cancel();
                        }
                        let stage = format!("{stage}, target {target}");
                        error!(%stage, %err, "batch stage failed, aborting");
                        return Err(ExecutionError::Stage {
                            stage,
                            source: Arc::new(err),
                        });
                    }
                }
            }
        }
        self.run_stage(graph, "PORTFOLIO_NODE", &partition.portfolio, &mut summary)?;

        summary.duration = started.elapsed();
        info!(
            calculation_configuration = graph.calculation_configuration(),
            jobs = summary.job_count,
            nodes = summary.node_count,
            duration = ?summary.duration,
            "batch execution finished",
        );
        Ok(summary)
    }

    fn run_stage(
        &self,
        graph: &DependencyGraph,
        stage: &str,
        nodes: &[NodeId],
        summary: &mut ExecutionSummary,
    ) -> Result<(), ExecutionError> {
        if nodes.is_empty() {
            return Ok(());
        }
        debug!(stage, nodes = nodes.len(), "starting batch stage");
        let sub_graph = Arc::new(graph.sub_graph(nodes.iter().copied()));
        match self.inner.execute(sub_graph).wait() {
            Ok(done) => {
                summary.absorb(&done);
                Ok(())
            }
            Err(err) => {
                error!(stage, %err, "batch stage failed, aborting");
                Err(ExecutionError::Stage {
                    stage: stage.to_owned(),
                    source: Arc::new(err),
                })
            }
        }
    }
}

impl DependencyGraphExecutor for BatchExecutor {
    fn execute(&self, graph: Arc<DependencyGraph>) -> ExecutionFuture<ExecutionSummary> {
        ExecutionFuture::ready(self.run(&graph))
    }
}
