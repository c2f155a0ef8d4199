//! Executor factories: given a cycle, produce an executor bound to it.

pub mod tuner;

use crate::{
    config::JobSizing,
    context::CycleContext,
    error::{ConfigError, GraphError},
    executor::{BatchExecutor, DependencyGraphExecutor, ExecutionSummary},
    fragment::{FragmentPartitioner, NodeCostEstimator, UniformCost},
    future::ExecutionFuture,
    graph::{self, DependencyGraph, NodeKey},
    plan::ExecutionPlan,
    types::{HashMap, NodeId},
};
use derive_more::Debug;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, info};

pub trait DependencyGraphExecutorFactory: Send + Sync {
    fn create_executor(&self, cycle: Arc<CycleContext>) -> Arc<dyn DependencyGraphExecutor>;
}

fn run_plan(
    plan: Result<ExecutionPlan, GraphError>,
    graph: Arc<DependencyGraph>,
    cycle: &Arc<CycleContext>,
) -> ExecutionFuture<ExecutionSummary> {
    match plan {
        Ok(plan) => plan.run(graph, cycle, cycle.statistics().cloned()),
        Err(err) => ExecutionFuture::ready(Err(err.into())),
    }
}

/// Sends every graph as one job.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleNodeExecutorFactory;

#[derive(Debug)]
struct SingleNodeExecutor {
    cycle: Arc<CycleContext>,
}

impl DependencyGraphExecutor for SingleNodeExecutor {
    fn execute(&self, graph: Arc<DependencyGraph>) -> ExecutionFuture<ExecutionSummary> {
        run_plan(ExecutionPlan::single(&graph), graph, &self.cycle)
    }
}

impl DependencyGraphExecutorFactory for SingleNodeExecutorFactory {
    fn create_executor(&self, cycle: Arc<CycleContext>) -> Arc<dyn DependencyGraphExecutor> {
        Arc::new(SingleNodeExecutor { cycle })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PlanKey {
    calculation_configuration: Arc<str>,
    structure: u64,
}

#[derive(Debug)]
struct CachedPlan {
    plan: Arc<ExecutionPlan>,
    /// Node keys of the graph the plan was built from.
    node_keys: HashMap<NodeId, NodeKey>,
}

#[derive(Debug, Default)]
struct PlanCache {
    /// Bumped on every invalidation; plans built under an older generation
    /// are not stored.
    generation: u64,
    plans: HashMap<PlanKey, CachedPlan>,
}

#[derive(Debug)]
struct Shared {
    sizing: RwLock<JobSizing>,
    #[debug(skip)]
    cost: Arc<dyn NodeCostEstimator>,
    plans: Mutex<PlanCache>,
}

/// Splits graphs into many jobs according to tunable job sizing.
///
/// Partitioning is the expensive part of planning, so plans are cached per
/// calculation configuration and graph structure, and rebound onto each new
/// graph instance. Changing any sizing parameter drops the cache.
///
/// Clones share parameters and plan cache.
#[derive(Debug, Clone)]
pub struct MultipleNodeExecutorFactory {
    shared: Arc<Shared>,
}

impl Default for MultipleNodeExecutorFactory {
    fn default() -> Self {
        Self::with_cost_estimator(JobSizing::default(), Arc::new(UniformCost::default()))
    }
}

impl MultipleNodeExecutorFactory {
    /// # Errors
    /// If `sizing` is invalid.
    pub fn new(sizing: JobSizing) -> Result<Self, ConfigError> {
        sizing.validate()?;
        Ok(Self::with_cost_estimator(
            sizing,
            Arc::new(UniformCost::default()),
        ))
    }

    pub fn with_cost_estimator(sizing: JobSizing, cost: Arc<dyn NodeCostEstimator>) -> Self {
        Self {
            shared: Arc::new(Shared {
                sizing: RwLock::new(sizing),
                cost,
                plans: Mutex::new(PlanCache::default()),
            }),
        }
    }

    #[must_use]
    pub fn sizing(&self) -> JobSizing {
        *self.shared.sizing.read()
    }

    pub fn set_minimum_job_items(&self, value: usize) {
        self.update(|sizing| sizing.minimum_job_items = value);
    }

    pub fn set_maximum_job_items(&self, value: usize) {
        self.update(|sizing| sizing.maximum_job_items = value);
    }

    pub fn set_minimum_job_cost(&self, value: u64) {
        self.update(|sizing| sizing.minimum_job_cost = value);
    }

    pub fn set_maximum_job_cost(&self, value: u64) {
        self.update(|sizing| sizing.maximum_job_cost = value);
    }

    pub fn set_maximum_concurrency(&self, value: usize) {
        self.update(|sizing| sizing.maximum_concurrency = value);
    }

    fn update(&self, apply: impl FnOnce(&mut JobSizing)) {
        let mut sizing = self.shared.sizing.write();
        let previous = *sizing;
        apply(&mut sizing);
        if *sizing != previous {
            info!(?previous, current = ?*sizing, "job sizing changed, invalidating cached plans");
            self.invalidate_plans();
        }
    }

    pub fn invalidate_plans(&self) {
        let mut cache = self.shared.plans.lock();
        cache.generation += 1;
        cache.plans.clear();
    }

    #[must_use]
    pub fn cached_plan_count(&self) -> usize {
        self.shared.plans.lock().plans.len()
    }

    /// The plan for `graph`: single-fragment for small graphs, otherwise a
    /// cached multi-fragment plan rebound to `graph`, or a freshly
    /// partitioned one.
    ///
    /// # Errors
    /// If the graph contains cycle(s).
    pub fn plan(&self, graph: &DependencyGraph) -> Result<ExecutionPlan, GraphError> {
        let sizing = self.sizing();
        let generation = self.shared.plans.lock().generation;
        let partitioner = FragmentPartitioner::new(sizing, self.shared.cost.clone());
        if graph.len() <= sizing.minimum_job_items
            || partitioner.estimate(graph) < sizing.minimum_job_cost
        {
            return ExecutionPlan::single(graph);
        }

        let node_keys = graph.node_keys()?;
        let key = PlanKey {
            calculation_configuration: graph.calculation_configuration_arc().clone(),
            structure: graph.structure_key_of(&node_keys),
        };
        if let Some(plan) = self.cached(&key, &node_keys) {
            return Ok(plan);
        }

        let tree = partitioner.partition(graph)?;
        let plan = Arc::new(ExecutionPlan::from(&tree));
        debug!(
            calculation_configuration = graph.calculation_configuration(),
            fragments = plan.fragment_count(),
            "partitioned dependency graph",
        );
        let mut cache = self.shared.plans.lock();
        if cache.generation == generation {
            cache.plans.insert(
                key,
                CachedPlan {
                    plan: plan.clone(),
                    node_keys,
                },
            );
        }
        drop(cache);
        Ok(Arc::unwrap_or_clone(plan))
    }

    fn cached(&self, key: &PlanKey, node_keys: &HashMap<NodeId, NodeKey>) -> Option<ExecutionPlan> {
        let cache = self.shared.plans.lock();
        let cached = cache.plans.get(key)?;
        let plan = cached.plan.clone();
        let index = graph::key_index(node_keys);
        let mapping: HashMap<NodeId, NodeId> = cached
            .node_keys
            .iter()
            .filter_map(|(&source, key)| index.get(key).map(|&target| (source, target)))
            .collect();
        drop(cache);
        debug!(calculation_configuration = %key.calculation_configuration, "reusing cached plan");
        if mapping.iter().all(|(source, target)| source == target)
            && mapping.len() == node_keys.len()
        {
            Some(Arc::unwrap_or_clone(plan))
        } else {
            Some(plan.with_nodes(&mapping))
        }
    }
}

#[derive(Debug)]
struct MultipleNodeExecutor {
    factory: MultipleNodeExecutorFactory,
    cycle: Arc<CycleContext>,
}

impl DependencyGraphExecutor for MultipleNodeExecutor {
    fn execute(&self, graph: Arc<DependencyGraph>) -> ExecutionFuture<ExecutionSummary> {
        run_plan(self.factory.plan(&graph), graph, &self.cycle)
    }
}

impl DependencyGraphExecutorFactory for MultipleNodeExecutorFactory {
    fn create_executor(&self, cycle: Arc<CycleContext>) -> Arc<dyn DependencyGraphExecutor> {
        Arc::new(MultipleNodeExecutor {
            factory: self.clone(),
            cycle,
        })
    }
}

/// Wraps executors of another factory into a [`BatchExecutor`].
#[derive(Debug)]
pub struct BatchExecutorFactory {
    #[debug(skip)]
    inner: Arc<dyn DependencyGraphExecutorFactory>,
}

impl BatchExecutorFactory {
    pub fn new(inner: Arc<dyn DependencyGraphExecutorFactory>) -> Self {
        Self { inner }
    }
}

impl DependencyGraphExecutorFactory for BatchExecutorFactory {
    fn create_executor(&self, cycle: Arc<CycleContext>) -> Arc<dyn DependencyGraphExecutor> {
        Arc::new(BatchExecutor::new(self.inner.create_executor(cycle)))
    }
}
