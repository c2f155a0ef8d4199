use crate::{
    context::CycleContext,
    error::ExecutionError,
    executor::{ExecutionSummary, guard::CompletionGuard},
    future::ExecutionFuture,
    graph::DependencyGraph,
    job::{
        CacheSelectHint, CalculationJob, CalculationJobItem, CalculationJobResult,
        CalculationJobSpecification, Cancelable, JobResultReceiver,
    },
    log::AggregatedExecutionLog,
    plan::ExecutionPlan,
    results::{DependencyNodeJobExecutionResult, DependencyNodeJobExecutionResultCache},
    statistics::StatisticsSink,
    types::{FragmentId, HashMap, NodeId},
    utils::DurationNanos,
};
use core::{
    sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering, fence},
    time::Duration,
};
use derive_more::Debug;
use parking_lot::Mutex;
use rustc_hash::FxBuildHasher;
use std::{
    sync::{Arc, OnceLock, Weak},
    time::Instant,
};
use tracing::{debug, error, info, warn};
use unzip3::Unzip3;

const NOT_STARTED: u8 = 0;
const EXECUTING: u8 = 1;
const FINISHED: u8 = 2;
const CANCELLED: u8 = 3;

const PENDING: u8 = 0;
const SUBMITTED: u8 = 1;
const COMPLETED: u8 = 2;

/// One fragment of a plan, bound to this run's graph.
#[derive(Debug)]
struct FragmentLayout {
    id: FragmentId,
    nodes: Vec<NodeId>,
    cache_hint: CacheSelectHint,
    /// Indexes of the fragments waiting on this one.
    outputs: Vec<usize>,
    /// Indexes of the fragments dispatched together with this one.
    tail: Vec<usize>,
}

#[derive(Debug)]
#[repr(align(128))]
struct BlockSlot {
    /// Input fragments that haven't completed yet.
    inputs_left: AtomicUsize,
}

/// A dispatched job, or a tail job travelling inside one.
#[derive(Debug)]
struct ExecutingJob {
    fragment: usize,
    #[debug(skip)]
    cancel: Arc<DeferredCancel>,
}

/// Cancel handle shared by a job and its tail, available before the
/// dispatcher has returned the real one.
#[derive(Debug, Default)]
pub(crate) struct DeferredCancel {
    #[debug(skip)]
    handle: OnceLock<Arc<dyn Cancelable>>,
    cancelled: Mutex<Option<bool>>,
}

impl DeferredCancel {
    /// Binds the dispatcher's handle. A cancel that came first is replayed on
    /// it once.
    pub(crate) fn attach(&self, handle: Arc<dyn Cancelable>) {
        let cancelled = self.cancelled.lock();
        if self.handle.set(handle).is_err() {
            return;
        }
        if let Some(may_interrupt) = *cancelled {
            drop(cancelled);
            if let Some(handle) = self.handle.get() {
                handle.cancel(may_interrupt);
            }
        }
    }
}

impl Cancelable for DeferredCancel {
    fn cancel(&self, may_interrupt: bool) -> bool {
        let mut cancelled = self.cancelled.lock();
        *cancelled = Some(may_interrupt);
        let handle = self.handle.get().cloned();
        drop(cancelled);
        handle.is_none_or(|handle| handle.cancel(may_interrupt))
    }
}

/// Run state of one plan against one graph instance.
///
/// Fragment readiness is tracked with one counter per fragment, decremented by
/// each completing input. Whoever brings a counter to zero submits that
/// fragment. Results may arrive on many dispatcher threads at once; which of
/// them completes the run is decided by a [`CompletionGuard`].
#[derive(Debug)]
pub(crate) struct PlanExecutor {
    #[debug(skip)]
    this: Weak<Self>,
    graph: Arc<DependencyGraph>,
    cycle: Arc<CycleContext>,
    #[debug(skip)]
    statistics: Option<Arc<dyn StatisticsSink>>,
    results: Arc<DependencyNodeJobExecutionResultCache>,
    fragments: Vec<FragmentLayout>,
    blocks: Vec<BlockSlot>,
    statuses: Vec<AtomicU8>,
    remaining: AtomicUsize,
    jobs: Mutex<HashMap<CalculationJobSpecification, ExecutingJob>>,
    state: AtomicU8,
    guard: CompletionGuard,
    job_count: AtomicUsize,
    node_count: AtomicUsize,
    execution_nanos: AtomicU64,
    started: OnceLock<Instant>,
    future: ExecutionFuture<ExecutionSummary>,
}

impl PlanExecutor {
    pub(crate) fn new(
        plan: &ExecutionPlan,
        graph: Arc<DependencyGraph>,
        cycle: Arc<CycleContext>,
        statistics: Option<Arc<dyn StatisticsSink>>,
    ) -> Arc<Self> {
        let (fragments, blocks, statuses) = instantiate(plan);
        let results = cycle
            .job_results()
            .get_or_create(graph.calculation_configuration_arc());
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            graph,
            cycle,
            statistics,
            results,
            remaining: AtomicUsize::new(fragments.len()),
            fragments,
            blocks,
            statuses,
            jobs: Mutex::new(HashMap::default()),
            state: AtomicU8::new(NOT_STARTED),
            guard: CompletionGuard::new(),
            job_count: AtomicUsize::new(0),
            node_count: AtomicUsize::new(0),
            execution_nanos: AtomicU64::new(0),
            started: OnceLock::new(),
            future: ExecutionFuture::pending(),
        })
    }

    /// Submits every fragment without inputs. Completes at once when there is
    /// nothing to run.
    ///
    /// # Panics
    /// If called twice.
    pub(crate) fn start(self: Arc<Self>) -> ExecutionFuture<ExecutionSummary> {
        let started = self
            .state
            .compare_exchange(NOT_STARTED, EXECUTING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        assert!(started, "PlanExecutor::start: [1]");
        self.started.get_or_init(Instant::now);
        let future = self.future.clone();
        future.on_cancel({
            let run = self.clone();
            move || run.cancel_jobs()
        });
        info!(
            calculation_configuration = self.graph.calculation_configuration(),
            run = %self.cycle.run_id(),
            fragments = self.fragments.len(),
            nodes = self.graph.len(),
            "executing dependency graph",
        );
        if self.fragments.is_empty() {
            self.finish();
            return future;
        }
        self.guard.enter();
        for (idx, block) in self.blocks.iter().enumerate() {
            if block.inputs_left.load(Ordering::Acquire) == 0 {
                self.submit(idx);
            }
        }
        if self
            .guard
            .exit(|| self.remaining.load(Ordering::Acquire) == 0)
        {
            self.finish();
        }
        future
    }

    fn is_executing(&self) -> bool {
        self.state.load(Ordering::Acquire) == EXECUTING
    }

    /// Moves a fragment from pending to submitted. Only one caller wins.
    fn claim(&self, idx: usize) -> bool {
        self.statuses[idx]
            .compare_exchange(PENDING, SUBMITTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn submit(&self, idx: usize) {
        if !self.claim(idx) {
            // Already travelling as some other fragment's tail.
            return;
        }
        let cancel = Arc::new(DeferredCancel::default());
        let job = {
            let mut jobs = self.jobs.lock();
            // Checked under the job lock so that a concurrent cancellation
            // either stops us here or finds every entry registered below.
            if !self.is_executing() {
                return;
            }
            self.build_job(idx, &cancel, &mut jobs)
        };
        debug!(
            fragment = %self.fragments[idx].id,
            job = %job.specification.job_id,
            items = job.items.len(),
            tail = job.tail.len(),
            "submitting fragment",
        );
        let receiver: Arc<dyn JobResultReceiver> =
            self.this.upgrade().expect("PlanExecutor::submit: [1]");
        match self.cycle.dispatcher().dispatch(job, receiver) {
            Ok(handle) => cancel.attach(handle),
            Err(err) => {
                error!(fragment = %self.fragments[idx].id, %err, "dispatch failed, aborting run");
                self.fail(err.into());
            }
        }
    }

    /// Registers the job of `idx` and of every tail fragment not yet claimed,
    /// all sharing `cancel`.
    fn build_job(
        &self,
        idx: usize,
        cancel: &Arc<DeferredCancel>,
        jobs: &mut HashMap<CalculationJobSpecification, ExecutingJob>,
    ) -> CalculationJob {
        let layout = &self.fragments[idx];
        let specification = self
            .cycle
            .next_job_specification(self.graph.calculation_configuration_arc());
        jobs.insert(
            specification.clone(),
            ExecutingJob {
                fragment: idx,
                cancel: cancel.clone(),
            },
        );
        let tail = layout
            .tail
            .iter()
            .filter(|&&tail| self.claim(tail))
            .map(|&tail| self.build_job(tail, cancel, jobs))
            .collect();
        CalculationJob {
            specification,
            items: self.job_items(layout),
            cache_hint: layout.cache_hint.clone(),
            tail,
        }
    }

    fn job_items(&self, layout: &FragmentLayout) -> Vec<CalculationJobItem> {
        layout
            .nodes
            .iter()
            .filter_map(|&id| self.graph.node(id))
            .map(|node| {
                let inputs = self.graph.input_values(node.id()).cloned().collect();
                node.job_item(inputs, self.cycle.log_modes().log_mode(node))
            })
            .collect()
    }

    fn job_completed(&self, idx: usize, result: &CalculationJobResult) {
        let layout = &self.fragments[idx];
        let transitioned = self.statuses[idx]
            .compare_exchange(SUBMITTED, COMPLETED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        assert!(transitioned, "PlanExecutor::job_completed: [1]");
        self.record(layout, result);
        self.job_count.fetch_add(1, Ordering::Relaxed);
        self.node_count.fetch_add(result.items.len(), Ordering::Relaxed);
        self.execution_nanos
            .fetch_add(result.duration.as_nanos_u64(), Ordering::Relaxed);

        if !layout.outputs.is_empty() {
            fence(Ordering::Release);
        }
        let mut ready = Vec::new();
        for &output in &layout.outputs {
            if self.blocks[output]
                .inputs_left
                .fetch_sub(1, Ordering::Relaxed)
                == 1
            {
                ready.push(output);
            }
        }
        if !ready.is_empty() {
            fence(Ordering::Acquire);
        }
        for output in ready {
            self.submit(output);
        }
        self.remaining.fetch_sub(1, Ordering::AcqRel);
    }

    /// Stores per-value results, reports timings and notifies the cycle's
    /// listener.
    fn record(&self, layout: &FragmentLayout, result: &CalculationJobResult) {
        if layout.nodes.len() != result.items.len() {
            warn!(
                job = %result.specification.job_id,
                expected = layout.nodes.len(),
                received = result.items.len(),
                "job result item count does not match the fragment",
            );
        }
        for (&id, item) in layout.nodes.iter().zip(&result.items) {
            let Some(node) = self.graph.node(id) else {
                continue;
            };
            let mut inputs: Vec<Arc<AggregatedExecutionLog>> = Vec::new();
            for produced in self
                .graph
                .input_values(id)
                .filter_map(|value| self.results.get(value))
            {
                if !inputs.iter().any(|log| Arc::ptr_eq(log, produced.log())) {
                    inputs.push(produced.log().clone());
                }
            }
            let log = AggregatedExecutionLog::new(
                id,
                &item.log,
                inputs,
                self.cycle.log_modes().log_mode(node),
            );
            let execution = Arc::new(DependencyNodeJobExecutionResult::new(
                result.compute_node_id.clone(),
                item.clone(),
                Arc::new(log),
            ));
            for output in node.outputs() {
                self.results.put(output.clone(), execution.clone());
            }
        }
        if let Some(statistics) = &self.statistics {
            statistics.job_executed(&result.compute_node_id, result.items.len(), result.duration);
        }
        if let Some(listener) = self.cycle.result_listener() {
            listener.execution_result(&layout.nodes, result);
        }
    }

    fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            calculation_configuration: self.graph.calculation_configuration_arc().clone(),
            node_count: self.node_count.load(Ordering::Relaxed),
            job_count: self.job_count.load(Ordering::Relaxed),
            execution_time: Duration::from_nanos(self.execution_nanos.load(Ordering::Relaxed)),
            duration: self
                .started
                .get()
                .map_or(Duration::ZERO, Instant::elapsed),
        }
    }

    fn finish(&self) {
        if self
            .state
            .compare_exchange(EXECUTING, FINISHED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let summary = self.summary();
        info!(
            calculation_configuration = self.graph.calculation_configuration(),
            run = %self.cycle.run_id(),
            jobs = summary.job_count,
            nodes = summary.node_count,
            duration = ?summary.duration,
            "dependency graph executed",
        );
        if let Some(statistics) = &self.statistics {
            statistics.graph_executed(
                self.graph.calculation_configuration(),
                summary.node_count,
                summary.execution_time,
                summary.duration,
            );
        }
        self.future.complete(Ok(summary));
    }

    fn fail(&self, err: ExecutionError) {
        if self
            .state
            .compare_exchange(EXECUTING, FINISHED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.cancel_outstanding();
        self.future.complete(Err(err));
    }

    /// Cancellation hook of the run's future. The state transition decides
    /// between cancellation and a concurrent finish or failure.
    fn cancel_jobs(&self) -> bool {
        if self
            .state
            .compare_exchange(EXECUTING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        info!(
            calculation_configuration = self.graph.calculation_configuration(),
            run = %self.cycle.run_id(),
            "cancelling dependency graph execution",
        );
        self.cancel_outstanding();
        true
    }

    fn cancel_outstanding(&self) {
        let jobs: Vec<ExecutingJob> = self.jobs.lock().drain().map(|(_, job)| job).collect();
        for job in jobs {
            debug!(fragment = %self.fragments[job.fragment].id, "cancelling job");
            job.cancel.cancel(true);
        }
    }
}

impl JobResultReceiver for PlanExecutor {
    fn result_received(&self, result: CalculationJobResult) {
        self.guard.enter();
        let job = self.jobs.lock().remove(&result.specification);
        match job {
            Some(job) => self.job_completed(job.fragment, &result),
            None if !self.is_executing() => {
                debug!(job = %result.specification.job_id, "result arrived after the run ended");
            }
            None => {
                warn!(
                    job = %result.specification.job_id,
                    calculation_configuration = %result.specification.calculation_configuration,
                    "result for unknown or already completed job ignored",
                );
            }
        }
        if self
            .guard
            .exit(|| self.remaining.load(Ordering::Acquire) == 0)
        {
            self.finish();
        }
    }
}

/// Binds a plan's fragments to positions, output and tail links to indexes.
fn instantiate(plan: &ExecutionPlan) -> (Vec<FragmentLayout>, Vec<BlockSlot>, Vec<AtomicU8>) {
    match plan {
        ExecutionPlan::Single(single) if single.nodes().is_empty() => {
            (Vec::new(), Vec::new(), Vec::new())
        }
        ExecutionPlan::Single(single) => (
            vec![FragmentLayout {
                id: FragmentId(1),
                nodes: single.nodes().to_vec(),
                cache_hint: single.cache_hint().clone(),
                outputs: Vec::new(),
                tail: Vec::new(),
            }],
            vec![BlockSlot {
                inputs_left: AtomicUsize::new(0),
            }],
            vec![AtomicU8::new(PENDING)],
        ),
        ExecutionPlan::Multiple(multiple) => {
            let fragments = multiple.fragments();
            let index: HashMap<FragmentId, usize> = fragments
                .keys()
                .enumerate()
                .map(|(idx, &id)| (id, idx))
                .collect();
            let positions = |ids: &[FragmentId]| -> Vec<usize> {
                let mut positions: Vec<usize> =
                    ids.iter().filter_map(|id| index.get(id).copied()).collect();
                positions.sort_unstable();
                positions
            };
            let mut inputs_left: HashMap<usize, usize> =
                HashMap::with_capacity_and_hasher(fragments.len(), FxBuildHasher);
            for descriptor in fragments.values() {
                for output in positions(descriptor.outputs()) {
                    *inputs_left.entry(output).or_default() += 1;
                }
            }
            fragments
                .iter()
                .enumerate()
                .map(|(idx, (&id, descriptor))| {
                    let layout = FragmentLayout {
                        id,
                        nodes: descriptor.nodes().to_vec(),
                        cache_hint: descriptor.cache_hint().clone(),
                        outputs: positions(descriptor.outputs()),
                        tail: positions(descriptor.tail()),
                    };
                    let block = BlockSlot {
                        inputs_left: AtomicUsize::new(
                            inputs_left.get(&idx).copied().unwrap_or_default(),
                        ),
                    };
                    (layout, block, AtomicU8::new(PENDING))
                })
                .unzip3()
        }
    }
}
