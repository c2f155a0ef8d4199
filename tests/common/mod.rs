#![allow(dead_code)]

use fge::{
    context::CycleContext,
    error::DispatchError,
    graph::{ComputationTarget, ComputationTargetType, DependencyGraph, DependencyNode},
    job::{
        CalculationJob, CalculationJobResult, CalculationJobResultItem, CalculationJobSpecification,
        Cancelable, JobDispatcher, JobResultReceiver,
    },
    log::ExecutionLog,
    types::{JobId, NodeId, RunId, TargetId, ValueSpecification},
};
use parking_lot::Mutex;
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

pub const CONFIGURATION: &str = "Default";

pub fn value(node: u32) -> ValueSpecification {
    ValueSpecification::new(format!("v{node}"), TargetId::new("P"))
}

/// Primitive graph where `edges[i]` lists the inputs of node `offset + i + 1`.
/// The outputs of nodes nobody consumes are terminal.
pub fn graph_with_offset(edges: &[&[u32]], offset: u32) -> DependencyGraph {
    let target = ComputationTarget::new(ComputationTargetType::Primitive, "P");
    let mut builder = DependencyGraph::builder(CONFIGURATION);
    let mut consumed = Vec::new();
    for (idx, inputs) in edges.iter().enumerate() {
        let local = u32::try_from(idx + 1).unwrap();
        consumed.extend_from_slice(inputs);
        builder.add_node(
            DependencyNode::new(NodeId(offset + local), format!("f{local}"), target.clone())
                .with_inputs(inputs.iter().map(|&input| NodeId(offset + input)))
                .with_outputs([value(local)]),
        );
    }
    for local in 1..=u32::try_from(edges.len()).unwrap() {
        if !consumed.contains(&local) {
            builder.add_terminal_output(value(local));
        }
    }
    builder.build()
}

pub fn graph(edges: &[&[u32]]) -> DependencyGraph {
    graph_with_offset(edges, 0)
}

/// `sources` independent nodes all feeding one sink.
pub fn fan_in(sources: u32) -> DependencyGraph {
    let inputs: Vec<u32> = (1..=sources).collect();
    let source: &[u32] = &[];
    let mut edges = vec![source; sources as usize];
    edges.push(&inputs);
    graph(&edges)
}

pub fn cycle(dispatcher: Arc<dyn JobDispatcher>) -> Arc<CycleContext> {
    CycleContext::builder(RunId(1), dispatcher).build()
}

/// Successful result for every item of `job`.
pub fn success(job: &CalculationJob, compute_node: &str) -> CalculationJobResult {
    CalculationJobResult {
        specification: job.specification.clone(),
        compute_node_id: Arc::from(compute_node),
        duration: Duration::from_millis(1),
        items: job
            .items
            .iter()
            .map(|_| CalculationJobResultItem {
                log: ExecutionLog::default(),
            })
            .collect(),
    }
}

#[derive(Debug, Default)]
pub struct CountingHandle {
    pub cancels: AtomicUsize,
}

impl Cancelable for CountingHandle {
    fn cancel(&self, _may_interrupt: bool) -> bool {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        true
    }
}

struct Dispatched {
    job: CalculationJob,
    receiver: Arc<dyn JobResultReceiver>,
    handle: Arc<CountingHandle>,
}

/// Keeps every dispatched job until the test completes it by hand.
#[derive(Default)]
pub struct ScriptedDispatcher {
    dispatched: Mutex<Vec<Dispatched>>,
    reject: Mutex<Option<DispatchError>>,
}

impl ScriptedDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reject_with(&self, err: DispatchError) {
        *self.reject.lock() = Some(err);
    }

    /// Jobs dispatched so far, tail jobs not flattened.
    pub fn dispatch_count(&self) -> usize {
        self.dispatched.lock().len()
    }

    /// Node ids of every dispatched job, tails flattened, in dispatch order.
    pub fn dispatched_nodes(&self) -> Vec<Vec<NodeId>> {
        self.dispatched
            .lock()
            .iter()
            .flat_map(|dispatched| dispatched.job.flatten())
            .map(|job| job.items.iter().map(|item| item.node).collect())
            .collect()
    }

    pub fn job(&self, idx: usize) -> CalculationJob {
        self.dispatched.lock()[idx].job.clone()
    }

    pub fn handle(&self, idx: usize) -> Arc<CountingHandle> {
        self.dispatched.lock()[idx].handle.clone()
    }

    /// Reports success for dispatch `idx` and each of its tail jobs.
    pub fn complete(&self, idx: usize) {
        let (job, receiver) = {
            let dispatched = self.dispatched.lock();
            (dispatched[idx].job.clone(), dispatched[idx].receiver.clone())
        };
        for job in job.flatten() {
            receiver.result_received(success(job, "cn-1"));
        }
    }

    /// Sends a result for a job nobody dispatched.
    pub fn complete_unknown(&self, idx: usize) {
        let (mut job, receiver) = {
            let dispatched = self.dispatched.lock();
            (dispatched[idx].job.clone(), dispatched[idx].receiver.clone())
        };
        job.specification = CalculationJobSpecification {
            job_id: JobId(u64::MAX),
            ..job.specification
        };
        receiver.result_received(success(&job, "cn-1"));
    }

    /// Completes dispatched jobs in order until nothing is left.
    pub fn complete_all(&self) {
        let mut next = 0;
        while next < self.dispatch_count() {
            self.complete(next);
            next += 1;
        }
    }
}

impl JobDispatcher for ScriptedDispatcher {
    fn dispatch(
        &self,
        job: CalculationJob,
        receiver: Arc<dyn JobResultReceiver>,
    ) -> Result<Arc<dyn Cancelable>, DispatchError> {
        if let Some(err) = self.reject.lock().clone() {
            return Err(err);
        }
        let handle = Arc::new(CountingHandle::default());
        self.dispatched.lock().push(Dispatched {
            job,
            receiver,
            handle: handle.clone(),
        });
        Ok(handle)
    }
}

/// Completes every job synchronously inside `dispatch`, recording the order in
/// which node ids were dispatched.
#[derive(Default)]
pub struct ImmediateDispatcher {
    pub order: Mutex<Vec<Vec<NodeId>>>,
    reject_containing: Mutex<Option<NodeId>>,
}

impl ImmediateDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Rejects any job that contains `node`.
    pub fn reject_containing(&self, node: NodeId) {
        *self.reject_containing.lock() = Some(node);
    }
}

impl JobDispatcher for ImmediateDispatcher {
    fn dispatch(
        &self,
        job: CalculationJob,
        receiver: Arc<dyn JobResultReceiver>,
    ) -> Result<Arc<dyn Cancelable>, DispatchError> {
        let jobs = job.flatten();
        if let Some(node) = *self.reject_containing.lock() {
            if jobs
                .iter()
                .any(|job| job.items.iter().any(|item| item.node == node))
            {
                return Err(DispatchError::Rejected(format!("{node} is blacklisted")));
            }
        }
        for job in jobs {
            self.order
                .lock()
                .push(job.items.iter().map(|item| item.node).collect());
            receiver.result_received(success(job, "cn-immediate"));
        }
        Ok(Arc::new(CountingHandle::default()))
    }
}

/// Completes every job on its own thread after a per-job delay.
pub struct ThreadedDispatcher {
    delays: Vec<Duration>,
    next: AtomicUsize,
}

impl ThreadedDispatcher {
    pub fn new(delays: Vec<Duration>) -> Arc<Self> {
        Arc::new(Self {
            delays,
            next: AtomicUsize::new(0),
        })
    }
}

impl JobDispatcher for ThreadedDispatcher {
    fn dispatch(
        &self,
        job: CalculationJob,
        receiver: Arc<dyn JobResultReceiver>,
    ) -> Result<Arc<dyn Cancelable>, DispatchError> {
        for job in job.flatten() {
            let idx = self.next.fetch_add(1, Ordering::Relaxed);
            let delay = self
                .delays
                .get(idx % self.delays.len().max(1))
                .copied()
                .unwrap_or_default();
            let result = success(job, "cn-threaded");
            let receiver = receiver.clone();
            thread::spawn(move || {
                thread::sleep(delay);
                receiver.result_received(result);
            });
        }
        Ok(Arc::new(CountingHandle::default()))
    }
}
