//! The interface to the remote job dispatcher.
//!
//! A [`CalculationJob`] is an ordered set of node invocations plus the
//! specification identifying it; the dispatcher runs it on some compute node
//! and reports a [`CalculationJobResult`] to the supplied
//! [`JobResultReceiver`], on a thread of its choosing. Tail jobs travel inside
//! their predecessor and run on the same compute node without another dispatch
//! round-trip, but still report their own result.

use crate::{
    context::VersionCorrection,
    error::DispatchError,
    graph::ComputationTarget,
    log::{ExecutionLog, ExecutionLogMode},
    types::{JobId, NodeId, RunId, ValueSpecification},
};
use core::time::Duration;
use std::{sync::Arc, time::SystemTime};

/// Identifies one job of one cycle and calculation configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CalculationJobSpecification {
    pub run_id: RunId,
    pub calculation_configuration: Arc<str>,
    pub valuation_time: SystemTime,
    pub version_correction: VersionCorrection,
    pub job_id: JobId,
}

/// Which of a job's values go to the compute node's private cache and which
/// are published to the shared cache.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum CacheSelectHint {
    #[default]
    AllShared,
    AllPrivate,
    /// Values listed are private, everything else is shared. Sorted.
    PrivateValues(Arc<[ValueSpecification]>),
    /// Values listed are shared, everything else is private. Sorted.
    SharedValues(Arc<[ValueSpecification]>),
}

impl CacheSelectHint {
    /// Picks the most compact encoding for the given split.
    #[must_use]
    pub fn from_split(
        mut private: Vec<ValueSpecification>,
        mut shared: Vec<ValueSpecification>,
    ) -> Self {
        if private.is_empty() {
            Self::AllShared
        } else if shared.is_empty() {
            Self::AllPrivate
        } else if private.len() <= shared.len() {
            private.sort_unstable();
            Self::PrivateValues(private.into())
        } else {
            shared.sort_unstable();
            Self::SharedValues(shared.into())
        }
    }

    #[must_use]
    pub fn is_private(&self, value: &ValueSpecification) -> bool {
        match self {
            Self::AllShared => false,
            Self::AllPrivate => true,
            Self::PrivateValues(values) => values.binary_search(value).is_ok(),
            Self::SharedValues(values) => values.binary_search(value).is_err(),
        }
    }
}

/// One node invocation within a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalculationJobItem {
    pub node: NodeId,
    pub function: Arc<str>,
    pub parameters: Arc<str>,
    pub target: ComputationTarget,
    pub inputs: Vec<ValueSpecification>,
    pub outputs: Vec<ValueSpecification>,
    pub log_mode: ExecutionLogMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalculationJob {
    pub specification: CalculationJobSpecification,
    pub items: Vec<CalculationJobItem>,
    pub cache_hint: CacheSelectHint,
    /// Jobs to run on the same compute node once this one finishes.
    pub tail: Vec<CalculationJob>,
}

impl CalculationJob {
    /// This job and every tail job, depth first.
    pub fn flatten(&self) -> Vec<&CalculationJob> {
        let mut jobs = Vec::new();
        let mut stack = vec![self];
        while let Some(job) = stack.pop() {
            jobs.push(job);
            stack.extend(job.tail.iter().rev());
        }
        jobs
    }
}

/// What a compute node reports for one job item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalculationJobResultItem {
    pub log: ExecutionLog,
}

/// Result of one job, items in the order of the job's items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalculationJobResult {
    pub specification: CalculationJobSpecification,
    pub compute_node_id: Arc<str>,
    pub duration: Duration,
    pub items: Vec<CalculationJobResultItem>,
}

/// Something that can be cancelled: a dispatched job or a graph execution.
pub trait Cancelable: Send + Sync {
    /// Returns `false` when there was nothing left to cancel.
    fn cancel(&self, may_interrupt: bool) -> bool;
}

/// Receives job results. Called from dispatcher threads, possibly many at
/// once for different jobs.
pub trait JobResultReceiver: Send + Sync {
    fn result_received(&self, result: CalculationJobResult);
}

/// Accepts jobs for execution on remote compute nodes.
pub trait JobDispatcher: Send + Sync {
    /// Dispatches `job` and its tail. The receiver gets one result per job,
    /// tail jobs included.
    ///
    /// # Errors
    /// If the job cannot be accepted.
    fn dispatch(
        &self,
        job: CalculationJob,
        receiver: Arc<dyn JobResultReceiver>,
    ) -> Result<Arc<dyn Cancelable>, DispatchError>;
}
