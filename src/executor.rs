//! Executors: run one dependency graph for one cycle.
//!
//! The plan executor ([`plan`]) drives a fragment DAG through the cycle's job
//! dispatcher as results arrive. The batch executor ([`batch`]) splits a graph
//! into target-type stages and runs each stage through an inner executor.

pub mod batch;
pub(crate) mod plan;

mod guard;

pub use crate::executor::{batch::BatchExecutor, guard::CompletionGuard};
use crate::{future::ExecutionFuture, graph::DependencyGraph};
use core::time::Duration;
use std::sync::Arc;

/// Runs dependency graphs for the cycle it was created for.
pub trait DependencyGraphExecutor: Send + Sync {
    fn execute(&self, graph: Arc<DependencyGraph>) -> ExecutionFuture<ExecutionSummary>;
}

/// What a completed graph execution reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub calculation_configuration: Arc<str>,
    /// Nodes executed, summed over completed jobs.
    pub node_count: usize,
    pub job_count: usize,
    /// Aggregate execution time reported by the compute nodes.
    pub execution_time: Duration,
    /// Wall-clock time from start to completion.
    pub duration: Duration,
}

impl ExecutionSummary {
    pub(crate) fn empty(calculation_configuration: Arc<str>) -> Self {
        Self {
            calculation_configuration,
            node_count: 0,
            job_count: 0,
            execution_time: Duration::ZERO,
            duration: Duration::ZERO,
        }
    }

    /// Adds up the work of a delegated sub-execution. Durations are not
    /// summed; the caller measures its own.
    pub(crate) fn absorb(&mut self, other: &Self) {
        self.node_count += other.node_count;
        self.job_count += other.job_count;
        self.execution_time = self.execution_time.saturating_add(other.execution_time);
    }
}
