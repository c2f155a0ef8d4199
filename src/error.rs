use crate::{graph::ComputationTargetType, types::NodeId};
use core::time::Duration;
use std::sync::Arc;
use thiserror::Error;

/// The dependency graph cannot be ordered.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GraphError {
    /// The provided dependency graph contains cycle(s).
    #[error("dependency graph contains cycle(s)")]
    Cycle,
}

/// A graph handed to the batch executor breaks its target-type layering.
///
/// Always a compilation defect upstream; never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StructureError {
    #[error("{node} ({kind}) must not depend on {input} ({input_kind})")]
    IllegalDependency {
        node: NodeId,
        kind: ComputationTargetType,
        input: NodeId,
        input_kind: ComputationTargetType,
    },
    #[error("position {node} must depend on exactly one security node, found {found}")]
    PositionSecurityInputs { node: NodeId, found: usize },
}

/// Reported by a [`JobDispatcher`](crate::job::JobDispatcher) that could not
/// accept a job.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DispatchError {
    #[error("job rejected by dispatcher: {0}")]
    Rejected(String),
    #[error("no compute nodes available")]
    Unavailable,
}

/// Invalid executor or tuner configuration.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("minimum {name} ({minimum}) exceeds maximum ({maximum})")]
    InvertedRange {
        name: &'static str,
        minimum: u64,
        maximum: u64,
    },
    #[error("statistics decay rate {0} is outside [0, 1]")]
    DecayRate(f64),
}

/// Outcome of a failed, cancelled or timed out graph execution.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum ExecutionError {
    #[error("execution was cancelled")]
    Cancelled,
    /// The blocking wait elapsed; the run itself keeps going.
    #[error("timed out after {0:?} waiting for completion")]
    TimedOut(Duration),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Structure(#[from] StructureError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// A delegated sub-execution of a batch stage failed.
    #[error("{stage} stage failed")]
    Stage {
        stage: String,
        #[source]
        source: Arc<ExecutionError>,
    },
}

impl ExecutionError {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut(_))
    }
}
