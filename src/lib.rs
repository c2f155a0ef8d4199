//! Execution engine for dependency graphs distributed across remote compute
//! nodes.
//!
//! Given a compiled dependency graph for one valuation cycle, this crate:
//! - Partitions the graph into fragments, each dispatched to a compute node as
//!   one job, optionally chaining "tail" fragments onto the same node.
//! - Caches the resulting execution plans and rebinds them onto structurally
//!   identical graphs of later cycles instead of partitioning again.
//! - Drives a plan by submitting executable fragments through a job dispatcher
//!   and advancing the fragment DAG as results arrive on dispatcher threads.
//! - Completes a cancelable, listenable handle exactly once, however results
//!   race each other.
//!
//! Key modules:
//! - `graph`: the consumed dependency-graph model.
//! - `fragment` and `plan`: partitioning and reusable plans.
//! - `executor`: the plan executor and the staged batch executor.
//! - `factory`: per-cycle executor construction, plan caching and tuning.
//! - `job`: the dispatcher interface.
//!
//! Quick start:
//! 1. Implement `JobDispatcher` on top of your compute-node transport.
//! 2. Build a `CycleContext` for the cycle.
//! 3. Ask a `DependencyGraphExecutorFactory` for an executor, call `execute`
//!    with the graph, then wait on or listen to the returned `ExecutionFuture`.

/// Capabilities advertised by job invokers.
pub mod capability;
/// Job sizing and tuner settings.
pub mod config;
/// Per-cycle context: run identity, dispatcher, log modes, result caches.
pub mod context;
/// Error types of planning, dispatch and execution.
pub mod error;
/// Graph executors.
///
/// The plan executor submits fragments as their inputs complete and decides
/// run completion with an atomic guard; the batch executor runs target-type
/// stages with barriers between them.
pub mod executor;
/// Executor factories and the tuner adjusting their job sizing.
pub mod factory;
/// Graph partitioning into job-sized fragments.
pub mod fragment;
/// Cancelable, listenable completion handle.
pub mod future;
/// The consumed dependency-graph model.
pub mod graph;
/// Calculation jobs and the dispatcher interface.
pub mod job;
/// Execution logs and log-detail modes.
pub mod log;
/// Reusable execution plans.
pub mod plan;
/// Per-configuration caches of job results by produced value.
pub mod results;
/// Decaying execution statistics and the sink executors report to.
pub mod statistics;
mod sync;
/// Identifiers and common aliases.
pub mod types;
mod utils;
