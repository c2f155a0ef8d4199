//! Runtime statistics reported by executors and consumed by the tuner.

use crate::{
    types::HashMap,
    utils::{DurationNanos, duration_from_nanos_f64},
};
use core::time::Duration;
use parking_lot::RwLock;
use std::{sync::Arc, time::Instant};

/// Receives statistics as graphs and jobs complete.
pub trait StatisticsSink: Send + Sync {
    /// One graph run completed.
    fn graph_executed(
        &self,
        calculation_configuration: &str,
        node_count: usize,
        execution_time: Duration,
        duration: Duration,
    );

    /// One job completed on `compute_node_id`.
    fn job_executed(&self, compute_node_id: &str, item_count: usize, execution_time: Duration);
}

/// Accumulated, exponentially decaying figures for one calculation
/// configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphExecutionStatistics {
    pub processed_graphs: f64,
    pub executed_nodes: f64,
    pub execution_nanos: f64,
    pub actual_nanos: f64,
    pub last_update: Instant,
}

impl GraphExecutionStatistics {
    fn new(now: Instant) -> Self {
        Self {
            processed_graphs: 0.0,
            executed_nodes: 0.0,
            execution_nanos: 0.0,
            actual_nanos: 0.0,
            last_update: now,
        }
    }

    #[must_use]
    pub fn average_node_count(&self) -> f64 {
        ratio(self.executed_nodes, self.processed_graphs)
    }

    #[must_use]
    pub fn average_execution_time(&self) -> Duration {
        duration_from_nanos_f64(ratio(self.execution_nanos, self.processed_graphs))
    }

    #[must_use]
    pub fn average_duration(&self) -> Duration {
        duration_from_nanos_f64(ratio(self.actual_nanos, self.processed_graphs))
    }

    fn decay(&mut self, keep: f64) {
        self.processed_graphs *= keep;
        self.executed_nodes *= keep;
        self.execution_nanos *= keep;
        self.actual_nanos *= keep;
    }
}

/// Accumulated, exponentially decaying figures for one compute node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDispatchStatistics {
    pub jobs: f64,
    pub items: f64,
    pub execution_nanos: f64,
    pub last_update: Instant,
}

impl NodeDispatchStatistics {
    fn new(now: Instant) -> Self {
        Self {
            jobs: 0.0,
            items: 0.0,
            execution_nanos: 0.0,
            last_update: now,
        }
    }

    /// Mean execution time of one job item on this node.
    #[must_use]
    pub fn average_item_time(&self) -> Duration {
        duration_from_nanos_f64(ratio(self.execution_nanos, self.items))
    }

    fn decay(&mut self, keep: f64) {
        self.jobs *= keep;
        self.items *= keep;
        self.execution_nanos *= keep;
    }
}

fn ratio(total: f64, count: f64) -> f64 {
    if count > 0.0 { total / count } else { 0.0 }
}

/// In-memory [`StatisticsSink`] with decay and retention.
#[derive(Debug, Default)]
pub struct ExecutionStatistics {
    graphs: RwLock<HashMap<Arc<str>, GraphExecutionStatistics>>,
    nodes: RwLock<HashMap<Arc<str>, NodeDispatchStatistics>>,
}

impl ExecutionStatistics {
    #[must_use]
    pub fn graph(&self, calculation_configuration: &str) -> Option<GraphExecutionStatistics> {
        self.graphs.read().get(calculation_configuration).cloned()
    }

    #[must_use]
    pub fn compute_node(&self, compute_node_id: &str) -> Option<NodeDispatchStatistics> {
        self.nodes.read().get(compute_node_id).cloned()
    }

    #[must_use]
    pub fn compute_node_count(&self) -> usize {
        self.nodes.read().len()
    }

    /// Scales every accumulator by `1 - rate`.
    pub fn decay(&self, rate: f64) {
        let keep = (1.0 - rate).clamp(0.0, 1.0);
        for stats in self.graphs.write().values_mut() {
            stats.decay(keep);
        }
        for stats in self.nodes.write().values_mut() {
            stats.decay(keep);
        }
    }

    /// Drops entries not updated within `retention`. Returns how many were
    /// dropped.
    pub fn drop_older_than(&self, retention: Duration) -> usize {
        self.drop_stale(Instant::now(), retention)
    }

    fn drop_stale(&self, now: Instant, retention: Duration) -> usize {
        let is_live =
            |last_update: Instant| now.saturating_duration_since(last_update) <= retention;
        let mut graphs = self.graphs.write();
        let mut nodes = self.nodes.write();
        let before = graphs.len() + nodes.len();
        graphs.retain(|_, stats| is_live(stats.last_update));
        nodes.retain(|_, stats| is_live(stats.last_update));
        before - graphs.len() - nodes.len()
    }
}

impl StatisticsSink for ExecutionStatistics {
    fn graph_executed(
        &self,
        calculation_configuration: &str,
        node_count: usize,
        execution_time: Duration,
        duration: Duration,
    ) {
        let now = Instant::now();
        let mut graphs = self.graphs.write();
        if !graphs.contains_key(calculation_configuration) {
            graphs.insert(
                Arc::from(calculation_configuration),
                GraphExecutionStatistics::new(now),
            );
        }
        let stats = graphs
            .get_mut(calculation_configuration)
            .expect("ExecutionStatistics::graph_executed: [1]");
        stats.processed_graphs += 1.0;
        stats.executed_nodes += node_count as f64;
        stats.execution_nanos += execution_time.as_nanos_u64() as f64;
        stats.actual_nanos += duration.as_nanos_u64() as f64;
        stats.last_update = now;
    }

    fn job_executed(&self, compute_node_id: &str, item_count: usize, execution_time: Duration) {
        let now = Instant::now();
        let mut nodes = self.nodes.write();
        if !nodes.contains_key(compute_node_id) {
            nodes.insert(Arc::from(compute_node_id), NodeDispatchStatistics::new(now));
        }
        let stats = nodes
            .get_mut(compute_node_id)
            .expect("ExecutionStatistics::job_executed: [1]");
        stats.jobs += 1.0;
        stats.items += item_count as f64;
        stats.execution_nanos += execution_time.as_nanos_u64() as f64;
        stats.last_update = now;
    }
}
