//! Per-node execution logs and their aggregation along the graph.

use crate::{graph::DependencyNode, types::NodeId};
use std::sync::Arc;

/// How much per-node log detail a job keeps.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ExecutionLogMode {
    /// Only which log levels occurred.
    #[default]
    Indicators,
    /// Every event, plus the full logs of upstream producers.
    Full,
}

/// Decides the log mode of each node of a cycle.
pub trait LogModeSource: Send + Sync {
    fn log_mode(&self, node: &DependencyNode) -> ExecutionLogMode;
}

/// The same log mode for every node.
#[derive(Debug, Default, Copy, Clone)]
pub struct UniformLogMode(pub ExecutionLogMode);

impl LogModeSource for UniformLogMode {
    fn log_mode(&self, _node: &DependencyNode) -> ExecutionLogMode {
        self.0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Info = 1,
    Warn = 1 << 1,
    Error = 1 << 2,
}

/// Set of log levels observed, as a bitset.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct IndicatorLevels(u8);

impl IndicatorLevels {
    pub const EMPTY: Self = Self(0);

    #[must_use]
    pub fn with(self, level: LogLevel) -> Self {
        Self(self.0 | level as u8)
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub fn contains(self, level: LogLevel) -> bool {
        self.0 & level as u8 != 0
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl FromIterator<LogLevel> for IndicatorLevels {
    fn from_iter<I: IntoIterator<Item = LogLevel>>(iter: I) -> Self {
        iter.into_iter().fold(Self::EMPTY, Self::with)
    }
}

/// Log of one function invocation as returned by a compute node.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExecutionLog {
    levels: IndicatorLevels,
}

impl ExecutionLog {
    #[must_use]
    pub fn new(levels: IndicatorLevels) -> Self {
        Self { levels }
    }

    #[must_use]
    pub fn levels(&self) -> IndicatorLevels {
        self.levels
    }
}

/// A node's log together with what its upstream producers logged.
#[derive(Debug, Clone)]
pub struct AggregatedExecutionLog {
    node: NodeId,
    levels: IndicatorLevels,
    log: Option<ExecutionLog>,
    inputs: Vec<Arc<AggregatedExecutionLog>>,
}

impl AggregatedExecutionLog {
    /// Folds the input logs' levels into this node's. The node's own log and
    /// the input logs themselves are retained only in full mode.
    #[must_use]
    pub fn new(
        node: NodeId,
        log: &ExecutionLog,
        inputs: Vec<Arc<AggregatedExecutionLog>>,
        mode: ExecutionLogMode,
    ) -> Self {
        let levels = inputs
            .iter()
            .fold(log.levels, |levels, input| levels.union(input.levels));
        match mode {
            ExecutionLogMode::Indicators => Self {
                node,
                levels,
                log: None,
                inputs: Vec::new(),
            },
            ExecutionLogMode::Full => Self {
                node,
                levels,
                log: Some(log.clone()),
                inputs,
            },
        }
    }

    #[must_use]
    pub fn node(&self) -> NodeId {
        self.node
    }

    #[must_use]
    pub fn levels(&self) -> IndicatorLevels {
        self.levels
    }

    #[must_use]
    pub fn log(&self) -> Option<&ExecutionLog> {
        self.log.as_ref()
    }

    #[must_use]
    pub fn inputs(&self) -> &[Arc<AggregatedExecutionLog>] {
        &self.inputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregated(node: u32, level: LogLevel) -> Arc<AggregatedExecutionLog> {
        let log = ExecutionLog::new(IndicatorLevels::EMPTY.with(level));
        Arc::new(AggregatedExecutionLog::new(
            NodeId(node),
            &log,
            Vec::new(),
            ExecutionLogMode::Indicators,
        ))
    }

    #[test]
    fn levels_fold_over_inputs() {
        let warn = aggregated(1, LogLevel::Warn);
        let error = aggregated(2, LogLevel::Error);
        let log = ExecutionLog::new([LogLevel::Info].into_iter().collect());

        let indicators = AggregatedExecutionLog::new(
            NodeId(3),
            &log,
            vec![warn.clone(), error.clone()],
            ExecutionLogMode::Indicators,
        );
        let levels = indicators.levels();
        assert!(levels.contains(LogLevel::Info));
        assert!(levels.contains(LogLevel::Warn));
        assert!(levels.contains(LogLevel::Error));
        assert!(indicators.log().is_none());
        assert!(indicators.inputs().is_empty());

        let full =
            AggregatedExecutionLog::new(NodeId(3), &log, vec![warn, error], ExecutionLogMode::Full);
        assert_eq!(full.levels(), levels);
        assert_eq!(full.log(), Some(&log));
        assert_eq!(full.inputs().len(), 2);
    }

    #[test]
    fn empty_levels() {
        assert!(IndicatorLevels::default().is_empty());
        assert!(
            !IndicatorLevels::EMPTY
                .with(LogLevel::Warn)
                .contains(LogLevel::Error)
        );
    }
}
