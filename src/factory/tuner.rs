//! Periodic adjustment of a [`MultipleNodeExecutorFactory`] from runtime
//! observations.

use crate::{
    capability::{CapabilitySet, CapabilitySource},
    config::TunerSettings,
    error::ConfigError,
    factory::MultipleNodeExecutorFactory,
    statistics::ExecutionStatistics,
};
use derive_more::Debug;
use std::sync::Arc;
use tracing::{debug, info};

/// One tuning step per [`run`](Self::run); scheduling is up to the caller.
///
/// Each half of a step is skipped when its source is absent.
#[derive(Debug)]
pub struct MultipleNodeExecutorTuner {
    factory: MultipleNodeExecutorFactory,
    settings: TunerSettings,
    #[debug(skip)]
    capabilities: Option<Arc<dyn CapabilitySource>>,
    statistics: Option<Arc<ExecutionStatistics>>,
}

impl MultipleNodeExecutorTuner {
    /// # Errors
    /// If `settings` is invalid.
    pub fn new(
        factory: MultipleNodeExecutorFactory,
        settings: TunerSettings,
    ) -> Result<Self, ConfigError> {
        settings.validate()?;
        Ok(Self {
            factory,
            settings,
            capabilities: None,
            statistics: None,
        })
    }

    #[must_use]
    pub fn with_capability_source(mut self, capabilities: Arc<dyn CapabilitySource>) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    #[must_use]
    pub fn with_statistics(mut self, statistics: Arc<ExecutionStatistics>) -> Self {
        self.statistics = Some(statistics);
        self
    }

    pub fn run(&self) {
        if let Some(capabilities) = &self.capabilities {
            self.tune_concurrency(capabilities.as_ref());
        }
        if let Some(statistics) = &self.statistics {
            statistics.decay(self.settings.statistics_decay);
            let dropped = statistics.drop_older_than(self.settings.statistics_retention);
            debug!(
                decay = self.settings.statistics_decay,
                dropped, "decayed execution statistics",
            );
        }
    }

    /// Sets the tail limit to the average compute-node count per invoker.
    fn tune_concurrency(&self, capabilities: &dyn CapabilitySource) {
        let counts: Vec<f64> = capabilities
            .invoker_capabilities()
            .iter()
            .filter_map(CapabilitySet::node_count)
            .filter(|count| count.is_finite() && *count >= 0.0)
            .collect();
        if counts.is_empty() {
            debug!("no invoker advertises a node count");
            return;
        }
        let average = counts.iter().sum::<f64>() / counts.len() as f64;
        // Saturating float-to-int cast.
        let concurrency = average.round() as usize;
        if concurrency != self.factory.sizing().maximum_concurrency {
            info!(
                invokers = counts.len(),
                maximum_concurrency = concurrency,
                "retuning maximum concurrency",
            );
            self.factory.set_maximum_concurrency(concurrency);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        capability::Capability,
        config::JobSizing,
        graph::{ComputationTarget, ComputationTargetType, DependencyGraph, DependencyNode},
        statistics::StatisticsSink,
        types::{NodeId, TargetId, ValueSpecification},
    };
    use core::time::Duration;

    struct Invokers(Vec<CapabilitySet>);

    impl CapabilitySource for Invokers {
        fn invoker_capabilities(&self) -> Vec<CapabilitySet> {
            self.0.clone()
        }
    }

    fn invoker(id: &str, nodes: f64) -> CapabilitySet {
        CapabilitySet::new(id).with(crate::capability::NODE_COUNT, Capability::at_most(nodes))
    }

    fn two_node_graph() -> DependencyGraph {
        let target = ComputationTarget::new(ComputationTargetType::Primitive, "P");
        let value = |name: &str| ValueSpecification::new(name, TargetId::new("P"));
        let mut builder = DependencyGraph::builder("Default");
        builder
            .add_node(
                DependencyNode::new(NodeId(1), "a", target.clone()).with_outputs([value("a")]),
            )
            .add_node(
                DependencyNode::new(NodeId(2), "b", target)
                    .with_inputs([NodeId(1)])
                    .with_outputs([value("b")]),
            );
        builder.build()
    }

    #[test]
    fn concurrency_follows_average_node_count() {
        let factory = MultipleNodeExecutorFactory::new(JobSizing {
            maximum_job_items: 1,
            ..JobSizing::default()
        })
        .unwrap();
        factory.plan(&two_node_graph()).unwrap();
        assert_eq!(factory.cached_plan_count(), 1);

        let tuner = MultipleNodeExecutorTuner::new(factory.clone(), TunerSettings::default())
            .unwrap()
            .with_capability_source(Arc::new(Invokers(vec![
                invoker("a", 2.0),
                invoker("b", 4.0),
                CapabilitySet::new("silent"),
            ])));
        tuner.run();
        assert_eq!(factory.sizing().maximum_concurrency, 3);
        assert_eq!(factory.cached_plan_count(), 0);

        factory.plan(&two_node_graph()).unwrap();
        tuner.run();
        assert_eq!(factory.cached_plan_count(), 1);
    }

    #[test]
    fn missing_sources_are_skipped() {
        let factory = MultipleNodeExecutorFactory::default();
        let before = factory.sizing();
        MultipleNodeExecutorTuner::new(factory.clone(), TunerSettings::default())
            .unwrap()
            .run();
        assert_eq!(factory.sizing(), before);
    }

    #[test]
    fn statistics_are_decayed() {
        let statistics = Arc::new(ExecutionStatistics::default());
        statistics.job_executed("cn-1", 10, Duration::from_millis(100));
        let tuner = MultipleNodeExecutorTuner::new(
            MultipleNodeExecutorFactory::default(),
            TunerSettings {
                statistics_decay: 0.5,
                ..TunerSettings::default()
            },
        )
        .unwrap()
        .with_statistics(statistics.clone());
        tuner.run();
        let node = statistics.compute_node("cn-1").unwrap();
        assert_eq!(node.jobs, 0.5);
        assert_eq!(node.items, 5.0);
        assert_eq!(statistics.compute_node_count(), 1);
    }

    #[test]
    fn invalid_decay_is_rejected() {
        let err = MultipleNodeExecutorTuner::new(
            MultipleNodeExecutorFactory::default(),
            TunerSettings {
                statistics_decay: 1.5,
                ..TunerSettings::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DecayRate(_)));
    }
}
