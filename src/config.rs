use crate::error::ConfigError;
use core::time::Duration;

/// Job-sizing parameters that decide fragment boundaries.
///
/// Costs are estimated nanoseconds as reported by the configured
/// [`NodeCostEstimator`](crate::fragment::NodeCostEstimator).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSizing {
    /// Fragments smaller than this are merged with siblings.
    pub minimum_job_items: usize,
    pub maximum_job_items: usize,
    /// Fragments cheaper than this are merged with siblings.
    pub minimum_job_cost: u64,
    pub maximum_job_cost: u64,
    /// Upper bound on tail jobs chained onto one dispatched job, all of which
    /// stream to the same compute-node host.
    pub maximum_concurrency: usize,
}

impl Default for JobSizing {
    fn default() -> Self {
        Self {
            minimum_job_items: 1,
            maximum_job_items: usize::MAX,
            minimum_job_cost: 0,
            maximum_job_cost: u64::MAX,
            maximum_concurrency: usize::MAX,
        }
    }
}

impl JobSizing {
    /// # Errors
    /// If a minimum exceeds its maximum.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.minimum_job_items > self.maximum_job_items {
            return Err(ConfigError::InvertedRange {
                name: "job items",
                minimum: self.minimum_job_items as u64,
                maximum: self.maximum_job_items as u64,
            });
        }
        if self.minimum_job_cost > self.maximum_job_cost {
            return Err(ConfigError::InvertedRange {
                name: "job cost",
                minimum: self.minimum_job_cost,
                maximum: self.maximum_job_cost,
            });
        }
        Ok(())
    }

    /// Whether a fragment of the given size stays within both maxima.
    #[must_use]
    pub(crate) fn fits(&self, items: usize, cost: u64) -> bool {
        items <= self.maximum_job_items && cost <= self.maximum_job_cost
    }

    /// Whether a fragment of the given size should be merged with siblings.
    #[must_use]
    pub(crate) fn is_undersized(&self, items: usize, cost: u64) -> bool {
        items < self.minimum_job_items || cost < self.minimum_job_cost
    }
}

/// Settings of the [`MultipleNodeExecutorTuner`](crate::factory::tuner::MultipleNodeExecutorTuner).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TunerSettings {
    /// Fraction removed from every accumulated statistic on each tuning step.
    pub statistics_decay: f64,
    /// Statistics not updated for longer than this are dropped.
    pub statistics_retention: Duration,
}

impl Default for TunerSettings {
    fn default() -> Self {
        Self {
            statistics_decay: 0.1,
            statistics_retention: Duration::from_secs(15 * 60),
        }
    }
}

impl TunerSettings {
    /// # Errors
    /// If the decay rate is not within `[0, 1]`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if (0.0..=1.0).contains(&self.statistics_decay) {
            Ok(())
        } else {
            Err(ConfigError::DecayRate(self.statistics_decay))
        }
    }
}
