//! Per-cycle context handed to executor factories.

use crate::{
    job::{CalculationJobResult, CalculationJobSpecification, JobDispatcher},
    log::{LogModeSource, UniformLogMode},
    results::JobResultCaches,
    statistics::StatisticsSink,
    types::{JobId, NodeId, RunId},
};
use core::sync::atomic::{AtomicU64, Ordering};
use derive_more::Debug;
use std::{sync::Arc, time::SystemTime};

/// Point in version/correction time the cycle's data is read at. `None`
/// means latest.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VersionCorrection {
    pub version_as_of: Option<SystemTime>,
    pub corrected_to: Option<SystemTime>,
}

/// Sees every job result of the cycle, after the executor has recorded it.
pub trait ExecutionResultListener: Send + Sync {
    fn execution_result(&self, nodes: &[NodeId], result: &CalculationJobResult);
}

/// Everything an executor needs to know about the cycle it runs for.
#[derive(Debug)]
pub struct CycleContext {
    run_id: RunId,
    valuation_time: SystemTime,
    version_correction: VersionCorrection,
    #[debug(skip)]
    dispatcher: Arc<dyn JobDispatcher>,
    #[debug(skip)]
    log_modes: Arc<dyn LogModeSource>,
    #[debug(skip)]
    statistics: Option<Arc<dyn StatisticsSink>>,
    #[debug(skip)]
    result_listener: Option<Arc<dyn ExecutionResultListener>>,
    job_results: JobResultCaches,
    next_job_id: AtomicU64,
}

#[derive(Debug)]
pub struct CycleContextBuilder {
    run_id: RunId,
    valuation_time: SystemTime,
    version_correction: VersionCorrection,
    #[debug(skip)]
    dispatcher: Arc<dyn JobDispatcher>,
    #[debug(skip)]
    log_modes: Arc<dyn LogModeSource>,
    #[debug(skip)]
    statistics: Option<Arc<dyn StatisticsSink>>,
    #[debug(skip)]
    result_listener: Option<Arc<dyn ExecutionResultListener>>,
}

impl CycleContextBuilder {
    #[must_use]
    pub fn valuation_time(mut self, valuation_time: SystemTime) -> Self {
        self.valuation_time = valuation_time;
        self
    }

    #[must_use]
    pub fn version_correction(mut self, version_correction: VersionCorrection) -> Self {
        self.version_correction = version_correction;
        self
    }

    #[must_use]
    pub fn log_modes(mut self, log_modes: Arc<dyn LogModeSource>) -> Self {
        self.log_modes = log_modes;
        self
    }

    #[must_use]
    pub fn statistics(mut self, statistics: Arc<dyn StatisticsSink>) -> Self {
        self.statistics = Some(statistics);
        self
    }

    #[must_use]
    pub fn result_listener(mut self, listener: Arc<dyn ExecutionResultListener>) -> Self {
        self.result_listener = Some(listener);
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<CycleContext> {
        let Self {
            run_id,
            valuation_time,
            version_correction,
            dispatcher,
            log_modes,
            statistics,
            result_listener,
        } = self;
        Arc::new(CycleContext {
            run_id,
            valuation_time,
            version_correction,
            dispatcher,
            log_modes,
            statistics,
            result_listener,
            job_results: JobResultCaches::default(),
            next_job_id: AtomicU64::new(1),
        })
    }
}

impl CycleContext {
    /// Valuation time defaults to now, logs to indicator mode.
    pub fn builder(run_id: RunId, dispatcher: Arc<dyn JobDispatcher>) -> CycleContextBuilder {
        CycleContextBuilder {
            run_id,
            valuation_time: SystemTime::now(),
            version_correction: VersionCorrection::default(),
            dispatcher,
            log_modes: Arc::new(UniformLogMode::default()),
            statistics: None,
            result_listener: None,
        }
    }

    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<dyn JobDispatcher> {
        &self.dispatcher
    }

    #[must_use]
    pub fn log_modes(&self) -> &dyn LogModeSource {
        self.log_modes.as_ref()
    }

    #[must_use]
    pub fn statistics(&self) -> Option<&Arc<dyn StatisticsSink>> {
        self.statistics.as_ref()
    }

    #[must_use]
    pub fn result_listener(&self) -> Option<&Arc<dyn ExecutionResultListener>> {
        self.result_listener.as_ref()
    }

    /// Job-result caches of this cycle, one per calculation configuration.
    #[must_use]
    pub fn job_results(&self) -> &JobResultCaches {
        &self.job_results
    }

    /// Specification for a new job with a cycle-unique id.
    pub fn next_job_specification(
        &self,
        calculation_configuration: &Arc<str>,
    ) -> CalculationJobSpecification {
        CalculationJobSpecification {
            run_id: self.run_id,
            calculation_configuration: calculation_configuration.clone(),
            valuation_time: self.valuation_time,
            version_correction: self.version_correction,
            job_id: JobId(self.next_job_id.fetch_add(1, Ordering::Relaxed)),
        }
    }
}
