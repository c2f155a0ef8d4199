//! Which job produced which value, for provenance and log lookups.

use crate::{
    job::CalculationJobResultItem,
    log::AggregatedExecutionLog,
    types::{HashMap, ValueSpecification},
};
use parking_lot::RwLock;
use std::sync::Arc;

/// What one job reported for one node.
#[derive(Debug, Clone)]
pub struct DependencyNodeJobExecutionResult {
    compute_node_id: Arc<str>,
    item: CalculationJobResultItem,
    log: Arc<AggregatedExecutionLog>,
}

impl DependencyNodeJobExecutionResult {
    #[must_use]
    pub fn new(
        compute_node_id: Arc<str>,
        item: CalculationJobResultItem,
        log: Arc<AggregatedExecutionLog>,
    ) -> Self {
        Self {
            compute_node_id,
            item,
            log,
        }
    }

    #[must_use]
    pub fn compute_node_id(&self) -> &str {
        &self.compute_node_id
    }

    #[must_use]
    pub fn item(&self) -> &CalculationJobResultItem {
        &self.item
    }

    #[must_use]
    pub fn log(&self) -> &Arc<AggregatedExecutionLog> {
        &self.log
    }
}

/// Value identifier to producing job result, for one calculation
/// configuration. Safe for concurrent use from result-arrival threads.
#[derive(Debug, Default)]
pub struct DependencyNodeJobExecutionResultCache {
    entries: RwLock<Entries>,
}

#[derive(Debug, Default)]
struct Entries {
    values: HashMap<ValueSpecification, Entry>,
    /// Puts so far; the next entry's sequence.
    stored: u64,
}

#[derive(Debug, Clone)]
struct Entry {
    sequence: u64,
    result: Arc<DependencyNodeJobExecutionResult>,
}

impl DependencyNodeJobExecutionResultCache {
    /// Last write wins.
    pub fn put(&self, value: ValueSpecification, result: Arc<DependencyNodeJobExecutionResult>) {
        let mut entries = self.entries.write();
        let sequence = entries.stored;
        entries.stored += 1;
        entries.values.insert(value, Entry { sequence, result });
    }

    #[must_use]
    pub fn get(&self, value: &ValueSpecification) -> Option<Arc<DependencyNodeJobExecutionResult>> {
        self.entries
            .read()
            .values
            .get(value)
            .map(|entry| entry.result.clone())
    }

    /// Result for any of `values`. The candidates are expected to be
    /// value-equivalent, so any match is valid; the most recently stored one
    /// is returned.
    #[must_use]
    pub fn find<'a>(
        &self,
        values: impl IntoIterator<Item = &'a ValueSpecification>,
    ) -> Option<Arc<DependencyNodeJobExecutionResult>> {
        let entries = self.entries.read();
        values
            .into_iter()
            .filter_map(|value| entries.values.get(value))
            .max_by_key(|entry| entry.sequence)
            .map(|entry| entry.result.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().values.is_empty()
    }
}

/// One [`DependencyNodeJobExecutionResultCache`] per calculation
/// configuration.
#[derive(Debug, Default)]
pub struct JobResultCaches {
    caches: RwLock<HashMap<Arc<str>, Arc<DependencyNodeJobExecutionResultCache>>>,
}

impl JobResultCaches {
    #[must_use]
    pub fn get(
        &self,
        calculation_configuration: &str,
    ) -> Option<Arc<DependencyNodeJobExecutionResultCache>> {
        self.caches.read().get(calculation_configuration).cloned()
    }

    pub fn get_or_create(
        &self,
        calculation_configuration: &Arc<str>,
    ) -> Arc<DependencyNodeJobExecutionResultCache> {
        if let Some(cache) = self.get(calculation_configuration) {
            return cache;
        }
        self.caches
            .write()
            .entry(calculation_configuration.clone())
            .or_default()
            .clone()
    }
}
