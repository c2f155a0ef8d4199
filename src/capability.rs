//! Capabilities advertised by job invokers, as consulted by the tuner.

use crate::types::IndexMap;
use std::sync::Arc;

/// Capability holding the number of compute nodes behind one invoker.
pub const NODE_COUNT: &str = "NodeCount";

/// Bounds of one capability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Capability {
    pub lower_bound: Option<f64>,
    pub upper_bound: Option<f64>,
}

impl Capability {
    #[must_use]
    pub fn at_most(upper_bound: f64) -> Self {
        Self {
            lower_bound: None,
            upper_bound: Some(upper_bound),
        }
    }
}

/// Everything one job invoker advertises.
#[derive(Debug, Clone, Default)]
pub struct CapabilitySet {
    pub invoker_id: Arc<str>,
    pub capabilities: IndexMap<Arc<str>, Capability>,
}

impl CapabilitySet {
    pub fn new(invoker_id: impl Into<Arc<str>>) -> Self {
        Self {
            invoker_id: invoker_id.into(),
            capabilities: IndexMap::default(),
        }
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<Arc<str>>, capability: Capability) -> Self {
        self.capabilities.insert(name.into(), capability);
        self
    }

    /// Upper bound of [`NODE_COUNT`], if advertised.
    #[must_use]
    pub fn node_count(&self) -> Option<f64> {
        self.capabilities
            .get(NODE_COUNT)
            .and_then(|capability| capability.upper_bound)
    }
}

/// Source of the capabilities of all currently connected job invokers.
pub trait CapabilitySource: Send + Sync {
    fn invoker_capabilities(&self) -> Vec<CapabilitySet>;
}
