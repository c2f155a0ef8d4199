use derive_more::{Display, From};
use indexmap::{IndexMap as _IndexMap, IndexSet as _IndexSet};
use rustc_hash::FxBuildHasher;
use std::{
    collections::{HashMap as _HashMap, HashSet as _HashSet},
    sync::Arc,
};

/// Identity of a node within one dependency graph instance.
#[derive(Debug, Display, From, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("node#{_0}")]
pub struct NodeId(pub u32);

/// Identity of a fragment within one execution plan.
///
/// `FragmentId(0)` is reserved for the synthetic terminal root of a fragment
/// tree.
#[derive(Debug, Display, From, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("fragment#{_0}")]
pub struct FragmentId(pub u32);

impl FragmentId {
    /// The synthetic terminal root every otherwise output-less fragment feeds.
    pub const ROOT: Self = Self(0);
}

/// Unique identifier of a dispatched calculation job.
#[derive(Debug, Display, From, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("job#{_0}")]
pub struct JobId(pub u64);

/// Unique identifier of one valuation cycle run.
#[derive(Debug, Display, From, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("run#{_0}")]
pub struct RunId(pub u64);

/// Identifier of the thing a node computes a value for (a security, a
/// position, ...).
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(Arc<str>);

impl TargetId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identifier of one value produced by a node.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("{name}@{target}")]
pub struct ValueSpecification {
    name: Arc<str>,
    target: TargetId,
}

impl ValueSpecification {
    pub fn new(name: impl Into<Arc<str>>, target: TargetId) -> Self {
        Self {
            name: name.into(),
            target,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn target(&self) -> &TargetId {
        &self.target
    }
}

/// `HashMap` type with fast hasher.
pub type HashMap<K, V> = _HashMap<K, V, FxBuildHasher>;
pub(crate) type HashSet<T> = _HashSet<T, FxBuildHasher>;
/// `IndexMap` type with fast hasher.
pub type IndexMap<K, V> = _IndexMap<K, V, FxBuildHasher>;
pub(crate) type IndexSet<T> = _IndexSet<T, FxBuildHasher>;
