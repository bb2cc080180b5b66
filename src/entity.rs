//! Entities and the dispatch ABI shared with the offline rewriter.

use std::sync::Arc;

use crate::scheduler::{EventContext, Sim};
use crate::value::{Args, Value};
use crate::DomainError;

/// An object whose event methods are dispatched by ordinal.
///
/// Implementations are normally synthesized by the offline rewriter: each
/// event method's body is moved into a shadow method, and [`Entity::invoke`]
/// selects among the shadows by ordinal. Hand-written implementations follow
/// the same contract, typically backed by a [`MethodTable`].
///
/// Side effects (posting events, blocking calls, advancing the clock) go
/// through the [`EventContext`] the kernel passes in, never through the
/// entity itself.
pub trait Entity: Send + Sync {
    /// Dispatches the method identified by `ordinal` with `args`, returning
    /// its boxed result or the domain error it raised.
    fn invoke(&self, ctx: &EventContext, ordinal: u32, args: Args) -> Result<Value, DomainError>;

    /// Human-readable signature of the method behind `ordinal`, used for
    /// trace output and the report spectrum.
    fn signature(&self, ordinal: u32) -> String;

    /// Called once when the entity is bound to a scheduler, for entities
    /// that capture a scheduler handle at construction.
    fn bind(&self, _sim: &Sim) {}

    /// The rewriter's marker, if this entity was produced by it.
    fn transformed(&self) -> Option<Transformed> {
        None
    }
}

/// Shared polymorphic handle to an entity.
///
/// A static-method holder is an ordinary stateless [`Entity`].
pub type EntityRef = Arc<dyn Entity>;

/// Marker the offline rewriter attaches to every class it has processed, so
/// rebuilds can skip already-transformed classes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Transformed {
    /// Rewrite timestamp, milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Ordinal assignment for an entity's event methods.
///
/// Ordinals are assigned by sorting methods alphabetically by
/// `(name, descriptor)` and numbering from 0. The assignment depends only on
/// the method set, never on insertion order, so it is stable across rebuilds
/// and across processes. That is the ABI contract dispatch relies on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodTable {
    /// Sorted `(name, descriptor)` pairs; the index is the ordinal.
    methods: Vec<(String, String)>,
}

impl MethodTable {
    /// Builds a table from `(name, descriptor)` pairs, in any order.
    pub fn new<N, D>(methods: impl IntoIterator<Item = (N, D)>) -> Self
    where
        N: Into<String>,
        D: Into<String>,
    {
        let mut methods: Vec<(String, String)> = methods
            .into_iter()
            .map(|(name, descriptor)| (name.into(), descriptor.into()))
            .collect();
        methods.sort();
        methods.dedup();

        MethodTable { methods }
    }

    /// The stable ordinal of `(name, descriptor)`, if the method exists.
    pub fn ordinal(&self, name: &str, descriptor: &str) -> Option<u32> {
        self.methods
            .binary_search_by(|(n, d)| (n.as_str(), d.as_str()).cmp(&(name, descriptor)))
            .ok()
            .map(|index| index as u32)
    }

    /// Human-readable signature for `ordinal`.
    pub fn signature(&self, ordinal: u32) -> Option<String> {
        self.methods
            .get(ordinal as usize)
            .map(|(name, descriptor)| format!("{name}{descriptor}"))
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}
