//! Event records and handles.

use crate::continuation::Continuation;
use crate::entity::EntityRef;
use crate::value::Args;

/// Versioned handle to an event in the scheduler's arena.
///
/// The arena reuses slots, so a handle also carries the stamp its record was
/// allocated with; a lookup whose stamp no longer matches simply misses.
/// That gives debug backlinks weak-reference semantics without keeping
/// completed events alive.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct EventId {
    pub(crate) index: usize,
    pub(crate) stamp: u64,
}

/// What dispatching an event does.
pub(crate) enum EventPayload {
    /// Invoke a method on an entity; runs on a fresh task.
    Call {
        target: EntityRef,
        ordinal: u32,
        args: Args,
    },

    /// Resume a parked task; the record carries the continuation. Target and
    /// ordinal are kept for traces and the report spectrum.
    Resume { target: EntityRef, ordinal: u32 },

    /// The end-of-simulation sentinel; terminates the loop when dispatched.
    End,
}

/// A scheduled invocation held in the arena.
pub(crate) struct EventRecord {
    pub(crate) stamp: u64,
    pub(crate) time: i64,

    /// Queue sequence from the most recent insert, for traces.
    pub(crate) seq: u64,

    pub(crate) payload: EventPayload,

    /// The event whose task is blocked awaiting this one's completion.
    pub(crate) caller: Option<EventId>,

    /// Present iff this record is a resumption point.
    pub(crate) continuation: Option<Continuation>,

    /// The event that raised this one; tracked only when enabled, never
    /// relied on for correctness.
    pub(crate) source: Option<EventId>,

    /// `file:line` of the post, captured when debug is on.
    pub(crate) raised_at: Option<String>,
}

impl EventRecord {
    pub(crate) fn signature(&self) -> String {
        match &self.payload {
            EventPayload::Call {
                target, ordinal, ..
            }
            | EventPayload::Resume { target, ordinal } => target.signature(*ordinal),
            EventPayload::End => "<simulation end>".to_string(),
        }
    }
}

/// Snapshot of a scheduled event, exposed for debugging and event logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventInfo {
    /// Simulated instant the event is (or was) scheduled at.
    pub time: i64,

    /// Insertion sequence from the most recent enqueue.
    pub seq: u64,

    /// Signature of the target method, or a sentinel description.
    pub signature: String,

    /// Whether the event resumes a suspended method rather than starting one.
    pub resumption: bool,

    /// `file:line` of the post, when debug is on.
    pub raised_at: Option<String>,

    /// Signature of the raising event, when source tracking is on and the
    /// source is still live.
    pub source: Option<String>,
}
