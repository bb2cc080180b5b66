//! A deterministic discrete-event simulation kernel.
//!
//! Entity code is written in an ordinary procedural style; the kernel
//! serializes it into a time-ordered event schedule. An event may issue a
//! *blocking call* to another entity: the call looks synchronous, but is
//! realized as post-event, park the task, resume with the callee's return
//! value (or re-raised error) once it completes. Events are processed in
//! strict `(time, insertion)` order, one at a time, which makes runs
//! deterministic.
//!
//! The public surface is small: implement [`Entity`] (normally the offline
//! rewriter does this for you), pick a driver from [`controller`], post
//! events through a [`Sim`] handle, and interact with the running
//! simulation through the [`EventContext`] your methods receive.
//!
//! ```
//! use std::sync::{Arc, Mutex};
//!
//! use prime_mover::{args, value, Args, Controller, DomainError, Entity, EventContext, Value};
//!
//! struct Clock {
//!     seen: Mutex<Vec<i64>>,
//! }
//!
//! impl Entity for Clock {
//!     fn invoke(&self, ctx: &EventContext, ordinal: u32, _args: Args) -> Result<Value, DomainError> {
//!         match ordinal {
//!             0 => {
//!                 self.seen.lock().unwrap().push(ctx.current_time());
//!                 Ok(value::unit())
//!             }
//!             _ => Err(DomainError::new("unknown ordinal")),
//!         }
//!     }
//!
//!     fn signature(&self, _ordinal: u32) -> String {
//!         "Clock.tick()".to_string()
//!     }
//! }
//!
//! let controller = Controller::new();
//! let sim = controller.handle();
//!
//! let clock: prime_mover::EntityRef = Arc::new(Clock { seen: Mutex::new(Vec::new()) });
//! sim.post_event_at(3, &clock, 0, args![]).unwrap();
//! sim.post_event_at(1, &clock, 0, args![]).unwrap();
//!
//! controller.run().unwrap();
//! assert_eq!(sim.current_time(), 3);
//! assert_eq!(sim.report().total_events, 2);
//! ```

pub mod controller;
pub mod entity;
pub mod event;
pub mod scheduler;
pub mod value;

mod continuation;
mod queue;
mod tasks;

pub use controller::{Controller, PacedController, StepController};
pub use entity::{Entity, EntityRef, MethodTable, Transformed};
pub use event::EventInfo;
pub use scheduler::{Config, EventContext, EventLogger, PastEvents, Report, Sim, Step};
pub use value::{Args, Value};

/// Error raised by an entity event method.
///
/// Domain errors ride the blocking caller chain the same way return values
/// do: the caller's `post_continuing_event` re-raises them. An error that
/// reaches an event with no blocked caller is fatal to the run.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("{message}")]
pub struct DomainError {
    message: String,
}

impl DomainError {
    pub fn new(message: impl Into<String>) -> Self {
        DomainError {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Converts a caught panic from an entity body into a domain error, so
    /// a panicking event cannot wedge the scheduler.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "non-string panic payload"
        };

        DomainError::new(format!("event panicked: {message}"))
    }
}

impl From<&str> for DomainError {
    fn from(message: &str) -> Self {
        DomainError::new(message)
    }
}

impl From<String> for DomainError {
    fn from(message: String) -> Self {
        DomainError::new(message)
    }
}

/// Fatal outcome of a simulation run.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SimulationError {
    /// An event failed and no blocked caller was there to receive the error.
    #[error("event failed with no blocked caller: {0}")]
    Failure(DomainError),

    /// The loop was interrupted from outside; statistics remain valid up to
    /// the last completed event.
    #[error("simulation interrupted")]
    Interrupted,

    /// A single evaluation exceeded the configured timeout; the running task
    /// is lost and the kernel is no longer usable.
    #[error("event evaluation timed out")]
    Stalled,

    /// A deferred post issued by a driver was rejected.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// Rejected post.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ScheduleError {
    /// The requested time is before the current instant and the scheduler is
    /// configured to reject rather than clamp.
    #[error("event scheduled at {requested}, before the current time {now}")]
    BackInTime { requested: i64, now: i64 },
}

/// Rejected [`Sim::clear`].
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ClearError {
    /// An event is being evaluated or a task is parked on a continuation.
    #[error("scheduler has a running or parked event")]
    Busy,
}
