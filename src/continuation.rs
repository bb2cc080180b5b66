//! Suspended execution state of an entity method awaiting a blocking result.
//!
//! You interact with a continuation through a pair of [`Continuation`] and
//! [`Suspension`] handles created by the [`continuation`] function.
//!
//! The [`Suspension`] stays with the task that issued the blocking call: the
//! task parks on it and, once released, reads the blocking event's return
//! value or error out of it. The [`Continuation`] travels with the continuing
//! event through the scheduler, which first stores the outcome with
//! [`Continuation::resume`] when the blocking event completes, and later
//! releases the task with [`Continuation::unpark`] when the continuing event
//! reaches the front of the queue. Keeping the two steps separate is what
//! lets a resumed task wait its turn in FIFO order with its same-time peers.
//!
//! Both halves are single-use; a second resume or unpark is a kernel bug and
//! panics.

use std::sync::{Arc, Mutex};

use crate::tasks::{self, Parker, Unparker};
use crate::value::Value;
use crate::DomainError;

/// Outcome of a blocking call: the completed event's return value or the
/// error it raised.
pub(crate) type BlockingResult = Result<Value, DomainError>;

/// Creates a connected [`Continuation`]/[`Suspension`] pair.
pub(crate) fn continuation() -> (Continuation, Suspension) {
    let outcome = Arc::new(Mutex::new(None));
    let (parker, unparker) = tasks::parker();

    let continuation = Continuation {
        task: unparker,
        outcome: outcome.clone(),
    };
    let suspension = Suspension { parker, outcome };

    (continuation, suspension)
}

/// Scheduler-side half: stores the blocking call's outcome, then wakes the
/// suspended task.
pub(crate) struct Continuation {
    task: Unparker,
    outcome: Arc<Mutex<Option<BlockingResult>>>,
}

impl Continuation {
    /// Records the completed blocking event's return value or error. The
    /// parked task stays parked until [`Continuation::unpark`].
    pub(crate) fn resume(&self, result: BlockingResult) {
        let mut slot = self.outcome.lock().expect("continuation outcome poisoned");
        assert!(slot.is_none(), "continuation resumed twice");
        *slot = Some(result);
    }

    /// Releases the suspended task to read the stored outcome.
    pub(crate) fn unpark(self) {
        self.task.unpark();
    }
}

/// Task-side half: parks until resumed, then yields the outcome.
pub(crate) struct Suspension {
    parker: Parker,
    outcome: Arc<Mutex<Option<BlockingResult>>>,
}

impl Suspension {
    /// Parks the calling task until the continuation is unparked, then
    /// returns the stored outcome.
    pub(crate) fn wait(self) -> BlockingResult {
        self.parker.park();

        self.outcome
            .lock()
            .expect("continuation outcome poisoned")
            .take()
            .expect("task unparked without a stored outcome")
    }
}
