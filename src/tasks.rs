//! Cooperative task primitives for event bodies.
//!
//! Each fresh event runs on its own detached worker thread. The threads are
//! cooperative from the kernel's perspective: at most one is ever runnable,
//! because the scheduler blocks on its publication slot whenever a worker may
//! make progress, and a worker suspends only by parking on a continuation.
//!
//! [`parker`] creates the one-shot park/unpark pair backing a continuation.
//! Unparking before the task parks is fine; the park then returns
//! immediately.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

/// Spawns detached, named worker threads for event bodies.
#[derive(Debug)]
pub(crate) struct TaskRuntime {
    next_worker: AtomicU64,
}

impl TaskRuntime {
    pub(crate) fn new() -> Self {
        TaskRuntime {
            next_worker: AtomicU64::new(0),
        }
    }

    /// Starts `f` as a detached worker, returning to the scheduler
    /// immediately. The worker runs until it completes or parks.
    pub(crate) fn spawn(&self, f: impl FnOnce() + Send + 'static) {
        let worker = self.next_worker.fetch_add(1, Ordering::Relaxed);
        thread::Builder::new()
            .name(format!("event-worker-{worker}"))
            .spawn(f)
            .expect("failed to spawn event worker");
    }
}

/// Creates a connected one-shot [`Parker`]/[`Unparker`] pair.
pub(crate) fn parker() -> (Parker, Unparker) {
    let core = Arc::new(ParkCore {
        state: Mutex::new(ParkState::Empty),
        wakeup: Condvar::new(),
    });

    (Parker(core.clone()), Unparker(core))
}

#[derive(Debug)]
struct ParkCore {
    state: Mutex<ParkState>,
    wakeup: Condvar,
}

/// One-shot park state machine.
#[derive(Debug, PartialEq, Eq)]
enum ParkState {
    /// Neither side has acted yet.
    Empty,

    /// The task is blocked waiting to be unparked.
    Parked,

    /// The unpark has fired; a parked task is released, a future park
    /// returns immediately.
    Notified,
}

/// Task-side handle: blocks the calling thread until unparked.
#[derive(Debug)]
pub(crate) struct Parker(Arc<ParkCore>);

impl Parker {
    /// Suspends until the matching [`Unparker`] fires. Returns immediately
    /// if it already has. Consumes the parker; the pair is single-use.
    pub(crate) fn park(self) {
        let mut state = self.0.state.lock().expect("park state poisoned");
        match *state {
            ParkState::Notified => return,
            ParkState::Empty => *state = ParkState::Parked,
            ParkState::Parked => unreachable!("task parked twice on one continuation"),
        }

        while *state != ParkState::Notified {
            state = self.0.wakeup.wait(state).expect("park state poisoned");
        }
    }
}

/// Scheduler-side handle: releases the parked task.
#[derive(Debug)]
pub(crate) struct Unparker(Arc<ParkCore>);

impl Unparker {
    /// Wakes the parked task; safe to call before it parks.
    pub(crate) fn unpark(self) {
        let mut state = self.0.state.lock().expect("park state poisoned");
        assert!(
            *state != ParkState::Notified,
            "continuation unparked twice"
        );
        *state = ParkState::Notified;
        self.0.wakeup.notify_one();
    }
}
