//! The kernel: serializes event evaluation and drives the continuation
//! protocol.
//!
//! A [`Kernel`] owns the simulated clock, the pending-event queue and the
//! event arena. Its loop pops the earliest event, evaluates it on a worker
//! task, and waits on a one-shot publication slot for the task's outcome:
//! completed, failed, blocked on another entity, or the end sentinel. The
//! slot has two possible writers, normal task completion and the
//! blocking-call primitive, which is what lets a task park itself mid-call
//! while the scheduler moves on to the event it is waiting for.
//!
//! The kernel is driven through the controllers in [`crate::controller`] and
//! accessed through two handles: [`Sim`], cloneable and usable from any
//! thread, and [`EventContext`], which exists only inside a running event
//! task and additionally offers the blocking-call primitive.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe, Location};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use slab::Slab;
use tracing::{debug, trace};

use crate::continuation::{self, BlockingResult, Continuation};
use crate::entity::EntityRef;
use crate::event::{EventId, EventInfo, EventPayload, EventRecord};
use crate::queue::TimeQueue;
use crate::tasks::TaskRuntime;
use crate::value::{Args, Value};
use crate::{ClearError, DomainError, ScheduleError, SimulationError};

/// Behavior when an event is posted at a time before the current instant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum PastEvents {
    /// Reject the post with [`ScheduleError::BackInTime`]. Rewinding the
    /// clock is almost always a logic bug in entity code.
    #[default]
    Reject,

    /// Silently post at the current instant instead.
    Clamp,
}

/// Kernel configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Simulation name, echoed in [`Report`].
    pub name: String,

    /// Capture the `file:line` of every post.
    pub debug_events: bool,

    /// Keep weak backlinks from each event to the event that raised it.
    pub track_sources: bool,

    /// Policy for posts scheduled before the current instant.
    pub past_events: PastEvents,

    /// Upper bound on a single evaluation, typically paired with the paced
    /// controller. Expiry tears the simulation down with
    /// [`SimulationError::Stalled`].
    pub eval_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            name: "simulation".to_string(),
            debug_events: false,
            track_sources: false,
            past_events: PastEvents::Reject,
            eval_timeout: None,
        }
    }
}

/// Statistics collected across a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// Simulation name from [`Config`].
    pub name: String,

    /// Simulated clock when the run started.
    pub sim_start: i64,

    /// Simulated clock after the most recently dispatched event.
    pub sim_end: i64,

    /// Entity events dispatched; the end sentinel is not counted.
    pub total_events: u64,

    /// Dispatch count per method signature.
    pub spectrum: HashMap<String, u64>,
}

/// Sink for per-event dispatch records, installed with
/// [`Sim::set_event_logger`].
pub trait EventLogger: Send {
    /// Called once per dispatched event, before its body runs.
    fn event_dispatched(&mut self, event: &EventInfo);
}

impl<F: FnMut(&EventInfo) + Send> EventLogger for F {
    fn event_dispatched(&mut self, event: &EventInfo) {
        self(event)
    }
}

/// What one call to [`Kernel::step`] did.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Step {
    /// Dispatched one event; more may be pending.
    Event,

    /// The queue was empty; nothing to do.
    Idle,

    /// The end sentinel was dispatched; the simulation is over.
    Ended,
}

/// Outcome of evaluating one event, published by the running task.
pub(crate) enum Outcome {
    /// The event returned normally.
    Completed(Value),

    /// The event raised a domain error.
    Failed(DomainError),

    /// The event issued a blocking call and parked its task.
    Blocked {
        blocking: EventId,
        continuing: EventId,
    },

    /// The end sentinel.
    Ended,
}

/// One-shot publication slot between the scheduler and the running task.
///
/// Written by either normal task completion or the blocking-call primitive;
/// a second write during one evaluation is a kernel bug.
struct Slot {
    state: Mutex<Option<Outcome>>,
    published: Condvar,
}

impl Slot {
    fn new() -> Self {
        Slot {
            state: Mutex::new(None),
            published: Condvar::new(),
        }
    }

    fn publish(&self, outcome: Outcome) {
        let mut state = self.state.lock().expect("publication slot poisoned");
        assert!(state.is_none(), "evaluation outcome published twice");
        *state = Some(outcome);
        self.published.notify_one();
    }

    fn wait(&self) -> Outcome {
        let mut state = self.state.lock().expect("publication slot poisoned");
        loop {
            if let Some(outcome) = state.take() {
                return outcome;
            }
            state = self
                .published
                .wait(state)
                .expect("publication slot poisoned");
        }
    }

    /// Like [`Slot::wait`] with an upper bound; `None` on expiry.
    fn wait_timeout(&self, limit: Duration) -> Option<Outcome> {
        let deadline = Instant::now() + limit;
        let mut state = self.state.lock().expect("publication slot poisoned");
        loop {
            if let Some(outcome) = state.take() {
                return Some(outcome);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .published
                .wait_timeout(state, deadline - now)
                .expect("publication slot poisoned");
            state = guard;
        }
    }
}

/// Mutable scheduler state, shared behind one lock.
struct Inner {
    time: i64,
    queue: TimeQueue,
    arena: Slab<EventRecord>,
    next_stamp: u64,

    /// Set for the duration of one evaluation.
    current: Option<EventId>,
    current_caller: Option<EventId>,

    /// Tasks parked on a continuation.
    parked: usize,

    sim_start: i64,
    sim_end: i64,
    total_events: u64,
    spectrum: HashMap<String, u64>,

    logger: Option<Box<dyn EventLogger>>,
    debug_events: bool,
    track_sources: bool,
}

impl Inner {
    fn get(&self, id: EventId) -> Option<&EventRecord> {
        self.arena.get(id.index).filter(|record| record.stamp == id.stamp)
    }

    fn get_mut(&mut self, id: EventId) -> Option<&mut EventRecord> {
        self.arena
            .get_mut(id.index)
            .filter(|record| record.stamp == id.stamp)
    }

    fn alloc(
        &mut self,
        time: i64,
        payload: EventPayload,
        caller: Option<EventId>,
        raised_at: Option<String>,
    ) -> EventId {
        let stamp = self.next_stamp;
        self.next_stamp += 1;

        let source = if self.track_sources { self.current } else { None };
        let index = self.arena.insert(EventRecord {
            stamp,
            time,
            seq: 0,
            payload,
            caller,
            continuation: None,
            source,
            raised_at,
        });

        EventId { index, stamp }
    }

    fn remove(&mut self, id: EventId) -> EventRecord {
        let record = self
            .arena
            .try_remove(id.index)
            .expect("event record already reclaimed");
        assert_eq!(record.stamp, id.stamp, "event record already reclaimed");
        record
    }

    fn enqueue(&mut self, id: EventId) {
        let time = self.get(id).expect("enqueuing a reclaimed event").time;
        let seq = self.queue.insert(time, id);
        self.get_mut(id).expect("enqueuing a reclaimed event").seq = seq;
        trace!(time, seq, "enqueued event");
    }

    /// Stores the blocking result into `caller`'s continuation and
    /// re-injects the caller at the current instant, FIFO with its peers.
    fn resume_caller(&mut self, caller: EventId, result: BlockingResult) {
        let now = self.time;
        let record = self.get_mut(caller).expect("caller event reclaimed");
        record
            .continuation
            .as_ref()
            .expect("caller event has no continuation")
            .resume(result);
        record.time = now;
        self.enqueue(caller);
    }

    fn record_stats(&mut self, record: &EventRecord) {
        self.total_events += 1;
        *self.spectrum.entry(record.signature()).or_insert(0) += 1;
    }

    fn info(&self, id: EventId) -> EventInfo {
        let record = self.get(id).expect("inspecting a reclaimed event");
        EventInfo {
            time: record.time,
            seq: record.seq,
            signature: record.signature(),
            resumption: record.continuation.is_some()
                || matches!(record.payload, EventPayload::Resume { .. }),
            raised_at: record.raised_at.clone(),
            source: record
                .source
                .and_then(|source| self.get(source))
                .map(EventRecord::signature),
        }
    }

    fn debug_location(&self, location: &'static Location<'static>) -> Option<String> {
        self.debug_events
            .then(|| format!("{}:{}", location.file(), location.line()))
    }
}

/// What [`Kernel::evaluate`] found to run.
enum Mode {
    Fresh {
        target: EntityRef,
        ordinal: u32,
        args: Args,
    },
    Resumption(Continuation),
    End,
}

/// The scheduler core shared by every controller variant and handle.
pub(crate) struct Kernel {
    inner: Mutex<Inner>,
    slot: Slot,

    /// Held for the duration of each evaluation; one event at a time.
    serializer: Mutex<()>,

    interrupted: AtomicBool,
    tasks: TaskRuntime,
    myself: Weak<Kernel>,

    name: String,
    past_events: PastEvents,
    eval_timeout: Option<Duration>,
}

impl Kernel {
    pub(crate) fn new(config: Config) -> Arc<Self> {
        Arc::new_cyclic(|myself| Kernel {
            inner: Mutex::new(Inner {
                time: 0,
                queue: TimeQueue::new(),
                arena: Slab::new(),
                next_stamp: 0,
                current: None,
                current_caller: None,
                parked: 0,
                sim_start: 0,
                sim_end: 0,
                total_events: 0,
                spectrum: HashMap::new(),
                logger: None,
                debug_events: config.debug_events,
                track_sources: config.track_sources,
            }),
            slot: Slot::new(),
            serializer: Mutex::new(()),
            interrupted: AtomicBool::new(false),
            tasks: TaskRuntime::new(),
            myself: myself.clone(),
            name: config.name,
            past_events: config.past_events,
            eval_timeout: config.eval_timeout,
        })
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("scheduler state poisoned")
    }

    fn resolve_time(&self, requested: i64, now: i64) -> Result<i64, ScheduleError> {
        if requested >= now {
            return Ok(requested);
        }
        match self.past_events {
            PastEvents::Reject => Err(ScheduleError::BackInTime { requested, now }),
            PastEvents::Clamp => Ok(now),
        }
    }

    // ---------------------------------------------------------------- posts

    pub(crate) fn post_event(
        &self,
        target: EntityRef,
        ordinal: u32,
        args: Args,
        location: &'static Location<'static>,
    ) {
        let mut inner = self.lock_inner();
        let raised_at = inner.debug_location(location);
        let time = inner.time;
        let id = inner.alloc(
            time,
            EventPayload::Call {
                target,
                ordinal,
                args,
            },
            None,
            raised_at,
        );
        inner.enqueue(id);
    }

    pub(crate) fn post_event_at(
        &self,
        time: i64,
        target: EntityRef,
        ordinal: u32,
        args: Args,
        location: &'static Location<'static>,
    ) -> Result<(), ScheduleError> {
        let mut inner = self.lock_inner();
        let time = self.resolve_time(time, inner.time)?;
        let raised_at = inner.debug_location(location);
        let id = inner.alloc(
            time,
            EventPayload::Call {
                target,
                ordinal,
                args,
            },
            None,
            raised_at,
        );
        inner.enqueue(id);
        Ok(())
    }

    pub(crate) fn post_end_now(&self) {
        let mut inner = self.lock_inner();
        let time = inner.time;
        let id = inner.alloc(time, EventPayload::End, None, None);
        inner.enqueue(id);
    }

    pub(crate) fn post_end_at(&self, time: i64) -> Result<(), ScheduleError> {
        let mut inner = self.lock_inner();
        let time = self.resolve_time(time, inner.time)?;
        let id = inner.alloc(time, EventPayload::End, None, None);
        inner.enqueue(id);
        Ok(())
    }

    // ------------------------------------------------------- blocking calls

    /// The blocking-call primitive. Allocates the blocking event and a
    /// continuing clone of the current event, publishes them to the
    /// scheduler, and parks the calling task until the blocking event
    /// completes.
    pub(crate) fn post_continuing_event(
        &self,
        target: EntityRef,
        ordinal: u32,
        args: Args,
        location: &'static Location<'static>,
    ) -> Result<Value, DomainError> {
        let (continuation, suspension) = continuation::continuation();

        let (blocking, continuing) = {
            let mut inner = self.lock_inner();
            let now = inner.time;
            let current = inner
                .current
                .expect("blocking call issued outside a running event");
            let chain_caller = inner.current_caller;

            let (current_target, current_ordinal, current_source) = {
                let record = inner.get(current).expect("current event reclaimed");
                match &record.payload {
                    EventPayload::Call {
                        target, ordinal, ..
                    }
                    | EventPayload::Resume { target, ordinal } => {
                        (target.clone(), *ordinal, record.source)
                    }
                    EventPayload::End => unreachable!("the end sentinel has no task"),
                }
            };

            let raised_at = inner.debug_location(location);
            let blocking = inner.alloc(
                now,
                EventPayload::Call {
                    target,
                    ordinal,
                    args,
                },
                None,
                raised_at.clone(),
            );

            // The continuing event carries the chain's original caller, so
            // deep nested blocking calls unwind correctly.
            let continuing = inner.alloc(
                now,
                EventPayload::Resume {
                    target: current_target,
                    ordinal: current_ordinal,
                },
                chain_caller,
                raised_at,
            );

            let record = inner.get_mut(continuing).expect("continuing event reclaimed");
            record.continuation = Some(continuation);
            record.source = current_source;
            if inner.track_sources {
                // The raiser's identity lives on as the continuing event.
                inner.get_mut(blocking).expect("blocking event reclaimed").source =
                    Some(continuing);
            }

            inner.parked += 1;
            (blocking, continuing)
        };

        debug!(ordinal, "event blocked on a continuing call");
        self.slot.publish(Outcome::Blocked {
            blocking,
            continuing,
        });

        let result = suspension.wait();
        self.lock_inner().parked -= 1;
        result
    }

    // ------------------------------------------------------------ clock etc

    pub(crate) fn current_time(&self) -> i64 {
        self.lock_inner().time
    }

    pub(crate) fn advance(&self, duration: i64) {
        assert!(duration >= 0, "advance by a negative duration");
        let mut inner = self.lock_inner();
        inner.time += duration;
        trace!(time = inner.time, "advanced clock");
    }

    pub(crate) fn current_event(&self) -> Option<EventInfo> {
        let inner = self.lock_inner();
        inner.current.map(|id| inner.info(id))
    }

    pub(crate) fn pending_events(&self) -> usize {
        self.lock_inner().queue.len()
    }

    pub(crate) fn next_event_time(&self) -> Option<i64> {
        self.lock_inner().queue.peek_min().map(|entry| entry.time)
    }

    pub(crate) fn is_quiescent(&self) -> bool {
        let inner = self.lock_inner();
        inner.queue.is_empty() && inner.current.is_none() && inner.parked == 0
    }

    pub(crate) fn live_events(&self) -> usize {
        self.lock_inner().arena.len()
    }

    pub(crate) fn set_debug_events(&self, on: bool) {
        self.lock_inner().debug_events = on;
    }

    pub(crate) fn set_track_sources(&self, on: bool) {
        self.lock_inner().track_sources = on;
    }

    pub(crate) fn set_event_logger(&self, logger: Option<Box<dyn EventLogger>>) {
        self.lock_inner().logger = logger;
    }

    pub(crate) fn report(&self) -> Report {
        let inner = self.lock_inner();
        Report {
            name: self.name.clone(),
            sim_start: inner.sim_start,
            sim_end: inner.sim_end,
            total_events: inner.total_events,
            spectrum: inner.spectrum.clone(),
        }
    }

    /// Resets clock, queue, arena and statistics. Only legal while no event
    /// is running and no task is parked.
    pub(crate) fn clear(&self) -> Result<(), ClearError> {
        let mut inner = self.lock_inner();
        if inner.current.is_some() || inner.parked > 0 {
            return Err(ClearError::Busy);
        }

        inner.queue.clear();
        inner.arena.clear();
        inner.time = 0;
        inner.sim_start = 0;
        inner.sim_end = 0;
        inner.total_events = 0;
        inner.spectrum.clear();
        self.interrupted.store(false, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Relaxed)
    }

    pub(crate) fn clear_interrupted(&self) {
        self.interrupted.store(false, Ordering::Relaxed);
    }

    // ------------------------------------------------------------- the loop

    /// Processes events until the queue drains, the end sentinel arrives, an
    /// uncaught failure aborts, or the kernel is interrupted.
    pub(crate) fn run(&self) -> Result<(), SimulationError> {
        {
            let mut inner = self.lock_inner();
            inner.sim_start = inner.time;
        }
        debug!(name = %self.name, "simulation started");

        loop {
            match self.step()? {
                Step::Event => continue,
                Step::Idle => {
                    debug!(name = %self.name, "queue drained");
                    return Ok(());
                }
                Step::Ended => {
                    debug!(name = %self.name, "simulation ended");
                    return Ok(());
                }
            }
        }
    }

    /// Pops and processes exactly one event.
    pub(crate) fn step(&self) -> Result<Step, SimulationError> {
        self.step_with(|_| {})
    }

    /// [`Kernel::step`] with a pacing hook, called between popping an event
    /// and evaluating it with the lock released. The paced controller sleeps
    /// there.
    pub(crate) fn step_with(&self, pace: impl FnOnce(i64)) -> Result<Step, SimulationError> {
        if self.is_interrupted() {
            return Err(SimulationError::Interrupted);
        }

        let next = {
            let mut inner = self.lock_inner();
            match inner.queue.pop_min() {
                None => return Ok(Step::Idle),
                Some(entry) => {
                    // An advance may have moved the clock past this event's
                    // scheduled time; the clock never rewinds.
                    if inner.time < entry.time {
                        inner.time = entry.time;
                    }
                    entry
                }
            }
        };

        pace(next.time);

        let outcome = self.evaluate(next.event)?;
        self.dispatch(next.event, outcome)
    }

    /// The serialization point: runs one event on its task and waits for the
    /// published outcome. Exactly one evaluation is ever in flight.
    fn evaluate(&self, id: EventId) -> Result<Outcome, SimulationError> {
        let _serial = self.serializer.lock().expect("serializer poisoned");

        let mode = {
            let mut inner = self.lock_inner();
            assert!(inner.current.is_none(), "nested event evaluation");

            let caller;
            let mode;
            {
                let record = inner.get_mut(id).expect("scheduled event reclaimed");
                caller = record.caller;
                mode = if let Some(continuation) = record.continuation.take() {
                    Mode::Resumption(continuation)
                } else {
                    match &mut record.payload {
                        EventPayload::Call {
                            target,
                            ordinal,
                            args,
                        } => Mode::Fresh {
                            target: target.clone(),
                            ordinal: *ordinal,
                            args: std::mem::take(args),
                        },
                        EventPayload::Resume { .. } => {
                            unreachable!("resumption scheduled without a continuation")
                        }
                        EventPayload::End => Mode::End,
                    }
                };
            }

            inner.current = Some(id);
            inner.current_caller = caller;

            if inner.logger.is_some() {
                let info = inner.info(id);
                if let Some(logger) = inner.logger.as_mut() {
                    logger.event_dispatched(&info);
                }
            }

            mode
        };

        match mode {
            Mode::End => {
                let mut inner = self.lock_inner();
                inner.current = None;
                inner.current_caller = None;
                return Ok(Outcome::Ended);
            }
            Mode::Resumption(continuation) => {
                trace!("resuming parked task");
                continuation.unpark();
            }
            Mode::Fresh {
                target,
                ordinal,
                args,
            } => {
                let kernel = self.myself.upgrade().expect("kernel dropped mid-evaluation");
                trace!(ordinal, "spawning event task");
                self.tasks.spawn(move || {
                    let ctx = EventContext::new(kernel.clone());
                    let result =
                        panic::catch_unwind(AssertUnwindSafe(|| target.invoke(&ctx, ordinal, args)));
                    let outcome = match result {
                        Ok(Ok(value)) => Outcome::Completed(value),
                        Ok(Err(error)) => Outcome::Failed(error),
                        Err(payload) => Outcome::Failed(DomainError::from_panic(payload)),
                    };
                    kernel.slot.publish(outcome);
                });
            }
        }

        let outcome = match self.eval_timeout {
            None => self.slot.wait(),
            Some(limit) => match self.slot.wait_timeout(limit) {
                Some(outcome) => outcome,
                // The task is lost; the simulation is tearing down.
                None => return Err(SimulationError::Stalled),
            },
        };

        let mut inner = self.lock_inner();
        inner.current = None;
        inner.current_caller = None;
        Ok(outcome)
    }

    /// Routes one evaluation outcome: resume the caller, propagate the
    /// failure, splice the blocked pair, or end.
    fn dispatch(&self, id: EventId, outcome: Outcome) -> Result<Step, SimulationError> {
        let mut inner = self.lock_inner();
        let step = match outcome {
            Outcome::Completed(value) => {
                let record = inner.remove(id);
                inner.record_stats(&record);
                if let Some(caller) = record.caller {
                    inner.resume_caller(caller, Ok(value));
                }
                Ok(Step::Event)
            }
            Outcome::Failed(error) => {
                let record = inner.remove(id);
                inner.record_stats(&record);
                match record.caller {
                    Some(caller) => {
                        inner.resume_caller(caller, Err(error));
                        Ok(Step::Event)
                    }
                    None => {
                        debug!(%error, "event failed with no caller");
                        Err(SimulationError::Failure(error))
                    }
                }
            }
            Outcome::Blocked {
                blocking,
                continuing,
            } => {
                // The blocked event's identity lives on as `continuing`;
                // the blocking event resumes it on completion.
                let record = inner.remove(id);
                inner.record_stats(&record);
                inner
                    .get_mut(blocking)
                    .expect("blocking event reclaimed")
                    .caller = Some(continuing);
                inner.enqueue(blocking);
                Ok(Step::Event)
            }
            Outcome::Ended => {
                inner.remove(id);
                Ok(Step::Ended)
            }
        };
        inner.sim_end = inner.time;
        step
    }
}

// -------------------------------------------------------------------- handles

/// Cloneable handle to a scheduler, usable from any thread.
///
/// Obtained from a controller or from [`EventContext::sim`]. Posting is
/// always safe: every queue mutation happens behind the kernel's state lock.
#[derive(Clone)]
pub struct Sim {
    kernel: Arc<Kernel>,
}

impl Sim {
    pub(crate) fn new(kernel: Arc<Kernel>) -> Self {
        Sim { kernel }
    }

    /// Enqueues an invocation of `target`'s method `ordinal` at the current
    /// instant.
    #[track_caller]
    pub fn post_event(&self, target: &EntityRef, ordinal: u32, args: Args) {
        self.kernel
            .post_event(Arc::clone(target), ordinal, args, Location::caller());
    }

    /// Enqueues an invocation at `time`. A time before the current instant
    /// is rejected or clamped per [`Config::past_events`].
    #[track_caller]
    pub fn post_event_at(
        &self,
        time: i64,
        target: &EntityRef,
        ordinal: u32,
        args: Args,
    ) -> Result<(), ScheduleError> {
        self.kernel
            .post_event_at(time, Arc::clone(target), ordinal, args, Location::caller())
    }

    /// Reads the simulated clock.
    pub fn current_time(&self) -> i64 {
        self.kernel.current_time()
    }

    /// The event currently being evaluated, if any.
    pub fn current_event(&self) -> Option<EventInfo> {
        self.kernel.current_event()
    }

    /// Adds `duration` to the simulated clock without suspending anyone.
    ///
    /// Outside an event this is intended for quiescent use between runs.
    pub fn advance(&self, duration: i64) {
        self.kernel.advance(duration);
    }

    /// Schedules the end sentinel at the current instant. Events already
    /// pending at this instant run first, in FIFO order.
    pub fn end_simulation(&self) {
        self.kernel.post_end_now();
    }

    /// Schedules the end sentinel at `time`. Events posted later at the same
    /// instant are cleanly abandoned.
    pub fn end_simulation_at(&self, time: i64) -> Result<(), ScheduleError> {
        self.kernel.post_end_at(time)
    }

    /// Number of events waiting in the queue.
    pub fn pending_events(&self) -> usize {
        self.kernel.pending_events()
    }

    /// Simulated time of the earliest pending event, if any.
    pub fn next_event_time(&self) -> Option<i64> {
        self.kernel.next_event_time()
    }

    /// Whether nothing is queued, running or parked. [`Sim::advance`] and
    /// [`Sim::clear`] are meant for this state.
    pub fn is_quiescent(&self) -> bool {
        self.kernel.is_quiescent()
    }

    /// Number of live event records, pending or mid-protocol. Returns to
    /// zero once a run completes; useful for leak diagnostics.
    pub fn live_events(&self) -> usize {
        self.kernel.live_events()
    }

    /// Captures the `file:line` of each post on its event.
    pub fn set_debug_events(&self, on: bool) {
        self.kernel.set_debug_events(on);
    }

    /// Keeps weak backlinks from each event to the event that raised it.
    pub fn set_track_sources(&self, on: bool) {
        self.kernel.set_track_sources(on);
    }

    /// Installs (or removes) the per-event dispatch sink.
    pub fn set_event_logger(&self, logger: Option<Box<dyn EventLogger>>) {
        self.kernel.set_event_logger(logger);
    }

    /// Statistics for the run so far.
    pub fn report(&self) -> Report {
        self.kernel.report()
    }

    /// Resets the scheduler. Fails while an event is running or a task is
    /// parked.
    pub fn clear(&self) -> Result<(), ClearError> {
        self.kernel.clear()
    }
}

impl std::fmt::Debug for Sim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sim")
            .field("name", &self.kernel.name)
            .field("time", &self.kernel.current_time())
            .finish()
    }
}

/// Handle passed to a running event body.
///
/// Created by the kernel for each event task; it never leaves that task,
/// which is what makes [`EventContext::post_continuing_event`] sound: only
/// the one running task can park itself.
pub struct EventContext {
    kernel: Arc<Kernel>,
    // Pins the context to its task's thread.
    _not_send: PhantomData<*const ()>,
}

impl EventContext {
    pub(crate) fn new(kernel: Arc<Kernel>) -> Self {
        EventContext {
            kernel,
            _not_send: PhantomData,
        }
    }

    /// A [`Sim`] handle to the same scheduler, for storing or sharing.
    pub fn sim(&self) -> Sim {
        Sim::new(self.kernel.clone())
    }

    /// Enqueues an invocation at the current instant; never blocks.
    #[track_caller]
    pub fn post_event(&self, target: &EntityRef, ordinal: u32, args: Args) {
        self.kernel
            .post_event(Arc::clone(target), ordinal, args, Location::caller());
    }

    /// Enqueues an invocation at `time`, subject to [`Config::past_events`].
    #[track_caller]
    pub fn post_event_at(
        &self,
        time: i64,
        target: &EntityRef,
        ordinal: u32,
        args: Args,
    ) -> Result<(), ScheduleError> {
        self.kernel
            .post_event_at(time, Arc::clone(target), ordinal, args, Location::caller())
    }

    /// Invokes `target`'s method `ordinal` as a blocking call: the calling
    /// task parks until the posted event completes, then resumes with its
    /// return value, or re-raises its error here.
    ///
    /// The clock observed after this call is the instant the callee
    /// completed at.
    #[track_caller]
    pub fn post_continuing_event(
        &self,
        target: &EntityRef,
        ordinal: u32,
        args: Args,
    ) -> Result<Value, DomainError> {
        self.kernel
            .post_continuing_event(Arc::clone(target), ordinal, args, Location::caller())
    }

    /// Adds `duration` to the clock, modeling active work; does not suspend.
    pub fn advance(&self, duration: i64) {
        self.kernel.advance(duration);
    }

    /// Reads the simulated clock.
    pub fn current_time(&self) -> i64 {
        self.kernel.current_time()
    }

    /// The event this task is running.
    pub fn current_event(&self) -> Option<EventInfo> {
        self.kernel.current_event()
    }

    /// Schedules the end sentinel at the current instant.
    pub fn end_simulation(&self) {
        self.kernel.post_end_now();
    }

    /// Schedules the end sentinel at `time`.
    pub fn end_simulation_at(&self, time: i64) -> Result<(), ScheduleError> {
        self.kernel.post_end_at(time)
    }
}
