//! Kernel-level guarantees: ordering, serialization, the blocking protocol,
//! ordinal stability, and reclamation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use prime_mover::{
    args, value, Args, ClearError, Config, Controller, DomainError, Entity, EntityRef,
    EventContext, MethodTable, PacedController, PastEvents, ScheduleError, SimulationError, Value,
};

/// Records every dispatch as `(time, tag)`.
struct Probe {
    seen: Arc<Mutex<Vec<(i64, i64)>>>,
}

impl Entity for Probe {
    fn invoke(&self, ctx: &EventContext, _ordinal: u32, mut args: Args) -> Result<Value, DomainError> {
        let tag: i64 = value::downcast(args.remove(0))?;
        self.seen.lock().unwrap().push((ctx.current_time(), tag));
        Ok(value::unit())
    }

    fn signature(&self, _ordinal: u32) -> String {
        "Probe.observe(tag)".to_string()
    }
}

fn probe() -> (EntityRef, Arc<Mutex<Vec<(i64, i64)>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let entity: EntityRef = Arc::new(Probe { seen: seen.clone() });
    (entity, seen)
}

/// Replies with its argument, optionally advancing the clock first.
struct Echo {
    delay: i64,
}

impl Entity for Echo {
    fn invoke(&self, ctx: &EventContext, _ordinal: u32, mut args: Args) -> Result<Value, DomainError> {
        if self.delay > 0 {
            ctx.advance(self.delay);
        }
        Ok(args.remove(0))
    }

    fn signature(&self, _ordinal: u32) -> String {
        "Echo.echo(v)".to_string()
    }
}

#[test]
fn dispatch_times_never_decrease() {
    let controller = Controller::new();
    let sim = controller.handle();
    let (entity, seen) = probe();

    for (tag, time) in [(1i64, 5i64), (2, 1), (3, 9), (4, 1), (5, 3), (6, 7)] {
        sim.post_event_at(time, &entity, 0, args![tag]).unwrap();
    }
    controller.run().unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 6);
    for pair in seen.windows(2) {
        assert!(pair[0].0 <= pair[1].0, "clock went backwards: {pair:?}");
    }
    // Ties at t=1 kept their posting order.
    assert_eq!(seen[0], (1, 2));
    assert_eq!(seen[1], (1, 4));
}

#[test]
fn only_one_event_body_runs_at_a_time() {
    struct Overlapping {
        running: AtomicU64,
    }

    impl Entity for Overlapping {
        fn invoke(&self, _ctx: &EventContext, _ordinal: u32, _args: Args) -> Result<Value, DomainError> {
            let already_running = self.running.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(2));
            self.running.fetch_sub(1, Ordering::SeqCst);

            if already_running != 0 {
                return Err(DomainError::new("two event bodies ran concurrently"));
            }
            Ok(value::unit())
        }

        fn signature(&self, _ordinal: u32) -> String {
            "Overlapping.check()".to_string()
        }
    }

    let controller = Controller::new();
    let sim = controller.handle();
    let entity: EntityRef = Arc::new(Overlapping {
        running: AtomicU64::new(0),
    });

    for time in 0..20 {
        sim.post_event_at(time % 4, &entity, 0, args![]).unwrap();
    }

    controller.run().unwrap();
    assert_eq!(controller.report().total_events, 20);
}

#[test]
fn blocking_round_trip_preserves_value_and_clock() {
    struct Caller {
        echo: EntityRef,
        observed: Arc<Mutex<Option<(i64, i64)>>>,
    }

    impl Entity for Caller {
        fn invoke(&self, ctx: &EventContext, _ordinal: u32, _args: Args) -> Result<Value, DomainError> {
            let before = ctx.current_time();
            let reply = ctx.post_continuing_event(&self.echo, 0, args![11i64])?;
            let reply: i64 = value::downcast(reply)?;
            assert_eq!(ctx.current_time(), before, "callee did no work");
            *self.observed.lock().unwrap() = Some((reply, ctx.current_time()));
            Ok(value::unit())
        }

        fn signature(&self, _ordinal: u32) -> String {
            "Caller.call()".to_string()
        }
    }

    let controller = Controller::new();
    let sim = controller.handle();
    let observed = Arc::new(Mutex::new(None));
    let caller: EntityRef = Arc::new(Caller {
        echo: Arc::new(Echo { delay: 0 }),
        observed: observed.clone(),
    });

    sim.post_event_at(3, &caller, 0, args![]).unwrap();
    controller.run().unwrap();

    assert_eq!(*observed.lock().unwrap(), Some((11, 3)));
}

#[test]
fn nested_blocking_calls_unwind_in_order() {
    struct Middle {
        next: EntityRef,
    }

    impl Entity for Middle {
        fn invoke(&self, ctx: &EventContext, _ordinal: u32, _args: Args) -> Result<Value, DomainError> {
            let v = ctx.post_continuing_event(&self.next, 0, args![1i64])?;
            let v: i64 = value::downcast(v)?;
            Ok(value::value(v + 1))
        }

        fn signature(&self, _ordinal: u32) -> String {
            "Middle.relay()".to_string()
        }
    }

    struct Outer {
        next: EntityRef,
        observed: Arc<Mutex<Option<(i64, i64)>>>,
    }

    impl Entity for Outer {
        fn invoke(&self, ctx: &EventContext, _ordinal: u32, _args: Args) -> Result<Value, DomainError> {
            let v = ctx.post_continuing_event(&self.next, 0, args![])?;
            let v: i64 = value::downcast(v)?;
            *self.observed.lock().unwrap() = Some((v, ctx.current_time()));
            Ok(value::unit())
        }

        fn signature(&self, _ordinal: u32) -> String {
            "Outer.begin()".to_string()
        }
    }

    let controller = Controller::new();
    let sim = controller.handle();
    let observed = Arc::new(Mutex::new(None));

    let innermost: EntityRef = Arc::new(Echo { delay: 7 });
    let middle: EntityRef = Arc::new(Middle { next: innermost });
    let outer: EntityRef = Arc::new(Outer {
        next: middle,
        observed: observed.clone(),
    });

    sim.post_event(&outer, 0, args![]);
    controller.run().unwrap();

    // The innermost echo returned 1 at t=7; the middle layer added 1.
    assert_eq!(*observed.lock().unwrap(), Some((2, 7)));
    assert_eq!(sim.current_time(), 7);

    // Outer, middle, innermost, plus one continuation for each blocker.
    assert_eq!(controller.report().total_events, 5);
}

#[test]
fn a_resumed_event_waits_its_turn_among_equal_time_peers() {
    struct BlockThenLog {
        callee: EntityRef,
        log: Arc<Mutex<Vec<(i64, i64)>>>,
    }

    impl Entity for BlockThenLog {
        fn invoke(&self, ctx: &EventContext, _ordinal: u32, _args: Args) -> Result<Value, DomainError> {
            ctx.post_continuing_event(&self.callee, 0, args![0i64])?;
            self.log.lock().unwrap().push((ctx.current_time(), 20));
            Ok(value::unit())
        }

        fn signature(&self, _ordinal: u32) -> String {
            "BlockThenLog.call()".to_string()
        }
    }

    let controller = Controller::new();
    let sim = controller.handle();
    let (entity, seen) = probe();

    let blocker: EntityRef = Arc::new(BlockThenLog {
        callee: Arc::new(Echo { delay: 0 }),
        log: seen.clone(),
    });

    // The blocker runs first, but its continuation is enqueued behind the
    // probe event already waiting at the same instant.
    sim.post_event(&blocker, 0, args![]);
    sim.post_event(&entity, 0, args![10i64]);
    controller.run().unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![(0, 10), (0, 20)]);
}

#[test]
fn uncaught_failure_aborts_the_run() {
    struct Failing;

    impl Entity for Failing {
        fn invoke(&self, _ctx: &EventContext, _ordinal: u32, _args: Args) -> Result<Value, DomainError> {
            Err(DomainError::new("unhandled"))
        }

        fn signature(&self, _ordinal: u32) -> String {
            "Failing.fail()".to_string()
        }
    }

    let controller = Controller::new();
    let sim = controller.handle();
    let entity: EntityRef = Arc::new(Failing);

    sim.post_event(&entity, 0, args![]);

    match controller.run() {
        Err(SimulationError::Failure(error)) => assert_eq!(error.message(), "unhandled"),
        other => panic!("expected a simulation failure, got {other:?}"),
    }
}

#[test]
fn a_panicking_event_becomes_a_domain_error() {
    struct Panicking;

    impl Entity for Panicking {
        fn invoke(&self, _ctx: &EventContext, _ordinal: u32, _args: Args) -> Result<Value, DomainError> {
            panic!("kaboom");
        }

        fn signature(&self, _ordinal: u32) -> String {
            "Panicking.explode()".to_string()
        }
    }

    struct Shielded {
        inner: EntityRef,
        caught: Arc<Mutex<Option<String>>>,
    }

    impl Entity for Shielded {
        fn invoke(&self, ctx: &EventContext, _ordinal: u32, _args: Args) -> Result<Value, DomainError> {
            match ctx.post_continuing_event(&self.inner, 0, args![]) {
                Ok(_) => Err(DomainError::new("the callee always panics")),
                Err(error) => {
                    *self.caught.lock().unwrap() = Some(error.message().to_string());
                    Ok(value::unit())
                }
            }
        }

        fn signature(&self, _ordinal: u32) -> String {
            "Shielded.call()".to_string()
        }
    }

    // Uncaught: the panic surfaces as a simulation failure.
    let controller = Controller::new();
    controller.handle().post_event(&(Arc::new(Panicking) as EntityRef), 0, args![]);
    match controller.run() {
        Err(SimulationError::Failure(error)) => assert!(error.message().contains("kaboom")),
        other => panic!("expected a simulation failure, got {other:?}"),
    }

    // Caught through a blocking call: the simulation carries on.
    let controller = Controller::new();
    let caught = Arc::new(Mutex::new(None));
    let shielded: EntityRef = Arc::new(Shielded {
        inner: Arc::new(Panicking),
        caught: caught.clone(),
    });
    controller.handle().post_event(&shielded, 0, args![]);
    controller.run().unwrap();

    assert!(caught.lock().unwrap().as_deref().unwrap().contains("kaboom"));
}

#[test]
fn ordinal_assignment_is_stable_across_rebuilds() {
    let declarations = [
        ("transfer", "(i64,i64)"),
        ("balance", "()"),
        ("transfer", "(i64)"),
        ("audit", "()"),
        ("close", "()"),
    ];

    let reference = MethodTable::new(declarations);

    for rebuild in 0..20 {
        // A different declaration order each rebuild.
        let mut shuffled = declarations.to_vec();
        shuffled.rotate_left(rebuild % declarations.len());
        if rebuild % 2 == 1 {
            shuffled.reverse();
        }

        let rebuilt = MethodTable::new(shuffled);
        assert_eq!(rebuilt, reference);
        for (name, descriptor) in declarations {
            assert_eq!(
                rebuilt.ordinal(name, descriptor),
                reference.ordinal(name, descriptor)
            );
        }
    }
}

#[test]
fn source_tracking_reclaims_completed_chains() {
    struct Chained {
        callee: EntityRef,
    }

    impl Entity for Chained {
        fn invoke(&self, ctx: &EventContext, _ordinal: u32, _args: Args) -> Result<Value, DomainError> {
            ctx.post_continuing_event(&self.callee, 0, args![0i64])?;
            Ok(value::unit())
        }

        fn signature(&self, _ordinal: u32) -> String {
            "Chained.call()".to_string()
        }
    }

    let controller = Controller::with_config(Config {
        track_sources: true,
        ..Config::default()
    });
    let sim = controller.handle();

    let chained: EntityRef = Arc::new(Chained {
        callee: Arc::new(Echo { delay: 1 }),
    });

    for _ in 0..10 {
        sim.post_event(&chained, 0, args![]);
    }
    controller.run().unwrap();

    // Every record from every chain was consumed.
    assert_eq!(sim.live_events(), 0);
    assert_eq!(sim.pending_events(), 0);
}

#[test]
fn past_posts_are_rejected_by_default() {
    let controller = Controller::new();
    let sim = controller.handle();
    let (entity, _) = probe();

    sim.advance(5);

    assert_eq!(
        sim.post_event_at(3, &entity, 0, args![1i64]),
        Err(ScheduleError::BackInTime {
            requested: 3,
            now: 5
        })
    );
}

#[test]
fn past_posts_are_clamped_when_configured() {
    let controller = Controller::with_config(Config {
        past_events: PastEvents::Clamp,
        ..Config::default()
    });
    let sim = controller.handle();
    let (entity, seen) = probe();

    sim.advance(5);
    sim.post_event_at(3, &entity, 0, args![1i64]).unwrap();
    controller.run().unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![(5, 1)]);
}

#[test]
fn clear_is_rejected_while_an_event_runs() {
    struct Clearing {
        rejected: Arc<AtomicBool>,
    }

    impl Entity for Clearing {
        fn invoke(&self, ctx: &EventContext, _ordinal: u32, _args: Args) -> Result<Value, DomainError> {
            if ctx.sim().clear() == Err(ClearError::Busy) {
                self.rejected.store(true, Ordering::SeqCst);
            }
            Ok(value::unit())
        }

        fn signature(&self, _ordinal: u32) -> String {
            "Clearing.try()".to_string()
        }
    }

    let controller = Controller::new();
    let sim = controller.handle();
    let rejected = Arc::new(AtomicBool::new(false));
    let entity: EntityRef = Arc::new(Clearing {
        rejected: rejected.clone(),
    });

    sim.post_event(&entity, 0, args![]);
    controller.run().unwrap();

    assert!(rejected.load(Ordering::SeqCst));

    // Quiescent again: clearing succeeds and resets statistics.
    sim.clear().unwrap();
    assert_eq!(controller.report().total_events, 0);
}

#[test]
fn the_event_log_sees_every_dispatch() {
    let controller = Controller::new();
    let sim = controller.handle();
    let (entity, _) = probe();

    let logged = Arc::new(Mutex::new(Vec::new()));
    sim.set_event_logger(Some(Box::new({
        let logged = logged.clone();
        move |event: &prime_mover::EventInfo| {
            logged.lock().unwrap().push((event.time, event.signature.clone()));
        }
    })));

    sim.post_event_at(2, &entity, 0, args![1i64]).unwrap();
    sim.post_event_at(4, &entity, 0, args![2i64]).unwrap();
    controller.run().unwrap();

    assert_eq!(
        *logged.lock().unwrap(),
        vec![
            (2, "Probe.observe(tag)".to_string()),
            (4, "Probe.observe(tag)".to_string()),
        ]
    );
}

#[test]
fn debug_events_capture_the_posting_site() {
    let controller = Controller::with_config(Config {
        debug_events: true,
        ..Config::default()
    });
    let sim = controller.handle();
    let (entity, _) = probe();

    let raised_at = Arc::new(Mutex::new(None));
    sim.set_event_logger(Some(Box::new({
        let raised_at = raised_at.clone();
        move |event: &prime_mover::EventInfo| {
            *raised_at.lock().unwrap() = event.raised_at.clone();
        }
    })));

    sim.post_event(&entity, 0, args![1i64]);
    controller.run().unwrap();

    let raised_at = raised_at.lock().unwrap();
    assert!(
        raised_at.as_deref().unwrap().contains("properties.rs"),
        "unexpected posting site: {raised_at:?}"
    );
}

#[test]
fn paced_runs_no_faster_than_wall_clock() {
    let mut controller = PacedController::new(Duration::from_millis(4));
    let sim = controller.handle();
    let (entity, seen) = probe();

    for time in 1..=3 {
        sim.post_event_at(time, &entity, 0, args![time]).unwrap();
    }

    let before = Instant::now();
    controller.start();
    controller.wait().unwrap();

    assert!(before.elapsed() >= Duration::from_millis(12));
    assert_eq!(seen.lock().unwrap().len(), 3);
}
