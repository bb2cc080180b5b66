//! Drivers over the kernel: run-to-end, step-by-step, and wall-clock paced.
//!
//! All three share identical event-processing semantics, including the
//! blocking-call protocol, and differ only in how the loop is driven.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::entity::EntityRef;
use crate::scheduler::{Config, Kernel, Report, Sim, Step};
use crate::SimulationError;

/// Run-to-end driver: processes events until the queue drains or the end
/// sentinel arrives.
pub struct Controller {
    kernel: Arc<Kernel>,
}

impl Controller {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Controller {
            kernel: Kernel::new(config),
        }
    }

    /// A cloneable handle for posting and inspection.
    pub fn handle(&self) -> Sim {
        Sim::new(self.kernel.clone())
    }

    /// Notifies `entity` which scheduler it belongs to.
    pub fn bind(&self, entity: &EntityRef) {
        bind_to(&self.handle(), entity);
    }

    /// Runs the simulation to the end. Fails when an event raises an error
    /// no blocked caller can receive, or when interrupted.
    pub fn run(&self) -> Result<(), SimulationError> {
        self.kernel.run()
    }

    /// Runs the simulation until simulated time `end`: the end sentinel is
    /// posted at `end` before the loop starts, so events scheduled later at
    /// that instant (or beyond) are cleanly abandoned.
    pub fn run_until(&self, end: i64) -> Result<(), SimulationError> {
        self.kernel.post_end_at(end)?;
        self.kernel.run()
    }

    /// Halts the loop after the current event completes.
    pub fn interrupt(&self) {
        self.kernel.interrupt();
    }

    pub fn report(&self) -> Report {
        self.kernel.report()
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

/// Step-by-step driver: the caller owns the loop.
pub struct StepController {
    kernel: Arc<Kernel>,
}

impl StepController {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        StepController {
            kernel: Kernel::new(config),
        }
    }

    pub fn handle(&self) -> Sim {
        Sim::new(self.kernel.clone())
    }

    pub fn bind(&self, entity: &EntityRef) {
        bind_to(&self.handle(), entity);
    }

    /// Pops and evaluates exactly one event.
    pub fn step(&self) -> Result<Step, SimulationError> {
        self.kernel.step()
    }

    pub fn report(&self) -> Report {
        self.kernel.report()
    }
}

impl Default for StepController {
    fn default() -> Self {
        Self::new()
    }
}

/// Wall-clock-paced driver: simulated time advances no faster than
/// wall-clock.
///
/// [`PacedController::start`] spawns a scheduler thread which, between
/// popping an event at time `T` and evaluating it, sleeps until `T`'s
/// wall-clock due point: `tick` of wall time per simulated unit, divided by
/// the speed factor. Posting through a [`Sim`] handle from any thread is
/// safe while the scheduler runs, though an event posted earlier than the
/// one currently being slept toward is processed after it.
pub struct PacedController {
    kernel: Arc<Kernel>,
    tick: Duration,
    speed: f64,
    worker: Option<thread::JoinHandle<Result<(), SimulationError>>>,
}

impl PacedController {
    /// `tick` is the wall-clock duration of one simulated time unit.
    pub fn new(tick: Duration) -> Self {
        Self::with_config(Config::default(), tick)
    }

    pub fn with_config(config: Config, tick: Duration) -> Self {
        PacedController {
            kernel: Kernel::new(config),
            tick,
            speed: 1.0,
            worker: None,
        }
    }

    /// Speed factor: 2.0 runs twice as fast as real time. Takes effect at
    /// the next [`PacedController::start`].
    pub fn set_speed(&mut self, speed: f64) {
        assert!(speed > 0.0, "speed factor must be positive");
        self.speed = speed;
    }

    pub fn handle(&self) -> Sim {
        Sim::new(self.kernel.clone())
    }

    pub fn bind(&self, entity: &EntityRef) {
        bind_to(&self.handle(), entity);
    }

    /// Spawns the paced scheduler thread.
    pub fn start(&mut self) {
        assert!(self.worker.is_none(), "paced controller already started");
        self.kernel.clear_interrupted();

        let kernel = self.kernel.clone();
        let tick = self.tick;
        let speed = self.speed;
        let worker = thread::Builder::new()
            .name("paced-scheduler".to_string())
            .spawn(move || paced_loop(&kernel, tick, speed))
            .expect("failed to spawn scheduler thread");

        self.worker = Some(worker);
    }

    /// Interrupts the scheduler thread and waits for it. A stop-induced
    /// interruption is a clean shutdown, not an error.
    pub fn stop(&mut self) -> Result<(), SimulationError> {
        let worker = self.worker.take().expect("paced controller not started");
        self.kernel.interrupt();

        match worker.join().expect("scheduler thread panicked") {
            Err(SimulationError::Interrupted) => Ok(()),
            other => other,
        }
    }

    /// Waits for the simulation to finish on its own.
    pub fn wait(&mut self) -> Result<(), SimulationError> {
        let worker = self.worker.take().expect("paced controller not started");
        worker.join().expect("scheduler thread panicked")
    }

    pub fn report(&self) -> Report {
        self.kernel.report()
    }
}

fn bind_to(sim: &Sim, entity: &EntityRef) {
    if let Some(marker) = entity.transformed() {
        debug!(timestamp = marker.timestamp, "binding a rewritten entity");
    }
    entity.bind(sim);
}

fn paced_loop(kernel: &Arc<Kernel>, tick: Duration, speed: f64) -> Result<(), SimulationError> {
    let wall_anchor = Instant::now();
    let sim_anchor = kernel.current_time();
    debug!(?tick, speed, "paced scheduler started");

    loop {
        let step = kernel.step_with(|event_time| {
            let elapsed_units = (event_time - sim_anchor).max(0) as f64;
            let due = wall_anchor + tick.mul_f64(elapsed_units / speed);

            // Sleep in slices so an interrupt stays responsive.
            loop {
                if kernel.is_interrupted() {
                    break;
                }
                let now = Instant::now();
                if now >= due {
                    break;
                }
                thread::sleep((due - now).min(Duration::from_millis(25)));
            }
        })?;

        match step {
            Step::Event => continue,
            Step::Idle | Step::Ended => return Ok(()),
        }
    }
}
