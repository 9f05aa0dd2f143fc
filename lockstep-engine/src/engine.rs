// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The [`Engine`] drives one shard of the simulation.

use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{Acquire, Release};

use lockstep_track::entity::{Entity, toplevel};
use lockstep_track::tracker::stdout_tracker;
use lockstep_track::{Tracker, debug};

use crate::executor::{self, Executor, Spawner};
use crate::time::clock::Clock;
use crate::types::SimResult;

/// Use a default clock frequency of 1GHz.
const DEFAULT_CLOCK_MHZ: f64 = 1000.0;

/// A handle that asks a running [`Engine`] to return from
/// [`run()`](Engine::run).
///
/// The request takes effect before the next task is polled. Tasks that have
/// not been polled yet are kept, so a stopped engine can be resumed.
#[derive(Clone)]
pub struct Stopper {
    stop: Rc<AtomicBool>,
}

impl Stopper {
    pub fn stop(&self) {
        self.stop.store(true, Release);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Acquire)
    }
}

pub struct Engine {
    pub executor: Executor,
    pub spawner: Spawner,
    toplevel: Arc<Entity>,
    tracker: Tracker,
    stop: Rc<AtomicBool>,
}

impl Engine {
    /// Create a standalone engine whose top-level entity is called `name`.
    pub fn new(tracker: &Tracker, name: &str) -> Self {
        let toplevel = toplevel(tracker, name);
        let (executor, spawner) = executor::new_executor_and_spawner(&toplevel);
        Self {
            executor,
            spawner,
            toplevel,
            tracker: tracker.clone(),
            stop: Rc::new(AtomicBool::new(false)),
        }
    }

    /// Run until no task can make progress or until stopped.
    ///
    /// Any stop requested before this call is discarded.
    pub fn run(&mut self) -> SimResult {
        self.stop.store(false, Release);
        self.executor.run(&self.stop)?;
        debug!(self.toplevel ; "run returned at {}ns", self.time_now_ns());
        Ok(())
    }

    /// Request the current [`run()`](Engine::run) to return.
    pub fn stop(&self) {
        self.stop.store(true, Release);
    }

    /// Get a [`Stopper`] that tasks and observers can use to stop the engine.
    #[must_use]
    pub fn stopper(&self) -> Stopper {
        Stopper {
            stop: self.stop.clone(),
        }
    }

    /// Returns whether no task is runnable and no timed wake-up is pending.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.executor.is_idle()
    }

    /// Move the simulation time forward to `time_ns`.
    ///
    /// Does nothing if the engine is already at or beyond `time_ns`.
    pub fn advance_to(&self, time_ns: f64) {
        self.executor.advance_to(time_ns);
    }

    /// Drop all pending tasks and timers.
    pub fn destroy(&mut self) {
        self.executor.destroy();
        debug!(self.toplevel ; "destroyed at {}ns", self.time_now_ns());
    }

    pub fn spawn(&self, future: impl Future<Output = SimResult> + 'static) {
        self.executor.spawn(future);
    }

    pub fn default_clock(&mut self) -> Clock {
        self.executor.get_clock(DEFAULT_CLOCK_MHZ)
    }

    pub fn clock_mhz(&mut self, freq_mhz: f64) -> Clock {
        self.executor.get_clock(freq_mhz)
    }

    pub fn clock_ghz(&mut self, freq_ghz: f64) -> Clock {
        self.executor.get_clock(freq_ghz * 1000.0)
    }

    #[must_use]
    pub fn time_now_ns(&self) -> f64 {
        self.executor.time_now_ns()
    }

    #[must_use]
    pub fn top(&self) -> &Arc<Entity> {
        &self.toplevel
    }

    #[must_use]
    pub fn tracker(&self) -> Tracker {
        self.tracker.clone()
    }
}

/// Create a default engine that sends [`Track`](lockstep_track::Track) events
/// to stdout.
///
/// This is provided to keep documentation examples simple with fewer
/// concepts to have to consider at once.
impl Default for Engine {
    fn default() -> Self {
        let tracker = stdout_tracker(log::Level::Warn);
        Self::new(&tracker, "top")
    }
}
