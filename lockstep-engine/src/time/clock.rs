// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! This module represents the time during a simulation.
//!
//! Time is made up of a cycle count and a phase.

use core::cmp::Ordering;
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// ClockTick structure for representing a number of Clock ticks and a phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClockTick {
    /// Clock ticks.
    tick: u64,

    /// Clock phase.
    phase: u32,
}

impl ClockTick {
    #[must_use]
    pub fn new() -> Self {
        Self { tick: 0, phase: 0 }
    }

    /// Get the current clock tick.
    #[must_use]
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Get the current clock phase.
    #[must_use]
    pub fn phase(&self) -> u32 {
        self.phase
    }

    /// Change the default constructor value of `tick`.
    pub fn set_tick(&mut self, tick: u64) -> ClockTick {
        self.tick = tick;
        *self
    }
}

/// Define the comparison operation for ClockTick.
impl Ord for ClockTick {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.tick.cmp(&other.tick) {
            Ordering::Equal => self.phase.cmp(&other.phase),
            ordering => ordering,
        }
    }
}

impl PartialOrd for ClockTick {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for ClockTick {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{:?}", self.tick, self.phase)
    }
}

#[derive(Clone)]
/// State representing a clock.
pub struct Clock {
    /// Frequency of the clock in MHz.
    /// *Note*: Should never be changed as it is registered at this frequency.
    freq_mhz: f64,

    pub shared_state: Rc<ClockState>,
}

/// Shared state between futures using a Clock and the Clock itself.
pub struct ClockState {
    now: RefCell<ClockTick>,

    /// Queue of futures waiting for the right time.
    pub waiting: RefCell<Vec<Vec<Waker>>>,

    /// Queue of times at which those futures are to be woken. This is kept
    /// sorted latest first so that the last entry is the next to be woken.
    pub waiting_times: RefCell<Vec<ClockTick>>,
}

impl ClockState {
    fn schedule(&self, schedule_time: ClockTick, cx: &mut Context<'_>) {
        let mut waiting_times = self.waiting_times.borrow_mut();
        let mut waiting = self.waiting.borrow_mut();
        if let Some(index) = waiting_times.iter().position(|&x| x == schedule_time) {
            // Time already exists, add this task
            waiting[index].push(cx.waker().clone());
        } else {
            // Time not found, insert at the correct location
            match waiting_times.iter().position(|x| *x < schedule_time) {
                Some(index) => {
                    waiting_times.insert(index, schedule_time);
                    waiting.insert(index, vec![cx.waker().clone()]);
                }
                None => {
                    waiting_times.push(schedule_time);
                    waiting.push(vec![cx.waker().clone()]);
                }
            };
        }
    }

    /// Move the clock forward. Time never moves backwards, a request to move
    /// to an earlier time leaves the clock where it is.
    fn advance_time(&self, to_time: ClockTick) {
        let mut now = self.now.borrow_mut();
        if to_time > *now {
            *now = to_time;
        }
    }

    fn clear(&self) {
        self.waiting.borrow_mut().clear();
        self.waiting_times.borrow_mut().clear();
    }
}

impl Clock {
    /// Create a new [Clock] at the specified frequency.
    #[must_use]
    pub fn new(freq_mhz: f64) -> Self {
        let shared_state = Rc::new(ClockState {
            now: RefCell::new(ClockTick::new()),
            waiting: RefCell::new(Vec::new()),
            waiting_times: RefCell::new(Vec::new()),
        });

        Self {
            freq_mhz,
            shared_state,
        }
    }

    /// Returns the clocks frequency in MHz.
    #[must_use]
    pub fn freq_mhz(&self) -> f64 {
        self.freq_mhz
    }

    /// Returns the current [ClockTick].
    #[must_use]
    pub fn tick_now(&self) -> ClockTick {
        *self.shared_state.now.borrow()
    }

    /// Returns the current time in `ns`.
    #[must_use]
    pub fn time_now_ns(&self) -> f64 {
        let now = *self.shared_state.now.borrow();
        self.to_ns(&now)
    }

    /// Returns the time in `ns` of the next event registered with this clock.
    #[must_use]
    pub fn time_of_next(&self) -> f64 {
        match self.shared_state.waiting_times.borrow().last() {
            Some(clock_time) => self.to_ns(clock_time),
            None => f64::MAX,
        }
    }

    /// Returns whether any task is waiting on this clock.
    #[must_use]
    pub fn has_waiting(&self) -> bool {
        !self.shared_state.waiting_times.borrow().is_empty()
    }

    /// Convert the given [ClockTick] to a time in `ns` for this clock.
    #[must_use]
    pub fn to_ns(&self, clock_time: &ClockTick) -> f64 {
        clock_time.tick as f64 / self.freq_mhz * 1000.0
    }

    /// Convert a duration in `ns` to the number of ticks of this clock,
    /// rounding up to the next whole tick.
    #[must_use]
    pub fn ns_to_ticks(&self, duration_ns: f64) -> u64 {
        (duration_ns * (self.freq_mhz / 1000.0)).ceil() as u64
    }

    /// Returns a [ClockDelay] future which must be `await`ed to delay the
    /// specified number of ticks.
    #[must_use = "Futures do nothing unless you `.await` or otherwise use them"]
    pub fn wait_ticks(&self, ticks: u64) -> ClockDelay {
        let mut until = self.tick_now();
        until.tick += ticks;
        ClockDelay {
            shared_state: self.shared_state.clone(),
            until,
            state: ClockDelayState::Pending,
        }
    }

    /// Advance to the next tick after the specified time.
    ///
    /// Does nothing if the clock is already at or beyond `time_ns`.
    pub fn advance_to(&self, time_ns: f64) {
        let now_ns = self.time_now_ns();
        if time_ns <= now_ns {
            return;
        }
        let ticks = self.ns_to_ticks(time_ns - now_ns);

        let mut until = self.tick_now();
        until.tick += ticks;

        self.shared_state.advance_time(until);
    }

    /// Drop every waiting task.
    pub fn clear(&self) {
        self.shared_state.clear();
    }
}

/// The default clocks is simply to use a 1GHz clock so ticks are 1ns.
impl Default for Clock {
    fn default() -> Self {
        Self::new(1000.0)
    }
}

/// Possible states of a ClockDelay.
enum ClockDelayState {
    Pending,
    Running,
}

/// Future returned by the clock to manage advancing time using async functions.
pub struct ClockDelay {
    shared_state: Rc<ClockState>,
    until: ClockTick,
    state: ClockDelayState,
}

impl Future for ClockDelay {
    type Output = ();
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.state {
            ClockDelayState::Pending => {
                if self.until <= *self.shared_state.now.borrow() {
                    // A zero-length wait completes immediately
                    return Poll::Ready(());
                }
                self.shared_state.schedule(self.until, cx);
                self.state = ClockDelayState::Running;
                Poll::Pending
            }
            ClockDelayState::Running => {
                self.shared_state.advance_time(self.until);
                Poll::Ready(())
            }
        }
    }
}
