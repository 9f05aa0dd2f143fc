// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The owner of all clocks of one engine.

use std::sync::Arc;
use std::task::Waker;

use lockstep_track::entity::Entity;
use lockstep_track::set_time;

use super::clock::Clock;

/// The overall owner of time within a simulation.
///
/// Contains all Clocks and the current simulation time in ns.
#[derive(Clone)]
pub struct SimTime {
    pub entity: Arc<Entity>,

    current_ns: f64,

    /// Clocks are created on demand, one per frequency.
    clocks: Vec<Clock>,
}

impl SimTime {
    #[must_use]
    pub fn new(parent: &Arc<Entity>) -> Self {
        Self {
            entity: Arc::new(Entity::new(parent, "time")),
            current_ns: 0.0,
            clocks: Vec::new(),
        }
    }

    pub fn get_clock(&mut self, freq_mhz: f64) -> Clock {
        for clock in &self.clocks {
            if clock.freq_mhz() == freq_mhz {
                return clock.clone();
            }
        }
        let clock = Clock::new(freq_mhz);
        // A new clock starts at the current time of the simulation
        clock.advance_to(self.current_ns);
        self.clocks.push(clock.clone());
        clock
    }

    /// Choose the clock with the next time and return the associated Wakers.
    pub fn advance_time(&mut self) -> Option<Vec<Waker>> {
        let next_clock = self
            .clocks
            .iter()
            .filter(|c| c.has_waiting())
            .min_by(|a, b| a.time_of_next().total_cmp(&b.time_of_next()))?;

        let clock_time = next_clock.shared_state.waiting_times.borrow_mut().pop()?;
        let next_ns = next_clock.to_ns(&clock_time);
        if next_ns > self.current_ns {
            set_time!(self.entity ; next_ns);
            self.current_ns = next_ns;
        }
        next_clock.shared_state.waiting.borrow_mut().pop()
    }

    /// Move all clocks to their next tick after the specified time.
    pub fn advance_all_clocks_to(&mut self, time_ns: f64) {
        if time_ns <= self.current_ns {
            return;
        }
        for clock in &self.clocks {
            clock.advance_to(time_ns);
        }
        set_time!(self.entity ; time_ns);
        self.current_ns = time_ns;
    }

    #[must_use]
    pub fn time_now_ns(&self) -> f64 {
        self.current_ns
    }

    /// Returns whether any task is waiting for time to advance.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.clocks.iter().any(Clock::has_waiting)
    }

    /// Drop all tasks waiting on any clock.
    pub fn clear(&mut self) {
        for clock in &self.clocks {
            clock.clear();
        }
    }
}
