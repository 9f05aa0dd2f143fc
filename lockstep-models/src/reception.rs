// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Accounting of everything received by one worker.
//!
//! The [`ReceptionTracker`] is registered as an [`ArrivalObserver`] on every
//! receiver a worker installs. It totals segments and bytes per phase and per
//! (source, destination) pair and, at the end of a run,
//! [`verify`](ReceptionTracker::verify) checks them against what each phase
//! expected.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use lockstep_engine::sim_error;
use lockstep_engine::types::{SimError, SimResult};
use lockstep_track::entity::Entity;
use lockstep_track::{debug, info};

use crate::endpoint::{ArrivalObserver, SegmentContext};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Totals {
    pub segments: u64,
    pub bytes: u64,
}

impl Totals {
    fn add(&mut self, ctx: &SegmentContext) {
        self.segments += 1;
        self.bytes += u64::from(ctx.payload_len);
    }
}

/// Result of a successful [`ReceptionTracker::verify`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReceptionSummary {
    pub phases: usize,
    pub pairs: usize,
    pub totals: Totals,
}

impl fmt::Display for ReceptionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} segments, {} bytes over {} phases and {} flows",
            self.totals.segments, self.totals.bytes, self.phases, self.pairs
        )
    }
}

pub struct ReceptionTracker {
    pub entity: Arc<Entity>,
    expected: RefCell<BTreeMap<usize, u64>>,
    phases: RefCell<BTreeMap<usize, Totals>>,
    pairs: RefCell<BTreeMap<(u32, u32), Totals>>,
}

impl ReceptionTracker {
    #[must_use]
    pub fn new(parent: &Arc<Entity>) -> Rc<Self> {
        Rc::new(Self {
            entity: Arc::new(Entity::new(parent, "reception")),
            expected: RefCell::new(BTreeMap::new()),
            phases: RefCell::new(BTreeMap::new()),
            pairs: RefCell::new(BTreeMap::new()),
        })
    }

    /// Add `segments` to the number expected during `phase`.
    pub fn expect(&self, phase: usize, segments: u64) {
        *self.expected.borrow_mut().entry(phase).or_default() += segments;
    }

    #[must_use]
    pub fn expected(&self, phase: usize) -> u64 {
        self.expected.borrow().get(&phase).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn phase_totals(&self, phase: usize) -> Totals {
        self.phases.borrow().get(&phase).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn pair_totals(&self, src: u32, dst: u32) -> Totals {
        self.pairs.borrow().get(&(src, dst)).copied().unwrap_or_default()
    }

    /// Check that every phase received exactly what it expected and report
    /// the totals.
    pub fn verify(&self) -> Result<ReceptionSummary, SimError> {
        let expected = self.expected.borrow();
        let phases = self.phases.borrow();

        for (phase, totals) in phases.iter() {
            if !expected.contains_key(phase) {
                return sim_error!(format!(
                    "{}: phase {} received {} unexpected segments",
                    self.entity, phase, totals.segments
                ));
            }
        }

        let mut summary = ReceptionSummary {
            phases: expected.len(),
            pairs: self.pairs.borrow().len(),
            totals: Totals::default(),
        };
        for (phase, want) in expected.iter() {
            let got = phases.get(phase).copied().unwrap_or_default();
            if got.segments != *want {
                return sim_error!(format!(
                    "{}: phase {} received {} of {} segments",
                    self.entity, phase, got.segments, want
                ));
            }
            debug!(self.entity ; "phase {}: {} segments, {} bytes", phase, got.segments, got.bytes);
            summary.totals.segments += got.segments;
            summary.totals.bytes += got.bytes;
        }
        info!(self.entity ; "received {}", summary);
        Ok(summary)
    }
}

impl ArrivalObserver for ReceptionTracker {
    fn on_segment_arrived(&self, ctx: &SegmentContext) -> SimResult {
        let Some(phase) = ctx.phase() else {
            return sim_error!(format!("{}: {} carries no phase", self.entity, ctx));
        };
        self.phases.borrow_mut().entry(phase).or_default().add(ctx);
        self.pairs
            .borrow_mut()
            .entry((ctx.src_node, ctx.dst_node))
            .or_default()
            .add(ctx);
        Ok(())
    }
}
