// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The phase scheduler.
//!
//! Each worker runs one [`PhaseScheduler`]. For every phase of the
//! [`WorkloadPlan`] it:
//!
//!  1. installs the phase's flows on its shard and counts the segments it
//!     must receive.
//!  2. runs its engine, exchanging segments with the other workers, until
//!     that count is reached. A worker that receives nothing in a phase is
//!     done as soon as the phase is loaded.
//!  3. keeps running until it has nothing left to send, then votes. The
//!     vote is a sum over the group of one per worker, so it only returns
//!     once every worker is done.
//!  4. agrees on the latest sim-time across the group and moves its clock
//!     there, logs the phase duration and loads the next phase between two
//!     barriers.
//!
//! Every worker takes part in every vote and barrier, whether or not it
//! owns any endpoint of the phase.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use lockstep_engine::engine::{Engine, Stopper};
use lockstep_engine::sim_error;
use lockstep_engine::types::{SimError, SimResult};
use lockstep_group::{GroupError, ProcessGroup, ReduceOp};
use lockstep_models::endpoint::{ArrivalObserver, SegmentContext};
use lockstep_models::fabric::FabricShard;
use lockstep_models::rdma::{PacedDriver, QueuePairDriver};
use lockstep_models::reception::ReceptionTracker;
use lockstep_track::entity::Entity;
use lockstep_track::{debug, info, trace};

use crate::installer::FlowInstaller;
use crate::workload::WorkloadPlan;

/// Where a worker is in the phase protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseState {
    Idle,
    Loading(usize),
    Running(usize),
    LocalDone(usize),
    Advancing(usize),
    Finished,
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseState::Idle => write!(f, "idle"),
            PhaseState::Loading(i) => write!(f, "loading phase {i}"),
            PhaseState::Running(i) => write!(f, "running phase {i}"),
            PhaseState::LocalDone(i) => write!(f, "done with phase {i}"),
            PhaseState::Advancing(i) => write!(f, "advancing from phase {i}"),
            PhaseState::Finished => write!(f, "finished"),
        }
    }
}

/// Counters of the current phase.
#[derive(Clone, Debug, PartialEq)]
pub struct PhaseSchedulerState {
    pub state: PhaseState,
    pub phase: usize,
    pub phase_start_ns: f64,
    pub expected: u64,
    pub received: u64,
}

impl Default for PhaseSchedulerState {
    fn default() -> Self {
        Self {
            state: PhaseState::Idle,
            phase: 0,
            phase_start_ns: 0.0,
            expected: 0,
            received: 0,
        }
    }
}

impl PhaseSchedulerState {
    /// Start loading `phase` at `now_ns` with zeroed counters.
    pub fn reset_for_phase(&mut self, phase: usize, now_ns: f64) {
        self.state = PhaseState::Loading(phase);
        self.phase = phase;
        self.phase_start_ns = now_ns;
        self.expected = 0;
        self.received = 0;
    }

    #[must_use]
    pub fn is_local_done(&self) -> bool {
        matches!(self.state, PhaseState::LocalDone(_))
    }
}

/// Counts arrivals for the current phase and stops the engine once the
/// expected number has been seen.
struct CompletionCounter {
    entity: Arc<Entity>,
    state: Rc<RefCell<PhaseSchedulerState>>,
    stopper: Stopper,
}

impl ArrivalObserver for CompletionCounter {
    fn on_segment_arrived(&self, ctx: &SegmentContext) -> SimResult {
        let mut state = self.state.borrow_mut();
        let PhaseState::Running(phase) = state.state else {
            return sim_error!(format!(
                "{}: {} arrived while {} ({} of {} segments)",
                self.entity, ctx, state.state, state.received, state.expected
            ));
        };
        if ctx.phase() != Some(phase) {
            return sim_error!(format!(
                "{}: {} arrived during phase {}",
                self.entity, ctx, phase
            ));
        }

        state.received += 1;
        trace!(self.entity ; "phase {}: {} of {}", phase, state.received, state.expected);
        if state.received >= state.expected {
            state.state = PhaseState::LocalDone(phase);
            self.stopper.stop();
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SchedulerConfig {
    /// Longest wait for a segment from another worker.
    pub stall_timeout: Duration,
    /// Window given to every queue pair, zero for unlimited.
    pub qp_window: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stall_timeout: Duration::from_secs(30),
            qp_window: 0,
        }
    }
}

/// Outcome of a [`PhaseScheduler::run`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunReport {
    /// Duration of each phase in seconds of sim-time.
    pub phase_durations_s: Vec<f64>,
    pub end_time_ns: f64,
    pub flows_sent: usize,
    pub flows_complete: usize,
}

pub struct PhaseScheduler {
    pub entity: Arc<Entity>,
    engine: Engine,
    group: Rc<dyn ProcessGroup>,
    fabric: Rc<FabricShard>,
    plan: WorkloadPlan,
    installer: FlowInstaller,
    reception: Rc<ReceptionTracker>,
    state: Rc<RefCell<PhaseSchedulerState>>,
    config: SchedulerConfig,
    durations_s: Vec<f64>,
}

impl PhaseScheduler {
    /// Build a scheduler whose flows are sent by a [`PacedDriver`].
    pub fn new(
        engine: Engine,
        group: Rc<dyn ProcessGroup>,
        fabric: Rc<FabricShard>,
        plan: WorkloadPlan,
        config: SchedulerConfig,
    ) -> Self {
        let driver = Rc::new(PacedDriver::new(engine.top(), &fabric));
        Self::new_with_driver(engine, group, fabric, plan, config, driver)
    }

    pub fn new_with_driver(
        engine: Engine,
        group: Rc<dyn ProcessGroup>,
        fabric: Rc<FabricShard>,
        plan: WorkloadPlan,
        config: SchedulerConfig,
        driver: Rc<dyn QueuePairDriver>,
    ) -> Self {
        let entity = Arc::new(Entity::new(engine.top(), "scheduler"));
        let state = Rc::new(RefCell::new(PhaseSchedulerState::default()));
        let completion = Rc::new(CompletionCounter {
            entity: entity.clone(),
            state: state.clone(),
            stopper: engine.stopper(),
        });
        let reception = ReceptionTracker::new(engine.top());
        let installer = FlowInstaller::new(
            engine.top(),
            &fabric,
            driver,
            &reception,
            completion,
            config.qp_window,
        );
        Self {
            entity,
            engine,
            group,
            fabric,
            plan,
            installer,
            reception,
            state,
            config,
            durations_s: Vec::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> PhaseSchedulerState {
        self.state.borrow().clone()
    }

    #[must_use]
    pub fn reception(&self) -> &Rc<ReceptionTracker> {
        &self.reception
    }

    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    #[must_use]
    pub fn plan(&self) -> &WorkloadPlan {
        &self.plan
    }

    /// Run every phase of the plan to completion.
    ///
    /// Any error aborts the whole group so that no worker is left waiting in
    /// a collective.
    pub fn run(&mut self) -> Result<RunReport, SimError> {
        match self.run_phases() {
            Ok(()) => Ok(RunReport {
                phase_durations_s: self.durations_s.clone(),
                end_time_ns: self.engine.time_now_ns(),
                flows_sent: self.installer.num_senders(),
                flows_complete: self.installer.num_senders_complete(),
            }),
            Err(e) => {
                self.group.abort(&format!("rank {}: {}", self.group.rank(), e.0));
                self.engine.destroy();
                Err(e)
            }
        }
    }

    fn run_phases(&mut self) -> SimResult {
        if self.plan.num_phases() == 0 {
            info!(self.entity ; "workload has no phases");
            self.state.borrow_mut().state = PhaseState::Finished;
            return Ok(());
        }

        self.engine.advance_to((self.plan.start_offset_s() * 1e9).round());
        self.load(0)?;
        self.group.barrier()?;

        loop {
            self.run_until_local_done()?;
            self.vote()?;
            let next = self.advance()?;
            if next >= self.plan.num_phases() {
                self.state.borrow_mut().state = PhaseState::Finished;
                self.rank0_info(format_args!("all phases completed"));
                return Ok(());
            }
            self.group.barrier()?;
            self.rank0_info(format_args!("loading phase {next}"));
            self.load(next)?;
            self.group.barrier()?;
        }
    }

    /// Install every flow of `phase`.
    fn load(&mut self, phase: usize) -> SimResult {
        let now_ns = self.engine.time_now_ns();
        self.state.borrow_mut().reset_for_phase(phase, now_ns);
        self.installer.start_phase(phase);

        let Some(flows) = self.plan.phase(phase).map(|p| p.flows.clone()) else {
            return sim_error!(format!("{}: no phase {}", self.entity, phase));
        };
        let mut expected = 0;
        for (index, flow) in flows.iter().enumerate() {
            expected += self.installer.install(phase, index, flow)?.expected_segments;
        }

        let mut state = self.state.borrow_mut();
        state.expected = expected;
        state.state = if expected == 0 {
            PhaseState::LocalDone(phase)
        } else {
            PhaseState::Running(phase)
        };
        debug!(self.entity ; "phase {} loaded at {}ns: {} flows, expecting {} segments",
            phase, now_ns, flows.len(), expected);
        Ok(())
    }

    /// Run the engine until this worker has seen every segment it expects
    /// and has nothing left to send.
    fn run_until_local_done(&mut self) -> SimResult {
        loop {
            self.drain_mailbox()?;
            self.engine.run()?;

            if self.state.borrow().is_local_done() {
                if self.engine.is_idle() {
                    return Ok(());
                }
                continue;
            }

            let envelope = match self.group.recv_timeout(self.config.stall_timeout) {
                Ok(envelope) => envelope,
                Err(GroupError::Timeout(waited)) => {
                    let state = self.state.borrow();
                    return sim_error!(format!(
                        "{}: phase {} stalled for {:?} with {} of {} segments received",
                        self.entity, state.phase, waited, state.received, state.expected
                    ));
                }
                Err(e) => return Err(e.into()),
            };
            self.fabric.inject(envelope.payload)?;
        }
    }

    fn drain_mailbox(&self) -> SimResult {
        while let Some(envelope) = self.group.try_recv()? {
            self.fabric.inject(envelope.payload)?;
        }
        Ok(())
    }

    /// Vote that this worker is done and wait for every other worker.
    fn vote(&self) -> SimResult {
        let phase = self.state.borrow().phase;
        let votes = self.group.all_reduce_sum(1)?;
        if votes != self.group.size() as u64 {
            return sim_error!(format!(
                "{}: phase {} vote returned {} of {}",
                self.entity,
                phase,
                votes,
                self.group.size()
            ));
        }
        Ok(())
    }

    /// Align clocks, record the duration of the phase just finished and
    /// return the index of the next one.
    fn advance(&mut self) -> Result<usize, SimError> {
        let (phase, start_ns) = {
            let mut state = self.state.borrow_mut();
            state.state = PhaseState::Advancing(state.phase);
            (state.phase, state.phase_start_ns)
        };

        let local_ns = self.engine.time_now_ns().ceil() as u64;
        let end_ns = self.group.all_reduce(local_ns, ReduceOp::Max)? as f64;
        self.engine.advance_to(end_ns);
        self.engine.stop();

        let duration_s = (end_ns - start_ns).max(0.0) / 1e9;
        self.durations_s.push(duration_s);
        self.rank0_info(format_args!("phase {phase} complete, FCT: {duration_s:.6} s"));
        Ok(phase + 1)
    }

    fn rank0_info(&self, args: fmt::Arguments<'_>) {
        if self.group.rank() == 0 {
            info!(self.entity ; "{}", args);
        }
    }
}
