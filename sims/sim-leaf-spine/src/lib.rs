// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Run a phased workload over a leaf-spine fabric shared by a world of
//! worker threads.
//!
//! Each worker:
//!
//!  1. leaves the run straight away if it is not one of the first
//!     `dst_processes` workers of the world.
//!  2. builds the partition of the selected topology and checks with every
//!     other worker that they all agree on it.
//!  3. reads the workload and runs it with a
//!     [`PhaseScheduler`](lockstep_phases::scheduler::PhaseScheduler).
//!  4. checks that it received everything it expected.
//!
//! An error on any worker aborts the whole world.

use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use lockstep_engine::engine::Engine;
use lockstep_engine::sim_error;
use lockstep_engine::types::{SimError, SimResult};
use lockstep_group::{LocalWorld, ProcessGroup, ReduceOp};
use lockstep_models::fabric::FabricShard;
use lockstep_models::reception::ReceptionSummary;
use lockstep_models::topology::{Partition, select};
use lockstep_phases::scheduler::{PhaseScheduler, RunReport};
use lockstep_phases::workload::WorkloadPlan;
use lockstep_track::entity::Entity;
use lockstep_track::{Tracker, error, info};

pub mod config;

pub use config::{Config, Settings};

/// Colours used to split the world.
const SIM_COLOR: u32 = 1;
const OTHER_COLOR: u32 = 2;

/// What one worker of the world did.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkerOutcome {
    /// The worker was not needed and left before touching the fabric.
    Excluded { world_rank: usize },
    Simulated {
        world_rank: usize,
        rank: usize,
        report: RunReport,
        reception: ReceptionSummary,
    },
}

/// Run every worker of a world of `settings.world_size` threads.
///
/// Returns the outcome of every worker ordered by world rank, or the first
/// error reported.
pub fn run_world(settings: &Settings, tracker: &Tracker) -> Result<Vec<WorkerOutcome>, SimError> {
    let groups = LocalWorld::new(settings.world_size)?.into_groups();
    let results: Vec<Result<WorkerOutcome, SimError>> = thread::scope(|s| {
        let handles: Vec<_> = groups
            .into_iter()
            .map(|group| s.spawn(move || run_worker(settings, tracker, group)))
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(SimError("worker thread panicked".to_string())))
            })
            .collect()
    });
    results.into_iter().collect()
}

/// Run one worker given its handle on the world group.
pub fn run_worker<G>(settings: &Settings, tracker: &Tracker, world: G) -> Result<WorkerOutcome, SimError>
where
    G: ProcessGroup + 'static,
{
    let start = Instant::now();
    let world_rank = world.rank();
    let world_size = world.size();
    let mut engine = Engine::new(tracker, &format!("rank{world_rank}"));
    let top = engine.top().clone();

    let group = if world_size == settings.dst_processes {
        world
    } else {
        let color = if world_rank < settings.dst_processes {
            SIM_COLOR
        } else {
            OTHER_COLOR
        };
        let group = world.split(color, world_rank)?;
        if color != SIM_COLOR {
            info!(top ; "other rank: in world {}:{}, in split {}:{}",
                world_rank, world_size, group.rank(), group.size());
            return Ok(WorkerOutcome::Excluded { world_rank });
        }
        group
    };
    let rank = group.rank();
    if rank == 0 {
        info!(top ; "simulation ranks: {} of {} in the world", group.size(), world_size);
    }

    let group: Rc<dyn ProcessGroup> = Rc::new(group);
    let fabric = match build_fabric(settings, &top, &mut engine, &group) {
        Ok(fabric) => fabric,
        Err(e) => return Err(abort(&top, group.as_ref(), e)),
    };
    let plan = match load_plan(settings, &top, fabric.partition()) {
        Ok(plan) => plan,
        Err(e) => return Err(abort(&top, group.as_ref(), e)),
    };
    group.barrier()?;

    let mut scheduler = PhaseScheduler::new(engine, group.clone(), fabric, plan, settings.scheduler);
    let report = scheduler.run()?;

    let verified = scheduler.reception().verify();
    if let Err(e) = &verified {
        error!(top ; "{}", e);
    }
    let all_verified = group.all_reduce(u64::from(verified.is_ok()), ReduceOp::Min)? == 1;
    let reception = verified?;
    if !all_verified {
        return sim_error!("reception failed on another rank");
    }
    let segments = group.all_reduce_sum(reception.totals.segments)?;

    if rank == 0 {
        info!(top ; "{} segments received in {} phases", segments, report.phase_durations_s.len());
        info!(top ; "elapsed: {:.6} s", start.elapsed().as_secs_f64());
    }
    Ok(WorkerOutcome::Simulated {
        world_rank,
        rank,
        report,
        reception,
    })
}

fn build_fabric(
    settings: &Settings,
    top: &Arc<Entity>,
    engine: &mut Engine,
    group: &Rc<dyn ProcessGroup>,
) -> Result<Rc<FabricShard>, SimError> {
    let shape = select(settings.topo)?;
    let partition = Partition::new(shape, group.size() as u32)?;
    check_partition(group.as_ref(), &partition)?;
    if group.rank() == 0 {
        info!(top ; "topology created: {}, {} servers over {} processes",
            shape, partition.num_servers(), partition.processes());
    }
    FabricShard::new(engine, top, partition, group.clone(), settings.fabric)
}

/// Every worker must partition the fabric the same way.
fn check_partition(group: &dyn ProcessGroup, partition: &Partition) -> SimResult {
    let fingerprint = partition.fingerprint();
    let max = group.all_reduce(fingerprint, ReduceOp::Max)?;
    let min = group.all_reduce(fingerprint, ReduceOp::Min)?;
    if max != min {
        return sim_error!(format!(
            "workers disagree on the partition of the fabric ({min:#x} to {max:#x})"
        ));
    }
    Ok(())
}

fn load_plan(settings: &Settings, top: &Arc<Entity>, partition: &Partition) -> Result<WorkloadPlan, SimError> {
    let plan = WorkloadPlan::from_file(&settings.workload)?;
    plan.validate_nodes(partition.num_servers())?;
    info!(top ; "read {} phases, {} flows from {}",
        plan.num_phases(), plan.num_flows(), settings.workload.display());
    Ok(plan)
}

fn abort(top: &Arc<Entity>, group: &dyn ProcessGroup, e: SimError) -> SimError {
    error!(top ; "{}", e);
    group.abort(&e.0);
    e
}
