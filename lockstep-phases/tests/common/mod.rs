// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

use std::rc::Rc;
use std::thread;

use lockstep_engine::engine::Engine;
use lockstep_group::{LocalGroup, LocalWorld, ProcessGroup};
use lockstep_models::fabric::{FabricConfig, FabricShard};
use lockstep_models::topology::{Partition, select};
use lockstep_track::Tracker;
use lockstep_track::tracker::dev_null_tracker;

/// Topology 0: 64 servers on 8 leaves.
pub fn worker(
    tracker: &Tracker,
    group: LocalGroup,
) -> (Engine, Rc<dyn ProcessGroup>, Rc<FabricShard>) {
    worker_on(tracker, group, 0)
}

pub fn worker_on(
    tracker: &Tracker,
    group: LocalGroup,
    topology: usize,
) -> (Engine, Rc<dyn ProcessGroup>, Rc<FabricShard>) {
    let rank = group.rank();
    let processes = group.size() as u32;
    let mut engine = Engine::new(tracker, &format!("rank{rank}"));
    let group: Rc<dyn ProcessGroup> = Rc::new(group);
    let partition = Partition::new(select(topology).unwrap(), processes).unwrap();
    let top = engine.top().clone();
    let fabric = FabricShard::new(
        &mut engine,
        &top,
        partition,
        group.clone(),
        FabricConfig::default(),
    )
    .unwrap();
    (engine, group, fabric)
}

/// Run `body` on one thread per member of a new world of `size`.
pub fn run_world<T, F>(size: usize, body: F) -> Vec<T>
where
    T: Send,
    F: Fn(Tracker, LocalGroup) -> T + Sync,
{
    let groups = LocalWorld::new(size).unwrap().into_groups();
    thread::scope(|s| {
        let handles: Vec<_> = groups
            .into_iter()
            .map(|group| {
                let body = &body;
                s.spawn(move || body(dev_null_tracker(), group))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}
