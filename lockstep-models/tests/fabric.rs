// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

use std::cell::RefCell;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use lockstep_engine::engine::Engine;
use lockstep_engine::test_helpers::start_test;
use lockstep_engine::types::SimResult;
use lockstep_group::{LocalWorld, ProcessGroup};
use lockstep_models::endpoint::{ArrivalObserver, SegmentContext, Sender};
use lockstep_models::fabric::{FabricConfig, FabricShard};
use lockstep_models::rdma::{PacedDriver, RdmaClient};
use lockstep_models::topology::{Partition, select};
use lockstep_track::tracker::dev_null_tracker;

#[derive(Default)]
struct Log(RefCell<Vec<SegmentContext>>);

impl ArrivalObserver for Log {
    fn on_segment_arrived(&self, ctx: &SegmentContext) -> SimResult {
        self.0.borrow_mut().push(*ctx);
        Ok(())
    }
}

fn shard(engine: &mut Engine, processes: u32, group: impl ProcessGroup + 'static) -> Rc<FabricShard> {
    let partition = Partition::new(select(0).unwrap(), processes).unwrap();
    let top = engine.top().clone();
    FabricShard::new(engine, &top, partition, Rc::new(group), FabricConfig::default()).unwrap()
}

#[test]
fn local_transfer_is_segmented_and_timed() {
    let mut engine = start_test(file!());
    let group = LocalWorld::new(1).unwrap().into_groups().remove(0);
    let fabric = shard(&mut engine, 1, group);
    let driver = PacedDriver::new(engine.top(), &fabric);

    let (receiver, created) = fabric.bind_receiver(1, 1).unwrap();
    assert!(created);
    let log = Rc::new(Log::default());
    receiver.add_observer(log.clone());

    let partition = *fabric.partition();
    let request = RdmaClient::new()
        .local(partition.address(0).unwrap(), 100)
        .remote(partition.address(1).unwrap(), 1)
        .write_size(3000)
        .request();
    let sender = Sender::new(engine.top(), "qp0", request);
    sender.start(&driver).unwrap();

    engine.run().unwrap();

    assert!(sender.is_complete());
    let log = log.0.borrow();
    let mut lengths: Vec<_> = log.iter().map(|ctx| ctx.payload_len).collect();
    lengths.sort_unstable();
    assert_eq!(lengths, vec![104, 1448, 1448]);
    assert_eq!(receiver.bytes(), 3000);
    assert_eq!(fabric.delivered(), 3);
    assert_eq!(fabric.posted(), 0);

    // Three serialisations at 25Mbps then one more at the leaf plus two links
    let serialise_1448 = 1448.0 * 8000.0 / 25.0;
    let last = log.iter().map(|ctx| ctx.arrival_ns).fold(0.0, f64::max);
    assert_eq!(last, 2.0 * serialise_1448 + 2.0 * 2000.0 + serialise_1448);
    assert_eq!(engine.time_now_ns(), last);
}

#[test]
fn window_holds_segments_until_acknowledged() {
    let mut engine = start_test(file!());
    let group = LocalWorld::new(1).unwrap().into_groups().remove(0);
    let fabric = shard(&mut engine, 1, group);
    let driver = PacedDriver::new(engine.top(), &fabric);

    let (receiver, _) = fabric.bind_receiver(1, 1).unwrap();
    let log = Rc::new(Log::default());
    receiver.add_observer(log.clone());

    let partition = *fabric.partition();
    let rtt_ns = 1_000_000;
    let request = RdmaClient::new()
        .local(partition.address(0).unwrap(), 100)
        .remote(partition.address(1).unwrap(), 1)
        .write_size(3000)
        .window(1448)
        .base_rtt(rtt_ns)
        .request();
    let sender = Sender::new(engine.top(), "qp0", request);
    sender.start(&driver).unwrap();
    engine.run().unwrap();
    assert!(sender.is_complete());

    // Only one segment may be in flight, so each waits a round trip
    let serialise_1448 = 1448.0 * 8000.0 / 25.0;
    let serialise_104 = 104.0 * 8000.0 / 25.0;
    let rtt = rtt_ns as f64;
    let arrivals: Vec<_> = log.0.borrow().iter().map(|ctx| (ctx.seq, ctx.arrival_ns)).collect();
    assert_eq!(
        arrivals,
        vec![
            (0, 2.0 * serialise_1448 + 4000.0),
            (1, 3.0 * serialise_1448 + rtt + 4000.0),
            (2, 2.0 * serialise_1448 + 2.0 * rtt + 2.0 * serialise_104 + 4000.0),
        ]
    );
}

#[test]
fn receivers_are_bound_once_and_only_on_the_owner() {
    let mut engine = start_test(file!());
    let mut groups = LocalWorld::new(2).unwrap().into_groups();
    let group = groups.remove(1);
    let fabric = shard(&mut engine, 2, group);

    let (first, created) = fabric.bind_receiver(40, 3).unwrap();
    assert!(created);
    let (second, created) = fabric.bind_receiver(40, 3).unwrap();
    assert!(!created);
    assert!(Rc::ptr_eq(&first, &second));
    assert_eq!(fabric.num_receivers(), 1);

    // Node 3 belongs to rank 0
    assert!(fabric.bind_receiver(3, 1).is_err());
    assert!(fabric.bind_receiver(64, 1).is_err());
}

#[test]
fn partition_must_match_group() {
    let mut engine = start_test(file!());
    let group = LocalWorld::new(1).unwrap().into_groups().remove(0);
    let partition = Partition::new(select(0).unwrap(), 2).unwrap();
    let top = engine.top().clone();
    assert!(
        FabricShard::new(&mut engine, &top, partition, Rc::new(group), FabricConfig::default())
            .is_err()
    );
}

#[test]
fn delivery_without_a_receiver_is_an_error() {
    let mut engine = start_test(file!());
    let group = LocalWorld::new(1).unwrap().into_groups().remove(0);
    let fabric = shard(&mut engine, 1, group);
    let driver = PacedDriver::new(engine.top(), &fabric);

    let partition = *fabric.partition();
    let request = RdmaClient::new()
        .local(partition.address(0).unwrap(), 100)
        .remote(partition.address(9).unwrap(), 1)
        .write_size(10)
        .request();
    Sender::new(engine.top(), "qp0", request).start(&driver).unwrap();
    assert!(engine.run().is_err());
}

#[test]
fn segments_cross_to_the_owning_worker() {
    let groups = LocalWorld::new(2).unwrap().into_groups();
    let received: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = groups
            .into_iter()
            .map(|group| {
                s.spawn(move || {
                    let rank = group.rank();
                    let mut engine = Engine::new(&dev_null_tracker(), &format!("rank{rank}"));
                    let group: Rc<dyn ProcessGroup> = Rc::new(group);
                    let partition = Partition::new(select(0).unwrap(), 2).unwrap();
                    let top = engine.top().clone();
                    let fabric = FabricShard::new(
                        &mut engine,
                        &top,
                        partition,
                        group.clone(),
                        FabricConfig::default(),
                    )
                    .unwrap();

                    let log = Rc::new(Log::default());
                    if rank == 1 {
                        let (receiver, _) = fabric.bind_receiver(40, 1).unwrap();
                        receiver.add_observer(log.clone());
                    }
                    group.barrier().unwrap();

                    if rank == 0 {
                        let driver = PacedDriver::new(&top, &fabric);
                        let request = RdmaClient::new()
                            .local(partition.address(0).unwrap(), 100)
                            .remote(partition.address(40).unwrap(), 1)
                            .write_size(2000)
                            .request();
                        Sender::new(&top, "qp0", request).start(&driver).unwrap();
                        engine.run().unwrap();
                        assert_eq!(fabric.posted(), 2);
                    } else {
                        for _ in 0..2 {
                            let envelope = group.recv_timeout(Duration::from_secs(10)).unwrap();
                            assert_eq!(envelope.from, 0);
                            fabric.inject(envelope.payload).unwrap();
                        }
                        engine.run().unwrap();
                    }
                    group.barrier().unwrap();
                    let arrivals = log.0.borrow().len();
                    arrivals
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(received, vec![0, 2]);
}
