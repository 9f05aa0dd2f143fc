// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

use std::io::Write;
use std::path::Path;
use std::thread;

use clap::Parser;
use lockstep_config::MultiSourceConfig;
use lockstep_group::LocalWorld;
use lockstep_track::tracker::dev_null_tracker;
use serial_test::serial;
use sim_leaf_spine::{Config, Settings, WorkerOutcome, run_worker, run_world};
use tempfile::NamedTempFile;

const WORKLOAD: &str = "\
# two phases over topology 0 (64 servers)
phase 0
type rdma_write src 0 sport 100 dst 40 dport 1 prio 3 size 3000
type rdma_write src 41 sport 100 dst 2 dport 1 prio 3 size 1448
phase 100
type rdma_write src 63 sport 100 dst 0 dport 1 prio 0 size 10000
";

fn workload_file(text: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

fn settings(workload: &Path, world_size: usize, dst_processes: usize) -> Settings {
    Config {
        topo: Some(0),
        workload: Some(workload.to_path_buf()),
        world_size: Some(world_size),
        dst_processes: Some(dst_processes),
        stall_timeout_ms: Some(5000),
        ..Config::default()
    }
    .resolve()
    .unwrap()
}

#[test]
fn every_worker_runs_every_phase() {
    let file = workload_file(WORKLOAD);
    let outcomes = run_world(&settings(file.path(), 2, 2), &dev_null_tracker()).unwrap();
    assert_eq!(outcomes.len(), 2);

    let mut segments = Vec::new();
    for outcome in &outcomes {
        let WorkerOutcome::Simulated {
            report, reception, ..
        } = outcome
        else {
            panic!("unexpected {outcome:?}");
        };
        assert_eq!(report.phase_durations_s.len(), 2);
        segments.push(reception.totals.segments);
    }
    // Rank 0 gets 1 + 7 segments, rank 1 gets 3
    assert_eq!(segments, vec![8, 3]);
}

#[test]
fn spare_workers_leave_before_the_simulation() {
    let file = workload_file(WORKLOAD);
    let outcomes = run_world(&settings(file.path(), 4, 2), &dev_null_tracker()).unwrap();
    let summary: Vec<_> = outcomes
        .iter()
        .map(|outcome| match outcome {
            WorkerOutcome::Excluded { world_rank } => (*world_rank, None),
            WorkerOutcome::Simulated {
                world_rank, rank, ..
            } => (*world_rank, Some(*rank)),
        })
        .collect();
    assert_eq!(
        summary,
        vec![(0, Some(0)), (1, Some(1)), (2, None), (3, None)]
    );
}

#[test]
fn fatal_errors_stop_every_worker() {
    let err = run_world(
        &settings(Path::new("no/such/workload.txt"), 2, 2),
        &dev_null_tracker(),
    )
    .unwrap_err();
    assert!(err.0.contains("unable to open workload"), "{err}");

    let file = workload_file("phase 0\ntype t src 0 sport 1 dst 64 dport 1 prio 0 size 1\n");
    let err = run_world(&settings(file.path(), 2, 2), &dev_null_tracker()).unwrap_err();
    assert!(err.0.contains("node 64"), "{err}");

    let file = workload_file(WORKLOAD);
    let mut bad_topo = settings(file.path(), 2, 2);
    bad_topo.topo = 9;
    let err = run_world(&bad_topo, &dev_null_tracker()).unwrap_err();
    assert!(err.0.contains("unknown topology 9"), "{err}");
}

#[test]
fn uneven_partitions_are_rejected() {
    let file = workload_file(WORKLOAD);
    let err = run_world(&settings(file.path(), 3, 3), &dev_null_tracker()).unwrap_err();
    assert!(err.0.contains("do not split evenly"), "{err}");
}

#[test]
fn workers_must_agree_on_the_topology() {
    let file = workload_file(WORKLOAD);
    let small = settings(file.path(), 2, 2);
    let mut large = small.clone();
    large.topo = 1;

    let tracker = dev_null_tracker();
    let groups = LocalWorld::new(2).unwrap().into_groups();
    let errors: Vec<String> = thread::scope(|s| {
        let handles: Vec<_> = groups
            .into_iter()
            .zip([&small, &large])
            .map(|(group, settings)| {
                let tracker = &tracker;
                s.spawn(move || run_worker(settings, tracker, group).unwrap_err().0)
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for err in errors {
        assert!(
            err.contains("disagree on the partition") || err.contains("aborted"),
            "{err}"
        );
    }
}

#[test]
#[serial]
fn configuration_layers() {
    let mut conf = NamedTempFile::new().unwrap();
    writeln!(conf, "topo = 2\nworld_size = 8\nsegment_bytes = 1000").unwrap();

    // SAFETY: tests that touch the environment are serialised
    unsafe { std::env::set_var("LOCKSTEP_WORLD_SIZE", "4") };
    let cli = Config::try_parse_from(["sim", "--segment-bytes", "512"]).unwrap();
    let mut config = Config::from_sources(None, cli.clone()).unwrap();
    config.parse_extra_conf_file(conf.path(), cli).unwrap();
    unsafe { std::env::remove_var("LOCKSTEP_WORLD_SIZE") };

    let settings = config.resolve().unwrap();
    assert_eq!(settings.topo, 2);
    assert_eq!(settings.world_size, 4);
    assert_eq!(settings.dst_processes, 4);
    assert_eq!(settings.fabric.segment_bytes, 512);
}
