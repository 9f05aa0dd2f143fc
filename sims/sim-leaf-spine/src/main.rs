// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Run a phased workload over a leaf-spine fabric.
//!
//! For example, run using:
//!   cargo run --bin sim-leaf-spine -- --workload rdma_operate.txt
//! --topo 0 --world-size 4

use anyhow::Result;
use clap::Parser;
use lockstep_config::MultiSourceConfig;
use lockstep_track::Track;
use lockstep_track::builder::{TrackerConfig, build_text_tracker};
use sim_leaf_spine::{Config, run_world};

fn main() -> Result<()> {
    let cli = Config::try_parse()?;
    let mut config = Config::from_sources(None, cli.clone())?;
    if let Some(conf_file) = config.conf_file.clone() {
        config.parse_extra_conf_file(&conf_file, cli)?;
    }
    let settings = config.resolve()?;

    let tracker = build_text_tracker(&TrackerConfig {
        enable: true,
        level: settings.log_level,
        filter_regex: &settings.log_filter_regex,
        file: (!settings.log_file.is_empty()).then_some(settings.log_file.as_str()),
    })?;

    let result = run_world(&settings, &tracker);
    tracker.shutdown();
    let outcomes = result?;

    let simulated = outcomes
        .iter()
        .filter(|o| matches!(o, sim_leaf_spine::WorkerOutcome::Simulated { .. }))
        .count();
    println!("{simulated} of {} workers simulated", outcomes.len());
    Ok(())
}
