// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Configuration of a run.
//!
//! Every value can come from the defaults, a TOML file, a `LOCKSTEP_*`
//! environment variable or the command line (see [`lockstep_config`]).
//! [`Config::resolve`] then checks the combination and produces the
//! [`Settings`] used by the workers.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use lockstep_config::MultiSourceConfig;
use lockstep_engine::sim_error;
use lockstep_engine::types::SimError;
use lockstep_models::fabric::FabricConfig;
use lockstep_phases::scheduler::SchedulerConfig;
use lockstep_track::str_to_level;
use serde::{Deserialize, Serialize};

#[derive(Parser, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[command(about = "Run a phased workload over a leaf-spine fabric shared by worker processes")]
pub struct Config {
    /// Index of the leaf-spine topology (0 to 5).
    #[arg(long)]
    pub topo: Option<usize>,

    /// Workload file.
    #[arg(long)]
    pub workload: Option<PathBuf>,

    /// Number of worker processes launched.
    #[arg(long)]
    pub world_size: Option<usize>,

    /// Number of workers that share the fabric. Defaults to `world_size`.
    /// Any other worker exits straight away.
    #[arg(long)]
    pub dst_processes: Option<usize>,

    /// Largest payload of one segment in bytes.
    #[arg(long)]
    pub segment_bytes: Option<u32>,

    /// Link rate in Mbit/s.
    #[arg(long)]
    pub link_mbps: Option<f64>,

    /// Propagation delay of each link in ns.
    #[arg(long)]
    pub link_delay_ns: Option<f64>,

    /// Window of each queue pair in bytes, 0 for unlimited.
    #[arg(long)]
    pub qp_window: Option<u32>,

    /// Abort the run if a worker waits this long for a segment.
    #[arg(long)]
    pub stall_timeout_ms: Option<u64>,

    /// Level of log messages to emit.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Only entities whose name matches get `log_level`, others only
    /// report errors.
    #[arg(long)]
    pub log_filter_regex: Option<String>,

    /// Write the log to this file instead of stdout.
    #[arg(long)]
    pub log_file: Option<String>,

    /// Extra TOML configuration file.
    #[arg(long)]
    pub conf_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let fabric = FabricConfig::default();
        let scheduler = SchedulerConfig::default();
        Self {
            topo: Some(1),
            workload: Some(PathBuf::from("rdma_operate.txt")),
            world_size: Some(2),
            dst_processes: None,
            segment_bytes: Some(fabric.segment_bytes),
            link_mbps: Some(fabric.link_mbps),
            link_delay_ns: Some(fabric.link_delay_ns),
            qp_window: Some(scheduler.qp_window),
            stall_timeout_ms: Some(scheduler.stall_timeout.as_millis() as u64),
            log_level: Some("Info".to_string()),
            log_filter_regex: Some(String::new()),
            log_file: Some(String::new()),
            conf_file: None,
        }
    }
}

macro_rules! overlay_fields {
    ($self:ident, $other:ident ; $($field:ident),+) => {
        $(
            if $other.$field.is_some() {
                $self.$field = $other.$field;
            }
        )+
    };
}

impl MultiSourceConfig for Config {
    fn overlay(&mut self, other: Self) {
        overlay_fields!(self, other ;
            topo, workload, world_size, dst_processes, segment_bytes, link_mbps,
            link_delay_ns, qp_window, stall_timeout_ms, log_level, log_filter_regex,
            log_file, conf_file);
    }
}

/// A checked [`Config`].
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub topo: usize,
    pub workload: PathBuf,
    pub world_size: usize,
    pub dst_processes: usize,
    pub fabric: FabricConfig,
    pub scheduler: SchedulerConfig,
    pub log_level: log::Level,
    pub log_filter_regex: String,
    /// Empty for stdout.
    pub log_file: String,
}

fn required<T>(value: Option<T>, name: &str) -> Result<T, SimError> {
    match value {
        Some(value) => Ok(value),
        None => sim_error!(format!("{name} is not set")),
    }
}

impl Config {
    pub fn resolve(self) -> Result<Settings, SimError> {
        let world_size = required(self.world_size, "world_size")?;
        let dst_processes = self.dst_processes.unwrap_or(world_size);
        if world_size == 0 {
            return sim_error!("world_size must be at least 1");
        }
        if dst_processes == 0 || dst_processes > world_size {
            return sim_error!(format!(
                "dst_processes must be between 1 and world_size ({world_size}), not {dst_processes}"
            ));
        }

        let level_name = required(self.log_level, "log_level")?;
        let Some(log_level) = str_to_level(&level_name) else {
            return sim_error!(format!("unknown log level '{level_name}'"));
        };

        Ok(Settings {
            topo: required(self.topo, "topo")?,
            workload: required(self.workload, "workload")?,
            world_size,
            dst_processes,
            fabric: FabricConfig {
                link_mbps: required(self.link_mbps, "link_mbps")?,
                link_delay_ns: required(self.link_delay_ns, "link_delay_ns")?,
                segment_bytes: required(self.segment_bytes, "segment_bytes")?,
            },
            scheduler: SchedulerConfig {
                stall_timeout: Duration::from_millis(required(
                    self.stall_timeout_ms,
                    "stall_timeout_ms",
                )?),
                qp_window: required(self.qp_window, "qp_window")?,
            },
            log_level,
            log_filter_regex: self.log_filter_regex.unwrap_or_default(),
            log_file: self.log_file.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve() {
        let settings = Config::default().resolve().unwrap();
        assert_eq!(settings.topo, 1);
        assert_eq!(settings.world_size, 2);
        assert_eq!(settings.dst_processes, 2);
        assert_eq!(settings.fabric, FabricConfig::default());
        assert_eq!(settings.log_level, log::Level::Info);
    }

    #[test]
    fn overlay_only_replaces_set_fields() {
        let mut config = Config::default();
        config.overlay(Config {
            topo: Some(3),
            ..Config::try_parse_from(["sim"]).unwrap()
        });
        assert_eq!(config.topo, Some(3));
        assert_eq!(config.world_size, Some(2));
    }

    #[test]
    fn bad_combinations() {
        let too_many = Config {
            dst_processes: Some(3),
            ..Config::default()
        };
        assert!(too_many.resolve().is_err());

        let bad_level = Config {
            log_level: Some("loud".to_string()),
            ..Config::default()
        };
        assert!(bad_level.resolve().unwrap_err().0.contains("loud"));

        let nobody = Config {
            world_size: Some(0),
            ..Config::default()
        };
        assert!(nobody.resolve().is_err());
    }
}
