// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Phase-synchronised execution of a workload over a sharded fabric.
//!
//! A [`WorkloadPlan`](crate::workload::WorkloadPlan) is parsed once at
//! start-of-day by every worker. The
//! [`PhaseScheduler`](crate::scheduler::PhaseScheduler) then steps through its
//! phases in order, using the [`FlowInstaller`](crate::installer::FlowInstaller)
//! to build only the endpoints this worker owns, and a group-wide vote to
//! decide when a phase has finished everywhere.

pub mod installer;
pub mod scheduler;
pub mod workload;
