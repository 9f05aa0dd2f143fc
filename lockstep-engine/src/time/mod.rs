// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Simulation time: clocks and the owner of all clocks.

pub mod clock;
pub mod simtime;
