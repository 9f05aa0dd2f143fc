// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

#![doc(test(attr(warn(unused))))]

//! The discrete-event engine that runs one shard of a lockstep simulation.
//!
//! Each worker owns exactly one [`Engine`](crate::engine::Engine). Models
//! spawn `async` tasks into it and use a [`Clock`](crate::time::clock::Clock)
//! to model the passing of time. The engine is single-threaded and
//! cooperative: [`run()`](crate::engine::Engine::run) polls every runnable
//! task, then advances time to the next pending wake-up, and returns when
//! nothing is left to do or when a [`Stopper`](crate::engine::Stopper) has
//! been triggered.
//!
//! A stopped engine keeps all of its pending work so that it can be resumed
//! by calling `run()` again. This is what allows a phase scheduler to pause
//! the simulation, synchronise with other workers, install more work and
//! carry on.
//!
//! ```rust
//! use lockstep_engine::test_helpers::start_test;
//!
//! let mut engine = start_test(file!());
//! let clock = engine.default_clock();
//! engine.spawn(async move {
//!     clock.wait_ticks(10).await;
//!     Ok(())
//! });
//! engine.run().unwrap();
//! assert_eq!(engine.time_now_ns(), 10.0);
//! ```

pub mod engine;
pub mod executor;
pub mod test_helpers;
pub mod time;
pub mod types;
