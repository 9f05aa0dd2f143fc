// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

use std::cell::Cell;
use std::rc::Rc;

use lockstep_engine::test_helpers::start_test;
use lockstep_engine::types::SimError;

#[test]
fn runs_until_idle() {
    let mut engine = start_test(file!());
    let clock = engine.default_clock();
    assert!(engine.is_idle());

    let count = Rc::new(Cell::new(0));
    {
        let count = count.clone();
        engine.spawn(async move {
            for _ in 0..3 {
                clock.wait_ticks(7).await;
                count.set(count.get() + 1);
            }
            Ok(())
        });
    }
    assert!(!engine.is_idle());

    engine.run().unwrap();
    assert_eq!(count.get(), 3);
    assert_eq!(engine.time_now_ns(), 21.0);
    assert!(engine.is_idle());
}

#[test]
fn stop_and_resume() {
    let mut engine = start_test(file!());
    let clock = engine.default_clock();
    let stopper = engine.stopper();

    let count = Rc::new(Cell::new(0));
    {
        let count = count.clone();
        engine.spawn(async move {
            for _ in 0..10 {
                clock.wait_ticks(10).await;
                count.set(count.get() + 1);
                if count.get() == 4 {
                    stopper.stop();
                }
            }
            Ok(())
        });
    }

    engine.run().unwrap();
    assert_eq!(count.get(), 4);
    assert_eq!(engine.time_now_ns(), 40.0);
    assert!(!engine.is_idle());

    // The earlier stop request does not prevent the engine resuming
    engine.run().unwrap();
    assert_eq!(count.get(), 10);
    assert_eq!(engine.time_now_ns(), 100.0);
    assert!(engine.is_idle());
}

#[test]
fn stop_keeps_unpolled_tasks() {
    let mut engine = start_test(file!());
    let stopper = engine.stopper();
    let ran = Rc::new(Cell::new(false));

    engine.spawn(async move {
        stopper.stop();
        Ok(())
    });
    {
        let ran = ran.clone();
        engine.spawn(async move {
            ran.set(true);
            Ok(())
        });
    }

    engine.run().unwrap();
    assert!(!ran.get());
    assert!(!engine.is_idle());

    engine.run().unwrap();
    assert!(ran.get());
    assert!(engine.is_idle());
}

#[test]
fn stop_from_outside_run() {
    let mut engine = start_test(file!());
    let clock = engine.default_clock();
    engine.stop();

    engine.spawn(async move {
        clock.wait_ticks(3).await;
        Ok(())
    });
    engine.run().unwrap();
    assert_eq!(engine.time_now_ns(), 3.0);
}

#[test]
fn destroy_drops_pending_work() {
    let mut engine = start_test(file!());
    let clock = engine.default_clock();
    let stopper = engine.stopper();
    let late = Rc::new(Cell::new(false));

    {
        let clock = clock.clone();
        engine.spawn(async move {
            clock.wait_ticks(5).await;
            stopper.stop();
            Ok(())
        });
    }
    {
        let late = late.clone();
        engine.spawn(async move {
            clock.wait_ticks(1000).await;
            late.set(true);
            Ok(())
        });
    }

    engine.run().unwrap();
    assert_eq!(engine.time_now_ns(), 5.0);
    assert!(!engine.is_idle());

    engine.destroy();
    assert!(engine.is_idle());
    engine.run().unwrap();
    assert!(!late.get());
    assert_eq!(engine.time_now_ns(), 5.0);
}

#[test]
fn task_error_is_returned() {
    let mut engine = start_test(file!());
    let clock = engine.default_clock();
    engine.spawn(async move {
        clock.wait_ticks(2).await;
        Err(SimError("segment for unknown port".to_string()))
    });

    match engine.run() {
        Ok(()) => panic!("Expected an error!"),
        Err(e) => assert_eq!(format!("{e}"), "Error: segment for unknown port"),
    }
}
