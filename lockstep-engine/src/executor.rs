// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! A single-threaded executor for simulation tasks.
//!
//! Every task is polled when it is woken. Once no task is runnable the
//! executor advances [`SimTime`] to the next pending clock wake-up.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Acquire;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use lockstep_track::entity::Entity;

use crate::time::clock::Clock;
use crate::time::simtime::SimTime;
use crate::types::SimResult;

static TASK_WAKER_VTABLE: RawWakerVTable =
    RawWakerVTable::new(clone_raw_waker, wake_task, wake_task_by_ref, drop_raw_waker);

fn task_raw_waker(task: Rc<Task>) -> RawWaker {
    let ptr = Rc::into_raw(task) as *const ();
    RawWaker::new(ptr, &TASK_WAKER_VTABLE)
}

fn waker_for_task(task: Rc<Task>) -> Waker {
    // Tasks only ever run on the thread that owns the executor.
    unsafe { Waker::from_raw(task_raw_waker(task)) }
}

unsafe fn clone_raw_waker(data: *const ()) -> RawWaker {
    unsafe {
        // Tasks are always wrapped in a reference counter to allow them to be shared
        // read-only. The waker being cloned keeps its own reference.
        Rc::increment_strong_count(data as *const Task);
    }
    RawWaker::new(data, &TASK_WAKER_VTABLE)
}

unsafe fn wake_task(data: *const ()) {
    // Waking by value hands the waker's reference over to the executor.
    let rc_task = unsafe { Rc::from_raw(data as *const Task) };
    let state = rc_task.executor_state.clone();
    state.new_tasks.borrow_mut().push(rc_task);
}

unsafe fn wake_task_by_ref(data: *const ()) {
    unsafe {
        Rc::increment_strong_count(data as *const Task);
        wake_task(data);
    }
}

unsafe fn drop_raw_waker(data: *const ()) {
    unsafe { drop(Rc::from_raw(data as *const Task)) }
}

struct Task {
    future: RefCell<Pin<Box<dyn Future<Output = SimResult>>>>,
    executor_state: Rc<ExecutorState>,
}

impl Task {
    pub fn new(
        future: impl Future<Output = SimResult> + 'static,
        executor_state: Rc<ExecutorState>,
    ) -> Task {
        Task {
            future: RefCell::new(Box::pin(future)),
            executor_state,
        }
    }

    fn poll(&self, context: &mut Context) -> Poll<SimResult> {
        self.future.borrow_mut().as_mut().poll(context)
    }
}

struct ExecutorState {
    task_queue: RefCell<Vec<Rc<Task>>>,
    new_tasks: RefCell<Vec<Rc<Task>>>,
    time: RefCell<SimTime>,
}

impl ExecutorState {
    pub fn new(top: &Arc<Entity>) -> Self {
        Self {
            task_queue: RefCell::new(Vec::new()),
            new_tasks: RefCell::new(Vec::new()),
            time: RefCell::new(SimTime::new(top)),
        }
    }
}

/// Single-threaded executor
///
/// This is a thin-wrapper (using [`Rc`]) around the real executor, so that this
/// struct can be cloned and passed around.
#[derive(Clone)]
pub struct Executor {
    pub entity: Arc<Entity>,
    state: Rc<ExecutorState>,
}

impl Executor {
    pub fn spawn(&self, future: impl Future<Output = SimResult> + 'static) {
        self.state
            .new_tasks
            .borrow_mut()
            .push(Rc::new(Task::new(future, self.state.clone())));
    }

    /// Run until there is nothing left to do or `stop` is set.
    pub fn run(&self, stop: &AtomicBool) -> SimResult {
        loop {
            self.step(stop)?;
            if stop.load(Acquire) {
                break;
            }

            if self.state.new_tasks.borrow().is_empty() {
                let wakers = self.state.time.borrow_mut().advance_time();
                match wakers {
                    Some(wakers) => {
                        // No events left, advance time
                        for waker in wakers {
                            waker.wake();
                        }
                    }
                    None => break,
                }
            }
        }
        Ok(())
    }

    /// Poll every task that has been woken since the last step.
    ///
    /// Tasks that are not polled because `stop` was set are kept for the next
    /// call.
    pub fn step(&self, stop: &AtomicBool) -> SimResult {
        // Append new tasks created since the last step into the task queue
        let mut task_queue = self.state.task_queue.borrow_mut();
        task_queue.append(&mut self.state.new_tasks.borrow_mut());

        let mut tasks = task_queue.drain(..);
        while let Some(task) = tasks.next() {
            if stop.load(Acquire) {
                let mut new_tasks = self.state.new_tasks.borrow_mut();
                new_tasks.push(task);
                new_tasks.extend(tasks);
                break;
            }

            let waker = waker_for_task(task.clone());
            let mut context = Context::from_waker(&waker);

            match task.poll(&mut context) {
                Poll::Ready(Err(e)) => {
                    // Error - return early
                    return Err(e);
                }
                Poll::Ready(Ok(())) => {
                    // Otherwise, drop task as it is complete
                }
                Poll::Pending => {
                    // Task will have parked itself waiting somewhere
                }
            }
        }
        Ok(())
    }

    /// Returns whether no task is runnable and no task waits on a clock.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state.new_tasks.borrow().is_empty()
            && self.state.task_queue.borrow().is_empty()
            && !self.state.time.borrow().has_pending()
    }

    /// Drop every task, whether runnable or waiting on a clock.
    pub fn destroy(&self) {
        self.state.task_queue.borrow_mut().clear();
        self.state.new_tasks.borrow_mut().clear();
        self.state.time.borrow_mut().clear();
    }

    pub fn get_clock(&self, freq_mhz: f64) -> Clock {
        self.state.time.borrow_mut().get_clock(freq_mhz)
    }

    pub fn time_now_ns(&self) -> f64 {
        self.state.time.borrow().time_now_ns()
    }

    pub fn advance_to(&self, time_ns: f64) {
        self.state.time.borrow_mut().advance_all_clocks_to(time_ns);
    }
}

/// `Spawner` spawns new futures into the executor.
#[derive(Clone)]
pub struct Spawner {
    state: Rc<ExecutorState>,
}

impl Spawner {
    pub fn spawn(&self, future: impl Future<Output = SimResult> + 'static) {
        self.state
            .new_tasks
            .borrow_mut()
            .push(Rc::new(Task::new(future, self.state.clone())));
    }
}

pub fn new_executor_and_spawner(top: &Arc<Entity>) -> (Executor, Spawner) {
    let state = Rc::new(ExecutorState::new(top));
    let entity = Arc::new(Entity::new(top, "executor"));
    (
        Executor {
            entity,
            state: state.clone(),
        },
        Spawner { state },
    )
}
