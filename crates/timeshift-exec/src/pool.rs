//! Bounded thread pool.
//!
//! [`ThreadPool`] runs independent tasks on a fixed set of worker threads.
//! Unlike a plain channel-backed pool, `submit` applies back-pressure: once
//! the backlog reaches the configured queue limit the submitting thread
//! blocks until a slot frees or shutdown begins. There is no FIFO guarantee
//! across workers; tasks are independent.
//!
//! Each submission returns a [`TaskHandle`] resolving to
//! [`TaskOutcome::Completed`], [`TaskOutcome::Cancelled`] (shutdown before
//! the task ran) or [`TaskOutcome::Failed`] (the task panicked). A panicking
//! task never takes a worker down.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

/// Terminal state of one pool task.
#[derive(Debug)]
pub enum TaskOutcome<T> {
    /// The task ran to completion and produced its value.
    Completed(T),
    /// The pool shut down before the task was started.
    Cancelled,
    /// The task panicked.
    Failed,
}

impl<T> TaskOutcome<T> {
    /// True for [`TaskOutcome::Completed`].
    pub fn is_completed(&self) -> bool {
        matches!(self, TaskOutcome::Completed(_))
    }
}

struct OutcomeCell<T> {
    slot: Mutex<Option<TaskOutcome<T>>>,
    cv: Condvar,
}

impl<T> OutcomeCell<T> {
    fn set(&self, outcome: TaskOutcome<T>) {
        let mut slot = self.slot.lock();
        *slot = Some(outcome);
        self.cv.notify_all();
    }
}

/// Waitable handle for a submitted task.
pub struct TaskHandle<T> {
    cell: Arc<OutcomeCell<T>>,
}

impl<T> TaskHandle<T> {
    /// Block until the task reaches a terminal state.
    pub fn wait(self) -> TaskOutcome<T> {
        let mut slot = self.cell.slot.lock();
        while slot.is_none() {
            self.cell.cv.wait(&mut slot);
        }
        slot.take().expect("outcome present after wait")
    }

    /// Block up to `timeout`; `None` if the task is still pending.
    pub fn wait_for(self, timeout: Duration) -> Option<TaskOutcome<T>> {
        let mut slot = self.cell.slot.lock();
        if slot.is_none() {
            self.cell.cv.wait_for(&mut slot, timeout);
        }
        slot.take()
    }

    /// Non-blocking check for a terminal state.
    pub fn is_finished(&self) -> bool {
        self.cell.slot.lock().is_some()
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct State {
    queue: VecDeque<Job>,
    queue_limit: usize,
    in_flight: usize,
    shutdown: bool,
    // Surplus workers to retire after a resize-down; each worker consumes
    // one pending stop and exits after finishing its current task.
    pending_stops: usize,
    threads: usize,
}

struct Shared {
    state: Mutex<State>,
    work_cv: Condvar,
    space_cv: Condvar,
    idle_cv: Condvar,
}

/// Fixed-size worker pool with a bounded task queue.
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl ThreadPool {
    /// Spawn a pool with `threads` workers (at least one).
    pub fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                queue_limit: 100_000,
                in_flight: 0,
                shutdown: false,
                pending_stops: 0,
                threads,
            }),
            work_cv: Condvar::new(),
            space_cv: Condvar::new(),
            idle_cv: Condvar::new(),
        });

        let pool = Self {
            shared,
            workers: Mutex::new(Vec::with_capacity(threads)),
        };
        pool.spawn_workers(threads);
        pool
    }

    /// Pool sized for the local machine: `max(2, hardware_concurrency)`.
    pub fn with_default_size() -> Self {
        let n = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self::new(n.max(2))
    }

    fn spawn_workers(&self, count: usize) {
        let mut workers = self.workers.lock();
        for _ in 0..count {
            let shared = Arc::clone(&self.shared);
            let handle = std::thread::Builder::new()
                .name("timeshift-pool".to_string())
                .spawn(move || worker_main(shared))
                .expect("failed to spawn pool worker");
            workers.push(handle);
        }
    }

    /// Cap the backlog; subsequent submits block once it is reached.
    pub fn set_queue_limit(&self, limit: usize) {
        let mut state = self.shared.state.lock();
        state.queue_limit = limit.max(1);
        self.shared.space_cv.notify_all();
    }

    /// Submit a task.
    ///
    /// Blocks while the backlog is at the queue limit. After shutdown the
    /// task is not queued and the returned handle resolves to `Cancelled`.
    pub fn submit<T, F>(&self, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let cell = Arc::new(OutcomeCell {
            slot: Mutex::new(None),
            cv: Condvar::new(),
        });
        let handle = TaskHandle {
            cell: Arc::clone(&cell),
        };

        let job: Job = Box::new(move || {
            match catch_unwind(AssertUnwindSafe(task)) {
                Ok(value) => cell.set(TaskOutcome::Completed(value)),
                Err(_) => {
                    warn!("pool task panicked");
                    cell.set(TaskOutcome::Failed);
                }
            }
        });

        let mut state = self.shared.state.lock();
        while state.queue.len() >= state.queue_limit && !state.shutdown {
            self.shared.space_cv.wait(&mut state);
        }
        if state.shutdown {
            drop(state);
            handle.cell.set(TaskOutcome::Cancelled);
            return handle;
        }
        state.queue.push_back(job);
        self.shared.work_cv.notify_one();
        handle
    }

    /// Block until the queue is empty and no task is running.
    pub fn wait_idle(&self) {
        let mut state = self.shared.state.lock();
        while !(state.queue.is_empty() && state.in_flight == 0) {
            self.shared.idle_cv.wait(&mut state);
        }
    }

    /// Grow or shrink the worker set. Shrinking retires surplus workers
    /// after their current task.
    pub fn resize(&self, new_size: usize) {
        let new_size = new_size.max(1);
        let to_spawn = {
            let mut state = self.shared.state.lock();
            let current = state.threads;
            state.threads = new_size;
            if new_size > current {
                new_size - current
            } else {
                state.pending_stops += current - new_size;
                self.shared.work_cv.notify_all();
                0
            }
        };
        if to_spawn > 0 {
            self.spawn_workers(to_spawn);
        }
    }

    /// Number of queued (not yet started) tasks.
    pub fn backlog(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Number of tasks currently executing.
    pub fn in_flight(&self) -> usize {
        self.shared.state.lock().in_flight
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
        }
        self.shared.work_cv.notify_all();
        self.shared.space_cv.notify_all();

        let workers = std::mem::take(&mut *self.workers.lock());
        debug!(workers = workers.len(), "shutting down thread pool");
        for handle in workers {
            let _ = handle.join();
        }
    }
}

fn worker_main(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if state.pending_stops > 0 {
                    state.pending_stops -= 1;
                    return;
                }
                if let Some(job) = state.queue.pop_front() {
                    state.in_flight += 1;
                    shared.space_cv.notify_one();
                    break job;
                }
                if state.shutdown {
                    // Drain-then-exit: the backlog has been consumed.
                    return;
                }
                shared.work_cv.wait(&mut state);
            }
        };

        // Panics are contained inside the job wrapper, so this cannot
        // unwind past the in-flight bookkeeping below.
        job();

        let mut state = shared.state.lock();
        state.in_flight -= 1;
        if state.in_flight == 0 && state.queue.is_empty() {
            shared.idle_cv.notify_all();
        }
    }
}
