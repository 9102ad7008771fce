//! Serialized action queue.
//!
//! [`ActionQueue`] owns one dedicated worker thread and executes submitted
//! actions in FIFO order. A single high-priority slot lets a caller preempt
//! the FIFO: the worker drains the priority item between two FIFO items and
//! only then resumes the queue.
//!
//! Every submitted item gets exactly one completion callback, invoked on the
//! worker thread with one of [`ActionOutcome::Completed`],
//! [`ActionOutcome::Cancelled`] or [`ActionOutcome::Failed`]. Once
//! [`ActionQueue::stop`] has been requested, remaining FIFO items are
//! delivered as `Cancelled` without running their action; a pending priority
//! item is still performed. No item outlives the queue: by the time `stop`
//! (or drop) returns with success, every accepted item has been either
//! performed or cancelled.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::BoxError;

/// Errors returned by queue submission.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The FIFO backlog reached its configured maximum.
    #[error("action queue is full")]
    Full,

    /// The queue is stopping or stopped and accepts no new work.
    #[error("action queue is stopped")]
    Stopped,

    /// The priority slot is already occupied (non-blocking submit only).
    #[error("too many priority actions")]
    TooManyPriority,
}

/// Terminal state of one submitted item, delivered to its completion.
#[derive(Debug)]
pub enum ActionOutcome {
    /// The action ran to the end without error.
    Completed,
    /// The action was never run because the queue stopped first.
    Cancelled,
    /// The action returned an error or panicked.
    Failed(BoxError),
}

impl ActionOutcome {
    /// True for [`ActionOutcome::Completed`].
    pub fn is_completed(&self) -> bool {
        matches!(self, ActionOutcome::Completed)
    }
}

type Action = Box<dyn FnOnce() -> Result<(), BoxError> + Send + 'static>;
type Completion = Box<dyn FnOnce(ActionOutcome) + Send + 'static>;

struct QueueItem {
    action: Action,
    completion: Completion,
}

impl QueueItem {
    /// Run the action and deliver the outcome. Panics never escape: they are
    /// converted into `Failed`, and a panicking completion is only logged.
    fn perform(self, queue_name: &str) {
        let outcome = match catch_unwind(AssertUnwindSafe(self.action)) {
            Ok(Ok(())) => ActionOutcome::Completed,
            Ok(Err(e)) => ActionOutcome::Failed(e),
            Err(panic) => ActionOutcome::Failed(panic_to_error(panic)),
        };
        deliver(self.completion, outcome, queue_name);
    }

    fn cancel(self, queue_name: &str) {
        deliver(self.completion, ActionOutcome::Cancelled, queue_name);
    }
}

fn deliver(completion: Completion, outcome: ActionOutcome, queue_name: &str) {
    if catch_unwind(AssertUnwindSafe(move || completion(outcome))).is_err() {
        error!(queue = queue_name, "completion handler panicked");
    }
}

fn panic_to_error(panic: Box<dyn std::any::Any + Send>) -> BoxError {
    let msg = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "action panicked".to_string());
    msg.into()
}

struct PrioritySlot {
    item: Option<(u64, QueueItem)>,
    next_seq: u64,
    done_seq: u64,
}

struct Inner {
    name: String,
    max_size: usize,
    will_stop: AtomicBool,
    finished: AtomicBool,
    fifo: Mutex<VecDeque<QueueItem>>,
    work_cv: Condvar,
    priority_pending: AtomicBool,
    priority: Mutex<PrioritySlot>,
    priority_cv: Condvar,
    done: Mutex<bool>,
    done_cv: Condvar,
}

/// Single-worker FIFO with a one-slot priority lane.
pub struct ActionQueue {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ActionQueue {
    /// Create a queue with the given FIFO capacity and spawn its worker.
    /// `name` is used as the worker thread name and in log lines.
    pub fn new(max_size: usize, name: impl Into<String>) -> Self {
        let inner = Arc::new(Inner {
            name: name.into(),
            max_size,
            will_stop: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            fifo: Mutex::new(VecDeque::new()),
            work_cv: Condvar::new(),
            priority_pending: AtomicBool::new(false),
            priority: Mutex::new(PrioritySlot {
                item: None,
                next_seq: 1,
                done_seq: 0,
            }),
            priority_cv: Condvar::new(),
            done: Mutex::new(false),
            done_cv: Condvar::new(),
        });

        let worker_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name(inner.name.clone())
            .spawn(move || worker_main(worker_inner))
            .expect("failed to spawn action queue worker");

        Self {
            inner,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Enqueue an action. Never blocks.
    ///
    /// Fails with [`QueueError::Full`] when the backlog is at capacity and
    /// with [`QueueError::Stopped`] once `stop` has been requested. The
    /// completion runs on the worker thread after the action.
    pub fn submit<A, C>(&self, action: A, completion: C) -> Result<(), QueueError>
    where
        A: FnOnce() -> Result<(), BoxError> + Send + 'static,
        C: FnOnce(ActionOutcome) + Send + 'static,
    {
        if self.inner.will_stop.load(Ordering::Acquire) {
            return Err(QueueError::Stopped);
        }

        let mut fifo = self.inner.fifo.lock();
        if fifo.len() >= self.inner.max_size {
            return Err(QueueError::Full);
        }
        fifo.push_back(QueueItem {
            action: Box::new(action),
            completion: Box::new(completion),
        });
        self.inner.work_cv.notify_one();
        Ok(())
    }

    /// Install an action in the priority slot and block until the worker has
    /// performed it.
    ///
    /// If the slot is occupied by another caller, this waits for it to free.
    /// The worker drains the priority item before resuming FIFO work, even
    /// while stopping.
    pub fn submit_priority<A, C>(&self, action: A, completion: C) -> Result<(), QueueError>
    where
        A: FnOnce() -> Result<(), BoxError> + Send + 'static,
        C: FnOnce(ActionOutcome) + Send + 'static,
    {
        self.submit_priority_inner(Box::new(action), Box::new(completion), true)
    }

    /// Like [`ActionQueue::submit_priority`], but fails with
    /// [`QueueError::TooManyPriority`] instead of waiting when the slot is
    /// already occupied.
    pub fn try_submit_priority<A, C>(&self, action: A, completion: C) -> Result<(), QueueError>
    where
        A: FnOnce() -> Result<(), BoxError> + Send + 'static,
        C: FnOnce(ActionOutcome) + Send + 'static,
    {
        self.submit_priority_inner(Box::new(action), Box::new(completion), false)
    }

    fn submit_priority_inner(
        &self,
        action: Action,
        completion: Completion,
        wait_for_slot: bool,
    ) -> Result<(), QueueError> {
        let my_seq;
        {
            let mut slot = self.inner.priority.lock();
            while slot.item.is_some() {
                if !wait_for_slot {
                    return Err(QueueError::TooManyPriority);
                }
                if self.inner.finished.load(Ordering::Acquire) {
                    return Err(QueueError::Stopped);
                }
                self.inner
                    .priority_cv
                    .wait_for(&mut slot, Duration::from_millis(100));
            }
            if self.inner.will_stop.load(Ordering::Acquire) {
                return Err(QueueError::Stopped);
            }
            my_seq = slot.next_seq;
            slot.next_seq += 1;
            slot.item = Some((my_seq, QueueItem { action, completion }));
        }

        // Wake the worker under the FIFO lock so the flag cannot be missed
        // between its predicate check and its wait.
        {
            let _fifo = self.inner.fifo.lock();
            self.inner.priority_pending.store(true, Ordering::Release);
            self.inner.work_cv.notify_all();
        }

        let mut slot = self.inner.priority.lock();
        while slot.done_seq < my_seq {
            if self.inner.finished.load(Ordering::Acquire) {
                return Err(QueueError::Stopped);
            }
            self.inner
                .priority_cv
                .wait_for(&mut slot, Duration::from_millis(100));
        }
        Ok(())
    }

    /// Request stop and wait up to `timeout` for the worker to end.
    ///
    /// Remaining FIFO items are delivered as `Cancelled`; a pending priority
    /// item is still performed. Returns true iff the worker finished within
    /// the timeout (and has been joined).
    pub fn stop(&self, timeout: Duration) -> bool {
        self.inner.will_stop.store(true, Ordering::Release);
        {
            let _fifo = self.inner.fifo.lock();
            self.inner.work_cv.notify_all();
        }
        self.inner.priority_cv.notify_all();

        let deadline = Instant::now() + timeout;
        let mut done = self.inner.done.lock();
        while !*done {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.inner.done_cv.wait_for(&mut done, deadline - now);
        }
        let finished = *done;
        drop(done);

        if finished {
            if let Some(handle) = self.worker.lock().take() {
                let _ = handle.join();
            }
        }
        finished
    }

    /// Number of FIFO items not yet taken by the worker.
    pub fn backlog(&self) -> usize {
        self.inner.fifo.lock().len()
    }
}

impl Drop for ActionQueue {
    fn drop(&mut self) {
        if !self.stop(Duration::from_secs(5)) {
            error!(queue = %self.inner.name, "worker did not stop in time, detaching");
        }
    }
}

fn worker_main(inner: Arc<Inner>) {
    debug!(queue = %inner.name, "action queue worker started");

    loop {
        // The priority slot is served first on every iteration, so a
        // priority item lands between two FIFO items.
        let priority_item = {
            let mut slot = inner.priority.lock();
            slot.item.take()
        };
        if let Some((seq, item)) = priority_item {
            inner.priority_pending.store(false, Ordering::Release);
            item.perform(&inner.name);
            let mut slot = inner.priority.lock();
            slot.done_seq = seq;
            inner.priority_cv.notify_all();
            continue;
        }

        let stopping = inner.will_stop.load(Ordering::Acquire);
        let next = {
            let mut fifo = inner.fifo.lock();
            loop {
                if inner.priority_pending.load(Ordering::Acquire) {
                    break None;
                }
                if let Some(item) = fifo.pop_front() {
                    break Some(item);
                }
                if inner.will_stop.load(Ordering::Acquire) {
                    break None;
                }
                inner.work_cv.wait(&mut fifo);
            }
        };

        match next {
            Some(item) => {
                if stopping {
                    item.cancel(&inner.name);
                } else {
                    item.perform(&inner.name);
                }
            }
            None => {
                if inner.priority_pending.load(Ordering::Acquire) {
                    continue;
                }
                // Stopping with an empty FIFO: drain any last-moment
                // priority item, then exit.
                let last = inner.priority.lock().item.take();
                if let Some((seq, item)) = last {
                    inner.priority_pending.store(false, Ordering::Release);
                    item.perform(&inner.name);
                    let mut slot = inner.priority.lock();
                    slot.done_seq = seq;
                    inner.priority_cv.notify_all();
                }
                break;
            }
        }
    }

    inner.finished.store(true, Ordering::Release);
    *inner.done.lock() = true;
    inner.done_cv.notify_all();
    inner.priority_cv.notify_all();
    debug!(queue = %inner.name, "action queue worker finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn log_sink() -> Arc<StdMutex<Vec<String>>> {
        Arc::new(StdMutex::new(Vec::new()))
    }

    fn push(log: &Arc<StdMutex<Vec<String>>>, entry: &str) {
        log.lock().unwrap().push(entry.to_string());
    }

    fn wait_for_entries(log: &Arc<StdMutex<Vec<String>>>, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while log.lock().unwrap().len() < count {
            assert!(Instant::now() < deadline, "queue did not drain in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn fifo_completion_order_matches_submission_order() {
        let queue = ActionQueue::new(16, "test-fifo");
        let log = log_sink();

        for i in 0..5 {
            let action_log = Arc::clone(&log);
            let completion_log = Arc::clone(&log);
            queue
                .submit(
                    move || {
                        push(&action_log, &format!("run-{i}"));
                        Ok(())
                    },
                    move |outcome| {
                        assert!(outcome.is_completed());
                        push(&completion_log, &format!("done-{i}"));
                    },
                )
                .unwrap();
        }

        wait_for_entries(&log, 10);
        assert!(queue.stop(Duration::from_secs(5)));
        let entries = log.lock().unwrap().clone();
        let done: Vec<_> = entries.iter().filter(|e| e.starts_with("done")).collect();
        assert_eq!(done, ["done-0", "done-1", "done-2", "done-3", "done-4"]);
    }

    #[test]
    fn priority_item_preempts_fifo() {
        // Scenario: A sleeps, B is queued behind it, P is submitted while A
        // runs. Observed order must be A, P, B.
        let queue = ActionQueue::new(16, "test-priority");
        let log = log_sink();

        let a_log = Arc::clone(&log);
        queue
            .submit(
                move || {
                    std::thread::sleep(Duration::from_millis(50));
                    push(&a_log, "A");
                    Ok(())
                },
                |_| {},
            )
            .unwrap();
        let b_log = Arc::clone(&log);
        queue
            .submit(
                move || {
                    push(&b_log, "B");
                    Ok(())
                },
                |_| {},
            )
            .unwrap();

        // A is sleeping by now; install the priority item and block until it
        // has been performed.
        std::thread::sleep(Duration::from_millis(10));
        let p_log = Arc::clone(&log);
        queue
            .submit_priority(
                move || {
                    push(&p_log, "P");
                    Ok(())
                },
                |outcome| assert!(outcome.is_completed()),
            )
            .unwrap();

        wait_for_entries(&log, 3);
        assert!(queue.stop(Duration::from_secs(5)));
        assert_eq!(*log.lock().unwrap(), ["A", "P", "B"]);
    }

    #[test]
    fn stop_cancels_pending_items() {
        let queue = ActionQueue::new(16, "test-stop");
        let log = log_sink();

        let gate = Arc::new(StdMutex::new(()));
        let held = gate.lock().unwrap();
        let blocker_gate = Arc::clone(&gate);
        queue
            .submit(
                move || {
                    let _g = blocker_gate.lock().unwrap();
                    Ok(())
                },
                |_| {},
            )
            .unwrap();
        // Give the worker time to start the blocker, then queue the victim.
        std::thread::sleep(Duration::from_millis(20));
        let victim_log = Arc::clone(&log);
        queue
            .submit(
                || panic!("must not run"),
                move |outcome| {
                    assert!(matches!(outcome, ActionOutcome::Cancelled));
                    push(&victim_log, "cancelled");
                },
            )
            .unwrap();

        queue.inner.will_stop.store(true, Ordering::Release);
        drop(held);
        assert!(queue.stop(Duration::from_secs(5)));
        assert_eq!(*log.lock().unwrap(), ["cancelled"]);
    }

    #[test]
    fn failed_action_reports_failure_and_keeps_worker_alive() {
        let queue = ActionQueue::new(16, "test-failure");
        let log = log_sink();

        let fail_log = Arc::clone(&log);
        queue
            .submit(
                || Err("boom".into()),
                move |outcome| {
                    assert!(matches!(outcome, ActionOutcome::Failed(_)));
                    push(&fail_log, "failed");
                },
            )
            .unwrap();
        let panic_log = Arc::clone(&log);
        queue
            .submit(
                || panic!("kaboom"),
                move |outcome| {
                    assert!(matches!(outcome, ActionOutcome::Failed(_)));
                    push(&panic_log, "panicked");
                },
            )
            .unwrap();
        let ok_log = Arc::clone(&log);
        queue
            .submit(
                || Ok(()),
                move |outcome| {
                    assert!(outcome.is_completed());
                    push(&ok_log, "ok");
                },
            )
            .unwrap();

        wait_for_entries(&log, 3);
        assert!(queue.stop(Duration::from_secs(5)));
        assert_eq!(*log.lock().unwrap(), ["failed", "panicked", "ok"]);
    }

    #[test]
    fn submit_after_stop_is_rejected() {
        let queue = ActionQueue::new(4, "test-rejected");
        assert!(queue.stop(Duration::from_secs(5)));
        let err = queue.submit(|| Ok(()), |_| {}).unwrap_err();
        assert!(matches!(err, QueueError::Stopped));
    }

    #[test]
    fn backlog_limit_is_enforced() {
        let queue = ActionQueue::new(1, "test-full");
        let gate = Arc::new(StdMutex::new(()));
        let held = gate.lock().unwrap();

        let blocker_gate = Arc::clone(&gate);
        queue
            .submit(
                move || {
                    let _g = blocker_gate.lock().unwrap();
                    Ok(())
                },
                |_| {},
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));

        // Worker is busy; one slot in the FIFO, second submit overflows.
        queue.submit(|| Ok(()), |_| {}).unwrap();
        let err = queue.submit(|| Ok(()), |_| {}).unwrap_err();
        assert!(matches!(err, QueueError::Full));

        drop(held);
        assert!(queue.stop(Duration::from_secs(5)));
    }
}
