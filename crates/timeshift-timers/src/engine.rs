//! The timer worker and its ordered set.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::{Timer, TimerError, TimerState, store};

/// External recorder driven by the engine.
///
/// Both callbacks return whether the recorder accepted the request; a
/// refusal moves the timer to [`TimerState::Error`].
pub trait RecorderDelegate: Send + Sync {
    fn start_recording(&self, timer: &Timer) -> bool;
    fn stop_recording(&self, timer: &Timer) -> bool;

    /// Published after every dispatch pass so the host can refresh its
    /// timer list.
    fn timers_changed(&self) {}
}

/// Composite ordering key: margin-adjusted start time, then client index.
/// Stable across equal start times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    adjusted_start: i64,
    client_index: u32,
}

impl TimerKey {
    fn of(timer: &Timer) -> Self {
        Self {
            adjusted_start: timer.adjusted_start(),
            client_index: timer.client_index,
        }
    }
}

struct Inner {
    timers: Mutex<BTreeMap<TimerKey, Timer>>,
    cv: Condvar,
    stop: AtomicBool,
    delegate: Arc<dyn RecorderDelegate>,
    last_index: AtomicU32,
    cache_path: Option<PathBuf>,
}

/// Ordered set of scheduled recordings with a single dispatch worker.
pub struct TimersEngine {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TimersEngine {
    /// Start the engine. When `cache_path` is given, a previously persisted
    /// set is reloaded (timers caught mid-recording come back as
    /// [`TimerState::Aborted`]) and every mutation is written back to it.
    pub fn new(delegate: Arc<dyn RecorderDelegate>, cache_path: Option<PathBuf>) -> Self {
        let inner = Arc::new(Inner {
            timers: Mutex::new(BTreeMap::new()),
            cv: Condvar::new(),
            stop: AtomicBool::new(false),
            delegate,
            last_index: AtomicU32::new(0),
            cache_path,
        });

        load_cache(&inner);

        let worker_inner = Arc::clone(&inner);
        let worker = std::thread::Builder::new()
            .name("timeshift-timers".to_string())
            .spawn(move || worker_main(worker_inner))
            .expect("failed to spawn timers worker");

        Self {
            inner,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Insert a timer, assigning its unique client index. Wakes the worker
    /// and persists the set.
    pub fn add(&self, mut timer: Timer) -> Result<u32, TimerError> {
        if timer.end < timer.start {
            return Err(TimerError::InvalidTimer);
        }
        let index = self.inner.last_index.fetch_add(1, Ordering::SeqCst) + 1;
        timer.client_index = index;
        timer.state = TimerState::Scheduled;
        debug!(index, title = %timer.title, "timer scheduled");

        {
            let mut timers = self.inner.timers.lock();
            timers.insert(TimerKey::of(&timer), timer);
            persist(&self.inner, &timers);
        }
        self.inner.cv.notify_all();
        Ok(index)
    }

    /// Replace the payload of an existing timer, keyed by client index.
    /// Its state and index are preserved; the set is re-ordered.
    pub fn update(&self, updated: Timer) -> Result<(), TimerError> {
        {
            let mut timers = self.inner.timers.lock();
            let key = find_key(&timers, updated.client_index).ok_or(TimerError::InvalidTimer)?;
            let existing = timers.remove(&key).expect("key just found");
            let mut replacement = updated;
            replacement.client_index = existing.client_index;
            replacement.state = existing.state;
            timers.insert(TimerKey::of(&replacement), replacement);
            persist(&self.inner, &timers);
        }
        self.inner.cv.notify_all();
        Ok(())
    }

    /// Remove a timer. A running recording is refused unless `force` is
    /// set; a forced delete stops the recorder first. Returns the removed
    /// timer with its final state.
    pub fn delete(&self, client_index: u32, force: bool) -> Result<Timer, TimerError> {
        let removed = {
            let mut timers = self.inner.timers.lock();
            let key = find_key(&timers, client_index).ok_or(TimerError::InvalidTimer)?;
            if timers[&key].state == TimerState::Recording && !force {
                return Err(TimerError::RecordingRunning);
            }
            let mut timer = timers.remove(&key).expect("key just found");
            if timer.state == TimerState::Recording {
                let stopped = self.inner.delegate.stop_recording(&timer);
                timer.state = if !stopped {
                    TimerState::Error
                } else if now_epoch() >= timer.adjusted_end() {
                    TimerState::Completed
                } else {
                    TimerState::Canceled
                };
            }
            debug!(client_index, "timer deleted");
            persist(&self.inner, &timers);
            timer
        };
        self.inner.cv.notify_all();
        Ok(removed)
    }

    /// Snapshot copy of the set, in scheduling order.
    pub fn list(&self) -> Vec<Timer> {
        self.inner.timers.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.timers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for TimersEngine {
    fn drop(&mut self) {
        self.inner.stop.store(true, Ordering::Release);
        self.inner.cv.notify_all();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
        let timers = self.inner.timers.lock();
        persist(&self.inner, &timers);
    }
}

fn find_key(timers: &BTreeMap<TimerKey, Timer>, client_index: u32) -> Option<TimerKey> {
    timers
        .iter()
        .find(|(_, timer)| timer.client_index == client_index)
        .map(|(key, _)| *key)
}

fn load_cache(inner: &Arc<Inner>) {
    let Some(path) = &inner.cache_path else {
        return;
    };
    if !path.exists() {
        debug!("no timer cache found");
        return;
    }
    match store::load(path) {
        Ok(loaded) => {
            let mut timers = inner.timers.lock();
            let mut highest = 0;
            for mut timer in loaded {
                if timer.state == TimerState::Recording {
                    // The host restarted mid-recording.
                    timer.state = TimerState::Aborted;
                }
                highest = highest.max(timer.client_index);
                timers.insert(TimerKey::of(&timer), timer);
            }
            inner.last_index.store(highest, Ordering::SeqCst);
            debug!(count = timers.len(), "timer cache loaded");
        }
        Err(e) => {
            error!("failed to load timer cache: {e}");
        }
    }
}

fn persist(inner: &Inner, timers: &BTreeMap<TimerKey, Timer>) {
    let Some(path) = &inner.cache_path else {
        return;
    };
    if let Err(e) = store::save(path, timers.values()) {
        error!("failed to save timer cache: {e}");
        let _ = std::fs::remove_file(path);
    }
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

const MAX_SLEEP: i64 = 24 * 3600;

fn worker_main(inner: Arc<Inner>) {
    debug!("timers worker started");
    loop {
        if inner.stop.load(Ordering::Acquire) {
            break;
        }

        let mut timers = inner.timers.lock();
        let (next_wakeup, changed) = dispatch_due(&inner, &mut timers);
        if changed {
            persist(&inner, &timers);
        }
        inner.delegate.timers_changed();

        let wait = (next_wakeup - now_epoch()).clamp(0, MAX_SLEEP);
        if wait == 0 {
            // A boundary is already due; run another pass right away.
            continue;
        }
        inner.cv.wait_for(&mut timers, Duration::from_secs(wait as u64));
    }
    debug!("timers worker finished");
}

/// One dispatch pass: stop every recording past its end, start every
/// scheduled timer past its start (each exactly once, by state transition),
/// and compute the next wake-up boundary.
fn dispatch_due(inner: &Inner, timers: &mut BTreeMap<TimerKey, Timer>) -> (i64, bool) {
    let now = now_epoch();
    let mut next_wakeup = now + MAX_SLEEP;
    let mut changed = false;

    for timer in timers.values_mut() {
        match timer.state {
            TimerState::Recording => {
                if timer.adjusted_end() <= now {
                    let stopped = inner.delegate.stop_recording(timer);
                    timer.state = if stopped {
                        TimerState::Completed
                    } else {
                        TimerState::Error
                    };
                    if !stopped {
                        warn!(index = timer.client_index, "recorder failed to stop");
                    }
                    changed = true;
                } else {
                    next_wakeup = next_wakeup.min(timer.adjusted_end());
                }
            }
            TimerState::Scheduled => {
                if timer.adjusted_start() <= now {
                    let started = inner.delegate.start_recording(timer);
                    timer.state = if started {
                        TimerState::Recording
                    } else {
                        TimerState::Error
                    };
                    if started {
                        next_wakeup = next_wakeup.min(timer.adjusted_end());
                    } else {
                        warn!(index = timer.client_index, "recorder failed to start");
                    }
                    changed = true;
                } else {
                    next_wakeup = next_wakeup.min(timer.adjusted_start());
                }
            }
            _ => {}
        }
    }

    (next_wakeup, changed)
}
