//! Recording scheduler.
//!
//! [`TimersEngine`] keeps a totally ordered set of scheduled recordings,
//! wakes a single worker at the next boundary (start of the next scheduled
//! timer, end of the earliest running recording, or 24 hours out) and
//! dispatches start/stop calls on an external [`RecorderDelegate`].
//!
//! The set is persisted to a binary cache file on every mutation and on
//! clean shutdown; a host restart downgrades any timer that was mid
//! recording to `Aborted`.

mod engine;
mod store;

pub use crate::engine::{RecorderDelegate, TimersEngine};
pub use crate::store::{load as load_timers, save as save_timers};

/// Errors surfaced by the timer engine.
#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    /// Deleting a running recording without `force`.
    #[error("recording is running")]
    RecordingRunning,

    /// The referenced timer does not exist or the payload is unusable.
    #[error("invalid timer")]
    InvalidTimer,

    /// Reading or writing the persistence file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The persistence file does not match the expected layout.
    #[error("corrupt timer cache: {0}")]
    Corrupt(String),
}

/// Lifecycle state of one timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Waiting for its start boundary.
    Scheduled,
    /// The recorder delegate has been started for it.
    Recording,
    /// The recording ran to its end boundary.
    Completed,
    /// Stopped early by a forced delete.
    Canceled,
    /// The recorder delegate reported failure.
    Error,
    /// The host restarted while this timer was recording.
    Aborted,
}

impl TimerState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            TimerState::Scheduled => 1,
            TimerState::Recording => 2,
            TimerState::Completed => 3,
            TimerState::Canceled => 4,
            TimerState::Error => 5,
            TimerState::Aborted => 6,
        }
    }

    pub(crate) fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            1 => TimerState::Scheduled,
            2 => TimerState::Recording,
            3 => TimerState::Completed,
            4 => TimerState::Canceled,
            5 => TimerState::Error,
            6 => TimerState::Aborted,
            _ => return None,
        })
    }
}

/// One scheduled recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timer {
    /// Channel to record.
    pub channel_id: u32,
    /// Scheduled start, seconds since the Unix epoch.
    pub start: i64,
    /// Scheduled end, seconds since the Unix epoch.
    pub end: i64,
    /// Minutes recorded ahead of `start`.
    pub margin_start_min: u16,
    /// Minutes recorded past `end`.
    pub margin_end_min: u16,
    pub state: TimerState,
    pub title: String,
    /// Engine-assigned identifier, unique and monotone per engine.
    pub client_index: u32,
}

impl Timer {
    /// Build a timer payload; the engine assigns the client index on add.
    pub fn new(channel_id: u32, start: i64, end: i64, title: impl Into<String>) -> Self {
        Self {
            channel_id,
            start,
            end,
            margin_start_min: 0,
            margin_end_min: 0,
            state: TimerState::Scheduled,
            title: title.into(),
            client_index: 0,
        }
    }

    pub fn with_margins(mut self, start_min: u16, end_min: u16) -> Self {
        self.margin_start_min = start_min;
        self.margin_end_min = end_min;
        self
    }

    /// Start boundary including the leading margin.
    pub fn adjusted_start(&self) -> i64 {
        self.start - i64::from(self.margin_start_min) * 60
    }

    /// End boundary including the trailing margin.
    pub fn adjusted_end(&self) -> i64 {
        self.end + i64::from(self.margin_end_min) * 60
    }
}
