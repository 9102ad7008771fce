//! Execution primitives shared by the timeshift engine.
//!
//! This crate is intentionally free of any HLS or PVR knowledge. It provides
//! the three low-level building blocks the streaming core is built on:
//!
//! - `action_queue`: a single-worker FIFO with a one-slot high-priority lane
//!   and per-item completion callbacks. Used to serialize network and parser
//!   work off the consumer thread.
//! - `pool`: a bounded thread pool whose `submit` applies back-pressure once
//!   the backlog reaches a configurable limit. Used to parallelize segment
//!   downloads.
//! - `speedometer`: a sliding-window bytes/second accumulator, purely
//!   informational.
//!
//! Everything here is plain OS threads plus `parking_lot` mutex/condvar
//! pairs; there is no async runtime anywhere in this workspace's library
//! code.

pub mod action_queue;
pub mod pool;
pub mod speedometer;

pub use crate::action_queue::{ActionOutcome, ActionQueue, QueueError};
pub use crate::pool::{TaskHandle, TaskOutcome, ThreadPool};
pub use crate::speedometer::Speedometer;

/// Boxed error type carried by failed actions and completions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
