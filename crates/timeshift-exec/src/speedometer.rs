//! Transfer speed measurement over a sliding byte window.

use std::collections::VecDeque;
use std::time::Instant;

/// Sliding-window bytes/second accumulator.
///
/// Call [`Speedometer::start_measurement`] before a transfer step and
/// [`Speedometer::finish_measurement`] with the transferred byte count after
/// it. The window is pruned by byte volume: once the accumulated bytes
/// exceed `window_bytes`, the oldest samples are dropped. Purely
/// informational; nothing depends on its output for correctness.
#[derive(Debug)]
pub struct Speedometer {
    steps: VecDeque<MeasurementStep>,
    current_start: Option<Instant>,
    window_bytes: u64,
    total_bytes: u64,
    total_seconds: f64,
}

#[derive(Debug)]
struct MeasurementStep {
    bytes: u64,
    seconds: f64,
}

impl Speedometer {
    /// Create a speedometer keeping roughly `window_bytes` of history.
    pub fn new(window_bytes: u64) -> Self {
        Self {
            steps: VecDeque::new(),
            current_start: None,
            window_bytes,
            total_bytes: 0,
            total_seconds: 0.0,
        }
    }

    /// Drop all recorded samples.
    pub fn reset(&mut self) {
        self.steps.clear();
        self.current_start = None;
        self.total_bytes = 0;
        self.total_seconds = 0.0;
    }

    /// Mark the beginning of a transfer step.
    pub fn start_measurement(&mut self) {
        self.current_start = Some(Instant::now());
    }

    /// Record the end of a transfer step with the bytes it moved.
    /// The end of one step becomes the start of the next.
    pub fn finish_measurement(&mut self, bytes_transferred: u64) {
        let now = Instant::now();
        let seconds = self
            .current_start
            .map(|start| now.duration_since(start).as_secs_f64())
            .unwrap_or(0.0);
        self.current_start = Some(now);
        self.add_step(MeasurementStep {
            bytes: bytes_transferred,
            seconds,
        });
    }

    fn add_step(&mut self, step: MeasurementStep) {
        self.total_bytes += step.bytes;
        self.total_seconds += step.seconds;
        self.steps.push_back(step);

        while self.total_bytes > self.window_bytes {
            let Some(oldest) = self.steps.pop_front() else {
                break;
            };
            self.total_bytes -= oldest.bytes;
            self.total_seconds -= oldest.seconds;
        }
    }

    /// Average bytes per second over the window; 0.0 with no time recorded.
    pub fn bps(&self) -> f64 {
        if self.total_seconds > 0.0 {
            self.total_bytes as f64 / self.total_seconds
        } else {
            0.0
        }
    }

    /// Average KiB per second over the window.
    pub fn kbps(&self) -> f64 {
        self.bps() / 1024.0
    }

    /// Average MiB per second over the window.
    pub fn mbps(&self) -> f64 {
        self.kbps() / 1024.0
    }

    /// Bytes currently inside the window.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Seconds currently inside the window.
    pub fn total_seconds(&self) -> f64 {
        self.total_seconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn reports_zero_without_samples() {
        let meter = Speedometer::new(1024);
        assert_eq!(meter.bps(), 0.0);
        assert_eq!(meter.total_bytes(), 0);
    }

    #[test]
    fn accumulates_bytes_and_time() {
        let mut meter = Speedometer::new(u64::MAX);
        meter.start_measurement();
        std::thread::sleep(Duration::from_millis(20));
        meter.finish_measurement(2048);

        assert_eq!(meter.total_bytes(), 2048);
        assert!(meter.total_seconds() > 0.0);
        assert!(meter.bps() > 0.0);
    }

    #[test]
    fn window_is_pruned_by_byte_volume() {
        let mut meter = Speedometer::new(100);
        meter.start_measurement();
        for _ in 0..10 {
            meter.finish_measurement(60);
        }
        // At most one 60-byte sample fits under the 100-byte window after
        // pruning: adding a second one exceeds it and evicts the oldest.
        assert!(meter.total_bytes() <= 100);
        assert!(meter.total_bytes() > 0);
    }

    #[test]
    fn reset_clears_everything() {
        let mut meter = Speedometer::new(1024);
        meter.start_measurement();
        meter.finish_measurement(512);
        meter.reset();
        assert_eq!(meter.total_bytes(), 0);
        assert_eq!(meter.total_seconds(), 0.0);
        assert_eq!(meter.bps(), 0.0);
    }
}
