//! Unified configuration for the `timeshift-hls` crate.
//!
//! One flattened settings struct instead of per-component configs. All
//! values have conservative defaults; setters are chainable.

use std::time::Duration;

use tracing::warn;

/// Settings for a [`crate::PlaylistBuffer`].
#[derive(Debug, Clone)]
pub struct HlsSettings {
    /// Worker threads used for segment downloads.
    /// Clamped to `[1, hardware_concurrency]`. Default: 1.
    pub hls_threads: usize,

    /// Timeout for a single HTTP request (connect plus body).
    /// Default: 15 seconds.
    pub http_timeout: Duration,

    /// Optional override for how often live playlists are refreshed.
    /// If not set, half of `#EXT-X-TARGETDURATION` is used.
    pub refresh_interval: Option<Duration>,

    /// How long to wait for the refresh thread when stopping the buffer
    /// before detaching it. Default: 5 seconds.
    pub stop_timeout: Duration,

    /// Window size in segments used when the delegate does not supply one.
    /// Default: 8.
    pub default_segments_to_cache: usize,
}

impl Default for HlsSettings {
    fn default() -> Self {
        Self {
            hls_threads: 1,
            http_timeout: Duration::from_secs(15),
            refresh_interval: None,
            stop_timeout: Duration::from_secs(5),
            default_segments_to_cache: 8,
        }
    }
}

impl HlsSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the download thread count; values outside
    /// `[1, hardware_concurrency]` are clamped.
    pub fn hls_threads(mut self, count: usize) -> Self {
        self.hls_threads = clamp_hls_threads(count);
        self
    }

    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    pub fn refresh_interval(mut self, interval: Option<Duration>) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn default_segments_to_cache(mut self, count: usize) -> Self {
        self.default_segments_to_cache = count.max(1);
        self
    }
}

/// Clamp a requested download thread count to `[1, hardware_concurrency]`.
pub fn clamp_hls_threads(requested: usize) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    if requested < 1 {
        warn!(requested, "HLS thread count below 1, using 1");
        1
    } else if requested > cores {
        warn!(requested, cores, "HLS thread count above core count, clamping");
        cores
    } else {
        requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let settings = HlsSettings::default();
        assert_eq!(settings.hls_threads, 1);
        assert_eq!(settings.http_timeout, Duration::from_secs(15));
        assert!(settings.refresh_interval.is_none());
    }

    #[test]
    fn thread_count_is_clamped_to_the_valid_range() {
        assert_eq!(clamp_hls_threads(0), 1);
        assert!(clamp_hls_threads(1_000_000) <= std::thread::available_parallelism().unwrap().get());
        assert_eq!(HlsSettings::new().hls_threads(0).hls_threads, 1);
    }
}
