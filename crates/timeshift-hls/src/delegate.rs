//! Contract between the buffer and its host.
//!
//! The outer glue (channel catalog, archive support, player integration)
//! implements [`PlaylistBufferDelegate`]; the buffer core only consults the
//! cache-window size and treats the rest as pass-through for the host's
//! timeshift UI.

/// Host-side callbacks consumed by a [`crate::PlaylistBuffer`].
pub trait PlaylistBufferDelegate: Send + Sync {
    /// Number of segments the cache window should hold.
    fn segments_to_cache(&self) -> usize;

    /// Total stream duration in seconds, for timeshift windowing.
    /// Zero when unknown.
    fn duration(&self) -> f32 {
        0.0
    }

    /// Whether the underlying channel is a live broadcast.
    fn is_live(&self) -> bool {
        true
    }

    /// Resolve a timeshifted stream URL for `shift_seconds` behind the live
    /// edge; returns the URL plus the shift actually applied.
    fn url_for_timeshift(&self, shift_seconds: f32) -> Option<(String, f32)> {
        let _ = shift_seconds;
        None
    }

    /// Current playback position persisted by the host, in seconds.
    fn current_position(&self) -> f32 {
        0.0
    }

    /// Persist the playback position, in seconds.
    fn set_current_position(&self, seconds: f32) {
        let _ = seconds;
    }

    /// Smallest supported timeshift, in seconds.
    fn min_timeshift(&self) -> f32 {
        0.0
    }

    /// Largest supported timeshift, in seconds.
    fn max_timeshift(&self) -> f32 {
        0.0
    }
}
