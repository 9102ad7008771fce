//! Crate error type.
//!
//! This module defines [`HlsError`] and the [`HlsResult`] alias used across
//! the crate.
//!
//! Implementation note: transport variants are string-based to avoid exposing
//! a specific HTTP client error type in the public API.

use std::io;

/// Result type used by this crate.
pub type HlsResult<T> = Result<T, HlsError>;

/// Unified error type for the `timeshift-hls` crate.
#[derive(Debug, thiserror::Error)]
pub enum HlsError {
    /// A generic error with a message.
    #[error("{0}")]
    Message(String),

    /// The playlist is missing required tags or contains bad numeric fields.
    #[error("malformed playlist: {0}")]
    MalformedPlaylist(String),

    /// HTTP open/read failed, including unresolved effective URLs.
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation was cancelled by shutdown or seek invalidation.
    #[error("operation cancelled")]
    Cancelled,

    /// A read consumed its timeout budget with no segment becoming ready.
    #[error("segment load timed out")]
    SegmentLoadTimeout,

    /// The master playlist advertised no usable variant.
    #[error("no variants available in master playlist")]
    NoVariants,

    /// I/O error.
    ///
    /// Uses the concrete `std::io::Error` to preserve error kinds and sources.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl HlsError {
    /// Convenience helper to construct a simple message error.
    pub fn msg(msg: impl Into<String>) -> Self {
        HlsError::Message(msg.into())
    }

    /// Convenience helper for malformed playlist errors.
    pub fn malformed(msg: impl Into<String>) -> Self {
        HlsError::MalformedPlaylist(msg.into())
    }

    /// Convenience helper for transport errors.
    pub fn transport(msg: impl Into<String>) -> Self {
        HlsError::Transport(msg.into())
    }

    /// HTTP error status while fetching a resource.
    ///
    /// Intended for call-sites like:
    /// `return Err(HlsError::http_status(status.as_u16(), url));`
    pub fn http_status(status: u16, url: impl Into<String>) -> Self {
        HlsError::transport(format!("HTTP {} for {}", status, url.into()))
    }

    /// A base URL without a recognizable http(s) scheme.
    pub fn invalid_base_url(base: impl Into<String>) -> Self {
        HlsError::transport(format!("invalid base URL: {}", base.into()))
    }

    /// True when the error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, HlsError::Cancelled)
    }
}
