//! Segmented HLS streaming buffer.
//!
//! This crate turns an extended-M3U playlist of media segments into a
//! seekable, timeshifted byte stream with bounded download concurrency and
//! back-pressure.
//!
//! It is composed of several modules:
//! - `playlist`: parsing of master/media playlists and the index-translation
//!   rules for live refreshes.
//! - `cache`: the segment window — statuses, capacity, eviction, read
//!   cursor and byte-position mapping.
//! - `downloader`: streaming segment fetches with nested-playlist dispatch,
//!   gzip inflation and chunk-level cancellation.
//! - `buffer`: the public blocking `read`/`seek` façade plus the refresh
//!   loop feeding the cache through a bounded worker pool.
//! - `http`: the blocking transport wrapper and the `|header` URL suffix
//!   convention.
//! - `settings` / `delegate` / `model` / `error`: configuration, the host
//!   contract, pure data types and the crate error.
//!
//! This file (`lib.rs`) acts as a facade: it re-exports the main types from
//! the internal modules to form the public API of the `timeshift-hls`
//! crate.

mod buffer;
mod cache;
mod delegate;
mod downloader;
mod error;
mod http;
mod model;
mod playlist;
mod settings;

pub use crate::buffer::{AbortHandle, PlaylistBuffer};
pub use crate::cache::PlaylistCache;
pub use crate::delegate::PlaylistBufferDelegate;
pub use crate::downloader::{CancelCheck, FillOutcome, fill_segment};
pub use crate::error::{HlsError, HlsResult};
pub use crate::http::{HttpClient, headers_from_suffix, split_header_suffix};
pub use crate::model::{
    MutableSegment, SegmentAvailability, SegmentInfo, SegmentStatus, TimeOffset,
};
pub use crate::playlist::{Playlist, is_playlist_content, to_absolute_url};
pub use crate::settings::{HlsSettings, clamp_hls_threads};

pub use std::io::SeekFrom;
