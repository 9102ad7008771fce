//! Segment download pipeline.
//!
//! [`fill_segment`] streams one segment body from the network into its
//! [`MutableSegment`] buffer. Three twists of the format are handled here:
//!
//! - A response whose content type is a playlist media type is a nested
//!   playlist: its entries are fetched one after another and appended to the
//!   same outer segment.
//! - A body starting with the gzip magic `1F 8B 08` is inflated on the fly.
//! - The cancellation predicate is re-evaluated between chunks, so a seek or
//!   shutdown aborts a transfer within one chunk read.
//!
//! Runs on worker-pool threads; it never touches the cache mutex. The
//! caller publishes the returned [`FillOutcome`] to the cache.

use std::io::{Cursor, Read};

use flate2::read::GzDecoder;
use tracing::{debug, error};

use crate::error::HlsResult;
use crate::http::{HttpClient, split_header_suffix};
use crate::model::MutableSegment;
use crate::playlist::Playlist;

const CHUNK_SIZE: usize = 8192;
const GZIP_MAGIC: [u8; 3] = [0x1f, 0x8b, 0x08];
const PLAYLIST_CONTENT_TYPES: [&str; 2] = ["application/vnd.apple.mpegurl", "audio/mpegurl"];

/// How a fill attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    /// The body arrived completely and is non-empty.
    Ready,
    /// The cancellation predicate fired during the transfer.
    Canceled,
    /// Transport or dispatch failure, or an empty body at EOF.
    Failed,
}

/// Cancellation predicate evaluated between chunks.
pub type CancelCheck<'a> = dyn Fn(&MutableSegment) -> bool + Send + Sync + 'a;

/// Download one segment body, honoring nested playlists, gzip and
/// cancellation.
pub fn fill_segment(
    client: &HttpClient,
    segment: &MutableSegment,
    is_canceled: &CancelCheck<'_>,
) -> FillOutcome {
    let index = segment.info.index;
    debug!(index, "segment fill started");

    // Do not bother the server with canceled segments.
    if is_canceled(segment) {
        debug!(index, "segment canceled before transfer");
        return FillOutcome::Canceled;
    }

    match fill_inner(client, segment, is_canceled) {
        Ok(true) => {
            debug!(index, "segment canceled");
            FillOutcome::Canceled
        }
        Ok(false) => {
            if segment.size() == 0 {
                debug!(index, "segment finished with no payload");
                FillOutcome::Failed
            } else {
                debug!(index, bytes = segment.size(), "segment finished");
                FillOutcome::Ready
            }
        }
        Err(e) => {
            error!(index, "segment fill failed: {e}");
            FillOutcome::Failed
        }
    }
}

/// Returns `Ok(true)` when the transfer was canceled mid-stream.
fn fill_inner(
    client: &HttpClient,
    segment: &MutableSegment,
    is_canceled: &CancelCheck<'_>,
) -> HlsResult<bool> {
    let (response, content_type) = client.open_stream(&segment.info.url)?;

    // Some content types should be treated as a playlist.
    let content_is_playlist = content_type
        .as_deref()
        .map(|value| {
            let media_type = value.split(';').next().unwrap_or(value).trim();
            PLAYLIST_CONTENT_TYPES.contains(&media_type)
        })
        .unwrap_or(false);

    if content_is_playlist {
        let mut body = Vec::new();
        if read_all_cancellable(response, &mut body, segment, is_canceled)? {
            return Ok(true);
        }
        let text = String::from_utf8_lossy(&body);
        fill_from_nested_playlist(client, segment, &text, is_canceled)
    } else {
        stream_into(response, segment, is_canceled)
    }
}

/// Fetch the entries of a nested playlist into the outer segment.
fn fill_from_nested_playlist(
    client: &HttpClient,
    segment: &MutableSegment,
    playlist_text: &str,
    is_canceled: &CancelCheck<'_>,
) -> HlsResult<bool> {
    let (base_url, suffix) = split_header_suffix(&segment.info.url);
    let header_suffix = suffix.map(|s| format!("|{s}")).unwrap_or_default();
    let mut nested = Playlist::open_nested(playlist_text, base_url, &header_suffix, client)?;

    while let Some(info) = nested.next_to_load() {
        let (response, _) = client.open_stream(&info.url)?;
        if stream_into(response, segment, is_canceled)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Stream a body into the segment, inflating gzip when the magic matches.
/// Returns `Ok(true)` on cancellation.
fn stream_into(
    reader: impl Read,
    segment: &MutableSegment,
    is_canceled: &CancelCheck<'_>,
) -> HlsResult<bool> {
    let mut reader = reader;
    let mut head = [0u8; 3];
    let mut filled = 0;
    while filled < head.len() {
        let n = reader.read(&mut head[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    let prefixed = Cursor::new(head[..filled].to_vec()).chain(reader);
    let mut source: Box<dyn Read> = if filled == head.len() && head == GZIP_MAGIC {
        debug!(index = segment.info.index, "gzip payload detected");
        Box::new(GzDecoder::new(prefixed))
    } else {
        Box::new(prefixed)
    };

    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        let n = source.read(&mut chunk)?;
        if n == 0 {
            return Ok(false);
        }
        segment.push(&chunk[..n]);
        if is_canceled(segment) {
            return Ok(true);
        }
    }
}

/// Collect an entire body, checking cancellation between chunks.
/// Returns `Ok(true)` on cancellation.
fn read_all_cancellable(
    mut reader: impl Read,
    out: &mut Vec<u8>,
    segment: &MutableSegment,
    is_canceled: &CancelCheck<'_>,
) -> HlsResult<bool> {
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            return Ok(false);
        }
        out.extend_from_slice(&chunk[..n]);
        if is_canceled(segment) {
            return Ok(true);
        }
    }
}
