//! Extended-M3U playlist parsing.
//!
//! [`Playlist`] understands the subset of the HLS dialect the buffer engine
//! needs: `EXT-X-STREAM-INF` (variant selection by highest bandwidth),
//! `EXT-X-TARGETDURATION`, `EXT-X-MEDIA-SEQUENCE`, `EXT-X-ENDLIST` and
//! `EXTINF`. Unknown tags are ignored without error.
//!
//! Two quirks of the dialect are handled here and nowhere else:
//!
//! - URL resolution follows the origin's scheme-scan rules rather than
//!   generic RFC 3986 joining: an entry containing `://` is absolute,
//!   anything else is resolved against the authority and base path of the
//!   playlist URL.
//! - A `|` in the user-supplied source URL separates the fetchable URL from
//!   an HTTP-header fragment which is preserved and reattached to every
//!   resolved segment URL.
//!
//! Media-sequence numbers are internal: the first observed value maps to
//! `index_offset`, and later refreshes translate through that anchor, so the
//! indices handed to the cache stay stable and monotone. A refresh whose
//! first index moves backwards is rejected as malformed.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{HlsError, HlsResult};
use crate::http::{HttpClient, split_header_suffix};
use crate::model::SegmentInfo;

const TAG_STREAM_INF: &str = "#EXT-X-STREAM-INF:";
const TAG_TARGET_DURATION: &str = "#EXT-X-TARGETDURATION:";
const TAG_MEDIA_SEQUENCE: &str = "#EXT-X-MEDIA-SEQUENCE:";
const TAG_END_LIST: &str = "#EXT-X-ENDLIST";
const TAG_INF: &str = "#EXTINF:";

/// True when the string is playlist text rather than a URL.
pub fn is_playlist_content(source: &str) -> bool {
    source.contains("#EXTM3U")
}

/// Parsed media playlist state plus the load cursor the cache iterates with.
#[derive(Debug)]
pub struct Playlist {
    segments: BTreeMap<u64, SegmentInfo>,
    /// Fetchable playlist URL (header suffix stripped).
    url: String,
    /// `|...` fragment from the source URL, reattached to segment URLs.
    /// Empty when the source carried none.
    header_suffix: String,
    load_cursor: u64,
    index_offset: u64,
    target_duration: u32,
    initial_internal_index: Option<u64>,
    last_first_media_index: Option<u64>,
    is_vod: bool,
}

impl Playlist {
    /// Open a playlist from a user-supplied source: either a URL (optionally
    /// carrying a `|header` suffix) or raw playlist text.
    ///
    /// For a master playlist the variant with the highest `BANDWIDTH` is
    /// selected and its media playlist fetched before this returns, so the
    /// bitrate-selection step is complete once construction succeeds.
    pub fn open(source: &str, index_offset: u64, client: &HttpClient) -> HlsResult<Self> {
        if is_playlist_content(source) {
            let mut playlist = Self::empty(String::new(), String::new(), index_offset);
            playlist.set_best_playlist(source, client)?;
            Ok(playlist)
        } else {
            let (url, suffix) = split_header_suffix(source);
            let header_suffix = match suffix {
                Some(s) => format!("|{s}"),
                None => String::new(),
            };
            let mut playlist = Self::empty(url.to_string(), header_suffix, index_offset);
            let data = playlist.fetch(client)?;
            playlist.set_best_playlist(&data, client)?;
            Ok(playlist)
        }
    }

    /// Parse nested playlist text discovered inside a segment body. The
    /// segment's own URL acts as the base for relative entries.
    pub(crate) fn open_nested(
        content: &str,
        base_url: &str,
        header_suffix: &str,
        client: &HttpClient,
    ) -> HlsResult<Self> {
        let mut playlist = Self::empty(base_url.to_string(), header_suffix.to_string(), 0);
        playlist.set_best_playlist(content, client)?;
        Ok(playlist)
    }

    /// Parse media playlist text directly, without any network access.
    /// Master playlists are rejected here; use [`Playlist::open`] for those.
    pub fn from_content(
        content: &str,
        base_url: &str,
        header_suffix: &str,
        index_offset: u64,
    ) -> HlsResult<Self> {
        if content.contains(TAG_STREAM_INF) {
            return Err(HlsError::malformed(
                "master playlist requires a URL source",
            ));
        }
        let mut playlist = Self::empty(base_url.to_string(), header_suffix.to_string(), index_offset);
        playlist.ingest(content)?;
        playlist.reset_cursor_to_head();
        Ok(playlist)
    }

    fn empty(url: String, header_suffix: String, index_offset: u64) -> Self {
        Self {
            segments: BTreeMap::new(),
            url,
            header_suffix,
            load_cursor: 0,
            index_offset,
            target_duration: 0,
            initial_internal_index: None,
            last_first_media_index: None,
            is_vod: false,
        }
    }

    /// Re-fetch and fold a live playlist. A no-op success for VOD.
    /// Returns whether the parse produced any segment entries.
    pub fn reload(&mut self, client: &HttpClient) -> HlsResult<bool> {
        if self.is_vod {
            return Ok(true);
        }
        let data = self.fetch(client)?;
        self.ingest(&data)
    }

    fn fetch(&self, client: &HttpClient) -> HlsResult<String> {
        client.get_text(&format!("{}{}", self.url, self.header_suffix))
    }

    fn set_best_playlist(&mut self, data: &str, client: &HttpClient) -> HlsResult<()> {
        if data.contains(TAG_STREAM_INF) {
            let best = select_best_variant(data)?;
            self.url = to_absolute_url(&best, &self.url)?;
            debug!(url = %self.url, "selected highest-bandwidth variant");
            let media = self.fetch(client)?;
            self.ingest(&media)?;
        } else {
            self.ingest(data)?;
        }
        self.reset_cursor_to_head();
        Ok(())
    }

    fn reset_cursor_to_head(&mut self) {
        self.load_cursor = self.segments.keys().next().copied().unwrap_or(0);
    }

    /// Fold one media playlist parse into the segment map.
    ///
    /// Entries whose index already exists are left untouched, so re-parsing
    /// the same text is idempotent and refreshed live playlists only append
    /// their new tail.
    pub(crate) fn ingest(&mut self, data: &str) -> HlsResult<bool> {
        let target = tag_value(data, TAG_TARGET_DURATION)
            .ok_or_else(|| HlsError::malformed("missing EXT-X-TARGETDURATION"))?;
        self.target_duration = parse_leading_u64(target)
            .ok_or_else(|| HlsError::malformed("bad EXT-X-TARGETDURATION value"))?
            as u32;

        let mut media_index = self.index_offset;
        if let Some(value) = tag_value(data, TAG_MEDIA_SEQUENCE) {
            let internal = parse_leading_u64(value)
                .ok_or_else(|| HlsError::malformed("bad EXT-X-MEDIA-SEQUENCE value"))?;
            let initial = *self.initial_internal_index.get_or_insert(internal);
            if internal < initial {
                return Err(HlsError::malformed(
                    "media sequence rolled backwards between refreshes",
                ));
            }
            media_index = self.index_offset + (internal - initial);
        }
        if let Some(previous) = self.last_first_media_index {
            if media_index < previous {
                return Err(HlsError::malformed(
                    "refresh is not monotone with the previous playlist",
                ));
            }
        }
        self.last_first_media_index = Some(media_index);

        self.is_vod = data.contains(TAG_END_LIST);

        let mut has_content = false;
        let mut pending_duration: Option<f32> = None;
        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix(TAG_INF) {
                let duration_text = rest.split(',').next().unwrap_or(rest).trim();
                let duration: f32 = duration_text
                    .parse()
                    .map_err(|_| HlsError::malformed("bad EXTINF duration"))?;
                if duration < 0.0 {
                    return Err(HlsError::malformed("negative EXTINF duration"));
                }
                pending_duration = Some(duration);
            } else if line.starts_with('#') {
                // Unknown tags are ignored without error.
                continue;
            } else if let Some(duration) = pending_duration.take() {
                let url = format!(
                    "{}{}",
                    to_absolute_url(line, &self.url)?,
                    self.header_suffix
                );
                let start_time = match self.segments.values().next_back() {
                    Some(previous) => previous.start_time + previous.duration,
                    None => self.time_offset(),
                };
                self.segments.entry(media_index).or_insert(SegmentInfo {
                    url,
                    index: media_index,
                    duration,
                    start_time,
                });
                media_index += 1;
                has_content = true;
            }
        }

        Ok(has_content)
    }

    /// Next entry at or past the load cursor; advances the cursor past it.
    pub fn next_to_load(&mut self) -> Option<SegmentInfo> {
        let (&index, info) = self.segments.range(self.load_cursor..).next()?;
        self.load_cursor = index + 1;
        Some(info.clone())
    }

    /// Rewind (or advance) the load cursor to `index`.
    pub fn set_next_to_load(&mut self, index: u64) {
        self.load_cursor = index;
    }

    /// Move the load cursor back to `index` if it is already past it, so
    /// the entry is rediscovered by the next fold.
    pub fn rewind_to(&mut self, index: u64) {
        self.load_cursor = self.load_cursor.min(index);
    }

    /// Drop entries below `index`; keeps the playlist map bounded for
    /// long-running live streams.
    pub fn drop_before(&mut self, index: u64) {
        self.segments = self.segments.split_off(&index);
    }

    pub fn has_segment(&self, index: u64) -> bool {
        self.segments.contains_key(&index)
    }

    pub fn segment_info(&self, index: u64) -> Option<&SegmentInfo> {
        self.segments.get(&index)
    }

    /// Highest known media index, if any segment has been seen.
    pub fn last_index(&self) -> Option<u64> {
        self.segments.keys().next_back().copied()
    }

    /// Lowest known media index, if any segment has been seen.
    pub fn first_index(&self) -> Option<u64> {
        self.segments.keys().next().copied()
    }

    pub fn is_vod(&self) -> bool {
        self.is_vod
    }

    /// Target segment duration in seconds.
    pub fn target_duration(&self) -> u32 {
        self.target_duration
    }

    /// Start-time seed for the first segment, derived from the index offset.
    pub fn time_offset(&self) -> f32 {
        self.target_duration as f32 * self.index_offset as f32
    }
}

/// Pick the variant with the highest `BANDWIDTH` from master playlist text.
fn select_best_variant(data: &str) -> HlsResult<String> {
    let mut best: Option<(u64, String)> = None;
    let mut lines = data.lines();
    while let Some(line) = lines.next() {
        let line = line.trim();
        let Some(attributes) = line.strip_prefix(TAG_STREAM_INF) else {
            continue;
        };
        let bandwidth = parse_bandwidth_attribute(attributes)?;
        let uri = loop {
            match lines.next() {
                Some(candidate) => {
                    let candidate = candidate.trim();
                    if candidate.is_empty() {
                        continue;
                    }
                    if candidate.starts_with('#') {
                        return Err(HlsError::malformed("EXT-X-STREAM-INF without URI line"));
                    }
                    break candidate;
                }
                None => return Err(HlsError::malformed("EXT-X-STREAM-INF without URI line")),
            }
        };
        if best.as_ref().is_none_or(|(rate, _)| bandwidth > *rate) {
            best = Some((bandwidth, uri.to_string()));
        }
    }
    best.map(|(_, uri)| uri).ok_or(HlsError::NoVariants)
}

fn parse_bandwidth_attribute(attributes: &str) -> HlsResult<u64> {
    let value = attributes
        .split_once("BANDWIDTH=")
        .map(|(_, rest)| rest)
        .ok_or_else(|| HlsError::malformed("missing BANDWIDTH in EXT-X-STREAM-INF"))?;
    parse_leading_u64(value).ok_or_else(|| HlsError::malformed("bad BANDWIDTH value"))
}

fn parse_leading_u64(text: &str) -> Option<u64> {
    let digits: String = text
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

fn tag_value<'a>(data: &'a str, tag: &str) -> Option<&'a str> {
    let start = data.find(tag)? + tag.len();
    let rest = &data[start..];
    Some(rest.lines().next().unwrap_or(rest))
}

/// Resolve a playlist entry against its playlist's URL.
///
/// An entry containing `://` is already absolute. Otherwise the base URL
/// must carry an http(s) scheme; the entry is appended to the base's
/// authority plus its path up to the last `/`.
pub fn to_absolute_url(target: &str, base_url: &str) -> HlsResult<String> {
    if target.contains("://") {
        return Ok(target.to_string());
    }

    for scheme in ["http://", "https://"] {
        let Some(scheme_pos) = base_url.find(scheme) else {
            continue;
        };
        let authority_start = scheme_pos + scheme.len();
        let Some(path_offset) = base_url[authority_start..].find('/') else {
            return Ok(format!("{base_url}/{target}"));
        };
        let path_start = authority_start + path_offset;
        let base_path = &base_url[path_start..];
        let base_path = match base_path.rfind('/') {
            Some(last_slash) => &base_path[..last_slash + 1],
            None => base_path,
        };
        return Ok(format!("{}{}{}", &base_url[..path_start], base_path, target));
    }

    Err(HlsError::invalid_base_url(base_url))
}
