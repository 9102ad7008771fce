//! Segment cache: the timeshift window.
//!
//! [`PlaylistCache`] owns the parsed [`Playlist`] and an ordered map of
//! resident segments keyed by media index. It hands out fill targets to the
//! refresh loop, publishes completed segments to the reader, tracks the
//! consumer's read position, maps virtual byte offsets to segments for
//! seeking, and enforces the capacity window with head eviction.
//!
//! All cache state is guarded by one mutex owned by the buffer. Segment
//! bodies carry their own append lock (see [`MutableSegment`]), so download
//! workers only take the cache mutex to allocate fill targets and publish
//! status changes. Lock order is cache → segment, never the reverse.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::http::HttpClient;
use crate::model::{MutableSegment, SegmentAvailability, SegmentStatus};
use crate::playlist::Playlist;

#[derive(Debug)]
struct Slot {
    segment: Arc<MutableSegment>,
    status: SegmentStatus,
}

/// Ordered window of segments plus the read-side bookkeeping.
#[derive(Debug)]
pub struct PlaylistCache {
    playlist: Playlist,
    slots: BTreeMap<u64, Slot>,
    capacity: usize,
    seek_for_vod: bool,
    /// Index of the next segment to hand to the reader. The segment at
    /// `read_index - 1` is the one currently being drained.
    read_index: u64,
    refresh_interval: Option<Duration>,
    last_refresh: Instant,
    consecutive_reload_failures: u32,
}

impl PlaylistCache {
    /// Wrap an already-parsed playlist.
    ///
    /// `capacity` is the window size in segments (delegate-supplied);
    /// `refresh_interval` overrides the default reload cadence of half the
    /// target duration.
    pub fn new(
        playlist: Playlist,
        capacity: usize,
        seek_for_vod: bool,
        refresh_interval: Option<Duration>,
    ) -> Self {
        let read_index = playlist.first_index().unwrap_or(0);
        let mut cache = Self {
            playlist,
            slots: BTreeMap::new(),
            capacity: capacity.max(1),
            seek_for_vod,
            read_index,
            refresh_interval,
            last_refresh: Instant::now(),
            consecutive_reload_failures: 0,
        };
        cache.fold_new_segments();
        cache
    }

    /// The window never evicts when the stream is a seekable VOD.
    fn unbounded(&self) -> bool {
        self.playlist.is_vod() && self.seek_for_vod
    }

    /// Segments occupying window capacity (holding or receiving bytes),
    /// excluding the fill candidate itself.
    fn occupied_count_excluding(&self, candidate: Option<u64>) -> usize {
        self.slots
            .iter()
            .filter(|(&idx, slot)| {
                Some(idx) != candidate
                    && matches!(
                        slot.status,
                        SegmentStatus::Loading | SegmentStatus::Ready | SegmentStatus::Failed
                    )
            })
            .count()
    }

    /// Pull newly discovered playlist entries into the window as
    /// `Initialized` slots and queue failed segments for a fresh fill cycle.
    pub(crate) fn fold_new_segments(&mut self) {
        let retry: Vec<u64> = self
            .slots
            .iter()
            .filter(|(&idx, slot)| idx >= self.read_index && slot.status == SegmentStatus::Failed)
            .map(|(&idx, _)| idx)
            .collect();
        for idx in retry {
            let info = self.slots[&idx].segment.info.clone();
            debug!(index = idx, "re-queueing failed segment");
            self.slots.insert(
                idx,
                Slot {
                    segment: Arc::new(MutableSegment::new(info)),
                    status: SegmentStatus::Initialized,
                },
            );
        }

        while let Some(info) = self.playlist.next_to_load() {
            if self.slots.contains_key(&info.index) {
                continue;
            }
            // Entries strictly behind the consumer are stale.
            if info.index + 1 < self.read_index {
                continue;
            }
            self.slots.insert(
                info.index,
                Slot {
                    segment: Arc::new(MutableSegment::new(info)),
                    status: SegmentStatus::Initialized,
                },
            );
        }
    }

    /// Lowest-indexed `Initialized` segment, transitioned to `Loading`.
    pub fn next_segment_to_fill(&mut self) -> Option<Arc<MutableSegment>> {
        let (_, slot) = self
            .slots
            .iter_mut()
            .find(|(_, slot)| slot.status == SegmentStatus::Initialized)?;
        slot.status = SegmentStatus::Loading;
        Some(Arc::clone(&slot.segment))
    }

    /// Whether a segment at `for_index` may be downloaded without violating
    /// capacity. Evicts completed head segments behind the consumer when
    /// needed; never evicts a `Loading` segment. While the head is pinned by
    /// the consumer this returns false and back-pressure propagates.
    pub fn has_space_for_new_segment(&mut self, for_index: Option<u64>) -> bool {
        if self.unbounded() {
            return true;
        }
        let mut occupied = self.occupied_count_excluding(for_index);
        if occupied < self.capacity {
            return true;
        }

        let evictable: Vec<u64> = self
            .slots
            .iter()
            .filter(|(&idx, slot)| {
                idx + 1 < self.read_index
                    && matches!(slot.status, SegmentStatus::Ready | SegmentStatus::Failed)
            })
            .map(|(&idx, _)| idx)
            .collect();
        for idx in evictable {
            if occupied < self.capacity {
                break;
            }
            self.slots.remove(&idx);
            self.playlist.drop_before(idx + 1);
            debug!(index = idx, "evicted segment behind the consumer");
            occupied -= 1;
        }

        occupied < self.capacity
    }

    /// Publish a fully downloaded segment to the reader.
    pub fn segment_ready(&mut self, segment: &Arc<MutableSegment>) {
        let idx = segment.info.index;
        if let Some(slot) = self.slots.get_mut(&idx) {
            // A stale completion for a replaced slot must not flip the new
            // occupant's state.
            if Arc::ptr_eq(&slot.segment, segment) && slot.status == SegmentStatus::Loading {
                slot.status = SegmentStatus::Ready;
            }
        }
    }

    /// Drop a segment whose download was invalidated. The playlist cursor is
    /// rewound so the index can be rediscovered by a later fold.
    pub fn segment_canceled(&mut self, segment: &Arc<MutableSegment>) {
        let idx = segment.info.index;
        let matches_slot = self
            .slots
            .get(&idx)
            .is_some_and(|slot| Arc::ptr_eq(&slot.segment, segment));
        if matches_slot {
            self.slots.remove(&idx);
            self.playlist.rewind_to(idx);
        }
    }

    /// Record a failed download; the entry stays resident until a fold
    /// re-queues it or eviction claims it.
    pub fn segment_failed(&mut self, segment: &Arc<MutableSegment>) {
        let idx = segment.info.index;
        if let Some(slot) = self.slots.get_mut(&idx) {
            if Arc::ptr_eq(&slot.segment, segment) && slot.status == SegmentStatus::Loading {
                warn!(index = idx, "segment download failed");
                slot.status = SegmentStatus::Failed;
            }
        }
    }

    /// Hand the reader the segment at the read position, or explain why
    /// none is available.
    pub fn next_segment_for_read(
        &mut self,
    ) -> (Option<Arc<MutableSegment>>, SegmentAvailability) {
        match self.slots.get(&self.read_index) {
            Some(slot) if slot.status == SegmentStatus::Ready => {
                let segment = Arc::clone(&slot.segment);
                self.read_index += 1;
                (Some(segment), SegmentAvailability::Ready)
            }
            Some(_) => (None, SegmentAvailability::Loading),
            None => {
                let past_end = self
                    .playlist
                    .last_index()
                    .is_none_or(|last| self.read_index > last);
                if self.playlist.is_vod() && past_end {
                    (None, SegmentAvailability::EndOfStream)
                } else {
                    (None, SegmentAvailability::CacheEmpty)
                }
            }
        }
    }

    /// Map a virtual byte offset onto the window and move the read cursors.
    ///
    /// Only valid when [`PlaylistCache::can_seek`] holds. Returns the media
    /// index the next read will serve, used to invalidate in-flight loads at
    /// other indices.
    pub fn prepare_for_position(&mut self, byte_pos: u64) -> Option<u64> {
        if !self.can_seek() {
            return None;
        }
        let pos = byte_pos.min(self.length_bytes());

        let ready: Vec<(u64, u64)> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.status == SegmentStatus::Ready)
            .map(|(&idx, slot)| (idx, slot.segment.size() as u64))
            .collect();

        let mut accumulated = 0u64;
        let mut target: Option<(u64, u64)> = None;
        let mut last_ready = None;
        for (idx, size) in &ready {
            if target.is_none() && pos < accumulated + size {
                target = Some((*idx, pos - accumulated));
            }
            accumulated += size;
            last_ready = Some(*idx);
        }
        let (target_idx, offset) = target.unwrap_or_else(|| {
            // pos sits exactly at the end of the known bytes.
            (
                last_ready.map(|idx| idx + 1).unwrap_or(self.read_index),
                0,
            )
        });

        for (&idx, slot) in self.slots.iter() {
            if slot.status != SegmentStatus::Ready {
                continue;
            }
            if idx == target_idx {
                slot.segment.seek_to(offset as usize);
            } else if idx > target_idx {
                slot.segment.rewind();
            }
        }

        // Entries that never produced bytes and do not belong to the new
        // window are discarded; ready segments stay replayable.
        self.slots.retain(|&idx, slot| {
            !(idx < target_idx
                && matches!(
                    slot.status,
                    SegmentStatus::Initialized | SegmentStatus::Failed
                ))
        });

        if !self.slots.contains_key(&target_idx) {
            self.playlist.rewind_to(target_idx);
        }
        self.read_index = target_idx;
        debug!(index = target_idx, offset, "cache prepared for seek");
        Some(target_idx)
    }

    /// Refresh the playlist on its cadence and fold the result.
    ///
    /// Rate-limited to half the target duration (or the configured
    /// override); calls in between are cheap no-ops. Returns false once two
    /// consecutive reloads have failed, which the refresh loop treats as
    /// fatal.
    pub fn reload_playlist(&mut self, client: &HttpClient) -> bool {
        let interval = self.refresh_interval.unwrap_or_else(|| {
            Duration::from_millis(u64::from(self.playlist.target_duration()) * 1000 / 2)
        });
        if self.last_refresh.elapsed() < interval {
            return true;
        }
        match self.playlist.reload(client) {
            Ok(_) => {
                self.consecutive_reload_failures = 0;
                self.last_refresh = Instant::now();
                self.fold_new_segments();
                true
            }
            Err(e) => {
                self.consecutive_reload_failures += 1;
                warn!(
                    failures = self.consecutive_reload_failures,
                    "playlist reload failed: {e}"
                );
                self.last_refresh = Instant::now();
                self.consecutive_reload_failures < 2
            }
        }
    }

    /// Seekable when the stream is VOD, or live timeshift is enabled and at
    /// least one segment is ready.
    pub fn can_seek(&self) -> bool {
        self.playlist.is_vod()
            || (self.seek_for_vod
                && self
                    .slots
                    .values()
                    .any(|slot| slot.status == SegmentStatus::Ready))
    }

    /// Total bytes of the window's ready segments.
    pub fn length_bytes(&self) -> u64 {
        self.slots
            .values()
            .filter(|slot| slot.status == SegmentStatus::Ready)
            .map(|slot| slot.segment.size() as u64)
            .sum()
    }

    pub fn is_vod(&self) -> bool {
        self.playlist.is_vod()
    }

    pub fn target_duration(&self) -> u32 {
        self.playlist.target_duration()
    }

    /// Next fresh media index, used to keep indices monotone across a
    /// stream switch.
    pub fn next_fresh_index(&self) -> u64 {
        self.playlist.last_index().map(|idx| idx + 1).unwrap_or(0)
    }

    /// Indices currently resident in the window, in order.
    pub fn resident_indices(&self) -> Vec<u64> {
        self.slots.keys().copied().collect()
    }

    #[cfg(test)]
    pub(crate) fn playlist_mut(&mut self) -> &mut Playlist {
        &mut self.playlist
    }

    #[cfg(test)]
    fn status_of(&self, idx: u64) -> Option<SegmentStatus> {
        self.slots.get(&idx).map(|slot| slot.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SegmentAvailability as Avail;

    const VOD: &str = "#EXTM3U\n\
#EXT-X-TARGETDURATION:10\n\
#EXTINF:10.0,\n\
seg1.ts\n\
#EXTINF:10.0,\n\
seg2.ts\n\
#EXTINF:10.0,\n\
seg3.ts\n\
#EXT-X-ENDLIST\n";

    const LIVE_V1: &str = "#EXTM3U\n\
#EXT-X-TARGETDURATION:6\n\
#EXT-X-MEDIA-SEQUENCE:100\n\
#EXTINF:6.0,\n\
100.ts\n\
#EXTINF:6.0,\n\
101.ts\n";

    const LIVE_V2: &str = "#EXTM3U\n\
#EXT-X-TARGETDURATION:6\n\
#EXT-X-MEDIA-SEQUENCE:101\n\
#EXTINF:6.0,\n\
101.ts\n\
#EXTINF:6.0,\n\
102.ts\n\
#EXTINF:6.0,\n\
103.ts\n";

    fn vod_cache(capacity: usize, seek_for_vod: bool) -> PlaylistCache {
        let playlist = Playlist::from_content(VOD, "http://host/a/p.m3u8", "", 0).unwrap();
        PlaylistCache::new(playlist, capacity, seek_for_vod, None)
    }

    fn live_cache(capacity: usize) -> PlaylistCache {
        let playlist = Playlist::from_content(LIVE_V1, "http://host/live.m3u8", "", 0).unwrap();
        PlaylistCache::new(playlist, capacity, false, None)
    }

    /// Drive one segment through Loading → Ready with the given payload.
    fn load_segment(cache: &mut PlaylistCache, payload: &[u8]) -> u64 {
        let segment = cache.next_segment_to_fill().expect("segment to fill");
        segment.push(payload);
        let idx = segment.info.index;
        cache.segment_ready(&segment);
        idx
    }

    #[test]
    fn fills_in_ascending_index_order() {
        let mut cache = vod_cache(8, true);
        let a = cache.next_segment_to_fill().unwrap();
        let b = cache.next_segment_to_fill().unwrap();
        let c = cache.next_segment_to_fill().unwrap();
        assert_eq!(
            (a.info.index, b.info.index, c.info.index),
            (0, 1, 2)
        );
        assert!(cache.next_segment_to_fill().is_none());
        assert_eq!(cache.status_of(0), Some(SegmentStatus::Loading));
    }

    #[test]
    fn ready_segments_are_served_in_order_until_eof() {
        let mut cache = vod_cache(8, true);
        for payload in [b"AAAAAAAAAA", b"BBBBBBBBBB", b"CCCCCCCCCC"] {
            load_segment(&mut cache, payload);
        }
        assert_eq!(cache.length_bytes(), 30);

        for expected in [0u64, 1, 2] {
            let (seg, avail) = cache.next_segment_for_read();
            assert_eq!(avail, Avail::Ready);
            assert_eq!(seg.unwrap().info.index, expected);
        }
        let (seg, avail) = cache.next_segment_for_read();
        assert!(seg.is_none());
        assert_eq!(avail, Avail::EndOfStream);
    }

    #[test]
    fn loading_and_empty_states_are_reported() {
        let mut cache = vod_cache(8, true);
        let seg = cache.next_segment_to_fill().unwrap();
        let (none, avail) = cache.next_segment_for_read();
        assert!(none.is_none());
        assert_eq!(avail, Avail::Loading);

        seg.push(b"X");
        cache.segment_ready(&seg);
        let (some, avail) = cache.next_segment_for_read();
        assert!(some.is_some());
        assert_eq!(avail, Avail::Ready);

        // Live stream with nothing resident at the read position reports an
        // empty cache rather than EOF.
        let mut live = live_cache(4);
        live.slots.clear();
        live.read_index = 50;
        let (_, avail) = live.next_segment_for_read();
        assert_eq!(avail, Avail::CacheEmpty);
    }

    #[test]
    fn capacity_blocks_until_consumer_advances_then_evicts_head() {
        let mut cache = live_cache(2);
        // Window 100/101 (external 0/1) loaded.
        load_segment(&mut cache, b"0000000000");
        load_segment(&mut cache, b"1111111111");

        // Refresh discovers 102/103 (external 2/3).
        cache.playlist_mut().ingest(LIVE_V2).unwrap();
        cache.fold_new_segments();
        assert_eq!(cache.resident_indices(), vec![0, 1, 2, 3]);

        // Consumer has not advanced: the head is pinned, no space.
        assert!(!cache.has_space_for_new_segment(Some(2)));

        // Consumer drains both segments; the head becomes evictable.
        let (a, _) = cache.next_segment_for_read();
        let (b, _) = cache.next_segment_for_read();
        assert!(a.is_some() && b.is_some());
        assert!(cache.has_space_for_new_segment(Some(2)));
        assert!(!cache.resident_indices().contains(&0));
        // The drained-but-current segment (index 1) is never evicted.
        assert!(cache.resident_indices().contains(&1));
    }

    #[test]
    fn loading_segments_are_never_evicted() {
        let mut cache = live_cache(1);
        let first = cache.next_segment_to_fill().unwrap();
        assert_eq!(first.info.index, 0);
        // Even with a full window the loading head must survive.
        cache.playlist_mut().ingest(LIVE_V2).unwrap();
        cache.fold_new_segments();
        let _ = cache.has_space_for_new_segment(Some(3));
        assert_eq!(cache.status_of(0), Some(SegmentStatus::Loading));
    }

    #[test]
    fn seek_maps_byte_positions_onto_segments() {
        let mut cache = vod_cache(8, true);
        for payload in [b"AAAAAAAAAA", b"BBBBBBBBBB", b"CCCCCCCCCC"] {
            load_segment(&mut cache, payload);
        }
        // Drain everything first, as a reader would.
        while cache.next_segment_for_read().0.is_some() {}

        let idx = cache.prepare_for_position(15).unwrap();
        assert_eq!(idx, 1);
        let (seg, _) = cache.next_segment_for_read();
        let seg = seg.unwrap();
        let mut out = [0u8; 16];
        let n = seg.read(&mut out);
        assert_eq!(&out[..n], b"BBBBB");

        // The following segment was rewound for replay.
        let (seg, _) = cache.next_segment_for_read();
        assert_eq!(seg.unwrap().bytes_ready(), 10);
    }

    #[test]
    fn seek_to_the_exact_end_positions_past_the_last_segment() {
        let mut cache = vod_cache(8, true);
        for payload in [b"AAAAAAAAAA", b"BBBBBBBBBB", b"CCCCCCCCCC"] {
            load_segment(&mut cache, payload);
        }
        let idx = cache.prepare_for_position(30).unwrap();
        assert_eq!(idx, 3);
        let (_, avail) = cache.next_segment_for_read();
        assert_eq!(avail, Avail::EndOfStream);
    }

    #[test]
    fn seek_clamps_beyond_the_known_length() {
        let mut cache = vod_cache(8, true);
        load_segment(&mut cache, b"AAAAAAAAAA");
        let idx = cache.prepare_for_position(10_000).unwrap();
        assert_eq!(idx, 1);
    }

    #[test]
    fn cannot_seek_a_live_stream_without_timeshift() {
        let mut cache = live_cache(4);
        load_segment(&mut cache, b"0000000000");
        assert!(!cache.can_seek());
        assert!(cache.prepare_for_position(0).is_none());
    }

    #[test]
    fn live_with_timeshift_becomes_seekable_once_a_segment_is_ready() {
        let playlist = Playlist::from_content(LIVE_V1, "http://host/live.m3u8", "", 0).unwrap();
        let mut cache = PlaylistCache::new(playlist, 4, true, None);
        assert!(!cache.can_seek());
        load_segment(&mut cache, b"0000000000");
        assert!(cache.can_seek());
    }

    #[test]
    fn folding_the_same_playlist_twice_is_idempotent() {
        let mut cache = live_cache(8);
        load_segment(&mut cache, b"0000000000");
        let before = cache.resident_indices();
        let length = cache.length_bytes();

        cache.playlist_mut().ingest(LIVE_V1).unwrap();
        cache.fold_new_segments();
        cache.playlist_mut().ingest(LIVE_V1).unwrap();
        cache.fold_new_segments();

        assert_eq!(cache.resident_indices(), before);
        assert_eq!(cache.length_bytes(), length);
        assert_eq!(cache.status_of(0), Some(SegmentStatus::Ready));
    }

    #[test]
    fn canceled_segments_are_removed_and_rediscovered() {
        let mut cache = vod_cache(8, true);
        let seg = cache.next_segment_to_fill().unwrap();
        cache.segment_canceled(&seg);
        assert!(!cache.resident_indices().contains(&0));

        cache.fold_new_segments();
        assert!(cache.resident_indices().contains(&0));
        assert_eq!(cache.status_of(0), Some(SegmentStatus::Initialized));
    }

    #[test]
    fn failed_segments_are_requeued_on_fold() {
        let mut cache = vod_cache(8, true);
        let seg = cache.next_segment_to_fill().unwrap();
        seg.push(b"partial");
        cache.segment_failed(&seg);
        assert_eq!(cache.status_of(0), Some(SegmentStatus::Failed));

        cache.fold_new_segments();
        assert_eq!(cache.status_of(0), Some(SegmentStatus::Initialized));
        // The retry starts from an empty body.
        let retry = cache.next_segment_to_fill().unwrap();
        assert_eq!(retry.info.index, 0);
        assert_eq!(retry.size(), 0);
    }

    #[test]
    fn stale_completions_do_not_disturb_replacement_slots() {
        let mut cache = vod_cache(8, true);
        let original = cache.next_segment_to_fill().unwrap();
        cache.segment_canceled(&original);
        cache.fold_new_segments();
        let replacement = cache.next_segment_to_fill().unwrap();
        assert_eq!(replacement.info.index, 0);

        // A late completion for the canceled download arrives afterwards.
        original.push(b"stale");
        cache.segment_ready(&original);
        assert_eq!(cache.status_of(0), Some(SegmentStatus::Loading));
    }
}
