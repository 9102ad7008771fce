//! Core data types used by the `timeshift-hls` crate.
//!
//! This module is intentionally focused on *pure* types, with no networking
//! or I/O concerns. Higher-level modules (`playlist`, `cache`, `downloader`,
//! `buffer`) build on top of these.

use parking_lot::Mutex;

/// Seconds from the playlist epoch.
pub type TimeOffset = f32;

/// One playlist entry, immutable after parsing.
///
/// Within one playlist refresh, indices are strictly increasing and
/// contiguous, and `duration >= 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentInfo {
    /// Absolute segment URL, with any user-supplied `|header` suffix
    /// reattached.
    pub url: String,
    /// Media-sequence index, monotone across refreshes.
    pub index: u64,
    /// Segment duration in seconds.
    pub duration: f32,
    /// Offset of this segment from the playlist epoch, in seconds.
    pub start_time: TimeOffset,
}

/// Lifecycle state of a cached segment.
///
/// `Ready` bytes are immutable; `Canceled` and `Failed` entries never
/// transition back and are eligible for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStatus {
    /// Created from a playlist entry, not yet scheduled for download.
    Initialized,
    /// A downloader worker is streaming bytes into the segment.
    Loading,
    /// Fully downloaded; bytes are published to the reader.
    Ready,
    /// Invalidated by a seek or shutdown before completion.
    Canceled,
    /// The download failed; a later refresh cycle may retry.
    Failed,
}

/// Why the cache could not hand out a segment for reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentAvailability {
    /// A ready segment was returned.
    Ready,
    /// The segment at the read position exists but is still downloading.
    Loading,
    /// No segment exists at the read position yet.
    CacheEmpty,
    /// VOD playlist and the read position is past the last known segment.
    EndOfStream,
}

/// A segment body being filled by a downloader and drained by the consumer.
///
/// The byte buffer sits behind its own lock so downloads can stream without
/// holding the cache mutex. Lock order is always cache → segment, never the
/// reverse.
#[derive(Debug)]
pub struct MutableSegment {
    /// The playlist entry this segment was created from.
    pub info: SegmentInfo,
    body: Mutex<SegmentBody>,
}

#[derive(Debug, Default)]
struct SegmentBody {
    data: Vec<u8>,
    read_pos: usize,
}

impl MutableSegment {
    pub fn new(info: SegmentInfo) -> Self {
        Self {
            info,
            body: Mutex::new(SegmentBody::default()),
        }
    }

    /// Append downloaded bytes to the tail.
    pub fn push(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        self.body.lock().data.extend_from_slice(chunk);
    }

    /// Copy bytes from the read cursor into `out`, advancing the cursor.
    pub fn read(&self, out: &mut [u8]) -> usize {
        let mut body = self.body.lock();
        let available = body.data.len() - body.read_pos;
        let n = available.min(out.len());
        if n > 0 {
            let start = body.read_pos;
            out[..n].copy_from_slice(&body.data[start..start + n]);
            body.read_pos += n;
        }
        n
    }

    /// Bytes available past the read cursor.
    pub fn bytes_ready(&self) -> usize {
        let body = self.body.lock();
        body.data.len() - body.read_pos
    }

    /// Total byte size of the segment.
    pub fn size(&self) -> usize {
        self.body.lock().data.len()
    }

    /// Place the read cursor at `pos` (clamped to the segment size).
    pub fn seek_to(&self, pos: usize) {
        let mut body = self.body.lock();
        body.read_pos = pos.min(body.data.len());
    }

    /// Reset the read cursor to the start.
    pub fn rewind(&self) {
        self.body.lock().read_pos = 0;
    }

    pub fn duration(&self) -> f32 {
        self.info.duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(index: u64) -> SegmentInfo {
        SegmentInfo {
            url: format!("http://example.com/{index}.ts"),
            index,
            duration: 6.0,
            start_time: 0.0,
        }
    }

    #[test]
    fn push_then_read_round_trips() {
        let seg = MutableSegment::new(info(0));
        seg.push(b"hello ");
        seg.push(b"world");
        assert_eq!(seg.size(), 11);
        assert_eq!(seg.bytes_ready(), 11);

        let mut out = [0u8; 6];
        assert_eq!(seg.read(&mut out), 6);
        assert_eq!(&out, b"hello ");
        assert_eq!(seg.bytes_ready(), 5);

        let mut rest = [0u8; 16];
        assert_eq!(seg.read(&mut rest), 5);
        assert_eq!(&rest[..5], b"world");
        assert_eq!(seg.bytes_ready(), 0);
    }

    #[test]
    fn seek_and_rewind_move_the_cursor() {
        let seg = MutableSegment::new(info(1));
        seg.push(b"0123456789");
        seg.seek_to(7);
        let mut out = [0u8; 8];
        assert_eq!(seg.read(&mut out), 3);
        assert_eq!(&out[..3], b"789");

        seg.rewind();
        assert_eq!(seg.bytes_ready(), 10);

        // Clamped past the end.
        seg.seek_to(100);
        assert_eq!(seg.bytes_ready(), 0);
    }
}
