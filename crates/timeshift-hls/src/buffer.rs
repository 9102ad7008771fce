//! The public byte-stream façade.
//!
//! [`PlaylistBuffer`] turns a playlist URL into a seekable, timeshifted byte
//! stream. A background refresh thread repeatedly asks the cache for the
//! next segment slot to fill, dispatches downloads onto a bounded worker
//! pool, and reloads the playlist on its cadence. The consumer drains bytes
//! through blocking [`PlaylistBuffer::read`] calls and may
//! [`PlaylistBuffer::seek`] within the window when the stream allows it.
//!
//! Shutdown is idempotent: the refresh thread is joined with a bounded
//! timeout and detached if it overruns (a detached thread only holds the
//! shared cache cell alive until it exits). A seek is a localized cancel:
//! in-flight loads for other indices observe it within one chunk read.

use std::io::SeekFrom;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use timeshift_exec::{Speedometer, ThreadPool};

use crate::cache::PlaylistCache;
use crate::delegate::PlaylistBufferDelegate;
use crate::downloader::{FillOutcome, fill_segment};
use crate::error::HlsResult;
use crate::http::HttpClient;
use crate::model::{MutableSegment, SegmentAvailability};
use crate::playlist::Playlist;
use crate::settings::{HlsSettings, clamp_hls_threads};

const SPEED_WINDOW_BYTES: u64 = 10 * 1024 * 1024;

/// State shared between the consumer, the refresh thread and the download
/// workers. Each (re-)initialization gets a fresh cell, so a detached
/// refresh thread can never observe a successor's cache.
struct BufferShared {
    cache: Mutex<PlaylistCache>,
    data_ready: Condvar,
    stopped: AtomicBool,
    waiting_for_read: AtomicBool,
    /// Media index the last seek targeted; in-flight loads for any other
    /// index treat a change of this value as cancellation.
    segment_index_after_seek: AtomicU64,
    client: HttpClient,
    /// Informational download-rate meter over a sliding byte window.
    speed: Mutex<Speedometer>,
}

impl BufferShared {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Poll the stop flag for up to `timeout`. Returns the flag's value.
    fn stopped_within(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_stopped() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return self.is_stopped();
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(100)));
        }
    }
}

/// Cheap handle for aborting a blocked read from another thread.
#[derive(Clone)]
pub struct AbortHandle {
    shared: Arc<BufferShared>,
}

impl AbortHandle {
    /// Stop the buffer and keep signalling the data condition until any
    /// outstanding reader has returned.
    pub fn abort_read(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        while self.shared.waiting_for_read.load(Ordering::Acquire) {
            debug!("waiting 100 ms for the reader to abort");
            std::thread::sleep(Duration::from_millis(100));
            let _cache = self.shared.cache.lock();
            self.shared.data_ready.notify_all();
        }
    }
}

/// Seekable, timeshifted byte stream over a segmented playlist.
pub struct PlaylistBuffer {
    shared: Arc<BufferShared>,
    thread: Option<JoinHandle<()>>,
    delegate: Arc<dyn PlaylistBufferDelegate>,
    settings: HlsSettings,
    url: String,
    seek_for_vod: bool,
    position: i64,
    current: Option<Arc<MutableSegment>>,
}

impl PlaylistBuffer {
    /// Open a playlist and start the refresh loop.
    ///
    /// Returns once the playlist has been parsed and, for a master
    /// playlist, the highest-bandwidth variant selected.
    pub fn open(
        url: impl Into<String>,
        delegate: Arc<dyn PlaylistBufferDelegate>,
        settings: HlsSettings,
        seek_for_vod: bool,
    ) -> HlsResult<Self> {
        let url = url.into();
        let shared = build_shared(&url, 0, &delegate, &settings, seek_for_vod)?;
        let thread = spawn_refresh_loop(Arc::clone(&shared), &settings);
        Ok(Self {
            shared,
            thread: Some(thread),
            delegate,
            settings,
            url,
            seek_for_vod,
            position: 0,
            current: None,
        })
    }

    /// The playlist URL this buffer was opened with.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Handle usable from other threads to abort a blocked read.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Blocking read of up to `buf.len()` bytes.
    ///
    /// Waits up to `timeout` in total for segment data to become ready.
    /// Returns the number of bytes copied (possibly fewer than requested on
    /// timeout or at end of stream), or `-1` on EOF with nothing copied or
    /// when the buffer has been stopped.
    pub fn read(&mut self, buf: &mut [u8], timeout: Duration) -> isize {
        if self.shared.is_stopped() {
            error!("refresh thread is not running");
            return -1;
        }
        self.shared.waiting_for_read.store(true, Ordering::Release);
        let result = self.read_inner(buf, timeout);
        self.shared.waiting_for_read.store(false, Ordering::Release);
        result
    }

    fn read_inner(&mut self, buf: &mut [u8], timeout: Duration) -> isize {
        let mut total = 0usize;
        let mut is_eof = false;
        let mut remaining = timeout;

        'outer: while total < buf.len() && !self.shared.is_stopped() {
            while self.current.is_none() {
                let (segment, availability) = self.shared.cache.lock().next_segment_for_read();
                if let Some(segment) = segment {
                    self.current = Some(segment);
                    break;
                }
                match availability {
                    SegmentAvailability::EndOfStream => {
                        info!("EOF reported");
                        is_eof = true;
                        break 'outer;
                    }
                    SegmentAvailability::Loading | SegmentAvailability::CacheEmpty => {
                        if self.shared.is_stopped() {
                            debug!("stopping mid-read");
                            break 'outer;
                        }
                        if remaining.is_zero() {
                            // Surfaces as a short read; see HlsError::SegmentLoadTimeout.
                            error!("segment load timed out");
                            break 'outer;
                        }
                        let started = Instant::now();
                        {
                            let mut cache = self.shared.cache.lock();
                            self.shared.data_ready.wait_for(&mut cache, remaining);
                        }
                        remaining = remaining.saturating_sub(started.elapsed());
                    }
                    SegmentAvailability::Ready => unreachable!("ready without a segment"),
                }
            }

            let Some(current) = self.current.as_ref() else {
                break;
            };
            let n = current.read(&mut buf[total..]);
            total += n;
            self.position += n as i64;
            if current.bytes_ready() == 0 {
                debug!("segment drained, moving to the next one");
                self.current = None;
            }
        }

        if self.shared.is_stopped() {
            return -1;
        }
        if is_eof && total == 0 {
            return -1;
        }
        total as isize
    }

    /// Seek within the window.
    ///
    /// Returns the new absolute virtual position, or `-1` when the stream is
    /// not seekable. In-flight loads for other indices become canceled.
    pub fn seek(&mut self, pos: SeekFrom) -> i64 {
        if !self.shared.cache.lock().can_seek() {
            return -1;
        }
        let length = self.length();
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(delta) => self.position + delta,
            SeekFrom::End(delta) => length + delta,
        };
        let target = target.clamp(0, length);
        debug!(target, length, "seek requested");

        if target == self.position {
            return self.position;
        }

        {
            let mut cache = self.shared.cache.lock();
            match cache.prepare_for_position(target as u64) {
                Some(index) => {
                    self.shared
                        .segment_index_after_seek
                        .store(index, Ordering::Release);
                }
                None => {
                    debug!(target, "cache failed to prepare for seek");
                    return -1;
                }
            }
        }
        self.current = None;
        self.position = target;
        self.position
    }

    /// Total bytes in the window (VOD: total known; live: current extent).
    pub fn length(&self) -> i64 {
        self.shared.cache.lock().length_bytes() as i64
    }

    /// Current virtual offset, or `-1` when the stream is not seekable.
    pub fn position(&self) -> i64 {
        if !self.shared.cache.lock().can_seek() {
            debug!("position queried on a non-seekable stream");
            return -1;
        }
        self.position
    }

    pub fn can_seek(&self) -> bool {
        self.shared.cache.lock().can_seek()
    }

    /// Media indices currently resident in the cache window, in order.
    pub fn resident_indices(&self) -> Vec<u64> {
        self.shared.cache.lock().resident_indices()
    }

    /// Tear down the current pipeline and re-open with a new URL.
    ///
    /// Media indices continue from where the old stream left off; the
    /// virtual position resets to zero.
    pub fn switch_stream(&mut self, new_url: impl Into<String>) -> bool {
        let new_url = new_url.into();
        let index_offset = self.shared.cache.lock().next_fresh_index();
        self.stop_refresh(Duration::from_secs(20));

        match build_shared(
            &new_url,
            index_offset,
            &self.delegate,
            &self.settings,
            self.seek_for_vod,
        ) {
            Ok(shared) => {
                let thread = spawn_refresh_loop(Arc::clone(&shared), &self.settings);
                self.shared = shared;
                self.thread = Some(thread);
                self.url = new_url;
                self.position = 0;
                self.current = None;
                true
            }
            Err(e) => {
                error!(url = %new_url, "failed to switch streams: {e}");
                false
            }
        }
    }

    /// Stop the refresh loop and wait for any outstanding reader to return.
    pub fn abort_read(&mut self) {
        self.stop_refresh(self.settings.stop_timeout);
        self.abort_handle().abort_read();
    }

    /// Stop the refresh thread, waiting up to `wait` before detaching it.
    /// Returns true when the thread was joined.
    fn stop_refresh(&mut self, wait: Duration) -> bool {
        debug!("terminating refresh thread");
        self.shared.stopped.store(true, Ordering::Release);
        {
            let _cache = self.shared.cache.lock();
            self.shared.data_ready.notify_all();
        }

        let Some(handle) = self.thread.take() else {
            return true;
        };
        let deadline = Instant::now() + wait;
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if handle.is_finished() {
            let _ = handle.join();
            true
        } else {
            // The shared cell keeps the cache alive until the thread exits.
            error!("refresh thread did not stop in time, detaching");
            false
        }
    }
}

impl Drop for PlaylistBuffer {
    fn drop(&mut self) {
        self.stop_refresh(self.settings.stop_timeout);
    }
}

fn build_shared(
    url: &str,
    index_offset: u64,
    delegate: &Arc<dyn PlaylistBufferDelegate>,
    settings: &HlsSettings,
    seek_for_vod: bool,
) -> HlsResult<Arc<BufferShared>> {
    let client = HttpClient::new(settings.http_timeout)?;
    let playlist = Playlist::open(url, index_offset, &client)?;
    let capacity = match delegate.segments_to_cache() {
        0 => settings.default_segments_to_cache,
        n => n,
    };
    let cache = PlaylistCache::new(playlist, capacity, seek_for_vod, settings.refresh_interval);
    Ok(Arc::new(BufferShared {
        cache: Mutex::new(cache),
        data_ready: Condvar::new(),
        stopped: AtomicBool::new(false),
        waiting_for_read: AtomicBool::new(false),
        segment_index_after_seek: AtomicU64::new(0),
        client,
        speed: Mutex::new(Speedometer::new(SPEED_WINDOW_BYTES)),
    }))
}

fn spawn_refresh_loop(shared: Arc<BufferShared>, settings: &HlsSettings) -> JoinHandle<()> {
    let threads = clamp_hls_threads(settings.hls_threads);
    std::thread::Builder::new()
        .name("timeshift-refresh".to_string())
        .spawn(move || run_refresh_loop(shared, threads))
        .expect("failed to spawn refresh thread")
}

/// The refresh loop: select a fill target, wait for window space, dispatch
/// the download, reload the playlist on its cadence.
fn run_refresh_loop(shared: Arc<BufferShared>, threads: usize) {
    let pool = ThreadPool::new(threads);
    pool.set_queue_limit(threads);

    while !shared.is_stopped() {
        let (segment, mut cache_full) = {
            let mut cache = shared.cache.lock();
            let segment = cache.next_segment_to_fill();
            let index = segment.as_ref().map(|s| s.info.index);
            if let Some(index) = index {
                debug!(index, "segment selected for fill");
            }
            let full = !cache.has_space_for_new_segment(index);
            (segment, full)
        };

        let seek_epoch = shared
            .segment_index_after_seek
            .load(Ordering::Acquire);

        // Wait for cache space while the consumer is behind, pinging the
        // segment URL to keep the origin connection warm.
        while cache_full && !shared.is_stopped() {
            cache_full = {
                let mut cache = shared.cache.lock();
                !cache.has_space_for_new_segment(segment.as_ref().map(|s| s.info.index))
            };
            if cache_full {
                if let Some(segment) = segment.as_ref() {
                    if is_load_canceled(&shared, seek_epoch, segment) {
                        break;
                    }
                }
                if shared.stopped_within(Duration::from_secs(1)) {
                    break;
                }
                debug!("waiting for space in cache");
                if let Some(segment) = segment.as_ref() {
                    shared.client.ping(&segment.info.url);
                }
            }
        }

        if let Some(segment) = segment {
            if !shared.is_stopped() {
                if is_load_canceled(&shared, seek_epoch, &segment) {
                    // Invalidated while waiting for space; publish the
                    // cancellation directly instead of spending a pool slot
                    // on it.
                    debug!(
                        index = segment.info.index,
                        "segment canceled before dispatch"
                    );
                    shared.cache.lock().segment_canceled(&segment);
                } else {
                    let task_shared = Arc::clone(&shared);
                    shared.speed.lock().start_measurement();
                    let started = Instant::now();
                    // Blocks when the pool backlog is at its limit, extending
                    // the window back-pressure to the dispatch step.
                    pool.submit(move || {
                        let predicate = |seg: &MutableSegment| {
                            is_load_canceled(&task_shared, seek_epoch, seg)
                        };
                        let outcome = fill_segment(&task_shared.client, &segment, &predicate);
                        if task_shared.is_stopped() {
                            return;
                        }
                        let mut cache = task_shared.cache.lock();
                        match outcome {
                            FillOutcome::Ready => {
                                cache.segment_ready(&segment);
                                task_shared.data_ready.notify_all();
                                let kbps = {
                                    let mut speed = task_shared.speed.lock();
                                    speed.finish_measurement(segment.size() as u64);
                                    speed.kbps()
                                };
                                debug!(
                                    index = segment.info.index,
                                    seconds = started.elapsed().as_secs_f32(),
                                    duration = segment.duration(),
                                    kbps,
                                    "segment loaded"
                                );
                            }
                            FillOutcome::Canceled => cache.segment_canceled(&segment),
                            FillOutcome::Failed => cache.segment_failed(&segment),
                        }
                    });
                }
            }
        } else {
            shared.stopped_within(Duration::from_secs(1));
        }

        // Update the playlist regularly.
        if !shared.is_stopped() {
            let ok = {
                let mut cache = shared.cache.lock();
                cache.reload_playlist(&shared.client)
            };
            if !ok {
                error!("playlist update failed, terminating refresh loop");
                break;
            }
        }
    }

    debug!("finalizing loader pool");
    pool.wait_idle();
    debug!("refresh loop finished");
}

/// A load is canceled when the buffer stops, or a seek retargeted the
/// stream and this segment is not the seek target.
fn is_load_canceled(shared: &BufferShared, seek_epoch: u64, segment: &MutableSegment) -> bool {
    let current = shared.segment_index_after_seek.load(Ordering::Acquire);
    shared.is_stopped() || (current != seek_epoch && segment.info.index != current)
}
