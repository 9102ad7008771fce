//! Local in-memory HLS fixture server for integration tests.
//!
//! Serves playlists and segments from a mutable in-memory map so tests can
//! simulate live refreshes, configurable per-segment latency, and observe
//! request concurrency. No external network.
//!
//! The axum server runs on a dedicated thread with its own single-threaded
//! tokio runtime; the library under test stays purely blocking.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};

pub const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
pub const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";

#[derive(Default)]
pub struct FixtureState {
    responses: Mutex<HashMap<String, (String, Vec<u8>)>>,
    segment_delay: Mutex<Duration>,
    hits: Mutex<HashMap<String, usize>>,
    inflight_segments: AtomicUsize,
    max_inflight_segments: AtomicUsize,
}

async fn serve(
    State(state): State<Arc<FixtureState>>,
    method: Method,
    uri: Uri,
) -> Response {
    let path = uri.path().to_string();
    *state.hits.lock().unwrap().entry(path.clone()).or_insert(0) += 1;

    let entry = state.responses.lock().unwrap().get(&path).cloned();
    let Some((content_type, body)) = entry else {
        return StatusCode::NOT_FOUND.into_response();
    };

    // Concurrency accounting and latency apply to segment GETs only;
    // HEAD pings must not inflate the download statistics.
    let is_segment_get = method == Method::GET && content_type == SEGMENT_CONTENT_TYPE;
    if is_segment_get {
        let now = state.inflight_segments.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_inflight_segments.fetch_max(now, Ordering::SeqCst);
        let delay = *state.segment_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        state.inflight_segments.fetch_sub(1, Ordering::SeqCst);
    }

    ([(header::CONTENT_TYPE, content_type)], body).into_response()
}

pub struct HlsFixture {
    pub state: Arc<FixtureState>,
    addr: SocketAddr,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl HlsFixture {
    pub fn start() -> Self {
        let state = Arc::new(FixtureState::default());
        let server_state = Arc::clone(&state);
        let (addr_tx, addr_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let thread = std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("fixture runtime");
            runtime.block_on(async move {
                let app = Router::new().fallback(serve).with_state(server_state);
                let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                    .await
                    .expect("fixture bind");
                addr_tx
                    .send(listener.local_addr().expect("fixture addr"))
                    .expect("fixture addr channel");
                axum::serve(listener, app)
                    .with_graceful_shutdown(async {
                        let _ = shutdown_rx.await;
                    })
                    .await
                    .expect("fixture serve");
            });
        });

        let addr = addr_rx.recv().expect("fixture did not start");
        Self {
            state,
            addr,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn set_response(&self, path: &str, content_type: &str, body: impl Into<Vec<u8>>) {
        self.state
            .responses
            .lock()
            .unwrap()
            .insert(path.to_string(), (content_type.to_string(), body.into()));
    }

    pub fn set_playlist(&self, path: &str, text: &str) {
        self.set_response(path, PLAYLIST_CONTENT_TYPE, text.as_bytes().to_vec());
    }

    pub fn set_segment(&self, path: &str, body: impl Into<Vec<u8>>) {
        self.set_response(path, SEGMENT_CONTENT_TYPE, body);
    }

    pub fn set_segment_delay(&self, delay: Duration) {
        *self.state.segment_delay.lock().unwrap() = delay;
    }

    pub fn hits(&self, path: &str) -> usize {
        self.state
            .hits
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of segment GETs observed in flight at once.
    pub fn max_concurrent_segment_requests(&self) -> usize {
        self.state.max_inflight_segments.load(Ordering::SeqCst)
    }
}

impl Drop for HlsFixture {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Install a test tracing subscriber once per process.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
