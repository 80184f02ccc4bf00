//! A scriptable stand-in for the GrowthBook API, served on a background runtime.
#![allow(dead_code)]

use std::{
    convert::Infallible,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Router,
};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

pub const CLIENT_KEY: &str = "sdk-test";

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct ServerState {
    features: Mutex<Value>,
    saved_groups: Mutex<Option<Value>>,
    raw_body: Mutex<Option<String>>,
    status: Mutex<StatusCode>,
    stream_status: Mutex<StatusCode>,
    delay: Mutex<Duration>,
    sse_enabled: AtomicBool,
    etag_enabled: AtomicBool,
    // Bumped on every change, doubles as the `ETag`.
    version: AtomicUsize,
    not_modified_responses: AtomicUsize,
    feature_requests: AtomicUsize,
    stream_requests: AtomicUsize,
    events: broadcast::Sender<(String, String)>,
}

impl Default for ServerState {
    fn default() -> Self {
        ServerState {
            features: Mutex::new(json!({})),
            saved_groups: Mutex::new(None),
            raw_body: Mutex::new(None),
            status: Mutex::new(StatusCode::OK),
            stream_status: Mutex::new(StatusCode::OK),
            delay: Mutex::new(Duration::ZERO),
            sse_enabled: AtomicBool::new(false),
            etag_enabled: AtomicBool::new(false),
            version: AtomicUsize::new(0),
            not_modified_responses: AtomicUsize::new(0),
            feature_requests: AtomicUsize::new(0),
            stream_requests: AtomicUsize::new(0),
            events: broadcast::channel(16).0,
        }
    }
}

pub struct MockServer {
    url: String,
    state: Arc<ServerState>,
    // Keeps the server running until the mock is dropped.
    _runtime: tokio::runtime::Runtime,
}

impl MockServer {
    pub fn start() -> MockServer {
        init_logger();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let state = Arc::new(ServerState::default());

        let listener = runtime
            .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let app = Router::new()
            .route("/api/features/{key}", get(features))
            .route("/sub/{key}", get(stream))
            .with_state(Arc::clone(&state));
        runtime.spawn(async move { axum::serve(listener, app).await.unwrap() });

        MockServer {
            url: format!("http://{addr}"),
            state,
            _runtime: runtime,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn set_features(&self, features: Value) {
        *self.state.features.lock().unwrap() = features;
        self.state.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Include `savedGroups` in the features payload.
    pub fn set_saved_groups(&self, saved_groups: Value) {
        *self.state.saved_groups.lock().unwrap() = Some(saved_groups);
        self.state.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Serve `body` verbatim instead of a features payload.
    pub fn set_raw_body(&self, body: &str) {
        *self.state.raw_body.lock().unwrap() = Some(body.to_owned());
        self.state.version.fetch_add(1, Ordering::SeqCst);
    }

    pub fn set_status(&self, status: StatusCode) {
        *self.state.status.lock().unwrap() = status;
    }

    pub fn set_stream_status(&self, status: StatusCode) {
        *self.state.stream_status.lock().unwrap() = status;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock().unwrap() = delay;
    }

    pub fn enable_sse(&self) {
        self.state.sse_enabled.store(true, Ordering::SeqCst);
    }

    /// Tag responses and answer matching `If-None-Match` requests with 304.
    pub fn enable_etag(&self) {
        self.state.etag_enabled.store(true, Ordering::SeqCst);
    }

    pub fn not_modified_responses(&self) -> usize {
        self.state.not_modified_responses.load(Ordering::SeqCst)
    }

    pub fn feature_requests(&self) -> usize {
        self.state.feature_requests.load(Ordering::SeqCst)
    }

    pub fn stream_requests(&self) -> usize {
        self.state.stream_requests.load(Ordering::SeqCst)
    }

    /// Number of open streaming connections.
    pub fn stream_subscribers(&self) -> usize {
        self.state.events.receiver_count()
    }

    /// Push an event to every open streaming connection.
    pub fn push_event(&self, event: &str, data: &str) {
        self.state
            .events
            .send((event.to_owned(), data.to_owned()))
            .unwrap();
    }
}

async fn features(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    state.feature_requests.fetch_add(1, Ordering::SeqCst);

    let delay = *state.delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let status = *state.status.lock().unwrap();
    if status != StatusCode::OK {
        return status.into_response();
    }

    let etag = format!("\"v{}\"", state.version.load(Ordering::SeqCst));
    let etag_enabled = state.etag_enabled.load(Ordering::SeqCst);
    if etag_enabled
        && headers
            .get(header::IF_NONE_MATCH)
            .is_some_and(|value| value.as_bytes() == etag.as_bytes())
    {
        state.not_modified_responses.fetch_add(1, Ordering::SeqCst);
        return StatusCode::NOT_MODIFIED.into_response();
    }

    let body = match state.raw_body.lock().unwrap().clone() {
        Some(body) => body,
        None => {
            let mut payload = json!({
                "status": 200,
                "features": state.features.lock().unwrap().clone(),
            });
            if let Some(saved_groups) = state.saved_groups.lock().unwrap().clone() {
                payload["savedGroups"] = saved_groups;
            }
            payload.to_string()
        }
    };

    let mut response = ([(header::CONTENT_TYPE, "application/json")], body).into_response();
    if etag_enabled {
        response
            .headers_mut()
            .insert(header::ETAG, HeaderValue::from_str(&etag).unwrap());
    }
    if state.sse_enabled.load(Ordering::SeqCst) {
        response
            .headers_mut()
            .insert("x-sse-support", HeaderValue::from_static("enabled"));
    }
    response
}

async fn stream(State(state): State<Arc<ServerState>>) -> Response {
    state.stream_requests.fetch_add(1, Ordering::SeqCst);

    let status = *state.stream_status.lock().unwrap();
    if status != StatusCode::OK {
        return status.into_response();
    }

    let events = BroadcastStream::new(state.events.subscribe()).filter_map(|event| {
        event
            .ok()
            .map(|(name, data)| Ok::<_, Infallible>(Event::default().event(name).data(data)))
    });
    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// An address nothing listens on.
pub fn unreachable_host() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

pub fn features_payload(features: &Value) -> String {
    json!({ "features": features }).to_string()
}
