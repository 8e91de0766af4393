//! Backend harness shared by the end-to-end tests.
//!
//! The harness implements the config center items, membership and watch
//! endpoints on one axum listener. Item responses are scripted through a
//! queue (an empty queue answers 304) and every request is logged.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use config_center_client::{EngineConfig, RefreshMode, SnapshotChange, UpdateSink};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

pub const ITEMS_PATH: &str = "/v3/default/configuration/items";
pub const MEMBERS_PATH: &str = "/v3/default/configuration/members";
pub const WATCH_PATH: &str = "/v3/default/configuration/refresh/items";

/// Scripted answer to an items request.
#[derive(Debug, Clone)]
pub enum ItemsReply {
    /// 200 with the given items under one dimension and a revision entry.
    Snapshot { revision: String, items: Value },
    /// 304.
    NotModified,
    /// Arbitrary status without body.
    Status(u16),
    /// Never answers.
    Hang,
}

impl ItemsReply {
    pub fn snapshot(revision: &str, items: Value) -> Self {
        Self::Snapshot {
            revision: revision.to_string(),
            items,
        }
    }
}

/// Mode controlling the watch handshake outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatchMode {
    /// Handshakes succeed.
    #[default]
    Accept,
    /// Handshakes are answered with HTTP 500.
    Reject,
}

/// Frames the harness can push to a connected watcher.
#[derive(Debug)]
enum ServerFrame {
    Text(String),
    Close,
    Drop,
}

/// Captures a request the engine sent to the backend.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Decoded query parameters.
    pub query: HashMap<String, String>,
    /// Header names (lowercase) to values.
    pub headers: HashMap<String, String>,
}

#[derive(Default)]
struct BackendState {
    items_responses: VecDeque<ItemsReply>,
    members_response: Option<Value>,
    item_requests: Vec<RecordedRequest>,
    member_requests: usize,
    watch_requests: Vec<RecordedRequest>,
    watch_mode: WatchMode,
    watchers: Vec<mpsc::UnboundedSender<ServerFrame>>,
    live_watchers: usize,
    pings: usize,
}

type SharedState = Arc<Mutex<BackendState>>;

/// Backend harness implementing the config center HTTP and websocket APIs.
pub struct BackendHarness {
    base_url: String,
    port: u16,
    state: SharedState,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl BackendHarness {
    /// Spawns the harness on an ephemeral port.
    pub async fn start() -> Self {
        let state: SharedState = Arc::new(Mutex::new(BackendState::default()));
        let router = Router::new()
            .route(ITEMS_PATH, get(handle_items))
            .route(MEMBERS_PATH, get(handle_members))
            .route(WATCH_PATH, get(handle_watch))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("backend bind");
        let addr = listener.local_addr().expect("backend address");
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("server run");
        });

        Self {
            base_url: format!("http://{addr}"),
            port: addr.port(),
            state,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn base_url(&self) -> String {
        self.base_url.clone()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns an engine configuration pointing at this harness.
    pub fn engine_config(&self, mode: RefreshMode) -> EngineConfig {
        EngineConfig {
            server_uris: vec![self.base_url()],
            refresh_mode: mode,
            refresh_port: self.port,
            refresh_interval: Duration::from_millis(1000),
            first_refresh_interval: Duration::from_millis(1000),
            service_name: "svc@app#1.0".into(),
            environment: "test".into(),
            startup_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(5),
            ..EngineConfig::default()
        }
    }

    pub async fn enqueue_items(&self, reply: ItemsReply) {
        self.state.lock().await.items_responses.push_back(reply);
    }

    pub async fn set_members(&self, members: Value) {
        self.state.lock().await.members_response = Some(members);
    }

    pub async fn set_watch_mode(&self, mode: WatchMode) {
        self.state.lock().await.watch_mode = mode;
    }

    /// Sends a text frame to the most recent watcher.
    pub async fn push(&self, frame: Value) {
        let guard = self.state.lock().await;
        let watcher = guard.watchers.last().expect("a watcher is connected");
        watcher
            .send(ServerFrame::Text(frame.to_string()))
            .expect("watcher alive");
    }

    /// Closes the most recent watch connection from the server side.
    pub async fn close_watch(&self) {
        let guard = self.state.lock().await;
        if let Some(watcher) = guard.watchers.last() {
            let _ = watcher.send(ServerFrame::Close);
        }
    }

    /// Drops the most recent watch connection without a close frame.
    pub async fn drop_watch(&self) {
        let guard = self.state.lock().await;
        if let Some(watcher) = guard.watchers.last() {
            let _ = watcher.send(ServerFrame::Drop);
        }
    }

    pub async fn item_requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().await.item_requests.clone()
    }

    pub async fn item_request_count(&self) -> usize {
        self.state.lock().await.item_requests.len()
    }

    pub async fn member_request_count(&self) -> usize {
        self.state.lock().await.member_requests
    }

    pub async fn watch_requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().await.watch_requests.clone()
    }

    pub async fn live_watchers(&self) -> usize {
        self.state.lock().await.live_watchers
    }

    pub async fn ping_count(&self) -> usize {
        self.state.lock().await.pings
    }
}

impl Drop for BackendHarness {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn handle_items(
    State(state): State<SharedState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let reply = {
        let mut guard = state.lock().await;
        guard.item_requests.push(RecordedRequest {
            query,
            headers: headers_to_map(&headers),
        });
        guard
            .items_responses
            .pop_front()
            .unwrap_or(ItemsReply::NotModified)
    };

    match reply {
        ItemsReply::Snapshot { revision, items } => Json(json!({
            "svc@app#1.0": items,
            "revision": {"version": revision},
        }))
        .into_response(),
        ItemsReply::NotModified => StatusCode::NOT_MODIFIED.into_response(),
        ItemsReply::Status(code) => StatusCode::from_u16(code)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            .into_response(),
        ItemsReply::Hang => std::future::pending::<Response>().await,
    }
}

async fn handle_members(State(state): State<SharedState>) -> Response {
    let mut guard = state.lock().await;
    guard.member_requests += 1;
    match guard.members_response.clone() {
        Some(body) => Json(body).into_response(),
        None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn handle_watch(
    State(state): State<SharedState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    {
        let mut guard = state.lock().await;
        guard.watch_requests.push(RecordedRequest {
            query,
            headers: headers_to_map(&headers),
        });
        if guard.watch_mode == WatchMode::Reject {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }
    ws.on_upgrade(move |socket| watch_session(socket, state))
}

/// Relays scripted frames to the watcher and counts its pings.
async fn watch_session(socket: WebSocket, state: SharedState) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    {
        let mut guard = state.lock().await;
        guard.watchers.push(tx);
        guard.live_watchers += 1;
    }

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(ServerFrame::Text(text)) => {
                    if sink.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(ServerFrame::Close) | None => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
                Some(ServerFrame::Drop) => break,
            },
            message = stream.next() => match message {
                Some(Ok(WsMessage::Ping(_))) => {
                    state.lock().await.pings += 1;
                }
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.lock().await.live_watchers -= 1;
}

fn headers_to_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
        })
        .collect()
}

/// Update sink recording every change.
#[derive(Debug, Default)]
pub struct RecordingSink {
    changes: StdMutex<Vec<SnapshotChange>>,
}

impl RecordingSink {
    pub fn changes(&self) -> Vec<SnapshotChange> {
        self.changes.lock().expect("sink lock").clone()
    }

    pub fn count(&self) -> usize {
        self.changes.lock().expect("sink lock").len()
    }
}

impl UpdateSink for RecordingSink {
    fn on_snapshot_changed(&self, change: &SnapshotChange) {
        self.changes.lock().expect("sink lock").push(change.clone());
    }
}

/// Waits for an asynchronous condition to succeed within the supplied timeout.
pub async fn wait_for_condition<T, F, Fut>(timeout: Duration, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return value;
        }
        if Instant::now() >= deadline {
            panic!("condition not satisfied within {:?}", timeout);
        }
        // Yield to the scheduler briefly before checking again to avoid tight busy loops.
        sleep(Duration::from_millis(20)).await;
    }
}
