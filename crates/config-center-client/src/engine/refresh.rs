//! Refresh orchestration.
//!
//! This module hosts the shared engine internals: the fetch-and-apply path,
//! the scheduler loop, watch connect/teardown, and the single consumer of
//! watch events. Higher-level APIs in `core.rs` delegate to these helpers.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};

use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::config::{EngineConfig, RefreshMode};
use super::state::{EngineState, WatchState};
use super::watch::{HeartbeatSettings, WatchEvent, WatchEventKind, WatchSession};
use crate::error::SyncError;
use crate::events::{report_failure, ConnectivityEvent, EventSink};
use crate::http::{FetchOutcome, HttpClient};
use crate::members::MemberDirectory;
use crate::snapshot::SnapshotStore;

/// Push discriminator requesting a full refetch.
pub(crate) const ACTION_CREATE: &str = "CREATE";
/// Push discriminator requesting a membership refresh.
pub(crate) const ACTION_MEMBER_CHANGE: &str = "MEMBER_CHANGE";
/// Field of a push frame naming the action.
const ACTION_FIELD: &str = "action";

/// Watch state and the session it describes, mutated together.
#[derive(Debug, Default)]
pub(crate) struct SessionSlot {
    pub(crate) watch_state: WatchState,
    pub(crate) session: Option<WatchSession>,
}

/// Background tasks owned by a started engine.
#[derive(Debug, Default)]
pub(crate) struct EngineTasks {
    pub(crate) scheduler: Option<JoinHandle<()>>,
    pub(crate) events: Option<JoinHandle<()>>,
}

/// Shared engine internals used by background tasks and the public API.
pub(crate) struct EngineShared {
    /// Validated static configuration.
    pub(crate) config: EngineConfig,
    /// Service identity sent as `dimensionsInfo`.
    pub(crate) dimensions_info: String,
    /// Shared HTTP client.
    pub(crate) http: HttpClient,
    /// Member directory.
    pub(crate) directory: MemberDirectory,
    /// Snapshot store notifying the update sink.
    pub(crate) store: SnapshotStore,
    /// Connectivity observer.
    pub(crate) event_sink: Arc<dyn EventSink>,
    /// Publishes lifecycle transitions.
    pub(crate) state_tx: watch::Sender<EngineState>,
    /// Push channel state and the open session.
    pub(crate) session: Mutex<SessionSlot>,
    /// Serializes fetch-and-apply so ticks and pushes never interleave.
    pub(crate) fetch_lock: Mutex<()>,
    /// Sender handed to every watch session.
    pub(crate) events_tx: mpsc::UnboundedSender<WatchEvent>,
    /// Receiver taken by the event task on start.
    pub(crate) events_rx: Mutex<Option<mpsc::UnboundedReceiver<WatchEvent>>>,
    /// Root token; cancelling it stops every task and in-flight request.
    pub(crate) shutdown: CancellationToken,
    /// Child token stopping only the scheduler.
    pub(crate) scheduler_cancel: CancellationToken,
    /// Background task handles.
    pub(crate) tasks: Mutex<EngineTasks>,
    /// Heartbeat monitors currently alive.
    pub(crate) active_heartbeats: Arc<AtomicUsize>,
    /// Monotonic session id source.
    pub(crate) next_session_id: AtomicU64,
    /// Most recent recovered error.
    pub(crate) last_error: StdRwLock<Option<String>>,
}

impl std::fmt::Debug for EngineShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineShared")
            .field("config", &self.config)
            .field("state", &*self.state_tx.borrow())
            .finish()
    }
}

impl EngineShared {
    /// Returns the current lifecycle state.
    pub(crate) fn state(&self) -> EngineState {
        *self.state_tx.borrow()
    }

    /// Moves to `next` unless the engine is already stopped.
    pub(crate) fn set_state(&self, next: EngineState) {
        self.state_tx.send_if_modified(|current| {
            if *current == EngineState::Stopped || *current == next {
                return false;
            }
            debug!(
                from = current.as_str(),
                to = next.as_str(),
                "config-center engine state changed"
            );
            *current = next;
            true
        });
    }

    /// Forces the terminal state.
    pub(crate) fn mark_stopped(&self) {
        self.state_tx.send_if_modified(|current| {
            let changed = *current != EngineState::Stopped;
            *current = EngineState::Stopped;
            changed
        });
    }

    pub(crate) fn record_error(&self, error: &SyncError) {
        let mut guard = self
            .last_error
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *guard = Some(error.to_string());
    }

    pub(crate) fn last_error(&self) -> Option<String> {
        self.last_error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Fetches the full configuration from the selected member and applies it.
    ///
    /// Connect failures rotate the directory so the next attempt targets another member.
    pub(crate) async fn fetch_and_apply(&self) -> Result<(), SyncError> {
        let _guard = self.fetch_lock.lock().await;
        let result = match self.directory.current() {
            Ok(endpoint) => {
                let revision = self.store.revision();
                let outcome = self
                    .http
                    .fetch_items(&endpoint, &self.dimensions_info, &revision)
                    .await;
                if matches!(&outcome, Err(err) if err.is_connect()) {
                    let _ = self.directory.rotate();
                }
                outcome
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(FetchOutcome::Modified(snapshot)) => {
                let change = self.store.apply_full(snapshot);
                if !change.is_empty() {
                    info!(
                        revision = %self.store.revision(),
                        created = change.created.len(),
                        updated = change.updated.len(),
                        deleted = change.deleted.len(),
                        "config-center configuration updated"
                    );
                }
                self.event_sink
                    .on_connectivity_event(&ConnectivityEvent::Success);
                Ok(())
            }
            Ok(FetchOutcome::NotModified) => {
                debug!(
                    revision = %self.store.revision(),
                    "config-center revision has no change"
                );
                self.event_sink
                    .on_connectivity_event(&ConnectivityEvent::Success);
                Ok(())
            }
            Err(err) => {
                report_failure(self.event_sink.as_ref(), "fetch config", &err);
                self.record_error(&err);
                Err(err)
            }
        }
    }

    /// Refreshes the directory, recording failures.
    pub(crate) async fn refresh_members(&self) {
        if let Err(err) = self.directory.refresh().await {
            self.record_error(&err);
        }
    }

    /// Runs one scheduler tick.
    pub(crate) async fn tick(self: &Arc<Self>) {
        match self.config.refresh_mode {
            RefreshMode::Poll => {
                let _ = self.fetch_and_apply().await;
            }
            RefreshMode::Push => {
                let watching = self.session.lock().await.watch_state == WatchState::Watching;
                if watching {
                    // Pushes keep the snapshot current; only membership needs polling.
                    self.refresh_members().await;
                } else {
                    let _ = self.fetch_and_apply().await;
                    let _ = self.connect_watch().await;
                }
            }
        }
    }

    /// Runs the scheduler: first delay, then fixed-delay ticks until cancelled.
    pub(crate) async fn run_scheduler(self: Arc<Self>) {
        let cancel = self.scheduler_cancel.clone();
        let mut delay = self.config.first_refresh_interval;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.tick() => {}
            }
            delay = self.config.refresh_interval;
        }
        debug!("config-center scheduler shutting down");
    }

    /// Opens a watch session unless one is already watching.
    pub(crate) async fn connect_watch(self: &Arc<Self>) -> Result<(), SyncError> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        let mut slot = self.session.lock().await;
        if slot.watch_state == WatchState::Watching {
            return Ok(());
        }
        // The previous session and its heartbeat must be gone before a new one starts.
        if let Some(mut stale) = slot.session.take() {
            stale.close().await;
        }
        slot.watch_state = WatchState::Connecting;
        self.set_state(EngineState::WatchConnecting);

        let result = match self.directory.current() {
            Ok(endpoint) => match self.http.watch_request(
                &endpoint,
                self.config.refresh_port,
                &self.dimensions_info,
            ) {
                Ok(request) => {
                    let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst) + 1;
                    WatchSession::open(
                        &endpoint,
                        request,
                        session_id,
                        self.events_tx.clone(),
                        self.heartbeat_settings(),
                        self.config.request_timeout,
                        self.shutdown.child_token(),
                    )
                    .await
                }
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };

        match result {
            Ok(session) => {
                info!(session_id = session.id(), "config-center watching configuration");
                slot.session = Some(session);
                slot.watch_state = WatchState::Watching;
                self.set_state(EngineState::Watching);
                self.event_sink
                    .on_connectivity_event(&ConnectivityEvent::Success);
                Ok(())
            }
            Err(err) => {
                slot.watch_state = WatchState::Disconnected;
                report_failure(self.event_sink.as_ref(), "watch config", &err);
                self.record_error(&err);
                Err(err)
            }
        }
    }

    fn heartbeat_settings(&self) -> HeartbeatSettings {
        HeartbeatSettings {
            interval: self.config.heartbeat_interval,
            write_timeout: self.config.request_timeout,
            event_sink: self.event_sink.clone(),
            active: self.active_heartbeats.clone(),
        }
    }

    /// Closes the open session, if any. Used by shutdown.
    pub(crate) async fn close_session(&self) {
        let mut slot = self.session.lock().await;
        if let Some(mut session) = slot.session.take() {
            session.close().await;
        }
        slot.watch_state = WatchState::Disconnected;
    }

    /// Consumes watch events until the engine shuts down.
    pub(crate) async fn run_event_loop(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<WatchEvent>) {
        let cancel = self.shutdown.clone();
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                break;
            };
            self.handle_watch_event(event).await;
        }
        debug!("config-center watch event loop shutting down");
    }

    async fn handle_watch_event(self: &Arc<Self>, event: WatchEvent) {
        let WatchEvent { session_id, kind } = event;
        match kind {
            WatchEventKind::Message(text) => {
                let current = self.session.lock().await.session.as_ref().map(WatchSession::id);
                if current != Some(session_id) {
                    debug!(session_id, "config-center ignoring frame from stale session");
                    return;
                }
                debug!(session_id, frame = %text, "config-center watch frame received");
                self.dispatch_push(&text);
            }
            WatchEventKind::Closed => {
                self.teardown_session(session_id, Some("watch connection closed by peer".into()))
                    .await;
            }
            WatchEventKind::Error(detail) => {
                self.teardown_session(session_id, Some(format!("watch read failed: {detail}")))
                    .await;
            }
            WatchEventKind::HeartbeatFailed(_) => {
                // Already logged and reported by the monitor.
                self.teardown_session(session_id, None).await;
            }
        }
    }

    /// Classifies a pushed frame; refetches and member refreshes run off the event loop.
    fn dispatch_push(self: &Arc<Self>, text: &str) {
        let payload: Value = match serde_json::from_str(text) {
            Ok(value @ Value::Object(_)) => value,
            Ok(_) => {
                self.report_push_error(&SyncError::decode("push frame is not a JSON object"));
                return;
            }
            Err(err) => {
                self.report_push_error(&SyncError::decode(format!("push frame: {err}")));
                return;
            }
        };
        let action = payload
            .get(ACTION_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default();

        match action {
            ACTION_CREATE => {
                let shared = self.clone();
                self.spawn_guarded(async move {
                    let _ = shared.fetch_and_apply().await;
                });
            }
            ACTION_MEMBER_CHANGE => {
                let shared = self.clone();
                self.spawn_guarded(async move {
                    shared.refresh_members().await;
                });
            }
            other => {
                if let Err(err) = self.store.apply_incremental(other, &payload) {
                    self.report_push_error(&err);
                }
            }
        }
    }

    fn report_push_error(&self, error: &SyncError) {
        report_failure(self.event_sink.as_ref(), "apply pushed change", error);
        self.record_error(error);
    }

    /// Closes `session_id` if it is still current, reporting `cause` against
    /// its member first; the next tick reconnects.
    async fn teardown_session(&self, session_id: u64, cause: Option<String>) {
        let mut slot = self.session.lock().await;
        if slot.session.as_ref().map(WatchSession::id) != Some(session_id) {
            return;
        }
        if let Some(mut session) = slot.session.take() {
            if let Some(cause) = cause {
                let err = SyncError::connect(session.endpoint(), cause);
                report_failure(self.event_sink.as_ref(), "watch config", &err);
                self.record_error(&err);
            }
            session.close().await;
        }
        slot.watch_state = WatchState::Disconnected;
        self.set_state(EngineState::WatchConnecting);
    }

    /// Spawns work that is abandoned when the engine shuts down.
    pub(crate) fn spawn_guarded<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = future => {}
            }
        });
    }
}
