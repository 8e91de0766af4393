//! Synchronization engine orchestration.
//!
//! This module wires the HTTP client, member directory and snapshot store into
//! an asynchronous engine. `start` performs a bounded bootstrap fetch and then
//! hands over to the scheduler (poll mode) or to a watch session backed by the
//! scheduler as fallback (push mode). The returned [`SyncHandle`] stops
//! everything in a fixed order.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};

use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::{EngineConfig, RefreshMode};
use super::refresh::{EngineShared, EngineTasks, SessionSlot};
use super::state::{EngineSnapshot, EngineState, WatchState};
use crate::error::SyncError;
use crate::events::{ConnectivityEvent, EventSink, NoopEventSink};
use crate::http::HttpClient;
use crate::members::MemberDirectory;
use crate::signer::{NoopSigner, RequestSigner};
use crate::snapshot::{Snapshot, SnapshotStore, UpdateSink};

/// Builder collecting the collaborators of a [`SyncEngine`].
pub struct SyncEngineBuilder {
    config: EngineConfig,
    update_sink: Arc<dyn UpdateSink>,
    event_sink: Arc<dyn EventSink>,
    signer: Arc<dyn RequestSigner>,
    http: Option<HttpClient>,
}

impl SyncEngineBuilder {
    /// Sets the connectivity observer.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Sets the request signer used for fetches, membership and the watch handshake.
    pub fn signer(mut self, signer: Arc<dyn RequestSigner>) -> Self {
        self.signer = signer;
        self
    }

    /// Reuses an existing HTTP client instead of building one from the configuration.
    pub fn http_client(mut self, http: HttpClient) -> Self {
        self.http = Some(http);
        self
    }

    /// Validates the configuration and builds the engine.
    pub fn build(self) -> Result<SyncEngine, SyncError> {
        let config = self.config.validate()?;
        let http = match self.http {
            Some(http) => http,
            None => HttpClient::from_config(&config, self.signer)?,
        };
        let directory = MemberDirectory::new(
            http.clone(),
            config.server_uris.clone(),
            config.auto_discovery_enabled,
            self.event_sink.clone(),
        );
        let (state_tx, _) = watch::channel(EngineState::Bootstrapping);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let scheduler_cancel = shutdown.child_token();

        let shared = EngineShared {
            dimensions_info: config.dimensions_info(),
            config,
            http,
            directory,
            store: SnapshotStore::new(self.update_sink),
            event_sink: self.event_sink,
            state_tx,
            session: Mutex::new(SessionSlot::default()),
            fetch_lock: Mutex::new(()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown,
            scheduler_cancel,
            tasks: Mutex::new(EngineTasks::default()),
            active_heartbeats: Arc::new(AtomicUsize::new(0)),
            next_session_id: AtomicU64::new(0),
            last_error: StdRwLock::new(None),
        };
        Ok(SyncEngine {
            shared: Arc::new(shared),
        })
    }
}

/// Keeps a local snapshot in sync with the config center.
#[derive(Debug, Clone)]
pub struct SyncEngine {
    shared: Arc<EngineShared>,
}

impl SyncEngine {
    /// Starts building an engine around `config`, notifying `update_sink` on change.
    pub fn builder(config: EngineConfig, update_sink: Arc<dyn UpdateSink>) -> SyncEngineBuilder {
        SyncEngineBuilder {
            config,
            update_sink,
            event_sink: Arc::new(NoopEventSink),
            signer: Arc::new(NoopSigner),
            http: None,
        }
    }

    /// Builds an engine with default collaborators.
    pub fn new(config: EngineConfig, update_sink: Arc<dyn UpdateSink>) -> Result<Self, SyncError> {
        Self::builder(config, update_sink).build()
    }

    /// Bootstraps the snapshot and spawns the background tasks.
    ///
    /// The membership refresh and bootstrap fetch are bounded together by the
    /// startup timeout; when they do not finish in time the engine logs,
    /// reports a failure and carries on.
    /// Calling `start` again returns a handle without spawning anything.
    pub async fn start(&self) -> SyncHandle {
        let handle = SyncHandle {
            shared: self.shared.clone(),
        };
        if self.shared.shutdown.is_cancelled() {
            return handle;
        }
        let Some(events_rx) = self.shared.events_rx.lock().await.take() else {
            warn!("config-center engine already started");
            return handle;
        };
        let shared = &self.shared;
        info!(
            mode = shared.config.refresh_mode.as_str(),
            service = %shared.dimensions_info,
            "config-center engine starting"
        );

        // Membership and the first fetch share a single startup bound.
        let startup_timeout = shared.config.startup_timeout;
        let bootstrap = async {
            shared.refresh_members().await;
            let _ = shared.fetch_and_apply().await;
        };
        if timeout(startup_timeout, bootstrap).await.is_err() {
            let err = SyncError::Timeout(startup_timeout);
            warn!(%err, "config-center bootstrap fetch did not complete; continuing");
            shared
                .event_sink
                .on_connectivity_event(&ConnectivityEvent::failure(format!(
                    "fetch config fail, {err}"
                )));
            shared.record_error(&err);
        }

        // The consumer runs before any session exists so no frame is missed.
        let events = tokio::spawn(shared.clone().run_event_loop(events_rx));
        {
            let mut tasks = shared.tasks.lock().await;
            tasks.events = Some(events);
        }

        match shared.config.refresh_mode {
            RefreshMode::Poll => shared.set_state(EngineState::Polling),
            RefreshMode::Push => {
                let _ = shared.connect_watch().await;
            }
        }

        let scheduler = tokio::spawn(shared.clone().run_scheduler());
        {
            let mut tasks = shared.tasks.lock().await;
            tasks.scheduler = Some(scheduler);
        }
        handle
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.shared.store.current()
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    /// Subscribes to lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.shared.state_tx.subscribe()
    }

    /// Returns the push channel state.
    pub async fn watch_state(&self) -> WatchState {
        self.shared.session.lock().await.watch_state
    }

    /// Returns the number of heartbeat monitors currently alive (0 or 1).
    pub fn active_heartbeats(&self) -> usize {
        self.shared.active_heartbeats.load(Ordering::SeqCst)
    }

    /// Runs a single fetch-and-apply cycle outside the schedule.
    pub async fn refresh_once(&self) -> Result<(), SyncError> {
        self.shared.fetch_and_apply().await
    }

    /// Returns a diagnostics snapshot.
    pub async fn diagnostics(&self) -> EngineSnapshot {
        let snapshot = self.shared.store.current();
        EngineSnapshot {
            state: self.shared.state(),
            watch_state: self.watch_state().await,
            revision: snapshot.revision().to_owned(),
            item_count: snapshot.items().len(),
            endpoint: self.shared.directory.current().ok(),
            members: self.shared.directory.members(),
            active_heartbeats: self.active_heartbeats(),
            last_error: self.shared.last_error(),
        }
    }
}

/// Handle returned by [`SyncEngine::start`]; clones share the same engine.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    shared: Arc<EngineShared>,
}

impl SyncHandle {
    /// Returns the engine this handle controls.
    pub fn engine(&self) -> SyncEngine {
        SyncEngine {
            shared: self.shared.clone(),
        }
    }

    /// Stops the engine: scheduler first, then the watch session and its
    /// heartbeat, then the event task and in-flight work. Idempotent.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        if shared.state() == EngineState::Stopped {
            return;
        }

        shared.scheduler_cancel.cancel();
        let scheduler = shared.tasks.lock().await.scheduler.take();
        if let Some(handle) = scheduler {
            handle.abort();
            let _ = handle.await;
        }

        shared.close_session().await;

        shared.shutdown.cancel();
        let events = shared.tasks.lock().await.events.take();
        if let Some(handle) = events {
            handle.abort();
            let _ = handle.await;
        }

        shared.mark_stopped();
        debug!("config-center engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::{base_config, RecordingUpdateSink};
    use crate::events::CountingEventSink;
    use httptest::matchers::request;
    use httptest::{responders::status_code, Expectation, Server};
    use serde_json::json;
    use std::time::Duration;

    fn server_base(server: &Server) -> String {
        server.url_str("").trim_end_matches('/').to_string()
    }

    /// Construction rejects invalid configuration before anything runs.
    #[test]
    fn new_rejects_invalid_configuration() {
        let mut config = base_config(vec!["http://127.0.0.1:9".into()]);
        config.service_name = String::new();
        let err = SyncEngine::new(config, Arc::new(RecordingUpdateSink::default()))
            .expect_err("empty service name");
        assert!(matches!(err, SyncError::Configuration(_)));
    }

    /// Poll mode bootstraps, reaches `Polling`, and stops idempotently.
    #[tokio::test]
    async fn poll_mode_bootstraps_and_shuts_down() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/v3/default/configuration/items",
            ))
            .respond_with(status_code(200).body(
                json!({"svc": {"a": "1"}, "revision": {"version": "r1"}}).to_string(),
            )),
        );

        let mut config = base_config(vec![server_base(&server)]);
        config.refresh_mode = RefreshMode::Poll;
        config.first_refresh_interval = Duration::from_secs(60);
        let sink = Arc::new(RecordingUpdateSink::default());
        let events = CountingEventSink::default();
        let engine = SyncEngine::builder(config, sink.clone())
            .event_sink(Arc::new(events.clone()))
            .build()
            .expect("engine builds");

        let mut states = engine.subscribe_state();
        assert_eq!(*states.borrow_and_update(), EngineState::Bootstrapping);

        let handle = engine.start().await;
        assert_eq!(*states.borrow_and_update(), EngineState::Polling);
        assert_eq!(engine.state(), EngineState::Polling);
        assert_eq!(engine.snapshot().revision(), "r1");
        assert_eq!(sink.changes().len(), 1);
        assert_eq!(events.counters().snapshot().success, 1);

        handle.shutdown().await;
        states.changed().await.expect("state sender alive");
        assert_eq!(*states.borrow_and_update(), EngineState::Stopped);
        assert_eq!(engine.state(), EngineState::Stopped);
        handle.clone().shutdown().await;
        assert_eq!(engine.state(), EngineState::Stopped);

        // A second start is a no-op once the receiver has been taken.
        let again = engine.start().await;
        again.shutdown().await;
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    /// Fetch failures are reported but never escape `start`.
    #[tokio::test]
    async fn bootstrap_failure_is_recovered() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/v3/default/configuration/items",
            ))
            .respond_with(status_code(500)),
        );

        let mut config = base_config(vec![server_base(&server)]);
        config.refresh_mode = RefreshMode::Poll;
        config.first_refresh_interval = Duration::from_secs(60);
        let events = CountingEventSink::default();
        let engine = SyncEngine::builder(config, Arc::new(RecordingUpdateSink::default()))
            .event_sink(Arc::new(events.clone()))
            .build()
            .expect("engine builds");

        let handle = engine.start().await;
        assert_eq!(engine.state(), EngineState::Polling);
        assert_eq!(events.counters().snapshot().failure, 1);
        let diagnostics = engine.diagnostics().await;
        assert!(diagnostics
            .last_error
            .as_deref()
            .is_some_and(|err| err.contains("500")));
        handle.shutdown().await;
    }

    /// Without any seed the engine reports `NoEndpointAvailable` and keeps running.
    #[tokio::test]
    async fn missing_endpoint_is_reported() {
        let mut config = base_config(Vec::new());
        config.first_refresh_interval = Duration::from_secs(60);
        let engine = SyncEngine::new(config, Arc::new(RecordingUpdateSink::default()))
            .expect("engine builds");

        let handle = engine.start().await;
        assert!(matches!(
            engine.refresh_once().await,
            Err(SyncError::NoEndpointAvailable)
        ));
        assert_eq!(engine.state(), EngineState::WatchConnecting);
        assert_eq!(engine.watch_state().await, WatchState::Disconnected);
        handle.shutdown().await;
    }

    /// A heartbeat failure on the open session tears it down and leaves the
    /// engine waiting for the next tick.
    #[tokio::test]
    async fn heartbeat_failure_returns_to_watch_connecting() {
        use crate::engine::watch::{WatchEvent, WatchEventKind, WatchSession};
        use futures_util::StreamExt;
        use tokio::net::TcpListener;
        use tokio_tungstenite::accept_async;

        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/v3/default/configuration/items",
            ))
            .respond_with(status_code(200).body(
                json!({"svc": {"a": "1"}, "revision": {"version": "r1"}}).to_string(),
            )),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let peer = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            let mut ws = accept_async(socket).await.expect("handshake");
            while let Some(Ok(_)) = ws.next().await {}
        });

        let mut config = base_config(vec![server_base(&server)]);
        config.refresh_port = port;
        config.first_refresh_interval = Duration::from_secs(60);
        let events = CountingEventSink::default();
        let engine = SyncEngine::builder(config, Arc::new(RecordingUpdateSink::default()))
            .event_sink(Arc::new(events.clone()))
            .build()
            .expect("engine builds");
        let handle = engine.start().await;
        assert_eq!(engine.state(), EngineState::Watching);
        assert_eq!(engine.active_heartbeats(), 1);

        let session_id = engine
            .shared
            .session
            .lock()
            .await
            .session
            .as_ref()
            .map(WatchSession::id)
            .expect("session open");
        let failures = events.counters().snapshot().failure;
        let mut states = engine.subscribe_state();
        engine
            .shared
            .events_tx
            .send(WatchEvent {
                session_id,
                kind: WatchEventKind::HeartbeatFailed("broken pipe".into()),
            })
            .expect("event loop alive");

        states
            .wait_for(|state| *state == EngineState::WatchConnecting)
            .await
            .expect("state sender alive");
        assert_eq!(engine.watch_state().await, WatchState::Disconnected);
        assert_eq!(engine.active_heartbeats(), 0);
        // The monitor reports its own failure; teardown does not add another.
        assert_eq!(events.counters().snapshot().failure, failures);

        handle.shutdown().await;
        peer.abort();
    }
}
