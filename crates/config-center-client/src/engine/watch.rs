//! Watch session and heartbeat management.
//!
//! A [`WatchSession`] owns one websocket connection to the config center.
//! Inbound frames are forwarded, tagged with the session id, to the engine's
//! single event consumer; the channel is handed to `open` so it is in place
//! before the reader starts. Each session owns exactly one
//! [`HeartbeatMonitor`], which is stopped and awaited before `close` returns.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{http::Request as WsRequest, protocol::WebSocketConfig, Message as WsMessage},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::events::{ConnectivityEvent, EventSink};

const MAX_PUSH_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16 MiB
/// Bound on the best-effort close frame sent during teardown.
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = Arc<Mutex<SplitSink<WsStream, WsMessage>>>;

/// Notification produced by a watch session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WatchEvent {
    /// Session that produced the event.
    pub(crate) session_id: u64,
    /// What happened.
    pub(crate) kind: WatchEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WatchEventKind {
    /// A text or binary frame.
    Message(String),
    /// The peer closed the connection.
    Closed,
    /// Reading from the connection failed.
    Error(String),
    /// A heartbeat ping could not be written.
    HeartbeatFailed(String),
}

/// Settings shared by every heartbeat an engine starts.
#[derive(Clone)]
pub(crate) struct HeartbeatSettings {
    /// Ping period.
    pub(crate) interval: Duration,
    /// Bound on a single ping write.
    pub(crate) write_timeout: Duration,
    /// Sink notified after each ping.
    pub(crate) event_sink: Arc<dyn EventSink>,
    /// Number of monitors currently alive.
    pub(crate) active: Arc<AtomicUsize>,
}

/// Keeps a monitor counted for exactly as long as its task future lives.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Periodic ping writer attached to one session.
pub(crate) struct HeartbeatMonitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl HeartbeatMonitor {
    fn start(
        session_id: u64,
        writer: WsWriter,
        settings: HeartbeatSettings,
        events: mpsc::UnboundedSender<WatchEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let guard = ActiveGuard::new(settings.active.clone());
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let mut ticker = interval_at(Instant::now() + settings.interval, settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let result = timeout(settings.write_timeout, async {
                    let mut writer = writer.lock().await;
                    writer.send(WsMessage::Ping(Vec::new())).await
                })
                .await;
                let failure = match result {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(err.to_string()),
                    Err(_) => Some(format!("ping not written within {:?}", settings.write_timeout)),
                };

                match failure {
                    None => {
                        debug!(session_id, "config-center heartbeat sent");
                        settings
                            .event_sink
                            .on_connectivity_event(&ConnectivityEvent::Success);
                    }
                    Some(detail) => {
                        warn!(session_id, error = %detail, "config-center heartbeat failed");
                        settings
                            .event_sink
                            .on_connectivity_event(&ConnectivityEvent::failure(format!(
                                "heartbeat fail, {detail}"
                            )));
                        let _ = events.send(WatchEvent {
                            session_id,
                            kind: WatchEventKind::HeartbeatFailed(detail),
                        });
                        break;
                    }
                }
            }
        });
        Self { cancel, handle }
    }

    /// Stops the monitor and waits until its task is gone.
    async fn stop(self) {
        self.cancel.cancel();
        self.handle.abort();
        let _ = self.handle.await;
    }
}

/// An open websocket to the config center.
pub(crate) struct WatchSession {
    id: u64,
    endpoint: String,
    cancel: CancellationToken,
    writer: WsWriter,
    reader: Option<JoinHandle<()>>,
    heartbeat: Option<HeartbeatMonitor>,
}

impl std::fmt::Debug for WatchSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchSession")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("closed", &self.reader.is_none())
            .finish()
    }
}

impl WatchSession {
    /// Opens a session and starts its reader and heartbeat.
    ///
    /// `events` must already be consumed by the engine; every inbound frame
    /// after the handshake is forwarded to it.
    pub(crate) async fn open(
        endpoint: &str,
        request: WsRequest<()>,
        session_id: u64,
        events: mpsc::UnboundedSender<WatchEvent>,
        heartbeat: HeartbeatSettings,
        handshake_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Self, SyncError> {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(MAX_PUSH_MESSAGE_SIZE);
        config.max_frame_size = Some(MAX_PUSH_MESSAGE_SIZE);

        let connect = connect_async_with_config(request, Some(config), false);
        let (stream, _) = match timeout(handshake_timeout, connect).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(err)) => return Err(SyncError::connect(endpoint, err)),
            Err(_) => {
                return Err(SyncError::connect(
                    endpoint,
                    format!("watch handshake not completed within {handshake_timeout:?}"),
                ))
            }
        };
        debug!(session_id, endpoint, "config-center watch session opened");

        let (writer, reader) = stream.split();
        let writer = Arc::new(Mutex::new(writer));
        let reader = tokio::spawn(read_frames(
            session_id,
            reader,
            events.clone(),
            cancel.clone(),
        ));
        let heartbeat = HeartbeatMonitor::start(
            session_id,
            writer.clone(),
            heartbeat,
            events,
            cancel.child_token(),
        );

        Ok(Self {
            id: session_id,
            endpoint: endpoint.to_owned(),
            cancel,
            writer,
            reader: Some(reader),
            heartbeat: Some(heartbeat),
        })
    }

    /// Returns the session id used to tag events.
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Returns the member this session is connected to.
    pub(crate) fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Closes the session. The heartbeat is gone when this returns; repeated calls are no-ops.
    pub(crate) async fn close(&mut self) {
        let Some(reader) = self.reader.take() else {
            return;
        };
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop().await;
        }
        self.cancel.cancel();

        // Best effort: the peer may already be gone.
        let _ = timeout(CLOSE_FRAME_TIMEOUT, async {
            let mut writer = self.writer.lock().await;
            writer.send(WsMessage::Close(None)).await
        })
        .await;

        reader.abort();
        let _ = reader.await;
        debug!(session_id = self.id, "config-center watch session closed");
    }
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        // Sessions are closed explicitly; this only catches tasks left behind by a dropped engine.
        self.cancel.cancel();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.handle.abort();
        }
    }
}

/// Forwards inbound frames until the connection ends or the session is cancelled.
async fn read_frames(
    session_id: u64,
    mut reader: SplitStream<WsStream>,
    events: mpsc::UnboundedSender<WatchEvent>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            frame = reader.next() => frame,
        };
        let kind = match frame {
            Some(Ok(WsMessage::Text(text))) => WatchEventKind::Message(text),
            Some(Ok(WsMessage::Binary(bytes))) => {
                WatchEventKind::Message(String::from_utf8_lossy(&bytes).into_owned())
            }
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {
                // Pongs answer our heartbeat; pings are answered by the transport.
                continue;
            }
            Some(Ok(WsMessage::Close(_))) | None => WatchEventKind::Closed,
            Some(Err(err)) => WatchEventKind::Error(err.to_string()),
        };
        let terminal = !matches!(kind, WatchEventKind::Message(_));
        if events.send(WatchEvent { session_id, kind }).is_err() || terminal {
            return;
        }
    }
}
