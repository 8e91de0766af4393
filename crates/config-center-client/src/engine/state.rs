//! Engine and watch state plus the diagnostics snapshot.

use serde::Serialize;

/// Lifecycle of a [`crate::SyncEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Initial fetch in progress.
    Bootstrapping,
    /// Poll mode steady state.
    Polling,
    /// Push mode, no session open; a connect is in progress or due on the next tick.
    WatchConnecting,
    /// Push mode with an open watch session.
    Watching,
    /// Terminal state entered through shutdown.
    Stopped,
}

impl EngineState {
    /// Returns a label for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bootstrapping => "bootstrapping",
            Self::Polling => "polling",
            Self::WatchConnecting => "watch_connecting",
            Self::Watching => "watching",
            Self::Stopped => "stopped",
        }
    }
}

/// State of the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchState {
    /// No session.
    #[default]
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Session open with a live heartbeat.
    Watching,
}

/// Diagnostics view of an engine, serializable for status endpoints and logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    /// Current lifecycle state.
    pub state: EngineState,
    /// Current push channel state.
    pub watch_state: WatchState,
    /// Revision of the stored snapshot.
    pub revision: String,
    /// Number of configuration items held.
    pub item_count: usize,
    /// Selected endpoint, if any.
    pub endpoint: Option<String>,
    /// Known members.
    pub members: Vec<String>,
    /// Heartbeat monitors currently alive.
    pub active_heartbeats: usize,
    /// Most recent recovered error.
    pub last_error: Option<String>,
}
