#![cfg(test)]

//! Shared fixtures for engine unit tests.

use std::sync::Mutex;
use std::time::Duration;

use super::config::{EngineConfig, RefreshMode};
use crate::snapshot::{SnapshotChange, UpdateSink};

/// Returns a push-mode configuration with short timeouts suitable for tests.
pub(crate) fn base_config(server_uris: Vec<String>) -> EngineConfig {
    EngineConfig {
        server_uris,
        refresh_mode: RefreshMode::Push,
        refresh_interval: Duration::from_millis(200),
        first_refresh_interval: Duration::from_millis(200),
        service_name: "svc".into(),
        startup_timeout: Duration::from_secs(2),
        heartbeat_interval: Duration::from_secs(30),
        request_timeout: Duration::from_secs(2),
        ..EngineConfig::default()
    }
}

/// Update sink recording every change for assertions.
#[derive(Debug, Default)]
pub(crate) struct RecordingUpdateSink {
    changes: Mutex<Vec<SnapshotChange>>,
}

impl RecordingUpdateSink {
    pub(crate) fn changes(&self) -> Vec<SnapshotChange> {
        self.changes.lock().expect("sink lock").clone()
    }
}

impl UpdateSink for RecordingUpdateSink {
    fn on_snapshot_changed(&self, change: &SnapshotChange) {
        self.changes.lock().expect("sink lock").push(change.clone());
    }
}
