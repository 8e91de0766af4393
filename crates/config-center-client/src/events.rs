//! Connectivity event sinks.
//!
//! Every fetch, membership refresh, watch handshake and heartbeat reports its
//! outcome through an [`EventSink`]. Besides the no-op default this module
//! ships a counting sink (for exporting metrics) and a composite sink that
//! fans events out to several observers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::SyncError;

/// Outcome of a single interaction with the config center.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityEvent {
    /// The interaction succeeded.
    Success,
    /// The interaction failed; carries a human-readable detail.
    Failure(String),
}

impl ConnectivityEvent {
    /// Builds a failure event from any displayable detail.
    pub fn failure(detail: impl fmt::Display) -> Self {
        Self::Failure(detail.to_string())
    }
}

/// Observer notified after every connectivity attempt.
pub trait EventSink: Send + Sync {
    /// Called once per attempt. Implementations must not block.
    fn on_connectivity_event(&self, _event: &ConnectivityEvent) {}
}

/// Sink discarding every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {}

/// Aggregated connectivity counters (relaxed atomics).
#[derive(Debug, Default)]
pub struct ConnectivityCounters {
    success: AtomicU64,
    failure: AtomicU64,
}

impl ConnectivityCounters {
    /// Captures a point-in-time view of the counters.
    pub fn snapshot(&self) -> ConnectivitySnapshot {
        ConnectivitySnapshot {
            success: self.success.load(Ordering::Relaxed),
            failure: self.failure.load(Ordering::Relaxed),
        }
    }
}

/// Plain data view of [`ConnectivityCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectivitySnapshot {
    /// Number of successful attempts.
    pub success: u64,
    /// Number of failed attempts.
    pub failure: u64,
}

impl fmt::Display for ConnectivitySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "success={}, failure={}", self.success, self.failure)
    }
}

/// Sink maintaining atomic counters for every event.
#[derive(Debug, Clone)]
pub struct CountingEventSink {
    counters: Arc<ConnectivityCounters>,
}

impl CountingEventSink {
    /// Creates a sink backed by the provided counter set.
    pub fn new(counters: Arc<ConnectivityCounters>) -> Self {
        Self { counters }
    }

    /// Returns the underlying counters.
    pub fn counters(&self) -> Arc<ConnectivityCounters> {
        self.counters.clone()
    }
}

impl Default for CountingEventSink {
    fn default() -> Self {
        Self::new(Arc::new(ConnectivityCounters::default()))
    }
}

impl EventSink for CountingEventSink {
    fn on_connectivity_event(&self, event: &ConnectivityEvent) {
        match event {
            ConnectivityEvent::Success => {
                self.counters.success.fetch_add(1, Ordering::Relaxed);
            }
            ConnectivityEvent::Failure(_) => {
                self.counters.failure.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Sink forwarding every event to a list of inner sinks, in order.
#[derive(Clone, Default)]
pub struct CompositeEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl CompositeEventSink {
    /// Creates a composite from the provided sinks.
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    /// Appends another sink.
    pub fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }
}

impl fmt::Debug for CompositeEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeEventSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl EventSink for CompositeEventSink {
    fn on_connectivity_event(&self, event: &ConnectivityEvent) {
        for sink in &self.sinks {
            sink.on_connectivity_event(event);
        }
    }
}

/// Logs a recovered failure and forwards it to `sink`.
///
/// DNS failures get a dedicated error line so unresolvable endpoints stand out.
pub(crate) fn report_failure(sink: &dyn EventSink, context: &str, error: &SyncError) {
    if error.is_dns_failure() {
        tracing::error!(%error, "config-center {context} failed: DNS resolution failed");
    } else {
        tracing::warn!(%error, "config-center {context} failed");
    }
    sink.on_connectivity_event(&ConnectivityEvent::failure(format!("{context}: {error}")));
}
