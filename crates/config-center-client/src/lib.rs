//! Public entry points for the config center client crate.
//!
//! The crate keeps a local configuration snapshot consistent with a remote
//! config center, either by polling or through a websocket push channel.
//! Hosts construct a [`SyncEngine`] from an [`EngineConfig`] (usually derived
//! via [`ConfigCenterEnv`]), register an [`UpdateSink`], and drive the engine
//! through the [`SyncHandle`] returned by `start`.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod http;
pub mod members;
pub mod signer;
pub mod snapshot;

pub use config::ConfigCenterEnv;
pub use engine::{
    EngineConfig, EngineSnapshot, EngineState, RefreshMode, SyncEngine, SyncEngineBuilder,
    SyncHandle, WatchState,
};
pub use error::{ConnectErrorKind, SyncError};
pub use events::{
    CompositeEventSink, ConnectivityCounters, ConnectivityEvent, ConnectivitySnapshot,
    CountingEventSink, EventSink, NoopEventSink,
};
pub use http::{ApiPaths, ApiVersion, FetchOutcome, HttpClient, HttpClientOptions, RequestIdentity};
pub use members::MemberDirectory;
pub use signer::{NoopSigner, RequestSigner, SignRequest};
pub use snapshot::{ConfigItems, NoopUpdateSink, Snapshot, SnapshotChange, SnapshotStore, UpdateSink};
