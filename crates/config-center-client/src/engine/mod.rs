//! Synchronization engine module facade.
//!
//! This module re-exports the engine API while wiring the submodules that
//! implement configuration, refresh scheduling, watch sessions and
//! diagnostics.

pub(crate) mod config;
mod core;
pub(crate) mod refresh;
pub(crate) mod state;
#[cfg(test)]
pub(crate) mod test_support;
pub(crate) mod watch;

pub use config::{EngineConfig, RefreshMode};
pub use self::core::{SyncEngine, SyncEngineBuilder, SyncHandle};
pub use state::{EngineSnapshot, EngineState, WatchState};
