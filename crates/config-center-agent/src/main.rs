// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, sync::Arc};

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use config_center_client::{
    CompositeEventSink, ConfigCenterEnv, ConnectivityEvent, CountingEventSink, EventSink,
    SnapshotChange, SyncEngine, UpdateSink,
};

const LOG_LEVEL_ENV: &str = "CONFIG_CENTER_LOG_LEVEL";

/// Logs every configuration change.
struct LoggingUpdateSink;

impl UpdateSink for LoggingUpdateSink {
    fn on_snapshot_changed(&self, change: &SnapshotChange) {
        for (key, value) in &change.created {
            info!(%key, %value, "config item created");
        }
        for (key, value) in &change.updated {
            info!(%key, %value, "config item updated");
        }
        for key in &change.deleted {
            info!(%key, "config item deleted");
        }
    }
}

struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn on_connectivity_event(&self, event: &ConnectivityEvent) {
        match event {
            ConnectivityEvent::Success => debug!("config center reachable"),
            ConnectivityEvent::Failure(detail) => debug!(%detail, "config center unreachable"),
        }
    }
}

#[tokio::main]
pub async fn main() {
    let log_level = env::var(LOG_LEVEL_ENV)
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,tungstenite=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match ConfigCenterEnv::from_os_env().into_engine_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid config center configuration: {e}. Shutting down.");
            return;
        }
    };

    let counting = CountingEventSink::default();
    let counters = counting.counters();
    let sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(LoggingEventSink), Arc::new(counting)];
    let event_sink = CompositeEventSink::new(sinks);

    let engine = match SyncEngine::builder(config, Arc::new(LoggingUpdateSink))
        .event_sink(Arc::new(event_sink))
        .build()
    {
        Ok(engine) => engine,
        Err(e) => {
            error!("Unable to build config center engine: {e}. Shutting down.");
            return;
        }
    };

    let handle = engine.start().await;
    info!(
        state = engine.state().as_str(),
        revision = %engine.snapshot().revision(),
        "Config center agent started"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
    } else {
        info!("Received Ctrl+C, initiating shutdown");
    }

    handle.shutdown().await;

    match serde_json::to_string(&engine.diagnostics().await) {
        Ok(diagnostics) => info!(%diagnostics, "Config center agent stopped"),
        Err(e) => warn!("Unable to serialize diagnostics: {e}"),
    }
    info!(connectivity = %counters.snapshot(), "Connectivity summary");
}
