//! Static configuration for the synchronization engine.
//!
//! Values are validated once, at construction. An invalid refresh mode or a
//! zero interval is a configuration error; everything else that can go wrong
//! at runtime is recovered by the engine itself.

use std::time::Duration;

use crate::error::SyncError;
use crate::http::ApiVersion;

/// Default refresh cadence (poll interval or fallback tick).
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(30_000);
/// Default delay before the first scheduled tick.
pub const DEFAULT_FIRST_REFRESH_INTERVAL: Duration = Duration::from_millis(0);
/// Default port of the watch (push) endpoint.
pub const DEFAULT_REFRESH_PORT: u16 = 30104;
/// Default bound on the bootstrap fetch.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
/// Default keep-alive period of a watch session.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(30_000);
/// Default per-request timeout; one second shorter than the startup bound.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(9_000);
/// Tenant and domain used when none is configured.
pub const DEFAULT_TENANT: &str = "default";

/// How the engine keeps the snapshot fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// Refetch on a fixed schedule.
    Poll,
    /// Keep a watch session open and react to pushed notifications.
    Push,
}

impl RefreshMode {
    /// Integer code selecting the push mode.
    pub const PUSH_CODE: i64 = 0;
    /// Integer code selecting the poll mode.
    pub const POLL_CODE: i64 = 1;

    /// Resolves the configured integer code.
    pub fn from_code(code: i64) -> Result<Self, SyncError> {
        match code {
            Self::PUSH_CODE => Ok(Self::Push),
            Self::POLL_CODE => Ok(Self::Poll),
            other => Err(SyncError::Configuration(format!(
                "refresh mode must be {} (push) or {} (poll), got {other}",
                Self::PUSH_CODE,
                Self::POLL_CODE
            ))),
        }
    }

    /// Returns a label for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Poll => "poll",
            Self::Push => "push",
        }
    }
}

/// Configuration values controlling a [`crate::SyncEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Seed endpoints (`http(s)://host:port`), tried in order.
    pub server_uris: Vec<String>,
    /// Poll or push.
    pub refresh_mode: RefreshMode,
    /// Fixed delay between scheduler ticks.
    pub refresh_interval: Duration,
    /// Delay before the first scheduler tick.
    pub first_refresh_interval: Duration,
    /// Port of the watch endpoint on the selected host.
    pub refresh_port: u16,
    /// Tenant sent as `x-domain-name`.
    pub tenant_name: String,
    /// Domain segment of the v3 API paths.
    pub domain_name: String,
    /// API flavour selecting the request paths.
    pub api_version: ApiVersion,
    /// Service identity sent as `dimensionsInfo`.
    pub service_name: String,
    /// Environment sent as `x-environment`.
    pub environment: String,
    /// Optional token sent as `X-Auth-Token`.
    pub token: Option<String>,
    /// Whether the member directory is refreshed from the authority.
    pub auto_discovery_enabled: bool,
    /// Bound on the bootstrap fetch.
    pub startup_timeout: Duration,
    /// Keep-alive period of a watch session.
    pub heartbeat_interval: Duration,
    /// Per-request timeout applied by the HTTP client.
    pub request_timeout: Duration,
    /// Skips TLS certificate validation.
    pub accept_invalid_certs: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_uris: Vec::new(),
            refresh_mode: RefreshMode::Push,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            first_refresh_interval: DEFAULT_FIRST_REFRESH_INTERVAL,
            refresh_port: DEFAULT_REFRESH_PORT,
            tenant_name: DEFAULT_TENANT.into(),
            domain_name: DEFAULT_TENANT.into(),
            api_version: ApiVersion::V3,
            service_name: String::new(),
            environment: String::new(),
            token: None,
            auto_discovery_enabled: false,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            accept_invalid_certs: false,
        }
    }
}

impl EngineConfig {
    /// Validates the configuration, normalising seed endpoints.
    pub fn validate(mut self) -> Result<Self, SyncError> {
        if self.dimensions_info().is_empty() {
            return Err(SyncError::Configuration(
                "service name must not be empty".into(),
            ));
        }
        if self.refresh_interval.is_zero() {
            return Err(SyncError::Configuration(
                "refresh interval must be greater than zero".into(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(SyncError::Configuration(
                "heartbeat interval must be greater than zero".into(),
            ));
        }
        if self.startup_timeout.is_zero() {
            return Err(SyncError::Configuration(
                "startup timeout must be greater than zero".into(),
            ));
        }

        let mut seeds = Vec::with_capacity(self.server_uris.len());
        for uri in &self.server_uris {
            let trimmed = uri.trim().trim_end_matches('/');
            if trimmed.is_empty() {
                continue;
            }
            if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
                return Err(SyncError::Configuration(format!(
                    "server uri `{trimmed}` must use http or https"
                )));
            }
            seeds.push(trimmed.to_owned());
        }
        self.server_uris = seeds;
        Ok(self)
    }

    /// Service identity with all whitespace removed, as sent in `dimensionsInfo`.
    pub fn dimensions_info(&self) -> String {
        self.service_name
            .chars()
            .filter(|ch| !ch.is_whitespace())
            .collect()
    }
}
