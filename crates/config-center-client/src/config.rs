//! Environment-driven helpers for bootstrapping the client.
//!
//! This module derives an [`EngineConfig`] from the host process environment.
//! Parsing is lenient (blank values fall back to defaults) while
//! [`ConfigCenterEnv::into_engine_config`] rejects values the engine cannot
//! run with.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::config::{
    DEFAULT_FIRST_REFRESH_INTERVAL, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_REFRESH_INTERVAL,
    DEFAULT_REFRESH_PORT, DEFAULT_REQUEST_TIMEOUT, DEFAULT_STARTUP_TIMEOUT, DEFAULT_TENANT,
};
use crate::engine::{EngineConfig, RefreshMode};
use crate::error::SyncError;
use crate::http::ApiVersion;

/// Comma-separated seed endpoints.
const ENV_SERVER_URI: &str = "CONFIG_CENTER_SERVER_URI";
/// Refresh mode code (`0` push, `1` poll).
const ENV_REFRESH_MODE: &str = "CONFIG_CENTER_REFRESH_MODE";
/// Scheduler period in milliseconds.
const ENV_REFRESH_INTERVAL: &str = "CONFIG_CENTER_REFRESH_INTERVAL_MS";
/// Delay before the first scheduler tick in milliseconds.
const ENV_FIRST_REFRESH_INTERVAL: &str = "CONFIG_CENTER_FIRST_REFRESH_INTERVAL_MS";
/// Watch endpoint port.
const ENV_REFRESH_PORT: &str = "CONFIG_CENTER_REFRESH_PORT";
/// Tenant sent as `x-domain-name`.
const ENV_TENANT_NAME: &str = "CONFIG_CENTER_TENANT_NAME";
/// Domain segment of the v3 paths.
const ENV_DOMAIN_NAME: &str = "CONFIG_CENTER_DOMAIN_NAME";
/// API version (`v2` or `v3`).
const ENV_API_VERSION: &str = "CONFIG_CENTER_API_VERSION";
/// Service identity sent as `dimensionsInfo`.
const ENV_SERVICE_NAME: &str = "CONFIG_CENTER_SERVICE_NAME";
/// Environment sent as `x-environment`.
const ENV_ENVIRONMENT: &str = "CONFIG_CENTER_ENVIRONMENT";
/// Optional auth token.
const ENV_TOKEN: &str = "CONFIG_CENTER_TOKEN";
/// Enables member auto-discovery.
const ENV_AUTO_DISCOVERY: &str = "CONFIG_CENTER_AUTO_DISCOVERY_ENABLED";
/// Bootstrap fetch bound in milliseconds.
const ENV_STARTUP_TIMEOUT: &str = "CONFIG_CENTER_STARTUP_TIMEOUT_MS";
/// Heartbeat period in milliseconds.
const ENV_HEARTBEAT_INTERVAL: &str = "CONFIG_CENTER_HEARTBEAT_INTERVAL_MS";
/// Per-request timeout in milliseconds.
const ENV_REQUEST_TIMEOUT: &str = "CONFIG_CENTER_REQUEST_TIMEOUT_MS";
/// Skips TLS certificate validation.
const ENV_ACCEPT_INVALID_CERTS: &str = "CONFIG_CENTER_ACCEPT_INVALID_CERTS";

/// Captures environment-derived options, still unvalidated.
#[derive(Debug, Clone, Default)]
pub struct ConfigCenterEnv {
    /// Seed endpoints.
    pub server_uris: Vec<String>,
    /// Raw refresh mode code.
    pub refresh_mode: Option<String>,
    /// Raw refresh interval.
    pub refresh_interval_ms: Option<String>,
    /// Raw first refresh delay.
    pub first_refresh_interval_ms: Option<String>,
    /// Raw watch port.
    pub refresh_port: Option<String>,
    /// Tenant name.
    pub tenant_name: Option<String>,
    /// Domain name.
    pub domain_name: Option<String>,
    /// API version.
    pub api_version: Option<String>,
    /// Service identity.
    pub service_name: Option<String>,
    /// Environment.
    pub environment: Option<String>,
    /// Auth token.
    pub token: Option<String>,
    /// Whether member auto-discovery is enabled. Defaults to `false`.
    pub auto_discovery_enabled: bool,
    /// Raw startup timeout.
    pub startup_timeout_ms: Option<String>,
    /// Raw heartbeat interval.
    pub heartbeat_interval_ms: Option<String>,
    /// Raw request timeout.
    pub request_timeout_ms: Option<String>,
    /// Whether TLS certificate validation should be skipped.
    pub accept_invalid_certs: bool,
}

impl ConfigCenterEnv {
    /// Builds settings from the current process environment.
    pub fn from_os_env() -> Self {
        Self::from_env_iter(env::vars())
    }

    /// Builds settings from an iterator of key/value pairs (typically for tests).
    pub fn from_env_iter<I, K, V>(iter: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let get = |key: &str| map.get(key).and_then(|value| sanitize_non_empty(value));

        let server_uris = get(ENV_SERVER_URI)
            .map(|value| {
                value
                    .split(',')
                    .filter_map(sanitize_non_empty)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            server_uris,
            refresh_mode: get(ENV_REFRESH_MODE),
            refresh_interval_ms: get(ENV_REFRESH_INTERVAL),
            first_refresh_interval_ms: get(ENV_FIRST_REFRESH_INTERVAL),
            refresh_port: get(ENV_REFRESH_PORT),
            tenant_name: get(ENV_TENANT_NAME),
            domain_name: get(ENV_DOMAIN_NAME),
            api_version: get(ENV_API_VERSION),
            service_name: get(ENV_SERVICE_NAME),
            environment: get(ENV_ENVIRONMENT),
            token: get(ENV_TOKEN),
            auto_discovery_enabled: parse_bool(
                map.get(ENV_AUTO_DISCOVERY).map(String::as_str),
                false,
            ),
            startup_timeout_ms: get(ENV_STARTUP_TIMEOUT),
            heartbeat_interval_ms: get(ENV_HEARTBEAT_INTERVAL),
            request_timeout_ms: get(ENV_REQUEST_TIMEOUT),
            accept_invalid_certs: parse_bool(
                map.get(ENV_ACCEPT_INVALID_CERTS).map(String::as_str),
                false,
            ),
        }
    }

    /// Converts the captured settings into a validated [`EngineConfig`].
    pub fn into_engine_config(self) -> Result<EngineConfig, SyncError> {
        let refresh_mode = match &self.refresh_mode {
            Some(raw) => RefreshMode::from_code(parse_number(ENV_REFRESH_MODE, raw)?)?,
            None => RefreshMode::Push,
        };
        let api_version = match &self.api_version {
            Some(raw) => ApiVersion::parse(raw)?,
            None => ApiVersion::V3,
        };

        let config = EngineConfig {
            server_uris: self.server_uris,
            refresh_mode,
            refresh_interval: parse_millis(
                ENV_REFRESH_INTERVAL,
                self.refresh_interval_ms.as_deref(),
                DEFAULT_REFRESH_INTERVAL,
            )?,
            first_refresh_interval: parse_millis(
                ENV_FIRST_REFRESH_INTERVAL,
                self.first_refresh_interval_ms.as_deref(),
                DEFAULT_FIRST_REFRESH_INTERVAL,
            )?,
            refresh_port: match &self.refresh_port {
                Some(raw) => parse_number(ENV_REFRESH_PORT, raw)?,
                None => DEFAULT_REFRESH_PORT,
            },
            tenant_name: self.tenant_name.unwrap_or_else(|| DEFAULT_TENANT.into()),
            domain_name: self.domain_name.unwrap_or_else(|| DEFAULT_TENANT.into()),
            api_version,
            service_name: self.service_name.unwrap_or_default(),
            environment: self.environment.unwrap_or_default(),
            token: self.token,
            auto_discovery_enabled: self.auto_discovery_enabled,
            startup_timeout: parse_millis(
                ENV_STARTUP_TIMEOUT,
                self.startup_timeout_ms.as_deref(),
                DEFAULT_STARTUP_TIMEOUT,
            )?,
            heartbeat_interval: parse_millis(
                ENV_HEARTBEAT_INTERVAL,
                self.heartbeat_interval_ms.as_deref(),
                DEFAULT_HEARTBEAT_INTERVAL,
            )?,
            request_timeout: parse_millis(
                ENV_REQUEST_TIMEOUT,
                self.request_timeout_ms.as_deref(),
                DEFAULT_REQUEST_TIMEOUT,
            )?,
            accept_invalid_certs: self.accept_invalid_certs,
        };
        config.validate()
    }
}

/// Helper trimming whitespace and discarding empty values.
fn sanitize_non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Parses boolean values from strings, falling back to the provided default.
fn parse_bool(value: Option<&str>, default: bool) -> bool {
    match value.map(|s| s.trim().to_ascii_lowercase()) {
        // Accept the common set of truthy strings.
        Some(ref v) if ["1", "true", "t", "yes", "y"].contains(&v.as_str()) => true,
        // Accept the common set of falsy strings.
        Some(ref v) if ["0", "false", "f", "no", "n"].contains(&v.as_str()) => false,
        // Fall back to the supplied default when the input is absent or ambiguous.
        _ => default,
    }
}

fn parse_number<T: FromStr>(name: &str, raw: &str) -> Result<T, SyncError> {
    raw.parse()
        .map_err(|_| SyncError::Configuration(format!("{name} must be a number, got `{raw}`")))
}

fn parse_millis(name: &str, raw: Option<&str>, default: Duration) -> Result<Duration, SyncError> {
    match raw {
        Some(raw) => parse_number(name, raw).map(Duration::from_millis),
        None => Ok(default),
    }
}
