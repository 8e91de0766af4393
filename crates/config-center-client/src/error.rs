//! Error taxonomy shared by every synchronization component.
//!
//! Runtime failures (connect, status, decode, timeout) are recovered locally
//! by the engine and surfaced through logs and the [`crate::EventSink`]; only
//! [`SyncError::Configuration`] escapes to the host, and only at construction.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Boxed error used to carry transport causes without leaking their concrete types.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Distinguishes name-resolution failures from other connect failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectErrorKind {
    /// The endpoint host name could not be resolved.
    DnsResolution,
    /// Any other transport-level failure (refused, reset, TLS, handshake).
    Other,
}

impl fmt::Display for ConnectErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DnsResolution => f.write_str("dns resolution"),
            Self::Other => f.write_str("transport"),
        }
    }
}

/// Errors produced while synchronizing with the config center.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The endpoint could not be reached.
    #[error("failed to connect to {endpoint} ({kind}): {source}")]
    Connect {
        /// Endpoint the request targeted.
        endpoint: String,
        /// Sub-kind used to emit dedicated DNS diagnostics.
        kind: ConnectErrorKind,
        /// Underlying transport error.
        #[source]
        source: BoxError,
    },
    /// The authority answered with a status other than 200/304.
    #[error("unexpected status {status} from {endpoint}")]
    HttpStatus {
        /// Endpoint the request targeted.
        endpoint: String,
        /// Returned HTTP status code.
        status: u16,
    },
    /// Payload could not be interpreted.
    #[error("malformed payload: {0}")]
    Decode(String),
    /// Operation did not complete within its bound.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    /// Invalid construction input; the only fatal error kind.
    #[error("invalid configuration: {0}")]
    Configuration(String),
    /// No seed endpoint was configured and membership was never resolved.
    #[error("no config center endpoint available")]
    NoEndpointAvailable,
}

impl SyncError {
    /// Builds a connect error, classifying name-resolution failures by walking the source chain.
    pub fn connect<E>(endpoint: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        let source = source.into();
        let kind = if is_dns_failure(&*source) {
            ConnectErrorKind::DnsResolution
        } else {
            ConnectErrorKind::Other
        };
        Self::Connect {
            endpoint: endpoint.into(),
            kind,
            source,
        }
    }

    /// Builds a decode error from any displayable cause.
    pub fn decode(detail: impl fmt::Display) -> Self {
        Self::Decode(detail.to_string())
    }

    /// Returns `true` when the error is a DNS resolution failure.
    pub fn is_dns_failure(&self) -> bool {
        matches!(
            self,
            Self::Connect {
                kind: ConnectErrorKind::DnsResolution,
                ..
            }
        )
    }

    /// Returns `true` for connect-level failures that justify failing over to another member.
    pub fn is_connect(&self) -> bool {
        matches!(self, Self::Connect { .. })
    }
}

/// Inspects an error chain for the resolver messages emitted by hyper and tungstenite.
fn is_dns_failure(error: &(dyn StdError + 'static)) -> bool {
    const DNS_MARKERS: [&str; 5] = [
        "dns error",
        "failed to lookup address",
        "name or service not known",
        "no such host",
        "nodename nor servname",
    ];

    let mut current: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(err) = current {
        let message = err.to_string().to_ascii_lowercase();
        if DNS_MARKERS.iter().any(|marker| message.contains(marker)) {
            return true;
        }
        current = err.source();
    }
    false
}
