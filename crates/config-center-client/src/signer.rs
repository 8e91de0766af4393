//! Request signing seam.
//!
//! Signing is an external capability: the client describes each outgoing
//! request as a [`SignRequest`] and merges whatever headers the configured
//! [`RequestSigner`] returns. The query string is parsed into a multimap so
//! signers that canonicalise parameters do not need to re-parse the URL.

use std::collections::BTreeMap;
use std::fmt;

use reqwest::Url;

use crate::error::SyncError;

/// Description of an outgoing request handed to a [`RequestSigner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignRequest {
    /// HTTP method; `None` for the websocket handshake.
    pub method: Option<String>,
    /// Full request URL including the query string.
    pub endpoint: Url,
    /// Query parameters in multimap form (a key may repeat).
    pub query_params: BTreeMap<String, Vec<String>>,
    /// Non-auth headers already attached to the request.
    pub headers: BTreeMap<String, String>,
    /// Request body, empty for GET and websocket requests.
    pub content: Vec<u8>,
}

impl SignRequest {
    /// Builds a sign request, parsing the query string of `endpoint`.
    pub fn new(
        method: Option<&str>,
        endpoint: &str,
        headers: BTreeMap<String, String>,
        content: Vec<u8>,
    ) -> Result<Self, SyncError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|err| SyncError::Configuration(format!("invalid url {endpoint}: {err}")))?;
        let mut query_params: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (key, value) in endpoint.query_pairs() {
            query_params
                .entry(key.into_owned())
                .or_default()
                .push(value.into_owned());
        }
        Ok(Self {
            method: method.map(str::to_owned),
            endpoint,
            query_params,
            headers,
            content,
        })
    }
}

/// Produces authorization headers for outgoing requests.
pub trait RequestSigner: Send + Sync {
    /// Returns the headers to attach. Returned names override request defaults.
    fn sign(&self, request: &SignRequest) -> BTreeMap<String, String>;
}

/// Signer that contributes no headers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSigner;

impl RequestSigner for NoopSigner {
    fn sign(&self, _request: &SignRequest) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

impl fmt::Debug for dyn RequestSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RequestSigner")
    }
}
