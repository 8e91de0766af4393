//! HTTP client utilities for the config center.
//!
//! The client is built once and shared by every component of an engine. It
//! owns the identity headers (tenant, environment, token), merges the headers
//! returned by the configured [`RequestSigner`] into each request, classifies
//! response statuses and builds the websocket handshake used by watch
//! sessions.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Client, Method, StatusCode, Url};
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest,
    http::{
        header::{HeaderName as WsHeaderName, HeaderValue as WsHeaderValue},
        Request as WsRequest,
    },
};
use tracing::debug;

use crate::engine::EngineConfig;
use crate::error::SyncError;
use crate::signer::{RequestSigner, SignRequest};
use crate::snapshot::Snapshot;

/// Header carrying the tenant.
const HEADER_TENANT: &str = "x-domain-name";
/// Header carrying the deployment environment.
const HEADER_ENVIRONMENT: &str = "x-environment";
/// Header carrying the optional auth token.
const HEADER_AUTH_TOKEN: &str = "x-auth-token";
/// Query parameter carrying the service identity.
const QUERY_DIMENSIONS: &str = "dimensionsInfo";
/// Query parameter carrying the last applied revision.
const QUERY_REVISION: &str = "revision";

/// API flavour exposed by the config center.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVersion {
    /// Legacy unscoped paths.
    V2,
    /// Domain-scoped paths.
    V3,
}

impl ApiVersion {
    /// Parses `v2`/`v3` (case-insensitive).
    pub fn parse(value: &str) -> Result<Self, SyncError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "v2" => Ok(Self::V2),
            "v3" => Ok(Self::V3),
            other => Err(SyncError::Configuration(format!(
                "unsupported api version `{other}`"
            ))),
        }
    }

    /// Resolves the request paths for `domain`.
    pub fn paths(&self, domain: &str) -> ApiPaths {
        match self {
            Self::V2 => ApiPaths {
                items: "/configuration/items".into(),
                members: "/members".into(),
                refresh_items: "/configuration/refresh/items".into(),
            },
            Self::V3 => ApiPaths {
                items: format!("/v3/{domain}/configuration/items"),
                members: format!("/v3/{domain}/configuration/members"),
                refresh_items: format!("/v3/{domain}/configuration/refresh/items"),
            },
        }
    }
}

/// Request paths used against every member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiPaths {
    /// Full fetch path.
    pub items: String,
    /// Membership path.
    pub members: String,
    /// Watch (websocket) path.
    pub refresh_items: String,
}

/// Identity attached to every request.
#[derive(Debug, Clone, Default)]
pub struct RequestIdentity {
    /// Tenant sent as `x-domain-name`.
    pub tenant_name: String,
    /// Environment sent as `x-environment`.
    pub environment: String,
    /// Optional `X-Auth-Token`.
    pub token: Option<String>,
}

/// Options governing how the underlying `reqwest::Client` is built.
#[derive(Debug, Clone, Copy)]
pub struct HttpClientOptions {
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Whether TLS certificate validation should be skipped.
    pub accept_invalid_certs: bool,
}

impl Default for HttpClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: crate::engine::config::DEFAULT_REQUEST_TIMEOUT,
            accept_invalid_certs: false,
        }
    }
}

/// Result of a full fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// The authority returned a new snapshot.
    Modified(Snapshot),
    /// The stored revision is current.
    NotModified,
}

/// Success statuses understood by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseStatus {
    Ok,
    NotModified,
}

/// HTTP client shared by the directory, the fetch path and watch sessions.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    paths: ApiPaths,
    headers: HeaderMap,
    signer: Arc<dyn RequestSigner>,
    request_timeout: Duration,
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("paths", &self.paths)
            .field("headers", &redact_headers(&self.headers))
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl HttpClient {
    /// Builds a client from its identity, paths and signer.
    pub fn new(
        identity: &RequestIdentity,
        paths: ApiPaths,
        signer: Arc<dyn RequestSigner>,
        options: HttpClientOptions,
    ) -> Result<Self, SyncError> {
        let mut headers = HeaderMap::new();
        let user_agent = format!("config-center-client/{}", env!("CARGO_PKG_VERSION"));
        headers.insert(USER_AGENT, header_value(&user_agent)?);
        headers.insert(HEADER_TENANT, header_value(&identity.tenant_name)?);
        headers.insert(HEADER_ENVIRONMENT, header_value(&identity.environment)?);
        // The token is optional; omit the header entirely rather than sending a blank value.
        if let Some(token) = &identity.token {
            headers.insert(HEADER_AUTH_TOKEN, header_value(token)?);
        }

        let client = Client::builder()
            .timeout(options.request_timeout)
            .danger_accept_invalid_certs(options.accept_invalid_certs)
            .build()
            .map_err(|err| SyncError::Configuration(format!("http client: {err}")))?;

        Ok(Self {
            client,
            paths,
            headers,
            signer,
            request_timeout: options.request_timeout,
        })
    }

    /// Builds a client from engine configuration.
    pub fn from_config(
        config: &EngineConfig,
        signer: Arc<dyn RequestSigner>,
    ) -> Result<Self, SyncError> {
        let identity = RequestIdentity {
            tenant_name: config.tenant_name.clone(),
            environment: config.environment.clone(),
            token: config.token.clone(),
        };
        let options = HttpClientOptions {
            request_timeout: config.request_timeout,
            accept_invalid_certs: config.accept_invalid_certs,
        };
        Self::new(
            &identity,
            config.api_version.paths(&config.domain_name),
            signer,
            options,
        )
    }

    /// Returns the request paths in use.
    pub fn paths(&self) -> &ApiPaths {
        &self.paths
    }

    /// Fetches the full configuration for `dimensions_info` from `endpoint`.
    pub async fn fetch_items(
        &self,
        endpoint: &str,
        dimensions_info: &str,
        revision: &str,
    ) -> Result<FetchOutcome, SyncError> {
        let mut url = endpoint_url(endpoint, &self.paths.items)?;
        url.query_pairs_mut()
            .append_pair(QUERY_DIMENSIONS, dimensions_info)
            .append_pair(QUERY_REVISION, revision);

        let (status, body) = self.get(endpoint, url).await?;
        match status {
            ResponseStatus::Ok => Ok(FetchOutcome::Modified(Snapshot::from_items_response(
                &body,
            )?)),
            ResponseStatus::NotModified => Ok(FetchOutcome::NotModified),
        }
    }

    /// Fetches the raw membership document from `endpoint`.
    pub async fn fetch_members(&self, endpoint: &str) -> Result<Vec<u8>, SyncError> {
        let url = endpoint_url(endpoint, &self.paths.members)?;
        match self.get(endpoint, url).await? {
            (ResponseStatus::Ok, body) => Ok(body),
            (ResponseStatus::NotModified, _) => Err(SyncError::HttpStatus {
                endpoint: endpoint.to_owned(),
                status: StatusCode::NOT_MODIFIED.as_u16(),
            }),
        }
    }

    /// Builds the websocket handshake for a watch session against `endpoint`.
    ///
    /// The scheme follows the endpoint (`http` to `ws`, `https` to `wss`), the
    /// port is replaced by `refresh_port`, and the identity plus signed headers
    /// are copied onto the handshake request.
    pub fn watch_request(
        &self,
        endpoint: &str,
        refresh_port: u16,
        dimensions_info: &str,
    ) -> Result<WsRequest<()>, SyncError> {
        let mut url = endpoint_url(endpoint, &self.paths.refresh_items)?;
        let target_scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(target_scheme)
            .map_err(|_| invalid_endpoint(endpoint, "cannot switch to websocket scheme"))?;
        url.set_port(Some(refresh_port))
            .map_err(|_| invalid_endpoint(endpoint, "cannot set refresh port"))?;
        url.query_pairs_mut()
            .append_pair(QUERY_DIMENSIONS, dimensions_info);

        let headers = self.signed_headers(None, &url)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| invalid_endpoint(endpoint, err))?;
        {
            let request_headers = request.headers_mut();
            for (name, value) in headers.iter() {
                let header_name = WsHeaderName::from_bytes(name.as_str().as_bytes())
                    .map_err(|err| invalid_endpoint(endpoint, err))?;
                let header_value = WsHeaderValue::from_bytes(value.as_bytes())
                    .map_err(|err| invalid_endpoint(endpoint, err))?;
                request_headers.insert(header_name, header_value);
            }
        }
        Ok(request)
    }

    /// Attaches identity and signed headers, sends a GET and classifies the status.
    async fn get(
        &self,
        endpoint: &str,
        url: Url,
    ) -> Result<(ResponseStatus, Vec<u8>), SyncError> {
        let headers = self.signed_headers(Some(Method::GET.as_str()), &url)?;
        debug!(
            method = %Method::GET,
            url = %url,
            headers = ?redact_headers(&headers),
            "config-center HTTP request"
        );

        let response = self
            .client
            .get(url.clone())
            .headers(headers)
            .send()
            .await
            .map_err(|err| self.transport_error(endpoint, err))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| self.transport_error(endpoint, err))?;
        debug!(
            url = %url,
            status = %status,
            content_length = body.len(),
            "config-center HTTP response"
        );

        let classified = classify_status(endpoint, status)?;
        Ok((classified, body.to_vec()))
    }

    /// Returns the identity headers merged with the signer output for `url`.
    fn signed_headers(&self, method: Option<&str>, url: &Url) -> Result<HeaderMap, SyncError> {
        let mut headers = self.headers.clone();
        let plain: BTreeMap<String, String> = headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_owned(), value.to_owned()))
            })
            .collect();
        let request = SignRequest::new(method, url.as_str(), plain, Vec::new())?;
        for (name, value) in self.signer.sign(&request) {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| SyncError::decode(format!("signer header `{name}`: {err}")))?;
            let header_value = HeaderValue::from_str(&value)
                .map_err(|err| SyncError::decode(format!("signer header `{name}`: {err}")))?;
            headers.insert(header_name, header_value);
        }
        Ok(headers)
    }

    fn transport_error(&self, endpoint: &str, err: reqwest::Error) -> SyncError {
        if err.is_timeout() {
            SyncError::Timeout(self.request_timeout)
        } else {
            SyncError::connect(endpoint, err)
        }
    }
}

/// Maps a response status onto the fetch taxonomy.
fn classify_status(endpoint: &str, status: StatusCode) -> Result<ResponseStatus, SyncError> {
    match status {
        StatusCode::OK => Ok(ResponseStatus::Ok),
        StatusCode::NOT_MODIFIED => Ok(ResponseStatus::NotModified),
        other => Err(SyncError::HttpStatus {
            endpoint: endpoint.to_owned(),
            status: other.as_u16(),
        }),
    }
}

/// Joins `path` onto an endpoint base URL.
fn endpoint_url(endpoint: &str, path: &str) -> Result<Url, SyncError> {
    let mut url =
        Url::parse(endpoint).map_err(|err| invalid_endpoint(endpoint, err))?;
    let base = url.path().trim_end_matches('/').to_owned();
    url.set_path(&format!("{base}{path}"));
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// Endpoints are only known at runtime, so a bad one counts as unreachable and
/// lets the directory fail over.
fn invalid_endpoint(endpoint: &str, detail: impl fmt::Display) -> SyncError {
    SyncError::connect(endpoint, format!("invalid endpoint: {detail}"))
}

fn header_value(value: &str) -> Result<HeaderValue, SyncError> {
    HeaderValue::from_str(value)
        .map_err(|err| SyncError::Configuration(format!("invalid header value: {err}")))
}

/// Returns a redacted view of request headers suitable for debug logging.
fn redact_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    const VISIBLE_HEADERS: [&str; 3] = ["user-agent", HEADER_TENANT, HEADER_ENVIRONMENT];

    headers
        .iter()
        .map(|(name, value)| {
            let lower = name.as_str().to_ascii_lowercase();
            // Signer output is never known up front, so anything outside the identity set is hidden.
            let display = if VISIBLE_HEADERS.contains(&lower.as_str()) {
                value
                    .to_str()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|_| "<non-utf8>".to_string())
            } else {
                "<redacted>".to_string()
            };
            (lower, display)
        })
        .collect()
}
