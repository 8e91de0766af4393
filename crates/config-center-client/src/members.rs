//! Directory of config center members.
//!
//! The directory starts from the configured seed endpoints and, when
//! auto-discovery is enabled, replaces them with the live members reported by
//! the authority. A failed refresh never clears the directory: the previous
//! list and selection stay in use until a later refresh succeeds.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::SyncError;
use crate::events::{report_failure, ConnectivityEvent, EventSink};
use crate::http::HttpClient;

/// Status reported by members able to serve requests.
const STATUS_UP: &str = "UP";

#[derive(Debug, Deserialize)]
struct MembersResponse {
    #[serde(default)]
    instances: Vec<MemberInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemberInstance {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    endpoints: Vec<String>,
    #[serde(default)]
    is_https: bool,
}

#[derive(Debug, Default)]
struct DirectoryState {
    members: Vec<String>,
    selected: usize,
}

impl DirectoryState {
    fn current(&self) -> Option<&String> {
        self.members.get(self.selected)
    }
}

/// Ordered set of candidate endpoints plus the selected one.
pub struct MemberDirectory {
    http: HttpClient,
    auto_discovery: bool,
    state: RwLock<DirectoryState>,
    event_sink: Arc<dyn EventSink>,
}

impl fmt::Debug for MemberDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("MemberDirectory")
            .field("auto_discovery", &self.auto_discovery)
            .field("members", &state.members)
            .field("selected", &state.selected)
            .finish()
    }
}

impl MemberDirectory {
    /// Creates a directory seeded with `seeds`.
    pub fn new(
        http: HttpClient,
        seeds: Vec<String>,
        auto_discovery: bool,
        event_sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            http,
            auto_discovery,
            state: RwLock::new(DirectoryState {
                members: seeds,
                selected: 0,
            }),
            event_sink,
        }
    }

    /// Returns the selected endpoint.
    pub fn current(&self) -> Result<String, SyncError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.current().cloned().ok_or(SyncError::NoEndpointAvailable)
    }

    /// Returns every known member in order.
    pub fn members(&self) -> Vec<String> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .members
            .clone()
    }

    /// Selects the next member and returns it; used to fail over after a connect error.
    pub fn rotate(&self) -> Result<String, SyncError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.members.is_empty() {
            return Err(SyncError::NoEndpointAvailable);
        }
        state.selected = (state.selected + 1) % state.members.len();
        let next = state.members[state.selected].clone();
        debug!(endpoint = %next, "config-center switched member");
        Ok(next)
    }

    /// Refreshes membership from the selected endpoint.
    ///
    /// No-op when auto-discovery is disabled. Failures are logged, reported to
    /// the event sink and returned, but leave the directory untouched.
    pub async fn refresh(&self) -> Result<(), SyncError> {
        if !self.auto_discovery {
            return Ok(());
        }

        let result = match self.current() {
            Ok(endpoint) => match self.http.fetch_members(&endpoint).await {
                Ok(body) => parse_members(&body),
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };

        match result {
            Ok(members) => {
                self.replace(members);
                self.event_sink
                    .on_connectivity_event(&ConnectivityEvent::Success);
                Ok(())
            }
            Err(err) => {
                report_failure(self.event_sink.as_ref(), "refresh members", &err);
                Err(err)
            }
        }
    }

    /// Swaps in a new member list, keeping the selection when it is still a member.
    fn replace(&self, members: Vec<String>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let selected = state
            .current()
            .and_then(|current| members.iter().position(|member| member == current))
            .unwrap_or(0);
        if state.members != members {
            info!(members = ?members, "config-center membership updated");
        }
        state.members = members;
        state.selected = selected;
    }
}

/// Decodes the membership document into `http(s)://host:port` endpoints.
fn parse_members(body: &[u8]) -> Result<Vec<String>, SyncError> {
    let response: MembersResponse = serde_json::from_slice(body)
        .map_err(|err| SyncError::decode(format!("members response: {err}")))?;

    let mut members = Vec::new();
    for instance in response.instances {
        let live = instance
            .status
            .as_deref()
            .map_or(true, |status| status.eq_ignore_ascii_case(STATUS_UP));
        if !live {
            continue;
        }
        let Some(raw) = instance.endpoints.first() else {
            continue;
        };
        let endpoint = member_endpoint(raw, instance.is_https)?;
        if !members.contains(&endpoint) {
            members.push(endpoint);
        }
    }

    if members.is_empty() {
        return Err(SyncError::decode("members response lists no live member"));
    }
    Ok(members)
}

/// Rewrites a registry endpoint (`rest://host:port?params`) into a base URL.
fn member_endpoint(raw: &str, is_https: bool) -> Result<String, SyncError> {
    let without_scheme = raw.split_once("://").map_or(raw, |(_, rest)| rest);
    let authority = without_scheme
        .split(['?', '/'])
        .next()
        .unwrap_or_default();
    if authority.is_empty() {
        return Err(SyncError::decode(format!("member endpoint `{raw}` has no host")));
    }
    let scheme = if is_https { "https" } else { "http" };
    Ok(format!("{scheme}://{authority}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CountingEventSink;
    use crate::http::{ApiVersion, HttpClientOptions, RequestIdentity};
    use crate::signer::NoopSigner;
    use httptest::matchers::request;
    use httptest::{responders::status_code, Expectation, Server};
    use serde_json::json;
    use std::time::Duration;

    fn http_client() -> HttpClient {
        HttpClient::new(
            &RequestIdentity {
                tenant_name: "default".into(),
                environment: String::new(),
                token: None,
            },
            ApiVersion::V3.paths("default"),
            Arc::new(NoopSigner),
            HttpClientOptions {
                request_timeout: Duration::from_secs(2),
                accept_invalid_certs: false,
            },
        )
        .expect("client builds")
    }

    fn directory(seeds: Vec<String>, sink: &CountingEventSink) -> MemberDirectory {
        MemberDirectory::new(http_client(), seeds, true, Arc::new(sink.clone()))
    }

    fn base(server: &Server) -> String {
        server.url_str("").trim_end_matches('/').to_string()
    }

    #[test]
    fn parse_members_keeps_live_instances() {
        let body = json!({
            "instances": [
                {"status": "UP", "endpoints": ["rest://10.0.0.1:30103?sslEnabled=false"], "isHttps": false},
                {"status": "DOWN", "endpoints": ["rest://10.0.0.2:30103"]},
                {"status": "UP", "endpoints": ["rest://10.0.0.3:30103?sslEnabled=true"], "isHttps": true},
                {"endpoints": ["rest://10.0.0.4:30103/path"]}
            ]
        })
        .to_string();

        let members = parse_members(body.as_bytes()).expect("valid members");
        assert_eq!(
            members,
            vec![
                "http://10.0.0.1:30103".to_string(),
                "https://10.0.0.3:30103".to_string(),
                "http://10.0.0.4:30103".to_string(),
            ]
        );
    }

    #[test]
    fn parse_members_rejects_empty_or_malformed_bodies() {
        assert!(matches!(
            parse_members(br#"{"instances":[{"status":"DOWN","endpoints":["rest://a:1"]}]}"#),
            Err(SyncError::Decode(_))
        ));
        assert!(matches!(parse_members(b"[]"), Err(SyncError::Decode(_))));
    }

    #[test]
    fn current_fails_without_any_endpoint() {
        let sink = CountingEventSink::default();
        let directory = directory(Vec::new(), &sink);
        assert!(matches!(
            directory.current(),
            Err(SyncError::NoEndpointAvailable)
        ));
        assert!(matches!(
            directory.rotate(),
            Err(SyncError::NoEndpointAvailable)
        ));
    }

    #[test]
    fn rotate_cycles_through_members() {
        let sink = CountingEventSink::default();
        let directory = directory(vec!["http://a:1".into(), "http://b:1".into()], &sink);
        assert_eq!(directory.current().ok().as_deref(), Some("http://a:1"));
        assert_eq!(directory.rotate().ok().as_deref(), Some("http://b:1"));
        assert_eq!(directory.rotate().ok().as_deref(), Some("http://a:1"));
    }

    /// A successful refresh replaces the list and keeps the selected member when still present.
    #[tokio::test]
    async fn refresh_replaces_members_and_keeps_selection() {
        let server = Server::run();
        let seed = base(&server);
        let authority = seed.trim_start_matches("http://").to_string();
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/v3/default/configuration/members",
            ))
            .respond_with(status_code(200).body(
                json!({"instances": [
                    {"status": "UP", "endpoints": ["rest://10.9.9.9:30103"]},
                    {"status": "UP", "endpoints": [format!("rest://{authority}")]}
                ]})
                .to_string(),
            )),
        );

        let sink = CountingEventSink::default();
        let directory = directory(vec![seed.clone()], &sink);
        directory.refresh().await.expect("refresh succeeds");

        assert_eq!(
            directory.members(),
            vec!["http://10.9.9.9:30103".to_string(), seed.clone()]
        );
        assert_eq!(directory.current().ok(), Some(seed));
        assert_eq!(sink.counters().snapshot().success, 1);
    }

    /// Failed refreshes keep the previous directory and report the failure.
    #[tokio::test]
    async fn refresh_failure_keeps_previous_state() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/v3/default/configuration/members",
            ))
            .times(2)
            .respond_with(status_code(500)),
        );

        let sink = CountingEventSink::default();
        let seeds = vec![base(&server), "http://127.0.0.1:9".to_string()];
        let directory = directory(seeds.clone(), &sink);
        let before = directory.current().ok();

        assert!(matches!(
            directory.refresh().await,
            Err(SyncError::HttpStatus { status: 500, .. })
        ));
        assert!(directory.refresh().await.is_err());

        assert_eq!(directory.current().ok(), before);
        assert_eq!(directory.members(), seeds);
        assert_eq!(sink.counters().snapshot().failure, 2);
    }

    #[tokio::test]
    async fn refresh_is_noop_without_auto_discovery() {
        let sink = CountingEventSink::default();
        let directory = MemberDirectory::new(
            http_client(),
            vec!["http://127.0.0.1:9".into()],
            false,
            Arc::new(sink.clone()),
        );
        directory.refresh().await.expect("noop");
        assert_eq!(sink.counters().snapshot(), Default::default());
    }
}
