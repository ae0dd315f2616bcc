//! Typed verbs over the GitLab REST surface.
//!
//! Every remote interaction goes through [`Api::call`] with a [`Command`]
//! value. The HTTP layer sits behind the [`HttpTransport`] trait so the unit
//! tests can script responses without a server.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::{Map, Value};
use tracing::debug;

/// Hard ceiling for a single request. Slow enough to never trip in practice,
/// short enough to not hang forever: the bot is expected to run under a
/// restart supervisor, so a transport timeout crashes the sweep.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }
}

/// One REST call: verb, endpoint below `/api/v4`, and arguments.
///
/// GET arguments travel as query parameters (booleans rendered `true`/
/// `false`), everything else as a JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub method: Method,
    pub endpoint: String,
    pub args: Map<String, Value>,
}

impl Command {
    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(Method::Get, endpoint)
    }

    pub fn put(endpoint: impl Into<String>) -> Self {
        Self::new(Method::Put, endpoint)
    }

    pub fn post(endpoint: impl Into<String>) -> Self {
        Self::new(Method::Post, endpoint)
    }

    pub fn delete(endpoint: impl Into<String>) -> Self {
        Self::new(Method::Delete, endpoint)
    }

    fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            args: Map::new(),
        }
    }

    pub fn arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }

    fn for_page(&self, page: u64) -> Command {
        self.clone()
            .arg("page", page)
            .arg("per_page", 100)
    }

    fn query_pairs(&self) -> Vec<(String, String)> {
        self.args
            .iter()
            .map(|(key, value)| (key.clone(), render_query_value(value)))
            .collect()
    }
}

fn render_query_value(value: &Value) -> String {
    match value {
        Value::Bool(true) => "true".to_string(),
        Value::Bool(false) => "false".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A request as handed to the transport, fully assembled.
#[derive(Debug)]
pub struct HttpRequest<'a> {
    pub method: Method,
    pub url: &'a str,
    pub headers: &'a [(String, String)],
    pub query: &'a [(String, String)],
    pub body: Option<&'a Value>,
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

pub trait HttpTransport: Send + Sync {
    fn send(&self, request: &HttpRequest<'_>) -> Result<RawResponse>;
}

/// Production transport over a blocking `ureq` agent.
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new() -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build(),
        }
    }
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport for UreqTransport {
    fn send(&self, request: &HttpRequest<'_>) -> Result<RawResponse> {
        let mut req = self.agent.request(request.method.as_str(), request.url);
        for (name, value) in request.headers {
            req = req.set(name, value);
        }
        for (name, value) in request.query {
            req = req.query(name, value);
        }

        let result = match request.body {
            Some(body) => req.send_json(body.clone()),
            None => req.call(),
        };

        let response = match result {
            Ok(response) => response,
            // Non-2xx still carries a body we want to map to the error
            // taxonomy; only transport-level failures are fatal here.
            Err(ureq::Error::Status(_, response)) => response,
            Err(err) => return Err(anyhow!(err)).context("HTTP transport failure"),
        };

        let status = response.status();
        let body = response
            .into_string()
            .context("failed to read response body")?;
        Ok(RawResponse { status, body })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    NotAcceptable,
    Conflict,
    Unprocessable,
    InternalServerError,
    Unexpected,
}

impl FailureKind {
    fn for_status(status: u16) -> FailureKind {
        match status {
            400 => FailureKind::BadRequest,
            401 => FailureKind::Unauthorized,
            403 => FailureKind::Forbidden,
            404 => FailureKind::NotFound,
            405 => FailureKind::MethodNotAllowed,
            406 => FailureKind::NotAcceptable,
            409 => FailureKind::Conflict,
            422 => FailureKind::Unprocessable,
            500..=599 => FailureKind::InternalServerError,
            _ => FailureKind::Unexpected,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{kind:?} ({status}): {message}")]
    Failure {
        kind: FailureKind,
        status: u16,
        message: String,
    },
    #[error("transport failure: {0}")]
    Transport(anyhow::Error),
}

impl ApiError {
    fn failure(status: u16, body: &str) -> ApiError {
        let message = match serde_json::from_str::<Value>(body) {
            Ok(Value::Object(fields)) => match fields.get("message") {
                Some(Value::String(message)) => message.clone(),
                Some(other) => other.to_string(),
                None => body.trim().to_string(),
            },
            _ => body.trim().to_string(),
        };
        ApiError::Failure {
            kind: FailureKind::for_status(status),
            status,
            message,
        }
    }

    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            ApiError::Failure { kind, .. } => Some(*kind),
            ApiError::Transport(_) => None,
        }
    }

    /// The server-side `message` payload, when the failure carried one.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            ApiError::Failure { message, .. } => Some(message),
            ApiError::Transport(_) => None,
        }
    }
}

/// Handle on one GitLab instance: base URL, token, probed version.
#[derive(Clone)]
pub struct Api {
    base_url: String,
    auth_token: String,
    transport: Arc<dyn HttpTransport>,
    version: Arc<OnceLock<Version>>,
}

impl std::fmt::Debug for Api {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Api")
            .field("base_url", &self.base_url)
            .field("auth_token", &"<redacted>")
            .field("version", &self.version)
            .finish()
    }
}

impl Api {
    pub fn new(gitlab_url: &str, auth_token: &str, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            base_url: format!("{}/api/v4", gitlab_url.trim_end_matches('/')),
            auth_token: auth_token.to_string(),
            transport,
            version: Arc::new(OnceLock::new()),
        }
    }

    pub fn call(&self, command: &Command) -> Result<Value, ApiError> {
        self.call_inner(command, None)
    }

    /// Like [`Api::call`] but impersonating `sudo_uid` via the `SUDO` header.
    pub fn call_sudo(&self, command: &Command, sudo_uid: u64) -> Result<Value, ApiError> {
        self.call_inner(command, Some(sudo_uid))
    }

    fn call_inner(&self, command: &Command, sudo: Option<u64>) -> Result<Value, ApiError> {
        let url = format!("{}{}", self.base_url, command.endpoint);
        let mut headers = vec![("PRIVATE-TOKEN".to_string(), self.auth_token.clone())];
        if let Some(uid) = sudo {
            headers.push(("SUDO".to_string(), uid.to_string()));
        }

        let (query, body): (Vec<(String, String)>, Option<Value>) = match command.method {
            Method::Get => (command.query_pairs(), None),
            _ => (Vec::new(), Some(Value::Object(command.args.clone()))),
        };

        debug!(
            method = command.method.as_str(),
            endpoint = %command.endpoint,
            sudo = ?sudo,
            "REQUEST"
        );
        let response = self
            .transport
            .send(&HttpRequest {
                method: command.method,
                url: &url,
                headers: &headers,
                query: &query,
                body: body.as_ref(),
            })
            .map_err(ApiError::Transport)?;
        debug!(status = response.status, "RESPONSE");

        match response.status {
            202 | 204 => Ok(Value::Bool(true)),
            304 => Ok(Value::Bool(false)),
            status if status < 300 => {
                if response.body.trim().is_empty() {
                    return Ok(Value::Null);
                }
                serde_json::from_str(&response.body).map_err(|err| {
                    ApiError::Transport(anyhow!(err).context("failed to decode response JSON"))
                })
            }
            status => Err(ApiError::failure(status, &response.body)),
        }
    }

    /// GET `command` page by page (`per_page=100`) until the first empty
    /// page, concatenating the bodies in order.
    pub fn collect_all_pages(&self, command: &Command) -> Result<Vec<Value>> {
        assert!(command.method == Method::Get, "pagination is GET-only");
        let mut collected = Vec::new();
        for page in 1.. {
            let response = self.call(&command.for_page(page))?;
            let Value::Array(items) = response else {
                bail!("expected a list from {}, got: {response}", command.endpoint);
            };
            if items.is_empty() {
                break;
            }
            collected.extend(items);
        }
        Ok(collected)
    }

    pub fn version(&self) -> Result<Version> {
        if let Some(version) = self.version.get() {
            return Ok(version.clone());
        }
        let response = self.call(&Command::get("/version"))?;
        let raw = response
            .get("version")
            .and_then(Value::as_str)
            .context("/version response did not carry a version string")?;
        let parsed = Version::parse(raw)?;
        Ok(self.version.get_or_init(|| parsed).clone())
    }
}

/// Validate that `value` is a list of at most one element and yield it.
pub fn from_singleton_list(value: Value) -> Result<Option<Value>> {
    let Value::Array(mut items) = value else {
        bail!("expected a list response, got: {value}");
    };
    if items.len() > 1 {
        bail!("expected at most one element, got {}", items.len());
    }
    Ok(items.pop())
}

/// Server version as probed from `GET /version`, e.g. `13.2.0-ee`.
///
/// Feature gates (endpoint shapes, approval availability) hang off this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub release: Vec<u64>,
    pub edition: Option<String>,
}

impl Version {
    pub fn parse(string: &str) -> Result<Version> {
        let (release_string, edition) = match string.split_once('-') {
            Some((release, edition)) => (release, Some(edition.to_string())),
            None => (string, None),
        };
        let release = release_string
            .split('.')
            .map(|number| {
                number
                    .parse::<u64>()
                    .with_context(|| format!("bad version component {number:?} in {string:?}"))
            })
            .collect::<Result<Vec<u64>>>()?;
        Ok(Version { release, edition })
    }

    pub fn is_ee(&self) -> bool {
        self.edition.as_deref() == Some("ee")
    }

    /// Tuple comparison, so `9.2 < 9.2.2 < 9.3`.
    pub fn at_least(&self, wanted: &[u64]) -> bool {
        self.release.as_slice() >= wanted
    }

    // Capability table. Each endpoint variant the bot cares about is a
    // predicate here instead of a version comparison at the call site.

    /// 9.2.2 fixed the v4 notes/approvals endpoints to address merge
    /// requests by `iid`; before that they wanted the global `id`.
    pub fn mr_endpoints_use_iid(&self) -> bool {
        self.at_least(&[9, 2, 2])
    }

    /// Pipelines can be listed per merge request from 10.5.0.
    pub fn has_mr_pipelines(&self) -> bool {
        self.at_least(&[10, 5, 0])
    }

    /// `min_access_level` on the project listing exists from 11.2.
    pub fn has_min_access_level(&self) -> bool {
        self.at_least(&[11, 2])
    }

    /// Approvals are an EE feature until 13.2, CE from there on.
    pub fn has_approvals(&self) -> bool {
        self.is_ee() || self.at_least(&[13, 2, 0])
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let release = self
            .release
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(".");
        match &self.edition {
            Some(edition) => write!(f, "{release}-{edition}"),
            None => write!(f, "{release}"),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Debug, Clone)]
    pub(crate) struct SentRequest {
        pub(crate) method: Method,
        pub(crate) url: String,
        pub(crate) headers: Vec<(String, String)>,
        pub(crate) query: Vec<(String, String)>,
        pub(crate) body: Option<Value>,
    }

    impl SentRequest {
        pub(crate) fn path(&self) -> &str {
            self.url
                .strip_prefix("https://gitlab.example.com/api/v4")
                .unwrap_or(&self.url)
        }

        pub(crate) fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(header, _)| header == name)
                .map(|(_, value)| value.as_str())
        }

        pub(crate) fn query_value(&self, name: &str) -> Option<&str> {
            self.query
                .iter()
                .find(|(param, _)| param == name)
                .map(|(_, value)| value.as_str())
        }
    }

    #[derive(Default)]
    pub(crate) struct MockTransport {
        calls: Mutex<Vec<SentRequest>>,
        replies: Mutex<VecDeque<RawResponse>>,
    }

    impl MockTransport {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn reply(self: &Arc<Self>, status: u16, body: &str) -> Arc<Self> {
            self.replies.lock().unwrap().push_back(RawResponse {
                status,
                body: body.to_string(),
            });
            Arc::clone(self)
        }

        pub(crate) fn calls(&self) -> Vec<SentRequest> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl HttpTransport for MockTransport {
        fn send(&self, request: &HttpRequest<'_>) -> Result<RawResponse> {
            self.calls.lock().unwrap().push(SentRequest {
                method: request.method,
                url: request.url.to_string(),
                headers: request.headers.to_vec(),
                query: request.query.to_vec(),
                body: request.body.cloned(),
            });
            match self.replies.lock().unwrap().pop_front() {
                Some(reply) => Ok(reply),
                None => bail!("mock transport exhausted"),
            }
        }
    }

    pub(crate) fn api_over(transport: &Arc<MockTransport>) -> Api {
        Api::new(
            "https://gitlab.example.com",
            "test-token",
            Arc::clone(transport) as Arc<dyn HttpTransport>,
        )
    }

    /// An API handle whose `/version` probe is already satisfied.
    pub(crate) fn api_at_version(transport: &Arc<MockTransport>, version: &str) -> Api {
        let api = api_over(transport);
        api.version
            .set(Version::parse(version).unwrap())
            .expect("fresh api handle");
        api
    }
}
