//! The request plane: endpoint classes, trust resolution, dispatch, and
//! transparent leader forwarding.
//!
//! Four disjoint URL prefixes, each with its own trust policy:
//!
//! | Class    | Prefix          | Reachable from    | Trust requirement        |
//! |----------|-----------------|-------------------|--------------------------|
//! | Control  | `core/control`  | Unix socket only  | Process owner            |
//! | Public   | `core/1.0`      | TLS listener      | Truststore or allowlist  |
//! | Internal | `core/internal` | TLS listener      | Truststore AND forwarded |
//! | Extended | `core/1.0/<ext>`| TLS listeners     | Truststore (default)     |
//!
//! Leader forwarding is a per-endpoint capability (`proxy_target`), so
//! handlers can assume they run on the leader.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use hyper::{Body, Method, Request, Response, StatusCode};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::client::{
    CLUSTER_NOTIFIER_UA, HEADER_FORWARDED_ADDRESS, HEADER_FORWARDED_PROTOCOL,
    HEADER_FORWARDED_USERNAME,
};
use crate::daemon::State;
use crate::errors::{Error, Result};

// ── Classes and trust ─────────────────────────────────────────────────────────

/// URL class of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Control,
    Public,
    Internal,
    Extended,
}

impl Class {
    pub fn prefix(&self) -> &'static str {
        match self {
            Class::Control => "core/control",
            Class::Public => "core/1.0",
            Class::Internal => "core/internal",
            Class::Extended => "core/1.0",
        }
    }
}

/// Which listener a request arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listener {
    /// The unix control socket.
    Control,
    /// The main cluster TLS listener.
    Cluster,
    /// An additional named TLS listener; serves only extended endpoints.
    Extra(String),
}

/// Resolved trust of an inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trust {
    /// Arrived on the unix socket: the process owner.
    Control,
    /// Mutually authenticated against a truststore entry.
    Trusted { name: String },
    /// Trusted peer bearing the cluster-notifier sentinel; carries the
    /// original caller's identity for audit.
    Forwarded {
        peer: String,
        username: String,
        protocol: String,
        address: String,
    },
    Untrusted,
}

impl Trust {
    fn is_trusted(&self) -> bool {
        !matches!(self, Trust::Untrusted)
    }

    fn is_forwarded_peer(&self) -> bool {
        matches!(self, Trust::Forwarded { .. })
    }

    /// Identity propagated on a further forward hop.
    pub fn username(&self) -> String {
        match self {
            Trust::Control => "unix".to_string(),
            Trust::Trusted { name } => name.clone(),
            Trust::Forwarded { username, .. } => username.clone(),
            Trust::Untrusted => String::new(),
        }
    }

    pub fn protocol(&self) -> String {
        match self {
            Trust::Control => "unix".to_string(),
            Trust::Trusted { .. } | Trust::Forwarded { .. } => "cluster".to_string(),
            Trust::Untrusted => "untrusted".to_string(),
        }
    }
}

/// Per-connection info stashed in request extensions by the listeners.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub listener: Listener,
    pub remote: String,
    /// DER client certificate presented at the TLS handshake, if any.
    pub peer_cert: Option<Vec<u8>>,
}

/// Context handed to endpoint handlers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub trust: Trust,
    pub listener: Listener,
    pub remote: String,
    /// Captured `{name}` path segment, if the pattern has one.
    pub param: Option<String>,
}

// ── Endpoints ─────────────────────────────────────────────────────────────────

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Response<Body>>> + Send>>;
pub type Handler = fn(Arc<State>, RequestContext, Request<Body>) -> HandlerFuture;

/// One HTTP method on an endpoint.
pub struct MethodSpec {
    pub method: Method,
    pub handler: Handler,
    /// Skip the trust requirement for this method.
    pub allow_untrusted: bool,
    /// Transparently forward to the raft leader when this node is not it.
    pub proxy_target: bool,
}

impl MethodSpec {
    pub fn new(method: Method, handler: Handler) -> Self {
        Self {
            method,
            handler,
            allow_untrusted: false,
            proxy_target: false,
        }
    }

    pub fn allow_untrusted(mut self) -> Self {
        self.allow_untrusted = true;
        self
    }

    pub fn proxy_target(mut self) -> Self {
        self.proxy_target = true;
        self
    }
}

/// An endpoint: a path pattern under a class prefix plus its methods.
pub struct Endpoint {
    pub class: Class,
    /// Pattern relative to the class prefix; one `{name}` segment may appear.
    /// Empty string matches the prefix itself.
    pub path: &'static str,
    pub methods: Vec<MethodSpec>,
}

/// The endpoint registry, built once at daemon start.
#[derive(Default)]
pub struct Registry {
    endpoints: Vec<Endpoint>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, endpoint: Endpoint) {
        self.endpoints.push(endpoint);
    }

    fn resolve(&self, path: &str) -> Option<(&Endpoint, Option<String>)> {
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        for endpoint in &self.endpoints {
            let full = if endpoint.path.is_empty() {
                endpoint.class.prefix().to_string()
            } else {
                format!("{}/{}", endpoint.class.prefix(), endpoint.path)
            };
            let pattern: Vec<&str> = full.trim_matches('/').split('/').collect();
            if pattern.len() != segments.len() {
                continue;
            }
            let mut param = None;
            let mut matched = true;
            for (p, s) in pattern.iter().zip(&segments) {
                if p.starts_with('{') && p.ends_with('}') {
                    if s.is_empty() {
                        matched = false;
                        break;
                    }
                    param = Some((*s).to_string());
                } else if p != s {
                    matched = false;
                    break;
                }
            }
            if matched {
                return Some((endpoint, param));
            }
        }
        None
    }

    /// Whether `path` resolves to a registered endpoint.
    #[cfg(test)]
    pub fn resolve_for_tests(&self, path: &str) -> bool {
        self.resolve(path).is_some()
    }

    /// Dispatch one request. Never returns an Err; failures are rendered as
    /// the stable JSON error body.
    pub async fn dispatch(
        &self,
        state: Arc<State>,
        conn: ConnInfo,
        req: Request<Body>,
    ) -> Response<Body> {
        match self.dispatch_inner(state, conn, req).await {
            Ok(resp) => resp,
            Err(e) => e.into_response(),
        }
    }

    async fn dispatch_inner(
        &self,
        state: Arc<State>,
        conn: ConnInfo,
        req: Request<Body>,
    ) -> Result<Response<Body>> {
        let path = req.uri().path().to_string();
        let Some((endpoint, param)) = self.resolve(&path) else {
            return plain_response(StatusCode::NOT_FOUND, "not found");
        };

        // Rule 1: class reachability per listener.
        let reachable = match (&conn.listener, endpoint.class) {
            (Listener::Control, Class::Control) => true,
            (Listener::Cluster, Class::Public | Class::Internal | Class::Extended) => true,
            (Listener::Extra(_), Class::Extended) => true,
            _ => false,
        };
        if !reachable {
            return Err(Error::Untrusted(format!(
                "endpoint {:?} is not served on this listener",
                path
            )));
        }

        let Some(spec) = endpoint.methods.iter().find(|m| m.method == req.method()) else {
            return plain_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        };

        // Rule 2: resolve trust.
        let trust = resolve_trust(&state, &conn, &req);

        // Rule 3 precondition: trust policy per class.
        let allowed = match endpoint.class {
            Class::Control => matches!(trust, Trust::Control),
            Class::Internal => spec.allow_untrusted || trust.is_forwarded_peer(),
            Class::Public | Class::Extended => spec.allow_untrusted || trust.is_trusted(),
        };
        if !allowed {
            warn!(path = %path, trust = ?trust, "Rejected request");
            return Err(Error::Untrusted(format!("access to {:?} denied", path)));
        }

        // Rule 3: transparent leader forwarding.
        if spec.proxy_target && state.db.is_open() && !state.db.is_leader() {
            return forward_to_leader(&state, &trust, req).await;
        }

        // Rule 4: invoke the handler.
        let ctx = RequestContext {
            trust,
            listener: conn.listener,
            remote: conn.remote,
            param,
        };
        (spec.handler)(state, ctx, req).await
    }
}

fn plain_response(status: StatusCode, message: &str) -> Result<Response<Body>> {
    Response::builder()
        .status(status)
        .body(Body::from(message.to_string()))
        .map_err(|e| Error::Fatal(format!("failed to assemble response: {}", e)))
}

/// Resolve what the connection is allowed to be.
fn resolve_trust(state: &State, conn: &ConnInfo, req: &Request<Body>) -> Trust {
    if conn.listener == Listener::Control {
        return Trust::Control;
    }
    let Some(der) = conn.peer_cert.as_deref() else {
        return Trust::Untrusted;
    };
    let name = match state.truststore.authenticate(der) {
        Ok(name) => name,
        Err(e) => {
            debug!(remote = %conn.remote, error = %e, "Peer certificate not trusted");
            return Trust::Untrusted;
        }
    };

    let sentinel = req
        .headers()
        .get(hyper::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|ua| ua == CLUSTER_NOTIFIER_UA)
        .unwrap_or(false);
    if sentinel {
        let header = |key: &str| {
            req.headers()
                .get(key)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        return Trust::Forwarded {
            peer: name,
            username: header(HEADER_FORWARDED_USERNAME),
            protocol: header(HEADER_FORWARDED_PROTOCOL),
            address: header(HEADER_FORWARDED_ADDRESS),
        };
    }
    Trust::Trusted { name }
}

/// Forward a request to the current leader verbatim, rewriting only the
/// authority and stamping the sentinel UA + forwarded-identity headers.
async fn forward_to_leader(
    state: &State,
    trust: &Trust,
    req: Request<Body>,
) -> Result<Response<Body>> {
    let leader = state.db.leader_address().ok_or(Error::NotReady)?;
    let local = state.address();

    let already_forwarded = req
        .headers()
        .get(hyper::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|ua| ua == CLUSTER_NOTIFIER_UA)
        .unwrap_or(false);
    if leader == local || already_forwarded {
        return Err(Error::Fatal("forwarding to self".into()));
    }

    let method = req.method().clone();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let url = format!("https://{}{}", leader, path_and_query);

    let mut headers = reqwest::header::HeaderMap::new();
    for (key, value) in req.headers() {
        let lower = key.as_str().to_ascii_lowercase();
        if matches!(
            lower.as_str(),
            "host" | "content-length" | "connection" | "user-agent"
        ) || lower.starts_with("x-lxd-forwarded-")
        {
            continue;
        }
        if let (Ok(k), Ok(v)) = (
            reqwest::header::HeaderName::from_bytes(key.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.insert(k, v);
        }
    }
    headers.insert(
        reqwest::header::USER_AGENT,
        reqwest::header::HeaderValue::from_static(CLUSTER_NOTIFIER_UA),
    );
    let stamp = |v: &str| {
        reqwest::header::HeaderValue::from_str(v)
            .unwrap_or_else(|_| reqwest::header::HeaderValue::from_static(""))
    };
    headers.insert(HEADER_FORWARDED_USERNAME, stamp(&trust.username()));
    headers.insert(HEADER_FORWARDED_PROTOCOL, stamp(&trust.protocol()));
    headers.insert(HEADER_FORWARDED_ADDRESS, stamp(&local));

    let body = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| Error::Transient(format!("failed to read request body: {}", e)))?;

    info!(leader = %leader, method = %method, path = %path_and_query, "Forwarding request to leader");

    let client = state.pool.client()?;
    let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|e| Error::Fatal(format!("invalid method: {}", e)))?;
    let resp = client
        .request(method, url)
        .headers(headers)
        .body(body.to_vec())
        .send()
        .await?;

    // Stream the response back verbatim.
    let status = StatusCode::from_u16(resp.status().as_u16())
        .map_err(|e| Error::Fatal(format!("invalid upstream status: {}", e)))?;
    let mut builder = Response::builder().status(status);
    for (key, value) in resp.headers() {
        let lower = key.as_str().to_ascii_lowercase();
        if matches!(lower.as_str(), "transfer-encoding" | "connection") {
            continue;
        }
        builder = builder.header(key.as_str(), value.as_bytes());
    }
    let bytes = resp.bytes().await?;
    builder
        .body(Body::from(bytes))
        .map_err(|e| Error::Fatal(format!("failed to assemble response: {}", e)))
}

// ── Response helpers ──────────────────────────────────────────────────────────

/// 200 with a JSON body.
pub fn json_response<T: Serialize>(value: &T) -> Result<Response<Body>> {
    json_response_with(StatusCode::OK, value)
}

pub fn json_response_with<T: Serialize>(status: StatusCode, value: &T) -> Result<Response<Body>> {
    let body = serde_json::to_vec(value)?;
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .map_err(|e| Error::Fatal(format!("failed to assemble response: {}", e)))
}

/// 200 with an empty JSON object.
pub fn empty_response() -> Result<Response<Body>> {
    json_response(&serde_json::json!({}))
}

/// Read and decode a JSON request body.
pub async fn read_json<T: serde::de::DeserializeOwned>(req: Request<Body>) -> Result<T> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| Error::Transient(format!("failed to read request body: {}", e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::Conflict(format!("malformed request body: {}", e)))
}

/// Fetch a query-string parameter.
pub fn query_param(req: &Request<Body>, key: &str) -> Option<String> {
    let query = req.uri().query()?;
    for pair in query.split('&') {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        if k == key {
            return Some(v.to_string());
        }
    }
    None
}

/// True when the query flags force mode (`force=1` or `force=true`).
pub fn force_param(req: &Request<Body>) -> bool {
    matches!(
        query_param(req, "force").as_deref(),
        Some("1") | Some("true")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_prefixes() {
        assert_eq!(Class::Control.prefix(), "core/control");
        assert_eq!(Class::Public.prefix(), "core/1.0");
        assert_eq!(Class::Internal.prefix(), "core/internal");
    }

    fn dummy_handler(
        _state: Arc<State>,
        _ctx: RequestContext,
        _req: Request<Body>,
    ) -> HandlerFuture {
        Box::pin(async { empty_response() })
    }

    fn registry() -> Registry {
        let mut r = Registry::new();
        r.register(Endpoint {
            class: Class::Public,
            path: "cluster",
            methods: vec![MethodSpec::new(Method::GET, dummy_handler)],
        });
        r.register(Endpoint {
            class: Class::Public,
            path: "cluster/{name}",
            methods: vec![MethodSpec::new(Method::DELETE, dummy_handler)],
        });
        r.register(Endpoint {
            class: Class::Control,
            path: "",
            methods: vec![MethodSpec::new(Method::POST, dummy_handler)],
        });
        r
    }

    #[test]
    fn resolve_exact_path() {
        let r = registry();
        let (e, param) = r.resolve("/core/1.0/cluster").unwrap();
        assert_eq!(e.path, "cluster");
        assert!(param.is_none());
    }

    #[test]
    fn resolve_captures_parameter() {
        let r = registry();
        let (e, param) = r.resolve("/core/1.0/cluster/member2").unwrap();
        assert_eq!(e.path, "cluster/{name}");
        assert_eq!(param.as_deref(), Some("member2"));
    }

    #[test]
    fn resolve_prefix_itself() {
        let r = registry();
        let (e, _) = r.resolve("/core/control").unwrap();
        assert_eq!(e.class, Class::Control);
    }

    #[test]
    fn resolve_rejects_unknown() {
        let r = registry();
        assert!(r.resolve("/core/1.0/nonsense").is_none());
        assert!(r.resolve("/core/1.0/cluster/a/b").is_none());
    }

    #[test]
    fn trust_identity_strings() {
        assert_eq!(Trust::Control.username(), "unix");
        assert_eq!(Trust::Control.protocol(), "unix");
        let t = Trust::Trusted {
            name: "member2".into(),
        };
        assert_eq!(t.username(), "member2");
        assert_eq!(t.protocol(), "cluster");
        assert_eq!(Trust::Untrusted.protocol(), "untrusted");
    }

    #[test]
    fn forwarded_preserves_original_username() {
        let t = Trust::Forwarded {
            peer: "member2".into(),
            username: "admin".into(),
            protocol: "unix".into(),
            address: "127.0.0.1:9002".into(),
        };
        assert_eq!(t.username(), "admin");
        assert!(t.is_forwarded_peer());
        assert!(t.is_trusted());
    }
}
