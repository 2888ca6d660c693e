//! Request routing for the Envoy external processor.
//!
//! The proxy hands every intercepted MCP request to [`McpRouter`] in two
//! phases. The header phase points the request at the public gateway host;
//! the body phase resolves `tools/call` requests to the owning upstream and
//! returns the header and body rewrites the proxy must apply.

mod ext_proc;

pub use ext_proc::{McpExtProc, serve_ext_proc};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::authz::AccessPolicy;
use crate::config::UpstreamConfig;
use crate::error::{Error, RouterError};
use crate::protocol::{McpMessage, RequestHeaders, SESSION_HEADER};
use crate::registry::ToolRegistry;
use crate::session::{SessionBinder, SessionTokens};

/// Routed MCP method
pub const METHOD_HEADER: &str = "x-mcp-method";
/// Tool name as the upstream knows it
pub const TOOL_NAME_HEADER: &str = "x-mcp-toolname";
/// Owning upstream server
pub const SERVER_NAME_HEADER: &str = "x-mcp-servername";
/// HTTP/2 authority pseudo-header
pub const AUTHORITY_HEADER: &str = ":authority";
/// HTTP/2 path pseudo-header
pub const PATH_HEADER: &str = ":path";
/// Body length
pub const CONTENT_LENGTH_HEADER: &str = "content-length";

/// Rewrites the proxy applies to one request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteDecision {
    /// Headers to set, in emission order
    pub headers: Vec<(String, String)>,
    /// Replacement body, if the body changed
    pub body: Option<Vec<u8>>,
}

impl RouteDecision {
    /// Leave the request untouched
    #[must_use]
    pub fn pass_through() -> Self {
        Self::default()
    }

    /// Whether nothing is rewritten
    #[must_use]
    pub fn is_pass_through(&self) -> bool {
        self.headers.is_empty() && self.body.is_none()
    }

    /// Value set for a header, if any
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn set(&mut self, name: &str, value: impl Into<String>) {
        self.headers.push((name.to_string(), value.into()));
    }
}

/// Routes intercepted MCP requests to upstream servers
pub struct McpRouter {
    public_host: String,
    registry: Arc<ToolRegistry>,
    binder: Arc<SessionBinder>,
    tokens: Arc<SessionTokens>,
    policy: Arc<AccessPolicy>,
    servers: RwLock<HashMap<String, UpstreamConfig>>,
}

impl McpRouter {
    /// Create a router
    pub fn new(
        public_host: impl Into<String>,
        registry: Arc<ToolRegistry>,
        binder: Arc<SessionBinder>,
        tokens: Arc<SessionTokens>,
        policy: Arc<AccessPolicy>,
    ) -> Self {
        Self {
            public_host: public_host.into(),
            registry,
            binder,
            tokens,
            policy,
            servers: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the known upstream descriptors (enabled ones only are kept).
    ///
    /// Backend sessions bound to a descriptor that is gone or changed are
    /// dropped, so the next call to that server opens a new one.
    pub fn set_servers(&self, servers: &[UpstreamConfig]) {
        let map: HashMap<String, UpstreamConfig> = servers
            .iter()
            .filter(|s| s.enabled)
            .map(|s| (s.name.clone(), s.clone()))
            .collect();
        let current: HashSet<String> = map.values().map(UpstreamConfig::id).collect();
        let previous = std::mem::replace(&mut *self.servers.write(), map);

        let stale: Vec<String> = previous
            .values()
            .map(UpstreamConfig::id)
            .filter(|id| !current.contains(id))
            .collect();
        let dropped = self.binder.cache().forget_upstreams(&stale);
        if dropped > 0 {
            info!(upstreams = stale.len(), dropped, "Dropped backend sessions of changed upstreams");
        }
    }

    /// Header phase: point the request at the public gateway host.
    ///
    /// Wildcard hosts such as `*.mcp.example.com` are passed through verbatim.
    #[must_use]
    pub fn route_request_headers(&self, _headers: &RequestHeaders) -> RouteDecision {
        let mut decision = RouteDecision::pass_through();
        decision.set(AUTHORITY_HEADER, self.public_host.as_str());
        decision
    }

    /// Body phase: decide how one intercepted MCP request is forwarded.
    ///
    /// Anything other than `tools/call` goes to the broker unchanged. A tool
    /// call is resolved to its owning upstream, checked against the request's
    /// overlays, bound to a backend session and rewritten to the upstream's
    /// own tool name.
    pub async fn route_mcp_request(
        &self,
        headers: &RequestHeaders,
        body: &[u8],
    ) -> Result<RouteDecision, RouterError> {
        let mut message = McpMessage::parse(body, headers.clone()).map_err(reject)?;
        message.validate().map_err(reject)?;

        if !message.is_tool_call() {
            debug!(method = %message.method, "Passing non tool call through to the broker");
            return Ok(self.session_bookkeeping(&message));
        }

        let requested = message.tool_name().to_string();
        if requested.is_empty() {
            return Err(reject(Error::Protocol("tools/call without params.name".to_string())));
        }

        let entry = self
            .registry
            .lookup(&requested)
            .ok_or_else(|| reject(Error::ToolNotFound(requested.clone())))?;

        let filter = self
            .policy
            .filter_for(headers)
            .map_err(|e| RouterError::new(403, e))?;
        if !filter.allows(&entry) {
            warn!(tool = %requested, server = %entry.server, "Tool call rejected by request overlays");
            return Err(reject(Error::Forbidden(requested)));
        }

        let gateway_session = message.session_id().to_string();
        self.tokens.verify(&gateway_session).map_err(reject)?;

        let server = self
            .servers
            .read()
            .get(&entry.server)
            .cloned()
            .ok_or_else(|| reject(Error::upstream(&entry.server, "server is no longer configured")))?;

        let backend_session = self
            .binder
            .upstream_session(&gateway_session, &server, headers)
            .await
            .map_err(reject)?;

        message.rewrite_tool_name(&entry.upstream_name);
        let body = message.to_bytes().map_err(reject)?;

        let mut decision = RouteDecision::pass_through();
        decision.set(METHOD_HEADER, message.method.as_str());
        decision.set(TOOL_NAME_HEADER, entry.upstream_name.as_str());
        decision.set(SERVER_NAME_HEADER, server.name.as_str());
        decision.set(SESSION_HEADER, backend_session);
        decision.set(AUTHORITY_HEADER, server.authority());
        decision.set(PATH_HEADER, server.path());
        decision.set(CONTENT_LENGTH_HEADER, body.len().to_string());
        decision.body = Some(body);

        info!(tool = %requested, server = %server.name, upstream_tool = %entry.upstream_name, "Routed tool call");
        Ok(decision)
    }
}

impl McpRouter {
    /// Pin a verified gateway session header on broker-bound traffic.
    ///
    /// Duplicate header values collapse to the one that verified. Handshake
    /// messages and unverifiable tokens are left alone for the broker to answer.
    fn session_bookkeeping(&self, message: &McpMessage) -> RouteDecision {
        let mut decision = RouteDecision::pass_through();
        if message.is_initialize() {
            return decision;
        }
        let session = message.session_id();
        if !session.is_empty() && self.tokens.verify(session).is_ok() {
            decision.set(SESSION_HEADER, session);
        }
        decision
    }
}

fn reject(error: Error) -> RouterError {
    RouterError::new(error.http_status(), error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthorizedToolsConfig, VirtualServerConfig};
    use crate::protocol::Tool;
    use crate::registry::RegisteredTool;
    use crate::session::{BackendSession, SessionCache, SessionInitializer};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Names each backend session after the url it was opened against
    #[derive(Default)]
    struct UrlInitializer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SessionInitializer for UrlInitializer {
        async fn initialize(
            &self,
            _gateway_session: &str,
            _server_name: &str,
            server: &UpstreamConfig,
            _headers: &RequestHeaders,
        ) -> crate::Result<BackendSession> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(BackendSession {
                session_id: server.url.clone(),
                protocol_version: "2025-06-18".to_string(),
            })
        }
    }

    struct Fixture {
        router: McpRouter,
        token: String,
        initializer: Arc<UrlInitializer>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ToolRegistry::new());
        registry.add_tools([
            RegisteredTool::from_upstream("weather", "w_", &Tool::named("forecast")),
            RegisteredTool::from_upstream("files", "", &Tool::named("read")),
        ]);
        let tokens = Arc::new(SessionTokens::new(b"router-secret", Duration::from_secs(60)));
        let initializer = Arc::new(UrlInitializer::default());
        let binder = Arc::new(SessionBinder::new(
            Arc::new(SessionCache::new(Duration::from_secs(60))),
            Arc::clone(&initializer) as Arc<dyn SessionInitializer>,
        ));
        let policy = Arc::new(
            AccessPolicy::new(
                &AuthorizedToolsConfig::default(),
                &[VirtualServerConfig {
                    name: "files-only".to_string(),
                    tools: vec!["read".to_string()],
                }],
            )
            .unwrap(),
        );
        let router = McpRouter::new("*.mcp.example.com", registry, binder, Arc::clone(&tokens), policy);
        router.set_servers(&[
            UpstreamConfig::new("weather", "http://weather.internal:9000/v1/mcp", "w_"),
            UpstreamConfig::new("files", "http://files.internal/mcp", ""),
        ]);
        Fixture {
            router,
            token: tokens.issue().unwrap(),
            initializer,
        }
    }

    fn call(tool: &str) -> Vec<u8> {
        json!({"jsonrpc": "2.0", "id": 7, "method": "tools/call", "params": {"name": tool, "arguments": {"city": "Oslo"}}})
            .to_string()
            .into_bytes()
    }

    fn headers(token: &str) -> RequestHeaders {
        RequestHeaders::from_pairs([(SESSION_HEADER, token)])
    }

    #[test]
    fn header_phase_rewrites_authority_verbatim() {
        let f = fixture();
        let decision = f.router.route_request_headers(&RequestHeaders::new());
        assert_eq!(
            decision.headers,
            vec![(":authority".to_string(), "*.mcp.example.com".to_string())]
        );
    }

    #[tokio::test]
    async fn tool_call_emits_headers_in_fixed_order() {
        let f = fixture();
        let decision = f
            .router
            .route_mcp_request(&headers(&f.token), &call("w_forecast"))
            .await
            .unwrap();

        let names: Vec<&str> = decision.headers.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "x-mcp-method",
                "x-mcp-toolname",
                "x-mcp-servername",
                "mcp-session-id",
                ":authority",
                ":path",
                "content-length"
            ]
        );
        assert_eq!(decision.header("x-mcp-toolname"), Some("forecast"));
        assert_eq!(decision.header("x-mcp-servername"), Some("weather"));
        assert_eq!(decision.header("mcp-session-id"), Some("http://weather.internal:9000/v1/mcp"));
        assert_eq!(decision.header(":authority"), Some("weather.internal:9000"));
        assert_eq!(decision.header(":path"), Some("/v1/mcp"));

        let body = decision.body.unwrap();
        assert_eq!(decision.headers[6].1, body.len().to_string());
        let rewritten: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(rewritten["params"]["name"], "forecast");
        assert_eq!(rewritten["params"]["arguments"]["city"], "Oslo");
        assert_eq!(rewritten["id"], 7);
    }

    #[tokio::test]
    async fn non_tool_calls_pass_through() {
        let f = fixture();
        let body = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}).to_string();
        let decision = f
            .router
            .route_mcp_request(&RequestHeaders::new(), body.as_bytes())
            .await
            .unwrap();
        assert!(decision.is_pass_through());
    }

    #[tokio::test]
    async fn broker_traffic_keeps_the_verified_gateway_session() {
        let f = fixture();
        let list = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}).to_string();
        let decision = f
            .router
            .route_mcp_request(&headers(&f.token), list.as_bytes())
            .await
            .unwrap();
        assert_eq!(
            decision.headers,
            vec![(SESSION_HEADER.to_string(), f.token.clone())]
        );
        assert!(decision.body.is_none());

        let forged = f
            .router
            .route_mcp_request(&headers("forged"), list.as_bytes())
            .await
            .unwrap();
        assert!(forged.is_pass_through());

        let init = json!({"jsonrpc": "2.0", "id": 2, "method": "initialize", "params": {}}).to_string();
        let handshake = f
            .router
            .route_mcp_request(&headers(&f.token), init.as_bytes())
            .await
            .unwrap();
        assert!(handshake.is_pass_through());
    }

    #[tokio::test]
    async fn changed_upstream_url_opens_a_new_backend_session() {
        let f = fixture();
        let first = f
            .router
            .route_mcp_request(&headers(&f.token), &call("w_forecast"))
            .await
            .unwrap();
        assert_eq!(first.header("mcp-session-id"), Some("http://weather.internal:9000/v1/mcp"));

        f.router.set_servers(&[
            UpstreamConfig::new("weather", "http://new-host:9000/mcp", "w_"),
            UpstreamConfig::new("files", "http://files.internal/mcp", ""),
        ]);
        let moved = f
            .router
            .route_mcp_request(&headers(&f.token), &call("w_forecast"))
            .await
            .unwrap();
        assert_eq!(moved.header(":authority"), Some("new-host:9000"));
        assert_eq!(moved.header("mcp-session-id"), Some("http://new-host:9000/mcp"));
        assert_eq!(f.initializer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalid_envelope_is_a_bad_request() {
        let f = fixture();
        let err = f
            .router
            .route_mcp_request(&RequestHeaders::new(), br#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#)
            .await
            .unwrap_err();
        assert_eq!(err.code(), 400);
        assert!(matches!(err.cause(), Error::Protocol(_)));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let f = fixture();
        let err = f
            .router
            .route_mcp_request(&headers(&f.token), &call("nope"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), 404);
        assert!(matches!(err.cause(), Error::ToolNotFound(name) if name == "nope"));
    }

    #[tokio::test]
    async fn virtual_server_filters_tool_calls() {
        let f = fixture();
        let mut h = headers(&f.token);
        h.set("x-mcp-virtualserver", "files-only");
        let err = f
            .router
            .route_mcp_request(&h, &call("w_forecast"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), 403);

        let ok = f.router.route_mcp_request(&h, &call("read")).await.unwrap();
        assert_eq!(ok.header("x-mcp-toolname"), Some("read"));
        assert_eq!(ok.header(":path"), Some("/mcp"));
    }

    #[tokio::test]
    async fn invalid_session_is_rejected() {
        let f = fixture();
        let err = f
            .router
            .route_mcp_request(&headers("forged"), &call("w_forecast"))
            .await
            .unwrap_err();
        assert!(matches!(err.cause(), Error::Session(_)));
        assert_eq!(err.code(), 404);

        let missing = f
            .router
            .route_mcp_request(&RequestHeaders::new(), &call("w_forecast"))
            .await
            .unwrap_err();
        assert!(matches!(missing.cause(), Error::Session(_)));
    }

    #[tokio::test]
    async fn unconfigured_owner_is_unavailable() {
        let f = fixture();
        f.router.set_servers(&[]);
        let err = f
            .router
            .route_mcp_request(&headers(&f.token), &call("w_forecast"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), 502);
    }
}
