//! Broker MCP endpoint.
//!
//! The broker is the MCP server clients talk to. It terminates `initialize`,
//! serves the aggregated (and overlay-filtered) `tools/list`, streams
//! downstream notifications and publishes the status document. Tool calls
//! never reach it: the ext_proc router sends them straight to the owning
//! upstream.

mod handlers;
mod streaming;

pub use handlers::create_router;
pub use streaming::{HubEvent, NotificationHub, create_sse_response};

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::authz::AccessPolicy;
use crate::error::rpc_codes;
use crate::protocol::{
    Info, InitializeResult, JsonRpcResponse, ListChangedCapability, McpMessage, RequestHeaders,
    RequestId, SESSION_HEADER, ServerCapabilities, INITIALIZE, TOOLS_CALL, TOOLS_LIST,
    ToolsListResult, negotiate_version,
};
use crate::registry::ToolRegistry;
use crate::session::{SessionCache, SessionTokens};
use crate::status::StatusDocument;
use crate::upstream::UpstreamSupervisor;
use crate::{Error, Result};

/// Outcome of one POSTed message
#[derive(Debug, Clone)]
pub enum BrokerReply {
    /// Notification accepted, no body
    Accepted,
    /// JSON-RPC response
    Response {
        /// HTTP status to answer with
        status: StatusCode,
        /// Response body
        body: JsonRpcResponse,
        /// Session token to return in `mcp-session-id`
        session: Option<String>,
    },
}

impl BrokerReply {
    fn ok(id: RequestId, result: Value) -> Self {
        Self::Response {
            status: StatusCode::OK,
            body: JsonRpcResponse::success(id, result),
            session: None,
        }
    }

    fn error(status: StatusCode, id: Option<RequestId>, code: i32, message: impl Into<String>) -> Self {
        Self::Response {
            status,
            body: JsonRpcResponse::error(id, code, message),
            session: None,
        }
    }
}

/// Shared broker state
pub struct Broker {
    registry: Arc<ToolRegistry>,
    hub: Arc<NotificationHub>,
    tokens: Arc<SessionTokens>,
    sessions: Arc<SessionCache>,
    policy: Arc<AccessPolicy>,
    supervisor: Arc<UpstreamSupervisor>,
    keep_alive: Duration,
}

impl Broker {
    /// Create the broker state
    pub fn new(
        registry: Arc<ToolRegistry>,
        hub: Arc<NotificationHub>,
        tokens: Arc<SessionTokens>,
        sessions: Arc<SessionCache>,
        policy: Arc<AccessPolicy>,
        supervisor: Arc<UpstreamSupervisor>,
        keep_alive: Duration,
    ) -> Self {
        Self {
            registry,
            hub,
            tokens,
            sessions,
            policy,
            supervisor,
            keep_alive,
        }
    }

    /// Notification hub feeding `GET /mcp` streams
    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    /// Status document for this replica
    pub fn status(&self) -> StatusDocument {
        StatusDocument::new(self.supervisor.statuses())
    }

    /// Answer one validated message
    pub fn dispatch(&self, message: &McpMessage) -> BrokerReply {
        if message.is_notification() {
            debug!(method = %message.method, "Accepted notification");
            return BrokerReply::Accepted;
        }
        let Some(id) = message.id.clone() else {
            return BrokerReply::error(
                StatusCode::BAD_REQUEST,
                None,
                rpc_codes::INVALID_REQUEST,
                "request is missing an id",
            );
        };

        match message.method.as_str() {
            INITIALIZE => self.initialize(id, message),
            "ping" => BrokerReply::ok(id, json!({})),
            TOOLS_LIST => match self.tools_list(message) {
                Ok(result) => BrokerReply::ok(id, result),
                Err(e) => reply_error(id, &e),
            },
            TOOLS_CALL => BrokerReply::error(
                StatusCode::OK,
                Some(id),
                rpc_codes::INVALID_REQUEST,
                "tools/call must be sent through the gateway route",
            ),
            other => BrokerReply::error(
                StatusCode::OK,
                Some(id),
                rpc_codes::METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            ),
        }
    }

    fn initialize(&self, id: RequestId, message: &McpMessage) -> BrokerReply {
        let requested = message
            .params
            .as_ref()
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str)
            .unwrap_or_default();

        let token = match self.tokens.issue() {
            Ok(token) => token,
            Err(e) => {
                return BrokerReply::error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Some(id),
                    e.to_rpc_code(),
                    e.to_string(),
                );
            }
        };
        self.sessions.open(&token);

        let result = InitializeResult {
            protocol_version: negotiate_version(requested).to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ListChangedCapability { list_changed: true }),
                ..ServerCapabilities::default()
            },
            server_info: Info {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
            },
            instructions: None,
        };
        info!(protocol = %result.protocol_version, sessions = self.sessions.len(), "Opened gateway session");

        match serde_json::to_value(result) {
            Ok(result) => BrokerReply::Response {
                status: StatusCode::OK,
                body: JsonRpcResponse::success(id, result),
                session: Some(token),
            },
            Err(e) => BrokerReply::error(
                StatusCode::INTERNAL_SERVER_ERROR,
                Some(id),
                rpc_codes::INTERNAL_ERROR,
                e.to_string(),
            ),
        }
    }

    fn tools_list(&self, message: &McpMessage) -> Result<Value> {
        self.verify_session(message)?;
        let filter = self.policy.filter_for(message.headers())?;
        let tools = self
            .registry
            .list_tools()
            .into_iter()
            .filter(|entry| filter.allows(entry))
            .map(|entry| entry.tool)
            .collect();
        Ok(serde_json::to_value(ToolsListResult {
            tools,
            next_cursor: None,
        })?)
    }

    /// Verify the gateway session named by the request
    pub fn verify_session(&self, message: &McpMessage) -> Result<String> {
        let token = message.session_id();
        if token.is_empty() {
            return Err(Error::Protocol("missing mcp-session-id header".to_string()));
        }
        self.tokens.verify(token)?;
        Ok(token.to_string())
    }

    fn verify_header(&self, headers: &RequestHeaders) -> Result<String> {
        let mut carrier = McpMessage::default();
        if let Some(token) = headers.get(SESSION_HEADER) {
            carrier.set_session_id(token);
        }
        self.verify_session(&carrier)
    }

    /// Terminate a session; true if anything was known about it
    pub fn terminate(&self, token: &str) -> bool {
        let known = self.sessions.remove(token) | self.hub.has_session(token);
        self.hub.remove_session(token);
        known
    }
}

fn reply_error(id: RequestId, error: &Error) -> BrokerReply {
    let status = StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::BAD_REQUEST);
    BrokerReply::error(status, Some(id), error.to_rpc_code(), error.to_string())
}
