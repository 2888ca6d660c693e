//! Intercepted MCP envelope.
//!
//! One [`McpMessage`] is built per intercepted request body, mutated in place
//! while it is routed, then re-serialized. Field order on the wire is always
//! `jsonrpc`, `id`, `method`, `params` so re-encoding is deterministic.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::RequestId;
use crate::{Error, Result};

/// Header carrying the gateway (downstream) or backend (upstream) session id
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Method name of a tool invocation
pub const TOOLS_CALL: &str = "tools/call";
/// Method name of a tool listing
pub const TOOLS_LIST: &str = "tools/list";
/// Method name of the session handshake
pub const INITIALIZE: &str = "initialize";
/// Notification completing the session handshake
pub const INITIALIZED: &str = "notifications/initialized";
/// Notification announcing that the tool list changed
pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";

const NOTIFICATION_PREFIX: &str = "notifications/";

/// Case-insensitive multi-map of request headers.
///
/// Names are stored lowercased. Pseudo-headers such as `:authority` are
/// accepted, which is why this is not an `http::HeaderMap`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHeaders {
    entries: HashMap<String, Vec<String>>,
}

impl RequestHeaders {
    /// Empty header set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(name, value)` pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut headers = Self::new();
        for (name, value) in pairs {
            headers.append(name.as_ref(), value);
        }
        headers
    }

    /// Build from an axum/http header map, skipping non UTF-8 values
    #[must_use]
    pub fn from_http(map: &axum::http::HeaderMap) -> Self {
        Self::from_pairs(
            map.iter()
                .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v))),
        )
    }

    /// Append a value
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        self.entries
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    /// Replace all values of a header
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.entries
            .insert(name.to_ascii_lowercase(), vec![value.into()]);
    }

    /// First value of a header
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// All values of a header
    #[must_use]
    pub fn get_all(&self, name: &str) -> &[String] {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map_or(&[], Vec::as_slice)
    }

    /// Iterate `(name, value)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(name, values)| values.iter().map(move |v| (name.as_str(), v.as_str())))
    }
}

/// A JSON-RPC 2.0 request or notification as seen by the gateway
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpMessage {
    /// JSON-RPC version, must be "2.0"
    #[serde(default)]
    pub jsonrpc: String,
    /// Request id; absent for notifications
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    /// Method name
    #[serde(default)]
    pub method: String,
    /// Method parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
    #[serde(skip)]
    session_id: Option<String>,
    #[serde(skip)]
    headers: RequestHeaders,
}

impl McpMessage {
    /// Create a request message
    pub fn request(
        id: impl Into<RequestId>,
        method: impl Into<String>,
        params: Option<Map<String, Value>>,
    ) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id.into()),
            method: method.into(),
            params,
            ..Self::default()
        }
    }

    /// Decode an intercepted body and attach the request headers.
    ///
    /// Only fails when the body is not a JSON object; semantic checks are
    /// left to [`validate`](Self::validate).
    pub fn parse(body: &[u8], headers: RequestHeaders) -> Result<Self> {
        let mut message: Self = serde_json::from_slice(body)
            .map_err(|e| Error::Protocol(format!("body is not a JSON-RPC object: {e}")))?;
        message.headers = headers;
        Ok(message)
    }

    /// Check the envelope invariants
    pub fn validate(&self) -> Result<()> {
        if self.jsonrpc != "2.0" {
            return Err(Error::Protocol(format!(
                "unsupported jsonrpc version {:?}",
                self.jsonrpc
            )));
        }
        if self.method.is_empty() {
            return Err(Error::Protocol("missing method".to_string()));
        }
        if self.id.is_none() && !self.is_notification() {
            return Err(Error::Protocol(format!(
                "request {} is missing an id",
                self.method
            )));
        }
        Ok(())
    }

    /// Method is a notification (`notifications/...`)
    #[must_use]
    pub fn is_notification(&self) -> bool {
        self.method.starts_with(NOTIFICATION_PREFIX)
    }

    /// Method belongs to the session handshake
    #[must_use]
    pub fn is_initialize(&self) -> bool {
        self.method == INITIALIZE || self.method == INITIALIZED
    }

    /// Method is exactly `tools/call`
    #[must_use]
    pub fn is_tool_call(&self) -> bool {
        self.method == TOOLS_CALL
    }

    /// Requested tool name for a tool call, otherwise an empty string
    #[must_use]
    pub fn tool_name(&self) -> &str {
        if !self.is_tool_call() {
            return "";
        }
        self.params
            .as_ref()
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    /// Replace `params.name`, leaving every other parameter untouched
    pub fn rewrite_tool_name(&mut self, name: &str) {
        self.params
            .get_or_insert_with(Map::new)
            .insert("name".to_string(), Value::String(name.to_string()));
    }

    /// Session id: cached value first, then the session header, else empty
    #[must_use]
    pub fn session_id(&self) -> &str {
        self.session_id
            .as_deref()
            .or_else(|| self.headers.get(SESSION_HEADER))
            .unwrap_or("")
    }

    /// Pre-populate the session id
    pub fn set_session_id(&mut self, id: impl Into<String>) {
        self.session_id = Some(id.into());
    }

    /// Headers of the intercepted request
    #[must_use]
    pub fn headers(&self) -> &RequestHeaders {
        &self.headers
    }

    /// Canonical JSON encoding
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn parse(value: &Value) -> McpMessage {
        McpMessage::parse(value.to_string().as_bytes(), RequestHeaders::new()).unwrap()
    }

    #[test]
    fn validate_accepts_requests_and_notifications() {
        parse(&json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
            .validate()
            .unwrap();
        parse(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .validate()
            .unwrap();
    }

    #[test]
    fn validate_rejects_bad_envelopes() {
        let cases = [
            json!({"jsonrpc": "1.0", "id": 1, "method": "tools/list"}),
            json!({"id": 1, "method": "tools/list"}),
            json!({"jsonrpc": "2.0", "id": 1}),
            json!({"jsonrpc": "2.0", "id": 1, "method": ""}),
            json!({"jsonrpc": "2.0", "method": "tools/list"}),
        ];
        for case in &cases {
            let err = parse(case).validate().unwrap_err();
            assert!(matches!(err, Error::Protocol(_)), "{case} -> {err}");
        }
    }

    #[test]
    fn zero_id_is_not_absent() {
        let msg = parse(&json!({"jsonrpc": "2.0", "id": 0, "method": "ping"}));
        assert_eq!(msg.id, Some(RequestId::Number(0)));
        msg.validate().unwrap();
    }

    #[test]
    fn parse_rejects_non_objects() {
        assert!(McpMessage::parse(b"not json", RequestHeaders::new()).is_err());
        assert!(McpMessage::parse(b"[1,2]", RequestHeaders::new()).is_err());
    }

    #[test]
    fn classification() {
        let call = parse(&json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"name": "x"}}));
        assert!(call.is_tool_call());
        assert!(!call.is_notification());
        assert!(!call.is_initialize());

        let init = parse(&json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}));
        assert!(init.is_initialize());
        let initialized = parse(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}));
        assert!(initialized.is_initialize());
        assert!(initialized.is_notification());
    }

    #[test]
    fn tool_name_is_empty_outside_tool_calls() {
        let list = parse(&json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list", "params": {"name": "x"}}));
        assert_eq!(list.tool_name(), "");
        let nameless = parse(&json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call"}));
        assert_eq!(nameless.tool_name(), "");
        let numeric = parse(&json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"name": 7}}));
        assert_eq!(numeric.tool_name(), "");
    }

    #[test]
    fn rewrite_tool_name_keeps_other_params() {
        let mut msg = parse(&json!({
            "jsonrpc": "2.0",
            "id": 4,
            "method": "tools/call",
            "params": {"name": "weather_forecast", "arguments": {"city": "Oslo"}, "_meta": {"progressToken": 1}}
        }));
        msg.rewrite_tool_name("forecast");
        assert_eq!(msg.tool_name(), "forecast");
        let params = msg.params.as_ref().unwrap();
        assert_eq!(params["arguments"], json!({"city": "Oslo"}));
        assert_eq!(params["_meta"], json!({"progressToken": 1}));
    }

    #[test]
    fn session_id_prefers_cached_value() {
        let headers = RequestHeaders::from_pairs([("Mcp-Session-Id", "from-header")]);
        let mut msg = McpMessage::parse(
            br#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#,
            headers,
        )
        .unwrap();
        assert_eq!(msg.session_id(), "from-header");
        msg.set_session_id("cached");
        assert_eq!(msg.session_id(), "cached");

        let bare = parse(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}));
        assert_eq!(bare.session_id(), "");
    }

    #[test]
    fn canonical_encoding_orders_keys() {
        let body = br#"{"params":{"name":"a_b","arguments":{"z":1,"a":2}},"method":"tools/call","id":"r1","jsonrpc":"2.0"}"#;
        let msg = McpMessage::parse(body, RequestHeaders::new()).unwrap();
        let encoded = String::from_utf8(msg.to_bytes().unwrap()).unwrap();
        assert_eq!(
            encoded,
            r#"{"jsonrpc":"2.0","id":"r1","method":"tools/call","params":{"name":"a_b","arguments":{"z":1,"a":2}}}"#
        );

        let again = McpMessage::parse(encoded.as_bytes(), RequestHeaders::new()).unwrap();
        assert_eq!(again.to_bytes().unwrap(), encoded.into_bytes());
    }

    #[test]
    fn headers_are_case_insensitive_and_multi_valued() {
        let mut headers = RequestHeaders::from_pairs([(":authority", "mcp.example.com")]);
        headers.append("X-Trace", "a");
        headers.append("x-trace", "b");
        assert_eq!(headers.get(":Authority"), Some("mcp.example.com"));
        assert_eq!(headers.get_all("x-trace"), ["a".to_string(), "b".to_string()]);
        headers.set("x-trace", "c");
        assert_eq!(headers.get_all("X-TRACE"), ["c".to_string()]);
        assert_eq!(headers.iter().count(), 2);
    }
}
