//! Streamable HTTP transport for upstream MCP servers
//!
//! 1. POST JSON-RPC to the server's MCP endpoint; the reply is either JSON or
//!    a short SSE stream carrying the response
//! 2. The `mcp-session-id` returned by `initialize` is echoed on every call
//! 3. An optional GET on the same endpoint opens the server->client
//!    notification stream

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::{Stream, StreamExt};
use parking_lot::RwLock;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::protocol::{
    INITIALIZE, INITIALIZED, InitializeResult, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse,
    PROTOCOL_VERSION, RequestId, SESSION_HEADER,
};
use crate::{Error, Result};

const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

/// HTTP transport for one upstream MCP endpoint
pub struct HttpTransport {
    /// HTTP client
    client: Client,
    /// MCP endpoint URL
    url: String,
    /// Static headers (credentials, forwarded client headers)
    headers: HeaderMap,
    /// Backend session id, set by `initialize`
    session_id: RwLock<Option<String>>,
    /// Request ID counter
    request_id: AtomicU64,
    /// Connected flag
    connected: AtomicBool,
    /// Per-POST timeout
    timeout: Duration,
}

impl HttpTransport {
    /// Create a new HTTP transport
    ///
    /// `timeout` bounds each POST; the notification stream is not bounded.
    pub fn new<'a>(
        url: &str,
        headers: impl IntoIterator<Item = (&'a str, &'a str)>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;

        let mut header_map = HeaderMap::new();
        for (key, value) in headers {
            match (key.parse::<HeaderName>(), value.parse::<HeaderValue>()) {
                (Ok(k), Ok(v)) => {
                    header_map.insert(k, v);
                }
                _ => warn!(header = %key, "Skipping header that is not valid HTTP"),
            }
        }

        Ok(Self {
            client,
            url: url.to_string(),
            headers: header_map,
            session_id: RwLock::new(None),
            request_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
            timeout,
        })
    }

    /// Perform the MCP handshake (`initialize` + `notifications/initialized`)
    pub async fn initialize(&self) -> Result<InitializeResult> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION")
            }
        });

        let result = self.request(INITIALIZE, Some(params)).await?;
        let result: InitializeResult = serde_json::from_value(result)
            .map_err(|e| Error::Protocol(format!("invalid initialize result: {e}")))?;

        self.notify(INITIALIZED, None).await?;
        self.connected.store(true, Ordering::Relaxed);
        info!(
            url = %self.url,
            server = %result.server_info.name,
            protocol = %result.protocol_version,
            session = self.session_id().is_some(),
            "Upstream handshake complete"
        );

        Ok(result)
    }

    /// Send a request and return its `result`
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let request = JsonRpcRequest::new(self.next_id(), method, params);
        let response = self.send_request(&request).await?;

        if let Some(error) = response.error {
            return Err(Error::JsonRpc {
                code: error.code,
                message: error.message,
                data: error.data,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Send a notification (no response expected)
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let mut body = serde_json::json!({ "jsonrpc": "2.0", "method": method });
        if let Some(params) = params {
            body["params"] = params;
        }

        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .headers(self.request_headers("application/json")?)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Notification failed: {e}")))?;

        if !response.status().is_success() {
            warn!(status = %response.status(), url = %self.url, method, "Notification rejected");
        }
        Ok(())
    }

    /// Open the server->client notification stream.
    ///
    /// Returns `None` when the server does not offer one (405).
    pub async fn open_event_stream(&self) -> Result<Option<Response>> {
        let response = self
            .client
            .get(&self.url)
            .headers(self.request_headers("text/event-stream")?)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Event stream request failed: {e}")))?;

        match response.status() {
            StatusCode::METHOD_NOT_ALLOWED => {
                debug!(url = %self.url, "Upstream offers no notification stream");
                Ok(None)
            }
            status if status.is_success() => Ok(Some(response)),
            status => Err(Error::Transport(format!("Event stream returned HTTP {status}"))),
        }
    }

    /// Backend session id, once initialized
    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    /// Check if the handshake completed
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Terminate the backend session (best effort)
    pub async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);

        let Some(id) = self.session_id.write().take() else {
            return Ok(());
        };
        if let Err(e) = self
            .client
            .delete(&self.url)
            .headers(self.headers.clone())
            .header(SESSION_HEADER, id)
            .send()
            .await
        {
            debug!(url = %self.url, error = %e, "Session termination failed");
        }
        Ok(())
    }

    fn request_headers(&self, accept: &'static str) -> Result<HeaderMap> {
        let mut headers = self.headers.clone();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(header::ACCEPT, HeaderValue::from_static(accept));
        headers.insert(
            PROTOCOL_VERSION_HEADER,
            HeaderValue::from_static(PROTOCOL_VERSION),
        );
        if let Some(id) = self.session_id.read().as_deref() {
            let value = HeaderValue::from_str(id)
                .map_err(|e| Error::Transport(format!("invalid session id from upstream: {e}")))?;
            headers.insert(SESSION_HEADER, value);
        }
        Ok(headers)
    }

    /// Send a raw request to the MCP endpoint
    async fn send_request(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse> {
        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .headers(self.request_headers("application/json, text/event-stream")?)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Request failed: {e}")))?;

        let has_session = self.session_id.read().is_some();
        if !has_session
            && let Some(id) = response
                .headers()
                .get(SESSION_HEADER)
                .and_then(|v| v.to_str().ok())
        {
            debug!(url = %self.url, session = %id, "Stored upstream session id");
            *self.session_id.write() = Some(id.to_string());
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transport(format!("HTTP {status}: {body}")));
        }

        let is_sse = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/event-stream"));

        if !is_sse {
            return response
                .json()
                .await
                .map_err(|e| Error::Transport(format!("Failed to parse response: {e}")));
        }

        let text = response
            .text()
            .await
            .map_err(|e| Error::Transport(format!("Failed to read SSE response: {e}")))?;
        let mut parser = SseParser::default();
        parser
            .push(&text)
            .into_iter()
            .chain(parser.finish())
            .filter_map(|data| serde_json::from_str::<JsonRpcMessage>(&data).ok())
            .find_map(|message| match message {
                JsonRpcMessage::Response(response) if response.id.as_ref() == Some(&request.id) => {
                    Some(response)
                }
                _ => None,
            })
            .ok_or_else(|| Error::Transport("No response in SSE stream".to_string()))
    }

    /// Get next request ID
    fn next_id(&self) -> RequestId {
        RequestId::Number(i64::try_from(self.request_id.fetch_add(1, Ordering::Relaxed)).unwrap_or(i64::MAX))
    }
}

/// Decode the JSON-RPC messages carried by an SSE response body
pub fn sse_messages(response: Response) -> impl Stream<Item = Result<JsonRpcMessage>> {
    async_stream::try_stream! {
        let mut parser = SseParser::default();
        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|e| Error::Transport(format!("Event stream broke: {e}")))?;
            for data in parser.push(&String::from_utf8_lossy(&chunk)) {
                match serde_json::from_str::<JsonRpcMessage>(&data) {
                    Ok(message) => yield message,
                    Err(e) => debug!(error = %e, "Ignoring undecodable SSE event"),
                }
            }
        }
    }
}

/// Incremental `text/event-stream` decoder yielding `data` payloads
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    data: Vec<String>,
}

impl SseParser {
    /// Feed a chunk; returns the payloads of every event it completed
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(data) = line.strip_prefix("data:") {
                self.data.push(data.strip_prefix(' ').unwrap_or(data).to_string());
            }
            // event:, id:, retry: and comments carry nothing we route on
        }
        events
    }

    /// Flush an event left unterminated at end of stream
    pub fn finish(&mut self) -> Option<String> {
        if let Some(data) = self.buffer.strip_prefix("data:") {
            self.data.push(data.trim_start().to_string());
        }
        self.buffer.clear();
        (!self.data.is_empty()).then(|| std::mem::take(&mut self.data).join("\n"))
    }
}
