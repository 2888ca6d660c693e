//! Upstream client over streamable HTTP

use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use reqwest::Response;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ConnectCallback, ConnectionLostHandler, NotificationHandler, ProtocolInfo, UpstreamClient,
};
use crate::config::UpstreamConfig;
use crate::protocol::{JsonRpcMessage, Tool, ToolsListResult, TOOLS_LIST};
use crate::transport::{HttpTransport, sse_messages};
use crate::{Error, Result};

/// Upper bound on `tools/list` pages fetched in one refresh
const MAX_TOOL_PAGES: usize = 100;

#[derive(Default)]
struct Handlers {
    notification: Option<NotificationHandler>,
    lost: Option<ConnectionLostHandler>,
}

/// Live connection to one upstream MCP server
pub struct LiveUpstream {
    config: UpstreamConfig,
    timeout: Duration,
    transport: RwLock<Option<Arc<HttpTransport>>>,
    info: RwLock<Option<ProtocolInfo>>,
    handlers: Arc<RwLock<Handlers>>,
    listener: Mutex<Option<CancellationToken>>,
    push_active: Arc<AtomicBool>,
}

impl LiveUpstream {
    /// Create an unconnected client; `timeout` bounds each HTTP call
    #[must_use]
    pub fn new(config: UpstreamConfig, timeout: Duration) -> Self {
        Self {
            config,
            timeout,
            transport: RwLock::new(None),
            info: RwLock::new(None),
            handlers: Arc::new(RwLock::new(Handlers::default())),
            listener: Mutex::new(None),
            push_active: Arc::new(AtomicBool::new(false)),
        }
    }

    fn transport(&self) -> Result<Arc<HttpTransport>> {
        self.transport
            .read()
            .clone()
            .filter(|t| t.is_connected())
            .ok_or_else(|| Error::upstream(&self.config.name, "not connected"))
    }

    async fn start_listener(&self, transport: &HttpTransport) {
        let response = match transport.open_event_stream().await {
            Ok(Some(response)) => response,
            Ok(None) => return,
            Err(e) => {
                warn!(server = %self.config.name, error = %e, "Notification stream unavailable, relying on polling");
                return;
            }
        };

        let cancel = CancellationToken::new();
        if let Some(previous) = self.listener.lock().replace(cancel.clone()) {
            previous.cancel();
        }
        self.push_active.store(true, Ordering::Relaxed);
        tokio::spawn(listen(
            self.config.name.clone(),
            response,
            Arc::clone(&self.handlers),
            Arc::clone(&self.push_active),
            cancel,
        ));
    }
}

/// Relay notifications until the stream ends or the connection is torn down
async fn listen(
    server: String,
    response: Response,
    handlers: Arc<RwLock<Handlers>>,
    push_active: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut messages = pin!(sse_messages(response));
    debug!(server = %server, "Listening for upstream notifications");

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                push_active.store(false, Ordering::Relaxed);
                return;
            }
            next = messages.next() => match next {
                Some(Ok(JsonRpcMessage::Notification(notification))) => {
                    let handler = handlers.read().notification.clone();
                    if let Some(handler) = handler {
                        handler(notification);
                    }
                }
                Some(Ok(other)) => {
                    debug!(server = %server, method = ?other.method(), "Ignoring non-notification on event stream");
                }
                Some(Err(e)) => {
                    warn!(server = %server, error = %e, "Upstream event stream failed");
                    break;
                }
                None => break,
            }
        }
    }

    push_active.store(false, Ordering::Relaxed);
    let handler = handlers.read().lost.clone();
    if let Some(handler) = handler {
        handler();
    }
}

#[async_trait]
impl UpstreamClient for LiveUpstream {
    fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    async fn connect(&self, on_connected: ConnectCallback) -> Result<()> {
        let authorization = self.config.resolve_credential().map(|c| format!("Bearer {c}"));
        let headers: Vec<(&str, &str)> = authorization
            .as_deref()
            .map(|a| ("authorization", a))
            .into_iter()
            .collect();
        let transport = Arc::new(HttpTransport::new(&self.config.url, headers, self.timeout)?);

        let result = transport
            .initialize()
            .await
            .map_err(|e| Error::upstream(&self.config.name, e.to_string()))?;
        let tools_list_changed = result.capabilities.tools_list_changed();

        *self.info.write() = Some(ProtocolInfo {
            protocol_version: result.protocol_version,
            server_name: result.server_info.name,
            tools_list_changed,
        });
        *self.transport.write() = Some(Arc::clone(&transport));

        on_connected(self);

        if tools_list_changed {
            self.start_listener(&transport).await;
        }
        info!(
            server = %self.config.name,
            push = self.push_active.load(Ordering::Relaxed),
            "Connected to upstream"
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(cancel) = self.listener.lock().take() {
            cancel.cancel();
        }
        self.push_active.store(false, Ordering::Relaxed);
        *self.info.write() = None;
        let transport = self.transport.write().take();
        if let Some(transport) = transport {
            transport.close().await?;
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.transport()?.request("ping", None).await.map(|_| ())
    }

    async fn list_tools(&self) -> Result<Vec<Tool>> {
        let transport = self.transport()?;
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TOOL_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let page: ToolsListResult = serde_json::from_value(transport.request(TOOLS_LIST, params).await?)
                .map_err(|e| Error::Protocol(format!("invalid tools/list result: {e}")))?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }

        warn!(server = %self.config.name, pages = MAX_TOOL_PAGES, "tools/list pagination truncated");
        Ok(tools)
    }

    fn protocol_info(&self) -> Option<ProtocolInfo> {
        self.info.read().clone()
    }

    fn supports_tools_list_changed(&self) -> bool {
        self.push_active.load(Ordering::Relaxed)
    }

    fn on_notification(&self, handler: NotificationHandler) {
        self.handlers.write().notification = Some(handler);
    }

    fn on_connection_lost(&self, handler: ConnectionLostHandler) {
        self.handlers.write().lost = Some(handler);
    }
}
