//! Per-upstream connection manager.
//!
//! One manager runs per configured server. A poll tick and upstream-pushed
//! events feed the same consumer, so diff application is strictly sequential
//! for a given upstream.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ConnectCallback, ProtocolInfo, UpstreamClient};
use crate::broker::NotificationHub;
use crate::config::UpstreamPolicyConfig;
use crate::protocol::{JsonRpcNotification, TOOLS_LIST_CHANGED, Tool};
use crate::registry::{RegisteredTool, ToolRegistry, prefixed_name};
use crate::status::ServerValidation;
use crate::{Error, Result};

/// Timing knobs for a manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamPolicy {
    /// Interval between manage cycles
    pub poll_interval: Duration,
    /// Ping timeout
    pub ping_timeout: Duration,
    /// Connect timeout
    pub handshake_timeout: Duration,
    /// `tools/list` timeout
    pub list_tools_timeout: Duration,
}

impl From<&UpstreamPolicyConfig> for UpstreamPolicy {
    fn from(config: &UpstreamPolicyConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            ping_timeout: config.ping_timeout,
            handshake_timeout: config.handshake_timeout,
            list_tools_timeout: config.list_tools_timeout,
        }
    }
}

impl Default for UpstreamPolicy {
    fn default() -> Self {
        Self::from(&UpstreamPolicyConfig::default())
    }
}

/// Something an upstream pushed at us
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    /// JSON-RPC notification from the upstream
    Notification(JsonRpcNotification),
    /// The physical connection dropped
    ConnectionLost,
}

/// Name-level difference between two tool sets
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolDiff {
    /// Tools whose name is new
    pub added: Vec<Tool>,
    /// Tools whose name disappeared
    pub removed: Vec<Tool>,
}

impl ToolDiff {
    /// Nothing changed by name
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Set difference by name in both directions.
///
/// Definitions whose name survives are not compared, so content-only changes
/// go unnoticed. Duplicate names in `new` are reported once.
#[must_use]
pub fn diff_tools(old: &[Tool], new: &[Tool]) -> ToolDiff {
    let old_names: HashSet<&str> = old.iter().map(|t| t.name.as_str()).collect();
    let new_names: HashSet<&str> = new.iter().map(|t| t.name.as_str()).collect();

    let mut seen = HashSet::new();
    let added = new
        .iter()
        .filter(|t| !old_names.contains(t.name.as_str()) && seen.insert(t.name.as_str()))
        .cloned()
        .collect();

    let mut seen = HashSet::new();
    let removed = old
        .iter()
        .filter(|t| !new_names.contains(t.name.as_str()) && seen.insert(t.name.as_str()))
        .cloned()
        .collect();

    ToolDiff { added, removed }
}

#[derive(Debug, Default)]
struct ConnectionState {
    connected: bool,
    healthy: bool,
    tools: Vec<Tool>,
    protocol: Option<ProtocolInfo>,
    last_error: Option<String>,
}

/// Keeps the registry in sync with one upstream
pub struct UpstreamManager {
    client: Arc<dyn UpstreamClient>,
    registry: Arc<ToolRegistry>,
    hub: Arc<NotificationHub>,
    policy: UpstreamPolicy,
    state: Mutex<ConnectionState>,
    events_tx: mpsc::UnboundedSender<UpstreamEvent>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<UpstreamEvent>>,
    cycle: tokio::sync::Mutex<()>,
}

impl UpstreamManager {
    /// Create a manager; nothing happens until [`run`](Self::run) or
    /// [`manage`](Self::manage) is called
    pub fn new(
        client: Arc<dyn UpstreamClient>,
        registry: Arc<ToolRegistry>,
        hub: Arc<NotificationHub>,
        policy: UpstreamPolicy,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            client,
            registry,
            hub,
            policy,
            state: Mutex::new(ConnectionState::default()),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
            cycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Status entry for the broker status document
    pub fn status(&self) -> ServerValidation {
        let state = self.state.lock();
        let ready = state.connected && state.healthy;
        let message = if ready {
            match &state.protocol {
                Some(p) => format!(
                    "connected ({}), serving {} tools",
                    p.protocol_version,
                    state.tools.len()
                ),
                None => format!("connected, serving {} tools", state.tools.len()),
            }
        } else {
            state
                .last_error
                .clone()
                .unwrap_or_else(|| "not yet connected".to_string())
        };
        ServerValidation {
            id: self.client.id(),
            name: self.client.name().to_string(),
            ready,
            message,
            total_tools: state.tools.len(),
        }
    }

    /// Drive the manager until `cancel` fires, then withdraw this upstream's
    /// tools. The first cycle runs immediately.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut events = self.events_rx.lock().await;
        let mut ticker = tokio::time::interval(self.policy.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(server = %self.client.name(), interval = ?self.policy.poll_interval, "Upstream manager started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => self.manage().await,
                Some(event) = events.recv() => self.handle_event(event).await,
            }
        }

        self.shutdown().await;
        info!(server = %self.client.name(), "Upstream manager stopped");
    }

    /// One manage cycle: (re)connect, ping, refresh tools
    pub async fn manage(&self) {
        let _cycle = self.cycle.lock().await;

        let connected = self.state.lock().connected;
        if !connected && let Err(e) = self.connect().await {
            self.mark_unreachable(&e.to_string()).await;
            return;
        }

        match timeout(self.policy.ping_timeout, self.client.ping()).await {
            Ok(Ok(())) => self.refresh_tools().await,
            Ok(Err(e)) => self.mark_unreachable(&format!("ping failed: {e}")).await,
            Err(_) => self.mark_unreachable("ping timed out").await,
        }
    }

    /// Handle one pushed event
    pub async fn handle_event(&self, event: UpstreamEvent) {
        let _cycle = self.cycle.lock().await;

        match event {
            UpstreamEvent::Notification(notification) if notification.method == TOOLS_LIST_CHANGED => {
                let delivered = self.hub.broadcast(notification);
                debug!(server = %self.client.name(), delivered, "Forwarded upstream tools/list_changed");
                if self.state.lock().connected {
                    self.refresh_tools().await;
                }
            }
            UpstreamEvent::Notification(notification) => {
                debug!(server = %self.client.name(), method = %notification.method, "Ignoring upstream notification");
            }
            UpstreamEvent::ConnectionLost => {
                if self.state.lock().connected {
                    self.mark_unreachable("connection lost").await;
                }
            }
        }
    }

    /// Handle every queued event without blocking; returns how many ran.
    ///
    /// Does nothing while [`run`](Self::run) owns the queue.
    pub async fn drain_events(&self) -> usize {
        let mut handled = 0;
        loop {
            let event = {
                let Ok(mut events) = self.events_rx.try_lock() else {
                    return handled;
                };
                match events.try_recv() {
                    Ok(event) => event,
                    Err(_) => return handled,
                }
            };
            self.handle_event(event).await;
            handled += 1;
        }
    }

    async fn connect(&self) -> Result<()> {
        let events = self.events_tx.clone();
        let on_connected: ConnectCallback = Box::new(move |client: &dyn UpstreamClient| {
            let notifications = events.clone();
            client.on_notification(Arc::new(move |notification| {
                let _ = notifications.send(UpstreamEvent::Notification(notification));
            }));
            client.on_connection_lost(Arc::new(move || {
                let _ = events.send(UpstreamEvent::ConnectionLost);
            }));
        });

        timeout(self.policy.handshake_timeout, self.client.connect(on_connected))
            .await
            .map_err(|_| Error::upstream(self.client.name(), "connect timed out"))??;

        let protocol = self.client.protocol_info();
        info!(
            server = %self.client.name(),
            protocol = ?protocol.as_ref().map(|p| p.protocol_version.as_str()),
            push = self.client.supports_tools_list_changed(),
            "Upstream connected"
        );
        let mut state = self.state.lock();
        state.connected = true;
        state.protocol = protocol;
        Ok(())
    }

    async fn refresh_tools(&self) {
        match timeout(self.policy.list_tools_timeout, self.client.list_tools()).await {
            Ok(Ok(tools)) => {
                self.apply_tools(tools);
            }
            Ok(Err(e)) => self.mark_unreachable(&format!("tools/list failed: {e}")).await,
            Err(_) => self.mark_unreachable("tools/list timed out").await,
        }
    }

    /// Apply a freshly listed tool set: removals first, then additions
    fn apply_tools(&self, tools: Vec<Tool>) -> ToolDiff {
        let name = self.client.name();
        let prefix = self.client.prefix();

        let diff = diff_tools(&self.state.lock().tools, &tools);

        if !diff.removed.is_empty() {
            let removed: Vec<String> = diff
                .removed
                .iter()
                .map(|t| prefixed_name(prefix, &t.name))
                .collect();
            self.registry.delete_tools(name, &removed);
        }
        if !diff.added.is_empty() {
            self.registry.add_tools(
                diff.added
                    .iter()
                    .map(|t| RegisteredTool::from_upstream(name, prefix, t)),
            );
        }

        {
            let mut state = self.state.lock();
            state.tools = tools;
            state.healthy = true;
            state.last_error = None;
        }

        if !diff.is_empty() {
            info!(
                server = %name,
                added = diff.added.len(),
                removed = diff.removed.len(),
                "Upstream tool set changed"
            );
            if !self.client.supports_tools_list_changed() {
                self.hub
                    .broadcast(JsonRpcNotification::new(TOOLS_LIST_CHANGED, None));
            }
        }
        diff
    }

    async fn mark_unreachable(&self, reason: &str) {
        let name = self.client.name();
        let was_connected = {
            let mut state = self.state.lock();
            let was_connected = state.connected;
            state.connected = false;
            state.healthy = false;
            state.tools.clear();
            state.protocol = None;
            state.last_error = Some(reason.to_string());
            was_connected
        };

        warn!(server = %name, reason, "Upstream unreachable");
        telemetry_metrics::counter!("mcp_upstream_failures_total", "server" => name.to_string())
            .increment(1);

        if was_connected
            && let Err(e) = timeout(self.policy.ping_timeout, self.client.disconnect())
                .await
                .unwrap_or_else(|_| Err(Error::upstream(name, "disconnect timed out")))
        {
            debug!(server = %name, error = %e, "Disconnect after failure did not complete");
        }

        let removed = self.registry.remove_server(name);
        if was_connected {
            self.hub.broadcast(connection_lost(name, reason));
        }
        if !removed.is_empty() {
            self.hub
                .broadcast(JsonRpcNotification::new(TOOLS_LIST_CHANGED, None));
        }
    }

    async fn shutdown(&self) {
        let connected = std::mem::take(&mut *self.state.lock()).connected;
        if connected && let Err(e) = self.client.disconnect().await {
            debug!(server = %self.client.name(), error = %e, "Disconnect on shutdown failed");
        }
        if !self.registry.remove_server(self.client.name()).is_empty() {
            self.hub
                .broadcast(JsonRpcNotification::new(TOOLS_LIST_CHANGED, None));
        }
    }
}

/// Synthetic downstream notice that an upstream went away
fn connection_lost(server: &str, reason: &str) -> JsonRpcNotification {
    JsonRpcNotification::new(
        "notifications/message",
        Some(json!({
            "level": "warning",
            "logger": env!("CARGO_PKG_NAME"),
            "data": {
                "event": "upstream_connection_lost",
                "server": server,
                "reason": reason,
            }
        })),
    )
}
