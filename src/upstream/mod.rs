//! Upstream MCP servers.
//!
//! Every configured server is driven by one [`UpstreamManager`] task that
//! keeps the aggregated registry in sync with the server's tool set. The
//! [`UpstreamSupervisor`] owns the managers and follows configuration changes.

mod live;
mod manager;
mod memory;
mod supervisor;

pub use live::LiveUpstream;
pub use manager::{ToolDiff, UpstreamEvent, UpstreamManager, UpstreamPolicy, diff_tools};
pub use memory::MemoryUpstream;
pub use supervisor::{ClientFactory, ReconcileReport, UpstreamSupervisor};

use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;
use crate::config::UpstreamConfig;
use crate::protocol::{JsonRpcNotification, Tool};

/// Handler for notifications pushed by an upstream
pub type NotificationHandler = Arc<dyn Fn(JsonRpcNotification) + Send + Sync>;

/// Handler invoked when an established connection drops
pub type ConnectionLostHandler = Arc<dyn Fn() + Send + Sync>;

/// Callback run once per physical connection, right after it is established
pub type ConnectCallback = Box<dyn FnOnce(&dyn UpstreamClient) + Send>;

/// What an upstream told us during the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolInfo {
    /// Negotiated protocol version
    pub protocol_version: String,
    /// Upstream's self-reported name
    pub server_name: String,
    /// Whether it announces `notifications/tools/list_changed`
    pub tools_list_changed: bool,
}

/// Capability set the manager needs from an upstream connection
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Server descriptor this client was built from
    fn config(&self) -> &UpstreamConfig;

    /// Server name
    fn name(&self) -> &str {
        &self.config().name
    }

    /// Tool name prefix
    fn prefix(&self) -> &str {
        &self.config().prefix
    }

    /// Stable identity of the descriptor
    fn id(&self) -> String {
        self.config().id()
    }

    /// Establish the backend session; `on_connected` runs once on success
    async fn connect(&self, on_connected: ConnectCallback) -> Result<()>;

    /// Tear the connection down
    async fn disconnect(&self) -> Result<()>;

    /// Liveness check
    async fn ping(&self) -> Result<()>;

    /// Current (unprefixed) tool set
    async fn list_tools(&self) -> Result<Vec<Tool>>;

    /// Handshake results, once connected
    fn protocol_info(&self) -> Option<ProtocolInfo>;

    /// Whether list-changed notifications actually reach us from this upstream
    fn supports_tools_list_changed(&self) -> bool;

    /// Install the notification handler
    fn on_notification(&self, handler: NotificationHandler);

    /// Install the connection-loss handler
    fn on_connection_lost(&self, handler: ConnectionLostHandler);
}
