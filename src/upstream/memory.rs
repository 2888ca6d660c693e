//! In-memory upstream for tests and local experiments

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::{
    ConnectCallback, ConnectionLostHandler, NotificationHandler, ProtocolInfo, UpstreamClient,
};
use crate::config::UpstreamConfig;
use crate::protocol::{JsonRpcNotification, PROTOCOL_VERSION, TOOLS_LIST_CHANGED, Tool};
use crate::{Error, Result};

/// Scriptable upstream whose tool set and reachability are set by the caller
pub struct MemoryUpstream {
    config: UpstreamConfig,
    tools: Mutex<Vec<Tool>>,
    reachable: AtomicBool,
    connected: AtomicBool,
    pushes_list_changed: bool,
    notification: RwLock<Option<NotificationHandler>>,
    lost: RwLock<Option<ConnectionLostHandler>>,
    connects: AtomicUsize,
}

impl MemoryUpstream {
    /// Reachable upstream serving `tools`
    #[must_use]
    pub fn new(config: UpstreamConfig, tools: Vec<Tool>) -> Self {
        Self {
            config,
            tools: Mutex::new(tools),
            reachable: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            pushes_list_changed: false,
            notification: RwLock::new(None),
            lost: RwLock::new(None),
            connects: AtomicUsize::new(0),
        }
    }

    /// Announce (and deliver) `notifications/tools/list_changed`
    #[must_use]
    pub fn with_list_changed_push(mut self) -> Self {
        self.pushes_list_changed = true;
        self
    }

    /// Replace the served tool set
    pub fn set_tools(&self, tools: Vec<Tool>) {
        *self.tools.lock() = tools;
    }

    /// Make every call fail (or succeed again)
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Deliver a notification through the installed handler.
    ///
    /// Returns false when no handler is installed.
    pub fn push(&self, notification: JsonRpcNotification) -> bool {
        let handler = self.notification.read().clone();
        match handler {
            Some(handler) => {
                handler(notification);
                true
            }
            None => false,
        }
    }

    /// Replace the tool set and push `tools/list_changed`
    pub fn push_tools(&self, tools: Vec<Tool>) -> bool {
        self.set_tools(tools);
        self.push(JsonRpcNotification::new(TOOLS_LIST_CHANGED, None))
    }

    /// Simulate the connection dropping
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let handler = self.lost.read().clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    /// How many times `connect` succeeded
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(Error::upstream(&self.config.name, "unreachable"));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::upstream(&self.config.name, "not connected"));
        }
        Ok(())
    }
}

#[async_trait]
impl UpstreamClient for MemoryUpstream {
    fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    async fn connect(&self, on_connected: ConnectCallback) -> Result<()> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(Error::upstream(&self.config.name, "connection refused"));
        }
        self.connected.store(true, Ordering::SeqCst);
        self.connects.fetch_add(1, Ordering::SeqCst);
        on_connected(self);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn list_tools(&self) -> Result<Vec<Tool>> {
        self.check()?;
        Ok(self.tools.lock().clone())
    }

    fn protocol_info(&self) -> Option<ProtocolInfo> {
        self.connected.load(Ordering::SeqCst).then(|| ProtocolInfo {
            protocol_version: PROTOCOL_VERSION.to_string(),
            server_name: self.config.name.clone(),
            tools_list_changed: self.pushes_list_changed,
        })
    }

    fn supports_tools_list_changed(&self) -> bool {
        self.pushes_list_changed
    }

    fn on_notification(&self, handler: NotificationHandler) {
        *self.notification.write() = Some(handler);
    }

    fn on_connection_lost(&self, handler: ConnectionLostHandler) {
        *self.lost.write() = Some(handler);
    }
}
