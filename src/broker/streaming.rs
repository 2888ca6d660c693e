//! Downstream notification fan-out
//!
//! Every downstream session gets a broadcast channel when it initializes.
//! `GET /mcp` subscribes to that channel and relays JSON-RPC notifications as
//! SSE `message` events. Upstream managers publish through [`NotificationHub::broadcast`].

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_stream::stream;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::protocol::JsonRpcNotification;

/// A notification stamped with a hub-wide event id
#[derive(Debug, Clone)]
pub struct HubEvent {
    /// Event id (`evt-N`)
    pub id: String,
    /// The JSON-RPC notification
    pub notification: JsonRpcNotification,
}

/// Fan-out of notifications to downstream sessions
pub struct NotificationHub {
    /// Senders by gateway session token
    sessions: RwLock<HashMap<String, broadcast::Sender<HubEvent>>>,
    /// Per-session buffer
    buffer_size: usize,
    /// Event ID counter (global, for uniqueness)
    event_counter: AtomicU64,
}

impl NotificationHub {
    /// Create a hub with the given per-session buffer
    #[must_use]
    pub fn new(buffer_size: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            buffer_size: buffer_size.max(1),
            event_counter: AtomicU64::new(1),
        }
    }

    /// Register a session (idempotent) and return a receiver for it
    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<HubEvent> {
        let mut sessions = self.sessions.write();
        if let Some(tx) = sessions.get(session_id) {
            return tx.subscribe();
        }
        let (tx, rx) = broadcast::channel(self.buffer_size);
        sessions.insert(session_id.to_string(), tx);
        info!(session_id = %session_id, "Registered notification session");
        rx
    }

    /// Remove a session; open streams end
    pub fn remove_session(&self, session_id: &str) {
        if self.sessions.write().remove(session_id).is_some() {
            info!(session_id = %session_id, "Removed notification session");
        }
    }

    /// Keep only sessions accepted by `keep`
    pub fn retain(&self, mut keep: impl FnMut(&str) -> bool) {
        self.sessions.write().retain(|id, _| keep(id));
    }

    /// Check if a session exists
    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions.read().contains_key(session_id)
    }

    /// Get session count
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Send a notification to a specific session
    pub fn send_to_session(&self, session_id: &str, notification: JsonRpcNotification) -> bool {
        let event = self.stamp(notification);
        let sessions = self.sessions.read();
        sessions
            .get(session_id)
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    /// Broadcast a notification to every session, returning how many
    /// currently have a listener
    pub fn broadcast(&self, notification: JsonRpcNotification) -> usize {
        let event = self.stamp(notification);
        let sessions = self.sessions.read();
        let delivered = sessions
            .values()
            .filter(|tx| tx.send(event.clone()).is_ok())
            .count();
        debug!(
            method = %event.notification.method,
            sessions = sessions.len(),
            delivered,
            "Broadcast notification"
        );
        delivered
    }

    fn stamp(&self, notification: JsonRpcNotification) -> HubEvent {
        let id = self.event_counter.fetch_add(1, Ordering::Relaxed);
        HubEvent {
            id: format!("evt-{id}"),
            notification,
        }
    }
}

/// Create SSE response for GET /mcp
///
/// Takes owned data to satisfy Rust 2024 lifetime capture rules for `impl Stream`.
pub fn create_sse_response(
    hub: Arc<NotificationHub>,
    session_id: String,
    keep_alive_interval: Duration,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let mut rx = hub.subscribe(&session_id);

    let stream = stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let data = serde_json::to_string(&event.notification).unwrap_or_default();
                    yield Ok(Event::default().event("message").id(event.id).data(data));
                }
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // Client fell behind, notify them
                    yield Ok(Event::default()
                        .event("lagged")
                        .data(json!({ "missed": n }).to_string()));
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(keep_alive_interval).text("ping"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TOOLS_LIST_CHANGED;

    fn list_changed() -> JsonRpcNotification {
        JsonRpcNotification::new(TOOLS_LIST_CHANGED, None)
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let hub = NotificationHub::new(16);
        let _rx = hub.subscribe("s1");
        let _rx2 = hub.subscribe("s1");
        assert!(hub.has_session("s1"));
        assert_eq!(hub.session_count(), 1);

        hub.remove_session("s1");
        assert!(!hub.has_session("s1"));
        assert_eq!(hub.session_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_session() {
        let hub = NotificationHub::new(16);
        let mut rx1 = hub.subscribe("session-1");
        let mut rx2 = hub.subscribe("session-2");

        assert_eq!(hub.broadcast(list_changed()), 2);

        let r1 = rx1.recv().await.unwrap();
        let r2 = rx2.recv().await.unwrap();
        assert_eq!(r1.notification.method, TOOLS_LIST_CHANGED);
        assert_eq!(r1.id, r2.id);
    }

    #[tokio::test]
    async fn test_send_to_session() {
        let hub = NotificationHub::new(16);
        let mut rx = hub.subscribe("only");
        assert!(hub.send_to_session("only", list_changed()));
        assert!(!hub.send_to_session("missing", list_changed()));
        assert_eq!(rx.recv().await.unwrap().notification, list_changed());
    }

    #[tokio::test]
    async fn test_sessions_without_listeners_are_not_counted() {
        let hub = NotificationHub::new(16);
        drop(hub.subscribe("idle"));
        assert_eq!(hub.broadcast(list_changed()), 0);
        assert!(hub.has_session("idle"));
    }

    #[test]
    fn test_retain() {
        let hub = NotificationHub::new(4);
        drop(hub.subscribe("keep"));
        drop(hub.subscribe("drop"));
        hub.retain(|id| id == "keep");
        assert!(hub.has_session("keep"));
        assert!(!hub.has_session("drop"));
    }
}
