//! Lazy creation of backend sessions

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};

use super::SessionCache;
use crate::config::UpstreamConfig;
use crate::protocol::RequestHeaders;
use crate::transport::HttpTransport;
use crate::{Error, Result};

/// Backend session established on behalf of one gateway session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSession {
    /// Session id issued by the upstream (empty for stateless upstreams)
    pub session_id: String,
    /// Negotiated protocol version
    pub protocol_version: String,
}

/// Strategy that opens a backend session with an upstream
#[async_trait]
pub trait SessionInitializer: Send + Sync {
    /// Perform the MCP handshake with `server` for `gateway_session`
    async fn initialize(
        &self,
        gateway_session: &str,
        server_name: &str,
        server: &UpstreamConfig,
        headers: &RequestHeaders,
    ) -> Result<BackendSession>;
}

/// Opens backend sessions over streamable HTTP
pub struct HttpSessionInitializer {
    timeout: Duration,
}

impl HttpSessionInitializer {
    /// Create an initializer bounding each handshake by `timeout`
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl SessionInitializer for HttpSessionInitializer {
    async fn initialize(
        &self,
        gateway_session: &str,
        server_name: &str,
        server: &UpstreamConfig,
        headers: &RequestHeaders,
    ) -> Result<BackendSession> {
        // The configured credential wins over whatever the client sent.
        let authorization = server
            .resolve_credential()
            .map(|c| format!("Bearer {c}"))
            .or_else(|| headers.get("authorization").map(str::to_string));
        let forwarded: Vec<(&str, &str)> = authorization
            .as_deref()
            .map(|a| ("authorization", a))
            .into_iter()
            .collect();

        let transport = HttpTransport::new(&server.url, forwarded, self.timeout)?;
        let result = tokio::time::timeout(self.timeout, transport.initialize())
            .await
            .map_err(|_| Error::upstream(server_name, "session handshake timed out"))??;

        let session_id = transport.session_id().unwrap_or_default();
        debug!(
            server = %server_name,
            gateway_session = %gateway_session,
            stateless = session_id.is_empty(),
            "Opened backend session"
        );
        Ok(BackendSession {
            session_id,
            protocol_version: result.protocol_version,
        })
    }
}

/// Returns the backend session for a `(gateway session, upstream)` pair,
/// creating it on first use.
///
/// Concurrent first calls for the same pair are serialized so the initializer
/// runs once per binding.
pub struct SessionBinder {
    cache: Arc<SessionCache>,
    initializer: Arc<dyn SessionInitializer>,
    pending: DashMap<(String, String), Arc<tokio::sync::Mutex<()>>>,
}

impl SessionBinder {
    /// Create a binder over a shared cache
    pub fn new(cache: Arc<SessionCache>, initializer: Arc<dyn SessionInitializer>) -> Self {
        Self {
            cache,
            initializer,
            pending: DashMap::new(),
        }
    }

    /// The underlying cache
    #[must_use]
    pub fn cache(&self) -> &Arc<SessionCache> {
        &self.cache
    }

    /// Existing or newly created backend session id.
    ///
    /// Bindings are keyed by the descriptor id, so a server whose url or
    /// prefix changed gets a fresh handshake.
    pub async fn upstream_session(
        &self,
        gateway_session: &str,
        server: &UpstreamConfig,
        headers: &RequestHeaders,
    ) -> Result<String> {
        let upstream = server.id();
        if let Some(id) = self.cache.get_session(gateway_session, &upstream) {
            return Ok(id);
        }

        let key = (gateway_session.to_string(), upstream.clone());
        let gate = Arc::clone(self.pending.entry(key.clone()).or_default().value());
        let _guard = gate.lock().await;

        // Another caller may have finished the handshake while we waited.
        if let Some(id) = self.cache.get_session(gateway_session, &upstream) {
            return Ok(id);
        }

        let result = self
            .initializer
            .initialize(gateway_session, &server.name, server, headers)
            .await;
        let outcome = result.map(|backend| {
            self.cache
                .add_session(gateway_session, &upstream, &backend.session_id);
            info!(
                server = %server.name,
                protocol = %backend.protocol_version,
                "Bound backend session"
            );
            backend.session_id
        });
        self.pending.remove(&key);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingInitializer {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl SessionInitializer for CountingInitializer {
        async fn initialize(
            &self,
            _gateway_session: &str,
            server_name: &str,
            _server: &UpstreamConfig,
            _headers: &RequestHeaders,
        ) -> Result<BackendSession> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail {
                return Err(Error::upstream(server_name, "refused"));
            }
            Ok(BackendSession {
                session_id: format!("{server_name}-{n}"),
                protocol_version: "2025-06-18".to_string(),
            })
        }
    }

    fn binder(fail: bool) -> (Arc<SessionBinder>, Arc<CountingInitializer>) {
        let initializer = Arc::new(CountingInitializer {
            calls: AtomicUsize::new(0),
            fail,
        });
        let cache = Arc::new(SessionCache::new(Duration::from_secs(3600)));
        (
            Arc::new(SessionBinder::new(cache, initializer.clone())),
            initializer,
        )
    }

    #[tokio::test]
    async fn initializes_once_per_binding() {
        let (binder, init) = binder(false);
        let server = UpstreamConfig::new("s1", "http://s1/mcp", "s1_");
        let headers = RequestHeaders::new();

        let first = binder.upstream_session("tok", &server, &headers).await.unwrap();
        let second = binder.upstream_session("tok", &server, &headers).await.unwrap();
        assert_eq!(first, "s1-0");
        assert_eq!(first, second);
        assert_eq!(init.calls.load(Ordering::SeqCst), 1);

        binder.upstream_session("other", &server, &headers).await.unwrap();
        assert_eq!(init.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_first_calls_share_one_handshake() {
        let (binder, init) = binder(false);
        let server = UpstreamConfig::new("s1", "http://s1/mcp", "");

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let binder = Arc::clone(&binder);
                let server = server.clone();
                tokio::spawn(async move {
                    binder
                        .upstream_session("tok", &server, &RequestHeaders::new())
                        .await
                        .unwrap()
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap(), "s1-0");
        }
        assert_eq!(init.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let (binder, init) = binder(true);
        let server = UpstreamConfig::new("s1", "http://s1/mcp", "");
        let headers = RequestHeaders::new();

        assert!(binder.upstream_session("tok", &server, &headers).await.is_err());
        assert!(binder.upstream_session("tok", &server, &headers).await.is_err());
        assert_eq!(init.calls.load(Ordering::SeqCst), 2);
        assert_eq!(binder.cache().get_session("tok", &server.id()), None);
    }

    #[tokio::test]
    async fn changed_descriptor_gets_a_fresh_handshake() {
        let (binder, init) = binder(false);
        let headers = RequestHeaders::new();
        let before = UpstreamConfig::new("s1", "http://old-host:9000/mcp", "s1_");
        let after = UpstreamConfig::new("s1", "http://new-host:9000/mcp", "s1_");

        assert_eq!(binder.upstream_session("tok", &before, &headers).await.unwrap(), "s1-0");
        assert_eq!(binder.upstream_session("tok", &after, &headers).await.unwrap(), "s1-1");
        assert_eq!(init.calls.load(Ordering::SeqCst), 2);

        let reprefixed = UpstreamConfig::new("s1", "http://new-host:9000/mcp", "x_");
        assert_eq!(binder.upstream_session("tok", &reprefixed, &headers).await.unwrap(), "s1-2");
    }
}
