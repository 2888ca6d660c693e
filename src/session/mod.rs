//! Gateway sessions.
//!
//! A downstream client holds one signed gateway session token. Each upstream
//! it reaches through a tool call gets its own backend session, created on the
//! first routed call and remembered here until the record expires.

mod binder;
mod token;

pub use binder::{BackendSession, HttpSessionInitializer, SessionBinder, SessionInitializer};
pub use token::{SessionClaims, SessionTokens};

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

/// Per-token session state
#[derive(Debug, Clone)]
pub struct SessionRecord {
    /// When the record was created
    pub created_at: Instant,
    /// Upstream descriptor id -> backend session id
    pub upstreams: HashMap<String, String>,
}

impl SessionRecord {
    fn new() -> Self {
        Self {
            created_at: Instant::now(),
            upstreams: HashMap::new(),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() >= ttl
    }
}

/// In-memory, TTL-bounded session cache
#[derive(Debug)]
pub struct SessionCache {
    ttl: Duration,
    sessions: Mutex<HashMap<String, SessionRecord>>,
}

impl SessionCache {
    /// Create a cache whose records live for `ttl`
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Create the record for a freshly issued token; false if it exists
    pub fn open(&self, token: &str) -> bool {
        let mut sessions = self.sessions.lock();
        if sessions.get(token).is_some_and(|r| !r.is_expired(self.ttl)) {
            return false;
        }
        sessions.insert(token.to_string(), SessionRecord::new());
        true
    }

    /// Bind an upstream session; true only when the binding is new
    pub fn add_session(&self, token: &str, upstream: &str, upstream_session: &str) -> bool {
        let mut sessions = self.sessions.lock();
        let record = sessions
            .entry(token.to_string())
            .or_insert_with(SessionRecord::new);
        if record.is_expired(self.ttl) {
            *record = SessionRecord::new();
        }
        if record.upstreams.contains_key(upstream) {
            return false;
        }
        record
            .upstreams
            .insert(upstream.to_string(), upstream_session.to_string());
        true
    }

    /// Backend session bound to `(token, upstream)`, unless expired
    #[must_use]
    pub fn get_session(&self, token: &str, upstream: &str) -> Option<String> {
        let sessions = self.sessions.lock();
        let record = sessions.get(token)?;
        if record.is_expired(self.ttl) {
            return None;
        }
        record.upstreams.get(upstream).cloned()
    }

    /// Whether a live record exists for the token
    #[must_use]
    pub fn contains(&self, token: &str) -> bool {
        self.sessions
            .lock()
            .get(token)
            .is_some_and(|r| !r.is_expired(self.ttl))
    }

    /// Forget every binding to the given upstream descriptor ids, returning
    /// how many were dropped
    pub fn forget_upstreams(&self, upstreams: &[String]) -> usize {
        if upstreams.is_empty() {
            return 0;
        }
        let mut removed = 0;
        for record in self.sessions.lock().values_mut() {
            let before = record.upstreams.len();
            record.upstreams.retain(|id, _| !upstreams.contains(id));
            removed += before - record.upstreams.len();
        }
        removed
    }

    /// Terminate a session
    pub fn remove(&self, token: &str) -> bool {
        self.sessions.lock().remove(token).is_some()
    }

    /// Drop expired records, returning how many were removed
    pub fn sweep_expired(&self) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, record| !record.is_expired(self.ttl));
        let removed = before - sessions.len();
        if removed > 0 {
            debug!(removed, remaining = sessions.len(), "Swept expired sessions");
        }
        removed
    }

    /// Number of records (expired ones included until swept)
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether there are no records
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}
