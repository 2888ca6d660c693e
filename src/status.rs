//! Broker status document and the client that checks it.
//!
//! Each broker replica serves `GET /status` describing every upstream it
//! manages. External reconcilers use [`StatusValidator`] to ask "is server X
//! ready?" across all replicas they can discover.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{Error, Result};

/// Path of the status endpoint on a broker
pub const STATUS_PATH: &str = "/status";

/// Readiness of one upstream server as seen by one broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerValidation {
    /// Stable server identity (name, prefix and URL)
    pub id: String,
    /// Server name
    pub name: String,
    /// Connected and serving tools
    pub ready: bool,
    /// Human-readable state
    #[serde(default)]
    pub message: String,
    /// Number of tools currently served
    #[serde(default)]
    pub total_tools: usize,
}

/// Body of `GET /status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusDocument {
    /// Every server is ready
    pub overall_valid: bool,
    /// Per-server entries
    #[serde(default)]
    pub servers: Vec<ServerValidation>,
    /// When the document was produced
    pub timestamp: DateTime<Utc>,
}

impl StatusDocument {
    /// Build a document stamped now
    #[must_use]
    pub fn new(servers: Vec<ServerValidation>) -> Self {
        Self {
            overall_valid: servers.iter().all(|s| s.ready),
            servers,
            timestamp: Utc::now(),
        }
    }
}

/// Source of broker endpoints (base URLs)
#[async_trait]
pub trait EndpointDiscovery: Send + Sync {
    /// Current set of broker base URLs
    async fn endpoints(&self) -> Result<Vec<String>>;
}

/// Fixed endpoint list
#[derive(Debug, Clone)]
pub struct StaticEndpoints(pub Vec<String>);

#[async_trait]
impl EndpointDiscovery for StaticEndpoints {
    async fn endpoints(&self) -> Result<Vec<String>> {
        Ok(self.0.clone())
    }
}

/// Queries broker status endpoints
pub struct StatusValidator {
    client: reqwest::Client,
    discovery: Arc<dyn EndpointDiscovery>,
}

impl StatusValidator {
    /// Create a validator; `timeout` bounds each status request
    pub fn new(discovery: Arc<dyn EndpointDiscovery>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Self { client, discovery })
    }

    /// Fetch the status document of every reachable endpoint.
    ///
    /// Unreachable endpoints are skipped; a reachable endpoint answering
    /// non-2xx or an undecodable body fails the whole check.
    pub async fn fetch_all(&self) -> Result<Vec<StatusDocument>> {
        let endpoints = self.discovery.endpoints().await?;
        if endpoints.is_empty() {
            return Err(Error::Status("no broker endpoints discovered".to_string()));
        }

        let mut documents = Vec::with_capacity(endpoints.len());
        let mut unreachable = Vec::new();
        for endpoint in &endpoints {
            let url = status_url(endpoint);
            let response = match self.client.get(&url).send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(endpoint = %url, error = %e, "Broker status endpoint unreachable");
                    unreachable.push(url);
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                return Err(Error::Status(format!("{url} returned HTTP {status}")));
            }
            let document: StatusDocument = response
                .json()
                .await
                .map_err(|e| Error::Status(format!("{url} returned an undecodable body: {e}")))?;
            debug!(endpoint = %url, servers = document.servers.len(), "Fetched broker status");
            documents.push(document);
        }

        if documents.is_empty() {
            return Err(Error::Status(format!(
                "no reachable broker endpoints (tried {})",
                unreachable.join(", ")
            )));
        }
        Ok(documents)
    }

    /// First entry across all brokers whose id or name matches `server`
    pub async fn validate_server(&self, server: &str) -> Result<Option<ServerValidation>> {
        let documents = self.fetch_all().await?;
        Ok(documents
            .into_iter()
            .flat_map(|d| d.servers)
            .find(|s| s.id == server || s.name == server))
    }
}

fn status_url(endpoint: &str) -> String {
    let base = endpoint.trim_end_matches('/');
    if base.ends_with(STATUS_PATH) {
        base.to_string()
    } else {
        format!("{base}{STATUS_PATH}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(name: &str, ready: bool) -> ServerValidation {
        ServerValidation {
            id: format!("{name}::http://{name}/mcp"),
            name: name.to_string(),
            ready,
            message: String::new(),
            total_tools: 0,
        }
    }

    #[test]
    fn overall_valid_requires_every_server() {
        assert!(StatusDocument::new(vec![entry("a", true), entry("b", true)]).overall_valid);
        assert!(!StatusDocument::new(vec![entry("a", true), entry("b", false)]).overall_valid);
        assert!(StatusDocument::new(Vec::new()).overall_valid);
    }

    #[test]
    fn document_uses_camel_case() {
        let mut server = entry("a", true);
        server.total_tools = 3;
        let json = serde_json::to_value(StatusDocument::new(vec![server])).unwrap();
        assert_eq!(json["overallValid"], true);
        assert_eq!(json["servers"][0]["totalTools"], 3);
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn document_decodes_without_optional_fields() {
        let doc: StatusDocument = serde_json::from_value(json!({
            "overallValid": false,
            "servers": [{"id": "x", "name": "x", "ready": false}],
            "timestamp": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(doc.servers[0].total_tools, 0);
    }

    #[test]
    fn status_url_is_appended_once() {
        assert_eq!(status_url("http://b:8080"), "http://b:8080/status");
        assert_eq!(status_url("http://b:8080/"), "http://b:8080/status");
        assert_eq!(status_url("http://b:8080/status"), "http://b:8080/status");
    }

    #[tokio::test]
    async fn no_endpoints_is_an_error() {
        let validator =
            StatusValidator::new(Arc::new(StaticEndpoints(Vec::new())), Duration::from_secs(1))
                .unwrap();
        assert!(matches!(validator.validate_server("a").await, Err(Error::Status(_))));
    }
}
