//! Configuration management

use std::{collections::HashSet, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Listen addresses and process limits
    pub server: ServerConfig,
    /// Public-facing gateway values
    pub gateway: GatewayConfig,
    /// Gateway session tokens
    pub session: SessionConfig,
    /// `x-authorized-tools` overlay verification
    pub authorized_tools: AuthorizedToolsConfig,
    /// Upstream polling and timeouts
    pub upstream: UpstreamPolicyConfig,
    /// Downstream notification streaming
    pub streaming: StreamingConfig,
    /// Upstream MCP servers
    pub servers: Vec<UpstreamConfig>,
    /// Virtual servers (named tool allow-lists)
    pub virtual_servers: Vec<VirtualServerConfig>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or describes an inconsistent set of servers.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // MCP_GATEWAY_GATEWAY__PUBLIC_HOST=... style overrides
        figment = figment.merge(Env::prefixed("MCP_GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars()?;
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = match (path_str.starts_with('~'), dirs::home_dir()) {
                (true, Some(home)) => path_str.replacen('~', &home.display().to_string(), 1),
                _ => path_str.clone(),
            };

            let path = Path::new(&expanded);
            if !path.exists() {
                tracing::debug!("Env file not found (skipped): {expanded}");
                continue;
            }
            match dotenvy::from_path(path) {
                Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in config values
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        for server in &mut self.servers {
            server.url = expand_string(&re, &server.url);
            server.hostname = expand_string(&re, &server.hostname);
            if let Some(credential) = server.credential.as_mut() {
                *credential = expand_string(&re, credential);
            }
        }
        self.gateway.public_host = expand_string(&re, &self.gateway.public_host);
        self.session.signing_key = expand_string(&re, &self.session.signing_key);
        if let Some(key) = self.authorized_tools.key.as_mut() {
            *key = expand_string(&re, key);
        }
        Ok(())
    }

    /// Check cross-field consistency
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on duplicate or empty server names and
    /// unparseable upstream URLs.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for server in &self.servers {
            if server.name.is_empty() {
                return Err(Error::Config("server with empty name".to_string()));
            }
            if !names.insert(server.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate server name: {}",
                    server.name
                )));
            }
            Url::parse(&server.url).map_err(|e| {
                Error::Config(format!("server {} has invalid url {}: {e}", server.name, server.url))
            })?;
        }

        let mut virtual_names = HashSet::new();
        for vs in &self.virtual_servers {
            if !virtual_names.insert(vs.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate virtual server name: {}",
                    vs.name
                )));
            }
        }
        Ok(())
    }

    /// Get enabled upstream servers only
    pub fn enabled_servers(&self) -> impl Iterator<Item = &UpstreamConfig> {
        self.servers.iter().filter(|s| s.enabled)
    }

    /// Look up an upstream server by name
    #[must_use]
    pub fn server(&self, name: &str) -> Option<&UpstreamConfig> {
        self.servers.iter().find(|s| s.name == name)
    }
}

/// Expand environment variables in a string
fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Resolve a secret reference: `env:VAR_NAME` reads the variable, anything
/// else is taken literally
fn resolve_secret(value: &str) -> String {
    match value.strip_prefix("env:") {
        Some(var_name) => env::var(var_name).unwrap_or_else(|_| value.to_string()),
        None => value.to_string(),
    }
}

/// Listen addresses and process limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port of the broker MCP/status HTTP endpoint
    pub broker_port: u16,
    /// Port of the ext_proc gRPC endpoint
    pub ext_proc_port: u16,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            broker_port: 8080,
            ext_proc_port: 50051,
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024,
        }
    }
}

/// Public-facing gateway values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Hostname clients use to reach the gateway; may be a wildcard such as
    /// `*.mcp.example.com`
    pub public_host: String,
    /// Path of the MCP endpoint on the broker
    pub mcp_path: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            public_host: "localhost".to_string(),
            mcp_path: "/mcp".to_string(),
        }
    }
}

/// Gateway session token settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// HMAC key for session tokens.
    /// Supports: literal value, `env:VAR_NAME`, or `auto` (random per process)
    pub signing_key: String,
    /// Session lifetime
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// How often expired session records are dropped
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signing_key: "auto".to_string(),
            ttl: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl SessionConfig {
    /// Resolve the signing key (expand `env:`, generate if `auto`)
    #[must_use]
    pub fn resolve_signing_key(&self) -> String {
        if self.signing_key == "auto" {
            format!("{}{}", uuid::Uuid::new_v4().simple(), uuid::Uuid::new_v4().simple())
        } else {
            resolve_secret(&self.signing_key)
        }
    }
}

/// Algorithm used to sign `x-authorized-tools` tokens
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenAlgorithm {
    /// HMAC-SHA256 with a shared secret
    #[default]
    HS256,
    /// ECDSA P-256, key is a PEM public key
    ES256,
}

/// `x-authorized-tools` overlay verification
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizedToolsConfig {
    /// Honour the header; when false it is ignored
    pub enabled: bool,
    /// Signature algorithm
    pub algorithm: TokenAlgorithm,
    /// Shared secret (HS256) or PEM public key (ES256).
    /// Supports literal value, `env:VAR_NAME`, or `file:/path`
    pub key: Option<String>,
}

impl AuthorizedToolsConfig {
    /// Resolve the verification key material
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when enabled without a key, or when a
    /// `file:` key cannot be read.
    pub fn resolve_key(&self) -> Result<Vec<u8>> {
        let key = self
            .key
            .as_deref()
            .ok_or_else(|| Error::Config("authorized_tools.key is required".to_string()))?;
        match key.strip_prefix("file:") {
            Some(path) => std::fs::read(path)
                .map_err(|e| Error::Config(format!("cannot read authorized_tools key {path}: {e}"))),
            None => Ok(resolve_secret(key).into_bytes()),
        }
    }
}

/// Upstream polling and timeouts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamPolicyConfig {
    /// Interval between manage cycles
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Ping timeout
    #[serde(with = "humantime_serde")]
    pub ping_timeout: Duration,
    /// Connect/initialize handshake timeout
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// `tools/list` timeout
    #[serde(with = "humantime_serde")]
    pub list_tools_timeout: Duration,
}

impl Default for UpstreamPolicyConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            ping_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            list_tools_timeout: Duration::from_secs(30),
        }
    }
}

/// Streaming configuration (for downstream notifications)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Notification buffer size per session
    pub buffer_size: usize,
    /// Keep-alive interval for SSE streams
    #[serde(with = "humantime_serde")]
    pub keep_alive_interval: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            keep_alive_interval: Duration::from_secs(15),
        }
    }
}

/// Upstream MCP server descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Unique server name
    pub name: String,
    /// Streamable HTTP endpoint of the server
    pub url: String,
    /// Hostname the proxy routes to; derived from `url` when empty
    #[serde(default)]
    pub hostname: String,
    /// Prefix prepended to every tool name (may be empty)
    #[serde(default)]
    pub prefix: String,
    /// Bearer credential (supports `env:VAR_NAME`)
    #[serde(default)]
    pub credential: Option<String>,
    /// Whether the server is managed at all
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl UpstreamConfig {
    /// Minimal enabled descriptor
    pub fn new(name: impl Into<String>, url: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            hostname: String::new(),
            prefix: prefix.into(),
            credential: None,
            enabled: true,
        }
    }

    /// Stable identity; changes whenever name, prefix or URL change
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}:{}:{}", self.name, self.prefix, self.url)
    }

    /// `:authority` the proxy should send to this server
    #[must_use]
    pub fn authority(&self) -> String {
        if !self.hostname.is_empty() {
            return self.hostname.clone();
        }
        Url::parse(&self.url)
            .ok()
            .and_then(|url| {
                let host = url.host_str()?.to_string();
                Some(match url.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host,
                })
            })
            .unwrap_or_default()
    }

    /// `:path` of the server's MCP endpoint, including any query string
    #[must_use]
    pub fn path(&self) -> String {
        let Ok(url) = Url::parse(&self.url) else {
            return "/mcp".to_string();
        };
        let mut path = url.path().to_string();
        if path.is_empty() || path == "/" {
            path = "/mcp".to_string();
        }
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        path
    }

    /// Resolve the bearer credential
    #[must_use]
    pub fn resolve_credential(&self) -> Option<String> {
        self.credential
            .as_deref()
            .map(resolve_secret)
            .filter(|c| !c.is_empty())
    }
}

/// Named tool allow-list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualServerConfig {
    /// Name selected by the `x-mcp-virtualserver` header
    pub name: String,
    /// Prefixed tool names exposed by this virtual server
    #[serde(default)]
    pub tools: Vec<String>,
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "2h", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse "100ms", "30s", "5m", "2h" or bare seconds
    ///
    /// # Errors
    ///
    /// Returns the integer parse error for malformed input.
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        // "ms" must be checked before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
