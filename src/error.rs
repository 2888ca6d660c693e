//! Error types for the MCP broker/router

use std::io;

use thiserror::Error;

/// Result type alias for the broker/router
pub type Result<T> = std::result::Result<T, Error>;

/// Broker/router errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed or semantically invalid JSON-RPC/MCP envelope
    #[error("Invalid request: {0}")]
    Protocol(String),

    /// Tool name does not resolve to any registered upstream
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Tool exists but the request's overlays do not expose it
    #[error("Tool not permitted: {0}")]
    Forbidden(String),

    /// Upstream server could not be reached (connect, ping, list or handshake)
    #[error("Upstream {server} unavailable: {reason}")]
    UpstreamUnavailable {
        /// Upstream server name
        server: String,
        /// Failure description
        reason: String,
    },

    /// Session or authorization token rejected
    #[error("Session error: {0}")]
    Session(String),

    /// Two upstreams registered the same prefixed tool name
    #[error("Tool {tool} registered by {incoming} replaces the one from {existing}")]
    NamingConflict {
        /// Prefixed tool name
        tool: String,
        /// Server that owned the name before
        existing: String,
        /// Server that now owns the name
        incoming: String,
    },

    /// Broker status check failed
    #[error("Status check failed: {0}")]
    Status(String),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// JSON-RPC error returned by an upstream
    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc {
        /// Error code
        code: i32,
        /// Error message
        message: String,
        /// Optional data
        data: Option<serde_json::Value>,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a JSON-RPC error
    pub fn json_rpc(code: i32, message: impl Into<String>) -> Self {
        Self::JsonRpc {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Create an upstream-unavailable error
    pub fn upstream(server: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            server: server.into(),
            reason: reason.into(),
        }
    }

    /// Convert to JSON-RPC error code
    #[must_use]
    pub fn to_rpc_code(&self) -> i32 {
        match self {
            Self::JsonRpc { code, .. } => *code,
            Self::Json(_) => rpc_codes::PARSE_ERROR,
            Self::Protocol(_) => rpc_codes::INVALID_REQUEST,
            Self::ToolNotFound(_) | Self::Forbidden(_) => rpc_codes::INVALID_PARAMS,
            Self::Session(_) => rpc_codes::SESSION_ERROR,
            Self::UpstreamUnavailable { .. } | Self::Transport(_) => rpc_codes::SERVER_ERROR_START,
            _ => rpc_codes::INTERNAL_ERROR,
        }
    }

    /// HTTP status the proxy should answer with when this error ends a request
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Protocol(_) | Self::Json(_) => 400,
            Self::Forbidden(_) => 403,
            // Unknown or expired sessions answer 404 so MCP clients re-initialize.
            Self::ToolNotFound(_) | Self::Session(_) => 404,
            Self::UpstreamUnavailable { .. } | Self::Transport(_) | Self::Http(_) => 502,
            _ => 500,
        }
    }
}

/// Error returned from one intercepted request.
///
/// Carries the numeric status the proxy layer maps to a client-visible
/// rejection, and the underlying cause for structured logging.
#[derive(Error, Debug)]
#[error("{code}: {source}")]
pub struct RouterError {
    code: u16,
    #[source]
    source: Error,
}

impl RouterError {
    /// Wrap a cause with an explicit status code
    #[must_use]
    pub fn new(code: u16, source: Error) -> Self {
        Self { code, source }
    }

    /// Status code for the proxy
    #[must_use]
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Underlying cause
    #[must_use]
    pub fn cause(&self) -> &Error {
        &self.source
    }

    /// Consume and return the underlying cause
    #[must_use]
    pub fn into_cause(self) -> Error {
        self.source
    }
}

impl From<Error> for RouterError {
    fn from(source: Error) -> Self {
        Self {
            code: source.http_status(),
            source,
        }
    }
}

/// Standard JSON-RPC error codes
pub mod rpc_codes {
    /// Parse error - Invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - Not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Server error range start
    pub const SERVER_ERROR_START: i32 = -32000;
    /// Session missing, expired or not verifiable
    pub const SESSION_ERROR: i32 = -32001;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn router_error_exposes_code_and_cause() {
        let err = RouterError::from(Error::ToolNotFound("s_missing".to_string()));
        assert_eq!(err.code(), 404);
        assert!(matches!(err.cause(), Error::ToolNotFound(name) if name == "s_missing"));
        assert_eq!(
            err.source().map(ToString::to_string).as_deref(),
            Some("Tool not found: s_missing")
        );
    }

    #[test]
    fn explicit_code_overrides_mapping() {
        let err = RouterError::new(503, Error::Internal("draining".to_string()));
        assert_eq!(err.code(), 503);
        assert_eq!(err.to_string(), "503: Internal error: draining");
    }

    #[test]
    fn taxonomy_maps_to_http_status() {
        assert_eq!(Error::Protocol("x".into()).http_status(), 400);
        assert_eq!(Error::Session("x".into()).http_status(), 404);
        assert_eq!(Error::Forbidden("x".into()).http_status(), 403);
        assert_eq!(Error::upstream("a", "down").http_status(), 502);
        assert_eq!(Error::Config("x".into()).http_status(), 500);
    }

    #[test]
    fn rpc_codes_follow_error_kind() {
        assert_eq!(Error::Protocol("x".into()).to_rpc_code(), -32600);
        assert_eq!(Error::json_rpc(-32099, "custom").to_rpc_code(), -32099);
        assert_eq!(Error::upstream("a", "down").to_rpc_code(), -32000);
    }
}
