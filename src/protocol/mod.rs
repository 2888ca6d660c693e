//! MCP Protocol types

mod mcp_message;
mod messages;
mod types;

pub use mcp_message::*;
pub use messages::*;
pub use types::*;

/// MCP Protocol version spoken by the broker and used for upstream handshakes
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Protocol versions the broker accepts from downstream clients, newest first
pub const SUPPORTED_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// Pick the version to answer an `initialize` with.
///
/// Echoes the client's version when supported, otherwise offers the latest.
#[must_use]
pub fn negotiate_version(requested: &str) -> &'static str {
    SUPPORTED_VERSIONS
        .iter()
        .find(|v| **v == requested)
        .copied()
        .unwrap_or(PROTOCOL_VERSION)
}
