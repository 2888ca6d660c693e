//! Transport to upstream MCP servers

mod http;

pub use self::http::{HttpTransport, SseParser, sse_messages};
