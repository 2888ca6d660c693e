//! MCP Broker/Router Library
//!
//! Aggregates many upstream MCP servers behind one prefixed tool surface and
//! routes tool calls to their owners through an Envoy external processor.
//!
//! # Components
//!
//! - **Upstream managers**: poll and listen to each upstream, keep the
//!   aggregated registry in sync
//! - **Broker**: MCP endpoint for `initialize`, `tools/list`, notifications
//!   and the status document
//! - **Router**: ext_proc service that rewrites `tools/call` requests to the
//!   owning upstream with a lazily created backend session
//! - **Status validator**: checks upstream readiness across broker replicas

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod authz;
pub mod broker;
pub mod cli;
pub mod config;
pub mod config_reload;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod status;
pub mod transport;
pub mod upstream;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(format!("tracing already initialized: {e}"))),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(format!("tracing already initialized: {e}"))),
    }
}
