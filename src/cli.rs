//! Command-line interface

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::config::humantime_serde;

/// MCP broker and Envoy ext_proc router
#[derive(Parser, Debug)]
#[command(name = "mcp-broker-router")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "MCP_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Broker HTTP port
    #[arg(long, env = "MCP_GATEWAY_BROKER_PORT")]
    pub broker_port: Option<u16>,

    /// ext_proc gRPC port
    #[arg(long, env = "MCP_GATEWAY_EXT_PROC_PORT")]
    pub ext_proc_port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "MCP_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Public gateway hostname (may be a wildcard)
    #[arg(long, env = "MCP_GATEWAY_PUBLIC_HOST")]
    pub public_host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "MCP_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "MCP_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Disable config file hot-reload
    #[arg(long)]
    pub no_watch: bool,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the broker and router (default)
    Serve,

    /// Ask running brokers whether an upstream server is ready
    CheckServer {
        /// Server id (`name:prefix:url`) or name
        #[arg(required = true)]
        server: String,

        /// Broker base URL; repeat for every replica
        #[arg(short, long = "endpoint", required = true)]
        endpoints: Vec<String>,

        /// Per-request timeout (e.g. "5s", "500ms")
        #[arg(long, default_value = "5s", value_parser = parse_duration)]
        timeout: Duration,
    },
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime_serde::parse(s).map_err(|e| format!("invalid duration {s:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_server_collects_endpoints() {
        let cli = Cli::parse_from([
            "mcp-broker-router",
            "check-server",
            "weather",
            "-e",
            "http://a:8080",
            "--endpoint",
            "http://b:8080",
            "--timeout",
            "250ms",
        ]);
        let Some(Command::CheckServer {
            server,
            endpoints,
            timeout,
        }) = cli.command
        else {
            panic!("expected check-server");
        };
        assert_eq!(server, "weather");
        assert_eq!(endpoints, vec!["http://a:8080", "http://b:8080"]);
        assert_eq!(timeout, Duration::from_millis(250));
    }

    #[test]
    fn serve_is_the_default() {
        let cli = Cli::parse_from(["mcp-broker-router", "--broker-port", "9000"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.broker_port, Some(9000));
    }
}
