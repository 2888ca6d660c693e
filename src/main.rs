//! MCP broker/router - one prefixed tool surface over many upstream MCP servers

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use mcp_broker_router::{
    cli::{Cli, Command},
    config::Config,
    server::Gateway,
    setup_tracing,
    status::{StaticEndpoints, StatusValidator},
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::CheckServer {
            ref server,
            ref endpoints,
            timeout,
        }) => match check_server(server, endpoints.clone(), timeout).await {
            Ok(true) => ExitCode::SUCCESS,
            Ok(false) => ExitCode::from(2),
            Err(e) => {
                eprintln!("Status check failed: {e:#}");
                ExitCode::FAILURE
            }
        },
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Print the server's status entry; `Ok(false)` when absent or not ready
async fn check_server(server: &str, endpoints: Vec<String>, timeout: Duration) -> anyhow::Result<bool> {
    let validator = StatusValidator::new(Arc::new(StaticEndpoints(endpoints)), timeout)
        .context("building status client")?;
    let entry = validator
        .validate_server(server)
        .await
        .with_context(|| format!("checking server {server}"))?;

    match entry {
        Some(entry) => {
            println!("{}", serde_json::to_string_pretty(&entry)?);
            Ok(entry.ready)
        }
        None => {
            println!("server {server} is not known to any broker");
            Ok(false)
        }
    }
}

/// Run the broker and router
async fn run_server(cli: Cli) -> ExitCode {
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.broker_port {
                config.server.broker_port = port;
            }
            if let Some(port) = cli.ext_proc_port {
                config.server.ext_proc_port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            if let Some(ref public_host) = cli.public_host {
                config.gateway.public_host = public_host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        broker_port = config.server.broker_port,
        ext_proc_port = config.server.ext_proc_port,
        servers = config.servers.len(),
        "Starting MCP broker/router"
    );

    let watch_path = if cli.no_watch { None } else { cli.config.clone() };
    if let Err(e) = Gateway::new(config, watch_path).run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
