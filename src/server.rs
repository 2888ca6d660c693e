//! Process bootstrap: wires the shared components and runs both listeners

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::authz::AccessPolicy;
use crate::broker::{Broker, NotificationHub, create_router};
use crate::config::Config;
use crate::config_reload::{ConfigWatcher, LiveConfig, ReloadContext};
use crate::registry::ToolRegistry;
use crate::router::{McpRouter, serve_ext_proc};
use crate::session::{
    HttpSessionInitializer, SessionBinder, SessionCache, SessionInitializer, SessionTokens,
};
use crate::upstream::{ClientFactory, UpstreamPolicy, UpstreamSupervisor};
use crate::{Error, Result};

/// Shared components, built once per process
pub struct Services {
    /// Aggregated tool registry
    pub registry: Arc<ToolRegistry>,
    /// Downstream notification fan-out
    pub hub: Arc<NotificationHub>,
    /// Gateway session records
    pub sessions: Arc<SessionCache>,
    /// Session token issuer/verifier
    pub tokens: Arc<SessionTokens>,
    /// Request overlays
    pub policy: Arc<AccessPolicy>,
    /// Upstream managers
    pub supervisor: Arc<UpstreamSupervisor>,
    /// ext_proc routing core
    pub router: Arc<McpRouter>,
    /// Broker MCP endpoint state
    pub broker: Arc<Broker>,
}

impl Services {
    /// Wire the components for `config`.
    ///
    /// Upstream managers are not started; call
    /// [`UpstreamSupervisor::reconcile`] with the server list.
    pub fn build(
        config: &Config,
        factory: ClientFactory,
        initializer: Arc<dyn SessionInitializer>,
    ) -> Result<Self> {
        if config.session.signing_key == "auto" {
            warn!("session.signing_key is auto: sessions do not survive restarts or span replicas");
        }
        let secret = config.session.resolve_signing_key();
        if secret.is_empty() {
            return Err(Error::Config("session.signing_key resolves to an empty key".to_string()));
        }

        let registry = Arc::new(ToolRegistry::new());
        let hub = Arc::new(NotificationHub::new(config.streaming.buffer_size));
        let sessions = Arc::new(SessionCache::new(config.session.ttl));
        let tokens = Arc::new(SessionTokens::new(secret.as_bytes(), config.session.ttl));
        let policy = Arc::new(AccessPolicy::new(
            &config.authorized_tools,
            &config.virtual_servers,
        )?);
        let supervisor = Arc::new(UpstreamSupervisor::new(
            factory,
            Arc::clone(&registry),
            Arc::clone(&hub),
            UpstreamPolicy::from(&config.upstream),
        ));
        let binder = Arc::new(SessionBinder::new(Arc::clone(&sessions), initializer));
        let router = Arc::new(McpRouter::new(
            config.gateway.public_host.clone(),
            Arc::clone(&registry),
            binder,
            Arc::clone(&tokens),
            Arc::clone(&policy),
        ));
        router.set_servers(&config.servers);
        let broker = Arc::new(Broker::new(
            Arc::clone(&registry),
            Arc::clone(&hub),
            Arc::clone(&tokens),
            Arc::clone(&sessions),
            Arc::clone(&policy),
            Arc::clone(&supervisor),
            config.streaming.keep_alive_interval,
        ));

        Ok(Self {
            registry,
            hub,
            sessions,
            tokens,
            policy,
            supervisor,
            router,
            broker,
        })
    }
}

/// The broker/router process
pub struct Gateway {
    config: Config,
    config_path: Option<PathBuf>,
}

impl Gateway {
    /// Create a gateway; `config_path` enables hot reload
    #[must_use]
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Self {
        Self {
            config,
            config_path,
        }
    }

    /// Run until SIGINT/SIGTERM
    pub async fn run(self) -> Result<()> {
        let cancel = CancellationToken::new();
        tokio::spawn(shutdown_signal(cancel.clone()));
        self.run_until(cancel).await
    }

    /// Run until `cancel` fires
    pub async fn run_until(self, cancel: CancellationToken) -> Result<()> {
        let config = self.config;
        let host: IpAddr = config
            .server
            .host
            .parse()
            .map_err(|e| Error::Config(format!("Invalid host: {e}")))?;

        let services = Services::build(
            &config,
            UpstreamSupervisor::live_factory(config.upstream.list_tools_timeout),
            Arc::new(HttpSessionInitializer::new(config.upstream.handshake_timeout)),
        )?;

        let broker_listener = TcpListener::bind(SocketAddr::new(host, config.server.broker_port)).await?;
        let ext_proc_addr = SocketAddr::new(host, config.server.ext_proc_port);

        info!("============================================================");
        info!("MCP BROKER/ROUTER v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(addr = %broker_listener.local_addr()?, path = %config.gateway.mcp_path, "Broker listening");
        info!(addr = %ext_proc_addr, "ext_proc listening");
        info!(public_host = %config.gateway.public_host, servers = config.enabled_servers().count(), "Routing");
        if !config.authorized_tools.enabled {
            debug!("x-authorized-tools overlay disabled");
        }
        info!("============================================================");

        let report = services.supervisor.reconcile(&config.servers).await;
        info!(started = report.started.len(), "Upstream managers started");

        let sweeper = tokio::spawn(sweep_sessions(
            Arc::clone(&services.sessions),
            Arc::clone(&services.hub),
            config.session.sweep_interval,
            cancel.clone(),
        ));

        let _watcher = self.config_path.as_ref().and_then(|path| {
            let context = Arc::new(ReloadContext::new(
                path.clone(),
                Arc::new(LiveConfig::new(config.clone())),
                Arc::clone(&services.supervisor),
                Arc::clone(&services.router),
                Arc::clone(&services.policy),
            ));
            match ConfigWatcher::start(context, cancel.clone()) {
                Ok(watcher) => {
                    info!(path = %path.display(), "Config hot-reload enabled");
                    Some(watcher)
                }
                Err(e) => {
                    warn!(error = %e, "Failed to start config watcher, hot-reload disabled");
                    None
                }
            }
        });

        let ext_proc = tokio::spawn(serve_ext_proc(
            Arc::clone(&services.router),
            ext_proc_addr,
            cancel.clone(),
        ));

        let app = create_router(
            Arc::clone(&services.broker),
            &config.gateway.mcp_path,
            config.server.max_body_size,
        );
        let served = axum::serve(broker_listener, app)
            .with_graceful_shutdown(cancel.clone().cancelled_owned())
            .await
            .map_err(|e| Error::Internal(e.to_string()));
        // Either listener failing takes the process down.
        cancel.cancel();

        match tokio::time::timeout(config.server.shutdown_timeout, async {
            let ext_proc_result = ext_proc.await;
            services.supervisor.shutdown().await;
            let _ = sweeper.await;
            ext_proc_result
        })
        .await
        {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(error = %e, "ext_proc server stopped with an error"),
            Ok(Err(e)) => warn!(error = %e, "ext_proc task failed"),
            Err(_) => warn!(timeout = ?config.server.shutdown_timeout, "Shutdown timed out"),
        }

        info!("Gateway stopped");
        served
    }
}

/// Periodically drop expired session records and their notification streams
async fn sweep_sessions(
    sessions: Arc<SessionCache>,
    hub: Arc<NotificationHub>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                let removed = sessions.sweep_expired();
                hub.retain(|id| sessions.contains(id));
                if removed > 0 {
                    info!(removed, remaining = sessions.len(), "Swept expired sessions");
                }
            }
        }
    }
}

/// Cancel `cancel` on Ctrl+C or SIGTERM
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
        () = cancel.cancelled() => return,
    }

    info!("Shutdown signal received");
    cancel.cancel();
}
