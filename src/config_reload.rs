//! Config hot-reload with diff patching.
//!
//! Watches the configuration file, computes a structural diff against the
//! running config and applies the parts that can change without a restart:
//! the upstream server list and the virtual server definitions.
//!
//! # Limitations
//!
//! Listener addresses, the public host and session settings are read once at
//! startup. Changes to them are logged with a warning and otherwise ignored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::authz::AccessPolicy;
use crate::config::{Config, UpstreamConfig};
use crate::router::McpRouter;
use crate::upstream::UpstreamSupervisor;
use crate::{Error, Result};

const DEBOUNCE: Duration = Duration::from_millis(500);

/// Structural diff between two [`Config`] snapshots
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConfigPatch {
    /// Enabled servers present only in the new config
    pub servers_added: Vec<String>,
    /// Enabled servers absent (or disabled) in the new config
    pub servers_removed: Vec<String>,
    /// Servers present in both whose descriptor changed
    pub servers_modified: Vec<String>,
    /// Virtual server definitions changed
    pub virtual_servers_changed: bool,
    /// Settings that only take effect after a restart changed
    pub restart_required: bool,
}

impl ConfigPatch {
    /// Returns `true` when no changes were detected
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.servers_added.is_empty()
            && self.servers_removed.is_empty()
            && self.servers_modified.is_empty()
            && !self.virtual_servers_changed
            && !self.restart_required
    }

    /// Whether the upstream set must be reconciled
    #[must_use]
    pub fn servers_changed(&self) -> bool {
        !(self.servers_added.is_empty()
            && self.servers_removed.is_empty()
            && self.servers_modified.is_empty())
    }

    /// Human-readable summary of the patch
    #[must_use]
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        for (label, names) in [
            ("added servers", &self.servers_added),
            ("removed servers", &self.servers_removed),
            ("modified servers", &self.servers_modified),
        ] {
            if !names.is_empty() {
                parts.push(format!("{label}: [{}]", names.join(", ")));
            }
        }
        if self.virtual_servers_changed {
            parts.push("virtual servers changed".to_string());
        }
        if self.restart_required {
            parts.push("process settings changed (restart required)".to_string());
        }
        if parts.is_empty() {
            "no changes".to_string()
        } else {
            parts.join("; ")
        }
    }
}

/// Atomically swappable config snapshot
pub struct LiveConfig {
    inner: RwLock<Arc<Config>>,
}

impl LiveConfig {
    /// Seed with the startup configuration
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            inner: RwLock::new(Arc::new(config)),
        }
    }

    /// Current snapshot
    #[must_use]
    pub fn get(&self) -> Arc<Config> {
        Arc::clone(&self.inner.read())
    }

    /// Replace the snapshot
    pub fn set(&self, config: Config) {
        *self.inner.write() = Arc::new(config);
    }
}

/// Compute the structural diff between two config snapshots
#[must_use]
pub fn compute_diff(old: &Config, new: &Config) -> ConfigPatch {
    let enabled = |c: &Config| -> HashMap<String, UpstreamConfig> {
        c.enabled_servers()
            .map(|s| (s.name.clone(), s.clone()))
            .collect()
    };
    let old_servers = enabled(old);
    let new_servers = enabled(new);

    let mut patch = ConfigPatch::default();
    for (name, server) in &new_servers {
        match old_servers.get(name) {
            None => patch.servers_added.push(name.clone()),
            Some(previous) if previous != server => patch.servers_modified.push(name.clone()),
            Some(_) => {}
        }
    }
    patch.servers_removed = old_servers
        .keys()
        .filter(|name| !new_servers.contains_key(*name))
        .cloned()
        .collect();
    patch.servers_added.sort();
    patch.servers_removed.sort();
    patch.servers_modified.sort();

    patch.virtual_servers_changed = old.virtual_servers != new.virtual_servers;
    patch.restart_required = old.server != new.server
        || old.gateway != new.gateway
        || old.session != new.session
        || old.authorized_tools != new.authorized_tools
        || old.upstream != new.upstream
        || old.streaming != new.streaming;
    patch
}

/// Everything a reload has to touch
pub struct ReloadContext {
    config_path: PathBuf,
    live_config: Arc<LiveConfig>,
    supervisor: Arc<UpstreamSupervisor>,
    router: Arc<McpRouter>,
    policy: Arc<AccessPolicy>,
}

impl ReloadContext {
    /// Create a reload context
    #[must_use]
    pub fn new(
        config_path: PathBuf,
        live_config: Arc<LiveConfig>,
        supervisor: Arc<UpstreamSupervisor>,
        router: Arc<McpRouter>,
        policy: Arc<AccessPolicy>,
    ) -> Self {
        Self {
            config_path,
            live_config,
            supervisor,
            router,
            policy,
        }
    }

    /// Re-read the config file and apply the diff
    pub async fn reload(&self) -> Result<ConfigPatch> {
        let config = Config::load(Some(&self.config_path))?;
        Ok(self.apply(config).await)
    }

    /// Apply a new configuration snapshot
    pub async fn apply(&self, new_config: Config) -> ConfigPatch {
        let patch = compute_diff(&self.live_config.get(), &new_config);
        if patch.is_empty() {
            debug!("Config reload: no changes detected");
            return patch;
        }
        info!(changes = %patch.summary(), "Config reload: applying patch");

        if patch.restart_required {
            warn!("Config reload: listener, session or timing settings changed; restart required to apply them");
        }
        if patch.servers_changed() {
            // Descriptors first, so calls for a removed owner fail fast.
            self.router.set_servers(&new_config.servers);
            let report = self.supervisor.reconcile(&new_config.servers).await;
            info!(started = ?report.started, stopped = ?report.stopped, "Config reload: upstreams reconciled");
        }
        if patch.virtual_servers_changed {
            self.policy.set_virtual_servers(&new_config.virtual_servers);
            info!(count = new_config.virtual_servers.len(), "Config reload: virtual servers updated");
        }

        self.live_config.set(new_config);
        patch
    }
}

/// File watcher that triggers hot-reload on config file changes.
///
/// Holds the underlying `notify` watcher alive for the lifetime of the struct.
pub struct ConfigWatcher {
    _watcher: Mutex<Option<RecommendedWatcher>>,
}

impl ConfigWatcher {
    /// Start watching the context's config file until `cancel` fires
    pub fn start(context: Arc<ReloadContext>, cancel: CancellationToken) -> Result<Self> {
        let (event_tx, event_rx) = tokio::sync::mpsc::channel(32);
        let watcher = create_notify_watcher(event_tx, &context.config_path)?;
        tokio::spawn(reload_loop(context, event_rx, cancel));
        Ok(Self {
            _watcher: Mutex::new(Some(watcher)),
        })
    }
}

fn create_notify_watcher(
    event_tx: tokio::sync::mpsc::Sender<()>,
    config_path: &Path,
) -> Result<RecommendedWatcher> {
    let watch_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let file_name = config_path.file_name().map(ToOwned::to_owned);

    let mut watcher = RecommendedWatcher::new(
        move |result: std::result::Result<Event, notify::Error>| {
            let relevant = result
                .as_ref()
                .is_ok_and(|e| is_config_event(e, file_name.as_deref()));
            if relevant {
                let _ = event_tx.try_send(());
            }
        },
        NotifyConfig::default().with_poll_interval(Duration::from_secs(2)),
    )
    .map_err(|e| Error::Internal(format!("Failed to create config watcher: {e}")))?;

    watcher
        .watch(&watch_dir, RecursiveMode::NonRecursive)
        .map_err(|e| Error::Internal(format!("Failed to watch config path: {e}")))?;
    Ok(watcher)
}

/// Create/modify events touching the watched file name
fn is_config_event(event: &Event, file_name: Option<&std::ffi::OsStr>) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event
            .paths
            .iter()
            .any(|p| file_name.is_some_and(|name| p.file_name() == Some(name)))
}

async fn reload_loop(
    context: Arc<ReloadContext>,
    mut event_rx: tokio::sync::mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    let mut last_event: Option<Instant> = None;
    let mut ticker = tokio::time::interval(Duration::from_millis(100));

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!("Config watcher shutting down");
                break;
            }
            Some(()) = event_rx.recv() => last_event = Some(Instant::now()),
            _ = ticker.tick() => {
                if last_event.is_some_and(|t| t.elapsed() >= DEBOUNCE) {
                    last_event = None;
                    if let Err(e) = context.reload().await {
                        warn!(error = %e, "Config reload failed, keeping current config");
                    }
                }
            }
        }
    }
}
