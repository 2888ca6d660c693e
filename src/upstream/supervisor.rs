//! Owns one [`UpstreamManager`] task per enabled upstream

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{LiveUpstream, UpstreamClient, UpstreamManager, UpstreamPolicy};
use crate::broker::NotificationHub;
use crate::config::UpstreamConfig;
use crate::registry::ToolRegistry;
use crate::status::ServerValidation;

/// Builds a client for a descriptor
pub type ClientFactory = Arc<dyn Fn(&UpstreamConfig) -> Arc<dyn UpstreamClient> + Send + Sync>;

struct Running {
    config: UpstreamConfig,
    manager: Arc<UpstreamManager>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Names of servers touched by one reconcile pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Managers started
    pub started: Vec<String>,
    /// Managers stopped
    pub stopped: Vec<String>,
}

/// Keeps the set of running managers equal to the enabled descriptors
pub struct UpstreamSupervisor {
    factory: ClientFactory,
    registry: Arc<ToolRegistry>,
    hub: Arc<NotificationHub>,
    policy: UpstreamPolicy,
    running: DashMap<String, Running>,
    reconcile: tokio::sync::Mutex<()>,
}

impl UpstreamSupervisor {
    /// Create a supervisor; call [`reconcile`](Self::reconcile) to start managers
    pub fn new(
        factory: ClientFactory,
        registry: Arc<ToolRegistry>,
        hub: Arc<NotificationHub>,
        policy: UpstreamPolicy,
    ) -> Self {
        Self {
            factory,
            registry,
            hub,
            policy,
            running: DashMap::new(),
            reconcile: tokio::sync::Mutex::new(()),
        }
    }

    /// Factory producing [`LiveUpstream`] clients
    #[must_use]
    pub fn live_factory(request_timeout: Duration) -> ClientFactory {
        Arc::new(move |config: &UpstreamConfig| {
            Arc::new(LiveUpstream::new(config.clone(), request_timeout)) as Arc<dyn UpstreamClient>
        })
    }

    /// Bring the running managers in line with `servers`.
    ///
    /// A descriptor whose identity or any other field changed is treated as
    /// remove plus add.
    /// Removed managers are fully stopped, tools withdrawn, before new ones
    /// start, so a renamed prefix never briefly exposes both name sets.
    pub async fn reconcile(&self, servers: &[UpstreamConfig]) -> ReconcileReport {
        let _serial = self.reconcile.lock().await;

        let desired: HashMap<String, &UpstreamConfig> = servers
            .iter()
            .filter(|s| s.enabled)
            .map(|s| (s.id(), s))
            .collect();

        let stale: Vec<String> = self
            .running
            .iter()
            .filter(|entry| desired.get(entry.key()).is_none_or(|c| **c != entry.config))
            .map(|entry| entry.key().clone())
            .collect();

        let mut report = ReconcileReport::default();
        for id in stale {
            if let Some((_, running)) = self.running.remove(&id) {
                report.stopped.push(running.config.name.clone());
                stop(running).await;
            }
        }

        let mut seen = HashSet::new();
        for (id, config) in desired {
            if self.running.contains_key(&id) || !seen.insert(config.name.clone()) {
                continue;
            }
            let client = (self.factory)(config);
            let manager = Arc::new(UpstreamManager::new(
                client,
                Arc::clone(&self.registry),
                Arc::clone(&self.hub),
                self.policy,
            ));
            let cancel = CancellationToken::new();
            let task = tokio::spawn(Arc::clone(&manager).run(cancel.clone()));
            info!(server = %config.name, url = %config.url, prefix = %config.prefix, "Started upstream manager");
            report.started.push(config.name.clone());
            self.running.insert(
                id,
                Running {
                    config: config.clone(),
                    manager,
                    cancel,
                    task,
                },
            );
        }

        report.started.sort();
        report.stopped.sort();
        report
    }

    /// Stop every manager
    pub async fn shutdown(&self) {
        let _serial = self.reconcile.lock().await;
        let ids: Vec<String> = self.running.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, running)) = self.running.remove(&id) {
                stop(running).await;
            }
        }
    }

    /// Status of every managed upstream, ordered by name
    pub fn statuses(&self) -> Vec<ServerValidation> {
        let mut statuses: Vec<ServerValidation> = self
            .running
            .iter()
            .map(|entry| entry.manager.status())
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Number of running managers
    pub fn len(&self) -> usize {
        self.running.len()
    }

    /// No managers running
    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }
}

async fn stop(running: Running) {
    running.cancel.cancel();
    if let Err(e) = running.task.await {
        warn!(server = %running.config.name, error = %e, "Upstream manager task failed");
    }
    info!(server = %running.config.name, "Stopped upstream manager");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Tool;
    use crate::upstream::MemoryUpstream;
    use pretty_assertions::assert_eq;

    fn factory() -> ClientFactory {
        Arc::new(|config: &UpstreamConfig| {
            Arc::new(MemoryUpstream::new(
                config.clone(),
                vec![Tool::named("echo"), Tool::named("add")],
            )) as Arc<dyn UpstreamClient>
        })
    }

    fn supervisor() -> (UpstreamSupervisor, Arc<ToolRegistry>) {
        let registry = Arc::new(ToolRegistry::new());
        let supervisor = UpstreamSupervisor::new(
            factory(),
            Arc::clone(&registry),
            Arc::new(NotificationHub::new(8)),
            UpstreamPolicy::default(),
        );
        (supervisor, registry)
    }

    async fn wait_for(registry: &ToolRegistry, len: usize) {
        for _ in 0..100 {
            if registry.len() == len {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("registry never reached {len} tools (has {})", registry.len());
    }

    fn names(registry: &ToolRegistry) -> Vec<String> {
        registry.list_tools().into_iter().map(|e| e.tool.name).collect()
    }

    #[tokio::test]
    async fn reconcile_starts_enabled_servers_only() {
        let (supervisor, registry) = supervisor();
        let mut disabled = UpstreamConfig::new("off", "http://off/mcp", "off_");
        disabled.enabled = false;
        let report = supervisor
            .reconcile(&[UpstreamConfig::new("s1", "http://s1/mcp", "s1_"), disabled])
            .await;

        assert_eq!(report.started, vec!["s1"]);
        wait_for(&registry, 2).await;
        assert_eq!(names(&registry), vec!["s1_add", "s1_echo"]);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn removing_a_server_withdraws_its_tools() {
        let (supervisor, registry) = supervisor();
        let s1 = UpstreamConfig::new("s1", "http://s1/mcp", "s1_");
        let s2 = UpstreamConfig::new("s2", "http://s2/mcp", "s2_");
        supervisor.reconcile(&[s1.clone(), s2]).await;
        wait_for(&registry, 4).await;

        let report = supervisor.reconcile(&[s1]).await;
        assert_eq!(report.stopped, vec!["s2"]);
        assert!(report.started.is_empty());
        assert_eq!(names(&registry), vec!["s1_add", "s1_echo"]);
        assert_eq!(supervisor.len(), 1);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn prefix_change_restarts_the_manager() {
        let (supervisor, registry) = supervisor();
        supervisor
            .reconcile(&[UpstreamConfig::new("s1", "http://s1/mcp", "old_")])
            .await;
        wait_for(&registry, 2).await;

        let report = supervisor
            .reconcile(&[UpstreamConfig::new("s1", "http://s1/mcp", "new_")])
            .await;
        assert_eq!(report.stopped, vec!["s1"]);
        assert_eq!(report.started, vec!["s1"]);
        wait_for(&registry, 2).await;
        assert_eq!(names(&registry), vec!["new_add", "new_echo"]);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn unchanged_config_is_a_no_op() {
        let (supervisor, _registry) = supervisor();
        let servers = [UpstreamConfig::new("s1", "http://s1/mcp", "s1_")];
        supervisor.reconcile(&servers).await;
        assert_eq!(supervisor.reconcile(&servers).await, ReconcileReport::default());
        supervisor.shutdown().await;
        assert!(supervisor.is_empty());
    }
}
