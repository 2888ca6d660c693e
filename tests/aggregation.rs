//! Aggregation tests: upstream managers keeping the registry in sync.
//!
//! Upstreams are in-memory, so these run without any network.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use mcp_broker_router::broker::NotificationHub;
use mcp_broker_router::config::UpstreamConfig;
use mcp_broker_router::protocol::{TOOLS_LIST_CHANGED, Tool};
use mcp_broker_router::registry::{ToolRegistry, prefixed_name, unprefixed_name};
use mcp_broker_router::upstream::{
    ClientFactory, MemoryUpstream, UpstreamClient, UpstreamPolicy, UpstreamSupervisor,
};
use pretty_assertions::assert_eq;

struct Harness {
    upstreams: Arc<DashMap<String, Arc<MemoryUpstream>>>,
    registry: Arc<ToolRegistry>,
    hub: Arc<NotificationHub>,
    supervisor: UpstreamSupervisor,
}

fn harness(initial: &[(&str, &[&str])], poll_interval: Duration) -> Harness {
    let seeded: Arc<DashMap<String, Vec<Tool>>> = Arc::new(
        initial
            .iter()
            .map(|(server, tools)| (server.to_string(), tools.iter().map(|t| Tool::named(*t)).collect()))
            .collect(),
    );
    let upstreams: Arc<DashMap<String, Arc<MemoryUpstream>>> = Arc::new(DashMap::new());

    let created = Arc::clone(&upstreams);
    let factory: ClientFactory = Arc::new(move |config: &UpstreamConfig| {
        let tools = seeded
            .get(&config.name)
            .map(|t| t.value().clone())
            .unwrap_or_default();
        let upstream = Arc::new(MemoryUpstream::new(config.clone(), tools));
        created.insert(config.name.clone(), Arc::clone(&upstream));
        upstream as Arc<dyn UpstreamClient>
    });

    let registry = Arc::new(ToolRegistry::new());
    let hub = Arc::new(NotificationHub::new(64));
    let policy = UpstreamPolicy {
        poll_interval,
        ..UpstreamPolicy::default()
    };
    let supervisor = UpstreamSupervisor::new(factory, Arc::clone(&registry), Arc::clone(&hub), policy);
    Harness {
        upstreams,
        registry,
        hub,
        supervisor,
    }
}

fn registry_names(registry: &ToolRegistry) -> Vec<String> {
    registry.list_tools().into_iter().map(|e| e.tool.name).collect()
}

async fn wait_for(registry: &ToolRegistry, expected: &[&str]) -> Vec<String> {
    for _ in 0..100 {
        let names = registry_names(registry);
        if names == expected {
            return names;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    registry_names(registry)
}

#[tokio::test]
async fn reconcile_exposes_prefixed_tools_from_every_server() {
    let h = harness(
        &[("weather", &["forecast", "alerts"]), ("files", &["read"])],
        Duration::from_secs(60),
    );
    let report = h
        .supervisor
        .reconcile(&[
            UpstreamConfig::new("weather", "http://weather/mcp", "w_"),
            UpstreamConfig::new("files", "http://files/mcp", "f_"),
        ])
        .await;
    assert_eq!(report.started, vec!["files", "weather"]);

    let names = wait_for(&h.registry, &["f_read", "w_alerts", "w_forecast"]).await;
    assert_eq!(names, vec!["f_read", "w_alerts", "w_forecast"]);

    let entry = h.registry.lookup("w_forecast").unwrap();
    assert_eq!(entry.server, "weather");
    assert_eq!(entry.upstream_name, "forecast");

    h.supervisor.shutdown().await;
    assert!(h.registry.is_empty());
}

#[tokio::test]
async fn reconcile_is_idempotent() {
    let h = harness(&[("weather", &["forecast"])], Duration::from_secs(60));
    let servers = [UpstreamConfig::new("weather", "http://weather/mcp", "w_")];

    h.supervisor.reconcile(&servers).await;
    wait_for(&h.registry, &["w_forecast"]).await;
    let again = h.supervisor.reconcile(&servers).await;

    assert!(again.started.is_empty());
    assert!(again.stopped.is_empty());
    assert_eq!(h.supervisor.len(), 1);
    assert_eq!(h.upstreams.get("weather").unwrap().connect_count(), 1);
    assert_eq!(registry_names(&h.registry), vec!["w_forecast"]);
    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn prefix_change_replaces_names_without_duplicates() {
    let h = harness(&[("weather", &["forecast"])], Duration::from_secs(60));
    h.supervisor
        .reconcile(&[UpstreamConfig::new("weather", "http://weather/mcp", "w_")])
        .await;
    wait_for(&h.registry, &["w_forecast"]).await;

    let report = h
        .supervisor
        .reconcile(&[UpstreamConfig::new("weather", "http://weather/mcp", "wx_")])
        .await;
    assert_eq!(report.stopped, vec!["weather"]);
    assert_eq!(report.started, vec!["weather"]);

    let names = wait_for(&h.registry, &["wx_forecast"]).await;
    assert_eq!(names, vec!["wx_forecast"]);
    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn removed_server_withdraws_its_tools() {
    let h = harness(
        &[("weather", &["forecast"]), ("files", &["read"])],
        Duration::from_secs(60),
    );
    h.supervisor
        .reconcile(&[
            UpstreamConfig::new("weather", "http://weather/mcp", "w_"),
            UpstreamConfig::new("files", "http://files/mcp", "f_"),
        ])
        .await;
    wait_for(&h.registry, &["f_read", "w_forecast"]).await;

    let report = h
        .supervisor
        .reconcile(&[UpstreamConfig::new("files", "http://files/mcp", "f_")])
        .await;
    assert_eq!(report.stopped, vec!["weather"]);
    assert_eq!(registry_names(&h.registry), vec!["f_read"]);
    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn polling_applies_tool_diffs_and_notifies_sessions() {
    let h = harness(&[("weather", &["forecast", "alerts"])], Duration::from_millis(30));
    h.supervisor
        .reconcile(&[UpstreamConfig::new("weather", "http://weather/mcp", "w_")])
        .await;
    wait_for(&h.registry, &["w_alerts", "w_forecast"]).await;
    let mut rx = h.hub.subscribe("client-1");

    h.upstreams
        .get("weather")
        .unwrap()
        .set_tools(vec![Tool::named("forecast"), Tool::named("radar")]);
    let names = wait_for(&h.registry, &["w_forecast", "w_radar"]).await;
    assert_eq!(names, vec!["w_forecast", "w_radar"]);

    let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("notification")
        .unwrap();
    assert_eq!(event.notification.method, TOOLS_LIST_CHANGED);
    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn unreachable_upstream_is_reported_and_recovers() {
    let h = harness(&[("weather", &["forecast"])], Duration::from_millis(30));
    h.supervisor
        .reconcile(&[UpstreamConfig::new("weather", "http://weather/mcp", "w_")])
        .await;
    wait_for(&h.registry, &["w_forecast"]).await;
    assert!(h.supervisor.statuses()[0].ready);

    h.upstreams.get("weather").unwrap().set_reachable(false);
    let names = wait_for(&h.registry, &[]).await;
    assert!(names.is_empty());
    let status = &h.supervisor.statuses()[0];
    assert!(!status.ready);
    assert_eq!(status.total_tools, 0);

    h.upstreams.get("weather").unwrap().set_reachable(true);
    let names = wait_for(&h.registry, &["w_forecast"]).await;
    assert_eq!(names, vec!["w_forecast"]);
    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn shared_tool_name_stays_while_any_upstream_serves_it() {
    let h = harness(
        &[("alpha", &["search", "index"]), ("beta", &["search"])],
        Duration::from_millis(30),
    );
    h.supervisor
        .reconcile(&[
            UpstreamConfig::new("alpha", "http://alpha/mcp", ""),
            UpstreamConfig::new("beta", "http://beta/mcp", ""),
        ])
        .await;
    wait_for(&h.registry, &["index", "search"]).await;
    for _ in 0..100 {
        if h.supervisor.statuses().iter().all(|s| s.ready) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    h.upstreams.get("alpha").unwrap().set_tools(vec![Tool::named("index")]);
    let names = wait_for(&h.registry, &["index", "search"]).await;
    assert_eq!(names, vec!["index", "search"]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.registry.lookup("search").unwrap().server, "beta");

    h.upstreams
        .get("alpha")
        .unwrap()
        .set_tools(vec![Tool::named("index"), Tool::named("search")]);
    for _ in 0..100 {
        if h.registry.lookup("search").is_some_and(|e| e.server == "alpha") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.registry.lookup("search").unwrap().server, "alpha");

    h.upstreams.get("alpha").unwrap().set_reachable(false);
    let names = wait_for(&h.registry, &["search"]).await;
    assert_eq!(names, vec!["search"]);
    assert_eq!(h.registry.lookup("search").unwrap().server, "beta");
    h.supervisor.shutdown().await;
}

#[test]
fn prefix_round_trip() {
    let name = prefixed_name("w_", "forecast");
    assert_eq!(name, "w_forecast");
    assert_eq!(unprefixed_name("w_", &name), Some("forecast"));
    assert_eq!(unprefixed_name("x_", &name), None);
    assert_eq!(prefixed_name("", "read"), "read");
}
