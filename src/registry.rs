//! Aggregated tool registry.
//!
//! Holds the union of every live upstream's current tool set, keyed by the
//! prefixed tool name. Upstream managers are the only writers; the broker and
//! the ext_proc router read snapshots.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tracing::warn;

use crate::protocol::Tool;

/// Prefix a tool name
#[must_use]
pub fn prefixed_name(prefix: &str, name: &str) -> String {
    format!("{prefix}{name}")
}

/// Strip a server prefix from a tool name; `None` if it does not carry it
#[must_use]
pub fn unprefixed_name<'a>(prefix: &str, name: &'a str) -> Option<&'a str> {
    name.strip_prefix(prefix)
}

/// One entry in the aggregated registry
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredTool {
    /// Owning upstream server name
    pub server: String,
    /// Name the upstream itself knows the tool by
    pub upstream_name: String,
    /// Definition as exposed downstream (name is prefixed)
    pub tool: Tool,
}

impl RegisteredTool {
    /// Build an entry from an upstream definition
    #[must_use]
    pub fn from_upstream(server: &str, prefix: &str, tool: &Tool) -> Self {
        Self {
            server: server.to_string(),
            upstream_name: tool.name.clone(),
            tool: tool.renamed(prefixed_name(prefix, &tool.name)),
        }
    }

    /// Prefixed (downstream-visible) name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.tool.name
    }
}

/// Thread-safe tool registry.
///
/// Every upstream currently serving a name keeps its claim. The most recent
/// claim is the visible entry; when it is withdrawn the next most recent one
/// takes over, so the registry stays the union of live tool sets.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: Mutex<BTreeMap<String, Vec<RegisteredTool>>>,
}

impl ToolRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert entries by prefixed name; the last writer wins.
    ///
    /// Replacing an entry owned by another server is logged and counted.
    pub fn add_tools(&self, entries: impl IntoIterator<Item = RegisteredTool>) {
        let mut tools = self.tools.lock();
        for entry in entries {
            let name = entry.name().to_string();
            let claims = tools.entry(name.clone()).or_default();
            if let Some(previous) = claims.last()
                && previous.server != entry.server
            {
                let conflict = crate::Error::NamingConflict {
                    tool: name.clone(),
                    existing: previous.server.clone(),
                    incoming: entry.server.clone(),
                };
                warn!(tool = %name, existing = %previous.server, incoming = %entry.server, "{conflict}");
                telemetry_metrics::counter!("mcp_registry_naming_conflicts_total").increment(1);
            }
            claims.retain(|c| c.server != entry.server);
            claims.push(entry);
        }
    }

    /// Withdraw `server`'s claim on each prefixed name.
    ///
    /// Entries owned by other servers are left in place; unknown names are
    /// ignored.
    pub fn delete_tools<S: AsRef<str>>(&self, server: &str, names: &[S]) {
        let mut tools = self.tools.lock();
        for name in names {
            withdraw(&mut tools, name.as_ref(), server);
        }
    }

    /// Snapshot of every visible entry, ordered by name
    #[must_use]
    pub fn list_tools(&self) -> Vec<RegisteredTool> {
        self.tools
            .lock()
            .values()
            .filter_map(|claims| claims.last().cloned())
            .collect()
    }

    /// Resolve a prefixed name
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<RegisteredTool> {
        self.tools.lock().get(name).and_then(|c| c.last().cloned())
    }

    /// Withdraw every claim held by `server`, returning the affected names
    pub fn remove_server(&self, server: &str) -> Vec<String> {
        let mut tools = self.tools.lock();
        let names: Vec<String> = tools
            .iter()
            .filter(|(_, claims)| claims.iter().any(|c| c.server == server))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &names {
            withdraw(&mut tools, name, server);
        }
        names
    }

    /// Number of visible tools
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.lock().len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.lock().is_empty()
    }
}

fn withdraw(tools: &mut BTreeMap<String, Vec<RegisteredTool>>, name: &str, server: &str) {
    let Some(claims) = tools.get_mut(name) else {
        return;
    };
    claims.retain(|c| c.server != server);
    if claims.is_empty() {
        tools.remove(name);
    }
}
