//! Per-request tool visibility overlays.
//!
//! Two optional restrictions narrow the aggregated tool surface for a single
//! request, and intersect when both are present:
//!
//! - `x-mcp-virtualserver` names a configured virtual server whose allow-list
//!   holds prefixed tool names.
//! - `x-authorized-tools` carries a signed JWT whose `allowed-tools` claim maps
//!   an upstream server name to the unprefixed tool names it may use.

use std::collections::{HashMap, HashSet};

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{AuthorizedToolsConfig, TokenAlgorithm, VirtualServerConfig};
use crate::protocol::RequestHeaders;
use crate::registry::RegisteredTool;
use crate::{Error, Result};

/// Header carrying the signed tool authorization
pub const AUTHORIZED_TOOLS_HEADER: &str = "x-authorized-tools";
/// Header selecting a virtual server
pub const VIRTUAL_SERVER_HEADER: &str = "x-mcp-virtualserver";

#[derive(Debug, Deserialize)]
struct AuthorizedToolsClaims {
    #[serde(rename = "allowed-tools")]
    allowed_tools: AllowedTools,
}

/// The claim is usually a JSON document serialized into a string; a plain
/// object is accepted too.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AllowedTools {
    Encoded(String),
    Map(HashMap<String, Vec<String>>),
}

impl AllowedTools {
    fn into_map(self) -> Result<HashMap<String, HashSet<String>>> {
        let map = match self {
            Self::Map(map) => map,
            Self::Encoded(raw) => serde_json::from_str(&raw)
                .map_err(|e| Error::Session(format!("malformed allowed-tools claim: {e}")))?,
        };
        Ok(map
            .into_iter()
            .map(|(server, tools)| (server, tools.into_iter().collect()))
            .collect())
    }
}

/// Visibility decision for one request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolFilter {
    virtual_server: Option<HashSet<String>>,
    authorized: Option<HashMap<String, HashSet<String>>>,
}

impl ToolFilter {
    /// A filter that lets everything through
    #[must_use]
    pub fn unrestricted() -> Self {
        Self::default()
    }

    /// Whether no overlay applies
    #[must_use]
    pub fn is_unrestricted(&self) -> bool {
        self.virtual_server.is_none() && self.authorized.is_none()
    }

    /// Whether the request may see and call `entry`
    #[must_use]
    pub fn allows(&self, entry: &RegisteredTool) -> bool {
        let in_virtual_server = self
            .virtual_server
            .as_ref()
            .is_none_or(|tools| tools.contains(entry.name()));
        let authorized = self.authorized.as_ref().is_none_or(|servers| {
            servers
                .get(&entry.server)
                .is_some_and(|tools| tools.contains(&entry.upstream_name))
        });
        in_virtual_server && authorized
    }
}

struct AuthorizedToolsVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl AuthorizedToolsVerifier {
    fn from_config(config: &AuthorizedToolsConfig) -> Result<Self> {
        let material = config.resolve_key()?;
        let (key, algorithm) = match config.algorithm {
            TokenAlgorithm::HS256 => (DecodingKey::from_secret(&material), Algorithm::HS256),
            TokenAlgorithm::ES256 => (
                DecodingKey::from_ec_pem(&material)
                    .map_err(|e| Error::Config(format!("invalid authorized_tools key: {e}")))?,
                Algorithm::ES256,
            ),
        };
        let mut validation = Validation::new(algorithm);
        validation.validate_aud = false;
        Ok(Self { key, validation })
    }

    fn verify(&self, token: &str) -> Result<HashMap<String, HashSet<String>>> {
        let data = jsonwebtoken::decode::<AuthorizedToolsClaims>(token, &self.key, &self.validation)
            .map_err(|e| Error::Session(format!("invalid {AUTHORIZED_TOOLS_HEADER} token: {e}")))?;
        data.claims.allowed_tools.into_map()
    }
}

/// Builds [`ToolFilter`]s from request headers
pub struct AccessPolicy {
    verifier: Option<AuthorizedToolsVerifier>,
    virtual_servers: RwLock<HashMap<String, HashSet<String>>>,
}

impl AccessPolicy {
    /// Create the policy from configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the authorized-tools overlay is enabled
    /// with missing or unusable key material.
    pub fn new(
        authorized_tools: &AuthorizedToolsConfig,
        virtual_servers: &[VirtualServerConfig],
    ) -> Result<Self> {
        let verifier = if authorized_tools.enabled {
            Some(AuthorizedToolsVerifier::from_config(authorized_tools)?)
        } else {
            None
        };
        let policy = Self {
            verifier,
            virtual_servers: RwLock::new(HashMap::new()),
        };
        policy.set_virtual_servers(virtual_servers);
        Ok(policy)
    }

    /// A policy with no overlays configured
    #[must_use]
    pub fn open() -> Self {
        Self {
            verifier: None,
            virtual_servers: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the virtual server definitions
    pub fn set_virtual_servers(&self, definitions: &[VirtualServerConfig]) {
        let map = definitions
            .iter()
            .map(|vs| (vs.name.clone(), vs.tools.iter().cloned().collect()))
            .collect();
        *self.virtual_servers.write() = map;
    }

    /// Compute the visibility filter for a request
    ///
    /// # Errors
    ///
    /// Returns [`Error::Session`] when `x-authorized-tools` is present but
    /// does not verify.
    pub fn filter_for(&self, headers: &RequestHeaders) -> Result<ToolFilter> {
        let virtual_server = headers.get(VIRTUAL_SERVER_HEADER).map(|name| {
            self.virtual_servers.read().get(name).cloned().unwrap_or_else(|| {
                warn!(virtual_server = %name, "Unknown virtual server, exposing no tools");
                HashSet::new()
            })
        });

        let authorized = match (headers.get(AUTHORIZED_TOOLS_HEADER), &self.verifier) {
            (Some(token), Some(verifier)) => Some(verifier.verify(token)?),
            (Some(_), None) => {
                debug!("Ignoring {AUTHORIZED_TOOLS_HEADER}: overlay not enabled");
                None
            }
            (None, _) => None,
        };

        Ok(ToolFilter {
            virtual_server,
            authorized,
        })
    }
}
