//! The "web" is the operator-declared shape of the service graph: the
//! protocol vocabulary, substring skip rules, and hint edges loaded from the
//! web document.

use crate::tag::ProtocolTag;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Protocol ref assigned to seed nodes.
pub const PROTOCOL_SEED_REF: &str = "SEED";
/// Protocol ref assigned to hint-injected edges.
pub const PROTOCOL_HINT_REF: &str = "HNT";

/// Provider ref backing seed nodes.
pub const PROVIDER_SEED: &str = "seed";
/// Sentinel provider ref marking hint-derived strategies.
pub const PROVIDER_HINT: &str = "hnt";
/// Default child provider for the built-in seed strategy.
pub const PROVIDER_SSH: &str = "ssh";

/// A wire protocol services talk to each other over. Immutable after config
/// load; identified by `ref`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Protocol {
    #[serde(rename = "__type__", default)]
    tag: ProtocolTag,
    #[serde(rename = "ref")]
    pub id: String,
    pub name: String,
    pub blocking: bool,
    #[serde(default)]
    pub is_database: bool,
}

impl Protocol {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        blocking: bool,
        is_database: bool,
    ) -> Self {
        Self {
            tag: ProtocolTag,
            id: id.into(),
            name: name.into(),
            blocking,
            is_database,
        }
    }

    pub fn seed() -> Self {
        Self::new(PROTOCOL_SEED_REF, "Seed", true, false)
    }

    pub fn hint() -> Self {
        Self::new(PROTOCOL_HINT_REF, "Hint", true, false)
    }
}

/// An operator-declared directed edge: when the upstream service is named,
/// treat `service_name` as a downstream at `protocol_mux`, resolving its
/// instance through `instance_provider`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hint {
    pub service_name: String,
    pub protocol: Protocol,
    pub protocol_mux: String,
    pub provider: String,
    pub instance_provider: String,
}

/// Loaded web document: protocol registry, skip rules, and hints.
#[derive(Clone, Debug)]
pub struct Web {
    protocols: HashMap<String, Protocol>,
    skip_service_names: Vec<String>,
    skip_protocol_muxes: Vec<String>,
    hints: HashMap<String, Vec<Hint>>,
}

impl Default for Web {
    fn default() -> Self {
        let mut protocols = HashMap::new();
        protocols.insert(PROTOCOL_SEED_REF.to_string(), Protocol::seed());
        protocols.insert(PROTOCOL_HINT_REF.to_string(), Protocol::hint());
        Self {
            protocols,
            skip_service_names: Vec::new(),
            skip_protocol_muxes: Vec::new(),
            hints: HashMap::new(),
        }
    }
}

impl Web {
    pub fn protocol(&self, id: &str) -> Option<&Protocol> {
        self.protocols.get(id)
    }

    pub fn register_protocol(&mut self, protocol: Protocol) {
        self.protocols.insert(protocol.id.clone(), protocol);
    }

    /// True once any protocol beyond the SEED/HNT built-ins is registered.
    pub fn has_user_protocols(&self) -> bool {
        self.protocols
            .keys()
            .any(|id| id != PROTOCOL_SEED_REF && id != PROTOCOL_HINT_REF)
    }

    pub fn set_skips(&mut self, service_names: Vec<String>, protocol_muxes: Vec<String>) {
        self.skip_service_names = service_names;
        self.skip_protocol_muxes = protocol_muxes;
    }

    pub fn add_hints(&mut self, upstream_service_name: impl Into<String>, hints: Vec<Hint>) {
        self.hints
            .entry(upstream_service_name.into())
            .or_default()
            .extend(hints);
    }

    /// Hints declared for the named upstream service.
    pub fn hints(&self, service_name: &str) -> &[Hint] {
        self.hints
            .get(service_name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// True if any configured skip substring occurs in `service_name`.
    pub fn skip_service_name(&self, service_name: &str) -> bool {
        self.skip_service_names
            .iter()
            .any(|skip| service_name.contains(skip.as_str()))
    }

    /// True if any configured skip substring occurs in `protocol_mux`.
    pub fn skip_protocol_mux(&self, protocol_mux: &str) -> bool {
        self.skip_protocol_muxes
            .iter()
            .any(|skip| protocol_mux.contains(skip.as_str()))
    }
}
