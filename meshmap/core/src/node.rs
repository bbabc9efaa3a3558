//! The node graph: discovered service instances, the transport shape
//! providers hand back, and the per-node lifecycle predicates the engine and
//! renderers key off.

use crate::{config::CrawlConfig, strategy::CrawlStrategy, tag::NodeTag, web::Protocol, web::Web};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

pub const ERROR_TIMEOUT: &str = "TIMEOUT";
pub const ERROR_NULL_ADDRESS: &str = "NULL_ADDRESS";
pub const ERROR_NAME_LOOKUP_FAILED: &str = "NAME_LOOKUP_FAILED";
pub const WARNING_CYCLE: &str = "CYCLE";
pub const WARNING_DEFUNCT: &str = "DEFUNCT";

/// Well-known database ports; a node on one of these muxes renders as a
/// database even when its protocol is not flagged.
const DATABASE_MUXES: [&str; 5] = ["3306", "9160", "5432", "6379", "11211"];

/// A layer of sibling nodes, keyed by child ref.
pub type Tree = BTreeMap<String, SharedNode>;

/// Data transport between providers and the engine; the binding contract for
/// downstream discovery.
///
/// `protocol_mux` is the protocol multiplexer (port for TCP, topic:channel
/// for a queue). `debug_identifier` is a best-effort name used for display
/// and child refs, not the authoritative service name. A `num_connections`
/// of zero marks the edge DEFUNCT.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTransport {
    pub protocol_mux: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub debug_identifier: Option<String>,
    #[serde(default)]
    pub num_connections: Option<u64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl NodeTransport {
    pub fn new(protocol_mux: impl Into<String>) -> Self {
        Self {
            protocol_mux: protocol_mux.into(),
            ..Self::default()
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_debug_identifier(mut self, id: impl Into<String>) -> Self {
        self.debug_identifier = Some(id.into());
        self
    }

    pub fn with_num_connections(mut self, n: u64) -> Self {
        self.num_connections = Some(n);
        self
    }
}

/// A discovered service instance.
///
/// `children == None` means not yet crawled; an empty map means crawled with
/// no children found. The distinction drives `crawl_complete`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(rename = "__type__", default)]
    tag: NodeTag,
    pub crawl_strategy: CrawlStrategy,
    pub protocol: Protocol,
    pub protocol_mux: String,
    pub provider: String,
    #[serde(default)]
    pub containerized: bool,
    #[serde(default)]
    pub from_hint: bool,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub children: Option<BTreeMap<String, SharedNode>>,
    #[serde(default)]
    pub warnings: BTreeSet<String>,
    #[serde(default)]
    pub errors: BTreeSet<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Node {
    pub fn new(
        crawl_strategy: CrawlStrategy,
        protocol: Protocol,
        protocol_mux: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            tag: NodeTag,
            crawl_strategy,
            protocol,
            protocol_mux: protocol_mux.into(),
            provider: provider.into(),
            containerized: false,
            from_hint: false,
            address: None,
            service_name: None,
            children: None,
            warnings: BTreeSet::new(),
            errors: BTreeSet::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn is_database(&self) -> bool {
        DATABASE_MUXES.contains(&self.protocol_mux.as_str()) || self.protocol.is_database
    }

    /// Whether the engine may expand this node at `depth`. Nodes carrying any
    /// warning or error, skip-listed muxes/names, and non-blocking
    /// children-or-deeper under `--skip-nonblocking-grandchildren` are not
    /// crawlable.
    pub fn is_crawlable(&self, depth: usize, config: &CrawlConfig, web: &Web) -> bool {
        if !self.errors.is_empty() || !self.warnings.is_empty() {
            return false;
        }

        if web.skip_protocol_mux(&self.protocol_mux) {
            return false;
        }

        if let Some(service_name) = &self.service_name {
            if web.skip_service_name(service_name) {
                return false;
            }
        }

        let is_child_or_grandchild = depth > 0;
        if config.skip_nonblocking_grandchildren
            && !self.protocol.blocking
            && is_child_or_grandchild
        {
            return false;
        }

        true
    }

    /// Excluded entirely from crawl results: if we find it, pretend we didn't.
    pub fn is_excluded(&self, depth: usize, config: &CrawlConfig) -> bool {
        if config.provider_disabled(&self.provider) {
            return true;
        }

        let is_grandchild = depth > 1;
        config.skip_nonblocking_grandchildren && !self.protocol.blocking && is_grandchild
    }

    pub fn name_lookup_complete(&self) -> bool {
        self.service_name.is_some() || !self.errors.is_empty()
    }

    /// Whether the engine is done with this node at `depth`: uncrawlable
    /// nodes are trivially complete, otherwise name lookup must have resolved
    /// and either the depth bound was hit or children were assigned.
    pub fn crawl_complete(&self, depth: usize, config: &CrawlConfig, web: &Web) -> bool {
        if !self.is_crawlable(depth, config, web) {
            return true;
        }

        if !self.name_lookup_complete() {
            return false;
        }

        if depth == config.max_depth {
            return true;
        }

        self.children.is_some()
    }
}

/// A node shared between the engine (which mutates it in place) and the
/// renderers (which poll it for completion). Serializes as the inner node.
#[derive(Clone, Debug)]
pub struct SharedNode(Arc<RwLock<Node>>);

impl SharedNode {
    pub fn new(node: Node) -> Self {
        Self(Arc::new(RwLock::new(node)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Node> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Node> {
        self.0.write()
    }

    /// A detached copy of the current node state.
    pub fn snapshot(&self) -> Node {
        self.0.read().clone()
    }
}

impl From<Node> for SharedNode {
    fn from(node: Node) -> Self {
        Self::new(node)
    }
}

impl PartialEq for SharedNode {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || *self.0.read() == *other.0.read()
    }
}

impl Serialize for SharedNode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.read().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SharedNode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Node::deserialize(deserializer).map(Self::new)
    }
}

/// Deterministic key for a child within its parent's child map.
pub fn child_ref(
    protocol_ref: &str,
    protocol_mux: &str,
    debug_identifier: Option<&str>,
) -> String {
    let mut parts = vec![protocol_ref, protocol_mux];
    if let Some(id) = debug_identifier {
        parts.push(id);
    }
    parts.join("_")
}

/// Layer key for a seed node.
pub fn seed_ref(address: &str) -> String {
    format!("SEED:{address}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::Protocol;

    fn nonblocking_protocol() -> Protocol {
        Protocol::new("NSQ", "NSQ", false, false)
    }

    fn node_with_protocol(protocol: Protocol) -> Node {
        let strategy = CrawlStrategy::seed();
        Node::new(strategy, protocol, "dummy_mux", "dummy_provider")
    }

    fn node() -> Node {
        node_with_protocol(Protocol::new("DUM", "Dummy", true, false))
    }

    #[test]
    fn database_by_mux_or_protocol_flag() {
        let mut by_mux = node();
        by_mux.protocol_mux = "3306".to_string();
        assert!(by_mux.is_database());

        let by_flag = node_with_protocol(Protocol::new("PG", "postgres", true, true));
        assert!(by_flag.is_database());

        assert!(!node().is_database());
    }

    #[test]
    fn warnings_and_errors_block_crawling() {
        let config = CrawlConfig::default();
        let web = Web::default();

        let mut warned = node();
        warned.warnings.insert("ANY".to_string());
        assert!(!warned.is_crawlable(0, &config, &web));

        let mut errored = node();
        errored.errors.insert("ANY".to_string());
        assert!(!errored.is_crawlable(0, &config, &web));

        assert!(node().is_crawlable(0, &config, &web));
    }

    #[test]
    fn skip_listed_mux_and_name_block_crawling() {
        let config = CrawlConfig::default();
        let mut web = Web::default();
        web.set_skips(vec!["secret".into()], vec!["dummy_mux".into()]);

        assert!(!node().is_crawlable(0, &config, &web));

        let mut named = node();
        named.protocol_mux = "80".to_string();
        named.service_name = Some("secret-service".to_string());
        assert!(!named.is_crawlable(0, &config, &web));
    }

    #[test]
    fn nonblocking_children_uncrawlable_when_flagged() {
        let config = CrawlConfig {
            skip_nonblocking_grandchildren: true,
            ..CrawlConfig::default()
        };
        let web = Web::default();
        let nonblocking = node_with_protocol(nonblocking_protocol());

        assert!(nonblocking.is_crawlable(0, &config, &web));
        assert!(!nonblocking.is_crawlable(1, &config, &web));
        assert!(!nonblocking.is_crawlable(2, &config, &web));

        let blocking = node();
        assert!(blocking.is_crawlable(2, &config, &web));
    }

    #[test]
    fn disabled_provider_is_excluded() {
        let config = CrawlConfig {
            disable_providers: vec!["dummy_provider".to_string()],
            ..CrawlConfig::default()
        };
        assert!(node().is_excluded(0, &config));
        assert!(node().is_excluded(2, &config));
    }

    #[test]
    fn nonblocking_grandchildren_excluded_when_flagged() {
        let config = CrawlConfig {
            skip_nonblocking_grandchildren: true,
            ..CrawlConfig::default()
        };
        let nonblocking = node_with_protocol(nonblocking_protocol());

        assert!(!nonblocking.is_excluded(1, &config));
        assert!(nonblocking.is_excluded(2, &config));
        assert!(!node().is_excluded(2, &config));
    }

    #[test]
    fn name_lookup_complete_on_name_or_error() {
        assert!(!node().name_lookup_complete());

        let mut named = node();
        named.service_name = Some("foo".to_string());
        assert!(named.name_lookup_complete());

        let mut errored = node();
        errored.errors.insert(ERROR_TIMEOUT.to_string());
        assert!(errored.name_lookup_complete());
    }

    #[test]
    fn crawl_complete_transitions() {
        let config = CrawlConfig::default();
        let web = Web::default();

        // name not yet resolved
        assert!(!node().crawl_complete(0, &config, &web));

        // uncrawlable nodes are trivially complete
        let mut errored = node();
        errored.errors.insert(ERROR_TIMEOUT.to_string());
        assert!(errored.crawl_complete(0, &config, &web));

        // named but not yet expanded
        let mut named = node();
        named.service_name = Some("foo".to_string());
        assert!(!named.crawl_complete(0, &config, &web));

        // expanded, even with zero children
        let mut expanded = named.clone();
        expanded.children = Some(BTreeMap::new());
        assert!(expanded.crawl_complete(0, &config, &web));

        // at max depth, lookup alone completes the node
        let shallow = CrawlConfig {
            max_depth: 0,
            ..CrawlConfig::default()
        };
        assert!(named.crawl_complete(0, &shallow, &web));
    }

    #[test]
    fn child_ref_skips_absent_parts() {
        assert_eq!(child_ref("DUM", "1234", Some("bar")), "DUM_1234_bar");
        assert_eq!(child_ref("DUM", "1234", None), "DUM_1234");
        assert_eq!(seed_ref("1.2.3.4"), "SEED:1.2.3.4");
    }
}
