//! Crawl strategies: declarative recipes binding a protocol to a provider
//! query, with per-strategy service-name filtering, rewriting, and child
//! provider resolution.

use crate::{
    node::Node,
    provider::ProviderArgs,
    tag::CrawlStrategyTag,
    web::{Protocol, PROVIDER_HINT, PROVIDER_SEED, PROVIDER_SSH},
};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Determines the provider of a child node discovered through a strategy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChildProviderRule {
    /// All children use one provider.
    #[serde(rename = "matchAll")]
    MatchAll { provider: String },

    /// First regex matching the child's address wins; absent addresses match
    /// as the empty string.
    #[serde(rename = "matchAddress")]
    MatchAddress {
        matches: IndexMap<String, String>,
        default: String,
    },

    /// Integer mux lookup; non-integer muxes and misses fall through to the
    /// default.
    #[serde(rename = "matchPort")]
    MatchPort {
        matches: BTreeMap<u16, String>,
        default: String,
    },
}

impl ChildProviderRule {
    pub fn resolve(&self, protocol_mux: &str, address: Option<&str>) -> &str {
        match self {
            Self::MatchAll { provider } => provider,
            Self::MatchAddress { matches, default } => {
                let address = address.unwrap_or("");
                matches
                    .iter()
                    .find(|(pattern, _)| {
                        Regex::new(pattern)
                            .map(|re| re.is_match(address))
                            .unwrap_or(false)
                    })
                    .map(|(_, provider)| provider.as_str())
                    .unwrap_or(default)
            }
            Self::MatchPort { matches, default } => protocol_mux
                .parse::<u16>()
                .ok()
                .and_then(|port| matches.get(&port))
                .map(String::as_str)
                .unwrap_or(default),
        }
    }
}

/// Service-name filter attached to a strategy. `not` blacklists, `only`
/// whitelists; the blacklist wins when both are present.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceNameFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not: Option<BTreeSet<String>>,
}

/// A declarative recipe for querying a provider for downstream peers over one
/// protocol. Immutable after config load.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrawlStrategy {
    #[serde(rename = "__type__", default)]
    tag: CrawlStrategyTag,
    pub name: String,
    pub description: String,
    pub protocol: Protocol,
    pub providers: Vec<String>,
    #[serde(default)]
    pub provider_args: ProviderArgs,
    pub child_provider: ChildProviderRule,
    #[serde(default)]
    pub service_name_filter: ServiceNameFilter,
    #[serde(default)]
    pub service_name_rewrites: IndexMap<String, String>,
}

impl CrawlStrategy {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        protocol: Protocol,
        providers: Vec<String>,
        provider_args: ProviderArgs,
        child_provider: ChildProviderRule,
        service_name_filter: ServiceNameFilter,
        service_name_rewrites: IndexMap<String, String>,
    ) -> Self {
        Self {
            tag: CrawlStrategyTag,
            name: name.into(),
            description: description.into(),
            protocol,
            providers,
            provider_args,
            child_provider,
            service_name_filter,
            service_name_rewrites,
        }
    }

    /// The built-in strategy seed nodes are created under.
    pub fn seed() -> Self {
        Self::new(
            "Seed",
            "Seed crawl strategy",
            Protocol::seed(),
            vec![PROVIDER_SEED.to_string()],
            ProviderArgs::new(),
            ChildProviderRule::MatchAll {
                provider: PROVIDER_SSH.to_string(),
            },
            ServiceNameFilter::default(),
            IndexMap::new(),
        )
    }

    /// A one-shot strategy derived from a hint: children take the hint's
    /// protocol and are resolved through the hint's child provider.
    pub fn hint(protocol: Protocol, child_provider: impl Into<String>) -> Self {
        Self::new(
            "Hint",
            "Hint crawl strategy",
            protocol,
            vec![PROVIDER_HINT.to_string()],
            ProviderArgs::new(),
            ChildProviderRule::MatchAll {
                provider: child_provider.into(),
            },
            ServiceNameFilter::default(),
            IndexMap::new(),
        )
    }

    /// True means this service name should not be expanded by this strategy.
    pub fn filter_service_name(&self, service_name: &str) -> bool {
        if let Some(not) = &self.service_name_filter.not {
            if not.contains(service_name) {
                return true;
            }
        }
        if let Some(only) = &self.service_name_filter.only {
            if !only.contains(service_name) {
                return true;
            }
        }
        false
    }

    /// Rewrites a discovered service name: the first rewrite whose key is a
    /// substring of `service_name` wins, its template interpolated with node
    /// attributes. No match leaves the name unchanged.
    pub fn rewrite_service_name(&self, service_name: &str, node: &Node) -> String {
        for (pattern, template) in &self.service_name_rewrites {
            if service_name.contains(pattern.as_str()) {
                return interpolate(template, node);
            }
        }
        service_name.to_string()
    }

    /// Resolves the provider for a child discovered at `protocol_mux` /
    /// `address` through this strategy.
    pub fn resolve_child_provider(&self, protocol_mux: &str, address: Option<&str>) -> &str {
        self.child_provider.resolve(protocol_mux, address)
    }
}

/// Substitutes `$attribute` / `${attribute}` node attributes into a rewrite
/// template. Longer keys are substituted first so `$protocol` does not
/// clobber `$protocol_mux`.
fn interpolate(template: &str, node: &Node) -> String {
    let substitutions = [
        ("protocol_mux", node.protocol_mux.clone()),
        ("service_name", node.service_name.clone().unwrap_or_default()),
        ("address", node.address.clone().unwrap_or_default()),
        ("provider", node.provider.clone()),
        ("protocol", node.protocol.id.clone()),
    ];
    let mut rendered = template.to_string();
    for (key, value) in substitutions {
        rendered = rendered.replace(&format!("${{{key}}}"), &value);
        rendered = rendered.replace(&format!("${key}"), &value);
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use maplit::btreeset;

    fn strategy_with_filter(filter: ServiceNameFilter) -> CrawlStrategy {
        CrawlStrategy::new(
            "test",
            "",
            Protocol::new("DUM", "Dummy", true, false),
            vec!["dummy".to_string()],
            ProviderArgs::new(),
            ChildProviderRule::MatchAll {
                provider: "dummy".to_string(),
            },
            filter,
            IndexMap::new(),
        )
    }

    fn dummy_node() -> Node {
        let protocol = Protocol::new("DUM", "Dummy", true, false);
        let mut node = Node::new(
            strategy_with_filter(ServiceNameFilter::default()),
            protocol,
            "1234",
            "dummy",
        );
        node.address = Some("1.2.3.4".to_string());
        node
    }

    #[test]
    fn no_filter_accepts_everything() {
        let cs = strategy_with_filter(ServiceNameFilter::default());
        assert!(!cs.filter_service_name("anything"));
    }

    #[test]
    fn not_filter_blacklists() {
        let cs = strategy_with_filter(ServiceNameFilter {
            not: Some(btreeset! {"bad".to_string()}),
            only: None,
        });
        assert!(cs.filter_service_name("bad"));
        assert!(!cs.filter_service_name("good"));
    }

    #[test]
    fn only_filter_whitelists() {
        let cs = strategy_with_filter(ServiceNameFilter {
            only: Some(btreeset! {"good".to_string()}),
            not: None,
        });
        assert!(!cs.filter_service_name("good"));
        assert!(cs.filter_service_name("other"));
    }

    #[test]
    fn blacklist_wins_over_whitelist() {
        let cs = strategy_with_filter(ServiceNameFilter {
            only: Some(btreeset! {"both".to_string()}),
            not: Some(btreeset! {"both".to_string()}),
        });
        assert!(cs.filter_service_name("both"));
    }

    #[test]
    fn rewrite_first_substring_match_wins() {
        let mut cs = strategy_with_filter(ServiceNameFilter::default());
        cs.service_name_rewrites.insert("gate".to_string(), "gateway_$protocol_mux".to_string());
        cs.service_name_rewrites.insert("way".to_string(), "never".to_string());
        let node = dummy_node();
        assert_eq!(cs.rewrite_service_name("gateway", &node), "gateway_1234");
    }

    #[test]
    fn rewrite_without_match_is_identity() {
        let cs = strategy_with_filter(ServiceNameFilter::default());
        let node = dummy_node();
        assert_eq!(cs.rewrite_service_name("plain", &node), "plain");
    }

    #[test]
    fn rewrite_interpolates_address_and_protocol() {
        let mut cs = strategy_with_filter(ServiceNameFilter::default());
        cs.service_name_rewrites
            .insert("x".to_string(), "$protocol@$address".to_string());
        let node = dummy_node();
        assert_eq!(cs.rewrite_service_name("x", &node), "DUM@1.2.3.4");
    }

    #[test]
    fn match_all_resolves_unconditionally() {
        let rule = ChildProviderRule::MatchAll {
            provider: "ssh".to_string(),
        };
        assert_eq!(rule.resolve("80", None), "ssh");
    }

    #[test]
    fn match_address_first_regex_wins() {
        let mut matches = IndexMap::new();
        matches.insert("^10\\.".to_string(), "ssh".to_string());
        matches.insert("pod-".to_string(), "k8s".to_string());
        let rule = ChildProviderRule::MatchAddress {
            matches,
            default: "aws".to_string(),
        };
        assert_eq!(rule.resolve("80", Some("10.0.0.1")), "ssh");
        assert_eq!(rule.resolve("80", Some("pod-abc123")), "k8s");
        assert_eq!(rule.resolve("80", Some("172.16.0.1")), "aws");
        assert_eq!(rule.resolve("80", None), "aws");
    }

    #[test]
    fn match_port_falls_through_on_non_integer() {
        let mut matches = BTreeMap::new();
        matches.insert(5432, "k8s".to_string());
        let rule = ChildProviderRule::MatchPort {
            matches,
            default: "ssh".to_string(),
        };
        assert_eq!(rule.resolve("5432", None), "k8s");
        assert_eq!(rule.resolve("80", None), "ssh");
        assert_eq!(rule.resolve("topic:channel", None), "ssh");
    }
}
