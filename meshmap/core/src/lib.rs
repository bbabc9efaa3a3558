#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Domain model for the meshmap topology spider: protocols, hints, crawl
//! strategies, the node graph, and the provider capability contract that the
//! traversal engine consumes.

mod tag;

pub mod config;
pub mod node;
pub mod provider;
pub mod registry;
pub mod strategy;
pub mod web;

pub use self::{
    config::CrawlConfig,
    node::{
        child_ref, seed_ref, Node, NodeTransport, SharedNode, Tree, ERROR_NAME_LOOKUP_FAILED,
        ERROR_NULL_ADDRESS, ERROR_TIMEOUT, WARNING_CYCLE, WARNING_DEFUNCT,
    },
    provider::{
        parse_discovery_response, Connection, Provider, ProviderArgs, ProviderError,
        ResponseParseError,
    },
    registry::{PluginRegistry, RegistryError},
    strategy::{ChildProviderRule, CrawlStrategy, ServiceNameFilter},
    web::{
        Hint, Protocol, Web, PROTOCOL_HINT_REF, PROTOCOL_SEED_REF, PROVIDER_HINT, PROVIDER_SEED,
        PROVIDER_SSH,
    },
};

/// Registry of providers, keyed by provider ref.
pub type ProviderRegistry = PluginRegistry<dyn Provider>;
