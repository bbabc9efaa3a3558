//! Process-wide crawl state: configuration, registries, the two
//! cross-layer caches, and the set of spawned layer tasks.

use crate::{crawl::CrawlError, obfuscate::Obfuscator};
use ahash::AHashMap;
use meshmap_core::{
    seed_ref, CrawlConfig, CrawlStrategy, Node, Protocol, ProviderRegistry, SharedNode, Tree, Web,
};
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc};
use tokio::task::JoinHandle;

/// Owns everything a crawl needs. Construct one per run; tests construct a
/// fresh session per case so cache state never leaks between them.
pub struct CrawlSession {
    pub config: CrawlConfig,
    pub web: Web,
    pub strategies: Vec<CrawlStrategy>,
    pub providers: ProviderRegistry,
    obfuscator: Obfuscator,

    /// address -> resolved service name; `None` records a failed lookup so
    /// the address is never queried twice.
    name_cache: Mutex<AHashMap<String, Option<String>>>,

    /// post-rewrite service name -> unfiltered children of its first
    /// expansion. Readers receive defensive copies.
    child_cache: Mutex<AHashMap<String, BTreeMap<String, Node>>>,

    tasks: Mutex<Vec<JoinHandle<Result<(), CrawlError>>>>,
}

impl CrawlSession {
    pub fn new(
        config: CrawlConfig,
        web: Web,
        strategies: Vec<CrawlStrategy>,
        providers: ProviderRegistry,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            web,
            strategies,
            providers,
            obfuscator: Obfuscator::default(),
            name_cache: Mutex::new(AHashMap::new()),
            child_cache: Mutex::new(AHashMap::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn obfuscator(&self) -> &Obfuscator {
        &self.obfuscator
    }

    /// Builds the seed layer from the configured `provider:address` seeds.
    pub fn seed_tree(&self) -> Result<Tree, CrawlError> {
        let mut tree = Tree::new();
        for seed in &self.config.seeds {
            let (provider_ref, address) = seed
                .split_once(':')
                .filter(|(provider, address)| !provider.is_empty() && !address.is_empty())
                .ok_or_else(|| CrawlError::MalformedSeed(seed.clone()))?;
            if self.config.provider_disabled(provider_ref) {
                return Err(CrawlError::SeedProviderDisabled(seed.clone()));
            }
            let provider = self.providers.get(provider_ref)?;

            let mut node = Node::new(
                CrawlStrategy::seed(),
                Protocol::seed(),
                "seed",
                provider_ref,
            );
            node.containerized = provider.is_container_platform();
            node.address = Some(address.to_string());
            tree.insert(seed_ref(address), SharedNode::new(node));
        }
        Ok(tree)
    }

    /// Waits for every spawned layer crawl, surfacing the first failure.
    pub async fn join_pending(&self) -> Result<(), CrawlError> {
        loop {
            let handle = self.tasks.lock().pop();
            match handle {
                Some(handle) => handle.await??,
                None => return Ok(()),
            }
        }
    }

    pub(crate) fn push_task(&self, handle: JoinHandle<Result<(), CrawlError>>) {
        self.tasks.lock().push(handle);
    }

    pub(crate) fn cached_name(&self, address: &str) -> Option<Option<String>> {
        self.name_cache.lock().get(address).cloned()
    }

    pub(crate) fn record_name(&self, address: &str, name: Option<String>) {
        self.name_cache
            .lock()
            .insert(address.to_string(), name);
    }

    pub(crate) fn has_cached_children(&self, service_name: &str) -> bool {
        self.child_cache.lock().contains_key(service_name)
    }

    /// Defensive copy of the cached children for `service_name`: child
    /// identity is preserved but every copy starts with an empty child map
    /// and its own warning/error sets, so the subtree is rebuilt by the
    /// recursive crawl instead of shared.
    pub(crate) fn cached_children(&self, service_name: &str) -> Option<BTreeMap<String, Node>> {
        let cache = self.child_cache.lock();
        let children = cache.get(service_name)?;
        Some(
            children
                .iter()
                .map(|(child_ref, child)| {
                    let mut copy = child.clone();
                    copy.children = Some(BTreeMap::new());
                    (child_ref.clone(), copy)
                })
                .collect(),
        )
    }

    pub(crate) fn record_children(&self, service_name: &str, children: BTreeMap<String, Node>) {
        self.child_cache
            .lock()
            .insert(service_name.to_string(), children);
    }
}
