//! The four-stage layer crawl: open connections, look up names, gate on
//! depth, then expand and recurse.
//!
//! Stage-1 timeouts are tolerated per node; past stage 1 any timeout or
//! provider failure is fatal to the whole run so that a partial graph never
//! masquerades as complete.

use crate::session::CrawlSession;
use futures::future::{join_all, BoxFuture, FutureExt};
use meshmap_core::{
    child_ref, Connection, CrawlStrategy, Node, NodeTransport, Provider, ProviderError,
    RegistryError, SharedNode, Tree, ERROR_NAME_LOOKUP_FAILED, ERROR_NULL_ADDRESS, ERROR_TIMEOUT,
    PROVIDER_HINT, WARNING_CYCLE, WARNING_DEFUNCT,
};
use std::{collections::BTreeMap, sync::Arc};
use thiserror::Error;
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("seed `{0}` is not of the form provider:address")]
    MalformedSeed(String),

    #[error("seed `{0}` uses a provider disabled by --disable-providers")]
    SeedProviderDisabled(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("timed out in {stage} for `{node_ref}`")]
    FatalTimeout {
        stage: &'static str,
        node_ref: String,
    },

    #[error("provider failure in {stage} for `{node_ref}`")]
    Provider {
        stage: &'static str,
        node_ref: String,
        #[source]
        source: ProviderError,
    },

    #[error("crawl task failed")]
    Join(#[from] tokio::task::JoinError),
}

/// A node being advanced through the stages of one layer crawl, together
/// with its provider and the connection opened for this crawl only.
struct LayerNode {
    node_ref: String,
    node: SharedNode,
    provider: Arc<dyn Provider>,
    address: Option<String>,
    connection: Option<Connection>,
}

/// Crawls the whole graph from `tree`, joining every spawned layer before
/// returning. Any fatal layer failure propagates out.
pub async fn spider(session: &Arc<CrawlSession>, tree: &Tree) -> Result<(), CrawlError> {
    crawl(session.clone(), tree.clone(), Vec::new()).await?;
    session.join_pending().await
}

/// Advances one layer of siblings sharing the `ancestors` path. Child layers
/// are spawned, not awaited; [`CrawlSession::join_pending`] drains them.
pub fn crawl(
    session: Arc<CrawlSession>,
    tree: Tree,
    ancestors: Vec<String>,
) -> BoxFuture<'static, Result<(), CrawlError>> {
    async move {
        let depth = ancestors.len();
        tracing::debug!(nodes = tree.len(), depth, "found nodes to crawl");

        let layer = open_connections(&session, &tree, &ancestors).await?;
        let layer = lookup_names(&session, layer, &ancestors).await?;

        if depth >= session.config.max_depth {
            tracing::debug!(max_depth = session.config.max_depth, depth, "reached max depth");
            return Ok(());
        }

        let crawlable: Vec<LayerNode> = layer
            .into_iter()
            .filter(|layer_node| {
                layer_node
                    .node
                    .read()
                    .is_crawlable(depth, &session.config, &session.web)
            })
            .collect();

        let expansions = join_all(crawlable.into_iter().map(|layer_node| {
            let session = session.clone();
            let ancestors = ancestors.clone();
            async move { expand_node(session, layer_node, depth, ancestors).await }
        }))
        .await;
        expansions.into_iter().collect()
    }
    .boxed()
}

/// Stage 1: concurrently open provider connections for every node in the
/// layer. Timeouts mark the node `TIMEOUT` and drop it from the rest of this
/// crawl; any other failure is fatal.
async fn open_connections(
    session: &Arc<CrawlSession>,
    tree: &Tree,
    ancestors: &[String],
) -> Result<Vec<LayerNode>, CrawlError> {
    let mut pending = Vec::with_capacity(tree.len());
    for (node_ref, node) in tree {
        let (address, provider_ref) = {
            let node = node.read();
            (node.address.clone(), node.provider.clone())
        };
        let provider = session.providers.get(&provider_ref)?;
        pending.push((node_ref.clone(), node.clone(), provider, address));
    }

    let opened = join_all(
        pending
            .into_iter()
            .map(|(node_ref, node, provider, address)| {
                let session = session.clone();
                async move {
                    let outcome =
                        open_connection(&session, provider.as_ref(), address.as_deref()).await;
                    (node_ref, node, provider, address, outcome)
                }
            }),
    )
    .await;

    let mut layer = Vec::with_capacity(opened.len());
    for (node_ref, node, provider, address, outcome) in opened {
        match outcome {
            Ok(connection) => layer.push(LayerNode {
                node_ref,
                node,
                provider,
                address,
                connection,
            }),
            Err(ProviderError::Timeout(_)) => {
                tracing::debug!(
                    %node_ref,
                    address = address.as_deref().unwrap_or_default(),
                    "connection timeout"
                );
                node.write().errors.insert(ERROR_TIMEOUT.to_string());
            }
            Err(source) => {
                tracing::error!(
                    %node_ref,
                    address = address.as_deref().unwrap_or_default(),
                    parent = ancestors.last().map(String::as_str).unwrap_or_default(),
                    %source,
                    "failed opening connection"
                );
                return Err(CrawlError::Provider {
                    stage: "connection-open",
                    node_ref,
                    source,
                });
            }
        }
    }
    Ok(layer)
}

async fn open_connection(
    session: &CrawlSession,
    provider: &dyn Provider,
    address: Option<&str>,
) -> Result<Option<Connection>, ProviderError> {
    let Some(address) = address else {
        return Ok(None);
    };

    // A cached name means stage 2 will not touch the provider, and a
    // skip-listed or already-expanded service will not be crawled either, so
    // the connection would go unused.
    if let Some(cached) = session.cached_name(address) {
        match cached {
            None => {
                tracing::debug!(%address, "not opening connection: name unresolvable");
                return Ok(None);
            }
            Some(name) => {
                if session.web.skip_service_name(&name) {
                    tracing::debug!(%address, %name, "not opening connection: skip-listed");
                    return Ok(None);
                }
                if session.has_cached_children(&name) {
                    tracing::debug!(%address, %name, "not opening connection: children cached");
                    return Ok(None);
                }
            }
        }
    }

    tracing::debug!(%address, "opening connection");
    match timeout(session.config.timeout(), provider.open_connection(address)).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(address.to_string())),
    }
}

/// Stage 2: concurrently resolve service names for the surviving nodes, then
/// rewrite, obfuscate, cycle-check, and assign them. Failures here are fatal.
async fn lookup_names(
    session: &Arc<CrawlSession>,
    layer: Vec<LayerNode>,
    ancestors: &[String],
) -> Result<Vec<LayerNode>, CrawlError> {
    let results = join_all(layer.iter().map(|layer_node| {
        let session = session.clone();
        async move { lookup_name(&session, layer_node).await }
    }))
    .await;

    let mut named = Vec::with_capacity(layer.len());
    for (layer_node, result) in layer.into_iter().zip(results) {
        let name = match result {
            Ok(name) => name,
            Err(ProviderError::Timeout(_)) => {
                tracing::error!(node_ref = %layer_node.node_ref, "timed out during name lookup");
                return Err(CrawlError::FatalTimeout {
                    stage: "name-lookup",
                    node_ref: layer_node.node_ref,
                });
            }
            Err(source) => {
                return Err(CrawlError::Provider {
                    stage: "name-lookup",
                    node_ref: layer_node.node_ref,
                    source,
                });
            }
        };
        assign_name(session, &layer_node, name, ancestors);
        named.push(layer_node);
    }
    Ok(named)
}

async fn lookup_name(
    session: &CrawlSession,
    layer_node: &LayerNode,
) -> Result<Option<String>, ProviderError> {
    let Some(address) = layer_node.address.as_deref() else {
        return Ok(None);
    };

    if let Some(cached) = session.cached_name(address) {
        tracing::debug!(
            %address,
            name = cached.as_deref().unwrap_or_default(),
            "using cached service name"
        );
        return Ok(cached);
    }

    let lookup = layer_node
        .provider
        .lookup_name(address, layer_node.connection.as_ref());
    let name = match timeout(session.config.timeout(), lookup).await {
        Ok(result) => result?,
        Err(_) => return Err(ProviderError::Timeout(address.to_string())),
    };
    tracing::debug!(%address, name = name.as_deref().unwrap_or_default(), "discovered service name");
    session.record_name(address, name.clone());
    Ok(name)
}

fn assign_name(
    session: &CrawlSession,
    layer_node: &LayerNode,
    name: Option<String>,
    ancestors: &[String],
) {
    let Some(name) = name else {
        tracing::debug!(
            node_ref = %layer_node.node_ref,
            address = layer_node.address.as_deref().unwrap_or_default(),
            "name lookup failed"
        );
        if let Some(address) = layer_node.address.as_deref() {
            session.record_name(address, None);
        }
        layer_node
            .node
            .write()
            .errors
            .insert(ERROR_NAME_LOOKUP_FAILED.to_string());
        return;
    };

    let rewritten = {
        let node = layer_node.node.read();
        node.crawl_strategy.rewrite_service_name(&name, &node)
    };
    let service_name = if session.config.obfuscate {
        session.obfuscator().alias_service_name(&rewritten)
    } else {
        rewritten
    };

    // The cycle check runs against the post-rewrite name.
    let mut node = layer_node.node.write();
    if ancestors.contains(&service_name) {
        node.warnings.insert(WARNING_CYCLE.to_string());
    }
    node.service_name = Some(service_name);
}

/// Stage 4: build the node's children from strategy and hint tasks (or the
/// child cache), filter exclusions, assign, and spawn the recursive crawl for
/// children that carry an address.
async fn expand_node(
    session: Arc<CrawlSession>,
    layer_node: LayerNode,
    depth: usize,
    mut ancestors: Vec<String>,
) -> Result<(), CrawlError> {
    let Some(service_name) = layer_node.node.read().service_name.clone() else {
        return Ok(());
    };

    let children = match session.cached_children(&service_name) {
        Some(cached) => {
            tracing::debug!(%service_name, count = cached.len(), "using cached children");
            cached
        }
        None => discover_children(&session, &layer_node, &service_name).await?,
    };

    let child_depth = depth + 1;
    let mut kept = Tree::new();
    for (child_ref, child) in children {
        if child.is_excluded(child_depth, &session.config) {
            continue;
        }
        kept.insert(child_ref, SharedNode::new(child));
    }
    layer_node.node.write().children = Some(kept.clone());

    let with_address: Tree = kept
        .iter()
        .filter(|(_, child)| child.read().address.is_some())
        .map(|(child_ref, child)| (child_ref.clone(), child.clone()))
        .collect();
    if !with_address.is_empty() {
        ancestors.push(service_name);
        let handle = tokio::spawn(crawl(session.clone(), with_address, ancestors));
        session.push_task(handle);
    }
    Ok(())
}

async fn discover_children(
    session: &Arc<CrawlSession>,
    layer_node: &LayerNode,
    service_name: &str,
) -> Result<BTreeMap<String, Node>, CrawlError> {
    tracing::debug!(node_ref = %layer_node.node_ref, %service_name, "expanding node");
    let address = layer_node.address.clone().unwrap_or_default();
    let connection = layer_node.connection.as_ref();

    let mut strategies = Vec::new();
    let mut tasks: Vec<BoxFuture<'_, Result<Vec<NodeTransport>, ProviderError>>> = Vec::new();

    for strategy in &session.strategies {
        if session.config.skip_protocol(&strategy.protocol.id)
            || strategy.filter_service_name(service_name)
            || !strategy.providers.iter().any(|p| p == layer_node.provider.id())
        {
            continue;
        }
        let provider = layer_node.provider.clone();
        let args = strategy.provider_args.clone();
        let address = address.clone();
        strategies.push(strategy.clone());
        tasks.push(
            async move { provider.crawl_downstream(&address, connection, &args).await }.boxed(),
        );
    }

    for hint in session.web.hints(service_name) {
        if session.config.provider_disabled(&hint.instance_provider) {
            continue;
        }
        let provider = session.providers.get(&hint.instance_provider)?;
        strategies.push(CrawlStrategy::hint(
            hint.protocol.clone(),
            hint.provider.clone(),
        ));
        let hint = hint.clone();
        tasks.push(async move { provider.take_a_hint(&hint).await }.boxed());
    }

    let deadline = session.config.timeout();
    let results = join_all(tasks.into_iter().map(|task| timeout(deadline, task))).await;

    let mut children = BTreeMap::new();
    for (result, strategy) in results.into_iter().zip(strategies) {
        let transports = match result {
            Ok(Ok(transports)) => transports,
            Ok(Err(ProviderError::Timeout(_))) | Err(_) => {
                tracing::error!(
                    node_ref = %layer_node.node_ref,
                    %service_name,
                    "timed out crawling downstream"
                );
                return Err(CrawlError::FatalTimeout {
                    stage: "downstream-discovery",
                    node_ref: layer_node.node_ref.clone(),
                });
            }
            Ok(Err(source)) => {
                return Err(CrawlError::Provider {
                    stage: "downstream-discovery",
                    node_ref: layer_node.node_ref.clone(),
                    source,
                });
            }
        };

        for transport in transports {
            if session.config.skip_protocol_mux(&transport.protocol_mux) {
                continue;
            }
            let (child_ref, child) = create_node(session, &strategy, transport)?;
            children.insert(child_ref, child);
        }
    }

    tracing::debug!(%service_name, count = children.len(), "found children");
    session.record_children(service_name, children.clone());
    Ok(children)
}

fn create_node(
    session: &CrawlSession,
    strategy: &CrawlStrategy,
    mut transport: NodeTransport,
) -> Result<(String, Node), CrawlError> {
    let provider_ref = strategy
        .resolve_child_provider(&transport.protocol_mux, transport.address.as_deref())
        .to_string();
    let from_hint = strategy.providers.iter().any(|p| p == PROVIDER_HINT);
    if session.config.obfuscate {
        transport.protocol_mux = session.obfuscator().alias_protocol_mux(&transport.protocol_mux);
    }
    // Children of disabled providers are dropped by the exclusion filter, so
    // a disabled provider need not be registered here.
    let containerized = if session.config.provider_disabled(&provider_ref) {
        false
    } else {
        session.providers.get(&provider_ref)?.is_container_platform()
    };

    let mut node = Node::new(
        strategy.clone(),
        strategy.protocol.clone(),
        transport.protocol_mux.clone(),
        provider_ref,
    );
    node.containerized = containerized;
    node.from_hint = from_hint;
    node.address = transport.address.clone();
    node.service_name = if from_hint {
        transport.debug_identifier.clone()
    } else {
        None
    };

    match transport.address.as_deref() {
        None | Some("") | Some("null") => {
            node.errors.insert(ERROR_NULL_ADDRESS.to_string());
        }
        Some(_) => {}
    }
    if transport.num_connections == Some(0) {
        node.warnings.insert(WARNING_DEFUNCT.to_string());
    }

    let reference = child_ref(
        &strategy.protocol.id,
        &node.protocol_mux,
        transport.debug_identifier.as_deref(),
    );
    Ok((reference, node))
}
