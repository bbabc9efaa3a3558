//! Live tree renderer. It deliberately leans on the engine mutating the
//! shared nodes while it runs: each layer waits for name lookups, then
//! prints nodes as their crawl completes, recursing into children.

use crate::{merge, RenderContext, Renderer};
use async_trait::async_trait;
use meshmap_core::{Node, SharedNode, Tree, WARNING_CYCLE, WARNING_DEFUNCT};
use owo_colors::OwoColorize;
use std::{
    future::Future,
    io::Write,
    pin::Pin,
    time::Duration,
};
use tokio::time::sleep;

/// How many one-second rounds to wait for a layer's name lookups before
/// declaring the crawl wedged.
const NAME_WAIT_ROUNDS: usize = 100;

#[derive(Clone, Copy)]
struct Ancestor {
    last_sibling: bool,
    spacing: usize,
}

pub struct AsciiRenderer;

#[async_trait]
impl Renderer for AsciiRenderer {
    fn id(&self) -> &'static str {
        "ascii"
    }

    async fn render(&self, tree: &Tree, ctx: &RenderContext) -> anyhow::Result<()> {
        let mut stdout = std::io::stdout();
        render_tree(tree, ctx, &mut stdout, false).await
    }
}

/// Renders `tree` to `out`, waiting on in-flight crawling as needed.
/// `slow` adds a small delay per node so humans can follow a replay.
pub async fn render_tree(
    tree: &Tree,
    ctx: &RenderContext,
    out: &mut (dyn Write + Send),
    slow: bool,
) -> anyhow::Result<()> {
    render_layer(tree, Vec::new(), ctx, out, slow).await
}

fn render_layer<'a>(
    nodes: &'a Tree,
    parents: Vec<Ancestor>,
    ctx: &'a RenderContext,
    out: &'a mut (dyn Write + Send),
    slow: bool,
) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let depth = parents.len();
        wait_for_service_names(nodes, depth).await?;

        let merged = merge_by_service_name(&merge::merge_hints(nodes));
        let mut to_render = merged.clone();
        while !to_render.is_empty() {
            let refs: Vec<String> = to_render.keys().cloned().collect();
            for node_ref in refs {
                let Some(shared) = to_render.get(&node_ref).cloned() else {
                    continue;
                };
                let node = shared.snapshot();
                if node.warnings.contains(WARNING_DEFUNCT) && ctx.config.hide_defunct {
                    to_render.remove(&node_ref);
                    continue;
                }
                if !node.crawl_complete(depth, &ctx.config, &ctx.web) {
                    continue;
                }

                if slow {
                    sleep(Duration::from_millis(10)).await;
                }
                let is_last_sibling = to_render.len() == 1;

                let mut childrens_ancestors = parents.clone();
                childrens_ancestors.push(Ancestor {
                    last_sibling: is_last_sibling,
                    spacing: node.protocol.id.len(),
                });
                let prefix = display_prefix(&parents);
                let diagnostics_prefix = display_prefix(&childrens_ancestors);

                render_node(&node, depth, &prefix, is_last_sibling, ctx, out)?;
                if ctx.config.render_ascii_verbose {
                    render_diagnostics(&node, &diagnostics_prefix, out)?;
                }
                to_render.remove(&node_ref);

                let children = shared.read().children.clone();
                if childrens_ancestors.len() <= ctx.config.max_depth {
                    if let Some(children) = children {
                        if !children.is_empty() {
                            render_layer(&children, childrens_ancestors, ctx, out, slow).await?;
                        }
                    }
                }
            }

            if !to_render.is_empty() {
                tracing::debug!(
                    remaining = to_render.len(),
                    depth,
                    "waiting for crawl to complete"
                );
                sleep(Duration::from_millis(100)).await;
            }
        }
        Ok(())
    })
}

async fn wait_for_service_names(nodes: &Tree, depth: usize) -> anyhow::Result<()> {
    for _ in 0..NAME_WAIT_ROUNDS {
        if nodes
            .values()
            .all(|node| node.read().name_lookup_complete())
        {
            return Ok(());
        }
        tracing::debug!(depth, "waiting for name lookups before rendering");
        sleep(Duration::from_secs(1)).await;
    }
    anyhow::bail!("gave up waiting for name lookups at depth {depth}")
}

/// Folds siblings sharing a protocol and service name into one row,
/// concatenating their muxes.
fn merge_by_service_name(nodes: &Tree) -> Tree {
    let mut merged = Tree::new();
    for (node_ref, node) in nodes {
        let key = synthetic_ref(node, node_ref);
        match merged.get(&key) {
            None => {
                merged.insert(key, node.clone());
            }
            Some(existing) => {
                let mux = node.read().protocol_mux.clone();
                let mut existing = existing.write();
                if !existing.protocol_mux.contains(&mux) {
                    existing.protocol_mux = format!("{},{mux}", existing.protocol_mux);
                }
            }
        }
    }
    merged
}

fn synthetic_ref(node: &SharedNode, default: &str) -> String {
    let node = node.read();
    match &node.service_name {
        Some(name) => format!("{}_{name}", node.protocol.id.to_lowercase()),
        None => default.to_string(),
    }
}

fn display_prefix(parents: &[Ancestor]) -> String {
    let mut prefix = String::new();
    for (i, parent) in parents.iter().enumerate() {
        if i == 0 {
            prefix.push(' ');
            continue;
        }
        let branch = if parent.last_sibling { ' ' } else { '|' };
        prefix.push(branch);
        prefix.push_str("       ");
        prefix.push_str(&" ".repeat(parent.spacing));
    }
    prefix
}

fn render_node(
    node: &Node,
    depth: usize,
    prefix: &str,
    is_last_sibling: bool,
    ctx: &RenderContext,
    out: &mut (dyn Write + Send),
) -> anyhow::Result<()> {
    let service_name = node.service_name.as_deref().unwrap_or("UNKNOWN");

    let terminus = if node.warnings.contains(WARNING_DEFUNCT) {
        'x'
    } else if !node.errors.is_empty() {
        '?'
    } else {
        '>'
    };

    let mut branch = String::new();
    if depth > 0 {
        let bud = if node.warnings.contains(WARNING_CYCLE) {
            "<"
        } else if is_last_sibling {
            "└"
        } else {
            "|"
        };
        branch = format!("{bud}--{}--{terminus} ", node.protocol.id);
    }

    let info = if node.from_hint {
        format!("{} ", "{INFO:FROM_HINT}".cyan())
    } else {
        String::new()
    };

    let mut concise_warnings = String::new();
    if !ctx.config.render_ascii_verbose && !node.warnings.is_empty() {
        let tags: Vec<&str> = node.warnings.iter().map(String::as_str).collect();
        concise_warnings = format!("{} ", format!("{{WARN:{}}}", tags.join("|")).yellow());
    }

    let mut concise_errors = String::new();
    if !ctx.config.render_ascii_verbose && !node.errors.is_empty() {
        let tags: Vec<&str> = node.errors.iter().map(String::as_str).collect();
        concise_errors = format!("{} ", format!("{{ERR:{}}}", tags.join("|")).red());
    }

    if depth == 0 {
        writeln!(out)?;
    }

    let protocol_mux = if node.protocol.blocking && depth > 0 {
        format!("port:{}", node.protocol_mux)
    } else {
        node.protocol_mux.clone()
    };

    let address = if ctx.config.render_ascii_verbose {
        format!(" ({})", node.address.as_deref().unwrap_or("-"))
    } else {
        String::new()
    };

    writeln!(
        out,
        "{prefix}{branch}{info}{concise_warnings}{concise_errors}{service_name} [{protocol_mux}]{address}"
    )?;
    Ok(())
}

fn render_diagnostics(
    node: &Node,
    prefix: &str,
    out: &mut (dyn Write + Send),
) -> anyhow::Result<()> {
    let service_name = node.service_name.as_deref().unwrap_or("UNKNOWN");

    for warning in &node.warnings {
        let message = match warning.as_str() {
            "CYCLE" => format!("service '{service_name}' discovered as a parent of itself!"),
            "DEFUNCT" => format!(
                "service '{service_name}' configuration present on parent, but it is not in use!"
            ),
            other => format!("service '{service_name}' flagged {other}"),
        };
        writeln!(
            out,
            "{prefix}{}{message}",
            format!("└> WARN: ({warning}): ").yellow()
        )?;
    }

    for error in &node.errors {
        let address = node.address.as_deref().unwrap_or("-");
        let message = match error.as_str() {
            "NULL_ADDRESS" => format!(
                "service '{service_name}' detected but an instance address is not available to crawl!"
            ),
            "TIMEOUT" => format!(
                "timeout connecting to service '{service_name}' at address '{address}'"
            ),
            "NAME_LOOKUP_FAILED" => {
                format!("name lookup failed for '{service_name}' at address '{address}'")
            }
            other => format!("service '{service_name}' failed with {other}"),
        };
        writeln!(
            out,
            "{prefix}{}{message}",
            format!("└> ERROR: ({error}): ").red()
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshmap_core::{CrawlConfig, CrawlStrategy, Protocol, Web};
    use std::collections::BTreeMap;

    fn ctx() -> RenderContext {
        RenderContext {
            config: CrawlConfig::default(),
            web: Web::default(),
            outputs_dir: std::env::temp_dir(),
        }
    }

    fn named_node(protocol: Protocol, mux: &str, name: &str) -> Node {
        let mut node = Node::new(CrawlStrategy::seed(), protocol, mux, "dummy");
        node.service_name = Some(name.to_string());
        node.children = Some(BTreeMap::new());
        node
    }

    async fn rendered(tree: &Tree, ctx: &RenderContext) -> String {
        let mut out: Vec<u8> = Vec::new();
        render_tree(tree, ctx, &mut out, false).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn a_completed_tree_renders_with_branch_glyphs() {
        let mut seed = named_node(Protocol::seed(), "seed", "foo");
        let child = named_node(Protocol::new("DUM", "Dummy", true, false), "1234", "bar");
        seed.children = Some(BTreeMap::from([(
            "DUM_1234_bar".to_string(),
            SharedNode::new(child),
        )]));
        let tree = Tree::from([("SEED:1.2.3.4".to_string(), SharedNode::new(seed))]);

        let output = rendered(&tree, &ctx()).await;
        assert!(output.contains("foo [seed]"), "{output}");
        assert!(output.contains("└--DUM--> bar [port:1234]"), "{output}");
    }

    #[tokio::test]
    async fn defunct_edges_are_hidden_on_request() {
        let mut seed = named_node(Protocol::seed(), "seed", "foo");
        let mut child = named_node(Protocol::new("DUM", "Dummy", true, false), "1234", "dead");
        child.warnings.insert(WARNING_DEFUNCT.to_string());
        child.children = None;
        seed.children = Some(BTreeMap::from([(
            "DUM_1234_dead".to_string(),
            SharedNode::new(child),
        )]));
        let tree = Tree::from([("SEED:1.2.3.4".to_string(), SharedNode::new(seed))]);

        let mut ctx = ctx();
        ctx.config.hide_defunct = true;
        let output = rendered(&tree, &ctx).await;
        assert!(!output.contains("dead"), "{output}");

        ctx.config.hide_defunct = false;
        let output = rendered(&tree, &ctx).await;
        assert!(output.contains("dead"), "{output}");
        assert!(output.contains("--x"), "{output}");
    }

    #[tokio::test]
    async fn siblings_with_one_name_fold_into_one_row() {
        let protocol = Protocol::new("DUM", "Dummy", true, false);
        let mut seed = named_node(Protocol::seed(), "seed", "foo");
        seed.children = Some(BTreeMap::from([
            (
                "DUM_80_svc".to_string(),
                SharedNode::new(named_node(protocol.clone(), "80", "svc")),
            ),
            (
                "DUM_443_svc".to_string(),
                SharedNode::new(named_node(protocol, "443", "svc")),
            ),
        ]));
        let tree = Tree::from([("SEED:1.2.3.4".to_string(), SharedNode::new(seed))]);

        let output = rendered(&tree, &ctx()).await;
        assert!(output.contains("svc [port:443,80]") || output.contains("svc [port:80,443]"), "{output}");
    }

    #[test]
    fn prefixes_indent_by_ancestry() {
        let parents = vec![
            Ancestor { last_sibling: false, spacing: 3 },
            Ancestor { last_sibling: false, spacing: 3 },
            Ancestor { last_sibling: false, spacing: 2 },
        ];
        assert_eq!(display_prefix(&parents), " |          |         ");
    }
}
