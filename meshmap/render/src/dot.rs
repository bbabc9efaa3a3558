//! Graphviz DOT source generation. The source is printed and written under
//! the outputs directory; turning it into an image is left to `dot` itself.

use crate::{merge, RenderContext, Renderer};
use anyhow::Context;
use async_trait::async_trait;
use meshmap_core::{Node, SharedNode, Tree, WARNING_DEFUNCT};
use std::collections::{BTreeMap, HashSet};

const RANKDIR_LEFT_TO_RIGHT: &str = "LR";
const RANKDIR_TOP_TO_BOTTOM: &str = "TB";

pub struct DotRenderer;

#[async_trait]
impl Renderer for DotRenderer {
    fn id(&self) -> &'static str {
        "dot"
    }

    async fn render(&self, tree: &Tree, ctx: &RenderContext) -> anyhow::Result<()> {
        let source = source(tree, ctx);
        let path = ctx.outputs_dir.join("topology.dot");
        std::fs::write(&path, &source)
            .with_context(|| format!("writing {}", path.display()))?;
        tracing::info!(path = %path.display(), "wrote graphviz source");
        print!("{source}");
        Ok(())
    }
}

/// Renders the whole tree as DOT source.
pub fn source(tree: &Tree, ctx: &RenderContext) -> String {
    let mut builder = DotBuilder {
        ctx,
        nodes: BTreeMap::new(),
        edges_seen: HashSet::new(),
        edges: Vec::new(),
    };
    for (node_ref, node) in tree {
        builder.compile(node_ref, node, true);
    }

    let mut out = String::from("digraph topology {\n");
    out.push_str(&format!(
        "    graph [dpi=300, rankdir={}]\n    node [shape=box]\n",
        rankdir(ctx)
    ));
    for (name, attrs) in &builder.nodes {
        out.push_str(&format!("    \"{name}\"{}\n", attribute_list(&attrs.list())));
    }
    for edge in &builder.edges {
        out.push_str(&format!("    {edge}\n"));
    }
    out.push_str("}\n");
    out
}

fn rankdir(ctx: &RenderContext) -> &str {
    match ctx.config.render_dot_rankdir.as_deref() {
        Some(rankdir) => rankdir,
        None if ctx.config.skip_nonblocking_grandchildren => RANKDIR_LEFT_TO_RIGHT,
        None => RANKDIR_TOP_TO_BOTTOM,
    }
}

#[derive(Default)]
struct NodeAttrs {
    blocking_from_top: bool,
    shape: Option<&'static str>,
    color: Option<&'static str>,
}

impl NodeAttrs {
    fn list(&self) -> Vec<String> {
        let mut attrs = Vec::new();
        if let Some(shape) = self.shape {
            attrs.push(format!("shape={shape}"));
        }
        if self.blocking_from_top {
            attrs.push("style=bold".to_string());
        }
        if let Some(color) = self.color {
            attrs.push(format!("color={color}"));
        }
        attrs
    }
}

struct DotBuilder<'a> {
    ctx: &'a RenderContext,
    nodes: BTreeMap<String, NodeAttrs>,
    edges_seen: HashSet<String>,
    edges: Vec<String>,
}

impl DotBuilder<'_> {
    fn compile(&mut self, node_ref: &str, shared: &SharedNode, blocking_from_top: bool) {
        let node = shared.snapshot();
        let name = node_name(&node, node_ref);
        self.compile_node(&node, &name, blocking_from_top);

        let children = shared.read().children.clone();
        let Some(children) = children else { return };
        if children.is_empty() {
            return;
        }

        for (child_ref, child_shared) in merge::merge_hints(&children) {
            let child = child_shared.snapshot();
            if child.warnings.contains(WARNING_DEFUNCT) && self.ctx.config.hide_defunct {
                continue;
            }
            let child_blocking = blocking_from_top && child.protocol.blocking;
            let child_name = node_name(&child, &child_ref);
            self.compile_node(&child, &child_name, child_blocking);
            self.compile_edge(&name, &child, &child_name, child_blocking);
            self.compile(&child_ref, &child_shared, child_blocking);
        }
    }

    fn compile_node(&mut self, node: &Node, name: &str, blocking_from_top: bool) {
        let entry = self.nodes.entry(name.to_string()).or_default();
        entry.blocking_from_top |= blocking_from_top;
        entry.shape = if node.is_database() {
            Some("cylinder")
        } else if node.containerized {
            Some("septagon")
        } else {
            entry.shape
        };
        entry.color = if !node.errors.is_empty() {
            Some("red")
        } else if !node.warnings.is_empty() {
            Some("darkorange")
        } else {
            entry.color
        };
    }

    fn compile_edge(&mut self, parent: &str, child: &Node, child_name: &str, blocking: bool) {
        let key = format!("{parent}.{}.{child_name}", child.protocol.id);
        if self.edges_seen.contains(&key) {
            return;
        }
        self.edges_seen.insert(key);

        let defunct = child.warnings.contains(WARNING_DEFUNCT);
        let highlighted = self
            .ctx
            .config
            .render_dot_highlight
            .iter()
            .any(|service| service == parent || service == child_name);

        let mut style = Vec::new();
        if blocking {
            style.push("bold");
        }
        if !child.protocol.blocking {
            style.push("dashed");
        }
        if defunct {
            style.extend(["dotted", "filled"]);
        }

        let mut color = String::new();
        if !child.errors.is_empty() {
            color.push_str("red");
        } else if defunct {
            color.push_str("darkorange");
        }
        if child.from_hint {
            color.push_str(":blue");
        }
        if highlighted {
            color = "yellow:black:yellow".to_string();
        }

        let mut annotations: Vec<&str> = node_tags(child);
        if child.from_hint {
            annotations.push("HINT");
        }
        let label = if annotations.is_empty() {
            child.protocol.id.clone()
        } else {
            format!("{} ({})", child.protocol.id, annotations.join(","))
        };

        let mut attrs = vec![format!("label=\"{label}\"")];
        if !style.is_empty() {
            attrs.push(format!("style=\"{}\"", style.join(",")));
        }
        if !color.is_empty() {
            attrs.push(format!("color=\"{color}\""));
        }
        if defunct || child.from_hint {
            attrs.push("penwidth=3".to_string());
        }

        self.edges.push(format!(
            "\"{parent}\" -> \"{child_name}\"{}",
            attribute_list(&attrs)
        ));
    }
}

fn node_tags(node: &Node) -> Vec<&str> {
    node.errors
        .iter()
        .chain(node.warnings.iter())
        .map(String::as_str)
        .collect()
}

fn node_name(node: &Node, node_ref: &str) -> String {
    let name = match node.service_name.as_deref() {
        Some(name) => name.to_string(),
        None => format!("UNKNOWN\\n({node_ref})"),
    };
    merge::clean_service_name(&name)
}

fn attribute_list(attrs: &[String]) -> String {
    if attrs.is_empty() {
        String::new()
    } else {
        format!(" [{}]", attrs.join(", "))
    }
}
