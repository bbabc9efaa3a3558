//! Flat text renderer: one deduplicated `parent -> child (mux)` line per
//! observed edge, sorted.

use crate::{RenderContext, Renderer};
use async_trait::async_trait;
use meshmap_core::{Node, Tree};
use std::{collections::BTreeSet, io::Write};

pub struct TextRenderer;

#[async_trait]
impl Renderer for TextRenderer {
    fn id(&self) -> &'static str {
        "text"
    }

    async fn render(&self, tree: &Tree, _ctx: &RenderContext) -> anyhow::Result<()> {
        let mut stdout = std::io::stdout();
        render_to(tree, &mut stdout)
    }
}

pub fn render_to(tree: &Tree, out: &mut dyn Write) -> anyhow::Result<()> {
    let mut relationships = BTreeSet::new();
    for node in tree.values() {
        collect_edges(&node.snapshot(), &mut relationships);
    }
    for relationship in &relationships {
        writeln!(out, "{relationship}")?;
    }
    Ok(())
}

fn collect_edges(node: &Node, relationships: &mut BTreeSet<String>) {
    let Some(children) = &node.children else {
        return;
    };
    for child in children.values() {
        let child = child.snapshot();
        relationships.insert(format!(
            "{} -> {} ({})",
            node.service_name.as_deref().unwrap_or("UNKNOWN"),
            child.service_name.as_deref().unwrap_or("UNKNOWN"),
            child.protocol_mux,
        ));
        collect_edges(&child, relationships);
    }
}
