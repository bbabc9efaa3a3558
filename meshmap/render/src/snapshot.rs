//! JSON snapshot of a crawl: the flattened run configuration plus the tree,
//! with `__type__` discriminants on every typed record so a later `render`
//! run can reconstruct it faithfully.

use crate::{RenderContext, Renderer};
use anyhow::Context;
use async_trait::async_trait;
use meshmap_core::{CrawlConfig, Tree};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

#[derive(Serialize, Deserialize)]
pub struct Snapshot {
    pub args: CrawlConfig,
    pub tree: Tree,
}

impl Snapshot {
    pub fn new(config: &CrawlConfig, tree: &Tree) -> Self {
        Self {
            args: config.clone(),
            tree: tree.clone(),
        }
    }
}

pub fn dump(snapshot: &Snapshot, path: &Path) -> anyhow::Result<()> {
    let file = fs::File::create(path)
        .with_context(|| format!("creating snapshot file {}", path.display()))?;
    serde_json::to_writer(file, snapshot).context("serializing crawl snapshot")?;
    Ok(())
}

pub fn dumps(snapshot: &Snapshot) -> anyhow::Result<String> {
    serde_json::to_string(snapshot).context("serializing crawl snapshot")
}

pub fn load(path: &Path) -> anyhow::Result<Snapshot> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading snapshot file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("parsing snapshot file {}", path.display()))
}

pub struct JsonRenderer;

#[async_trait]
impl Renderer for JsonRenderer {
    fn id(&self) -> &'static str {
        "json"
    }

    async fn render(&self, tree: &Tree, ctx: &RenderContext) -> anyhow::Result<()> {
        println!("{}", dumps(&Snapshot::new(&ctx.config, tree))?);
        Ok(())
    }
}
