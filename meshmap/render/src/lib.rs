#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Renderers over the shared node tree: live ASCII, flat text edges, JSON
//! snapshots, and Graphviz DOT source. All of them observe the tree the
//! engine mutates in place; hint edges are collapsed here, not in the graph.

use async_trait::async_trait;
use meshmap_core::{CrawlConfig, PluginRegistry, Tree, Web};
use std::path::PathBuf;

pub mod ascii;
pub mod dot;
pub mod merge;
pub mod snapshot;
pub mod text;

pub use self::{
    ascii::AsciiRenderer, dot::DotRenderer, snapshot::JsonRenderer, snapshot::Snapshot,
    text::TextRenderer,
};

/// Everything a renderer needs besides the tree itself.
pub struct RenderContext {
    pub config: CrawlConfig,
    pub web: Web,
    pub outputs_dir: PathBuf,
}

#[async_trait]
pub trait Renderer: Send + Sync {
    /// The ref this renderer is selected by via `--output`.
    fn id(&self) -> &'static str;

    async fn render(&self, tree: &Tree, ctx: &RenderContext) -> anyhow::Result<()>;
}

/// Registry of renderers, keyed by renderer ref.
pub type RendererRegistry = PluginRegistry<dyn Renderer>;

/// Registers every built-in renderer.
pub fn register_builtin(registry: &mut RendererRegistry) -> Result<(), meshmap_core::RegistryError> {
    for renderer in [
        std::sync::Arc::new(AsciiRenderer) as std::sync::Arc<dyn Renderer>,
        std::sync::Arc::new(TextRenderer),
        std::sync::Arc::new(JsonRenderer),
        std::sync::Arc::new(DotRenderer),
    ] {
        registry.register(renderer.id(), renderer.clone())?;
    }
    Ok(())
}
