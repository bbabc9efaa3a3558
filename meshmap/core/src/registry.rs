//! Registry for a family of plugins (providers, renderers). Plugins register
//! themselves by ref at startup; looking up an unregistered ref is an error
//! the caller treats as fatal.

use std::{collections::HashMap, sync::Arc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{family} `{id}` is already registered")]
    Clobbered { family: &'static str, id: String },

    #[error("no {family} registered as `{id}`")]
    NotFound { family: &'static str, id: String },
}

pub struct PluginRegistry<P: ?Sized> {
    family: &'static str,
    plugins: HashMap<String, Arc<P>>,
}

impl<P: ?Sized> PluginRegistry<P> {
    pub fn new(family: &'static str) -> Self {
        Self {
            family,
            plugins: HashMap::new(),
        }
    }

    pub fn register(&mut self, id: &str, plugin: Arc<P>) -> Result<(), RegistryError> {
        if self.plugins.contains_key(id) {
            return Err(RegistryError::Clobbered {
                family: self.family,
                id: id.to_string(),
            });
        }
        tracing::debug!(family = %self.family, %id, "registered plugin");
        self.plugins.insert(id.to_string(), plugin);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Arc<P>, RegistryError> {
        self.plugins
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                family: self.family,
                id: id.to_string(),
            })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.plugins.contains_key(id)
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.plugins.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl<P: ?Sized> Default for PluginRegistry<P> {
    fn default() -> Self {
        Self::new("plugin")
    }
}
