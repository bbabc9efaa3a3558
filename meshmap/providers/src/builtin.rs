//! Capability stubs for the built-in SEED and HINT protocols. Seed nodes
//! carry a real provider for their address; these exist so registry lookups
//! against the built-in refs always resolve.

use meshmap_core::{Provider, PROVIDER_HINT, PROVIDER_SEED};

pub struct SeedProvider;

impl Provider for SeedProvider {
    fn id(&self) -> &'static str {
        PROVIDER_SEED
    }
}

pub struct HintProvider;

impl Provider for HintProvider {
    fn id(&self) -> &'static str {
        PROVIDER_HINT
    }
}
