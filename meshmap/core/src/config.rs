//! Flattened run configuration shared by the engine and the renderers, and
//! persisted in the `args` block of a JSON snapshot.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_MAX_DEPTH: usize = 100;
pub const DEFAULT_TIMEOUT_SECS: f64 = 30.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    pub seeds: Vec<String>,
    pub max_depth: usize,
    pub timeout_secs: f64,
    pub disable_providers: Vec<String>,
    pub skip_protocols: Vec<String>,
    pub skip_protocol_muxes: Vec<String>,
    pub skip_nonblocking_grandchildren: bool,
    pub obfuscate: bool,
    pub quiet: bool,
    pub hide_defunct: bool,
    pub output: Vec<String>,
    pub render_ascii_verbose: bool,
    pub render_dot_rankdir: Option<String>,
    pub render_dot_highlight: Vec<String>,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            max_depth: DEFAULT_MAX_DEPTH,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            disable_providers: Vec::new(),
            skip_protocols: Vec::new(),
            skip_protocol_muxes: Vec::new(),
            skip_nonblocking_grandchildren: false,
            obfuscate: false,
            quiet: false,
            hide_defunct: false,
            output: Vec::new(),
            render_ascii_verbose: false,
            render_dot_rankdir: None,
            render_dot_highlight: Vec::new(),
        }
    }
}

impl CrawlConfig {
    /// Per-provider-call deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }

    pub fn provider_disabled(&self, provider: &str) -> bool {
        self.disable_providers.iter().any(|p| p == provider)
    }

    pub fn skip_protocol(&self, protocol_ref: &str) -> bool {
        self.skip_protocols.iter().any(|p| p == protocol_ref)
    }

    /// True if the mux matches any `--skip-protocol-muxes` substring;
    /// consulted when discovered transports are converted to children.
    pub fn skip_protocol_mux(&self, protocol_mux: &str) -> bool {
        self.skip_protocol_muxes
            .iter()
            .any(|skip| protocol_mux.contains(skip.as_str()))
    }
}
