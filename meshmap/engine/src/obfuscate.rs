//! Stable aliasing of service names and protocol muxes so a rendered graph
//! can be shared outside a trusted organization.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;

const ADJECTIVES: [&str; 24] = [
    "amber", "brisk", "calm", "dapper", "eager", "fuzzy", "gentle", "hazel", "ivory", "jolly",
    "keen", "lively", "mellow", "nimble", "opal", "plucky", "quiet", "rustic", "sleek", "tidy",
    "umber", "vivid", "wry", "zesty",
];

const NOUNS: [&str; 24] = [
    "anchor", "beacon", "cedar", "dune", "ember", "fjord", "grove", "harbor", "isle", "jetty",
    "knoll", "lagoon", "meadow", "nook", "orchard", "pond", "quarry", "ridge", "summit", "thicket",
    "upland", "vale", "willow", "zephyr",
];

/// Hands out one stable alias per distinct input. Aliases must stay unique
/// across inputs or cycle detection and the child cache would conflate two
/// services.
#[derive(Default)]
pub struct Obfuscator {
    service_names: Mutex<HashMap<String, String>>,
    protocol_muxes: Mutex<HashMap<String, String>>,
}

impl Obfuscator {
    pub fn alias_service_name(&self, service_name: &str) -> String {
        let mut aliases = self.service_names.lock();
        if let Some(alias) = aliases.get(service_name) {
            return alias.clone();
        }
        let alias = unique(&aliases, || {
            let mut rng = rand::thread_rng();
            format!("{}-{}", pick(&mut rng, &ADJECTIVES), pick(&mut rng, &NOUNS))
        });
        aliases.insert(service_name.to_string(), alias.clone());
        alias
    }

    /// Numeric muxes alias to a port-shaped number, anything else to a word
    /// pair.
    pub fn alias_protocol_mux(&self, protocol_mux: &str) -> String {
        let mut aliases = self.protocol_muxes.lock();
        if let Some(alias) = aliases.get(protocol_mux) {
            return alias.clone();
        }
        let numeric =
            !protocol_mux.is_empty() && protocol_mux.chars().all(|c| c.is_ascii_digit());
        let alias = unique(&aliases, || {
            let mut rng = rand::thread_rng();
            if numeric {
                rng.gen_range(1024u32..=65535).to_string()
            } else {
                format!("{}#{}", pick(&mut rng, &ADJECTIVES), pick(&mut rng, &NOUNS))
            }
        });
        aliases.insert(protocol_mux.to_string(), alias.clone());
        alias
    }
}

fn pick<'a>(rng: &mut impl Rng, words: &[&'a str]) -> &'a str {
    words[rng.gen_range(0..words.len())]
}

fn unique(taken: &HashMap<String, String>, generate: impl Fn() -> String) -> String {
    loop {
        let candidate = generate();
        if !taken.values().any(|alias| alias == &candidate) {
            return candidate;
        }
    }
}
