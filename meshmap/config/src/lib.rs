#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Loads the declarative discovery configuration: one `web.yaml` document
//! (protocols, skip rules, hints) plus any number of strategy documents, out
//! of a conventional configuration directory.

use indexmap::IndexMap;
use meshmap_core::{
    ChildProviderRule, CrawlStrategy, Hint, Protocol, ProviderArgs, ServiceNameFilter, Web,
};
use serde::{Deserialize, Deserializer};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// File name of the web document inside the configuration directory.
pub const WEB_DOCUMENT: &str = "web.yaml";

/// Default configuration directory, relative to the working directory.
pub const DEFAULT_CONFIG_DIR: &str = "web.d";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to parse {context}")]
    Yaml {
        context: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("web document `{WEB_DOCUMENT}` not found in {}", .0.display())]
    MissingWebDocument(PathBuf),

    #[error("protocol `{protocol}` referenced by {context} is not registered")]
    UnknownProtocol { protocol: String, context: String },

    #[error("no protocols defined beyond the built-ins; define protocols in `{WEB_DOCUMENT}` before proceeding")]
    NoUserProtocols,

    #[error("invalid address pattern `{pattern}` in strategy `{strategy}`")]
    InvalidPattern {
        pattern: String,
        strategy: String,
        #[source]
        source: Box<regex::Error>,
    },
}

/// Loads the web document and every strategy document in `dir`.
///
/// Strategy documents are all other `*.yaml`/`*.yml` files in the directory,
/// read in file-name order; each may hold multiple YAML documents.
pub fn load_dir(dir: &Path) -> Result<(Web, Vec<CrawlStrategy>), ConfigError> {
    let web_path = dir.join(WEB_DOCUMENT);
    if !web_path.is_file() {
        return Err(ConfigError::MissingWebDocument(dir.to_path_buf()));
    }
    let web = parse_web(&read(&web_path)?)?;
    if !web.has_user_protocols() {
        return Err(ConfigError::NoUserProtocols);
    }

    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            ) && path.file_name().and_then(|n| n.to_str()) != Some(WEB_DOCUMENT)
        })
        .collect();
    paths.sort();

    let mut strategies = Vec::new();
    for path in paths {
        let document = read(&path)?;
        let context = path.display().to_string();
        strategies.extend(parse_strategies(&document, &context, &web)?);
    }
    tracing::debug!(count = strategies.len(), "loaded crawl strategies");

    Ok((web, strategies))
}

fn read(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Deserialize)]
struct WebDoc {
    #[serde(default)]
    protocols: IndexMap<String, ProtocolDoc>,
    #[serde(default)]
    skips: Option<SkipsDoc>,
    #[serde(default)]
    hints: IndexMap<String, Vec<HintDoc>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProtocolDoc {
    name: String,
    blocking: bool,
    #[serde(default)]
    is_database: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SkipsDoc {
    #[serde(default)]
    service_names: Vec<String>,
    #[serde(default)]
    protocol_muxes: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HintDoc {
    service_name: String,
    protocol: String,
    #[serde(deserialize_with = "string_or_number")]
    protocol_mux: String,
    provider: String,
    instance_provider: String,
}

/// Parses the web document into a `Web` registry.
pub fn parse_web(document: &str) -> Result<Web, ConfigError> {
    let doc: WebDoc = serde_yaml::from_str(document).map_err(|source| ConfigError::Yaml {
        context: WEB_DOCUMENT.to_string(),
        source,
    })?;

    let mut web = Web::default();
    for (id, protocol) in doc.protocols {
        web.register_protocol(Protocol::new(
            id,
            protocol.name,
            protocol.blocking,
            protocol.is_database,
        ));
    }

    let skips = doc.skips.unwrap_or_default();
    web.set_skips(skips.service_names, skips.protocol_muxes);

    for (upstream, hint_docs) in doc.hints {
        let hints = hint_docs
            .into_iter()
            .map(|doc| {
                let protocol = resolve_protocol(&web, &doc.protocol, || {
                    format!("hint for `{upstream}`")
                })?;
                Ok(Hint {
                    service_name: doc.service_name,
                    protocol,
                    protocol_mux: doc.protocol_mux,
                    provider: doc.provider,
                    instance_provider: doc.instance_provider,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        web.add_hints(upstream, hints);
    }

    Ok(web)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StrategyDoc {
    name: String,
    description: String,
    providers: Vec<String>,
    protocol: String,
    #[serde(default)]
    provider_args: IndexMap<String, serde_yaml::Value>,
    child_provider: ChildProviderRule,
    #[serde(default)]
    service_name_filter: Option<ServiceNameFilter>,
    #[serde(default)]
    service_name_rewrites: IndexMap<String, String>,
}

/// Parses one strategy document (possibly a multi-document stream).
///
/// Records typed `CrawlStrategy` are loaded; any other typed record is
/// ignored, leaving room for other declarative record kinds to share the
/// directory.
pub fn parse_strategies(
    document: &str,
    context: &str,
    web: &Web,
) -> Result<Vec<CrawlStrategy>, ConfigError> {
    let mut strategies = Vec::new();
    for chunk in split_documents(document) {
        let value: serde_yaml::Value =
            serde_yaml::from_str(chunk).map_err(|source| ConfigError::Yaml {
                context: context.to_string(),
                source,
            })?;
        if value.is_null() {
            continue;
        }
        match value.get("type").and_then(|t| t.as_str()) {
            Some("CrawlStrategy") => {}
            other => {
                tracing::debug!(context, record_type = ?other, "ignoring untyped record");
                continue;
            }
        }

        let doc: StrategyDoc =
            serde_yaml::from_value(value).map_err(|source| ConfigError::Yaml {
                context: context.to_string(),
                source,
            })?;
        let protocol = resolve_protocol(web, &doc.protocol, || {
            format!("strategy `{}` in {context}", doc.name)
        })?;
        validate_child_provider(&doc.child_provider, &doc.name)?;

        let mut provider_args = ProviderArgs::new();
        for (key, value) in doc.provider_args {
            let value = serde_json::to_value(&value).map_err(|_| ConfigError::Yaml {
                context: format!("providerArgs of strategy `{}` in {context}", doc.name),
                source: serde::de::Error::custom("providerArgs value is not representable"),
            })?;
            provider_args.insert(key, value);
        }

        let strategy = CrawlStrategy::new(
            doc.name,
            doc.description,
            protocol,
            doc.providers,
            provider_args,
            doc.child_provider,
            doc.service_name_filter.unwrap_or_default(),
            doc.service_name_rewrites,
        );
        tracing::debug!(name = %strategy.name, "loaded crawl strategy");
        strategies.push(strategy);
    }
    Ok(strategies)
}

fn resolve_protocol(
    web: &Web,
    id: &str,
    context: impl Fn() -> String,
) -> Result<Protocol, ConfigError> {
    web.protocol(id)
        .cloned()
        .ok_or_else(|| ConfigError::UnknownProtocol {
            protocol: id.to_string(),
            context: context(),
        })
}

fn validate_child_provider(rule: &ChildProviderRule, strategy: &str) -> Result<(), ConfigError> {
    if let ChildProviderRule::MatchAddress { matches, .. } = rule {
        for pattern in matches.keys() {
            regex::Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
                pattern: pattern.clone(),
                strategy: strategy.to_string(),
                source: Box::new(source),
            })?;
        }
    }
    Ok(())
}

/// Splits a YAML stream on `---` separator lines. serde_yaml 0.8 parses one
/// document at a time.
fn split_documents(stream: &str) -> impl Iterator<Item = &str> {
    stream
        .split("\n---")
        .map(|chunk| chunk.strip_prefix("---").unwrap_or(chunk))
        .map(str::trim)
        .filter(|chunk| !chunk.is_empty())
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        String(String),
        Number(i64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::String(s) => s,
        Raw::Number(n) => n.to_string(),
    })
}
