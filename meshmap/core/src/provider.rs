//! The provider capability contract: the narrow interface the traversal
//! engine consumes to talk to a concrete infrastructure (remote shell,
//! cluster API, ...). Every method has a no-op default so a backend can
//! implement capabilities a-la-carte.

use crate::{node::NodeTransport, web::Hint};
use async_trait::async_trait;
use std::{any::Any, collections::BTreeMap};
use thiserror::Error;

/// An opaque connection handle passed back into subsequent capability calls;
/// providers downcast it to their own connection type.
pub type Connection = Box<dyn Any + Send + Sync>;

/// Arguments forwarded from a crawl strategy's `providerArgs`.
pub type ProviderArgs = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Connection-open timed out; tolerated per-node at stage 1.
    #[error("timed out connecting to {0}")]
    Timeout(String),

    /// Any other provider failure; fatal to the run.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl From<ResponseParseError> for ProviderError {
    fn from(err: ResponseParseError) -> Self {
        Self::Failed(anyhow::Error::new(err))
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// The unique ref this provider registers under.
    fn id(&self) -> &'static str;

    /// Container platforms (kubernetes, docker) render their nodes
    /// differently than traditional servers.
    fn is_container_platform(&self) -> bool {
        false
    }

    /// Optionally open a connection to be reused by `lookup_name` and
    /// `crawl_downstream`. Called once per node before name lookup.
    async fn open_connection(&self, _address: &str) -> Result<Option<Connection>, ProviderError> {
        Ok(None)
    }

    /// Resolve the service name at `address`; `None` signals the name is
    /// unresolvable.
    async fn lookup_name(
        &self,
        _address: &str,
        _connection: Option<&Connection>,
    ) -> Result<Option<String>, ProviderError> {
        Ok(None)
    }

    /// Enumerate downstream peers of `address` according to a strategy's
    /// provider args.
    async fn crawl_downstream(
        &self,
        _address: &str,
        _connection: Option<&Connection>,
        _args: &ProviderArgs,
    ) -> Result<Vec<NodeTransport>, ProviderError> {
        Ok(Vec::new())
    }

    /// Resolve a hint to a discovered instance; conventionally returns
    /// exactly one transport.
    async fn take_a_hint(&self, _hint: &Hint) -> Result<Vec<NodeTransport>, ProviderError> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Error)]
pub enum ResponseParseError {
    #[error("discovery response for {address} (`{command}`) has no `mux` column")]
    MissingMux { address: String, command: String },

    #[error("discovery response for {address} (`{command}`) row {row}: {problem}")]
    MalformedRow {
        address: String,
        command: String,
        row: usize,
        problem: String,
    },
}

/// Parses a tabular discovery response into transports.
///
/// The first line is a whitespace-separated header naming columns out of
/// {`mux`, `address`, `id`, `conns`, `metadata`}; each following line is a
/// row. Zero rows parse as no transports; rows without a `mux` value are a
/// shape error. `metadata` is comma-separated `k=v` pairs.
pub fn parse_discovery_response(
    response: &str,
    address: &str,
    command: &str,
) -> Result<Vec<NodeTransport>, ResponseParseError> {
    let mut lines = response.lines();
    let header: Vec<&str> = match lines.next() {
        Some(line) => line.split_whitespace().collect(),
        None => return Ok(Vec::new()),
    };
    let rows: Vec<&str> = lines.filter(|line| !line.trim().is_empty()).collect();
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let missing_mux = || ResponseParseError::MissingMux {
        address: address.to_string(),
        command: command.to_string(),
    };
    let mux_column = header
        .iter()
        .position(|column| *column == "mux")
        .ok_or_else(missing_mux)?;

    let mut transports = Vec::with_capacity(rows.len());
    for (row_number, row) in rows.iter().enumerate() {
        let fields: Vec<&str> = row.split_whitespace().collect();
        let field = |name: &str| {
            header
                .iter()
                .position(|column| *column == name)
                .and_then(|i| fields.get(i).copied())
        };

        let mut transport = NodeTransport::new(
            *fields.get(mux_column).ok_or_else(missing_mux)?,
        );
        transport.address = field("address").map(str::to_string);
        transport.debug_identifier = field("id").map(str::to_string);
        transport.num_connections = field("conns")
            .map(|conns| {
                conns
                    .parse::<u64>()
                    .map_err(|_| ResponseParseError::MalformedRow {
                        address: address.to_string(),
                        command: command.to_string(),
                        row: row_number,
                        problem: format!("unparseable conns value `{conns}`"),
                    })
            })
            .transpose()?;
        if let Some(metadata) = field("metadata") {
            transport.metadata = metadata
                .split(',')
                .filter_map(|pair| pair.split_once('='))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
        }
        transports.push(transport);
    }

    Ok(transports)
}
