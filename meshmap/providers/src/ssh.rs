//! Remote-shell provider driving the system ssh client. Bastion/jump
//! routing, usernames, and keys all come from the user's ssh config file, as
//! in `ssh -F ~/.ssh/config`.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use meshmap_core::{
    parse_discovery_response, Connection, NodeTransport, Provider, ProviderArgs, ProviderError,
};
use std::process::Stdio;
use tokio::{process::Command, sync::Semaphore};

#[derive(Clone, Debug)]
pub struct SshConfig {
    /// Command run on the remote host to resolve its service name.
    pub name_command: String,
    /// ssh config file, as in `ssh -F FILE`.
    pub config_file: String,
    /// Max concurrent ssh sessions.
    pub concurrency: usize,
    /// ConnectTimeout passed to the ssh client.
    pub connect_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            name_command: "hostname".to_string(),
            config_file: "~/.ssh/config".to_string(),
            concurrency: 10,
            connect_timeout_secs: 5,
        }
    }
}

/// Marker connection handle; commands are multiplexed by the ssh client
/// itself, so the handle only records that the host answered.
struct SshSession {
    address: String,
}

pub struct SshProvider {
    config: SshConfig,
    sessions: Semaphore,
}

impl SshProvider {
    pub fn new(config: SshConfig) -> Self {
        let sessions = Semaphore::new(config.concurrency.max(1));
        Self { config, sessions }
    }

    async fn run(&self, address: &str, command: &str) -> Result<String, ProviderError> {
        let _permit = self
            .sessions
            .acquire()
            .await
            .map_err(|_| ProviderError::Failed(anyhow!("ssh session limiter closed")))?;

        tracing::debug!(%address, %command, "running remote command");
        let output = Command::new("ssh")
            .arg("-F")
            .arg(expand_tilde(&self.config.config_file))
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.config.connect_timeout_secs
            ))
            .arg(address)
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("spawning ssh for {address}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProviderError::Failed(anyhow!(
                "ssh exited {} running `{command}` on {address}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl Provider for SshProvider {
    fn id(&self) -> &'static str {
        "ssh"
    }

    async fn open_connection(&self, address: &str) -> Result<Option<Connection>, ProviderError> {
        // An unanswered probe is the per-node tolerated failure; everything
        // downstream of a live probe is fatal if it breaks.
        let _permit = self
            .sessions
            .acquire()
            .await
            .map_err(|_| ProviderError::Failed(anyhow!("ssh session limiter closed")))?;

        tracing::debug!(%address, "probing ssh reachability");
        let status = Command::new("ssh")
            .arg("-F")
            .arg(expand_tilde(&self.config.config_file))
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.config.connect_timeout_secs
            ))
            .arg(address)
            .arg("true")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .with_context(|| format!("spawning ssh for {address}"))?;

        if !status.success() {
            return Err(ProviderError::Timeout(address.to_string()));
        }
        Ok(Some(Box::new(SshSession {
            address: address.to_string(),
        })))
    }

    async fn lookup_name(
        &self,
        address: &str,
        _connection: Option<&Connection>,
    ) -> Result<Option<String>, ProviderError> {
        let stdout = self.run(address, &self.config.name_command).await?;
        let name = stdout.trim();
        if name.is_empty() {
            return Ok(None);
        }
        tracing::debug!(%address, %name, "resolved service name");
        Ok(Some(name.to_string()))
    }

    async fn crawl_downstream(
        &self,
        address: &str,
        connection: Option<&Connection>,
        args: &ProviderArgs,
    ) -> Result<Vec<NodeTransport>, ProviderError> {
        let command = args
            .get("shell_command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ProviderError::Failed(anyhow!(
                    "crawl strategy for the ssh provider must set providerArgs.shell_command"
                ))
            })?;
        let address = connection
            .and_then(|c| c.downcast_ref::<SshSession>())
            .map(|session| session.address.as_str())
            .unwrap_or(address);

        let stdout = self.run(address, command).await?;
        let response = stdout.trim();
        if response.starts_with("ERROR:") {
            return Err(ProviderError::Failed(anyhow!(
                "remote discovery failed on {address}: {}",
                response.replace('\n', "\t")
            )));
        }
        Ok(parse_discovery_response(response, address, command)?)
    }
}

fn expand_tilde(path: &str) -> String {
    match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{home}/{rest}"),
        _ => path.to_string(),
    }
}
