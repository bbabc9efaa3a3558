//! Kubernetes provider. Assumes one cluster, authenticated as the active
//! kubeconfig context, with services identifiable by a pod label.

use ahash::AHashMap;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, ListParams};
use meshmap_core::{Connection, Hint, NodeTransport, Provider, ProviderArgs, ProviderError};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;

#[derive(Clone, Debug)]
pub struct K8sConfig {
    /// Namespace in which services are discovered.
    pub namespace: String,
    /// Pod label holding the service name.
    pub service_name_label: String,
    /// Containers ignored during discovery (substring match).
    pub skip_containers: Vec<String>,
    /// Extra `LABEL=VALUE` selectors applied when resolving hints.
    pub label_selectors: Vec<String>,
}

impl Default for K8sConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            service_name_label: "app".to_string(),
            skip_containers: Vec::new(),
            label_selectors: Vec::new(),
        }
    }
}

pub struct K8sProvider {
    client: kube::Client,
    config: K8sConfig,
    pod_cache: Mutex<AHashMap<String, Pod>>,
}

impl K8sProvider {
    /// Connects using the active kubeconfig context (or in-cluster config).
    pub async fn new(config: K8sConfig) -> anyhow::Result<Self> {
        let client = kube::Client::try_default()
            .await
            .context("initializing kubernetes client")?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: kube::Client, config: K8sConfig) -> Self {
        Self {
            client,
            config,
            pod_cache: Mutex::new(AHashMap::new()),
        }
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    async fn pod(&self, name: &str) -> Result<Pod, ProviderError> {
        if let Some(pod) = self.pod_cache.lock().get(name) {
            return Ok(pod.clone());
        }
        let pod = self
            .pods()
            .get(name)
            .await
            .with_context(|| format!("reading pod {name}"))?;
        self.pod_cache.lock().insert(name.to_string(), pod.clone());
        Ok(pod)
    }

    async fn exec_in_container(
        &self,
        pod_name: &str,
        container: &str,
        command: &str,
    ) -> Result<String, ProviderError> {
        tracing::debug!(pod = %pod_name, %container, %command, "executing in container");
        let params = AttachParams::default()
            .container(container.to_string())
            .stderr(false);
        let mut attached = self
            .pods()
            .exec(pod_name, vec!["sh", "-c", command], &params)
            .await
            .with_context(|| format!("executing in pod {pod_name}"))?;

        let mut stdout = attached
            .stdout()
            .ok_or_else(|| ProviderError::Failed(anyhow!("exec returned no stdout stream")))?;
        let mut output = String::new();
        stdout
            .read_to_string(&mut output)
            .await
            .with_context(|| format!("reading exec output from pod {pod_name}"))?;
        attached
            .join()
            .await
            .with_context(|| format!("joining exec in pod {pod_name}"))?;
        Ok(output)
    }
}

#[async_trait]
impl Provider for K8sProvider {
    fn id(&self) -> &'static str {
        "k8s"
    }

    fn is_container_platform(&self) -> bool {
        true
    }

    async fn lookup_name(
        &self,
        address: &str,
        _connection: Option<&Connection>,
    ) -> Result<Option<String>, ProviderError> {
        let pod = self.pod(address).await?;
        let name = pod
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(&self.config.service_name_label))
            .cloned();
        Ok(name)
    }

    async fn crawl_downstream(
        &self,
        address: &str,
        _connection: Option<&Connection>,
        args: &ProviderArgs,
    ) -> Result<Vec<NodeTransport>, ProviderError> {
        let command = args
            .get("shell_command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ProviderError::Failed(anyhow!(
                    "crawl strategy for the k8s provider must set providerArgs.shell_command"
                ))
            })?;

        let pod = self.pod(address).await?;
        let containers: Vec<String> = pod
            .spec
            .as_ref()
            .map(|spec| {
                spec.containers
                    .iter()
                    .map(|container| container.name.clone())
                    .filter(|name| {
                        !self
                            .config
                            .skip_containers
                            .iter()
                            .any(|skip| name.contains(skip.as_str()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut transports = Vec::new();
        for container in containers {
            let output = self.exec_in_container(address, &container, command).await?;
            transports.extend(parse_exec_lines(&output));
        }
        Ok(transports)
    }

    async fn take_a_hint(&self, hint: &Hint) -> Result<Vec<NodeTransport>, ProviderError> {
        let selector = hint_label_selector(&self.config, &hint.service_name);
        let params = ListParams::default().labels(&selector).limit(1);
        let pods = self
            .pods()
            .list(&params)
            .await
            .with_context(|| format!("listing pods for hint `{}`", hint.service_name))?;

        let address = pods
            .items
            .into_iter()
            .next()
            .and_then(|pod| pod.metadata.name)
            .ok_or_else(|| {
                ProviderError::Failed(anyhow!(
                    "no instance of `{}` in the cluster to take the hint",
                    hint.service_name
                ))
            })?;

        Ok(vec![NodeTransport {
            protocol_mux: hint.protocol_mux.clone(),
            address: Some(address),
            debug_identifier: Some(hint.service_name.clone()),
            ..NodeTransport::default()
        }])
    }
}

fn hint_label_selector(config: &K8sConfig, service_name: &str) -> String {
    let mut selectors = vec![format!("{}={service_name}", config.service_name_label)];
    selectors.extend(config.label_selectors.iter().cloned());
    selectors.join(",")
}

/// Exec responses are positional rows: `mux [address [id [conns]]]`, with a
/// literal `null` standing in for an absent address.
fn parse_exec_lines(output: &str) -> Vec<NodeTransport> {
    output
        .lines()
        .filter_map(|line| {
            let columns: Vec<&str> = line.split_whitespace().collect();
            let mux = columns.first()?;
            let mut transport = NodeTransport::new(*mux);
            transport.address = columns
                .get(1)
                .filter(|address| **address != "null")
                .map(|address| address.to_string());
            transport.debug_identifier = columns.get(2).map(|id| id.to_string());
            transport.num_connections = columns.get(3).and_then(|conns| conns.parse().ok());
            Some(transport)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_lines_parse_positionally() {
        let output = "5432 10.0.0.7 ledger 4\n6379 null cache\n\n80\n";
        let transports = parse_exec_lines(output);
        assert_eq!(transports.len(), 3);

        assert_eq!(transports[0].protocol_mux, "5432");
        assert_eq!(transports[0].address.as_deref(), Some("10.0.0.7"));
        assert_eq!(transports[0].debug_identifier.as_deref(), Some("ledger"));
        assert_eq!(transports[0].num_connections, Some(4));

        assert_eq!(transports[1].address, None);
        assert_eq!(transports[1].debug_identifier.as_deref(), Some("cache"));

        assert_eq!(transports[2].protocol_mux, "80");
        assert_eq!(transports[2].address, None);
    }

    #[test]
    fn hint_selector_includes_extra_labels() {
        let config = K8sConfig {
            label_selectors: vec!["tier=backend".to_string()],
            ..K8sConfig::default()
        };
        assert_eq!(
            hint_label_selector(&config, "ledger"),
            "app=ledger,tier=backend"
        );
    }
}
