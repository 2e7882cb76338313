use k8s_openapi::api::core::v1::Pod;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use std::cell::OnceCell;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::runtime::Runtime;
use tracing::debug;

use crate::error::{CniError, Result};

/// Annotation (or label) naming the logical network of a pod
pub const NETWORK_ANNOTATION: &str = "tinycni.io/network";

/// Pod metadata lookup against the orchestrator
pub trait PodMetadata {
    /// Returns `(labels, annotations)` of the pod.
    fn pod_labels_and_annotations(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(HashMap<String, String>, HashMap<String, String>)>;
}

/// Resolve the network a pod asked for: annotation first, then label.
pub fn resolve_network(pods: &dyn PodMetadata, namespace: &str, name: &str) -> Result<String> {
    let (labels, annotations) = pods.pod_labels_and_annotations(namespace, name)?;
    let network = [&annotations, &labels]
        .into_iter()
        .filter_map(|layer| layer.get(NETWORK_ANNOTATION))
        .find(|network| !network.is_empty())
        .cloned()
        .ok_or_else(|| {
            CniError::NetworkResolution(format!(
                "pod {namespace}/{name} does not name a network via {NETWORK_ANNOTATION}"
            ))
        });
    network
}

/// Pod metadata from the Kubernetes API
pub struct KubePodMetadata {
    kubeconfig: Option<PathBuf>,
    runtime: Runtime,
    client: OnceCell<Client>,
}

impl KubePodMetadata {
    /// The client is only built on first lookup, so commands that never look
    /// up a pod do not need API access.
    pub fn new(kubeconfig: Option<PathBuf>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| CniError::Internal(format!("failed to create Tokio runtime: {err}")))?;
        Ok(Self {
            kubeconfig,
            runtime,
            client: OnceCell::new(),
        })
    }

    fn client(&self) -> Result<&Client> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = self.runtime.block_on(async {
            match &self.kubeconfig {
                Some(path) => {
                    let kubeconfig = Kubeconfig::read_from(path).map_err(|err| {
                        CniError::Internal(format!(
                            "failed to read kubeconfig {}: {err}",
                            path.display()
                        ))
                    })?;
                    let config =
                        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                            .await
                            .map_err(|err| {
                                CniError::Internal(format!("invalid kubeconfig: {err}"))
                            })?;
                    Client::try_from(config).map_err(|err| {
                        CniError::Internal(format!("failed to create Kubernetes client: {err}"))
                    })
                }
                None => Client::try_default().await.map_err(|err| {
                    CniError::Internal(format!("failed to create Kubernetes client: {err}"))
                }),
            }
        })?;
        Ok(self.client.get_or_init(|| client))
    }
}

impl PodMetadata for KubePodMetadata {
    fn pod_labels_and_annotations(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(HashMap<String, String>, HashMap<String, String>)> {
        let client = self.client()?.clone();
        let pod_api: Api<Pod> = Api::namespaced(client, namespace);
        let pod = self
            .runtime
            .block_on(pod_api.get(name))
            .map_err(|err| {
                CniError::NetworkResolution(format!("failed to look up pod {namespace}/{name}: {err}"))
            })?;
        debug!(namespace, name, "fetched pod metadata");
        let labels = pod.metadata.labels.unwrap_or_default().into_iter().collect();
        let annotations = pod
            .metadata
            .annotations
            .unwrap_or_default()
            .into_iter()
            .collect();
        Ok((labels, annotations))
    }
}
