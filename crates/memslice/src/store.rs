use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::List;
use kube::api::ListParams;
use kube::api::PostParams;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Api;
use kube::Client;
use kube::Config;
use thiserror::Error;
use tokio::time::sleep;

use crate::config::SERVICEACCOUNT_TOKEN_PATH;

/// Bounded retries against the kubelet pods endpoint before falling back to
/// the API server.
const KUBELET_RETRIES: usize = 8;
const KUBELET_BACKOFF: Duration = Duration::from_millis(100);

/// Bounded retries against the API server lister.
const API_SERVER_RETRIES: usize = 3;
const API_SERVER_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum StoreError {
    /// The stored version changed concurrently; the caller may retry once
    /// against a freshly fetched object.
    #[error("the stored object was modified concurrently")]
    Conflict,
    #[error("failed to list pods pending on this node")]
    List,
    #[error("failed to fetch pod {namespace}/{name}")]
    Get { namespace: String, name: String },
    #[error("failed to update pod {namespace}/{name}")]
    Update { namespace: String, name: String },
    #[error("kubelet pods query failed")]
    KubeletQuery,
    #[error("no pending pod reported by the kubelet")]
    NoPendingPods,
    #[error("failed to connect to the Kubernetes API: {message}")]
    ConnectionFailed { message: String },
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict)
    }
}

/// The workload store consumed by the allocation matcher: list the pods
/// pending on this node, fetch one, and update one under optimistic
/// concurrency.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    async fn list_pending(&self) -> Result<Vec<Pod>, Report<StoreError>>;

    async fn get(&self, namespace: &str, name: &str) -> Result<Pod, Report<StoreError>>;

    /// Replace the stored pod. Fails with [`StoreError::Conflict`] when the
    /// stored resource version no longer matches the one carried by `pod`.
    async fn update(&self, pod: &Pod) -> Result<(), Report<StoreError>>;
}

/// Build a Kubernetes client from an explicit kubeconfig path or the default
/// (in-cluster or `~/.kube/config`) configuration.
///
/// # Errors
///
/// - [`StoreError::ConnectionFailed`] if the configuration cannot be loaded
///   or the client cannot be constructed
pub async fn init_kube_client(
    kubeconfig: Option<PathBuf>,
) -> Result<Client, Report<StoreError>> {
    let client = match kubeconfig {
        Some(kubeconfig_path) => {
            let kubeconfig = Kubeconfig::read_from(&kubeconfig_path).change_context(
                StoreError::ConnectionFailed {
                    message: format!(
                        "Failed to read kubeconfig file: {}",
                        kubeconfig_path.display()
                    ),
                },
            )?;

            let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .change_context(StoreError::ConnectionFailed {
                    message: format!(
                        "Failed to create config from kubeconfig: {}",
                        kubeconfig_path.display()
                    ),
                })?;

            Client::try_from(config).change_context(StoreError::ConnectionFailed {
                message: "Failed to create Kubernetes client from custom kubeconfig".to_string(),
            })?
        }
        None => Client::try_default()
            .await
            .change_context(StoreError::ConnectionFailed {
                message: "Failed to create Kubernetes client".to_string(),
            })?,
    };
    Ok(client)
}

/// Client for the kubelet's read-only `/pods` endpoint, the node-local
/// alternative to listing pods through the API server.
pub struct KubeletClient {
    http: reqwest::Client,
    url: String,
    token: String,
}

impl KubeletClient {
    pub fn new(
        address: &str,
        port: u16,
        token: String,
        timeout: Duration,
    ) -> Result<Self, Report<StoreError>> {
        // The kubelet serves a self-signed certificate; authentication is by
        // bearer token, as the upstream read-only clients do.
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .build()
            .change_context(StoreError::KubeletQuery)?;

        Ok(Self {
            http,
            url: format!("https://{address}:{port}/pods"),
            token,
        })
    }

    /// Pods on this node that are still pending. An empty result is an error
    /// so the caller retries and eventually falls back to the API server.
    pub async fn pending_pods(&self) -> Result<Vec<Pod>, Report<StoreError>> {
        let response = self
            .http
            .get(&self.url)
            .bearer_auth(&self.token)
            .send()
            .await
            .change_context(StoreError::KubeletQuery)?
            .error_for_status()
            .change_context(StoreError::KubeletQuery)?;

        let pod_list: List<Pod> = response.json().await.change_context(StoreError::KubeletQuery)?;

        let pending: Vec<Pod> = pod_list
            .items
            .into_iter()
            .filter(|pod| phase(pod) == Some("Pending"))
            .collect();

        if pending.is_empty() {
            return Err(Report::new(StoreError::NoPendingPods));
        }
        Ok(pending)
    }
}

/// The explicit token, or the mounted serviceaccount token when none was
/// given (in-cluster mode).
pub fn load_kubelet_token(explicit: Option<&str>) -> Result<String, Report<StoreError>> {
    match explicit {
        Some(token) => Ok(token.to_string()),
        None => std::fs::read_to_string(SERVICEACCOUNT_TOKEN_PATH)
            .map(|token| token.trim().to_string())
            .change_context(StoreError::KubeletQuery)
            .attach_printable("in cluster mode, reading the serviceaccount token failed"),
    }
}

/// Workload store backed by the API server, optionally preferring the
/// node-local kubelet query.
pub struct KubeClaimStore {
    client: Client,
    node_name: String,
    kubelet: Option<KubeletClient>,
}

impl KubeClaimStore {
    pub fn new(client: Client, node_name: String, kubelet: Option<KubeletClient>) -> Self {
        Self {
            client,
            node_name,
            kubelet,
        }
    }

    async fn list_from_api_server(&self) -> Result<Vec<Pod>, Report<StoreError>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!(
            "spec.nodeName={},status.phase=Pending",
            self.node_name
        ));

        let mut attempt = 0;
        loop {
            match pods.list(&params).await {
                Ok(list) => return Ok(list.items),
                Err(e) => {
                    attempt += 1;
                    if attempt >= API_SERVER_RETRIES {
                        return Err(Report::new(e).change_context(StoreError::List));
                    }
                    tracing::warn!(
                        "listing pending pods failed (attempt {attempt}/{API_SERVER_RETRIES}): {e}"
                    );
                    sleep(API_SERVER_BACKOFF).await;
                }
            }
        }
    }

    async fn list_from_kubelet(
        &self,
        kubelet: &KubeletClient,
    ) -> Result<Vec<Pod>, Report<StoreError>> {
        let mut attempt = 0;
        loop {
            match kubelet.pending_pods().await {
                Ok(pods) => return Ok(pods),
                Err(e) => {
                    attempt += 1;
                    if attempt >= KUBELET_RETRIES {
                        return Err(e);
                    }
                    tracing::warn!(
                        "kubelet pods query failed (attempt {attempt}/{KUBELET_RETRIES}), retrying"
                    );
                    sleep(KUBELET_BACKOFF).await;
                }
            }
        }
    }
}

#[async_trait]
impl ClaimStore for KubeClaimStore {
    async fn list_pending(&self) -> Result<Vec<Pod>, Report<StoreError>> {
        let pods = if let Some(kubelet) = &self.kubelet {
            match self.list_from_kubelet(kubelet).await {
                Ok(pods) => pods,
                Err(e) => {
                    tracing::warn!(
                        "kubelet pods query exhausted, listing from the API server instead: {e:?}"
                    );
                    self.list_from_api_server().await?
                }
            }
        } else {
            self.list_from_api_server().await?
        };

        Ok(keep_pending_on_node(pods, &self.node_name))
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Pod, Report<StoreError>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await.change_context(StoreError::Get {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    async fn update(&self, pod: &Pod) -> Result<(), Report<StoreError>> {
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let name = pod.metadata.name.clone().unwrap_or_default();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);

        match api.replace(&name, &PostParams::default(), pod).await {
            Ok(_) => Ok(()),
            Err(e) => Err(classify_kube_error(e, StoreError::Update { namespace, name })),
        }
    }
}

/// Map an API-server 409 onto the typed conflict error so retry logic never
/// has to match error strings.
fn classify_kube_error(err: kube::Error, fallback: StoreError) -> Report<StoreError> {
    match &err {
        kube::Error::Api(response) if response.code == 409 => {
            Report::new(err).change_context(StoreError::Conflict)
        }
        _ => Report::new(err).change_context(fallback),
    }
}

/// Keep pods that are pending and actually assigned to this node, deduped by
/// UID. A pod reported for another node is dropped with a warning.
fn keep_pending_on_node(pods: Vec<Pod>, node_name: &str) -> Vec<Pod> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut result = Vec::new();

    for pod in pods {
        if phase(&pod) != Some("Pending") {
            continue;
        }
        let pod_node = pod.spec.as_ref().and_then(|s| s.node_name.as_deref());
        if pod_node != Some(node_name) {
            tracing::warn!(
                "pod {}/{} is not assigned to node {node_name} as expected, it's placed on {:?}",
                pod.metadata.namespace.as_deref().unwrap_or_default(),
                pod.metadata.name.as_deref().unwrap_or_default(),
                pod_node
            );
            continue;
        }
        let uid = pod.metadata.uid.clone().unwrap_or_default();
        if !seen.insert(uid) {
            continue;
        }
        result.push(pod);
    }

    result
}

fn phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.phase.as_deref())
}
