//! Cluster API access for tunnels
//!
//! The resolver, the readiness waiter and the forwarding session only talk to
//! the cluster through [`ClusterApi`]. [`KubeCluster`] implements it on top of
//! a `kube::Client`, scoped to one namespace.
//!
//! # Example
//!
//! ```no_run
//! use kubetunnel::{KubeCluster, KubectlOptions};
//!
//! # async fn run() -> Result<(), kubetunnel::TunnelError> {
//! let cluster = KubeCluster::connect(&KubectlOptions::new().namespace("default")).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::KubectlOptions;
use crate::error::TunnelError;
use crate::types::ResourceType;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// A duplex byte stream to one container port of one pod
pub trait ForwardStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ForwardStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Cluster-side forwarding channel handed to the byte pump
pub type ForwardingChannel = Box<dyn ForwardStream>;

/// Read access to pods, deployments and services plus port-forward channels
///
/// All lookups are scoped to [`namespace`](ClusterApi::namespace).
/// Implementations map "does not exist" to `TunnelError::ResourceNotFound`.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Namespace all lookups run in
    fn namespace(&self) -> &str;

    async fn get_pod(&self, name: &str) -> Result<Pod, TunnelError>;

    async fn get_deployment(&self, name: &str) -> Result<Deployment, TunnelError>;

    async fn get_service(&self, name: &str) -> Result<Service, TunnelError>;

    /// List pods matching a label selector string (`app=nginx,tier in (web)`)
    async fn list_pods_by_selector(&self, selector: &str) -> Result<Vec<Pod>, TunnelError>;

    /// Open a fresh forwarding channel to `port` on pod `pod`
    async fn open_forwarding_channel(
        &self,
        pod: &str,
        port: u16,
    ) -> Result<ForwardingChannel, TunnelError>;
}

/// Whether a pod can take traffic
///
/// The pod must be in phase `Running`, report condition `Ready=True`, and not
/// be terminating.
pub fn is_pod_ready(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }

    let Some(status) = pod.status.as_ref() else {
        return false;
    };

    if status.phase.as_deref() != Some("Running") {
        return false;
    }

    status.conditions.as_ref().is_some_and(|conditions| {
        conditions
            .iter()
            .any(|c| c.type_ == "Ready" && c.status == "True")
    })
}

/// `ClusterApi` backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    namespace: String,
}

impl KubeCluster {
    /// Wrap an existing client
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Build a client from kubectl-style options
    ///
    /// Infers the configuration (kubeconfig or in-cluster) when neither a
    /// kubeconfig path nor a context is set. The namespace falls back to the
    /// context's default namespace.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError::Client` if the kubeconfig cannot be loaded or the
    /// client cannot be built.
    pub async fn connect(options: &KubectlOptions) -> Result<Self, TunnelError> {
        let config = load_config(options).await?;
        let namespace = options
            .namespace
            .clone()
            .unwrap_or_else(|| config.default_namespace.clone());

        let client =
            Client::try_from(config).map_err(|e| TunnelError::Client(e.to_string()))?;

        debug!(namespace = %namespace, "Connected to Kubernetes API");

        Ok(Self::new(client, namespace))
    }

    /// Underlying kube client
    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn get_named<K>(&self, kind: ResourceType, name: &str) -> Result<K, TunnelError>
    where
        K: kube::Resource<Scope = kube::core::NamespaceResourceScope>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        <K as kube::Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), &self.namespace);
        api.get(name)
            .await
            .map_err(|e| self.map_get_error(e, kind, name))
    }

    fn map_get_error(&self, err: kube::Error, kind: ResourceType, name: &str) -> TunnelError {
        match err {
            kube::Error::Api(response) if response.code == 404 => TunnelError::ResourceNotFound {
                kind,
                name: name.to_string(),
                namespace: self.namespace.clone(),
            },
            other => TunnelError::Api(format!("{kind} '{name}': {other}")),
        }
    }
}

async fn load_config(options: &KubectlOptions) -> Result<Config, TunnelError> {
    if options.is_ambient() {
        return Config::infer()
            .await
            .map_err(|e| TunnelError::Client(e.to_string()));
    }

    let kubeconfig_options = KubeConfigOptions {
        context: options.context_name.clone(),
        ..Default::default()
    };

    match &options.config_path {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                TunnelError::Client(format!("reading {}: {e}", path.display()))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &kubeconfig_options)
                .await
                .map_err(|e| TunnelError::Client(e.to_string()))
        }
        None => Config::from_kubeconfig(&kubeconfig_options)
            .await
            .map_err(|e| TunnelError::Client(e.to_string())),
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get_pod(&self, name: &str) -> Result<Pod, TunnelError> {
        self.get_named(ResourceType::Pod, name).await
    }

    async fn get_deployment(&self, name: &str) -> Result<Deployment, TunnelError> {
        self.get_named(ResourceType::Deployment, name).await
    }

    async fn get_service(&self, name: &str) -> Result<Service, TunnelError> {
        self.get_named(ResourceType::Service, name).await
    }

    async fn list_pods_by_selector(&self, selector: &str) -> Result<Vec<Pod>, TunnelError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = pods
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| TunnelError::Api(format!("listing pods '{selector}': {e}")))?;
        Ok(list.items)
    }

    async fn open_forwarding_channel(
        &self,
        pod: &str,
        port: u16,
    ) -> Result<ForwardingChannel, TunnelError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let session_error = |reason: String| TunnelError::Session {
            pod: pod.to_string(),
            port,
            reason,
        };

        let mut forwarder = pods
            .portforward(pod, &[port])
            .await
            .map_err(|e| session_error(e.to_string()))?;

        let stream = forwarder
            .take_stream(port)
            .ok_or_else(|| session_error("no stream for requested port".to_string()))?;

        // The forwarder task ends once the stream is closed on both sides
        let pod_name = pod.to_string();
        tokio::spawn(async move {
            if let Err(e) = forwarder.join().await {
                warn!(pod = %pod_name, port = port, error = %e, "Forwarding channel ended with error");
            }
        });

        Ok(Box::new(stream))
    }
}
