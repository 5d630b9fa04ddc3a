//! In-memory cluster used by unit tests
//!
//! `FakeCluster` serves pods, deployments and services from maps and answers
//! forwarding channels with `tokio::io::duplex` pipes to small fake backends.

use crate::cluster::{ClusterApi, ForwardingChannel};
use crate::error::TunnelError;
use crate::types::ResourceType;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStatus};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, Pod, PodCondition, PodSpec, PodStatus, Service, ServicePort,
    ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub(crate) const NGINX_WELCOME: &str =
    "<!DOCTYPE html><html><head><title>Welcome to nginx!</title></head>\
     <body><h1>Welcome to nginx!</h1></body></html>";

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

/// A pod in the given phase, optionally reporting `Ready=True`
pub(crate) fn pod(name: &str, pod_labels: &[(&str, &str)], phase: &str, ready: bool) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("test".to_string()),
            labels: Some(labels(pod_labels)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "nginx".to_string(),
                ports: Some(vec![ContainerPort {
                    container_port: 80,
                    name: Some("http".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

pub(crate) fn ready_pod(name: &str, pod_labels: &[(&str, &str)]) -> Pod {
    pod(name, pod_labels, "Running", true)
}

pub(crate) fn deployment(
    name: &str,
    match_labels: &[(&str, &str)],
    replicas: i32,
    available: i32,
) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(labels(match_labels)),
                ..Default::default()
            },
            ..Default::default()
        }),
        status: Some(DeploymentStatus {
            replicas: Some(replicas),
            available_replicas: Some(available),
            ready_replicas: Some(available),
            updated_replicas: Some(replicas),
            ..Default::default()
        }),
    }
}

/// A service with `(port, targetPort)` pairs
pub(crate) fn service(
    name: &str,
    selector: &[(&str, &str)],
    ports: &[(i32, Option<IntOrString>)],
) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: if selector.is_empty() {
                None
            } else {
                Some(labels(selector))
            },
            ports: Some(
                ports
                    .iter()
                    .map(|(port, target_port)| ServicePort {
                        port: *port,
                        target_port: target_port.clone(),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        status: None,
    }
}

/// What answers on the far side of a fake forwarding channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Backend {
    /// Answers one HTTP request with the nginx welcome page
    Nginx,
    /// Writes back everything it reads
    Echo,
    /// Drops the channel without reading or writing
    HangUp,
}

#[derive(Default)]
pub(crate) struct FakeCluster {
    pods: Mutex<BTreeMap<String, Pod>>,
    deployments: Mutex<BTreeMap<String, Deployment>>,
    services: Mutex<BTreeMap<String, Service>>,
    backends: Mutex<HashMap<(String, u16), Backend>>,
    fail_channels: AtomicBool,
    lookups: AtomicUsize,
    channels_opened: AtomicUsize,
}

impl FakeCluster {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_pod(&self, pod: Pod) {
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.pods.lock().unwrap().insert(name, pod);
    }

    pub(crate) fn remove_pod(&self, name: &str) {
        self.pods.lock().unwrap().remove(name);
    }

    pub(crate) fn add_deployment(&self, deployment: Deployment) {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        self.deployments.lock().unwrap().insert(name, deployment);
    }

    pub(crate) fn add_service(&self, service: Service) {
        let name = service.metadata.name.clone().unwrap_or_default();
        self.services.lock().unwrap().insert(name, service);
    }

    pub(crate) fn serve(&self, pod: &str, port: u16, backend: Backend) {
        self.backends
            .lock()
            .unwrap()
            .insert((pod.to_string(), port), backend);
    }

    pub(crate) fn fail_channels(&self, fail: bool) {
        self.fail_channels.store(fail, Ordering::SeqCst);
    }

    /// Number of get/list calls made so far
    pub(crate) fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub(crate) fn channels_opened(&self) -> usize {
        self.channels_opened.load(Ordering::SeqCst)
    }

    fn not_found(&self, kind: ResourceType, name: &str) -> TunnelError {
        TunnelError::ResourceNotFound {
            kind,
            name: name.to_string(),
            namespace: self.namespace().to_string(),
        }
    }
}

/// Equality-only selector matching (`a=b,c=d`)
fn matches_selector(pod: &Pod, selector: &str) -> bool {
    let pod_labels = pod.metadata.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => pod_labels.get(key).map(String::as_str) == Some(value),
            None => pod_labels.contains_key(term),
        })
}

#[async_trait]
impl ClusterApi for FakeCluster {
    fn namespace(&self) -> &str {
        "test"
    }

    async fn get_pod(&self, name: &str) -> Result<Pod, TunnelError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.pods
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| self.not_found(ResourceType::Pod, name))
    }

    async fn get_deployment(&self, name: &str) -> Result<Deployment, TunnelError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.deployments
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| self.not_found(ResourceType::Deployment, name))
    }

    async fn get_service(&self, name: &str) -> Result<Service, TunnelError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.services
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| self.not_found(ResourceType::Service, name))
    }

    async fn list_pods_by_selector(&self, selector: &str) -> Result<Vec<Pod>, TunnelError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .pods
            .lock()
            .unwrap()
            .values()
            .filter(|pod| matches_selector(pod, selector))
            .cloned()
            .collect())
    }

    async fn open_forwarding_channel(
        &self,
        pod: &str,
        port: u16,
    ) -> Result<ForwardingChannel, TunnelError> {
        let session_error = |reason: &str| TunnelError::Session {
            pod: pod.to_string(),
            port,
            reason: reason.to_string(),
        };

        if self.fail_channels.load(Ordering::SeqCst) {
            return Err(session_error("upgrade request rejected"));
        }

        let backend = self
            .backends
            .lock()
            .unwrap()
            .get(&(pod.to_string(), port))
            .copied()
            .ok_or_else(|| session_error("nothing listening"))?;

        self.channels_opened.fetch_add(1, Ordering::SeqCst);

        let (near, far) = tokio::io::duplex(16 * 1024);
        tokio::spawn(run_backend(backend, far));
        Ok(Box::new(near))
    }
}

async fn run_backend(backend: Backend, mut stream: DuplexStream) {
    match backend {
        Backend::Nginx => {
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                NGINX_WELCOME.len(),
                NGINX_WELCOME
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
        Backend::Echo => {
            let (mut reader, mut writer) = tokio::io::split(stream);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
            let _ = writer.shutdown().await;
        }
        Backend::HangUp => drop(stream),
    }
}
