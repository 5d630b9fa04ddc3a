//! Resource resolution
//!
//! Turns a (resource type, name, port) triple into the concrete pod and
//! container port a forwarding channel is opened to:
//! - `pod` - the named pod, port as given
//! - `deployment` - a ready pod matching the deployment's selector, port as given
//! - `service` - a ready pod matching the service's selector, with the exposed
//!   service port translated to the container target port
//!
//! When several pods are ready the one with the smallest name is picked, so
//! repeated resolutions against an unchanged cluster agree.

use crate::cluster::{is_pod_ready, ClusterApi};
use crate::error::TunnelError;
use crate::types::{ResolvedTarget, ResourceType};
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;
use tracing::debug;

/// Resolve a named resource to a forwardable pod and port
///
/// # Errors
///
/// - `ResourceNotFound` if the named resource does not exist
/// - `NoAvailablePod` if a deployment or service has no ready pod
/// - `PortNotFound` if a service exposes no port matching `requested_port`,
///   or its named target port is not declared on the selected pod
pub async fn resolve(
    cluster: &dyn ClusterApi,
    resource_type: ResourceType,
    name: &str,
    requested_port: u16,
) -> Result<ResolvedTarget, TunnelError> {
    let namespace = cluster.namespace().to_string();

    let (pod_name, pod_port) = match resource_type {
        ResourceType::Pod => {
            let pod = cluster.get_pod(name).await?;
            (pod_name(&pod, name), requested_port)
        }
        ResourceType::Deployment => {
            let deployment = cluster.get_deployment(name).await?;
            let selector = deployment
                .spec
                .as_ref()
                .map(|spec| selector_string(&spec.selector))
                .transpose()?
                .unwrap_or_default();

            let pod = find_ready_pod(cluster, resource_type, name, &selector).await?;
            (pod_name(&pod, name), requested_port)
        }
        ResourceType::Service => {
            let service = cluster.get_service(name).await?;
            let selector = service
                .spec
                .as_ref()
                .and_then(|spec| spec.selector.as_ref())
                .map(labels_to_selector)
                .unwrap_or_default();

            let pod = find_ready_pod(cluster, resource_type, name, &selector).await?;
            let port = service_target_port(name, &service, &pod, requested_port)?;
            (pod_name(&pod, name), port)
        }
    };

    let target = ResolvedTarget {
        pod_name,
        pod_namespace: namespace,
        pod_port,
    };

    debug!(
        resource = %format!("{resource_type}/{name}"),
        requested_port = requested_port,
        target = %target,
        "Resolved forwarding target"
    );

    Ok(target)
}

fn pod_name(pod: &Pod, fallback: &str) -> String {
    pod.metadata
        .name
        .clone()
        .unwrap_or_else(|| fallback.to_string())
}

async fn find_ready_pod(
    cluster: &dyn ClusterApi,
    kind: ResourceType,
    name: &str,
    selector: &str,
) -> Result<Pod, TunnelError> {
    let no_pod = || TunnelError::NoAvailablePod {
        kind,
        name: name.to_string(),
        selector: if selector.is_empty() {
            "<none>".to_string()
        } else {
            selector.to_string()
        },
    };

    // An empty selector would match every pod in the namespace
    if selector.is_empty() {
        return Err(no_pod());
    }

    let pods = cluster.list_pods_by_selector(selector).await?;
    debug!(
        resource = %format!("{kind}/{name}"),
        selector = %selector,
        candidates = pods.len(),
        "Listed candidate pods"
    );

    select_ready_pod(pods).ok_or_else(no_pod)
}

/// Pick the ready pod with the smallest name
pub(crate) fn select_ready_pod(pods: Vec<Pod>) -> Option<Pod> {
    pods.into_iter()
        .filter(|pod| is_pod_ready(pod) && pod.metadata.name.is_some())
        .min_by(|a, b| a.metadata.name.cmp(&b.metadata.name))
}

/// Render label pairs as an equality selector (`app=nginx,tier=web`)
pub(crate) fn labels_to_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Render a `LabelSelector` in the API's selector syntax
///
/// # Errors
///
/// Returns `TunnelError::InvalidResourceRef` for an unknown expression operator.
pub(crate) fn selector_string(selector: &LabelSelector) -> Result<String, TunnelError> {
    let mut terms = Vec::new();

    if let Some(labels) = &selector.match_labels {
        if !labels.is_empty() {
            terms.push(labels_to_selector(labels));
        }
    }

    for expr in selector.match_expressions.iter().flatten() {
        let values = expr.values.clone().unwrap_or_default().join(",");
        let term = match expr.operator.as_str() {
            "In" => format!("{} in ({values})", expr.key),
            "NotIn" => format!("{} notin ({values})", expr.key),
            "Exists" => expr.key.clone(),
            "DoesNotExist" => format!("!{}", expr.key),
            other => {
                return Err(TunnelError::InvalidResourceRef(format!(
                    "unsupported label selector operator '{other}' on key '{}'",
                    expr.key
                )))
            }
        };
        terms.push(term);
    }

    Ok(terms.join(","))
}

/// Translate an exposed service port to the container port on `pod`
fn service_target_port(
    service_name: &str,
    service: &Service,
    pod: &Pod,
    requested_port: u16,
) -> Result<u16, TunnelError> {
    let service_port = service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .and_then(|ports| ports.iter().find(|p| p.port == i32::from(requested_port)))
        .ok_or_else(|| TunnelError::PortNotFound {
            kind: ResourceType::Service,
            name: service_name.to_string(),
            port: requested_port.to_string(),
        })?;

    let pod_port_not_found = |port: String| TunnelError::PortNotFound {
        kind: ResourceType::Pod,
        name: pod_name(pod, ""),
        port,
    };

    match &service_port.target_port {
        // targetPort defaults to the service port
        None => Ok(requested_port),
        Some(IntOrString::Int(port)) => {
            u16::try_from(*port).map_err(|_| pod_port_not_found(port.to_string()))
        }
        Some(IntOrString::String(port_name)) => {
            if let Ok(port) = port_name.parse::<u16>() {
                return Ok(port);
            }
            container_port_by_name(pod, port_name)
                .ok_or_else(|| pod_port_not_found(port_name.clone()))
        }
    }
}

/// Look up a named container port across all containers of a pod
pub(crate) fn container_port_by_name(pod: &Pod, port_name: &str) -> Option<u16> {
    pod.spec
        .as_ref()?
        .containers
        .iter()
        .flat_map(|c| c.ports.iter().flatten())
        .find(|p| p.name.as_deref() == Some(port_name))
        .and_then(|p| u16::try_from(p.container_port).ok())
}
