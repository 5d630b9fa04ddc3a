//! Readiness waiting
//!
//! Polls a pod, deployment or service until it can take traffic, with a fixed
//! number of attempts and a fixed delay between them. Lookup failures count as
//! "not ready yet"; only exhausting the attempts is reported, as a
//! [`WaitError`] carrying the last observed state.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//!
//! wait_until_pod_available(&cluster, "nginx-pod", 60, Duration::from_secs(1)).await?;
//!
//! match wait_until_deployment_available(&cluster, "web", 5, Duration::from_secs(1)).await {
//!     Err(TunnelError::Timeout(err)) => {
//!         println!("Resource: {}", err.resource);
//!         println!("Last state: {}", err.last_state);
//!     }
//!     _ => {}
//! }
//! ```

use crate::cluster::{is_pod_ready, ClusterApi};
use crate::error::TunnelError;
use crate::resolve::labels_to_selector;
use crate::types::{ReadinessPolicy, ResourceType};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// A resource never became ready within its retry budget
#[derive(Debug, Clone)]
pub struct WaitError {
    /// Resource reference (e.g., "deployment/myapp")
    pub resource: String,
    /// Number of readiness checks performed
    pub retries: u32,
    /// How long we waited before giving up
    pub elapsed: Duration,
    /// Description of the last observed state, or the last lookup error
    pub last_state: String,
}

impl WaitError {
    pub fn new(resource: impl Into<String>, retries: u32, elapsed: Duration) -> Self {
        Self {
            resource: resource.into(),
            retries,
            elapsed,
            last_state: "unknown".to_string(),
        }
    }

    /// Set the last observed state
    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.last_state = state.into();
        self
    }
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "Wait timeout for {}", self.resource)?;
        writeln!(f, "├─ Last state: {}", self.last_state)?;
        writeln!(f, "├─ Retries: {}", self.retries)?;
        write!(f, "└─ Elapsed: {:?}", self.elapsed)
    }
}

impl std::error::Error for WaitError {}

/// Human-readable description of a resource's current state
pub trait ResourceState {
    fn state_description(&self) -> String;
}

impl ResourceState for Deployment {
    fn state_description(&self) -> String {
        let spec_replicas = self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        let ready = self
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        let available = self
            .status
            .as_ref()
            .and_then(|s| s.available_replicas)
            .unwrap_or(0);
        let unavailable = self
            .status
            .as_ref()
            .and_then(|s| s.unavailable_replicas)
            .unwrap_or(0);

        if unavailable > 0 {
            format!("{ready}/{spec_replicas} ready, {unavailable} unavailable")
        } else {
            format!("{ready}/{spec_replicas} ready, {available}/{spec_replicas} available")
        }
    }
}

impl ResourceState for Pod {
    fn state_description(&self) -> String {
        let phase = self
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("Unknown");

        let ready_condition = self
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"))
            .map_or("Unknown", |c| c.status.as_str());

        let waiting_reasons: Vec<&str> = self
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref())
            .into_iter()
            .flatten()
            .filter_map(|c| {
                c.state
                    .as_ref()
                    .and_then(|s| s.waiting.as_ref())
                    .and_then(|w| w.reason.as_deref())
            })
            .collect();

        if waiting_reasons.is_empty() {
            format!("phase={phase}, ready={ready_condition}")
        } else {
            format!(
                "phase={phase}, ready={ready_condition}, waiting: {}",
                waiting_reasons.join(", ")
            )
        }
    }
}

/// Whether every desired replica of a deployment is available
pub(crate) fn is_deployment_available(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);

    let Some(status) = deployment.status.as_ref() else {
        return false;
    };

    let available = status.available_replicas.unwrap_or(0);
    let updated_ok = status.updated_replicas.map_or(true, |updated| updated >= desired);

    available >= desired && updated_ok
}

/// Check readiness once, returning (ready, state description)
async fn check_ready(
    cluster: &dyn ClusterApi,
    resource_type: ResourceType,
    name: &str,
) -> Result<(bool, String), TunnelError> {
    match resource_type {
        ResourceType::Pod => {
            let pod = cluster.get_pod(name).await?;
            Ok((is_pod_ready(&pod), pod.state_description()))
        }
        ResourceType::Deployment => {
            let deployment = cluster.get_deployment(name).await?;
            Ok((
                is_deployment_available(&deployment),
                deployment.state_description(),
            ))
        }
        ResourceType::Service => {
            let service = cluster.get_service(name).await?;
            let Some(selector) = service
                .spec
                .as_ref()
                .and_then(|s| s.selector.as_ref())
                .filter(|labels| !labels.is_empty())
                .map(labels_to_selector)
            else {
                return Ok((false, "service has no selector".to_string()));
            };

            let pods = cluster.list_pods_by_selector(&selector).await?;
            let ready = pods.iter().filter(|pod| is_pod_ready(pod)).count();
            Ok((
                ready > 0,
                format!("{ready}/{} backing pods ready", pods.len()),
            ))
        }
    }
}

/// Poll a resource until it is ready
///
/// Performs at most `max_retries` checks with `sleep_interval` between them.
///
/// # Errors
///
/// Returns `TunnelError::Timeout` once all checks are used up.
pub async fn wait_until_available(
    cluster: &dyn ClusterApi,
    resource_type: ResourceType,
    name: &str,
    max_retries: u32,
    sleep_interval: Duration,
) -> Result<(), TunnelError> {
    let resource = format!("{resource_type}/{name}");
    let start = Instant::now();
    let mut last_state = "not checked".to_string();

    debug!(
        namespace = %cluster.namespace(),
        resource = %resource,
        max_retries = max_retries,
        sleep_interval = ?sleep_interval,
        "Waiting for resource to be ready"
    );

    for attempt in 1..=max_retries {
        match check_ready(cluster, resource_type, name).await {
            Ok((true, state)) => {
                info!(
                    namespace = %cluster.namespace(),
                    resource = %resource,
                    attempt = attempt,
                    state = %state,
                    "Resource is ready"
                );
                return Ok(());
            }
            Ok((false, state)) => {
                debug!(
                    resource = %resource,
                    attempt = attempt,
                    state = %state,
                    "Resource exists but is not ready, waiting..."
                );
                last_state = state;
            }
            Err(e) => {
                debug!(
                    resource = %resource,
                    attempt = attempt,
                    error = %e,
                    "Readiness check failed, waiting..."
                );
                last_state = e.to_string();
            }
        }

        if attempt < max_retries {
            tokio::time::sleep(sleep_interval).await;
        }
    }

    Err(WaitError::new(resource, max_retries, start.elapsed())
        .with_state(last_state)
        .into())
}

/// [`wait_until_available`] with a [`ReadinessPolicy`]
pub async fn wait_with_policy(
    cluster: &dyn ClusterApi,
    resource_type: ResourceType,
    name: &str,
    policy: ReadinessPolicy,
) -> Result<(), TunnelError> {
    wait_until_available(
        cluster,
        resource_type,
        name,
        policy.max_retries,
        policy.sleep_interval,
    )
    .await
}

/// Wait until a pod is Running with condition Ready=True
pub async fn wait_until_pod_available(
    cluster: &dyn ClusterApi,
    name: &str,
    max_retries: u32,
    sleep_interval: Duration,
) -> Result<(), TunnelError> {
    wait_until_available(cluster, ResourceType::Pod, name, max_retries, sleep_interval).await
}

/// Wait until all desired replicas of a deployment are available
pub async fn wait_until_deployment_available(
    cluster: &dyn ClusterApi,
    name: &str,
    max_retries: u32,
    sleep_interval: Duration,
) -> Result<(), TunnelError> {
    wait_until_available(
        cluster,
        ResourceType::Deployment,
        name,
        max_retries,
        sleep_interval,
    )
    .await
}

/// Wait until a service selects at least one ready pod
pub async fn wait_until_service_available(
    cluster: &dyn ClusterApi,
    name: &str,
    max_retries: u32,
    sleep_interval: Duration,
) -> Result<(), TunnelError> {
    wait_until_available(
        cluster,
        ResourceType::Service,
        name,
        max_retries,
        sleep_interval,
    )
    .await
}
