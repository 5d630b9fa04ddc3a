//! kubetunnel - port-forward tunnels for Kubernetes integration tests
//!
//! Opens a local listener that forwards to a pod, to a ready pod of a
//! deployment, or to a ready pod behind a service (translating the service
//! port to the container port). Test code talks to `127.0.0.1:<port>` as if
//! the workload were local.
//!
//! # Example
//!
//! ```no_run
//! use kubetunnel::{
//!     wait_until_pod_available, KubeCluster, KubectlOptions, ResourceType, Tunnel, TunnelSpec,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cluster = Arc::new(KubeCluster::connect(&KubectlOptions::new().namespace("my-test")).await?);
//!
//!     wait_until_pod_available(cluster.as_ref(), "nginx-pod", 60, Duration::from_secs(1)).await?;
//!
//!     // Any free local port, container port 80
//!     let tunnel = Tunnel::new(cluster, TunnelSpec::new(ResourceType::Pod, "nginx-pod", 0, 80));
//!     tunnel.forward_port().await?;
//!
//!     println!("nginx reachable at http://{}", tunnel.endpoint()?);
//!
//!     tunnel.close().await;
//!     Ok(())
//! }
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod resolve;
mod session;
pub mod telemetry;
pub mod tunnel;
pub mod types;
pub mod wait;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use cluster::{is_pod_ready, ClusterApi, ForwardStream, ForwardingChannel, KubeCluster};
pub use config::KubectlOptions;
pub use error::TunnelError;
pub use resolve::resolve;
pub use tunnel::{HttpResponse, Tunnel};
pub use types::{Endpoint, ReadinessPolicy, ResolvedTarget, ResourceType, TunnelSpec};
pub use wait::{
    wait_until_available, wait_until_deployment_available, wait_until_pod_available,
    wait_until_service_available, wait_with_policy, ResourceState, WaitError,
};
