//! Core tunnel types
//!
//! `ResourceType` names what a tunnel points at, `TunnelSpec` is the caller's
//! request, `ResolvedTarget` is the concrete pod and port it resolves to, and
//! `Endpoint` is where test code connects locally.

use crate::error::TunnelError;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

/// Kind of cluster object a tunnel can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Pod,
    Deployment,
    Service,
}

impl ResourceType {
    /// Lowercase kubectl name of the kind
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pod => "pod",
            Self::Deployment => "deployment",
            Self::Service => "service",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = TunnelError;

    /// Parse kubectl-style kind names and aliases
    ///
    /// - `pod`, `po`, `pods` → Pod
    /// - `deployment`, `deploy`, `deployments` → Deployment
    /// - `service`, `svc`, `services` → Service
    fn from_str(kind: &str) -> Result<Self, Self::Err> {
        match kind.to_lowercase().as_str() {
            "pod" | "po" | "pods" => Ok(Self::Pod),
            "deployment" | "deploy" | "deployments" => Ok(Self::Deployment),
            "service" | "svc" | "services" => Ok(Self::Service),
            _ => Err(TunnelError::InvalidResourceRef(format!(
                "unsupported resource kind '{kind}' for port forwarding (use pod, svc, or deployment)"
            ))),
        }
    }
}

/// How long to wait for a resource to become ready
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    /// Maximum number of readiness checks
    pub max_retries: u32,
    /// Delay between two checks
    pub sleep_interval: Duration,
}

impl ReadinessPolicy {
    #[must_use]
    pub fn new(max_retries: u32, sleep_interval: Duration) -> Self {
        Self {
            max_retries,
            sleep_interval,
        }
    }
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self::new(60, Duration::from_secs(1))
    }
}

/// What a tunnel forwards to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    /// Kind of the target resource
    pub resource_type: ResourceType,
    /// Name of the target resource
    pub resource_name: String,
    /// Local port to listen on, 0 lets the OS pick one
    pub local_port: u16,
    /// Port on the resource (container port for pods and deployments,
    /// exposed service port for services)
    pub remote_port: u16,
    /// Wait for the resource to become ready before resolving it
    pub readiness: Option<ReadinessPolicy>,
}

impl TunnelSpec {
    pub fn new(
        resource_type: ResourceType,
        resource_name: impl Into<String>,
        local_port: u16,
        remote_port: u16,
    ) -> Self {
        Self {
            resource_type,
            resource_name: resource_name.into(),
            local_port,
            remote_port,
            readiness: None,
        }
    }

    /// Build a spec from a kubectl-style reference
    ///
    /// Supported formats:
    /// - `pod/name`, `po/name` → pod
    /// - `service/name`, `svc/name` → service
    /// - `deployment/name`, `deploy/name` → deployment
    /// - `name` → treated as a pod name
    ///
    /// # Errors
    ///
    /// Returns `TunnelError::InvalidResourceRef` if the reference is empty,
    /// names an unsupported kind, or has an empty name.
    pub fn from_target(target: &str, local_port: u16, remote_port: u16) -> Result<Self, TunnelError> {
        if target.is_empty() {
            return Err(TunnelError::InvalidResourceRef(
                "target cannot be empty".to_string(),
            ));
        }

        let (resource_type, name) = match target.split_once('/') {
            Some((kind, name)) => (kind.parse::<ResourceType>()?, name),
            None => (ResourceType::Pod, target),
        };

        if name.is_empty() {
            return Err(TunnelError::InvalidResourceRef(format!(
                "resource name cannot be empty in '{target}'"
            )));
        }

        Ok(Self::new(resource_type, name, local_port, remote_port))
    }

    /// Wait for the resource to become ready before each `forward_port()`
    #[must_use]
    pub fn wait_until_ready(mut self, policy: ReadinessPolicy) -> Self {
        self.readiness = Some(policy);
        self
    }

    /// Reference in `kind/name` form, used in logs and errors
    #[must_use]
    pub fn reference(&self) -> String {
        format!("{}/{}", self.resource_type, self.resource_name)
    }
}

/// A concrete pod and container port to forward to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub pod_name: String,
    pub pod_namespace: String,
    pub pod_port: u16,
}

impl fmt::Display for ResolvedTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.pod_namespace, self.pod_name, self.pod_port)
    }
}

/// Local address a forwarding tunnel listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    host: Ipv4Addr,
    port: u16,
}

impl Endpoint {
    pub(crate) fn new(port: u16) -> Self {
        Self {
            host: Ipv4Addr::LOCALHOST,
            port,
        }
    }

    #[must_use]
    pub fn host(&self) -> Ipv4Addr {
        self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::from((self.host, self.port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
