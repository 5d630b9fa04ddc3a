//! Error type for tunnel operations

use crate::types::ResourceType;
use crate::wait::WaitError;

/// Errors from resolving, waiting on, and forwarding to cluster resources
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("{kind} '{name}' not found in namespace '{namespace}'")]
    ResourceNotFound {
        kind: ResourceType,
        name: String,
        namespace: String,
    },

    #[error("no ready pod available for {kind} '{name}' (selector: {selector})")]
    NoAvailablePod {
        kind: ResourceType,
        name: String,
        selector: String,
    },

    #[error("port {port} not found on {kind} '{name}'")]
    PortNotFound {
        kind: ResourceType,
        name: String,
        port: String,
    },

    #[error("{0}")]
    Timeout(#[from] WaitError),

    #[error("Failed to bind local port {port}: {reason}")]
    Bind { port: u16, reason: String },

    #[error("Failed to open forwarding session to pod '{pod}' port {port}: {reason}")]
    Session {
        pod: String,
        port: u16,
        reason: String,
    },

    #[error("tunnel to {0} is not forwarding yet, call forward_port() first")]
    TunnelNotReady(String),

    #[error("tunnel to {0} is already forwarding")]
    AlreadyForwarding(String),

    #[error("tunnel to {0} is closed and cannot be reopened")]
    TunnelClosed(String),

    #[error("Invalid resource reference: {0}")]
    InvalidResourceRef(String),

    #[error("Failed to create Kubernetes client: {0}")]
    Client(String),

    #[error("Kubernetes API request failed: {0}")]
    Api(String),

    #[error("HTTP request failed: {0}")]
    Request(String),
}

impl TunnelError {
    /// Whether the error means the named resource does not exist
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ResourceNotFound { .. })
    }
}
