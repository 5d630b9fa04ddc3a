//! Port-forward tunnels to pods, deployments and services
//!
//! A [`Tunnel`] starts out `Created`, moves to forwarding on
//! [`forward_port`](Tunnel::forward_port), and ends `Closed` on
//! [`close`](Tunnel::close). It is single-use: a closed tunnel cannot be
//! reopened. Transitions are serialized, so a `close()` racing a
//! `forward_port()` always leaves the tunnel closed.
//!
//! # Example
//!
//! ```ignore
//! let tunnel = Tunnel::new(cluster.clone(), TunnelSpec::new(ResourceType::Pod, "nginx-pod", 0, 80));
//! tunnel.forward_port().await?;
//!
//! let response = tunnel.get("/").await?;
//! assert_eq!(response.status, 200);
//!
//! tunnel.close().await;
//! ```

use crate::cluster::ClusterApi;
use crate::error::TunnelError;
use crate::resolve::resolve;
use crate::session::ForwardingSession;
use crate::types::{Endpoint, ResolvedTarget, TunnelSpec};
use crate::wait::wait_with_policy;
use std::net::Ipv4Addr;
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

enum TunnelState {
    Created,
    Forwarding(ActiveForward),
    Closed,
}

struct ActiveForward {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Status line and body of a response read through a tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// A local listener forwarding to one port of a cluster resource
///
/// Dropping a forwarding tunnel stops its accept loop as well, but only
/// [`close`](Self::close) waits for the local port to be released.
pub struct Tunnel {
    cluster: Arc<dyn ClusterApi>,
    spec: TunnelSpec,
    state: Mutex<TunnelState>,
    endpoint: OnceLock<Endpoint>,
    target: OnceLock<ResolvedTarget>,
}

impl Tunnel {
    /// Create a tunnel in the `Created` state; nothing is resolved or bound yet
    pub fn new(cluster: Arc<dyn ClusterApi>, spec: TunnelSpec) -> Self {
        Self {
            cluster,
            spec,
            state: Mutex::new(TunnelState::Created),
            endpoint: OnceLock::new(),
            target: OnceLock::new(),
        }
    }

    pub fn spec(&self) -> &TunnelSpec {
        &self.spec
    }

    /// Pod and port the tunnel forwards to, once forwarding has started
    pub fn target(&self) -> Option<&ResolvedTarget> {
        self.target.get()
    }

    /// Resolve the target, bind the local port and start forwarding
    ///
    /// On error nothing stays bound and the tunnel remains `Created`, so the
    /// call can be retried.
    ///
    /// # Errors
    ///
    /// - `Timeout` if a readiness policy is set and the resource never became ready
    /// - any resolution error (`ResourceNotFound`, `NoAvailablePod`, `PortNotFound`)
    /// - `Bind` if the local port cannot be bound
    /// - `Session` if no forwarding channel to the pod can be opened
    /// - `AlreadyForwarding` / `TunnelClosed` when called in the wrong state
    pub async fn forward_port(&self) -> Result<Endpoint, TunnelError> {
        let mut state = self.state.lock().await;

        match *state {
            TunnelState::Created => {}
            TunnelState::Forwarding(_) => {
                return Err(TunnelError::AlreadyForwarding(self.spec.reference()))
            }
            TunnelState::Closed => return Err(TunnelError::TunnelClosed(self.spec.reference())),
        }

        let (endpoint, target, active) = self.open().await?;

        // Published only after every step succeeded
        let _ = self.endpoint.set(endpoint);
        let _ = self.target.set(target.clone());
        *state = TunnelState::Forwarding(active);

        info!(
            resource = %self.spec.reference(),
            endpoint = %endpoint,
            target = %target,
            "Tunnel forwarding"
        );

        Ok(endpoint)
    }

    async fn open(&self) -> Result<(Endpoint, ResolvedTarget, ActiveForward), TunnelError> {
        let spec = &self.spec;

        if let Some(policy) = spec.readiness {
            wait_with_policy(
                self.cluster.as_ref(),
                spec.resource_type,
                &spec.resource_name,
                policy,
            )
            .await?;
        }

        let target = resolve(
            self.cluster.as_ref(),
            spec.resource_type,
            &spec.resource_name,
            spec.remote_port,
        )
        .await?;

        let bind_error = |e: std::io::Error| TunnelError::Bind {
            port: spec.local_port,
            reason: e.to_string(),
        };

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, spec.local_port))
            .await
            .map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        debug!(
            local_addr = %local_addr,
            target = %target,
            "Tunnel bound to local address"
        );

        // On failure the listener is dropped here, releasing the port
        let session = ForwardingSession::establish(self.cluster.clone(), target.clone()).await?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = session.spawn(listener, shutdown_rx);

        Ok((
            Endpoint::new(local_addr.port()),
            target,
            ActiveForward { shutdown_tx, task },
        ))
    }

    /// Local `host:port` to connect to
    ///
    /// Keeps returning the last bound endpoint after the tunnel is closed.
    ///
    /// # Errors
    ///
    /// Returns `TunnelNotReady` before a successful `forward_port()`.
    pub fn endpoint(&self) -> Result<Endpoint, TunnelError> {
        self.endpoint
            .get()
            .copied()
            .ok_or_else(|| TunnelError::TunnelNotReady(self.spec.reference()))
    }

    /// Stop forwarding and release the local port
    ///
    /// Idempotent: closing a closed tunnel does nothing.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;

        match std::mem::replace(&mut *state, TunnelState::Closed) {
            TunnelState::Forwarding(active) => {
                let _ = active.shutdown_tx.send(());
                if let Err(e) = active.task.await {
                    warn!(resource = %self.spec.reference(), error = %e, "Forwarding task failed");
                }
                info!(resource = %self.spec.reference(), "Tunnel closed");
            }
            TunnelState::Created => {
                debug!(resource = %self.spec.reference(), "Tunnel closed before forwarding");
            }
            TunnelState::Closed => {}
        }
    }

    /// URL for a path through the tunnel
    ///
    /// Paths are normalized to include a leading `/`.
    ///
    /// # Errors
    ///
    /// Returns `TunnelNotReady` before a successful `forward_port()`.
    pub fn url(&self, path: &str) -> Result<String, TunnelError> {
        let endpoint = self.endpoint()?;
        Ok(format!("http://{}{}", endpoint, normalize_path(path)))
    }

    /// Issue one plain HTTP/1.1 GET through the tunnel
    ///
    /// No retries: a refused connection or a non-2xx status is returned as is.
    pub async fn get(&self, path: &str) -> Result<HttpResponse, TunnelError> {
        let endpoint = self.endpoint()?;
        let path = normalize_path(path);

        let mut stream = tokio::net::TcpStream::connect(endpoint.socket_addr())
            .await
            .map_err(|e| TunnelError::Request(e.to_string()))?;

        let request = format!("GET {path} HTTP/1.1\r\nHost: {endpoint}\r\nConnection: close\r\n\r\n");

        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| TunnelError::Request(e.to_string()))?;

        let mut raw = Vec::new();
        stream
            .read_to_end(&mut raw)
            .await
            .map_err(|e| TunnelError::Request(e.to_string()))?;

        let response = parse_response(&String::from_utf8_lossy(&raw))?;

        debug!(
            endpoint = %endpoint,
            path = %path,
            status = response.status,
            "HTTP request completed"
        );

        Ok(response)
    }
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

fn parse_response(raw: &str) -> Result<HttpResponse, TunnelError> {
    let status = raw
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| TunnelError::Request(format!("malformed status line in {raw:?}")))?;

    let body = match raw.find("\r\n\r\n") {
        Some(body_start) => raw[body_start + 4..].to_string(),
        None => String::new(),
    };

    Ok(HttpResponse { status, body })
}
