//! Forwarding session: the byte pump behind a tunnel
//!
//! One accept loop per tunnel. Every accepted local connection gets its own
//! cluster-side channel and a task copying bytes both ways until either side
//! closes. A failed channel only drops its own local connection.

use crate::cluster::ClusterApi;
use crate::error::TunnelError;
use crate::types::ResolvedTarget;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

/// A validated route from a local listener to one pod port
pub(crate) struct ForwardingSession {
    cluster: Arc<dyn ClusterApi>,
    target: ResolvedTarget,
}

impl ForwardingSession {
    /// Check that a forwarding channel to the target can be opened
    ///
    /// The probe channel is closed right away; connections open their own.
    pub(crate) async fn establish(
        cluster: Arc<dyn ClusterApi>,
        target: ResolvedTarget,
    ) -> Result<Self, TunnelError> {
        let probe = cluster
            .open_forwarding_channel(&target.pod_name, target.pod_port)
            .await?;
        drop(probe);

        debug!(target = %target, "Forwarding session established");

        Ok(Self { cluster, target })
    }

    /// Run the accept loop until `shutdown_rx` fires or its sender is dropped
    ///
    /// Returning from the task drops the listener and aborts every in-flight
    /// connection.
    pub(crate) fn spawn(
        self,
        listener: TcpListener,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut connections = JoinSet::new();

            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((local_stream, peer)) => {
                                connections.spawn(bridge(
                                    self.cluster.clone(),
                                    self.target.clone(),
                                    local_stream,
                                    peer,
                                ));
                            }
                            Err(e) => {
                                warn!(error = %e, "Failed to accept connection");
                            }
                        }
                    }
                    Some(finished) = connections.join_next(), if !connections.is_empty() => {
                        if let Err(e) = finished {
                            warn!(error = %e, "Connection task failed");
                        }
                    }
                    _ = &mut shutdown_rx => {
                        debug!(target = %self.target, "Forwarding shutdown requested");
                        break;
                    }
                }
            }

            connections.shutdown().await;
            debug!(target = %self.target, "Forwarding loop stopped");
        })
    }
}

async fn bridge(
    cluster: Arc<dyn ClusterApi>,
    target: ResolvedTarget,
    mut local_stream: TcpStream,
    peer: SocketAddr,
) {
    let mut upstream = match cluster
        .open_forwarding_channel(&target.pod_name, target.pod_port)
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            warn!(peer = %peer, target = %target, error = %e, "Failed to establish forwarding channel");
            return;
        }
    };

    debug!(peer = %peer, target = %target, "Forwarding connection");

    match tokio::io::copy_bidirectional(&mut local_stream, &mut upstream).await {
        Ok((sent, received)) => {
            debug!(
                peer = %peer,
                target = %target,
                sent = sent,
                received = received,
                "Connection closed"
            );
        }
        Err(e) => {
            debug!(peer = %peer, target = %target, error = %e, "Connection ended with error");
        }
    }
}
