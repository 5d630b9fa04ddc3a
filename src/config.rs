//! Cluster connection options
//!
//! Mirrors the kubectl flags that decide which cluster and namespace a tunnel
//! talks to. Build them programmatically - no config files of our own.
//!
//! # Example
//!
//! ```
//! use kubetunnel::config::KubectlOptions;
//!
//! let options = KubectlOptions::new()
//!     .context("kind-test")
//!     .namespace("my-test-ns");
//! ```

use std::path::PathBuf;

/// Which kubeconfig, context and namespace to use
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KubectlOptions {
    /// Kubeconfig path (`--kubeconfig`); `KUBECONFIG` or `~/.kube/config` when unset
    pub config_path: Option<PathBuf>,

    /// Kubeconfig context (`--context`); current context when unset
    pub context_name: Option<String>,

    /// Namespace (`--namespace`); the context's default namespace when unset
    pub namespace: Option<String>,
}

impl KubectlOptions {
    /// Options that use the ambient kubeconfig, context and namespace
    pub fn new() -> Self {
        Self::default()
    }

    /// Set kubeconfig path
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Set kubeconfig context
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context_name = Some(context.into());
        self
    }

    /// Set namespace
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Whether nothing was set explicitly, so the client config can be inferred
    pub(crate) fn is_ambient(&self) -> bool {
        self.config_path.is_none() && self.context_name.is_none()
    }
}
