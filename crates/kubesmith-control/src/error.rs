//! Error types for kubesmith-control.

use kubesmith_packages::PackageError;
use kubesmith_remote::RemoteError;

/// Result type alias using [`OrchestratorError`].
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Errors that can occur while bringing up a cluster.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Configuration is missing, malformed or inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// Certificate generation or signing failed.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// The etcd cluster did not report every member started in time.
    #[error("etcd quorum not reached after {attempts} attempts ({started}/{expected} members started)")]
    QuorumTimeout {
        /// Polls made.
        attempts: u32,
        /// Members reported started on the last poll.
        started: usize,
        /// Members expected.
        expected: usize,
    },

    /// A node could not join the cluster.
    #[error("{node} failed to join: {reason}")]
    JoinFailed {
        /// Node hostname.
        node: String,
        /// What went wrong.
        reason: String,
    },

    /// Pods did not become ready in time.
    #[error("pods not ready after {attempts} attempts: {pods}")]
    PodsNotReady {
        /// Pods still waiting on the last poll.
        pods: String,
        /// Polls made.
        attempts: u32,
    },

    /// The run was interrupted by a signal.
    #[error("interrupted")]
    Interrupted,

    /// Remote execution failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Package reconciliation failed.
    #[error(transparent)]
    Package(#[from] PackageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML encoding or decoding failed.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON encoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OrchestratorError {
    /// Create a configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a certificate error.
    #[must_use]
    pub fn certificate(msg: impl std::fmt::Display) -> Self {
        Self::Certificate(msg.to_string())
    }

    /// Create a join failure.
    #[must_use]
    pub fn join_failed(node: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::JoinFailed {
            node: node.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns true if the underlying failure is an unsupported distribution.
    #[must_use]
    pub const fn is_unsupported_os(&self) -> bool {
        matches!(self, Self::Package(PackageError::UnsupportedOs(_)))
    }
}
