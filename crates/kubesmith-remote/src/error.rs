//! Error types for kubesmith-remote.

use std::net::IpAddr;

/// Result type alias using [`RemoteError`].
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors raised while reaching, authenticating against, or running commands on nodes.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// The reachability probe failed before authentication was attempted.
    #[error("{address}:{port} is not reachable")]
    Unreachable {
        /// Node address.
        address: IpAddr,
        /// Probed port.
        port: u16,
    },

    /// Every credential source was exhausted without a successful login.
    #[error("SSH authentication failed for {user}@{address}")]
    AuthenticationFailed {
        /// Node address.
        address: IpAddr,
        /// User of the last rejected credential.
        user: String,
    },

    /// A command exited with a status outside the allow-list.
    #[error("{stderr}")]
    CommandFailed {
        /// Where the command ran.
        target: String,
        /// The command line.
        command: String,
        /// Exit status reported by the shell.
        status: u32,
        /// Trimmed standard error.
        stderr: String,
    },

    /// Transport-level SSH failure.
    #[error("SSH error on {address}: {message}")]
    Ssh {
        /// Node address.
        address: IpAddr,
        /// Underlying error message.
        message: String,
    },

    /// Private key could not be loaded.
    #[error("failed to load private key {path}: {message}")]
    PrivateKey {
        /// Key path.
        path: String,
        /// Underlying error message.
        message: String,
    },

    /// The encrypted credential store could not be read or written.
    #[error("credential store error: {0}")]
    CredentialStore(String),

    /// Encryption of the credential store failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption of the credential store failed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Interactive input failed or was refused.
    #[error("prompt error: {0}")]
    Prompt(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    /// Create a credential store error.
    #[must_use]
    pub fn store(msg: impl Into<String>) -> Self {
        Self::CredentialStore(msg.into())
    }

    /// Create a prompt error.
    #[must_use]
    pub fn prompt(msg: impl Into<String>) -> Self {
        Self::Prompt(msg.into())
    }

    /// Create an SSH transport error.
    #[must_use]
    pub fn ssh(address: IpAddr, msg: impl std::fmt::Display) -> Self {
        Self::Ssh {
            address,
            message: msg.to_string(),
        }
    }

    /// Returns true if the error is a rejected credential.
    #[must_use]
    pub const fn is_auth_failure(&self) -> bool {
        matches!(self, Self::AuthenticationFailed { .. })
    }
}
