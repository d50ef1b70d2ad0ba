//! Error types for kubesmith-packages.

use kubesmith_remote::RemoteError;

/// Result type alias using [`PackageError`].
pub type PackageResult<T> = Result<T, PackageError>;

/// Errors raised while reconciling packages.
#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    /// `/etc/os-release` names a distribution without a supported package manager.
    #[error("unsupported OS: {0}")]
    UnsupportedOs(String),

    /// No available version matches the requested prefix.
    #[error("version \"{version}\" for \"{package}\" was not found on {target}")]
    VersionResolutionFailed {
        /// Package name.
        package: String,
        /// Requested version prefix.
        version: String,
        /// Node the lookup ran on.
        target: String,
    },

    /// A `name` or `name=version` string could not be parsed.
    #[error("invalid package spec: {0}")]
    InvalidSpec(String),

    /// A version string has no numeric component.
    #[error("invalid version: {0}")]
    InvalidVersion(String),

    /// Remote execution failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl PackageError {
    /// Create an invalid spec error.
    #[must_use]
    pub fn invalid_spec(msg: impl Into<String>) -> Self {
        Self::InvalidSpec(msg.into())
    }

    /// Create an invalid version error.
    #[must_use]
    pub fn invalid_version(msg: impl Into<String>) -> Self {
        Self::InvalidVersion(msg.into())
    }
}
