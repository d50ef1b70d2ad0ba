//! Seams between the connection manager and the wire protocol.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::credential::Credential;
use crate::error::RemoteResult;

/// Raw result of running one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit status; 0 on success.
    pub status: u32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl ExecOutput {
    /// A successful result with the given stdout.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed result with the given status and stderr.
    #[must_use]
    pub fn failed(status: u32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Returns true if the status is zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.status == 0
    }
}

/// An authenticated channel to one node.
#[async_trait]
pub trait Session: Send + Sync {
    /// Run `command` in a fresh session multiplexed over this connection.
    ///
    /// `stdin`, when given, is streamed to the command and followed by EOF.
    async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> RemoteResult<ExecOutput>;

    /// Close the connection.
    async fn close(&self) -> RemoteResult<()>;
}

/// Opens sessions to nodes.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Bounded TCP reachability probe of the SSH port.
    async fn probe(&self, address: IpAddr) -> bool;

    /// Dial and authenticate.
    ///
    /// A rejected credential must be reported as
    /// [`RemoteError::AuthenticationFailed`](crate::RemoteError::AuthenticationFailed)
    /// so callers can fall through to the next credential source.
    async fn connect(
        &self,
        address: IpAddr,
        credential: &Credential,
    ) -> RemoteResult<Arc<dyn Session>>;
}
