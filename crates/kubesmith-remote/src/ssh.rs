//! SSH transport built on russh.
//!
//! Host keys are accepted without verification. Nodes are addressed by IP and
//! freshly provisioned machines rarely have known host keys on the control
//! machine.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tracing::debug;

use crate::credential::{Credential, Secret};
use crate::error::{RemoteError, RemoteResult};
use crate::transport::{Dialer, ExecOutput, Session};

/// SSH port probed and dialled on every node.
pub const SSH_PORT: u16 = 22;

/// Timeout applied to the reachability probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

struct AcceptAnyHostKey;

#[async_trait]
impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// [`Dialer`] speaking SSH on port 22.
#[derive(Debug, Clone)]
pub struct SshDialer {
    probe_timeout: Duration,
    config: Arc<client::Config>,
}

impl Default for SshDialer {
    fn default() -> Self {
        Self::new()
    }
}

impl SshDialer {
    /// Create a dialer with the default probe timeout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            probe_timeout: PROBE_TIMEOUT,
            config: Arc::new(client::Config::default()),
        }
    }

    /// Override the reachability probe timeout.
    #[must_use]
    pub const fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}

#[async_trait]
impl Dialer for SshDialer {
    async fn probe(&self, address: IpAddr) -> bool {
        let target = SocketAddr::new(address, SSH_PORT);
        debug!(node = %address, port = SSH_PORT, "checking reachability");
        matches!(
            tokio::time::timeout(self.probe_timeout, TcpStream::connect(target)).await,
            Ok(Ok(_))
        )
    }

    async fn connect(
        &self,
        address: IpAddr,
        credential: &Credential,
    ) -> RemoteResult<Arc<dyn Session>> {
        let mut handle = client::connect(
            Arc::clone(&self.config),
            SocketAddr::new(address, SSH_PORT),
            AcceptAnyHostKey,
        )
        .await
        .map_err(|e| RemoteError::ssh(address, e))?;

        let accepted = match &credential.secret {
            Secret::Password(password) => handle
                .authenticate_password(credential.user.as_str(), password.expose_secret())
                .await
                .map_err(|e| RemoteError::ssh(address, e))?,
            Secret::PrivateKey(path) => {
                let key = russh_keys::load_secret_key(path, None).map_err(|e| {
                    RemoteError::PrivateKey {
                        path: path.display().to_string(),
                        message: e.to_string(),
                    }
                })?;
                handle
                    .authenticate_publickey(credential.user.as_str(), Arc::new(key))
                    .await
                    .map_err(|e| RemoteError::ssh(address, e))?
            }
        };

        if !accepted {
            return Err(RemoteError::AuthenticationFailed {
                address,
                user: credential.user.clone(),
            });
        }

        Ok(Arc::new(SshSession { address, handle }))
    }
}

struct SshSession {
    address: IpAddr,
    handle: Handle<AcceptAnyHostKey>,
}

#[async_trait]
impl Session for SshSession {
    async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> RemoteResult<ExecOutput> {
        let address = self.address;
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| RemoteError::ssh(address, e))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| RemoteError::ssh(address, e))?;

        if let Some(input) = stdin {
            channel
                .data(input)
                .await
                .map_err(|e| RemoteError::ssh(address, e))?;
            channel
                .eof()
                .await
                .map_err(|e| RemoteError::ssh(address, e))?;
        }

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
                _ => {}
            }
        }

        Ok(ExecOutput {
            // A channel closed without an exit status is treated as a failure.
            status: status.unwrap_or(255),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    async fn close(&self) -> RemoteResult<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(|e| RemoteError::ssh(self.address, e))
    }
}
