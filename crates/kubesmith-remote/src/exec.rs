//! Command execution on nodes and on the control machine.
//!
//! [`Executor`] is the seam the orchestrator talks to. [`Shell`] wraps an
//! executor with output normalisation, the non-zero exit allow-list and file
//! transfer helpers.

use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, trace};

use crate::connection::ConnectionManager;
use crate::error::{RemoteError, RemoteResult};
use crate::local::LocalRunner;
use crate::transport::ExecOutput;

/// Where a command runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// The control machine.
    Local,
    /// A cluster node reached over SSH.
    Node(IpAddr),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Node(ip) => write!(f, "{ip}"),
        }
    }
}

impl From<IpAddr> for Target {
    fn from(ip: IpAddr) -> Self {
        Self::Node(ip)
    }
}

/// Identity used on a node once connected.
#[derive(Clone)]
pub struct Login {
    /// Remote user name.
    pub user: String,
    /// Password, if the login used one.
    pub password: Option<SecretString>,
}

impl fmt::Debug for Login {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Login")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl Login {
    /// Login with a password.
    #[must_use]
    pub fn with_password(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: Some(SecretString::from(password.into())),
        }
    }

    /// The password, if any.
    #[must_use]
    pub fn password_str(&self) -> Option<&str> {
        self.password.as_ref().map(ExposeSecret::expose_secret)
    }

    /// Returns true if the login user is root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.user == "root"
    }
}

/// Runs commands.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Make sure an authenticated connection to `address` exists.
    async fn connect(&self, address: IpAddr) -> RemoteResult<Login>;

    /// Run `command` on `target`, optionally feeding `stdin`.
    ///
    /// A non-zero exit status is reported in [`ExecOutput::status`], not as an error.
    async fn execute(
        &self,
        target: &Target,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> RemoteResult<ExecOutput>;

    /// Close every connection.
    async fn close(&self);
}

/// [`Executor`] backed by SSH connections and a local shell.
#[derive(Debug)]
pub struct RemoteExecutor {
    connections: Arc<ConnectionManager>,
    local: LocalRunner,
}

impl RemoteExecutor {
    /// Create an executor over a connection manager.
    #[must_use]
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self {
            connections,
            local: LocalRunner,
        }
    }

    /// The connection manager.
    #[must_use]
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }
}

#[async_trait]
impl Executor for RemoteExecutor {
    async fn connect(&self, address: IpAddr) -> RemoteResult<Login> {
        let connection = self.connections.ensure(address).await?;
        let credential = connection.credential;
        Ok(Login {
            password: credential
                .password_str()
                .map(|p| SecretString::from(p.to_owned())),
            user: credential.user,
        })
    }

    async fn execute(
        &self,
        target: &Target,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> RemoteResult<ExecOutput> {
        match target {
            Target::Local => self.local.run(command, stdin).await,
            Target::Node(ip) => {
                let connection = self.connections.ensure(*ip).await?;
                connection.session().exec(command, stdin).await
            }
        }
    }

    async fn close(&self) {
        self.connections.close_all().await;
    }
}

/// A non-zero exit status that counts as success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitAllowance {
    /// Substring the command line must contain.
    pub pattern: String,
    /// Allowed status.
    pub status: u32,
}

impl ExitAllowance {
    /// Allow `status` for commands containing `pattern`.
    #[must_use]
    pub fn new(pattern: impl Into<String>, status: u32) -> Self {
        Self {
            pattern: pattern.into(),
            status,
        }
    }

    fn permits(&self, command: &str, status: u32) -> bool {
        self.status == status && command.contains(&self.pattern)
    }
}

/// Strip one trailing newline and a trailing login-shell `logout` line.
#[must_use]
pub fn normalise_output(stdout: &str) -> String {
    let trimmed = stdout.strip_suffix('\n').unwrap_or(stdout);
    trimmed
        .strip_suffix("\nlogout")
        .unwrap_or(trimmed)
        .to_owned()
}

/// Shell command installing its stdin at `path` as root with `mode`.
#[must_use]
pub fn install_command(path: &str, mode: u32) -> String {
    let file_name = Path::new(path)
        .file_name()
        .map_or_else(|| "payload".to_owned(), |n| n.to_string_lossy().into_owned());
    let mkdir = Path::new(path)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|parent| format!(" && sudo mkdir -p {}", parent.display()))
        .unwrap_or_default();
    format!(
        "staging=$(umask 077 && mktemp /tmp/kubesmith-{file_name}.XXXXXX) && cat > \"$staging\"{mkdir} \
         && sudo install -o root -g root -m {mode:04o} \"$staging\" {path}; \
         rc=$?; rm -f \"$staging\"; exit $rc"
    )
}

/// Convenience wrapper around an [`Executor`].
#[derive(Clone)]
pub struct Shell {
    executor: Arc<dyn Executor>,
    allowances: Arc<[ExitAllowance]>,
}

impl fmt::Debug for Shell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shell")
            .field("allowances", &self.allowances)
            .finish_non_exhaustive()
    }
}

impl Shell {
    /// Wrap an executor with an empty allow-list.
    #[must_use]
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            allowances: Arc::from(Vec::new()),
        }
    }

    /// Replace the exit allow-list.
    #[must_use]
    pub fn with_allowances(mut self, allowances: impl IntoIterator<Item = ExitAllowance>) -> Self {
        self.allowances = allowances.into_iter().collect();
        self
    }

    /// The wrapped executor.
    #[must_use]
    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    /// Connect to `address`.
    pub async fn connect(&self, address: IpAddr) -> RemoteResult<Login> {
        self.executor.connect(address).await
    }

    /// Run a command and return its normalised stdout.
    pub async fn run(&self, target: &Target, command: &str) -> RemoteResult<String> {
        self.run_inner(target, command, command, None).await
    }

    /// Run a command containing `secret`, which is masked in logs and errors.
    pub async fn run_redacted(
        &self,
        target: &Target,
        command: &str,
        secret: &str,
    ) -> RemoteResult<String> {
        let shown = if secret.is_empty() {
            command.to_owned()
        } else {
            command.replace(secret, "****")
        };
        self.run_inner(target, command, &shown, None).await
    }

    /// Run a command and report whether it succeeded.
    ///
    /// Only a failed exit status maps to `false`; transport errors propagate.
    pub async fn run_status(&self, target: &Target, command: &str) -> RemoteResult<bool> {
        match self.run(target, command).await {
            Ok(_) => Ok(true),
            Err(RemoteError::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Run a command feeding `input` on its stdin.
    ///
    /// Secrets passed this way never appear in the command line, so they are
    /// neither logged nor visible in the node's process list.
    pub async fn run_with_input(
        &self,
        target: &Target,
        command: &str,
        input: &[u8],
    ) -> RemoteResult<String> {
        self.run_inner(target, command, command, Some(input)).await
    }

    /// Write `contents` to `path` on `target`, owned by root with mode `0644`.
    pub async fn write_file(
        &self,
        target: &Target,
        path: &str,
        contents: &[u8],
    ) -> RemoteResult<()> {
        self.write_file_with_mode(target, path, contents, 0o644).await
    }

    /// Write `contents` to `path` on `target`, owned by root with `mode`.
    ///
    /// The payload is streamed into a private `mktemp` file, then installed into place with `sudo install`, creating
    /// the parent directory if needed. The staging file is always removed.
    pub async fn write_file_with_mode(
        &self,
        target: &Target,
        path: &str,
        contents: &[u8],
        mode: u32,
    ) -> RemoteResult<()> {
        debug!(
            node = %target,
            path = %path,
            bytes = contents.len(),
            mode = %format!("{mode:04o}"),
            "writing file"
        );
        self.run_with_input(target, &install_command(path, mode), contents)
            .await?;
        Ok(())
    }

    /// Read a file as root.
    pub async fn read_file(&self, target: &Target, path: &str) -> RemoteResult<String> {
        self.run(target, &format!("sudo cat {path}")).await
    }

    /// Close every connection.
    pub async fn close(&self) {
        self.executor.close().await;
    }

    async fn run_inner(
        &self,
        target: &Target,
        command: &str,
        shown: &str,
        stdin: Option<&[u8]>,
    ) -> RemoteResult<String> {
        trace!(node = %target, command = %shown, "running command");
        let output = self.executor.execute(target, command, stdin).await?;

        if output.success()
            || self
                .allowances
                .iter()
                .any(|a| a.permits(command, output.status))
        {
            let stdout = normalise_output(&output.stdout);
            trace!(node = %target, command = %shown, stdout = %stdout, "command finished");
            return Ok(stdout);
        }

        debug!(
            node = %target,
            command = %shown,
            status = output.status,
            "command failed"
        );
        Err(RemoteError::CommandFailed {
            target: target.to_string(),
            command: shown.to_owned(),
            status: output.status,
            stderr: output.stderr.trim().to_owned(),
        })
    }
}
