//! Authenticated remote command execution for kubesmith.
//!
//! Every node is reached over SSH through one cached connection. Credentials
//! are resolved from three sources, most trusted first:
//!
//! 1. **Cache**: an age-encrypted file of credentials that worked before
//! 2. **Plan**: the user and password or key given in the cluster config
//! 3. **Prompt**: asked interactively, once per field
//!
//! Working credentials are written back to the cache; rejected cached entries
//! are removed.
//!
//! # Example
//!
//! ```rust,ignore
//! use kubesmith_remote::{ConnectionManager, EncryptedFileStore, RemoteExecutor, Shell, SshDialer, Target};
//!
//! let manager = ConnectionManager::new(
//!     Arc::new(SshDialer::new()),
//!     Arc::new(EncryptedFileStore::open("~/.kubesmith/data/ssh")?),
//!     Arc::new(TerminalPrompter),
//! );
//! let shell = Shell::new(Arc::new(RemoteExecutor::new(Arc::new(manager))));
//! let os = shell.run(&Target::Node(ip), "uname -s").await?;
//! ```

#![forbid(unsafe_code)]

mod connection;
mod credential;
mod error;
mod exec;
mod local;
mod prompt;
mod ssh;
mod store;
mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use connection::{Connection, ConnectionManager};
pub use credential::{parse_auth_map, Credential, CredentialSource, Secret};
pub use error::{RemoteError, RemoteResult};
pub use exec::{normalise_output, ExitAllowance, Executor, Login, RemoteExecutor, Shell, Target};
pub use local::LocalRunner;
pub use prompt::{
    prompt_credential, validate_non_empty, validate_path, validate_user, NonInteractive,
    Prompter, TerminalPrompter, Validator, AUTH_METHODS,
};
pub use ssh::{SshDialer, PROBE_TIMEOUT, SSH_PORT};
pub use store::{CredentialCache, EncryptedFileStore, MemoryStore, DEFAULT_STORE_PATH};
pub use transport::{Dialer, ExecOutput, Session};
