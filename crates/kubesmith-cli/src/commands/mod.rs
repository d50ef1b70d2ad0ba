//! Command implementations and the wiring they share.

pub mod add;
pub mod install;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use kubesmith_control::{register_credentials, teardown, KubesmithConfig, RunContext};
use kubesmith_remote::{
    ConnectionManager, EncryptedFileStore, Executor, NonInteractive, Prompter, RemoteExecutor,
    Shell, SshDialer, TerminalPrompter,
};
use tracing::warn;

/// Flags accepted by every command.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Configuration file (defaults to kubesmith.toml in the current directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// SSH credentials as ip:user:password,ip:user:password
    #[arg(long, global = true, env = "KUBESMITH_AUTH_MAP", hide_env_values = true)]
    pub auth_map: Option<String>,

    /// Kubernetes version
    #[arg(long, global = true)]
    pub kube: Option<String>,

    /// etcd version
    #[arg(long, global = true)]
    pub etcd: Option<String>,

    /// Calico version, or "auto"
    #[arg(long, global = true)]
    pub calico: Option<String>,

    /// helm version
    #[arg(long, global = true)]
    pub helm: Option<String>,

    /// containerd.io version prefix, or "auto"
    #[arg(long, global = true)]
    pub containerd: Option<String>,

    /// docker-ce version prefix
    #[arg(long, global = true)]
    pub docker_version: Option<String>,

    /// Install Docker even on Kubernetes 1.24 and later
    #[arg(long, global = true)]
    pub docker: bool,

    /// Purge existing Docker and containerd packages and data first
    #[arg(long, global = true)]
    pub docker_prune: bool,

    /// Log at debug level
    #[arg(long, global = true)]
    pub debug: bool,

    /// Log at trace level, including every remote command
    #[arg(long, global = true, conflicts_with = "debug")]
    pub trace: bool,

    /// Fail instead of prompting for missing credentials
    #[arg(long, global = true)]
    pub non_interactive: bool,
}

impl GlobalArgs {
    /// Load the configuration and apply version overrides from the flags.
    pub fn load_config(&self) -> anyhow::Result<KubesmithConfig> {
        let mut config = match &self.config {
            Some(path) => KubesmithConfig::from_file(path)?,
            None => KubesmithConfig::load()?,
        };

        let versions = &mut config.versions;
        let overrides = [
            (&mut versions.kubernetes, &self.kube),
            (&mut versions.etcd, &self.etcd),
            (&mut versions.calico, &self.calico),
            (&mut versions.helm, &self.helm),
            (&mut versions.containerd, &self.containerd),
            (&mut versions.docker, &self.docker_version),
        ];
        for (slot, flag) in overrides {
            if let Some(value) = flag {
                slot.clone_from(value);
            }
        }
        config.docker.enabled |= self.docker;
        config.docker.prune |= self.docker_prune;
        Ok(config)
    }
}

/// Build the run context: SSH connections, the credential store and the
/// validated plan.
pub fn open_context(global: &GlobalArgs) -> anyhow::Result<Arc<RunContext>> {
    let config = global.load_config()?;

    let store = EncryptedFileStore::open(&config.paths.credential_store)
        .with_context(|| format!("opening credential store {}", config.paths.credential_store))?;
    let prompter: Arc<dyn Prompter> = if global.non_interactive {
        Arc::new(NonInteractive)
    } else {
        Arc::new(TerminalPrompter)
    };
    let manager = Arc::new(ConnectionManager::new(
        Arc::new(SshDialer::new()),
        Arc::new(store),
        prompter,
    ));
    register_credentials(&manager, &config, global.auth_map.as_deref())?;

    let shell = Shell::new(Arc::new(RemoteExecutor::new(manager)) as Arc<dyn Executor>);
    Ok(Arc::new(RunContext::new(config, shell)?))
}

/// On Ctrl+C or SIGTERM, run teardown (or wait for the one already running)
/// and exit with status 1.
pub fn spawn_signal_handler(ctx: Arc<RunContext>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            warn!(error = %e, "cannot listen for signals");
            return;
        }
        eprintln!();
        warn!("interrupted, cleaning up");
        teardown(&ctx).await;
        // Show the cursor again in case a prompt hid it.
        eprint!("\x1b[?25h");
        std::process::exit(1);
    })
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
