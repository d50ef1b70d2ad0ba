//! Everything one run needs, passed by reference to every step.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kubesmith_packages::{detect, Dialect, Reconciler};
use kubesmith_remote::{parse_auth_map, ConnectionManager, Login, RemoteError, Shell, Target};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::debug;

use crate::config::{KubesmithConfig, ResolvedVersions};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::pki::Authority;
use crate::plan::{ClusterPlan, Node};
use crate::retry::{Clock, TokioClock};

/// Scratch directory on every node, as seen by that node's login shell.
pub const NODE_TMP_DIR: &str = "$HOME/.kubesmith/tmp";

/// [`NODE_TMP_DIR`] relative to the login user's home, for `scp` destinations.
pub const NODE_TMP_DIR_RELATIVE: &str = ".kubesmith/tmp";

/// Where the composed kubeadm config is written on the first master.
pub const KUBEADM_CONFIG_PATH: &str = "$HOME/.kubesmith/config/kubeadm-config.yaml";

/// A sudoers line added during the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SudoGrant {
    /// Node address.
    pub address: IpAddr,
    /// User granted passwordless sudo.
    pub user: String,
}

/// Per-run state shared by every step.
pub struct RunContext {
    shell: Shell,
    config: KubesmithConfig,
    plan: ClusterPlan,
    versions: ResolvedVersions,
    clock: Arc<dyn Clock>,
    authority: Authority,
    logins: RwLock<HashMap<IpAddr, Login>>,
    dialects: RwLock<HashMap<IpAddr, Dialect>>,
    grants: Mutex<Vec<SudoGrant>>,
    torn_down: AtomicBool,
    teardown_finished: AtomicBool,
    teardown_done: Notify,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("plan", &self.plan)
            .field("versions", &self.versions)
            .finish_non_exhaustive()
    }
}

impl RunContext {
    /// Validate `config` and build the context for one run.
    pub fn new(config: KubesmithConfig, shell: Shell) -> OrchestratorResult<Self> {
        config.validate()?;
        let plan = ClusterPlan::from_config(&config)?;
        let versions = config.versions.resolve()?;
        Ok(Self {
            shell,
            config,
            plan,
            versions,
            clock: Arc::new(TokioClock),
            authority: Authority::default(),
            logins: RwLock::new(HashMap::new()),
            dialects: RwLock::new(HashMap::new()),
            grants: Mutex::new(Vec::new()),
            torn_down: AtomicBool::new(false),
            teardown_finished: AtomicBool::new(false),
            teardown_done: Notify::new(),
        })
    }

    /// Whether nodes get the Docker engine alongside containerd.
    #[must_use]
    pub fn uses_docker(&self) -> bool {
        self.config.docker.enabled || self.versions.dockershim()
    }

    /// Replace the clock used by every wait.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the certificate authority.
    #[must_use]
    pub fn with_authority(mut self, authority: Authority) -> Self {
        self.authority = authority;
        self
    }

    /// The shell.
    #[must_use]
    pub fn shell(&self) -> &Shell {
        &self.shell
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &KubesmithConfig {
        &self.config
    }

    /// The cluster plan.
    #[must_use]
    pub fn plan(&self) -> &ClusterPlan {
        &self.plan
    }

    /// Resolved component versions.
    #[must_use]
    pub fn versions(&self) -> &ResolvedVersions {
        &self.versions
    }

    /// The clock for waits.
    #[must_use]
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// The certificate authority.
    #[must_use]
    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Connect to `node` and remember the login.
    pub async fn connect(&self, node: &Node) -> OrchestratorResult<Login> {
        let login = self.shell.connect(node.ip).await?;
        self.logins.write().insert(node.ip, login.clone());
        Ok(login)
    }

    /// Login used on `address`, connecting if needed.
    pub async fn login(&self, address: IpAddr) -> OrchestratorResult<Login> {
        if let Some(login) = self.logins.read().get(&address) {
            return Ok(login.clone());
        }
        let login = self.shell.connect(address).await?;
        self.logins.write().insert(address, login.clone());
        Ok(login)
    }

    /// Addresses connected to during the run.
    #[must_use]
    pub fn connected(&self) -> Vec<IpAddr> {
        let mut addresses: Vec<IpAddr> = self.logins.read().keys().copied().collect();
        addresses.sort();
        addresses
    }

    /// Package dialect of `node`, detected on first use.
    pub async fn dialect(&self, node: &Node) -> OrchestratorResult<Dialect> {
        if let Some(dialect) = self.dialects.read().get(&node.ip) {
            return Ok(*dialect);
        }
        let dialect = detect(&self.shell, &node.target()).await?;
        debug!(node = %node.ip, %dialect, "detected package manager");
        self.dialects.write().insert(node.ip, dialect);
        Ok(dialect)
    }

    /// Reconciler for `node`'s dialect.
    pub async fn reconciler(&self, node: &Node) -> OrchestratorResult<Reconciler> {
        let manager = self.dialect(node).await?.manager();
        let shell = self.shell.clone().with_allowances(manager.allowed_exits());
        Ok(Reconciler::new(shell, manager))
    }

    /// Stdout of `command` on `target`, or `None` when it exits non-zero.
    pub async fn probe(&self, target: &Target, command: &str) -> OrchestratorResult<Option<String>> {
        match self.shell.run(target, command).await {
            Ok(stdout) => Ok(Some(stdout)),
            Err(RemoteError::CommandFailed { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Record a sudoers line added during the run.
    pub fn record_grant(&self, grant: SudoGrant) {
        self.grants.lock().push(grant);
    }

    /// Take every recorded grant, leaving none.
    pub fn take_grants(&self) -> Vec<SudoGrant> {
        std::mem::take(&mut *self.grants.lock())
    }

    /// Mark teardown as started. Returns false if it already was.
    pub fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::SeqCst)
    }

    /// Mark teardown as finished and wake everyone waiting for it.
    pub fn finish_teardown(&self) {
        self.teardown_finished.store(true, Ordering::SeqCst);
        self.teardown_done.notify_waiters();
    }

    /// Wait until the teardown started elsewhere has finished.
    pub async fn wait_for_teardown(&self) {
        let done = self.teardown_done.notified();
        tokio::pin!(done);
        // Register before checking the flag so a concurrent finish is not missed.
        done.as_mut().enable();
        if self.teardown_finished.load(Ordering::SeqCst) {
            return;
        }
        done.await;
    }
}

/// Register plan credentials and seed the cache from an auth map.
///
/// The auth map has the form `ip:user:password,ip:user:password`.
pub fn register_credentials(
    manager: &ConnectionManager,
    config: &KubesmithConfig,
    auth_map: Option<&str>,
) -> OrchestratorResult<()> {
    for node in &config.nodes {
        manager.register(node.ip, node.credential());
    }
    if let Some(raw) = auth_map.filter(|r| !r.trim().is_empty()) {
        let entries = parse_auth_map(raw).map_err(|e| OrchestratorError::config(e.to_string()))?;
        for (address, credential) in entries {
            manager.seed(address, &credential)?;
        }
    }
    Ok(())
}
