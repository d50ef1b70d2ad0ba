//! Per-node package reconciliation.
//!
//! For each requested package the reconciler decides between skip, install and
//! downgrade:
//!
//! - **Any version**: skip when installed, otherwise install
//! - **Exact prefix**: skip when the installed version matches the prefix;
//!   otherwise resolve the highest available matching version and install it,
//!   or downgrade to it when it is older than what is installed
//!
//! Installs and downgrades are each issued as a single command per node.

use std::sync::Arc;

use kubesmith_remote::{Shell, Target};
use tracing::{debug, info};

use crate::error::{PackageError, PackageResult};
use crate::manager::{Dialect, PackageManager, Repository};
use crate::spec::PackageSpec;
use crate::version::{highest_matching, lenient, prefix_matches};

const POLICY_RC: &str = "/usr/sbin/policy-rc.d";

/// Command printing the distribution name.
pub const OS_RELEASE_QUERY: &str = "awk -F= '/^NAME/{print $2}' /etc/os-release | tr -d '\"'";

/// Command removing any service start suppression stub.
pub const REMOVE_POLICY_RC: &str = "sudo rm -f /usr/sbin/policy-rc.d || true";

/// Detect the package manager dialect of `target`.
pub async fn detect(shell: &Shell, target: &Target) -> PackageResult<Dialect> {
    let name = shell.run(target, OS_RELEASE_QUERY).await?;
    let dialect = Dialect::from_os_name(&name)?;
    debug!(node = %target, os = %name, dialect = %dialect, "detected package manager");
    Ok(dialect)
}

/// Reconciliation options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileOptions {
    /// Stop package scripts from starting services while installing.
    pub suppress_service_start: bool,
}

impl ReconcileOptions {
    /// Options suppressing service start.
    #[must_use]
    pub const fn no_start() -> Self {
        Self {
            suppress_service_start: true,
        }
    }
}

/// What reconciliation decided, as install arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Install arguments, `name` or `name<sep>version`.
    pub installed: Vec<String>,
    /// Downgrade arguments.
    pub downgraded: Vec<String>,
    /// Packages left untouched.
    pub skipped: Vec<String>,
}

impl ReconcileOutcome {
    /// Returns true if nothing needs to run.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.installed.is_empty() && self.downgraded.is_empty()
    }
}

/// Reconciles packages on nodes through one [`PackageManager`].
#[derive(Debug, Clone)]
pub struct Reconciler {
    shell: Shell,
    manager: Arc<dyn PackageManager>,
}

impl Reconciler {
    /// Create a reconciler.
    #[must_use]
    pub fn new(shell: Shell, manager: Arc<dyn PackageManager>) -> Self {
        Self { shell, manager }
    }

    /// The dialect in use.
    #[must_use]
    pub fn manager(&self) -> &Arc<dyn PackageManager> {
        &self.manager
    }

    /// Installed version of `name`, if any.
    pub async fn installed(&self, target: &Target, name: &str) -> PackageResult<Option<String>> {
        let output = self
            .shell
            .run(target, &self.manager.query_installed(name))
            .await?;
        Ok(self.manager.decode_installed(name, &output))
    }

    /// Highest available version of `name` matching `prefix`.
    pub async fn resolve(&self, target: &Target, name: &str, prefix: &str) -> PackageResult<String> {
        let output = self
            .shell
            .run(target, &self.manager.list_available(name))
            .await?;
        let candidates = self.manager.decode_available(name, &output);
        highest_matching(&candidates, prefix)
            .map(str::to_owned)
            .ok_or_else(|| PackageError::VersionResolutionFailed {
                package: name.to_owned(),
                version: prefix.to_owned(),
                target: target.to_string(),
            })
    }

    /// Decide what to do for every spec without changing anything.
    pub async fn plan(
        &self,
        target: &Target,
        specs: &[PackageSpec],
    ) -> PackageResult<ReconcileOutcome> {
        let mut outcome = ReconcileOutcome::default();
        for spec in specs {
            let installed = self.installed(target, &spec.name).await?;
            let Some(prefix) = spec.version.as_deref() else {
                if installed.is_some() {
                    debug!(node = %target, package = %spec.name, "already installed, skipping");
                    outcome.skipped.push(spec.name.clone());
                } else {
                    outcome.installed.push(spec.name.clone());
                }
                continue;
            };

            if installed
                .as_deref()
                .is_some_and(|v| prefix_matches(v, prefix))
            {
                debug!(node = %target, package = %spec, "already at version, skipping");
                outcome.skipped.push(spec.name.clone());
                continue;
            }

            let resolved = self.resolve(target, &spec.name, prefix).await?;
            let argument = self.manager.versioned(&spec.name, &resolved);
            let older = match installed.as_deref() {
                Some(current) => lenient(&resolved)? < lenient(current)?,
                None => false,
            };
            if older {
                outcome.downgraded.push(argument);
            } else {
                outcome.installed.push(argument);
            }
        }
        Ok(outcome)
    }

    /// Run the batches of a plan.
    pub async fn apply(
        &self,
        target: &Target,
        outcome: &ReconcileOutcome,
        options: ReconcileOptions,
    ) -> PackageResult<()> {
        if outcome.is_noop() {
            return Ok(());
        }

        if options.suppress_service_start {
            self.shell
                .run(
                    target,
                    &format!("echo -e '#!/bin/sh\\nexit 101' | sudo tee -a {POLICY_RC}"),
                )
                .await?;
            self.shell
                .run(target, &format!("sudo chmod +x {POLICY_RC}"))
                .await?;
        }

        let result = self.run_batches(target, outcome).await;

        if options.suppress_service_start {
            self.shell
                .run(target, &format!("sudo rm -f {POLICY_RC}"))
                .await?;
        }
        result
    }

    /// Plan and apply.
    pub async fn reconcile(
        &self,
        target: &Target,
        specs: &[PackageSpec],
        options: ReconcileOptions,
    ) -> PackageResult<ReconcileOutcome> {
        let outcome = self.plan(target, specs).await?;
        self.apply(target, &outcome, options).await?;
        Ok(outcome)
    }

    /// Purge `name` if it is installed; returns whether anything was removed.
    pub async fn remove(&self, target: &Target, name: &str) -> PackageResult<bool> {
        if self.installed(target, name).await?.is_none() {
            return Ok(false);
        }
        info!(node = %target, package = %name, "removing package");
        for command in self.manager.remove(name) {
            self.shell.run(target, &command).await?;
        }
        Ok(true)
    }

    /// Pin `name` at its installed version.
    pub async fn hold(&self, target: &Target, name: &str) -> PackageResult<()> {
        self.shell.run(target, &self.manager.hold(name)).await?;
        Ok(())
    }

    /// Refresh repository metadata.
    pub async fn update_repos(&self, target: &Target) -> PackageResult<()> {
        info!(node = %target, "updating repositories");
        self.shell.run(target, &self.manager.update_repos()).await?;
        Ok(())
    }

    /// Install the signing key, if any, and the repository definition.
    pub async fn add_repository(&self, target: &Target, repo: &Repository) -> PackageResult<()> {
        let key_path = match &repo.gpg_key_url {
            Some(url) => {
                let key = self.manager.add_gpg_key(url, &repo.file_name);
                for command in &key.commands {
                    self.shell.run(target, command).await?;
                }
                Some(key.path)
            }
            None => {
                debug!(repo = %repo.name, "no signing key for repository");
                None
            }
        };
        self.shell
            .run(
                target,
                &self.manager.add_repository(repo, key_path.as_deref()),
            )
            .await?;
        Ok(())
    }

    /// Delete repository files starting with `prefix`.
    pub async fn remove_repository_files(&self, target: &Target, prefix: &str) -> PackageResult<()> {
        self.shell
            .run(target, &self.manager.remove_repository_files(prefix))
            .await?;
        Ok(())
    }

    async fn run_batches(&self, target: &Target, outcome: &ReconcileOutcome) -> PackageResult<()> {
        if !outcome.installed.is_empty() {
            info!(node = %target, packages = %outcome.installed.join(" "), "installing");
            self.shell
                .run(target, &self.manager.install(&outcome.installed))
                .await?;
        }
        if !outcome.downgraded.is_empty() {
            info!(node = %target, packages = %outcome.downgraded.join(" "), "downgrading");
            self.shell
                .run(target, &self.manager.downgrade(&outcome.downgraded))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use kubesmith_remote::testing::ScriptedRunner;
    use kubesmith_remote::Executor;

    const APT_AVAILABLE: &str = "\
Listing...
kubelet/kubernetes-xenial 1.25.0-00 amd64
kubelet/kubernetes-xenial 1.24.6-00 amd64
kubelet/kubernetes-xenial 1.24.1-00 amd64";

    fn node() -> Target {
        Target::Node("10.0.0.5".parse().unwrap())
    }

    fn setup(dialect: Dialect) -> (Reconciler, Arc<ScriptedRunner>) {
        let runner = Arc::new(ScriptedRunner::new());
        let manager = dialect.manager();
        let shell = Shell::new(Arc::clone(&runner) as Arc<dyn Executor>)
            .with_allowances(manager.allowed_exits());
        (Reconciler::new(shell, manager), runner)
    }

    #[tokio::test]
    async fn resolves_highest_patch_for_prefix() {
        let (reconciler, runner) = setup(Dialect::Apt);
        runner.on("apt list -a kubelet", APT_AVAILABLE);

        let outcome = reconciler
            .plan(&node(), &[PackageSpec::exact("kubelet", "1.24")])
            .await
            .unwrap();

        assert_eq!(outcome.installed, vec!["kubelet=1.24.6-00"]);
        assert!(outcome.downgraded.is_empty());
    }

    #[tokio::test]
    async fn newer_installed_version_routes_to_downgrade() {
        let (reconciler, runner) = setup(Dialect::Apt);
        runner.on(
            "dpkg --list kubelet",
            "hi  kubelet  1.26.0-00  amd64  Kubernetes Node Agent",
        );
        runner.on("apt list -a kubelet", APT_AVAILABLE);

        let outcome = reconciler
            .reconcile(
                &node(),
                &[PackageSpec::exact("kubelet", "1.24")],
                ReconcileOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.downgraded, vec!["kubelet=1.24.6-00"]);
        assert!(outcome.installed.is_empty());
        assert!(runner.ran("--allow-downgrades -o DPkg::Options::=\"--force-confnew\" kubelet=1.24.6-00"));
    }

    #[tokio::test]
    async fn matching_node_runs_no_install() {
        let (reconciler, runner) = setup(Dialect::Dnf);
        runner.on(
            "list installed 2>/dev/null | grep ^kubeadm",
            "kubeadm.x86_64   1.24.6-0   @kubernetes",
        );
        runner.on(
            "list installed 2>/dev/null | grep ^curl",
            "curl.x86_64   7.61.1-30.el8   @baseos",
        );

        let outcome = reconciler
            .reconcile(
                &node(),
                &[PackageSpec::exact("kubeadm", "1.24"), PackageSpec::any("curl")],
                ReconcileOptions::no_start(),
            )
            .await
            .unwrap();

        assert!(outcome.is_noop());
        assert_eq!(outcome.skipped, vec!["kubeadm", "curl"]);
        assert!(!runner.ran("install -y"));
        assert!(!runner.ran("downgrade"));
        assert!(!runner.ran("policy-rc.d"));
    }

    #[tokio::test]
    async fn batches_into_one_command() {
        let (reconciler, runner) = setup(Dialect::Yum);
        runner.on(
            "yum list kubelet --showduplicates",
            "kubelet.x86_64  1.24.6-0  kubernetes",
        );
        runner.on(
            "yum list kubectl --showduplicates",
            "kubectl.x86_64  1.24.6-0  kubernetes",
        );

        reconciler
            .reconcile(
                &node(),
                &[
                    PackageSpec::exact("kubelet", "1.24"),
                    PackageSpec::exact("kubectl", "1.24"),
                    PackageSpec::any("socat"),
                ],
                ReconcileOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(runner.count("yum install"), 1);
        assert!(runner.ran(
            "sudo yum install -y --setopt=obsoletes=0 kubelet-1.24.6 kubectl-1.24.6 socat"
        ));
    }

    #[tokio::test]
    async fn missing_version_fails_resolution() {
        let (reconciler, runner) = setup(Dialect::Apt);
        runner.on("apt list -a kubelet", APT_AVAILABLE);

        let err = reconciler
            .plan(&node(), &[PackageSpec::exact("kubelet", "1.19")])
            .await
            .unwrap_err();

        assert!(matches!(err, PackageError::VersionResolutionFailed { .. }));
    }

    #[tokio::test]
    async fn policy_stub_wraps_the_batches() {
        let (reconciler, runner) = setup(Dialect::Apt);

        reconciler
            .reconcile(
                &node(),
                &[PackageSpec::any("containerd.io")],
                ReconcileOptions::no_start(),
            )
            .await
            .unwrap();

        let stub = runner.position("exit 101").unwrap();
        let install = runner.position("apt-get install").unwrap();
        let cleanup = runner.position("sudo rm -f /usr/sbin/policy-rc.d").unwrap();
        assert!(stub < install && install < cleanup);
    }

    #[tokio::test]
    async fn remove_skips_absent_package() {
        let (reconciler, runner) = setup(Dialect::Apt);
        assert!(!reconciler.remove(&node(), "kubelet").await.unwrap());
        assert!(!runner.ran("purge"));
    }

    #[tokio::test]
    async fn detects_dialect_from_os_release() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("/etc/os-release", "Rocky Linux");
        let shell = Shell::new(Arc::clone(&runner) as Arc<dyn Executor>);

        assert_eq!(detect(&shell, &node()).await.unwrap(), Dialect::Dnf);
    }

    #[tokio::test]
    async fn signed_repository_installs_key_first() {
        let (reconciler, runner) = setup(Dialect::Apt);
        let repo = Repository {
            name: "Kubernetes".into(),
            short_name: "kubernetes".into(),
            file_name: "kubernetes".into(),
            address: "https://pkgs.k8s.io/core:/stable:/v1.30/deb/ /".into(),
            gpg_key_url: Some("https://pkgs.k8s.io/core:/stable:/v1.30/deb/Release.key".into()),
        };

        reconciler.add_repository(&node(), &repo).await.unwrap();

        let key = runner.position("gpg --dearmor").unwrap();
        let list = runner.position("sources.list.d/kubernetes.list").unwrap();
        assert!(key < list);
        assert!(runner.ran("signed-by=/etc/apt/keyrings/kubernetes.gpg"));
    }
}
