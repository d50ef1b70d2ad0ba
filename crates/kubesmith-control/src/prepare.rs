//! Node preparation before the runtime and Kubernetes packages go on.

use std::collections::HashSet;
use std::net::IpAddr;

use kubesmith_packages::version::prefix_matches;
use kubesmith_packages::{PackageSpec, ReconcileOptions};
use tracing::{debug, info, warn};

use crate::context::RunContext;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::plan::Node;

/// Kubernetes packages, installed and held at the cluster version.
pub const KUBE_PACKAGES: [&str; 3] = ["kubelet", "kubectl", "kubeadm"];

/// Repository file prefixes removed before the managed repositories are added.
const STALE_REPO_PREFIXES: [&str; 2] = ["docker", "kubernetes"];

/// Command appending `line` to `file` unless it is already there.
#[must_use]
pub fn append_line(line: &str, file: &str) -> String {
    format!("grep -qxF '{line}' {file} || echo '{line}' | sudo tee -a {file} > /dev/null")
}

/// Make every cluster node resolvable by hostname on each of `nodes`.
pub async fn seed_hosts(ctx: &RunContext, nodes: &[&Node]) -> OrchestratorResult<()> {
    for node in nodes {
        debug!(node = %node.ip, "seeding /etc/hosts");
        for entry in ctx.plan().nodes() {
            ctx.shell()
                .run(
                    &node.target(),
                    &append_line(&format!("{} {}", entry.ip, entry.hostname), "/etc/hosts"),
                )
                .await?;
        }
    }
    Ok(())
}

/// Register the enabled custom repositories, drop stale managed ones and
/// refresh metadata.
pub async fn add_custom_repos(ctx: &RunContext, nodes: &[&Node]) -> OrchestratorResult<()> {
    for node in nodes {
        let target = node.target();
        let reconciler = ctx.reconciler(node).await?;
        for repo in ctx.config().custom_repos.iter().filter(|r| r.enabled) {
            if let Some(url) = repo.url() {
                let reachable = ctx
                    .shell()
                    .run_status(
                        &target,
                        &format!("curl -sS -o /dev/null --connect-timeout 5 {url}"),
                    )
                    .await?;
                if !reachable {
                    return Err(OrchestratorError::config(format!(
                        "custom repository {url} is not reachable from {}",
                        node.ip
                    )));
                }
            }
            info!(node = %node.ip, repo = %repo.name, "adding custom repository");
            reconciler.add_repository(&target, &repo.repository()).await?;
        }
        for prefix in STALE_REPO_PREFIXES {
            reconciler.remove_repository_files(&target, prefix).await?;
        }
        reconciler.update_repos(&target).await?;
    }
    Ok(())
}

/// Install the configured base packages.
pub async fn install_packages(ctx: &RunContext, nodes: &[&Node]) -> OrchestratorResult<()> {
    let specs = ctx
        .config()
        .packages
        .iter()
        .map(|raw| PackageSpec::parse(raw))
        .collect::<Result<Vec<_>, _>>()?;
    if specs.is_empty() {
        return Ok(());
    }
    for node in nodes {
        ctx.reconciler(node)
            .await?
            .reconcile(&node.target(), &specs, ReconcileOptions::default())
            .await?;
    }
    Ok(())
}

/// Add the Kubernetes repository, wipe previous cluster state and remove
/// Kubernetes packages at another version.
///
/// Returns the addresses that still need the Kubernetes packages.
pub async fn reset_kubernetes(ctx: &RunContext, nodes: &[&Node]) -> OrchestratorResult<HashSet<IpAddr>> {
    let shell = ctx.shell();
    let desired = ctx.versions().kubernetes.to_string();
    let mut required = HashSet::new();

    for node in nodes {
        let target = node.target();
        let reconciler = ctx.reconciler(node).await?;
        let repo = &ctx.config().kubernetes.repo;
        if repo.enabled {
            let dialect = ctx.dialect(node).await?;
            let repository = repo.repository(dialect, &ctx.versions().kubernetes_minor());
            info!(node = %node.ip, repo = %repository.file_name, "adding kubernetes repository");
            reconciler.add_repository(&target, &repository).await?;
            reconciler.update_repos(&target).await?;
        }

        let mut installed = Vec::with_capacity(KUBE_PACKAGES.len());
        for name in KUBE_PACKAGES {
            installed.push((name, reconciler.installed(&target, name).await?));
        }
        let version_of = |name: &str| {
            installed
                .iter()
                .find(|(n, _)| *n == name)
                .and_then(|(_, v)| v.as_deref())
        };

        if version_of("kubeadm").is_some() {
            info!(node = %node.ip, hostname = %node.hostname, "resetting kubernetes");
            shell.run(&target, "sudo kubeadm reset -f").await?;
        }
        for dir in ["/etc/kubernetes", "/etc/cni/net.d", "/var/lib/cni", "$HOME/.kube"] {
            shell.run(&target, &format!("sudo rm -rf {dir}")).await?;
        }
        if version_of("kubelet").is_some() {
            shell.run(&target, "sudo service kubelet stop || true").await?;
        }
        shell.run(&target, "sudo rm -rf /var/lib/kubelet").await?;

        let wrong_version = installed
            .iter()
            .filter_map(|(_, v)| v.as_deref())
            .find(|v| !prefix_matches(v, &desired));
        if let Some(found) = wrong_version {
            warn!(
                node = %node.ip,
                hostname = %node.hostname,
                %found,
                %desired,
                "kubernetes packages at another version, removing"
            );
            for name in ["kubeadm", "kubectl", "kubelet"] {
                reconciler.remove(&target, name).await?;
            }
        }

        if wrong_version.is_some() || installed.iter().any(|(_, v)| v.is_none()) {
            required.insert(node.ip);
        } else {
            debug!(node = %node.ip, version = %desired, "kubernetes packages already installed");
        }
    }
    Ok(required)
}

/// Turn swap off, raise the inotify limit and relax SELinux where configured.
pub async fn prepare_nodes(ctx: &RunContext, nodes: &[&Node]) -> OrchestratorResult<()> {
    let shell = ctx.shell();
    let system = &ctx.config().system;
    for node in nodes {
        let target = node.target();
        shell
            .run(
                &target,
                &format!(
                    "sudo sysctl fs.inotify.max_user_watches={}",
                    system.inotify_max_user_watches
                ),
            )
            .await?;
        shell.run(&target, "sudo swapoff -a").await?;

        if system.selinux_permissive && ctx.dialect(node).await?.is_rpm() {
            let status = shell
                .run(
                    &target,
                    "sudo sestatus | grep -i \"selinux status\" | awk -F: '{ print $2 }' | xargs",
                )
                .await?;
            if status == "enabled" {
                info!(node = %node.ip, "setting SELinux to permissive");
                shell.run(&target, "sudo setenforce 0").await?;
                shell
                    .run(
                        &target,
                        "sudo sed -i 's/^SELINUX=enforcing$/SELINUX=permissive/' /etc/selinux/config",
                    )
                    .await?;
            } else {
                debug!(node = %node.ip, "SELinux already disabled");
            }
        }
    }
    Ok(())
}

/// Install and hold the Kubernetes packages on the nodes in `required`.
pub async fn install_kube_packages(
    ctx: &RunContext,
    nodes: &[&Node],
    required: &HashSet<IpAddr>,
) -> OrchestratorResult<()> {
    let version = ctx.versions().kubernetes.to_string();
    let specs: Vec<PackageSpec> = KUBE_PACKAGES
        .iter()
        .map(|name| PackageSpec::exact(*name, version.clone()))
        .collect();

    for node in nodes {
        if !required.contains(&node.ip) {
            info!(node = %node.ip, %version, "kubernetes packages already installed");
            continue;
        }
        let target = node.target();
        let reconciler = ctx.reconciler(node).await?;
        reconciler
            .reconcile(&target, &specs, ReconcileOptions::default())
            .await?;
        for name in KUBE_PACKAGES {
            reconciler.hold(&target, name).await?;
        }
        if ctx.config().kubernetes.bash_completion {
            ctx.shell()
                .run(
                    &target,
                    "kubectl completion bash | sudo tee /etc/bash_completion.d/kubectl > /dev/null",
                )
                .await?;
            ctx.shell()
                .run(&target, "sudo chmod a+r /etc/bash_completion.d/kubectl")
                .await?;
        }
    }
    Ok(())
}
