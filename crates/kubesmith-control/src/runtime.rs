//! Container runtimes: containerd, and Docker where it is still needed.
//!
//! containerd comes from the Docker repository as `containerd.io`. When the
//! kubelet talks to containerd directly its config is regenerated from the
//! packaged defaults on every run, then patched for the cgroup driver, the
//! sandbox image and any plain-HTTP registries.
//!
//! Clusters older than 1.24 run on Docker through dockershim, and Docker can
//! be requested for newer ones too. Docker is pinned to the configured
//! version; a different installed version is replaced.

use kubesmith_packages::version::prefix_matches;
use kubesmith_packages::{PackageSpec, ReconcileOptions, Reconciler};
use kubesmith_remote::Target;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::context::RunContext;
use crate::error::OrchestratorResult;
use crate::plan::Node;

/// containerd configuration file.
pub const CONFIG_PATH: &str = "/etc/containerd/config.toml";

/// Per-registry host configuration directory.
pub const CERTS_DIR: &str = "/etc/containerd/certs.d";

/// Runtime package.
pub const PACKAGE: &str = "containerd.io";

/// Docker daemon configuration file.
pub const DAEMON_CONFIG_PATH: &str = "/etc/docker/daemon.json";

/// Docker packages, installed at the same version.
pub const DOCKER_PACKAGES: [&str; 2] = ["docker-ce", "docker-ce-cli"];

/// Packages purged before Docker is replaced.
pub const DOCKER_CONFLICTS: [&str; 13] = [
    "docker-ce-cli",
    "docker-ce",
    "docker.io",
    "docker-doc",
    "docker-compose",
    "podman-docker",
    "containerd",
    "containerd.io",
    "runc",
    "docker-ce-rootless-extras",
    "docker-buildx-plugin",
    "docker-compose-plugin",
    "docker-scan-plugin",
];

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct DaemonConfig<'a> {
    exec_opts: &'a [String],
    log_driver: &'a str,
    log_opts: LogOpts<'a>,
    registry_mirrors: &'a [String],
    insecure_registries: &'a [String],
    debug: bool,
    experimental: bool,
    storage_driver: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct LogOpts<'a> {
    max_file: &'a str,
    max_size: &'a str,
}

/// `daemon.json` for this cluster.
pub fn daemon_config(ctx: &RunContext) -> OrchestratorResult<String> {
    let docker = &ctx.config().docker;
    let containerd = &ctx.config().containerd;
    let config = DaemonConfig {
        exec_opts: &containerd.exec_opts,
        log_driver: &docker.log_driver,
        log_opts: LogOpts {
            max_file: &docker.log_max_file,
            max_size: &docker.log_max_size,
        },
        registry_mirrors: &docker.registry_mirrors,
        insecure_registries: &containerd.insecure_registries,
        debug: false,
        experimental: false,
        storage_driver: &docker.storage_driver,
    };
    Ok(serde_json::to_string_pretty(&config)?)
}

/// `hosts.toml` letting containerd pull from `registry` over plain HTTP.
#[must_use]
pub fn registry_hosts(registry: &str) -> String {
    format!(
        "[host.\"http://{registry}\"]\n  capabilities = [\"pull\", \"resolve\", \"push\"]\n  skip_verify = true\n"
    )
}

/// Commands rewriting the default config for this cluster.
#[must_use]
pub fn config_commands(ctx: &RunContext) -> Vec<String> {
    let containerd = &ctx.config().containerd;
    let registry = &ctx.config().kubernetes.image_registry;
    let mut commands = vec![
        "sudo rm -rf /etc/containerd_bak".to_owned(),
        "sudo mkdir -p /etc/containerd && sudo mv /etc/containerd /etc/containerd_bak".to_owned(),
        "sudo mkdir -p /etc/containerd".to_owned(),
        format!("sudo containerd config default | sudo tee {CONFIG_PATH} > /dev/null"),
    ];
    if containerd.cgroup_driver() == "systemd" {
        commands.push(format!(
            "sudo sed -i 's/SystemdCgroup = false/SystemdCgroup = true/' {CONFIG_PATH}"
        ));
    }
    commands.push(format!(
        "sudo sed -i 's|sandbox_image = .*|sandbox_image = \"{registry}/{}\"|' {CONFIG_PATH}",
        containerd.sandbox_image
    ));
    if !containerd.insecure_registries.is_empty() {
        commands.push(format!(
            "sudo sed -i 's|config_path = \"\"|config_path = \"{CERTS_DIR}\"|' {CONFIG_PATH}"
        ));
    }
    commands
}

/// Install and configure containerd on every node in `nodes`.
pub async fn install(ctx: &RunContext, nodes: &[&Node]) -> OrchestratorResult<()> {
    for node in nodes {
        install_on(ctx, node).await?;
    }
    Ok(())
}

async fn install_on(ctx: &RunContext, node: &Node) -> OrchestratorResult<()> {
    let shell = ctx.shell();
    let target = node.target();
    let reconciler = ctx.reconciler(node).await?;
    let repo = &ctx.config().containerd.repo;

    if repo.enabled {
        let dialect = ctx.dialect(node).await?;
        let repository = repo.repository(dialect, &ctx.versions().kubernetes_minor());
        debug!(node = %node.ip, repo = %repository.name, "adding runtime repository");
        reconciler.add_repository(&target, &repository).await?;
        reconciler.update_repos(&target).await?;
    }

    if ctx.uses_docker() {
        install_docker(ctx, node, &reconciler).await?;
    }

    let spec = match &ctx.versions().containerd {
        Some(version) => PackageSpec::exact(PACKAGE, version.clone()),
        None => PackageSpec::any(PACKAGE),
    };
    reconciler
        .reconcile(&target, &[spec], ReconcileOptions::no_start())
        .await?;

    // dockershim clusters never reach containerd's CRI plugin.
    if !ctx.versions().dockershim() {
        info!(node = %node.ip, "configuring containerd");
        for command in config_commands(ctx) {
            shell.run(&target, &command).await?;
        }
        for registry in &ctx.config().containerd.insecure_registries {
            shell
                .write_file(
                    &target,
                    &format!("{CERTS_DIR}/{registry}/hosts.toml"),
                    registry_hosts(registry).as_bytes(),
                )
                .await?;
        }
    }
    shell.run(&target, "sudo systemctl enable containerd").await?;
    shell.run(&target, "sudo systemctl restart containerd").await?;
    Ok(())
}

async fn install_docker(ctx: &RunContext, node: &Node, reconciler: &Reconciler) -> OrchestratorResult<()> {
    let shell = ctx.shell();
    let target = node.target();
    let docker = &ctx.config().docker;
    let version = ctx.versions().docker.as_str();

    let mut replace = docker.prune;
    let mut present = true;
    for name in DOCKER_PACKAGES {
        match reconciler.installed(&target, name).await? {
            Some(installed) if prefix_matches(&installed, version) => {}
            Some(installed) => {
                warn!(node = %node.ip, package = name, %installed, wanted = version, "replacing installed docker");
                replace = true;
            }
            None => present = false,
        }
    }

    if replace {
        info!(node = %node.ip, prune = docker.prune, "removing existing docker");
        for name in DOCKER_CONFLICTS {
            reconciler.remove(&target, name).await?;
        }
    } else if present && shell.run_status(&target, "systemctl is-active --quiet docker").await? {
        debug!(node = %node.ip, version, "docker already running, refreshing its config");
        shell.run(&target, "sudo systemctl stop docker").await?;
        configure_docker(ctx, &target).await?;
        return docker_group(ctx, &target).await;
    }

    if docker.prune {
        shell
            .run(&target, "sudo rm -rf /var/lib/docker /var/lib/containerd")
            .await?;
    }
    shell.run(&target, "sudo rm -rf /etc/docker").await?;
    info!(node = %node.ip, version, "installing docker");
    let specs = DOCKER_PACKAGES.map(|name| PackageSpec::exact(name, version));
    reconciler
        .reconcile(&target, &specs, ReconcileOptions::no_start())
        .await?;
    configure_docker(ctx, &target).await?;
    docker_group(ctx, &target).await
}

async fn configure_docker(ctx: &RunContext, target: &Target) -> OrchestratorResult<()> {
    let shell = ctx.shell();
    shell
        .write_file(target, DAEMON_CONFIG_PATH, daemon_config(ctx)?.as_bytes())
        .await?;
    shell.run(target, "sudo systemctl daemon-reload").await?;
    shell.run(target, "sudo systemctl enable docker").await?;
    shell.run(target, "sudo systemctl restart docker").await?;
    Ok(())
}

/// Let the login user talk to the Docker socket.
async fn docker_group(ctx: &RunContext, target: &Target) -> OrchestratorResult<()> {
    let shell = ctx.shell();
    for command in [
        "sudo groupadd docker -f",
        "sudo gpasswd -a $USER docker",
        "sudo chown $(id -u):$(id -g) $HOME/.docker/config.json 2>/dev/null || true",
    ] {
        shell.run(target, command).await?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use kubesmith_remote::testing::ScriptedRunner;
    use kubesmith_remote::{Executor, Shell};

    use crate::config::KubesmithConfig;
    use crate::context::tests::{context, node_config};
    use crate::plan::Role;

    const DOCKER_CE: &str = "ii  docker-ce  5:20.10.24~3-0~ubuntu-jammy  amd64  Docker: the open-source application container engine";
    const DOCKER_CLI: &str = "ii  docker-ce-cli  5:20.10.24~3-0~ubuntu-jammy  amd64  Docker CLI";

    fn ubuntu_context(runner: &Arc<ScriptedRunner>, configure: impl FnOnce(&mut KubesmithConfig)) -> RunContext {
        runner.on("os-release", "Ubuntu");
        runner.on("apt list -a docker-ce ", "docker-ce/jammy 5:20.10.24~3-0~ubuntu-jammy amd64");
        runner.on("apt list -a docker-ce-cli", "docker-ce-cli/jammy 5:20.10.24~3-0~ubuntu-jammy amd64");
        let mut config = KubesmithConfig {
            nodes: vec![node_config("m1", "10.0.0.1", Role::Master)],
            ..KubesmithConfig::default()
        };
        configure(&mut config);
        let shell = Shell::new(Arc::clone(runner) as Arc<dyn Executor>);
        RunContext::new(config, shell).unwrap()
    }

    #[test]
    fn daemon_config_carries_cgroup_driver_and_registries() {
        let runner = Arc::new(ScriptedRunner::new());
        let ctx = ubuntu_context(&runner, |config| {
            config.containerd.insecure_registries = vec!["registry.local:5000".into()];
        });

        let json: serde_json::Value = serde_json::from_str(&daemon_config(&ctx).unwrap()).unwrap();

        assert_eq!(json["exec-opts"][0], "native.cgroupdriver=systemd");
        assert_eq!(json["log-driver"], "json-file");
        assert_eq!(json["log-opts"]["max-file"], "3");
        assert_eq!(json["log-opts"]["max-size"], "100m");
        assert_eq!(json["insecure-registries"][0], "registry.local:5000");
        assert_eq!(json["storage-driver"], "overlay2");
        assert_eq!(json["debug"], false);
    }

    #[tokio::test]
    async fn dockershim_cluster_installs_pinned_docker() {
        let runner = Arc::new(ScriptedRunner::new());
        let ctx = ubuntu_context(&runner, |config| config.versions.kubernetes = "1.23.17".into());
        let node = ctx.plan().first_master().clone();

        install(&ctx, &[&node]).await.unwrap();

        assert!(runner.ran("docker-ce=5:20.10.24~3-0~ubuntu-jammy docker-ce-cli=5:20.10.24~3-0~ubuntu-jammy"));
        assert!(runner
            .stdin_of(DAEMON_CONFIG_PATH)
            .unwrap()
            .contains("native.cgroupdriver=systemd"));
        assert!(runner.ran("sudo gpasswd -a $USER docker"));
        assert!(!runner.ran("apt-get purge"));
        assert!(!runner.ran("containerd config default"));
        let docker = runner.position("systemctl restart docker").unwrap();
        let containerd = runner.position("systemctl restart containerd").unwrap();
        assert!(docker < containerd);
    }

    #[tokio::test]
    async fn running_docker_at_the_wanted_version_is_reconfigured_only() {
        let runner = Arc::new(ScriptedRunner::new());
        let ctx = ubuntu_context(&runner, |config| config.versions.kubernetes = "1.23.17".into());
        runner.on("dpkg --list docker-ce ", DOCKER_CE);
        runner.on("dpkg --list docker-ce-cli", DOCKER_CLI);
        let node = ctx.plan().first_master().clone();

        install(&ctx, &[&node]).await.unwrap();

        assert!(!runner.ran("docker-ce=5:"));
        assert!(!runner.ran("sudo rm -rf /etc/docker"));
        let stopped = runner.position("sudo systemctl stop docker").unwrap();
        let written = runner.position("/etc/docker/daemon.json").unwrap();
        assert!(stopped < written);
        assert!(runner.ran("sudo groupadd docker -f"));
    }

    #[tokio::test]
    async fn prune_purges_conflicts_and_data_before_reinstalling() {
        let runner = Arc::new(ScriptedRunner::new());
        let ctx = ubuntu_context(&runner, |config| {
            config.docker.enabled = true;
            config.docker.prune = true;
        });
        // Installed until purged.
        runner.sequence("dpkg --list docker-ce ", &[DOCKER_CE, DOCKER_CE, ""]);
        let node = ctx.plan().first_master().clone();

        install(&ctx, &[&node]).await.unwrap();

        let purged = runner.position("sudo apt-get purge -y docker-ce --allow-change-held-packages").unwrap();
        let wiped = runner.position("sudo rm -rf /var/lib/docker /var/lib/containerd").unwrap();
        let installed = runner.position("docker-ce=5:20.10.24~3-0~ubuntu-jammy").unwrap();
        assert!(purged < wiped && wiped < installed);
        // 1.24 and later still talk to containerd directly.
        assert!(runner.ran("containerd config default"));
    }

    const NEWER_CLI: &str = "ii  docker-ce-cli  5:24.0.7-1~ubuntu.22.04~jammy  amd64  Docker CLI";

    #[tokio::test]
    async fn other_docker_version_is_replaced() {
        let runner = Arc::new(ScriptedRunner::new());
        let ctx = ubuntu_context(&runner, |config| config.versions.kubernetes = "1.22.4".into());
        runner.sequence(
            "dpkg --list docker-ce-cli",
            &[NEWER_CLI, NEWER_CLI, ""],
        );
        let node = ctx.plan().first_master().clone();

        install(&ctx, &[&node]).await.unwrap();

        assert!(runner.ran("sudo apt-get purge -y docker-ce-cli"));
        assert!(!runner.ran("/var/lib/docker"));
        assert!(runner.ran("docker-ce-cli=5:20.10.24~3-0~ubuntu-jammy"));
    }

    #[test]
    fn hosts_file_allows_plain_http() {
        let hosts = registry_hosts("registry.local:5000");
        assert!(hosts.starts_with("[host.\"http://registry.local:5000\"]"));
        assert!(hosts.contains("skip_verify = true"));
    }

    #[test]
    fn default_config_uses_systemd_and_default_sandbox() {
        let runner = Arc::new(ScriptedRunner::new());
        let ctx = context(&runner, vec![node_config("m1", "10.0.0.1", Role::Master)]);

        let commands = config_commands(&ctx);

        assert!(commands.iter().any(|c| c.contains("SystemdCgroup = true")));
        assert!(commands
            .iter()
            .any(|c| c.contains("sandbox_image = \"registry.k8s.io/pause:3.9\"")));
        assert!(!commands.iter().any(|c| c.contains("config_path")));
    }

    #[tokio::test]
    async fn insecure_registries_get_host_files() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("os-release", "Rocky Linux");
        let mut config = KubesmithConfig {
            nodes: vec![node_config("m1", "10.0.0.1", Role::Master)],
            ..KubesmithConfig::default()
        };
        config.containerd.insecure_registries = vec!["registry.local:5000".into()];
        let shell = Shell::new(Arc::clone(&runner) as Arc<dyn Executor>);
        let ctx = RunContext::new(config, shell).unwrap();
        let node = ctx.plan().first_master().clone();

        install(&ctx, &[&node]).await.unwrap();

        assert!(runner.ran("dnf install -y --setopt=obsoletes=0 containerd.io"));
        assert!(runner.ran("config_path = \"/etc/containerd/certs.d\""));
        assert!(runner.ran("\"$staging\" /etc/containerd/certs.d/registry.local:5000/hosts.toml"));
        assert!(!runner.ran("docker-ce"));
        assert!(!runner.ran(DAEMON_CONFIG_PATH));
        let configured = runner.position("containerd config default").unwrap();
        let restarted = runner.position("systemctl restart containerd").unwrap();
        assert!(configured < restarted);
    }
}
