//! Common test utilities for kubesmith-control integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use std::net::IpAddr;
use std::sync::Arc;

use kubesmith_control::config::NodeConfig;
use kubesmith_control::{InstantClock, KubesmithConfig, Role, RunContext};
use kubesmith_remote::testing::ScriptedRunner;
use kubesmith_remote::{Executor, Shell, Target};

/// Join command printed by the scripted first master.
pub const JOIN_COMMAND: &str =
    "kubeadm join 10.0.0.100:6443 --token abc.def --discovery-token-ca-cert-hash sha256:00";

/// A kubeconfig as kubeadm writes it.
pub const KUBECONFIG: &str = "\
apiVersion: v1
clusters:
- cluster:
    certificate-authority-data: Zm9v
    server: https://10.0.0.100:6443
  name: kubernetes
kind: Config
";

/// A cluster plan wired to a scripted runner.
pub struct TestCluster {
    pub runner: Arc<ScriptedRunner>,
    pub ctx: RunContext,
}

impl TestCluster {
    /// A cluster of `nodes` with default settings.
    pub fn new(nodes: &[(&str, &str, Role)]) -> Self {
        Self::with_config(nodes, |_| {})
    }

    /// A cluster of `nodes` with settings adjusted by `configure`.
    pub fn with_config(nodes: &[(&str, &str, Role)], configure: impl FnOnce(&mut KubesmithConfig)) -> Self {
        let mut config = KubesmithConfig {
            nodes: nodes
                .iter()
                .map(|(hostname, ip, role)| node(hostname, ip, *role))
                .collect(),
            ..KubesmithConfig::default()
        };
        configure(&mut config);

        let runner = Arc::new(ScriptedRunner::new());
        let shell = Shell::new(Arc::clone(&runner) as Arc<dyn Executor>);
        let ctx = RunContext::new(config, shell)
            .unwrap()
            .with_clock(Arc::new(InstantClock::new()));
        Self { runner, ctx }
    }

    /// Script every answer a healthy Ubuntu cluster gives.
    pub fn healthy(self) -> Self {
        let masters: Vec<(String, IpAddr)> = self
            .ctx
            .plan()
            .masters()
            .map(|m| (m.hostname.clone(), m.ip))
            .collect();
        let version = self.ctx.versions().kubernetes.to_string();
        let runner = &self.runner;

        runner.on("os-release", "Ubuntu");
        runner.on("grep -qxF", "exist");
        runner.on(
            "sudo apt list -a",
            &["kubelet", "kubectl", "kubeadm"]
                .iter()
                .map(|name| format!("{name}/unknown {version}-1.1 amd64"))
                .collect::<Vec<_>>()
                .join("\n"),
        );
        runner.on("member list", &member_list(&masters, masters.len()));
        runner.on("certificate-key", "0a1b2c3d");
        runner.on("token create", JOIN_COMMAND);
        runner.on("kubectl get pods --ignore-not-found", &control_plane_rows(&masters));
        runner.on(
            "kubectl get pods --no-headers -n kube-system",
            "coredns-5d78c9869d-abcde 1/1 Running 0 1m\ncalico-node-xyz12 1/1 Running 0 1m",
        );
        runner.on("sudo cat /etc/kubernetes/", KUBECONFIG);
        self
    }

    /// Index of the first call on `ip` containing `pattern`.
    pub fn first_on(&self, ip: &str, pattern: &str) -> Option<usize> {
        let target = Target::Node(ip.parse().unwrap());
        self.runner
            .calls()
            .iter()
            .position(|call| call.target == target && call.command.contains(pattern))
    }

    /// Index of the last call on `ip` containing `pattern`.
    pub fn last_on(&self, ip: &str, pattern: &str) -> Option<usize> {
        let target = Target::Node(ip.parse().unwrap());
        self.runner
            .calls()
            .iter()
            .rposition(|call| call.target == target && call.command.contains(pattern))
    }

    /// Number of calls on `ip` containing `pattern`.
    pub fn count_on(&self, ip: &str, pattern: &str) -> usize {
        let target = Target::Node(ip.parse().unwrap());
        self.runner
            .commands_on(target)
            .iter()
            .filter(|command| command.contains(pattern))
            .count()
    }
}

/// A plan node.
pub fn node(hostname: &str, ip: &str, role: Role) -> NodeConfig {
    NodeConfig {
        hostname: hostname.into(),
        ip: ip.parse().unwrap(),
        role,
        interface: "eth0".into(),
        ssh_user: None,
        ssh_password: None,
        ssh_private_key: None,
    }
}

/// `etcdctl member list` output with the first `started` members started.
pub fn member_list(masters: &[(String, IpAddr)], started: usize) -> String {
    masters
        .iter()
        .enumerate()
        .map(|(i, (hostname, ip))| {
            if i < started {
                format!("{i:016x}, started, {hostname}, https://{ip}:2380, https://{ip}:2379, false")
            } else {
                format!("{i:016x}, unstarted, , https://{ip}:2380, , false")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Ready control plane pod rows for every master.
pub fn control_plane_rows(masters: &[(String, IpAddr)]) -> String {
    masters
        .iter()
        .flat_map(|(hostname, _)| {
            ["kube-apiserver", "kube-scheduler", "kube-controller-manager"]
                .map(|component| format!("{component}-{hostname} 1/1 Running 0 1m"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}
