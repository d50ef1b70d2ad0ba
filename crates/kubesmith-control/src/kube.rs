//! kubectl helpers run on the first master.

use std::fmt;

use serde_yaml::Value;
use tracing::{debug, info, warn};

use crate::context::RunContext;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::plan::{Node, API_SERVER_PORT};
use crate::retry::{poll_until, Outcome, Poll, RetryPolicy};

/// Cluster admin kubeconfig written by kubeadm.
pub const ADMIN_CONF: &str = "/etc/kubernetes/admin.conf";

/// kubelet kubeconfig written by kubeadm.
pub const KUBELET_CONF: &str = "/etc/kubernetes/kubelet.conf";

/// Namespace of the control plane pods.
pub const KUBE_SYSTEM: &str = "kube-system";

// =============================================================================
// Pod status decoding
// =============================================================================

/// One row of `kubectl get pods --no-headers`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodStatus {
    /// Pod name.
    pub name: String,
    /// Ready containers.
    pub ready: u32,
    /// Containers in the pod.
    pub total: u32,
    /// Status column, e.g. `Running`.
    pub phase: String,
}

impl PodStatus {
    /// Decode a row without a namespace column.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let name = fields.next()?;
        let (ready, total) = fields.next()?.split_once('/')?;
        let phase = fields.next()?;
        Some(Self {
            name: name.to_owned(),
            ready: ready.parse().ok()?,
            total: total.parse().ok()?,
            phase: phase.to_owned(),
        })
    }

    /// Decode every row of a listing, skipping rows that do not parse.
    #[must_use]
    pub fn parse_all(output: &str) -> Vec<Self> {
        output.lines().filter_map(Self::parse).collect()
    }

    /// Returns true when every container is ready or the pod has completed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        (self.total > 0 && self.ready == self.total) || self.phase == "Completed"
    }
}

impl fmt::Display for PodStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{} {}", self.name, self.ready, self.total, self.phase)
    }
}

/// Static control plane pods of master `hostname`.
#[must_use]
pub fn control_plane_pods(hostname: &str) -> Vec<String> {
    ["kube-apiserver", "kube-scheduler", "kube-controller-manager"]
        .iter()
        .map(|component| format!("{component}-{hostname}"))
        .collect()
}

// =============================================================================
// Waits
// =============================================================================

/// Wait until every pod in `names` exists in `namespace` and is ready.
pub async fn wait_for_pods(
    ctx: &RunContext,
    names: &[String],
    namespace: &str,
    policy: RetryPolicy,
) -> OrchestratorResult<()> {
    let first = ctx.plan().first_master().target();
    let command = format!(
        "kubectl get pods --ignore-not-found --no-headers -n {namespace} {}",
        names.join(" ")
    );
    info!(pods = %names.join(", "), "waiting for pods");

    let outcome = poll_until(policy, ctx.clock(), "pods ready", |attempt| {
        let command = &command;
        async move {
            let pods = ctx
                .probe(&first, command)
                .await?
                .map(|out| PodStatus::parse_all(&out))
                .unwrap_or_default();
            let waiting: Vec<String> = names
                .iter()
                .filter(|name| !pods.iter().any(|p| &p.name == *name && p.is_ready()))
                .cloned()
                .collect();
            if waiting.is_empty() {
                return Ok(Poll::Ready(waiting));
            }
            debug!(attempt, waiting = %waiting.join(", "), "pods not ready");
            Ok(Poll::Pending(waiting))
        }
    })
    .await;

    match outcome? {
        Outcome::Ready { .. } => Ok(()),
        Outcome::Exhausted { last, attempts } => Err(OrchestratorError::PodsNotReady {
            pods: last.join(", "),
            attempts,
        }),
    }
}

/// Wait until `namespace` has pods and all of them are ready.
pub async fn wait_for_namespace(
    ctx: &RunContext,
    namespace: &str,
    policy: RetryPolicy,
) -> OrchestratorResult<()> {
    let first = ctx.plan().first_master().target();
    let command = format!("kubectl get pods --no-headers -n {namespace}");
    info!(%namespace, "waiting for every pod");

    let outcome = poll_until(policy, ctx.clock(), "namespace ready", |attempt| {
        let command = &command;
        async move {
            let pods = ctx
                .probe(&first, command)
                .await?
                .map(|out| PodStatus::parse_all(&out))
                .unwrap_or_default();
            let waiting: Vec<String> = pods
                .iter()
                .filter(|p| !p.is_ready())
                .map(|p| p.name.clone())
                .collect();
            if !pods.is_empty() && waiting.is_empty() {
                return Ok(Poll::Ready(waiting));
            }
            debug!(attempt, not_ready = waiting.len(), "namespace not converged");
            Ok(Poll::Pending(waiting))
        }
    })
    .await;

    match outcome? {
        Outcome::Ready { .. } => {
            info!(%namespace, "all pods ready");
            Ok(())
        }
        Outcome::Exhausted { last, attempts } => Err(OrchestratorError::PodsNotReady {
            pods: if last.is_empty() {
                format!("pods in {namespace}")
            } else {
                last.join(", ")
            },
            attempts,
        }),
    }
}

// =============================================================================
// Kubeconfig handling
// =============================================================================

/// Point the first cluster entry of `kubeconfig` at `server`.
pub fn set_server(kubeconfig: &str, server: &str) -> OrchestratorResult<String> {
    let mut doc: Value = serde_yaml::from_str(kubeconfig)?;
    let slot = doc
        .get_mut("clusters")
        .and_then(|clusters| clusters.get_mut(0))
        .and_then(|entry| entry.get_mut("cluster"))
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| OrchestratorError::config("kubeconfig has no cluster entry"))?;
    slot.insert(Value::from("server"), Value::from(server));
    Ok(serde_yaml::to_string(&doc)?)
}

/// Point the admin and kubelet kubeconfigs of `master` at its own API server.
pub async fn use_local_api_server(ctx: &RunContext, master: &Node) -> OrchestratorResult<()> {
    let shell = ctx.shell();
    let target = master.target();
    let server = format!("https://{}:{API_SERVER_PORT}", master.ip);
    for path in [ADMIN_CONF, KUBELET_CONF] {
        let current = shell.read_file(&target, path).await?;
        let patched = set_server(&current, &server)?;
        shell
            .write_file_with_mode(&target, path, patched.as_bytes(), 0o600)
            .await?;
        debug!(node = %master.ip, %path, %server, "patched kubeconfig server");
    }
    Ok(())
}

/// Copy the admin kubeconfig to the login user's home, and root's if asked.
pub async fn copy_admin_config(ctx: &RunContext, master: &Node, root: bool) -> OrchestratorResult<()> {
    let shell = ctx.shell();
    let target = master.target();
    shell.run(&target, "mkdir -p $HOME/.kube").await?;
    shell
        .run(&target, &format!("sudo cp {ADMIN_CONF} $HOME/.kube/config"))
        .await?;
    shell
        .run(&target, "sudo chown $(id -u):$(id -g) $HOME/.kube/config")
        .await?;
    if root {
        shell.run(&target, "sudo mkdir -p /root/.kube").await?;
        shell
            .run(&target, &format!("sudo cp {ADMIN_CONF} /root/.kube/config"))
            .await?;
    }
    Ok(())
}

/// Set `KEY=value` on a workload in `kube-system`.
pub async fn set_env(ctx: &RunContext, workload: &str, env: &str) -> OrchestratorResult<()> {
    let first = ctx.plan().first_master().target();
    ctx.shell()
        .run(
            &first,
            &format!("kubectl set env {workload} -n {KUBE_SYSTEM} '{env}'"),
        )
        .await?;
    Ok(())
}

/// Let workloads schedule on masters.
pub async fn remove_master_taints(ctx: &RunContext) -> OrchestratorResult<()> {
    let first = ctx.plan().first_master().target();
    for taint in ["node-role.kubernetes.io/master-", "node-role.kubernetes.io/control-plane-"] {
        if !ctx
            .shell()
            .run_status(&first, &format!("kubectl taint nodes --all {taint}"))
            .await?
        {
            warn!(%taint, "taint not present");
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use kubesmith_remote::testing::ScriptedRunner;

    use crate::context::tests::{context, node_config};
    use crate::plan::Role;
    use crate::retry::RetryPolicy;

    const KUBECONFIG: &str = "\
apiVersion: v1
clusters:
- cluster:
    certificate-authority-data: Zm9v
    server: https://10.0.0.100:6443
  name: kubernetes
contexts:
- context:
    cluster: kubernetes
    user: kubernetes-admin
  name: kubernetes-admin@kubernetes
current-context: kubernetes-admin@kubernetes
kind: Config
";

    #[test]
    fn pod_rows_decode() {
        let pod = PodStatus::parse("kube-apiserver-m1   1/1   Running   0   2m").unwrap();
        assert_eq!(pod.name, "kube-apiserver-m1");
        assert!(pod.is_ready());
        assert!(!PodStatus::parse("coredns-5d78c9869d-abcde 0/1 ContainerCreating 0 5s")
            .unwrap()
            .is_ready());
        assert!(PodStatus::parse("job-x 0/1 Completed 0 1m").unwrap().is_ready());
        assert!(PodStatus::parse("No resources found").is_none());
    }

    #[test]
    fn control_plane_pod_names() {
        assert_eq!(
            control_plane_pods("m2"),
            [
                "kube-apiserver-m2",
                "kube-scheduler-m2",
                "kube-controller-manager-m2"
            ]
        );
    }

    #[test]
    fn server_is_rewritten_and_rest_kept() {
        let patched = set_server(KUBECONFIG, "https://10.0.0.2:6443").unwrap();
        let doc: Value = serde_yaml::from_str(&patched).unwrap();
        assert_eq!(doc["clusters"][0]["cluster"]["server"], "https://10.0.0.2:6443");
        assert_eq!(
            doc["clusters"][0]["cluster"]["certificate-authority-data"],
            "Zm9v"
        );
        assert_eq!(doc["current-context"], "kubernetes-admin@kubernetes");
    }

    #[test]
    fn kubeconfig_without_clusters_is_rejected() {
        assert!(set_server("kind: Config\n", "https://x:6443").is_err());
    }

    #[tokio::test]
    async fn pod_wait_retries_until_ready() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.sequence(
            "kubectl get pods --ignore-not-found",
            &[
                "kube-apiserver-m1 0/1 Running 0 5s",
                "kube-apiserver-m1 1/1 Running 0 15s\nkube-scheduler-m1 1/1 Running 0 15s\nkube-controller-manager-m1 1/1 Running 0 15s",
            ],
        );
        let ctx = context(&runner, vec![node_config("m1", "10.0.0.1", Role::Master)]);

        wait_for_pods(&ctx, &control_plane_pods("m1"), KUBE_SYSTEM, RetryPolicy::PODS)
            .await
            .unwrap();

        assert_eq!(runner.count("kubectl get pods --ignore-not-found"), 2);
    }

    #[tokio::test]
    async fn pod_wait_reports_stragglers() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(
            "kubectl get pods --ignore-not-found",
            "kube-apiserver-m1 1/1 Running 0 5s",
        );
        let ctx = context(&runner, vec![node_config("m1", "10.0.0.1", Role::Master)]);

        let err = wait_for_pods(
            &ctx,
            &control_plane_pods("m1"),
            KUBE_SYSTEM,
            RetryPolicy::new(std::time::Duration::from_secs(1), 3),
        )
        .await
        .unwrap_err();

        match err {
            OrchestratorError::PodsNotReady { pods, attempts } => {
                assert_eq!(pods, "kube-scheduler-m1, kube-controller-manager-m1");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn namespace_wait_needs_pods() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.sequence(
            "kubectl get pods --no-headers -n kube-system",
            &["", "coredns-a 0/1 Pending 0 1s", "coredns-a 1/1 Running 0 9s"],
        );
        let ctx = context(&runner, vec![node_config("m1", "10.0.0.1", Role::Master)]);

        wait_for_namespace(&ctx, KUBE_SYSTEM, RetryPolicy::CONVERGENCE)
            .await
            .unwrap();

        assert_eq!(runner.count("kubectl get pods --no-headers -n kube-system"), 3);
    }

    #[tokio::test]
    async fn local_api_server_patch_rewrites_both_files() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("sudo cat /etc/kubernetes/", KUBECONFIG);
        let ctx = context(
            &runner,
            vec![
                node_config("m1", "10.0.0.1", Role::Master),
                node_config("m2", "10.0.0.2", Role::Master),
            ],
        );
        let m2 = ctx.plan().node("m2").unwrap().clone();

        use_local_api_server(&ctx, &m2).await.unwrap();

        assert!(runner
            .stdin_of(ADMIN_CONF)
            .unwrap()
            .contains("server: https://10.0.0.2:6443"));
        assert!(runner
            .stdin_of(KUBELET_CONF)
            .unwrap()
            .contains("server: https://10.0.0.2:6443"));
    }
}
