//! Typestate for the cluster bring-up sequence.
//!
//! Each step is a method on [`Bringup`] in the state it starts from, so the
//! sequence can only be driven forwards and in order:
//!
//! ```ignore
//! let ready = Bringup::start(&ctx).init_first_master().await?;
//! let masters = ready.join_masters(&others).await?;
//! let workers = masters.join_workers(&workers).await?;
//! workers.converge(&nodes).await?;
//! ```
//!
//! Any failure aborts the sequence. Nothing is rolled back.

use std::marker::PhantomData;

use tracing::info;

use crate::archive::transfer;
use crate::context::{RunContext, KUBEADM_CONFIG_PATH, NODE_TMP_DIR};
use crate::error::OrchestratorResult;
use crate::join::{
    apply_sysctl, join, master_token, mint_certificate_key, stored_certificate_key, worker_token,
};
use crate::kube::{
    control_plane_pods, copy_admin_config, remove_master_taints, set_env, use_local_api_server,
    wait_for_namespace, wait_for_pods, KUBE_SYSTEM,
};
use crate::kubeadm::compose;
use crate::plan::Node;
use crate::retry::RetryPolicy;

// =============================================================================
// State marker types (zero-sized)
// =============================================================================

/// Marker trait for bring-up states.
pub trait BringupState: private::Sealed + Send + Sync {
    /// State name for log lines.
    fn name() -> &'static str;
}

mod private {
    pub trait Sealed {}
}

/// Nodes are prepared; no control plane exists yet.
#[derive(Debug, Clone, Copy)]
pub struct Init;

/// The first master runs a control plane and the pod network.
#[derive(Debug, Clone, Copy)]
pub struct FirstMasterReady;

/// Every master has joined.
#[derive(Debug, Clone, Copy)]
pub struct MastersJoined;

/// Every worker has joined.
#[derive(Debug, Clone, Copy)]
pub struct WorkersJoined;

/// Every system pod is ready.
#[derive(Debug, Clone, Copy)]
pub struct Converged;

impl private::Sealed for Init {}
impl private::Sealed for FirstMasterReady {}
impl private::Sealed for MastersJoined {}
impl private::Sealed for WorkersJoined {}
impl private::Sealed for Converged {}

impl BringupState for Init {
    fn name() -> &'static str {
        "init"
    }
}

impl BringupState for FirstMasterReady {
    fn name() -> &'static str {
        "first-master-ready"
    }
}

impl BringupState for MastersJoined {
    fn name() -> &'static str {
        "masters-joined"
    }
}

impl BringupState for WorkersJoined {
    fn name() -> &'static str {
        "workers-joined"
    }
}

impl BringupState for Converged {
    fn name() -> &'static str {
        "converged"
    }
}

// =============================================================================
// Bring-up parameterised by state
// =============================================================================

/// The bring-up sequence in state `S`.
#[derive(Debug)]
pub struct Bringup<'a, S: BringupState> {
    ctx: &'a RunContext,
    /// Key decrypting the uploaded control plane certificates.
    certificate_key: Option<String>,
    _state: PhantomData<S>,
}

impl<'a, S: BringupState> Bringup<'a, S> {
    /// The state name.
    #[must_use]
    pub fn state_name(&self) -> &'static str {
        S::name()
    }

    fn transition<T: BringupState>(self) -> Bringup<'a, T> {
        info!(from = S::name(), to = T::name(), "bring-up step complete");
        Bringup {
            ctx: self.ctx,
            certificate_key: self.certificate_key,
            _state: PhantomData,
        }
    }
}

impl<'a> Bringup<'a, Init> {
    /// Start a bring-up for a new cluster.
    #[must_use]
    pub const fn start(ctx: &'a RunContext) -> Self {
        Self {
            ctx,
            certificate_key: None,
            _state: PhantomData,
        }
    }

    /// Initialise the control plane on the first master and install the pod
    /// network.
    pub async fn init_first_master(mut self) -> OrchestratorResult<Bringup<'a, FirstMasterReady>> {
        let ctx = self.ctx;
        let shell = ctx.shell();
        let plan = ctx.plan();
        let config = ctx.config();
        let first = plan.first_master();
        let target = first.target();
        info!(node = %first.ip, hostname = %first.hostname, "initialising control plane");

        let certificate_key = mint_certificate_key(ctx).await?;
        let kubeadm_config = compose(
            &ctx.versions().kubernetes,
            plan.control_plane_endpoint(),
            first.ip,
            &certificate_key,
            plan,
            config,
            plan.is_multi_master(),
        )?;
        shell
            .write_file(&target, KUBEADM_CONFIG_PATH, kubeadm_config.as_bytes())
            .await?;
        self.certificate_key = Some(certificate_key);

        apply_sysctl(ctx, first).await?;
        shell
            .run(
                &target,
                &format!("sudo kubeadm init --config {KUBEADM_CONFIG_PATH} --upload-certs"),
            )
            .await?;
        copy_admin_config(ctx, first, true).await?;

        install_pod_network(ctx, first).await?;

        for worker in plan.workers() {
            transfer(ctx, first, worker, "$HOME/.kube/config", ".kube/config").await?;
        }

        for env in &config.kubernetes.calico.env_vars {
            set_env(ctx, "daemonset/calico-node", env).await?;
        }

        wait_for_pods(
            ctx,
            &control_plane_pods(&first.hostname),
            KUBE_SYSTEM,
            RetryPolicy::PODS,
        )
        .await?;
        Ok(self.transition())
    }
}

async fn install_pod_network(ctx: &RunContext, first: &Node) -> OrchestratorResult<()> {
    let shell = ctx.shell();
    let target = first.target();
    let kubernetes = &ctx.config().kubernetes;
    let url = kubernetes.calico.manifest_url(&ctx.versions().calico)?;
    let manifest = format!("{NODE_TMP_DIR}/calico.yaml");
    info!(node = %first.ip, %url, "installing calico");

    shell
        .run(
            &target,
            &format!("rm -f {manifest} && wget -q -O {manifest} {url} --no-check-certificate"),
        )
        .await?;
    if kubernetes.custom_registry() {
        shell
            .run(
                &target,
                &format!("sed -i 's|docker.io|{}|g' {manifest}", kubernetes.image_registry),
            )
            .await?;
    }
    shell
        .run(&target, &format!("kubectl apply -f {manifest}"))
        .await?;
    Ok(())
}

impl<'a> Bringup<'a, FirstMasterReady> {
    /// Pick up a cluster whose first master is already running.
    ///
    /// Without `certificate_key`, master joins read the key back from the
    /// kubeadm config written at init.
    #[must_use]
    pub const fn resume(ctx: &'a RunContext, certificate_key: Option<String>) -> Self {
        Self {
            ctx,
            certificate_key,
            _state: PhantomData,
        }
    }

    /// Join `masters` one after another.
    pub async fn join_masters(mut self, masters: &[&Node]) -> OrchestratorResult<Bringup<'a, MastersJoined>> {
        if masters.is_empty() {
            return Ok(self.transition());
        }
        let ctx = self.ctx;
        let certificate_key = match self.certificate_key.take() {
            Some(key) => key,
            None => stored_certificate_key(ctx).await?,
        };
        let token = master_token(ctx, &certificate_key).await?;
        self.certificate_key = Some(certificate_key);

        for master in masters {
            apply_sysctl(ctx, master).await?;
            join(ctx, master, &token.master_command(master)).await?;
            wait_for_pods(
                ctx,
                &control_plane_pods(&master.hostname),
                KUBE_SYSTEM,
                RetryPolicy::PODS,
            )
            .await?;
            use_local_api_server(ctx, master).await?;
            ctx.shell()
                .run(&master.target(), "sudo systemctl restart kubelet")
                .await?;
            copy_admin_config(ctx, master, false).await?;
        }
        Ok(self.transition())
    }
}

impl<'a> Bringup<'a, MastersJoined> {
    /// Join `workers` one after another.
    pub async fn join_workers(self, workers: &[&Node]) -> OrchestratorResult<Bringup<'a, WorkersJoined>> {
        if workers.is_empty() {
            return Ok(self.transition());
        }
        let ctx = self.ctx;
        let token = worker_token(ctx).await?;
        for worker in workers {
            apply_sysctl(ctx, worker).await?;
            join(ctx, worker, &token.worker_command()).await?;
        }
        Ok(self.transition())
    }
}

impl<'a> Bringup<'a, WorkersJoined> {
    /// Restart containerd on `nodes` and wait for every system pod.
    pub async fn converge(self, nodes: &[&Node]) -> OrchestratorResult<Bringup<'a, Converged>> {
        let ctx = self.ctx;
        if ctx.config().kubernetes.schedule_pods_on_masters {
            remove_master_taints(ctx).await?;
        }
        for node in nodes {
            ctx.shell()
                .run(&node.target(), "sudo systemctl restart containerd")
                .await?;
        }
        wait_for_namespace(ctx, KUBE_SYSTEM, RetryPolicy::CONVERGENCE).await?;
        Ok(self.transition())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use kubesmith_remote::testing::ScriptedRunner;

    use crate::context::tests::{context, node_config};
    use crate::error::OrchestratorError;
    use crate::plan::Role;

    const JOIN: &str = "kubeadm join 10.0.0.1:6443 --token abc.def --discovery-token-ca-cert-hash sha256:00";

    fn healthy_runner() -> Arc<ScriptedRunner> {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("certificate-key", "f00d");
        runner.on("token create", JOIN);
        runner.on(
            "kubectl get pods --ignore-not-found",
            "kube-apiserver-m1 1/1 Running 0 1m\nkube-scheduler-m1 1/1 Running 0 1m\nkube-controller-manager-m1 1/1 Running 0 1m",
        );
        runner.on(
            "kubectl get pods --no-headers -n kube-system",
            "coredns-a 1/1 Running 0 1m",
        );
        runner
    }

    #[test]
    fn states_have_names() {
        let runner = Arc::new(ScriptedRunner::new());
        let ctx = context(&runner, vec![node_config("m1", "10.0.0.1", Role::Master)]);
        assert_eq!(Bringup::start(&ctx).state_name(), "init");
        assert_eq!(
            Bringup::resume(&ctx, None).state_name(),
            "first-master-ready"
        );
    }

    #[tokio::test]
    async fn single_master_initialises_in_order() {
        let runner = healthy_runner();
        let ctx = context(&runner, vec![node_config("m1", "10.0.0.1", Role::Master)]);

        let converged = Bringup::start(&ctx)
            .init_first_master()
            .await
            .unwrap()
            .join_masters(&[])
            .await
            .unwrap()
            .join_workers(&[])
            .await
            .unwrap()
            .converge(&[ctx.plan().first_master()])
            .await
            .unwrap();
        assert_eq!(converged.state_name(), "converged");

        let minted = runner.position("kubeadm certs certificate-key").unwrap();
        let written = runner.position("kubeadm-config.yaml").unwrap();
        let init = runner.position("kubeadm init --config").unwrap();
        let admin = runner.position("sudo cp /etc/kubernetes/admin.conf /root/.kube/config").unwrap();
        let calico = runner.position("kubectl apply -f $HOME/.kubesmith/tmp/calico.yaml").unwrap();
        let pods = runner.position("kubectl get pods --ignore-not-found").unwrap();
        assert!(minted < written && written < init && init < admin && admin < calico && calico < pods);
        assert!(runner
            .stdin_of("kubesmith-kubeadm-config.yaml")
            .unwrap()
            .contains("certificateKey: f00d"));
        assert!(!runner.ran("token create"));
        assert!(!runner.ran("sed -i 's|docker.io|"));
    }

    #[tokio::test]
    async fn masters_read_the_stored_key_when_resumed() {
        let runner = healthy_runner();
        runner.on(
            "sudo cat $HOME/.kubesmith/config/kubeadm-config.yaml",
            "apiVersion: kubeadm.k8s.io/v1beta3\nkind: InitConfiguration\ncertificateKey: beef\n",
        );
        runner.on("sudo cat /etc/kubernetes/", "clusters:\n- cluster:\n    server: https://10.0.0.1:6443\n");
        runner.on(
            "kubectl get pods --ignore-not-found",
            "kube-apiserver-m2 1/1 Running 0 1m\nkube-scheduler-m2 1/1 Running 0 1m\nkube-controller-manager-m2 1/1 Running 0 1m",
        );
        let ctx = context(
            &runner,
            vec![
                node_config("m1", "10.0.0.1", Role::Master),
                node_config("m2", "10.0.0.2", Role::Master),
            ],
        );
        let m2 = ctx.plan().node("m2").unwrap().clone();

        Bringup::resume(&ctx, None)
            .join_masters(&[&m2])
            .await
            .unwrap();

        assert!(runner.ran("token create --print-join-command --certificate-key beef"));
        let joined = runner.position("--apiserver-advertise-address=10.0.0.2").unwrap();
        let patched = runner.position("\"$staging\" /etc/kubernetes/kubelet.conf").unwrap();
        let restarted = runner.position("systemctl restart kubelet").unwrap();
        assert!(joined < patched && patched < restarted);
    }

    #[tokio::test]
    async fn failed_worker_join_aborts() {
        let runner = healthy_runner();
        runner.fail("sudo kubeadm join", 1, "connection refused");
        let ctx = context(
            &runner,
            vec![
                node_config("m1", "10.0.0.1", Role::Master),
                node_config("w1", "10.0.0.2", Role::Worker),
                node_config("w2", "10.0.0.3", Role::Worker),
            ],
        );
        let workers: Vec<&Node> = ctx.plan().workers().collect();

        let err = Bringup::resume(&ctx, None)
            .join_masters(&[])
            .await
            .unwrap()
            .join_workers(&workers)
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::JoinFailed { ref node, .. } if node == "w1"));
        assert_eq!(runner.count("sudo kubeadm join"), 1);
    }
}
