//! kubeadm join commands and the steps around them.

use tracing::{debug, info};

use crate::context::{RunContext, KUBEADM_CONFIG_PATH};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::kubeadm::{certificate_key, certificate_key_command};
use crate::plan::Node;

/// Kernel settings kubeadm's preflight checks require.
pub const SYSCTL_PROFILE: &str = "\
net.bridge.bridge-nf-call-ip6tables = 1
net.bridge.bridge-nf-call-iptables = 1
net.ipv4.ip_forward = 1
";

/// Where [`SYSCTL_PROFILE`] is installed.
pub const SYSCTL_PATH: &str = "/etc/sysctl.d/kubernetes.conf";

/// A join command printed by `kubeadm token create --print-join-command`.
#[derive(Clone, PartialEq, Eq)]
pub struct JoinToken {
    command: String,
}

impl std::fmt::Debug for JoinToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinToken").finish_non_exhaustive()
    }
}

impl JoinToken {
    /// Wrap a printed join command.
    pub fn new(command: impl Into<String>) -> OrchestratorResult<Self> {
        let command = command.into().trim().to_owned();
        if !command.starts_with("kubeadm join") {
            return Err(OrchestratorError::config(
                "kubeadm did not print a join command",
            ));
        }
        Ok(Self { command })
    }

    /// Command joining `node` as a worker.
    #[must_use]
    pub fn worker_command(&self) -> String {
        format!("sudo {}", self.command)
    }

    /// Command joining `node` as a control plane member.
    #[must_use]
    pub fn master_command(&self, node: &Node) -> String {
        format!(
            "sudo {} --apiserver-advertise-address={}",
            self.command, node.ip
        )
    }
}

/// Mint a certificate key on the first master.
pub async fn mint_certificate_key(ctx: &RunContext) -> OrchestratorResult<String> {
    let first = ctx.plan().first_master().target();
    let key = ctx
        .shell()
        .run(&first, certificate_key_command(&ctx.versions().kubernetes))
        .await?;
    Ok(key.trim().to_owned())
}

/// The certificate key from the config written on the first master.
pub async fn stored_certificate_key(ctx: &RunContext) -> OrchestratorResult<String> {
    let first = ctx.plan().first_master().target();
    let written = ctx.shell().read_file(&first, KUBEADM_CONFIG_PATH).await?;
    certificate_key(&written)
        .ok_or_else(|| OrchestratorError::config("no certificate key in the kubeadm config"))
}

/// Re-upload the control plane certificates and return the new key.
///
/// Uploaded certificates expire after two hours, so a later master join needs
/// a fresh upload.
pub async fn upload_certificates(ctx: &RunContext) -> OrchestratorResult<String> {
    let first = ctx.plan().first_master().target();
    let output = ctx
        .shell()
        .run(
            &first,
            &format!("sudo kubeadm init phase upload-certs --upload-certs --config {KUBEADM_CONFIG_PATH}"),
        )
        .await?;
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .map(str::to_owned)
        .ok_or_else(|| OrchestratorError::config("kubeadm printed no certificate key"))
}

/// Join command for control plane members.
pub async fn master_token(ctx: &RunContext, certificate_key: &str) -> OrchestratorResult<JoinToken> {
    let first = ctx.plan().first_master().target();
    let output = ctx
        .shell()
        .run_redacted(
            &first,
            &format!(
                "sudo kubeadm token create --print-join-command --certificate-key {certificate_key}"
            ),
            certificate_key,
        )
        .await?;
    JoinToken::new(output)
}

/// Join command for workers.
pub async fn worker_token(ctx: &RunContext) -> OrchestratorResult<JoinToken> {
    let first = ctx.plan().first_master().target();
    let output = ctx
        .shell()
        .run(&first, "sudo kubeadm token create --print-join-command")
        .await?;
    JoinToken::new(output)
}

/// Install the kernel settings kubeadm expects on `node`.
pub async fn apply_sysctl(ctx: &RunContext, node: &Node) -> OrchestratorResult<()> {
    let shell = ctx.shell();
    let target = node.target();
    shell
        .write_file(&target, SYSCTL_PATH, SYSCTL_PROFILE.as_bytes())
        .await?;
    shell.run(&target, "sudo modprobe br_netfilter || true").await?;
    shell.run(&target, "sudo sysctl --system").await?;
    debug!(node = %node.ip, "applied kubernetes sysctl profile");
    Ok(())
}

/// Run `command` on `node`, reporting failure as a join failure.
pub async fn join(ctx: &RunContext, node: &Node, command: &str) -> OrchestratorResult<()> {
    info!(node = %node.ip, hostname = %node.hostname, role = %node.role, "joining cluster");
    ctx.shell()
        .run(&node.target(), command)
        .await
        .map_err(|e| OrchestratorError::join_failed(&node.hostname, e))?;
    info!(node = %node.ip, hostname = %node.hostname, "joined cluster");
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

    const PRINTED: &str =
        "kubeadm join 10.0.0.100:6443 --token abc.def --discovery-token-ca-cert-hash sha256:00";

    #[test]
    fn commands_are_built_per_role() {
        let token = JoinToken::new(format!("{PRINTED} --control-plane --certificate-key k")).unwrap();
        let node = Node {
            hostname: "m2".into(),
            ip: "10.0.0.2".parse().unwrap(),
            role: Role::Master,
            interface: "eth0".into(),
        };
        assert!(token
            .master_command(&node)
            .ends_with("--certificate-key k --apiserver-advertise-address=10.0.0.2"));
        assert!(JoinToken::new(PRINTED)
            .unwrap()
            .worker_command()
            .starts_with("sudo kubeadm join"));
    }

    #[test]
    fn garbage_is_not_a_join_command() {
        assert!(JoinToken::new("error: token expired").is_err());
    }

    #[test]
    fn token_debug_hides_the_command() {
        let token = JoinToken::new(PRINTED).unwrap();
        assert!(!format!("{token:?}").contains("abc.def"));
    }

    #[tokio::test]
    async fn upload_returns_the_last_line() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(
            "upload-certs",
            "[upload-certs] Storing the certificates in Secret \"kubeadm-certs\"\n[upload-certs] Using certificate key:\ne6a2eb8581237ab72a4f494f30285ec12a9694d750b9785706a83bfcbbbd2204",
        );
        let ctx = context(&runner, vec![node_config("m1", "10.0.0.1", Role::Master)]);

        let key = upload_certificates(&ctx).await.unwrap();

        assert_eq!(
            key,
            "e6a2eb8581237ab72a4f494f30285ec12a9694d750b9785706a83bfcbbbd2204"
        );
    }

    #[tokio::test]
    async fn failed_join_names_the_node() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("kubeadm join", 1, "preflight failed");
        let ctx = context(
            &runner,
            vec![
                node_config("m1", "10.0.0.1", Role::Master),
                node_config("w1", "10.0.0.2", Role::Worker),
            ],
        );
        let worker = ctx.plan().node("w1").unwrap().clone();
        let token = JoinToken::new(PRINTED).unwrap();

        let err = join(&ctx, &worker, &token.worker_command()).await.unwrap_err();

        assert!(matches!(err, OrchestratorError::JoinFailed { ref node, .. } if node == "w1"));
    }
}
