//! External etcd for multi-master clusters.
//!
//! Every master runs an etcd member secured with the shared PKI. The cluster
//! is formed statically: each unit lists every master in `--initial-cluster`,
//! and the first master polls `etcdctl member list` until every member reports
//! `started`.

use std::fmt;

use tracing::{debug, info, warn};

use crate::archive::{distribute, Archive};
use crate::context::RunContext;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::pki::{CA_CERT_PATH, ETCD_CERT_PATH, ETCD_KEY_PATH};
use crate::plan::Node;
use crate::retry::{poll_until, Clock, Outcome, Poll, RetryPolicy};
use crate::template::render;

const UNIT_TEMPLATE: &str = include_str!("../resources/etcd.service");

/// Installed unit file.
pub const UNIT_PATH: &str = "/etc/systemd/system/etcd.service";

/// Member data directory.
pub const DATA_DIR: &str = "/var/lib/etcd";

const VERSION_QUERY: &str = "etcd --version | head -1 | cut -d: -f2 | xargs";

// =============================================================================
// Member list decoding
// =============================================================================

/// One row of `etcdctl member list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Hex member id.
    pub id: String,
    /// `started` or `unstarted`.
    pub status: String,
    /// Member name; empty until the member starts.
    pub name: String,
}

impl Member {
    /// Returns true if the member has started.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.status == "started"
    }
}

/// Decoded `etcdctl member list` output.
///
/// Rows look like `id, status, name, peer-urls, client-urls, is-learner`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberList {
    /// Members in output order.
    pub members: Vec<Member>,
}

impl MemberList {
    /// Decode the simple table format. Rows with fewer than three fields are
    /// skipped.
    #[must_use]
    pub fn parse(output: &str) -> Self {
        let members = output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter_map(|line| {
                let mut fields = line.split(", ");
                let id = fields.next()?;
                let status = fields.next()?;
                let name = fields.next()?;
                Some(Member {
                    id: id.to_owned(),
                    status: status.to_owned(),
                    name: name.to_owned(),
                })
            })
            .collect();
        Self { members }
    }

    /// Number of started members.
    #[must_use]
    pub fn started(&self) -> usize {
        self.members.iter().filter(|m| m.is_started()).count()
    }

    /// Members not yet started, by name or id when unnamed.
    #[must_use]
    pub fn not_started(&self) -> Vec<&str> {
        self.members
            .iter()
            .filter(|m| !m.is_started())
            .map(|m| if m.name.is_empty() { m.id.as_str() } else { m.name.as_str() })
            .collect()
    }

    /// Returns true when there is at least one member and all have started.
    #[must_use]
    pub fn all_started(&self) -> bool {
        !self.members.is_empty() && self.members.iter().all(Member::is_started)
    }
}

impl fmt::Display for MemberList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} started", self.started(), self.members.len())
    }
}

// =============================================================================
// Bootstrap
// =============================================================================

/// Unit file for `node` in a cluster of `initial_cluster` members.
#[must_use]
pub fn unit_file(node: &Node, initial_cluster: &str) -> String {
    render(
        UNIT_TEMPLATE,
        &[
            ("HOST_IP", &node.ip.to_string()),
            ("HOSTNAME", &node.hostname),
            ("CLUSTER_ADDRESSES", initial_cluster),
        ],
    )
    .replace("\\\n", "")
}

/// Install, configure and start etcd on every master, then wait for quorum.
pub async fn bootstrap(ctx: &RunContext) -> OrchestratorResult<MemberList> {
    let masters: Vec<&Node> = ctx.plan().masters().collect();
    let version = ctx.versions().etcd.clone();
    let shell = ctx.shell();

    let mut pending = Vec::new();
    for master in &masters {
        let installed = ctx.probe(&master.target(), VERSION_QUERY).await?;
        if installed.as_deref() == Some(version.as_str()) {
            info!(node = %master.ip, %version, "etcd already installed");
        } else {
            pending.push(*master);
        }
    }

    let archive = Archive::from_template(&ctx.config().etcd.download_url, &version)?;
    distribute(ctx, &archive, &pending).await?;

    for master in &masters {
        let target = master.target();
        shell
            .run(
                &target,
                "grep -qxF 'ETCDCTL_API=3' /etc/environment || echo 'ETCDCTL_API=3' | sudo tee -a /etc/environment",
            )
            .await?;
        shell.run(&target, "sudo service etcd stop || true").await?;
        if pending.iter().any(|p| p.ip == master.ip) {
            for binary in ["etcd", "etcdctl"] {
                let path = shell.run(&target, &format!("which {binary} || true")).await?;
                if !path.is_empty() {
                    debug!(node = %master.ip, %path, "removing previous binary");
                    shell.run(&target, &format!("sudo rm -rf {path}")).await?;
                }
            }
        }
        shell.run(&target, &format!("sudo rm -rf {DATA_DIR}")).await?;
    }

    for master in &pending {
        let target = master.target();
        info!(node = %master.ip, %version, "installing etcd");
        shell.run(&target, &archive.extract_command()).await?;
        shell
            .run(
                &target,
                &format!("sudo cp {}/etcd* /usr/bin/", archive.extracted_dir()),
            )
            .await?;
        shell.run(&target, "sudo chmod +x /usr/bin/etcd*").await?;
    }

    let initial_cluster = ctx.plan().etcd_initial_cluster();
    for master in &masters {
        let target = master.target();
        info!(node = %master.ip, "starting etcd");
        shell.run(&target, &format!("sudo mkdir -p {DATA_DIR}")).await?;
        shell
            .write_file(
                &target,
                UNIT_PATH,
                unit_file(master, &initial_cluster).as_bytes(),
            )
            .await?;
        shell.run(&target, "sudo systemctl daemon-reload").await?;
        shell.run(&target, "sudo systemctl enable etcd").await?;
        shell.run(&target, "sudo systemctl start --no-block etcd").await?;
    }

    wait_for_quorum(ctx, RetryPolicy::QUORUM).await
}

/// Poll the member list on the first master until every member has started.
///
/// Members need a moment to find each other after `systemctl start`, so the
/// first poll comes one interval after the call.
pub async fn wait_for_quorum(ctx: &RunContext, policy: RetryPolicy) -> OrchestratorResult<MemberList> {
    let first = ctx.plan().first_master().target();
    let expected = ctx.plan().masters().count();
    let command = format!(
        "sudo etcdctl --endpoints={} --cacert={CA_CERT_PATH} --cert={ETCD_CERT_PATH} --key={ETCD_KEY_PATH} member list",
        ctx.plan().etcd_endpoints().join(",")
    );

    ctx.clock().sleep(policy.interval).await;
    let outcome = poll_until(policy, ctx.clock(), "etcd quorum", |attempt| {
        let command = &command;
        async move {
            let members = ctx
                .probe(&first, command)
                .await?
                .map(|out| MemberList::parse(&out))
                .unwrap_or_default();
            if members.all_started() {
                return Ok(Poll::Ready(members));
            }
            debug!(attempt, waiting = ?members.not_started(), "etcd members not started yet");
            Ok(Poll::Pending(members))
        }
    })
    .await?;

    match outcome {
        Outcome::Ready { value, .. } => {
            info!(members = %value, "etcd quorum reached");
            Ok(value)
        }
        Outcome::Exhausted { last, attempts } => {
            warn!(members = %last, "etcd did not reach quorum");
            Err(OrchestratorError::QuorumTimeout {
                attempts,
                started: last.started(),
                expected,
            })
        }
    }
}

/// Stop any etcd left on single-master nodes and drop its data.
///
/// kubeadm runs a stacked etcd there, which refuses to start over a stale data
/// directory.
pub async fn clear_stale(ctx: &RunContext) -> OrchestratorResult<()> {
    for master in ctx.plan().masters() {
        let target = master.target();
        ctx.shell()
            .run(&target, "sudo service etcd stop || true")
            .await?;
        ctx.shell()
            .run(&target, &format!("sudo rm -rf {DATA_DIR}"))
            .await?;
    }
    Ok(())
}
