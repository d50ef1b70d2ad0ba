//! The `install` and `add node` pipelines.
//!
//! Steps run one at a time, node by node, in a fixed order. Teardown always
//! runs afterwards, whether the pipeline succeeded or not.

use tracing::{debug, info};

use crate::archive::transfer;
use crate::context::{RunContext, NODE_TMP_DIR};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::join::upload_certificates;
use crate::pki::{self, CertificateBundle, CA_CERT_PATH};
use crate::plan::Node;
use crate::privilege::ensure_sudo;
use crate::state::Bringup;
use crate::teardown::teardown;
use crate::{etcd, helm, keepalived, prepare, runtime};

/// Bring up the whole cluster described by the plan.
pub async fn install(ctx: &RunContext) -> OrchestratorResult<()> {
    let result = run_install(ctx).await;
    teardown(ctx).await;
    result
}

/// Add the node named `hostname` to a running cluster.
pub async fn add_node(ctx: &RunContext, hostname: &str) -> OrchestratorResult<()> {
    let result = run_add_node(ctx, hostname).await;
    teardown(ctx).await;
    result
}

async fn run_install(ctx: &RunContext) -> OrchestratorResult<()> {
    let plan = ctx.plan();
    let nodes: Vec<&Node> = plan.nodes().iter().collect();
    preflight(ctx, &nodes).await?;

    if plan.is_multi_master() {
        info!(masters = plan.masters().count(), "multi-master deployment started");
    } else {
        info!("single-master deployment started");
    }

    provision(ctx, &nodes).await?;

    if plan.is_multi_master() {
        let bundle = ctx.authority().issue(&plan.master_ips())?;
        pki::distribute(ctx.shell(), &bundle, plan.masters()).await?;
        let members = etcd::bootstrap(ctx).await?;
        info!(%members, "etcd cluster healthy");
    } else {
        etcd::clear_stale(ctx).await?;
    }

    helm::install(ctx).await?;
    keepalived::install(ctx).await?;

    let others: Vec<&Node> = plan.masters().skip(1).collect();
    let workers: Vec<&Node> = plan.workers().collect();
    Bringup::start(ctx)
        .init_first_master()
        .await?
        .join_masters(&others)
        .await?
        .join_workers(&workers)
        .await?
        .converge(&nodes)
        .await?;

    info!(nodes = nodes.len(), "cluster is ready");
    Ok(())
}

async fn run_add_node(ctx: &RunContext, hostname: &str) -> OrchestratorResult<()> {
    let plan = ctx.plan();
    let node = plan
        .node(hostname)
        .ok_or_else(|| OrchestratorError::config(format!("no node named {hostname} in the plan")))?;
    let first = plan.first_master();
    if node.ip == first.ip {
        return Err(OrchestratorError::config(format!(
            "{hostname} is the first master; run install instead"
        )));
    }

    // Every node gets the new hostname in /etc/hosts, so all of them are
    // reached, but only the new node is provisioned.
    let everyone: Vec<&Node> = plan.nodes().iter().collect();
    preflight(ctx, &everyone).await?;
    prepare::seed_hosts(ctx, &everyone).await?;
    info!(node = %node.ip, %hostname, role = %node.role, "adding node");
    provision_node_software(ctx, &[node]).await?;

    let bringup = if node.is_master() {
        copy_etcd_certificates(ctx, first, node).await?;
        helm::install(ctx).await?;
        keepalived::install(ctx).await?;
        let certificate_key = upload_certificates(ctx).await?;
        Bringup::resume(ctx, Some(certificate_key))
            .join_masters(&[node])
            .await?
            .join_workers(&[])
            .await?
    } else {
        transfer(ctx, first, node, "$HOME/.kube/config", ".kube/config").await?;
        Bringup::resume(ctx, None)
            .join_masters(&[])
            .await?
            .join_workers(&[node])
            .await?
    };
    bringup.converge(&[node]).await?;

    info!(node = %node.ip, %hostname, "node added");
    Ok(())
}

/// Connect to `nodes`, make sudo passwordless and create the scratch
/// directory.
async fn preflight(ctx: &RunContext, nodes: &[&Node]) -> OrchestratorResult<()> {
    for node in nodes {
        let login = ctx.connect(node).await?;
        debug!(node = %node.ip, user = %login.user, "connected");
        ensure_sudo(ctx, node, &login).await?;
        ctx.shell()
            .run(&node.target(), &format!("mkdir -p {NODE_TMP_DIR}"))
            .await?;
        let dialect = ctx.dialect(node).await?;
        info!(node = %node.ip, hostname = %node.hostname, %dialect, "node ready");
    }
    Ok(())
}

/// Everything that happens on `nodes` before any cluster component starts.
async fn provision(ctx: &RunContext, nodes: &[&Node]) -> OrchestratorResult<()> {
    prepare::seed_hosts(ctx, nodes).await?;
    provision_node_software(ctx, nodes).await
}

async fn provision_node_software(ctx: &RunContext, nodes: &[&Node]) -> OrchestratorResult<()> {
    prepare::add_custom_repos(ctx, nodes).await?;
    prepare::install_packages(ctx, nodes).await?;
    let required = prepare::reset_kubernetes(ctx, nodes).await?;
    prepare::prepare_nodes(ctx, nodes).await?;
    runtime::install(ctx, nodes).await?;
    prepare::install_kube_packages(ctx, nodes, &required).await
}

/// Give a new master the etcd client certificates of an external etcd
/// cluster. Clusters running stacked etcd have none to copy.
async fn copy_etcd_certificates(ctx: &RunContext, first: &Node, master: &Node) -> OrchestratorResult<()> {
    let external = ctx
        .shell()
        .run_status(&first.target(), &format!("sudo test -f {CA_CERT_PATH}"))
        .await?;
    if !external {
        debug!(node = %first.ip, "no external etcd certificates to copy");
        return Ok(());
    }
    let bundle = CertificateBundle::fetch(ctx.shell(), first).await?;
    pki::distribute(ctx.shell(), &bundle, [master]).await
}
