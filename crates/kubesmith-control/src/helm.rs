//! helm on every master.

use tracing::{debug, info};

use crate::archive::{distribute, Archive};
use crate::context::{RunContext, NODE_TMP_DIR};
use crate::error::OrchestratorResult;
use crate::plan::Node;

const VERSION_QUERY: &str = "helm version --short | cut -d+ -f1 | cut -dv -f2 | xargs";

/// Install the configured helm release on every master that lacks it.
pub async fn install(ctx: &RunContext) -> OrchestratorResult<()> {
    let version = ctx.versions().helm.clone();

    let mut pending = Vec::new();
    for master in ctx.plan().masters() {
        let installed = ctx.probe(&master.target(), VERSION_QUERY).await?;
        if installed.as_deref() == Some(version.as_str()) {
            info!(node = %master.ip, %version, "helm already installed");
        } else {
            pending.push(master);
        }
    }
    if pending.is_empty() {
        return Ok(());
    }

    let archive = Archive::from_template(&ctx.config().helm.download_url, &version)?;
    distribute(ctx, &archive, &pending).await?;

    for master in pending.iter().copied() {
        install_on(ctx, master, &archive).await?;
    }
    Ok(())
}

async fn install_on(ctx: &RunContext, master: &Node, archive: &Archive) -> OrchestratorResult<()> {
    let shell = ctx.shell();
    let target = master.target();
    info!(node = %master.ip, version = %ctx.versions().helm, "installing helm");

    let previous = shell.run(&target, "which helm || true").await?;
    if !previous.is_empty() {
        debug!(node = %master.ip, path = %previous, "removing previous helm");
        shell.run(&target, &format!("sudo rm -rf {previous}")).await?;
    }
    shell.run(&target, &archive.extract_command()).await?;
    shell
        .run(&target, &format!("sudo cp {NODE_TMP_DIR}/linux-amd64/helm /usr/bin/"))
        .await?;
    shell.run(&target, "sudo chmod +x /usr/bin/helm").await?;
    Ok(())
}
