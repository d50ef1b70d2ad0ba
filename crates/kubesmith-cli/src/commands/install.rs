//! Implementation of the `kubesmith install` command.

use colored::Colorize;
use kubesmith_control::orchestrator;

use super::{open_context, spawn_signal_handler, GlobalArgs};

pub async fn run(global: &GlobalArgs) -> anyhow::Result<()> {
    let ctx = open_context(global)?;
    let signals = spawn_signal_handler(ctx.clone());

    println!("Installing Kubernetes {}", ctx.versions().kubernetes);
    let result = orchestrator::install(&ctx).await;
    signals.abort();
    result?;

    let plan = ctx.plan();
    println!(
        "{}",
        format!(
            "Cluster ready: {} master(s), {} worker(s)",
            plan.masters().count(),
            plan.workers().count()
        )
        .green()
    );
    Ok(())
}
