//! Implementation of the `kubesmith add node` command.

use colored::Colorize;
use kubesmith_control::orchestrator;

use super::{open_context, spawn_signal_handler, GlobalArgs};

pub async fn run(global: &GlobalArgs, hostname: &str) -> anyhow::Result<()> {
    let ctx = open_context(global)?;
    let signals = spawn_signal_handler(ctx.clone());

    println!("Adding {hostname} to the cluster");
    let result = orchestrator::add_node(&ctx, hostname).await;
    signals.abort();
    result?;

    println!("{}", format!("{hostname} joined the cluster").green());
    Ok(())
}
