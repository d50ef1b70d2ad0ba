//! keepalived virtual IP in front of the API servers.

use std::net::IpAddr;

use kubesmith_packages::{PackageSpec, ReconcileOptions};
use tracing::info;

use crate::config::KeepalivedConfig;
use crate::context::RunContext;
use crate::error::OrchestratorResult;
use crate::plan::Node;
use crate::template::render;

const CONF_TEMPLATE: &str = include_str!("../resources/keepalived.conf");
const CHECK_TEMPLATE: &str = include_str!("../resources/check_apiserver.sh");

/// keepalived configuration file.
pub const CONF_PATH: &str = "/etc/keepalived/keepalived.conf";

/// API server health check run by keepalived.
pub const CHECK_SCRIPT_PATH: &str = "/etc/keepalived/check_apiserver.sh";

/// `keepalived.conf` for `node`.
#[must_use]
pub fn config_file(node: &Node, settings: &KeepalivedConfig, virtual_ip: IpAddr) -> String {
    render(
        CONF_TEMPLATE,
        &[
            ("INTERFACE", &node.interface),
            ("VIRTUAL_ROUTER_ID", &settings.virtual_router_id.to_string()),
            ("PRIORITY", &settings.priority.to_string()),
            ("AUTH_PASS", &settings.auth_pass),
            ("VIRTUAL_IP", &virtual_ip.to_string()),
        ],
    )
}

/// The health check script.
#[must_use]
pub fn check_script(virtual_ip: IpAddr) -> String {
    render(CHECK_TEMPLATE, &[("VIRTUAL_IP", &virtual_ip.to_string())])
}

/// Install and start keepalived on every master. Does nothing without a
/// virtual IP.
pub async fn install(ctx: &RunContext) -> OrchestratorResult<()> {
    let Some(virtual_ip) = ctx.plan().virtual_ip() else {
        return Ok(());
    };
    let shell = ctx.shell();
    let settings = &ctx.config().keepalived;

    for master in ctx.plan().masters() {
        let target = master.target();
        info!(node = %master.ip, %virtual_ip, "configuring keepalived");

        ctx.reconciler(master)
            .await?
            .reconcile(&target, &[PackageSpec::any("keepalived")], ReconcileOptions::default())
            .await?;

        shell.run(&target, "sudo mkdir -p /etc/keepalived").await?;
        shell
            .write_file(
                &target,
                CONF_PATH,
                config_file(master, settings, virtual_ip).as_bytes(),
            )
            .await?;
        shell
            .write_file_with_mode(
                &target,
                CHECK_SCRIPT_PATH,
                check_script(virtual_ip).as_bytes(),
                0o755,
            )
            .await?;
        shell.run(&target, "sudo systemctl enable keepalived").await?;
        shell.run(&target, "sudo systemctl restart keepalived").await?;
    }
    Ok(())
}
