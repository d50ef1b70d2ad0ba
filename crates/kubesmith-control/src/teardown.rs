//! End-of-run cleanup.
//!
//! Runs after success, after failure and from the signal handler. The first
//! call does the work; later calls wait for it to finish.

use kubesmith_packages::REMOVE_POLICY_RC;
use kubesmith_remote::Target;
use tracing::{debug, info, warn};

use crate::context::{RunContext, NODE_TMP_DIR};
use crate::privilege::revoke_all;

/// Undo what the run left behind on the nodes and close every connection.
///
/// Failures are logged; teardown never fails.
pub async fn teardown(ctx: &RunContext) {
    if !ctx.begin_teardown() {
        debug!("teardown already started, waiting for it");
        ctx.wait_for_teardown().await;
        return;
    }
    info!("cleaning up");

    for address in ctx.connected() {
        let target = Target::Node(address);
        for command in [REMOVE_POLICY_RC.to_owned(), format!("rm -rf {NODE_TMP_DIR}")] {
            if let Err(e) = ctx.shell().run(&target, &command).await {
                warn!(node = %address, error = %e, "cleanup command failed");
            }
        }
    }

    // Last, so that nothing after it needs sudo.
    revoke_all(ctx).await;

    ctx.shell().close().await;
    ctx.finish_teardown();
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use kubesmith_remote::testing::ScriptedRunner;
    use kubesmith_remote::Login;

    use crate::context::tests::{context, node_config};
    use crate::plan::Role;
    use crate::privilege::ensure_sudo;

    #[tokio::test]
    async fn cleans_every_connected_node_once() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("grep -qxF", "missing");
        let ctx = context(
            &runner,
            vec![
                node_config("m1", "10.0.0.1", Role::Master),
                node_config("w1", "10.0.0.2", Role::Worker),
            ],
        );
        let master = ctx.plan().first_master().clone();
        ctx.connect(&master).await.unwrap();
        ensure_sudo(&ctx, &master, &Login::with_password("ops", "secret"))
            .await
            .unwrap();

        teardown(&ctx).await;
        teardown(&ctx).await;

        assert_eq!(runner.count("awk -v line='ops ALL=NOPASSWD: ALL'"), 1);
        assert_eq!(runner.count("rm -f /usr/sbin/policy-rc.d"), 1);
        assert_eq!(runner.count("rm -rf $HOME/.kubesmith/tmp"), 1);
        assert!(runner
            .commands_on(Target::Node("10.0.0.2".parse().unwrap()))
            .is_empty());
    }

    #[tokio::test]
    async fn sudo_grant_outlives_privileged_cleanup() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("grep -qxF", "missing");
        let ctx = context(&runner, vec![node_config("m1", "10.0.0.1", Role::Master)]);
        let master = ctx.plan().first_master().clone();
        ctx.connect(&master).await.unwrap();
        ensure_sudo(&ctx, &master, &Login::with_password("ops", "secret"))
            .await
            .unwrap();

        teardown(&ctx).await;

        let policy = runner.position("rm -f /usr/sbin/policy-rc.d").unwrap();
        let scratch = runner.position("rm -rf $HOME/.kubesmith/tmp").unwrap();
        let revoked = runner.position("/etc/sudoers; rc=$?").unwrap();
        assert!(policy < revoked && scratch < revoked);
    }

    #[tokio::test]
    async fn second_caller_returns_after_cleanup_is_done() {
        let runner = Arc::new(ScriptedRunner::new());
        let ctx = Arc::new(context(&runner, vec![node_config("m1", "10.0.0.1", Role::Master)]));
        let master = ctx.plan().first_master().clone();
        ctx.connect(&master).await.unwrap();
        assert!(ctx.begin_teardown());

        let waiter = tokio::spawn({
            let ctx = Arc::clone(&ctx);
            async move { teardown(&ctx).await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        ctx.finish_teardown();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(!runner.ran("policy-rc.d"));
    }

    #[tokio::test]
    async fn failures_do_not_stop_cleanup() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("policy-rc.d", 1, "read-only file system");
        let ctx = context(&runner, vec![node_config("m1", "10.0.0.1", Role::Master)]);
        let master = ctx.plan().first_master().clone();
        ctx.connect(&master).await.unwrap();

        teardown(&ctx).await;

        assert!(runner.ran("rm -rf $HOME/.kubesmith/tmp"));
    }
}
