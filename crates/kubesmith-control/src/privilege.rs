//! Temporary passwordless sudo for the login user.
//!
//! Many steps run `sudo` non-interactively. When the login user needs a
//! password for sudo, a `NOPASSWD` line is appended to `/etc/sudoers` for the
//! duration of the run and removed again on teardown. Lines that already
//! existed are never removed.

use kubesmith_remote::{Login, Shell, Target};
use tracing::{debug, info, warn};

use crate::context::{RunContext, SudoGrant};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::plan::Node;

fn sudoers_line(user: &str) -> String {
    format!("{user} ALL=NOPASSWD: ALL")
}

/// Make sure the login user on `node` can run sudo without a password.
pub async fn ensure_sudo(ctx: &RunContext, node: &Node, login: &Login) -> OrchestratorResult<()> {
    if login.is_root() {
        return Ok(());
    }
    let shell = ctx.shell();
    let target = node.target();
    let line = sudoers_line(&login.user);

    let Some(password) = login.password_str() else {
        if shell.run_status(&target, "sudo -n true").await? {
            return Ok(());
        }
        return Err(OrchestratorError::config(format!(
            "{}@{} logs in with a key and needs passwordless sudo",
            login.user, node.ip
        )));
    };

    let input = format!("{password}\n");
    let present = shell
        .run_with_input(
            &target,
            &format!("sudo -S -p '' grep -qxF '{line}' /etc/sudoers && echo exist || echo missing"),
            input.as_bytes(),
        )
        .await?;
    if present == "exist" {
        debug!(node = %node.ip, user = %login.user, "sudoers entry already present");
        return Ok(());
    }

    shell
        .run_with_input(
            &target,
            &format!("sudo -S -p '' sh -c \"echo '{line}' >> /etc/sudoers\""),
            input.as_bytes(),
        )
        .await?;
    info!(node = %node.ip, user = %login.user, "granted passwordless sudo for this run");
    ctx.record_grant(SudoGrant {
        address: node.ip,
        user: login.user.clone(),
    });
    Ok(())
}

/// Print `file` without the lines exactly equal to `line`.
fn without_line(line: &str, file: &str) -> String {
    format!("awk -v line='{line}' '$0 != line' {file}")
}

/// Remove one sudoers line added by [`ensure_sudo`].
pub async fn revoke(shell: &Shell, grant: &SudoGrant) -> OrchestratorResult<()> {
    let target = Target::Node(grant.address);
    let filtered = without_line(&sudoers_line(&grant.user), "/etc/sudoers");
    shell
        .run(
            &target,
            &format!(
                "staging=$(umask 077 && mktemp /tmp/kubesmith-sudoers.XXXXXX) \
                 && sudo {filtered} > \"$staging\" \
                 && sudo install -o root -g root -m 0440 \"$staging\" /etc/sudoers; \
                 rc=$?; rm -f \"$staging\"; exit $rc"
            ),
        )
        .await?;
    debug!(node = %grant.address, user = %grant.user, "revoked passwordless sudo");
    Ok(())
}

/// Remove every line added during the run. Failures are logged and skipped.
pub async fn revoke_all(ctx: &RunContext) {
    for grant in ctx.take_grants() {
        if let Err(e) = revoke(ctx.shell(), &grant).await {
            warn!(node = %grant.address, error = %e, "failed to revoke sudo grant");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use kubesmith_remote::testing::ScriptedRunner;
    use kubesmith_remote::LocalRunner;

    use crate::context::tests::{context, node_config};
    use crate::plan::Role;

    #[tokio::test]
    async fn grant_is_added_and_revoked() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("grep -qxF", "missing");
        let ctx = context(&runner, vec![node_config("m1", "10.0.0.1", Role::Master)]);
        let node = ctx.plan().first_master().clone();
        let login = Login::with_password("ops", "secret");

        ensure_sudo(&ctx, &node, &login).await.unwrap();
        assert!(runner.ran(">> /etc/sudoers"));

        revoke_all(&ctx).await;
        assert!(runner.ran("sudo awk -v line='ops ALL=NOPASSWD: ALL' '$0 != line' /etc/sudoers"));
        assert!(runner.ran("sudo install -o root -g root -m 0440 \"$staging\" /etc/sudoers"));
        assert!(ctx.take_grants().is_empty());
    }

    #[tokio::test]
    async fn password_goes_to_sudo_on_stdin() {
        let password = "a'b$c\"d";
        let runner = Arc::new(ScriptedRunner::with_login(Login::with_password("ops", password)));
        runner.on("grep -qxF", "missing");
        let ctx = context(&runner, vec![node_config("m1", "10.0.0.1", Role::Master)]);
        let node = ctx.plan().first_master().clone();

        ensure_sudo(&ctx, &node, &Login::with_password("ops", password))
            .await
            .unwrap();

        assert!(runner.calls().iter().all(|c| !c.command.contains(password)));
        let expected = format!("{password}\n");
        assert_eq!(runner.stdin_of("grep -qxF").as_deref(), Some(expected.as_str()));
        assert_eq!(runner.stdin_of(">> /etc/sudoers").as_deref(), Some(expected.as_str()));
    }

    #[tokio::test]
    async fn only_the_exact_line_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let sudoers = dir.path().join("sudoers");
        std::fs::write(
            &sudoers,
            "root ALL=(ALL) ALL\n\
             devops ALL=NOPASSWD: ALL\n\
             ops ALL=NOPASSWD: ALL\n\
             %ops ALL=NOPASSWD: ALL\n\
             ops ALL=NOPASSWD: ALL # keep\n",
        )
        .unwrap();

        let command = without_line(&sudoers_line("ops"), &sudoers.display().to_string());
        let out = LocalRunner.run(&command, None).await.unwrap();

        assert!(out.success(), "{}", out.stderr);
        assert_eq!(
            out.stdout,
            "root ALL=(ALL) ALL\n\
             devops ALL=NOPASSWD: ALL\n\
             %ops ALL=NOPASSWD: ALL\n\
             ops ALL=NOPASSWD: ALL # keep\n"
        );
    }

    #[tokio::test]
    async fn existing_line_is_left_alone() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("grep -qxF", "exist");
        let ctx = context(&runner, vec![node_config("m1", "10.0.0.1", Role::Master)]);
        let node = ctx.plan().first_master().clone();

        ensure_sudo(&ctx, &node, &Login::with_password("ops", "secret"))
            .await
            .unwrap();
        revoke_all(&ctx).await;

        assert!(!runner.ran(">> /etc/sudoers"));
        assert!(!runner.ran("awk"));
    }

    #[tokio::test]
    async fn root_needs_nothing() {
        let runner = Arc::new(ScriptedRunner::new());
        let ctx = context(&runner, vec![node_config("m1", "10.0.0.1", Role::Master)]);
        let node = ctx.plan().first_master().clone();
        let root = Login {
            user: "root".into(),
            password: None,
        };

        ensure_sudo(&ctx, &node, &root).await.unwrap();
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn key_login_without_passwordless_sudo_fails() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("sudo -n true", 1, "a password is required");
        let ctx = context(&runner, vec![node_config("m1", "10.0.0.1", Role::Master)]);
        let node = ctx.plan().first_master().clone();
        let login = Login {
            user: "ops".into(),
            password: None,
        };

        let err = ensure_sudo(&ctx, &node, &login).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(_)));
    }
}
