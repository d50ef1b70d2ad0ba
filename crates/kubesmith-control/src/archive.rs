//! Release archive distribution between masters.
//!
//! One master downloads the archive into its scratch directory; every other
//! node receives a copy over node-to-node `scp`. Nodes that cannot reach each
//! other with keys fall back to `sshpass` with the receiving node's password.

use tracing::{debug, info};

use crate::context::{RunContext, NODE_TMP_DIR, NODE_TMP_DIR_RELATIVE};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::plan::Node;

/// A downloadable `.tar.gz` release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archive {
    /// Download URL.
    pub url: String,
    /// Last path segment of the URL.
    pub file_name: String,
}

impl Archive {
    /// Archive at `template` with `{version}` replaced.
    pub fn from_template(template: &str, version: &str) -> OrchestratorResult<Self> {
        let url = template.replace("{version}", version);
        let file_name = url
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| OrchestratorError::config(format!("no file name in URL {url}")))?
            .to_owned();
        Ok(Self { url, file_name })
    }

    /// Path of the archive in a node's scratch directory.
    #[must_use]
    pub fn path(&self) -> String {
        format!("{NODE_TMP_DIR}/{}", self.file_name)
    }

    /// Directory the archive extracts to, by the `.tar.gz` naming convention.
    #[must_use]
    pub fn extracted_dir(&self) -> String {
        format!(
            "{NODE_TMP_DIR}/{}",
            self.file_name.trim_end_matches(".tar.gz")
        )
    }

    /// Command extracting the archive inside the scratch directory.
    #[must_use]
    pub fn extract_command(&self) -> String {
        format!("tar -zxvf {} -C {NODE_TMP_DIR}", self.path())
    }
}

/// Put `archive` into the scratch directory of every node in `nodes`.
///
/// The first node downloads it unless it already has it; the rest copy it
/// from the first.
pub async fn distribute(ctx: &RunContext, archive: &Archive, nodes: &[&Node]) -> OrchestratorResult<()> {
    let Some((source, rest)) = nodes.split_first() else {
        return Ok(());
    };
    let shell = ctx.shell();
    let source_target = source.target();

    if shell
        .run_status(&source_target, &format!("test -f {}", archive.path()))
        .await?
    {
        debug!(node = %source.ip, file = %archive.file_name, "archive already present");
    } else {
        info!(node = %source.ip, file = %archive.file_name, "downloading");
        shell
            .run(
                &source_target,
                &format!("wget -nc -q -P {NODE_TMP_DIR} {}", archive.url),
            )
            .await?;
    }

    for node in rest {
        info!(from = %source.ip, to = %node.ip, file = %archive.file_name, "transferring");
        let destination = format!("{NODE_TMP_DIR_RELATIVE}/{}", archive.file_name);
        transfer(ctx, source, node, &archive.path(), &destination).await?;
    }
    Ok(())
}

/// Copy `path` on `from` to `destination` on `to`, relative to the receiving
/// user's home.
pub async fn transfer(
    ctx: &RunContext,
    from: &Node,
    to: &Node,
    path: &str,
    destination: &str,
) -> OrchestratorResult<()> {
    let shell = ctx.shell();
    let login = ctx.login(to.ip).await?;
    if let Some((parent, _)) = destination.rsplit_once('/') {
        shell
            .run(&to.target(), &format!("mkdir -p $HOME/{parent}"))
            .await?;
    }

    let scp = format!(
        "scp -o StrictHostKeyChecking=no {path} {}@{}:{destination}",
        login.user, to.ip
    );
    let source = from.target();

    let keys_work = shell
        .run_status(
            &source,
            &format!(
                "ssh -o PasswordAuthentication=no -o StrictHostKeyChecking=no {}@{} /bin/true",
                login.user, to.ip
            ),
        )
        .await?;
    match login.password_str() {
        Some(password) if !keys_work => {
            debug!(from = %from.ip, to = %to.ip, "using sshpass for transfer");
            shell
                .run_with_input(
                    &source,
                    &format!("IFS= read -r SSHPASS && export SSHPASS && sshpass -e {scp}"),
                    format!("{password}\n").as_bytes(),
                )
                .await?;
        }
        _ => {
            shell.run(&source, &scp).await?;
        }
    }
    Ok(())
}
