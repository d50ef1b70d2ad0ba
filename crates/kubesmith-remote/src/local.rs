//! Commands on the control machine.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::RemoteResult;
use crate::transport::ExecOutput;

/// Runs commands through `/bin/sh -c` on the local machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalRunner;

impl LocalRunner {
    /// Run `command`, optionally feeding `stdin`.
    pub async fn run(&self, command: &str, stdin: Option<&[u8]>) -> RemoteResult<ExecOutput> {
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await?;
            pipe.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        let status = output
            .status
            .code()
            .and_then(|c| u32::try_from(c).ok())
            .unwrap_or(255);

        Ok(ExecOutput {
            status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
