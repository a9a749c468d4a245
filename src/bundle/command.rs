//! Thin wrapper for running the external tools the bundle pipeline shells out to.

use super::error::BundleError;
use anyhow::{Context, Result};
use std::ffi::OsStr;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Captured output of a successful tool invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs `program args...`, optionally feeding `stdin`, and fails with
/// [`BundleError::CommandFailed`] on a non-zero exit.
///
/// The child is killed if the returned future is dropped, so timeouts and cancellation
/// do not leave stray `crane` or `helm` processes behind.
pub async fn run_tool<I, S>(program: &str, args: I, stdin: Option<&[u8]>) -> Result<ToolOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::debug!(program, "spawning external tool");
    let mut child = command
        .spawn()
        .with_context(|| format!("failed to start {program}"))?;

    if let Some(input) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            match pipe.write_all(input).await {
                Ok(()) => {}
                // The exit status below explains why the child stopped reading.
                Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to write stdin of {program}"));
                }
            }
        }
    }

    let output = child
        .wait_with_output()
        .await
        .with_context(|| format!("failed to wait for {program}"))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        return Err(BundleError::CommandFailed {
            program: program.to_owned(),
            status: output.status,
            stderr,
        }
        .into());
    }

    Ok(ToolOutput { stdout, stderr })
}
