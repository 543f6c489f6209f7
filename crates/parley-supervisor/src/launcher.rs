//! Restart command launcher.
//!
//! The command runs through the platform shell (`bash -lc` on Unix,
//! `cmd /C` on Windows). Its stdout and stderr are pumped line by line into
//! the log as `[srv:<port>] <line>`; a third task reaps the child.

use crate::error::SupervisorError;
use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

/// Starts relay processes
pub trait Launcher: Send + Sync + 'static {
    /// Start `command` for `port` without waiting for it to exit.
    ///
    /// Returns the child's process id when known.
    fn launch(
        &self,
        command: &str,
        port: u16,
        working_dir: Option<&Path>,
    ) -> impl Future<Output = Result<Option<u32>, SupervisorError>> + Send;
}

/// Launches commands through the platform shell
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellLauncher;

fn shell_command(command: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("bash");
        cmd.arg("-lc").arg(command);
        cmd
    }
}

impl Launcher for ShellLauncher {
    async fn launch(
        &self,
        command: &str,
        port: u16,
        working_dir: Option<&Path>,
    ) -> Result<Option<u32>, SupervisorError> {
        let mut cmd = shell_command(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Launch {
            command: command.to_string(),
            source,
        })?;
        let pid = child.id();
        tracing::info!(port, "Launched '{}' (pid {:?})", command, pid);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, port));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, port));
        }
        tokio::spawn(reap(child, port));

        Ok(pid)
    }
}

/// Log every line of a child stream
async fn pump<R: AsyncRead + Unpin>(stream: R, port: u16) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::info!("[srv:{}] {}", port, line),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(port, "Output pump stopped: {}", e);
                break;
            }
        }
    }
}

async fn reap(mut child: Child, port: u16) {
    match child.wait().await {
        Ok(status) => tracing::info!(port, "Relay process exited: {}", status),
        Err(e) => tracing::warn!(port, "Could not wait for relay process: {}", e),
    }
}
