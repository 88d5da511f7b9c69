//! Runs an external shader compiler and captures its outcome.
//!
//! The assembled command line is handed to the OS shell, with stdout
//! discarded (unless debugging wants it) and stderr captured. Exit code zero
//! means success; stderr is still collected for warnings. There is
//! deliberately no wall-clock limit on the child.

use std::process::Stdio;

use tokio::{io::AsyncReadExt, process::Command};
use tracing::warn;

use crate::error::ServerError;

pub struct CommandOutcome {
    pub success: bool,
    /// Captured stderr with trailing whitespace removed.
    pub stderr: String,
}

pub async fn run_compiler(command: &str, show_stdout: bool) -> Result<CommandOutcome, ServerError> {
    let mut shell = Command::new("sh");
    shell
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(if show_stdout {
            Stdio::inherit()
        } else {
            Stdio::null()
        })
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = shell.spawn().map_err(|source| ServerError::Spawn {
        command: command.to_string(),
        source,
    })?;

    let mut stderr_bytes = Vec::new();
    if let Some(mut stderr) = child.stderr.take() {
        if let Err(error) = stderr.read_to_end(&mut stderr_bytes).await {
            warn!(%error, "failed to drain compiler stderr");
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|source| ServerError::Wait { source })?;

    let stderr = String::from_utf8_lossy(&stderr_bytes)
        .trim_end_matches([' ', '\t', '\r', '\n'])
        .to_string();

    Ok(CommandOutcome {
        success: status.success(),
        stderr,
    })
}

/// Deletes a scratch file when dropped, on every exit path.
pub struct TempFileGuard {
    path: std::path::PathBuf,
}

impl TempFileGuard {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        TempFileGuard { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
