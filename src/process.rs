//! Cancellable subprocess execution.
//!
//! Every external tool invocation (7z for RAR archives, chdman/ccd2cue/
//! ecm2bin for disc conversion) goes through the `ProcessRunner` trait so
//! the extractor and converter stay testable without the real binaries.
//! Cancellation is cooperative: SIGTERM, a grace period, then SIGKILL.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long a terminated child gets to exit before being killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Captured output of a finished tool invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Subprocess errors
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with status {code:?}: {stderr}")]
    NonZero {
        tool: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("io error running {tool}: {source}")]
    Io {
        tool: String,
        #[source]
        source: std::io::Error,
    },
}

/// Runs external tools on behalf of the pipeline.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run `program` with `args` to completion, honoring `token`.
    ///
    /// Returns the captured stdout/stderr on a zero exit status. A non-zero
    /// exit is an error carrying both streams for diagnostics.
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        token: &CancellationToken,
    ) -> Result<ToolOutput, ProcessError>;
}

/// Locate an external tool: the configured tools directory first, then PATH.
pub fn find_tool(tools_dir: Option<&Path>, name: &str) -> Option<PathBuf> {
    if let Some(dir) = tools_dir {
        let candidate = dir.join(name);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    which::which(name).ok()
}

/// Locate a 7z binary, trying the common executable names.
pub fn find_7z(tools_dir: Option<&Path>) -> Option<PathBuf> {
    ["7zz", "7z", "7za"]
        .iter()
        .find_map(|name| find_tool(tools_dir, name))
}

/// Default runner backed by `tokio::process`.
#[derive(Debug, Default)]
pub struct SystemRunner;

#[async_trait]
impl ProcessRunner for SystemRunner {
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        token: &CancellationToken,
    ) -> Result<ToolOutput, ProcessError> {
        let tool = program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.display().to_string());

        if token.is_cancelled() {
            return Err(ProcessError::Cancelled);
        }

        debug!("Running {} {:?}", program.display(), args);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                tool: tool.clone(),
                source,
            })?;

        let stdout_task = spawn_pipe_reader(child.stdout.take());
        let stderr_task = spawn_pipe_reader(child.stderr.take());

        let status = tokio::select! {
            status = child.wait() => status.map_err(|source| ProcessError::Io {
                tool: tool.clone(),
                source,
            })?,
            _ = token.cancelled() => {
                terminate(&mut child, TERMINATE_GRACE).await;
                return Err(ProcessError::Cancelled);
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(ProcessError::NonZero {
                tool,
                code: status.code(),
                stdout,
                stderr,
            });
        }

        Ok(ToolOutput { stdout, stderr })
    }
}

fn spawn_pipe_reader<R>(pipe: Option<R>) -> tokio::task::JoinHandle<String>
where
    R: AsyncReadExt + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// SIGTERM, wait out the grace period, then SIGKILL if still running.
async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::c_int, libc::SIGTERM);
        }
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        warn!("Child {} ignored SIGTERM, killing", pid);
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_find_tool_prefers_tools_dir() {
        let temp = TempDir::new().unwrap();
        let tool = temp.path().join("chdman");
        std::fs::write(&tool, b"").unwrap();

        assert_eq!(find_tool(Some(temp.path()), "chdman"), Some(tool));
    }

    #[test]
    fn test_find_tool_missing() {
        let temp = TempDir::new().unwrap();
        assert_eq!(
            find_tool(Some(temp.path()), "definitely-not-a-real-tool-xyz"),
            None
        );
    }

    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let runner = SystemRunner;
        let token = CancellationToken::new();
        let out = runner
            .run(
                Path::new("/bin/sh"),
                &["-c".to_string(), "echo hello".to_string()],
                &token,
            )
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_system_runner_nonzero_exit() {
        let runner = SystemRunner;
        let token = CancellationToken::new();
        let err = runner
            .run(
                Path::new("/bin/sh"),
                &["-c".to_string(), "echo oops >&2; exit 3".to_string()],
                &token,
            )
            .await
            .unwrap_err();
        match err {
            ProcessError::NonZero { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert!(stderr.contains("oops"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_system_runner_pre_cancelled() {
        let runner = SystemRunner;
        let token = CancellationToken::new();
        token.cancel();
        let err = runner
            .run(Path::new("/bin/true"), &[], &token)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Cancelled));
    }

    #[tokio::test]
    async fn test_system_runner_cancel_terminates_child() {
        let runner = SystemRunner;
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let start = std::time::Instant::now();
        let err = runner
            .run(
                Path::new("/bin/sh"),
                &["-c".to_string(), "sleep 30".to_string()],
                &token,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
