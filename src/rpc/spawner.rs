//! Child process spawner for the RPC client.
//!
//! Spawns the headless server with:
//! - piped stdin/stdout/stderr,
//! - `kill_on_drop(true)` so an abandoned client never leaks a child,
//! - a stderr collector that keeps the tail of the child's diagnostics for
//!   inclusion in later error messages,
//! - a post-spawn grace check that fails fast if the child exits at once.
//!
//! [`terminate`] performs the SIGTERM → grace → SIGKILL shutdown.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::{AppError, Result};

/// Upper bound on retained stderr; older output is dropped first.
pub const STDERR_LIMIT_BYTES: usize = 64 * 1024;

/// Configuration for spawning the headless child.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Program to execute.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Working directory; inherits the caller's when `None`.
    pub cwd: Option<PathBuf>,
}

impl From<&ClientConfig> for SpawnConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            cwd: config.cwd.clone(),
        }
    }
}

/// Accumulated stderr output of the child, shared with the collector task.
///
/// Raw bytes are kept and decoded only in [`snapshot`](Self::snapshot), so
/// a UTF-8 sequence split across two reads survives intact.
#[derive(Debug, Clone, Default)]
pub struct StderrBuffer(Arc<Mutex<Vec<u8>>>);

impl StderrBuffer {
    /// Append a chunk, dropping the oldest bytes beyond [`STDERR_LIMIT_BYTES`].
    pub async fn append(&self, chunk: &[u8]) {
        let mut buf = self.0.lock().await;
        buf.extend_from_slice(chunk);
        if buf.len() > STDERR_LIMIT_BYTES {
            let mut cut = buf.len() - STDERR_LIMIT_BYTES;
            // Never start the retained tail inside a multi-byte character.
            while buf.get(cut).is_some_and(|b| b & 0b1100_0000 == 0b1000_0000) {
                cut += 1;
            }
            buf.drain(..cut);
        }
    }

    /// The retained output, decoded as UTF-8.
    pub async fn snapshot(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().await).into_owned()
    }
}

/// A freshly spawned child with its stdio handles taken.
#[derive(Debug)]
pub struct ChildProcess {
    /// Child handle; kept alive so `kill_on_drop` works.
    pub child: Child,
    /// Child's stdin, for commands.
    pub stdin: ChildStdin,
    /// Child's stdout, for responses and events.
    pub stdout: ChildStdout,
    /// Child's stderr, for diagnostics.
    pub stderr: ChildStderr,
}

/// Spawn the child with piped stdio.
///
/// # Errors
///
/// - `AppError::Process("failed to spawn agent: …")` on an OS spawn failure.
/// - `AppError::Process("failed to capture agent …")` if a pipe was not set up.
pub fn spawn_child(config: &SpawnConfig) -> Result<ChildProcess> {
    let mut cmd = Command::new(&config.program);
    cmd.args(&config.args);

    if let Some(ref cwd) = config.cwd {
        cmd.current_dir(cwd);
    }

    cmd.stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|err| {
        AppError::Process(format!("failed to spawn agent '{}': {err}", config.program))
    })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Process("failed to capture agent stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Process("failed to capture agent stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Process("failed to capture agent stderr".into()))?;

    info!(program = %config.program, pid = child.id(), "agent process spawned");

    Ok(ChildProcess {
        child,
        stdin,
        stdout,
        stderr,
    })
}

/// Spawn a task that copies `stderr` into `buffer` until EOF.
#[must_use]
pub fn capture_stderr<R>(stderr: R, buffer: StderrBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut stderr = stderr;
        let mut chunk = vec![0_u8; 4096];
        loop {
            match stderr.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => buffer.append(&chunk[..n]).await,
                Err(err) => {
                    debug!(%err, "stderr collector stopped");
                    break;
                }
            }
        }
    })
}

/// Wait out the startup grace period and fail if the child already exited.
///
/// # Errors
///
/// Returns `AppError::Process` naming the exit status and the retained
/// stderr when the child is no longer running, or when its status cannot
/// be read.
pub async fn check_started(
    child: &mut Child,
    grace: Duration,
    stderr: &StderrBuffer,
    collector: &mut JoinHandle<()>,
) -> Result<()> {
    tokio::time::sleep(grace).await;

    let status = child
        .try_wait()
        .map_err(|err| AppError::Process(format!("failed to poll agent process: {err}")))?;

    let Some(status) = status else {
        return Ok(());
    };

    // The pipe closes with the process; give the collector a moment to
    // drain what the child wrote before dying.
    let _ = tokio::time::timeout(Duration::from_millis(200), collector).await;

    Err(AppError::Process(format!(
        "agent process exited immediately ({}). Stderr: {}",
        describe_status(status),
        stderr.snapshot().await
    )))
}

/// Stop the child: SIGTERM, wait up to `grace`, then SIGKILL.
///
/// On non-Unix targets the child is killed immediately.
pub async fn terminate(child: &mut Child, grace: Duration) {
    if let Ok(Some(status)) = child.try_wait() {
        debug!(status = %describe_status(status), "agent process already exited");
        return;
    }

    send_sigterm(child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            info!(status = %describe_status(status), "agent process exited");
        }
        Ok(Err(err)) => {
            warn!(%err, "error waiting for agent process");
        }
        Err(_) => {
            warn!("agent process did not exit within grace period, forcing kill");
            if let Err(err) = child.kill().await {
                warn!(%err, "failed to force-kill agent process");
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return;
    };

    if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        warn!(%err, pid, "failed to send SIGTERM to agent process");
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) {}

fn describe_status(status: ExitStatus) -> String {
    status.code().map_or_else(
        || "terminated by signal".to_owned(),
        |code| format!("exit code {code}"),
    )
}
