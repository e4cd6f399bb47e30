//! Bounded process runner: launch an external command, watch the disk
//! budget concurrently, enforce a wall-clock deadline, and classify the
//! result.
//!
//! The command is spawned without a shell in its own process group so the
//! whole tree can be killed. A fresh quota monitor is created per
//! invocation and joined on every exit path; the child never outlives the
//! call.

use crate::capacity::{self, CapacityError};
use crate::monitor::QuotaMonitor;
use crate::usage::{self, to_gb, UsageError};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// Default wall-clock limit for a protected command.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(500);

/// Default sampling interval for the quota monitor.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Per-invocation knobs for a protected command.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Byte budget for the watched directory.
    pub quota_bytes: u64,
    /// Directory whose aggregate size the quota bounds.
    pub watch_path: PathBuf,
    /// Wall-clock limit on the command.
    pub timeout: Duration,
    /// Monitor sampling interval.
    pub poll_interval: Duration,
}

impl RunOptions {
    pub fn new(quota_bytes: u64, watch_path: PathBuf) -> Self {
        Self {
            quota_bytes,
            watch_path,
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Terminal classification of one protected command. Produced exactly
/// once per invocation.
#[derive(Debug)]
pub enum Outcome {
    /// Exit code 0 and the quota held. Stdout is discarded.
    Completed,
    /// The command ran to completion but reported failure.
    NonZeroExit {
        /// Exit code (None if killed by an outside signal).
        code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },
    /// The wall-clock limit elapsed; the command was killed.
    TimedOut,
    /// The quota was breached while the command ran; it was killed and
    /// whatever it wrote should be considered incomplete.
    QuotaExceeded,
}

/// Precondition failures. Unless noted, nothing was spawned.
#[derive(Debug)]
pub enum RunError {
    /// The command vector was empty.
    EmptyCommand,
    /// Usage was already over the effective quota before launch.
    QuotaExceededBeforeStart { used: u64, limit: u64 },
    /// The effective quota could not be resolved.
    Capacity(CapacityError),
    /// The pre-flight usage probe failed.
    Usage(UsageError),
    /// The command could not be spawned.
    Spawn { source: std::io::Error },
    /// Waiting on the spawned command failed; it was killed before this
    /// error surfaced.
    Wait { source: std::io::Error },
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::EmptyCommand => write!(f, "empty command"),
            RunError::QuotaExceededBeforeStart { used, limit } => {
                write!(
                    f,
                    "disk quota of {} GB already exceeded ({} GB used) before the command could start",
                    to_gb(*limit),
                    to_gb(*used)
                )
            }
            RunError::Capacity(e) => write!(f, "cannot resolve effective quota: {}", e),
            RunError::Usage(e) => write!(f, "pre-flight usage probe failed: {}", e),
            RunError::Spawn { source } => write!(f, "failed to spawn command: {}", source),
            RunError::Wait { source } => write!(f, "failed waiting on command: {}", source),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::EmptyCommand => None,
            RunError::QuotaExceededBeforeStart { .. } => None,
            RunError::Capacity(e) => Some(e),
            RunError::Usage(e) => Some(e),
            RunError::Spawn { source } => Some(source),
            RunError::Wait { source } => Some(source),
        }
    }
}

/// How the wait phase ended.
enum Waited {
    Exited(ExitStatus),
    WaitFailed(std::io::Error),
    DeadlineElapsed,
    QuotaTripped,
}

/// Run `command` under the disk budget in `opts`.
///
/// Resolves the effective quota against the node's free space, refuses to
/// launch if usage is already over it, then races the command against the
/// wall-clock deadline and the quota monitor. Timeout and quota breach
/// both kill the command's process group; a breach observed before or at
/// completion wins over the exit status.
pub async fn run_guarded(
    command: &[String],
    label: &str,
    opts: &RunOptions,
) -> Result<Outcome, RunError> {
    let (program, args) = command.split_first().ok_or(RunError::EmptyCommand)?;

    usage::log_usage(&format!("begin: {label}"), &opts.watch_path);

    let limit = capacity::resolve(opts.quota_bytes, &opts.watch_path).map_err(RunError::Capacity)?;
    let used = usage::dir_usage(&opts.watch_path).map_err(RunError::Usage)?;
    if used > limit {
        usage::log_usage(&format!("failed: {label}"), &opts.watch_path);
        tracing::error!(
            used_gb = to_gb(used),
            limit_gb = to_gb(limit),
            "disk quota exceeded before the command could start"
        );
        return Err(RunError::QuotaExceededBeforeStart { used, limit });
    }

    tracing::info!(
        command = %command.join(" "),
        limit_gb = to_gb(limit),
        timeout_secs = opts.timeout.as_secs(),
        "running protected command"
    );

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0) // own group so the whole tree can be killed
        .spawn()
        .map_err(|source| RunError::Spawn { source })?;

    let pid = child.id().unwrap_or(0);
    tracing::debug!(pid, "protected command started");

    let stdout_task = capture_stream(child.stdout.take());
    let stderr_task = capture_stream(child.stderr.take());

    let monitor = QuotaMonitor::spawn(opts.watch_path.clone(), limit, opts.poll_interval);

    let waited = tokio::select! {
        res = child.wait() => match res {
            Ok(status) => Waited::Exited(status),
            Err(source) => Waited::WaitFailed(source),
        },
        _ = tokio::time::sleep(opts.timeout) => Waited::DeadlineElapsed,
        _ = monitor.breached() => Waited::QuotaTripped,
    };

    match waited {
        Waited::DeadlineElapsed => {
            kill_group(&mut child).await;
            monitor.stop().await;
            drain(stdout_task).await;
            drain(stderr_task).await;
            usage::log_usage(&format!("failed: {label} (timeout)"), &opts.watch_path);
            tracing::error!(
                timeout_secs = opts.timeout.as_secs(),
                "protected command timed out"
            );
            Ok(Outcome::TimedOut)
        }
        Waited::QuotaTripped => {
            kill_group(&mut child).await;
            monitor.stop().await;
            drain(stdout_task).await;
            drain(stderr_task).await;
            usage::log_usage(&format!("failed: {label} (quota)"), &opts.watch_path);
            Ok(Outcome::QuotaExceeded)
        }
        Waited::WaitFailed(source) => {
            kill_group(&mut child).await;
            monitor.stop().await;
            drain(stdout_task).await;
            drain(stderr_task).await;
            Err(RunError::Wait { source })
        }
        Waited::Exited(status) => {
            // The process has stopped producing updates; only now is the
            // flag read for the final classification.
            let quota_hit = monitor.stop().await;
            drain(stdout_task).await;
            let stderr = drain(stderr_task).await;

            if quota_hit {
                usage::log_usage(&format!("failed: {label} (quota)"), &opts.watch_path);
                return Ok(Outcome::QuotaExceeded);
            }

            if status.success() {
                usage::log_usage(&format!("finished: {label}"), &opts.watch_path);
                return Ok(Outcome::Completed);
            }

            let code = status.code();
            usage::log_usage(&format!("failed: {label}"), &opts.watch_path);
            tracing::error!(
                code = ?code,
                stderr = %stderr.trim(),
                "protected command failed"
            );
            Ok(Outcome::NonZeroExit { code, stderr })
        }
    }
}

/// SIGKILL the child's whole process group and reap it.
///
/// Falls back to killing the direct child when the group signal cannot be
/// delivered (e.g. the group leader already exited).
async fn kill_group(child: &mut Child) {
    match child.id() {
        Some(pid) => {
            let pgid = Pid::from_raw(pid as i32);
            if let Err(e) = signal::killpg(pgid, Signal::SIGKILL) {
                tracing::warn!(error = %e, pid, "killpg failed, killing child directly");
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, pid, "failed to kill child");
                }
            }
        }
        None => {
            // already reaped
            return;
        }
    }
    if let Err(e) = child.wait().await {
        tracing::warn!(error = %e, "failed to reap killed child");
    }
}

/// Read a captured pipe to the end on a background task.
fn capture_stream<R>(stream: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream {
            if let Err(e) = stream.read_to_end(&mut buf).await {
                tracing::debug!(error = %e, "failed reading captured stream");
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

async fn drain(task: JoinHandle<String>) -> String {
    task.await.unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::tempdir;

    const GB: u64 = usage::BYTES_PER_GB;

    fn fast_opts(quota_bytes: u64, watch: &std::path::Path) -> RunOptions {
        RunOptions {
            quota_bytes,
            watch_path: watch.to_path_buf(),
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(20),
        }
    }

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_empty_command_is_rejected() {
        let dir = tempdir().unwrap();
        let err = run_guarded(&[], "nothing", &fast_opts(GB, dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::EmptyCommand));
    }

    #[tokio::test]
    async fn test_successful_command_completes() {
        let dir = tempdir().unwrap();
        let outcome = run_guarded(
            &cmd(&["sh", "-c", "exit 0"]),
            "trivial success",
            &fast_opts(100 * GB, dir.path()),
        )
        .await
        .unwrap();
        assert!(matches!(outcome, Outcome::Completed));
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_code_and_stderr() {
        let dir = tempdir().unwrap();
        let outcome = run_guarded(
            &cmd(&["sh", "-c", "echo boom >&2; exit 3"]),
            "deliberate failure",
            &fast_opts(100 * GB, dir.path()),
        )
        .await
        .unwrap();
        match outcome {
            Outcome::NonZeroExit { code, stderr } => {
                assert_eq!(code, Some(3));
                assert!(stderr.contains("boom"));
            }
            other => panic!("expected NonZeroExit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_the_command() {
        let dir = tempdir().unwrap();
        let mut opts = fast_opts(100 * GB, dir.path());
        opts.timeout = Duration::from_millis(300);

        let start = Instant::now();
        let outcome = run_guarded(&cmd(&["sleep", "5"]), "slow command", &opts)
            .await
            .unwrap();

        assert!(matches!(outcome, Outcome::TimedOut));
        // killed at the deadline, not after the full sleep
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_preflight_breach_spawns_nothing() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("existing"), vec![0u8; 4096]).unwrap();
        let marker = dir.path().join("marker");

        let marker_cmd = cmd(&["touch", marker.to_str().unwrap()]);
        let err = run_guarded(&marker_cmd, "never starts", &fast_opts(1, dir.path()))
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::QuotaExceededBeforeStart { .. }));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_quota_breach_during_run_kills_early() {
        let dir = tempdir().unwrap();
        let script = format!(
            "head -c 8192 /dev/zero > {}/blob; sleep 5",
            dir.path().display()
        );

        let start = Instant::now();
        let outcome = run_guarded(
            &cmd(&["sh", "-c", &script]),
            "greedy command",
            &fast_opts(1024, dir.path()),
        )
        .await
        .unwrap();

        assert!(matches!(outcome, Outcome::QuotaExceeded));
        // cancelled by the monitor, well before the sleep finishes
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_quota_breach_wins_over_clean_exit() {
        let dir = tempdir().unwrap();
        let script = format!(
            "head -c 8192 /dev/zero > {}/blob; sleep 0.5; exit 0",
            dir.path().display()
        );

        let outcome = run_guarded(
            &cmd(&["sh", "-c", &script]),
            "breach then succeed",
            &fast_opts(1024, dir.path()),
        )
        .await
        .unwrap();

        assert!(matches!(outcome, Outcome::QuotaExceeded));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let dir = tempdir().unwrap();
        let err = run_guarded(
            &cmd(&["nonexistent-binary-xyz"]),
            "bad program",
            &fast_opts(GB, dir.path()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RunError::Spawn { .. }));
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_missing_watch_path_fails_preflight() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing");
        let opts = fast_opts(GB, &missing);

        let err = run_guarded(&cmd(&["sh", "-c", "exit 0"]), "no watch dir", &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Capacity(_)));
    }
}
