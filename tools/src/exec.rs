//! Bounded execution of a single external command.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::ExecError;
use crate::process::{ChildGuard, kill_process_group, set_new_session};
use crate::shell::{DetectedShell, detect_shell};
use crate::workdir::resolve_workdir;

/// How the command is invoked.
///
/// The argv form is preferred: no shell interpolation can happen. The shell
/// string form runs through the platform default shell and exists as the
/// more powerful, less safe fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandSpec {
    Argv { cmd: String, args: Vec<String> },
    Shell(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExecLimits {
    pub max_stdout_bytes: usize,
    pub max_stderr_bytes: usize,
}

impl Default for ExecLimits {
    fn default() -> Self {
        Self {
            max_stdout_bytes: 256 * 1024,
            max_stderr_bytes: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: CommandSpec,
    /// Relative to the project root, or absolute as an explicit escape hatch.
    pub workdir: Option<String>,
    pub timeout: std::time::Duration,
    pub limits: ExecLimits,
}

impl ExecRequest {
    #[must_use]
    pub fn new(command: CommandSpec) -> Self {
        Self {
            command,
            workdir: None,
            timeout: std::time::Duration::from_secs(120),
            limits: ExecLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamTruncation {
    pub stdout: bool,
    pub stderr: bool,
}

/// First-match-wins classification of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    SpawnError,
    Aborted,
    Timeout,
    NonzeroExit,
    Success,
}

/// Everything observed about one execution. Failures are data here, not
/// errors: `ok` is true only for a clean zero exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutcome {
    pub ok: bool,
    pub status: ExecStatus,
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub truncated: StreamTruncation,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub aborted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Runs commands with working-directory containment, capped capture, and
/// process-group teardown on timeout or cancellation.
#[derive(Debug, Clone)]
pub struct ExecSandbox {
    project_root: PathBuf,
    shell: DetectedShell,
}

impl ExecSandbox {
    #[must_use]
    pub fn new(project_root: PathBuf) -> Self {
        Self {
            project_root,
            shell: detect_shell(None),
        }
    }

    #[must_use]
    pub fn with_shell(mut self, shell: DetectedShell) -> Self {
        self.shell = shell;
        self
    }

    #[must_use]
    pub fn project_root(&self) -> &std::path::Path {
        &self.project_root
    }

    /// Execute one command.
    ///
    /// Integrity violations (escape from the project root, empty command)
    /// reject immediately; everything that happens after spawn is captured
    /// in the returned [`ExecOutcome`].
    pub async fn run(
        &self,
        request: &ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecOutcome, ExecError> {
        let workdir = resolve_workdir(&self.project_root, request.workdir.as_deref())?;

        let mut command = match &request.command {
            CommandSpec::Argv { cmd, args } => {
                if cmd.trim().is_empty() {
                    return Err(ExecError::EmptyCommand);
                }
                let mut command = Command::new(cmd);
                command.args(args);
                command
            }
            CommandSpec::Shell(script) => {
                if script.trim().is_empty() {
                    return Err(ExecError::EmptyCommand);
                }
                let mut command = Command::new(&self.shell.binary);
                command.args(&self.shell.args).arg(script);
                command
            }
        };

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&workdir);

        for (key, _) in std::env::vars() {
            if relay_types::is_denylisted_env(&key) {
                command.env_remove(&key);
            }
        }

        set_new_session(&mut command);

        let start = Instant::now();
        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return Ok(ExecOutcome {
                    ok: false,
                    status: ExecStatus::SpawnError,
                    exit_code: None,
                    signal: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    truncated: StreamTruncation::default(),
                    duration_ms: start.elapsed().as_millis() as u64,
                    timed_out: false,
                    aborted: false,
                    error: Some(e.to_string()),
                });
            }
        };

        let mut guard = ChildGuard::new(child);

        let stdout = guard.child_mut().stdout.take();
        let stderr = guard.child_mut().stderr.take();
        let stdout_task = tokio::spawn(read_capped(stdout, request.limits.max_stdout_bytes));
        let stderr_task = tokio::spawn(read_capped(stderr, request.limits.max_stderr_bytes));

        let mut timed_out = false;
        let mut aborted = false;

        let wait_result = tokio::select! {
            status = guard.child_mut().wait() => Some(status),
            () = cancel.cancelled() => {
                aborted = true;
                None
            }
            () = tokio::time::sleep(request.timeout) => {
                timed_out = true;
                None
            }
        };

        let wait_result = match wait_result {
            Some(result) => result,
            None => {
                // Take down the whole group so forked descendants cannot
                // outlive the call, then reap.
                match guard.child_mut().id() {
                    Some(pid) => {
                        if let Err(e) = kill_process_group(pid) {
                            tracing::warn!(pid, "Failed to kill process group: {e}");
                            let _ = guard.child_mut().start_kill();
                        }
                    }
                    None => {
                        let _ = guard.child_mut().start_kill();
                    }
                }
                guard.child_mut().wait().await
            }
        };
        guard.disarm();

        let (stdout, stdout_truncated) = stdout_task.await.unwrap_or_default();
        let (stderr, stderr_truncated) = stderr_task.await.unwrap_or_default();
        let duration_ms = start.elapsed().as_millis() as u64;

        let (exit_code, signal, wait_error) = match wait_result {
            Ok(status) => (status.code(), unix_signal(&status), None),
            Err(e) => (None, None, Some(e.to_string())),
        };

        let status = if aborted {
            ExecStatus::Aborted
        } else if timed_out {
            ExecStatus::Timeout
        } else if exit_code == Some(0) && wait_error.is_none() {
            ExecStatus::Success
        } else {
            ExecStatus::NonzeroExit
        };

        Ok(ExecOutcome {
            ok: matches!(status, ExecStatus::Success),
            status,
            exit_code,
            signal,
            stdout,
            stderr,
            truncated: StreamTruncation {
                stdout: stdout_truncated,
                stderr: stderr_truncated,
            },
            duration_ms,
            timed_out,
            aborted,
            error: wait_error,
        })
    }
}

#[cfg(unix)]
fn unix_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn unix_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Drain a child stream to EOF, keeping at most `cap` bytes.
///
/// Reading always continues past the cap so the child never blocks on a full
/// pipe; excess bytes are discarded and flagged. The cut respects UTF-8 char
/// boundaries.
async fn read_capped<R>(reader: Option<R>, cap: usize) -> (String, bool)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return (String::new(), false);
    };

    let mut buf = [0u8; 4096];
    let mut collected = String::new();
    let mut truncated = false;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let chunk = String::from_utf8_lossy(&buf[..n]);
        if collected.len() < cap {
            let remaining = cap - collected.len();
            let mut take = remaining.min(chunk.len());
            while take > 0 && !chunk.is_char_boundary(take) {
                take -= 1;
            }
            collected.push_str(&chunk[..take]);
            if take < chunk.len() {
                truncated = true;
            }
        } else {
            truncated = true;
        }
    }
    (collected, truncated)
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::{CommandSpec, ExecRequest, ExecSandbox, ExecStatus};
    use crate::ExecError;

    fn sandbox() -> (tempfile::TempDir, ExecSandbox) {
        let dir = tempfile::tempdir().expect("tempdir");
        let sandbox = ExecSandbox::new(dir.path().to_path_buf());
        (dir, sandbox)
    }

    fn argv(cmd: &str, args: &[&str]) -> ExecRequest {
        ExecRequest::new(CommandSpec::Argv {
            cmd: cmd.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
        })
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_stdout_on_success() {
        let (_dir, sandbox) = sandbox();
        let outcome = sandbox
            .run(&argv("echo", &["hello"]), &CancellationToken::new())
            .await
            .expect("run");

        assert!(outcome.ok);
        assert_eq!(outcome.status, ExecStatus::Success);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout.trim(), "hello");
        assert!(!outcome.truncated.stdout);
        assert!(!outcome.timed_out);
        assert!(!outcome.aborted);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_captured_not_thrown() {
        let (_dir, sandbox) = sandbox();
        let request = ExecRequest::new(CommandSpec::Shell("exit 3".to_string()));
        let outcome = sandbox
            .run(&request, &CancellationToken::new())
            .await
            .expect("run");

        assert!(!outcome.ok);
        assert_eq!(outcome.status, ExecStatus::NonzeroExit);
        assert_eq!(outcome.exit_code, Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stderr_is_captured_separately() {
        let (_dir, sandbox) = sandbox();
        let request = ExecRequest::new(CommandSpec::Shell(
            "echo out; echo err >&2".to_string(),
        ));
        let outcome = sandbox
            .run(&request, &CancellationToken::new())
            .await
            .expect("run");

        assert_eq!(outcome.stdout.trim(), "out");
        assert_eq!(outcome.stderr.trim(), "err");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn output_over_cap_is_truncated_at_exactly_the_cap() {
        let (_dir, sandbox) = sandbox();
        let mut request = ExecRequest::new(CommandSpec::Shell(
            "printf 'x%.0s' $(seq 1 5000)".to_string(),
        ));
        request.limits.max_stdout_bytes = 1024;

        let outcome = sandbox
            .run(&request, &CancellationToken::new())
            .await
            .expect("run");

        assert!(outcome.ok);
        assert!(outcome.truncated.stdout);
        assert!(!outcome.truncated.stderr);
        assert_eq!(outcome.stdout.len(), 1024);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_the_whole_process_group() {
        let (dir, sandbox) = sandbox();
        let marker = dir.path().join("survived");
        let script = format!(
            "(sleep 0.5; echo late > {}) & sleep 30",
            marker.display()
        );
        let mut request = ExecRequest::new(CommandSpec::Shell(script));
        request.timeout = std::time::Duration::from_millis(150);

        let outcome = sandbox
            .run(&request, &CancellationToken::new())
            .await
            .expect("run");

        assert!(!outcome.ok);
        assert!(outcome.timed_out);
        assert!(!outcome.aborted);
        assert_eq!(outcome.status, ExecStatus::Timeout);

        // The backgrounded descendant died with the group.
        tokio::time::sleep(std::time::Duration::from_millis(700)).await;
        assert!(!marker.exists(), "descendant outlived the timeout kill");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_sets_aborted_not_timed_out() {
        let (_dir, sandbox) = sandbox();
        let mut request = ExecRequest::new(CommandSpec::Shell("sleep 30".to_string()));
        request.timeout = std::time::Duration::from_secs(60);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let outcome = sandbox.run(&request, &cancel).await.expect("run");

        assert!(outcome.aborted);
        assert!(!outcome.timed_out);
        assert_eq!(outcome.status, ExecStatus::Aborted);
        assert!(outcome.duration_ms < 5_000);
    }

    #[tokio::test]
    async fn spawn_failure_is_captured() {
        let (_dir, sandbox) = sandbox();
        let outcome = sandbox
            .run(
                &argv("definitely-not-a-real-binary-4242", &[]),
                &CancellationToken::new(),
            )
            .await
            .expect("run");

        assert!(!outcome.ok);
        assert_eq!(outcome.status, ExecStatus::SpawnError);
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn workdir_escape_rejects_before_spawn() {
        let (_dir, sandbox) = sandbox();
        let mut request = argv("echo", &["hi"]);
        request.workdir = Some("../outside".to_string());

        let err = sandbox
            .run(&request, &CancellationToken::new())
            .await
            .expect_err("must reject");
        assert!(matches!(err, ExecError::WorkdirEscape { .. }));
    }

    #[tokio::test]
    async fn empty_command_rejects() {
        let (_dir, sandbox) = sandbox();
        let err = sandbox
            .run(&argv("  ", &[]), &CancellationToken::new())
            .await
            .expect_err("must reject");
        assert!(matches!(err, ExecError::EmptyCommand));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn relative_workdir_is_honored() {
        let (dir, sandbox) = sandbox();
        std::fs::create_dir(dir.path().join("sub")).expect("mkdir");

        let mut request = ExecRequest::new(CommandSpec::Shell("pwd".to_string()));
        request.workdir = Some("sub".to_string());
        let outcome = sandbox
            .run(&request, &CancellationToken::new())
            .await
            .expect("run");

        assert!(outcome.ok);
        assert!(outcome.stdout.trim().ends_with("sub"));
    }
}
