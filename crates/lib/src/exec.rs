//! Execution sandbox: run one approved command with a timeout, an output cap and a fixed
//! working directory.
//!
//! No shell is used; the program is spawned directly with its argument list, so shell
//! metacharacters in arguments are passed through literally. The sandbox holds no privilege
//! escalation logic: whatever reaches it runs as the current user.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::config::TerminalConfig;
use crate::gatekeeper::{ExecutionResult, Outcome};

/// Per-stream capture limit (1 MiB).
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;
/// Wait after the termination signal before giving up on the process.
pub const DEFAULT_GRACE_MS: u64 = 1_000;
/// Upper bound for a configured grace period.
pub const MAX_GRACE_MS: u64 = 1_500;

const NO_OUTPUT: &str = "(no output)";
const READ_CHUNK: usize = 8 * 1024;
const REAP_AFTER_KILL: Duration = Duration::from_millis(100);

/// Why the process could not be started.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("{0}: command not found")]
    NotFound(String),
    #[error("{program}: working directory {dir} is not available")]
    WorkingDir { program: String, dir: String },
    #[error("{program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Sandbox constraints shared by every invocation (the timeout comes from the policy entry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSettings {
    pub working_dir: PathBuf,
    pub max_output_bytes: usize,
    pub grace: Duration,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            working_dir: dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            grace: Duration::from_millis(DEFAULT_GRACE_MS),
        }
    }
}

impl SandboxSettings {
    /// Build settings from the `terminal` config section. Grace is capped at [`MAX_GRACE_MS`].
    pub fn from_config(config: &TerminalConfig) -> Self {
        let defaults = Self::default();
        Self {
            working_dir: config
                .working_dir
                .clone()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(defaults.working_dir),
            max_output_bytes: config.max_output_bytes.max(1),
            grace: Duration::from_millis(config.grace_ms.min(MAX_GRACE_MS)),
        }
    }

    pub fn request(&self, program: &str, args: &[String], timeout_ms: u64) -> SandboxRequest {
        SandboxRequest {
            program: program.to_string(),
            args: args.to_vec(),
            timeout: Duration::from_millis(timeout_ms),
            working_dir: self.working_dir.clone(),
            max_output_bytes: self.max_output_bytes,
            grace: self.grace,
        }
    }
}

/// One process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxRequest {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub working_dir: PathBuf,
    pub max_output_bytes: usize,
    pub grace: Duration,
}

/// Captured streams (each bounded by the output cap).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
}

/// What happened to the process.
#[derive(Debug)]
pub enum RunOutcome {
    Completed {
        exit_code: Option<i32>,
        output: CapturedOutput,
    },
    TimedOut {
        partial: CapturedOutput,
    },
    SpawnFailed(SpawnError),
}

/// Runs approved commands. [`Sandbox`] spawns real processes; tests substitute their own.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, request: &SandboxRequest) -> RunOutcome;
}

/// Process-spawning runner.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sandbox;

#[async_trait]
impl CommandRunner for Sandbox {
    async fn run(&self, request: &SandboxRequest) -> RunOutcome {
        run_process(request).await
    }
}

#[derive(Debug, Default)]
struct Capture {
    bytes: Vec<u8>,
    truncated: bool,
}

type SharedCapture = Arc<Mutex<Capture>>;

fn with_capture<T>(capture: &SharedCapture, f: impl FnOnce(&mut Capture) -> T) -> T {
    let mut guard = capture.lock().unwrap_or_else(|e| e.into_inner());
    f(&mut guard)
}

/// Read a stream to EOF, keeping at most `cap` bytes and discarding the rest so the child never blocks on a full pipe.
async fn drain<R: AsyncRead + Unpin>(mut reader: R, capture: SharedCapture, cap: usize) {
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log::debug!("sandbox: read error: {}", e);
                break;
            }
        };
        with_capture(&capture, |c| {
            if c.truncated {
                return;
            }
            let room = cap.saturating_sub(c.bytes.len());
            let keep = n.min(room);
            c.bytes.extend_from_slice(&chunk[..keep]);
            if keep < n {
                c.truncated = true;
                let end = complete_utf8_len(&c.bytes);
                c.bytes.truncate(end);
            }
        });
    }
}

/// Length of `bytes` without a trailing incomplete UTF-8 sequence.
fn complete_utf8_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for i in (len.saturating_sub(3)..len).rev() {
        let width = match bytes[i] {
            0x80..=0xBF => continue,
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if i + width > len { i } else { len };
    }
    len
}

fn spawn_drain<R>(reader: Option<R>, capture: &SharedCapture, cap: usize) -> Option<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    reader.map(|r| tokio::spawn(drain(r, capture.clone(), cap)))
}

fn snapshot(stdout: &SharedCapture, stderr: &SharedCapture) -> CapturedOutput {
    let (out, out_truncated) = with_capture(stdout, |c| {
        (String::from_utf8_lossy(&c.bytes).into_owned(), c.truncated)
    });
    let (err, err_truncated) = with_capture(stderr, |c| {
        (String::from_utf8_lossy(&c.bytes).into_owned(), c.truncated)
    });
    CapturedOutput {
        stdout: out,
        stderr: err,
        truncated: out_truncated || err_truncated,
    }
}

/// Wait for reader tasks after the process exited; a grandchild holding the pipe open must not block us past `limit`.
async fn finish_readers(readers: Vec<JoinHandle<()>>, limit: Duration) {
    let deadline = tokio::time::Instant::now() + limit;
    for mut handle in readers {
        if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
            log::debug!("sandbox: output reader still open after exit, abandoning");
            handle.abort();
        }
    }
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: libc::c_int) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    // SAFETY: kill(2) has no memory-safety preconditions; the negative pid addresses the
    // process group created for this child at spawn time.
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
    if rc != 0 {
        log::warn!(
            "sandbox: signal {} to process group {} failed: {}",
            signal,
            pid,
            std::io::Error::last_os_error()
        );
        return false;
    }
    true
}

/// SIGTERM the process group, wait up to `grace`, then SIGKILL and reap.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    signal_group(child, libc::SIGTERM);
    #[cfg(not(unix))]
    if let Err(e) = child.start_kill() {
        log::warn!("sandbox: kill failed: {}", e);
    }

    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        return;
    }
    log::warn!("sandbox: process ignored termination, sending kill");
    #[cfg(unix)]
    signal_group(child, libc::SIGKILL);
    if let Err(e) = child.start_kill() {
        log::warn!("sandbox: kill failed: {}", e);
    }
    if tokio::time::timeout(REAP_AFTER_KILL, child.wait()).await.is_err() {
        log::warn!("sandbox: process not reaped after kill");
    }
}

async fn run_process(request: &SandboxRequest) -> RunOutcome {
    if !request.working_dir.is_dir() {
        return RunOutcome::SpawnFailed(SpawnError::WorkingDir {
            program: request.program.clone(),
            dir: request.working_dir.display().to_string(),
        });
    }

    let mut cmd = Command::new(&request.program);
    cmd.args(&request.args)
        .current_dir(&request.working_dir)
        .env("PAGER", "cat")
        .env("GIT_PAGER", "cat")
        .env("SYSTEMD_PAGER", "cat")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return RunOutcome::SpawnFailed(SpawnError::NotFound(request.program.clone()));
        }
        Err(e) => {
            return RunOutcome::SpawnFailed(SpawnError::Io {
                program: request.program.clone(),
                source: e,
            });
        }
    };

    let stdout = SharedCapture::default();
    let stderr = SharedCapture::default();
    let readers: Vec<JoinHandle<()>> = [
        spawn_drain(child.stdout.take(), &stdout, request.max_output_bytes),
        spawn_drain(child.stderr.take(), &stderr, request.max_output_bytes),
    ]
    .into_iter()
    .flatten()
    .collect();

    match tokio::time::timeout(request.timeout, child.wait()).await {
        Ok(Ok(status)) => {
            finish_readers(readers, request.grace).await;
            RunOutcome::Completed {
                exit_code: status.code(),
                output: snapshot(&stdout, &stderr),
            }
        }
        Ok(Err(e)) => {
            for r in readers {
                r.abort();
            }
            RunOutcome::SpawnFailed(SpawnError::Io {
                program: request.program.clone(),
                source: e,
            })
        }
        Err(_) => {
            terminate(&mut child, request.grace).await;
            for r in readers {
                r.abort();
            }
            RunOutcome::TimedOut {
                partial: snapshot(&stdout, &stderr),
            }
        }
    }
}

fn with_truncation_note(mut text: String, truncated: bool, cap: usize) -> String {
    if truncated {
        text.push_str(&format!("\n[output truncated at {} bytes]", cap));
    }
    text
}

impl RunOutcome {
    /// Shape the outcome into the caller-facing result.
    pub fn into_result(self, request: &SandboxRequest) -> ExecutionResult {
        let cap = request.max_output_bytes;
        match self {
            RunOutcome::Completed { exit_code, output } => {
                let stdout = output.stdout.trim();
                let stderr = output.stderr.trim();
                if exit_code == Some(0) {
                    let text = if !stdout.is_empty() {
                        stdout
                    } else if !stderr.is_empty() {
                        stderr
                    } else {
                        NO_OUTPUT
                    };
                    ExecutionResult {
                        exit_code,
                        truncated: output.truncated,
                        ..ExecutionResult::success(with_truncation_note(
                            text.to_string(),
                            output.truncated,
                            cap,
                        ))
                    }
                } else {
                    let text = if !stderr.is_empty() {
                        stderr.to_string()
                    } else if !stdout.is_empty() {
                        stdout.to_string()
                    } else {
                        match exit_code {
                            Some(code) => format!("{}: exited with status {}", request.program, code),
                            None => format!("{}: terminated by signal", request.program),
                        }
                    };
                    ExecutionResult {
                        exit_code,
                        truncated: output.truncated,
                        ..ExecutionResult::failure(
                            Outcome::NonZeroExit,
                            with_truncation_note(text, output.truncated, cap),
                        )
                    }
                }
            }
            RunOutcome::TimedOut { partial } => {
                let mut text = format!(
                    "{}: command timed out after {} ms",
                    request.program,
                    request.timeout.as_millis()
                );
                let stdout = partial.stdout.trim();
                if !stdout.is_empty() {
                    text.push('\n');
                    text.push_str(stdout);
                }
                ExecutionResult {
                    timed_out: true,
                    truncated: partial.truncated,
                    ..ExecutionResult::failure(
                        Outcome::Timeout,
                        with_truncation_note(text, partial.truncated, cap),
                    )
                }
            }
            RunOutcome::SpawnFailed(e) => {
                ExecutionResult::failure(Outcome::SpawnFailure, e.to_string())
            }
        }
    }
}
