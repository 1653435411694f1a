//! Test command runner
//!
//! Executes a shell command with a timeout, capturing stdout, stderr and the
//! exit code. A non-zero exit is an ordinary result; only a command that
//! cannot be launched at all is an error.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use crate::error::RunnerError;

const POLL_INTERVAL: Duration = Duration::from_millis(25);
/// How long to wait for output pipes to drain once the process is gone
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Exit code reserved for "never started" or "killed on timeout"
pub const EXIT_CODE_UNAVAILABLE: i32 = -1;

/// Outcome of one test command execution
#[derive(Debug, Clone, PartialEq)]
pub struct TestCommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl TestCommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Runs test commands through the platform shell
#[derive(Debug, Clone, Default)]
pub struct TestCommandRunner;

impl TestCommandRunner {
    pub fn new() -> Self {
        Self
    }

    /// Run `command` in `working_dir`, killing it and its descendants after `timeout`
    pub fn run(
        &self,
        command: &str,
        working_dir: &Path,
        timeout: Duration,
    ) -> Result<TestCommandResult, RunnerError> {
        if !working_dir.is_dir() {
            return Err(RunnerError::WorkingDir(working_dir.to_path_buf()));
        }

        tracing::info!(command, cwd = %working_dir.display(), "running test command");

        let start = Instant::now();
        let mut cmd = shell_command(command);
        cmd.current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        isolate_process_group(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| RunnerError::Launch {
            command: command.to_string(),
            source,
        })?;

        let stdout = OutputCapture::spawn(child.stdout.take());
        let stderr = OutputCapture::spawn(child.stderr.take());

        let status = wait_with_timeout(&mut child, timeout);
        let duration_ms = start.elapsed().as_millis() as u64;

        let result = match status {
            Some(status) => {
                stdout.wait(DRAIN_GRACE);
                stderr.wait(DRAIN_GRACE);
                let exit_code = exit_code(status);

                if exit_code != 0 {
                    tracing::warn!(exit_code, duration_ms, "test command exited with non-zero status");
                } else {
                    tracing::info!(duration_ms, "test command succeeded");
                }

                TestCommandResult {
                    exit_code,
                    stdout: stdout.contents(),
                    stderr: stderr.contents(),
                    timed_out: false,
                    duration_ms,
                }
            }
            None => {
                tracing::error!(timeout_secs = timeout.as_secs_f64(), "test command timed out");
                stdout.wait(POLL_INTERVAL * 8);
                stderr.wait(POLL_INTERVAL * 8);

                let mut stderr_text = stderr.contents();
                if !stderr_text.is_empty() && !stderr_text.ends_with('\n') {
                    stderr_text.push('\n');
                }
                stderr_text.push_str(&format!(
                    "Test command timed out after {:.1} seconds",
                    timeout.as_secs_f64()
                ));

                TestCommandResult {
                    exit_code: EXIT_CODE_UNAVAILABLE,
                    stdout: stdout.contents(),
                    stderr: stderr_text,
                    timed_out: true,
                    duration_ms,
                }
            }
        };

        tracing::debug!(stdout = %result.stdout, stderr = %result.stderr, "test command output");
        Ok(result)
    }

    /// Run and also report the wall-clock time the command was started at
    pub fn run_timed(
        &self,
        command: &str,
        working_dir: &Path,
        timeout: Duration,
    ) -> Result<(SystemTime, TestCommandResult), RunnerError> {
        let started = SystemTime::now();
        let result = self.run(command, working_dir, timeout)?;
        Ok((started, result))
    }
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(not(unix))]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

#[cfg(unix)]
fn isolate_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    // The child leads a new group so a timeout can take down its descendants too
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn kill_process_tree(child: &mut Child) {
    let pgid = child.id() as libc::pid_t;
    // SAFETY: kill(2) with a negative pid only sends a signal to that process group
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill_process_tree(child: &mut Child) {
    let _ = child.kill();
}

/// Poll the child until it exits or `timeout` elapses; `None` means it was killed
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    let start = Instant::now();

    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {}
            Err(e) => {
                tracing::error!(error = %e, "failed to poll test command");
                kill_process_tree(child);
                let _ = child.wait();
                return None;
            }
        }

        if start.elapsed() >= timeout {
            kill_process_tree(child);
            let _ = child.wait();
            return None;
        }

        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(EXIT_CODE_UNAVAILABLE)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(EXIT_CODE_UNAVAILABLE)
}

/// Background reader draining one output pipe into a shared buffer
///
/// The buffer stays readable while the reader is still running, so a killed
/// process still yields whatever it printed before termination.
struct OutputCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl OutputCapture {
    fn spawn<R: Read + Send + 'static>(pipe: Option<R>) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));

        let handle = pipe.map(|mut pipe| {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                let mut chunk = [0u8; 8192];
                loop {
                    match pipe.read(&mut chunk) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if let Ok(mut buf) = buffer.lock() {
                                buf.extend_from_slice(&chunk[..n]);
                            }
                        }
                    }
                }
            })
        });

        Self { buffer, handle }
    }

    /// Wait up to `grace` for the pipe to reach EOF
    ///
    /// A background grandchild can keep the pipe open indefinitely; in that
    /// case the reader is left detached and the output so far is used.
    fn wait(&self, grace: Duration) {
        let Some(handle) = self.handle.as_ref() else {
            return;
        };
        let start = Instant::now();
        while !handle.is_finished() && start.elapsed() < grace {
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn contents(&self) -> String {
        self.buffer
            .lock()
            .map(|buf| String::from_utf8_lossy(&buf).into_owned())
            .unwrap_or_default()
    }
}

impl Drop for OutputCapture {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}
