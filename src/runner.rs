//! Subprocess execution with hard timeouts.
//!
//! Every external command keyhelm runs goes through here. A child that
//! outlives its deadline is killed and reaped, never left orphaned. Output
//! is drained on separate threads so a chatty child cannot deadlock against
//! a full pipe while we poll for exit.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::InstallerError;

/// Default deadline for inspection-grade commands.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Captured outcome of a finished command.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout and stderr concatenated, for report tails.
    pub fn combined_output(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Run a command, enforcing a hard deadline.
///
/// On timeout the child is killed and reaped and `InstallerError::Timeout`
/// is returned. Callable concurrently; no shared state.
pub fn run_with_timeout(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<CommandResult, InstallerError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout_reader = spawn_reader(child.stdout.take());
    let stderr_reader = spawn_reader(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait()? {
            Some(status) => break status,
            None if Instant::now() >= deadline => {
                kill_and_reap(&mut child);
                // Join readers so their threads do not outlive the call.
                let _ = stdout_reader.join();
                let _ = stderr_reader.join();
                return Err(InstallerError::Timeout(timeout));
            }
            None => thread::sleep(POLL_INTERVAL),
        }
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();

    Ok(CommandResult {
        // Killed-by-signal has no code; report -1 like a shell would report
        // an abnormal exit.
        exit_code: status.code().unwrap_or(-1),
        stdout,
        stderr,
    })
}

/// Run with the default timeout and fail on non-zero exit.
pub fn run_capture(program: &str, args: &[&str]) -> Result<String, InstallerError> {
    let result = run_with_timeout(program, args, DEFAULT_TIMEOUT)?;
    if result.success() {
        Ok(result.stdout.trim().to_string())
    } else {
        Err(InstallerError::CommandFailed {
            exit_code: result.exit_code,
            output: result.combined_output().trim().to_string(),
        })
    }
}

fn spawn_reader<R: Read + Send + 'static>(source: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut reader) = source {
            let _ = reader.read_to_string(&mut buf);
        }
        buf
    })
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_exit_code() {
        let result = run_with_timeout("echo", &["hello"], DEFAULT_TIMEOUT).unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.trim(), "hello");
        assert!(result.stderr.is_empty());
    }

    #[test]
    fn nonzero_exit_is_a_result_not_an_error() {
        let result = run_with_timeout("sh", &["-c", "exit 3"], DEFAULT_TIMEOUT).unwrap();
        assert_eq!(result.exit_code, 3);
        assert!(!result.success());
    }

    #[test]
    fn timeout_kills_the_child() {
        let started = Instant::now();
        let err = run_with_timeout("sleep", &["30"], Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, InstallerError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn run_capture_trims_output() {
        assert_eq!(run_capture("echo", &["  padded  "]).unwrap(), "padded");
    }

    #[test]
    fn run_capture_surfaces_failure_output() {
        let err = run_capture("sh", &["-c", "echo oops >&2; exit 1"]).unwrap_err();
        match err {
            InstallerError::CommandFailed { exit_code, output } => {
                assert_eq!(exit_code, 1);
                assert!(output.contains("oops"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn combined_output_joins_streams() {
        let result = CommandResult {
            exit_code: 0,
            stdout: "out".into(),
            stderr: "err".into(),
        };
        assert_eq!(result.combined_output(), "out\nerr");
    }
}
