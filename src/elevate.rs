//! Privileged batch execution with a single elevation grant.
//!
//! Privileged work is never requested for the whole process. Instead:
//! 1. Recipes describe privileged operations as structured commands
//!    (program + argument list), never pre-rendered shell text.
//! 2. A broker acquires elevation at most once per plan (`prepare`).
//! 3. Each batch is rendered into shell text in exactly one place and run
//!    with `sudo -n`, joined by `&&` so a failure aborts the remainder.
//! 4. The grant is released when the broker is dropped.
//!
//! Two strategies exist, selected once at process start: an interactive one
//! that shows the justification and prompts for credentials, and a
//! non-interactive one for automation that requires a pre-provisioned
//! passwordless grant and fails immediately without one.

use std::process::Command;
use std::time::Duration;

use crate::error::InstallerError;
use crate::paths;
use crate::runner;

/// Deadline for a privileged batch; generous because launchd bootstrap can
/// stall while the service manager settles.
const BATCH_TIMEOUT: Duration = Duration::from_secs(120);

/// A privileged operation as structured data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivilegedCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl PrivilegedCommand {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
        }
    }

    /// Render as a single shell word sequence with every argument quoted.
    pub fn render(&self) -> String {
        let mut rendered = shell_quote(&self.program);
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(&shell_quote(arg));
        }
        rendered
    }
}

/// Quote a string for POSIX sh. Single quotes with the usual `'\''` escape;
/// plain words pass through untouched for readable logs.
fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '-' | '_' | ':' | '='));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Join a batch with `&&`: one shell invocation, fail-fast, no partial
/// silent continuation.
pub fn render_batch(commands: &[PrivilegedCommand]) -> String {
    commands
        .iter()
        .map(PrivilegedCommand::render)
        .collect::<Vec<_>>()
        .join(" && ")
}

/// Output of a privileged batch.
#[derive(Debug, Clone)]
pub struct BatchOutput {
    pub success: bool,
    pub combined_output: String,
}

/// Elevation strategy seam. Production brokers wrap sudo; tests substitute
/// recording fakes.
pub trait PrivilegeBroker {
    /// Acquire the elevation grant, prompting at most once. Idempotent for
    /// the broker's lifetime.
    fn prepare(&self, justification: &str) -> Result<(), InstallerError>;

    /// Execute one batch under the already-acquired grant. Must never
    /// prompt; `prepare` owns the prompt.
    fn execute_batch(
        &self,
        commands: &[PrivilegedCommand],
        justification: &str,
    ) -> Result<BatchOutput, InstallerError>;
}

/// Interactive strategy: shows the justification, validates sudo (which
/// prompts for a password), then runs batches with the cached credential.
pub struct InteractiveBroker;

impl PrivilegeBroker for InteractiveBroker {
    fn prepare(&self, justification: &str) -> Result<(), InstallerError> {
        eprintln!();
        eprintln!("  Administrator access required: {justification}");
        eprintln!();

        let status = Command::new("sudo").args(["-v"]).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(InstallerError::ElevationDeclined)
        }
    }

    fn execute_batch(
        &self,
        commands: &[PrivilegedCommand],
        justification: &str,
    ) -> Result<BatchOutput, InstallerError> {
        run_under_sudo(commands, justification)
    }
}

impl Drop for InteractiveBroker {
    fn drop(&mut self) {
        // Invalidate the sudo timestamp so the grant does not outlive the run.
        let _ = Command::new("sudo").args(["-k"]).status();
    }
}

/// Non-interactive strategy for automation. Requires a pre-provisioned
/// passwordless grant; refuses to downgrade to interactive prompting.
pub struct NonInteractiveBroker;

impl PrivilegeBroker for NonInteractiveBroker {
    fn prepare(&self, _justification: &str) -> Result<(), InstallerError> {
        let provisioned = Command::new("sudo")
            .args(["-n", "true"])
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if provisioned {
            Ok(())
        } else {
            Err(InstallerError::ElevationUnavailable)
        }
    }

    fn execute_batch(
        &self,
        commands: &[PrivilegedCommand],
        justification: &str,
    ) -> Result<BatchOutput, InstallerError> {
        run_under_sudo(commands, justification)
    }
}

fn run_under_sudo(
    commands: &[PrivilegedCommand],
    justification: &str,
) -> Result<BatchOutput, InstallerError> {
    if commands.is_empty() {
        return Ok(BatchOutput {
            success: true,
            combined_output: String::new(),
        });
    }

    let script = render_batch(commands);
    log::debug!("privileged batch ({justification}): {script}");

    // -n: the prompt already happened in prepare(); a lapsed grant must
    // surface as an error rather than a hidden second prompt.
    let result = runner::run_with_timeout("sudo", &["-n", "sh", "-c", &script], BATCH_TIMEOUT)?;

    if result.success() {
        Ok(BatchOutput {
            success: true,
            combined_output: result.combined_output(),
        })
    } else {
        Err(InstallerError::CommandFailed {
            exit_code: result.exit_code,
            output: result.combined_output().trim().to_string(),
        })
    }
}

/// Select the elevation strategy once at process start.
pub fn broker_from_env() -> Box<dyn PrivilegeBroker> {
    if paths::noninteractive_sudo() {
        log::info!("using non-interactive elevation strategy");
        Box::new(NonInteractiveBroker)
    } else {
        Box::new(InteractiveBroker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_words_are_not_quoted() {
        assert_eq!(shell_quote("/bin/launchctl"), "/bin/launchctl");
        assert_eq!(shell_quote("kickstart"), "kickstart");
        assert_eq!(shell_quote("-k"), "-k");
    }

    #[test]
    fn spaces_and_quotes_are_escaped() {
        assert_eq!(
            shell_quote("/Library/Application Support/x"),
            "'/Library/Application Support/x'"
        );
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn render_joins_program_and_args() {
        let cmd = PrivilegedCommand::new("/bin/launchctl", &["kickstart", "-k", "system/x"]);
        assert_eq!(cmd.render(), "/bin/launchctl kickstart -k system/x");
    }

    #[test]
    fn batch_joins_with_logical_and() {
        let batch = [
            PrivilegedCommand::new("/bin/mkdir", &["-p", "/tmp/a"]),
            PrivilegedCommand::new("/bin/cp", &["a", "b"]),
        ];
        assert_eq!(render_batch(&batch), "/bin/mkdir -p /tmp/a && /bin/cp a b");
    }

    #[test]
    fn empty_batch_renders_empty() {
        assert_eq!(render_batch(&[]), "");
    }

    #[test]
    fn injection_prone_argument_stays_inert() {
        let cmd = PrivilegedCommand::new("/bin/rm", &["-f", "/tmp/x; touch /tmp/pwned"]);
        assert_eq!(cmd.render(), "/bin/rm -f '/tmp/x; touch /tmp/pwned'");
    }
}
