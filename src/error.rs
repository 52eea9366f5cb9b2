//! Error taxonomy for the installer.
//!
//! Every failure a reconciliation cycle can hit maps to one variant, and
//! every message is a complete sentence a user can act on without reading
//! source code.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstallerError {
    #[error("Administrator access was declined; no changes were made")]
    ElevationDeclined,

    #[error(
        "Administrator access is unavailable: non-interactive mode requires a \
         pre-provisioned passwordless sudo grant"
    )]
    ElevationUnavailable,

    #[error("Command exited with status {exit_code}: {output}")]
    CommandFailed { exit_code: i32, output: String },

    #[error("Command did not finish within {0:?} and was terminated")]
    Timeout(Duration),

    #[error("Service {service} did not reach a healthy state after remediation")]
    HealthCheckFailed { service: String },

    #[error("Execution is blocked by an unmet requirement: {requirement}")]
    BlockedByRequirement { requirement: String },

    #[error("Unknown remediation action '{action}'")]
    UnknownRecipe { action: String },

    #[error(
        "Service {label} is registered but launchd never loaded it; recovery \
         failed, a reboot may be required"
    )]
    BrokenRegistration { label: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_failure_names_status_and_output() {
        let err = InstallerError::CommandFailed {
            exit_code: 78,
            output: "Bootstrap failed: 5: Input/output error".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("78"));
        assert!(msg.contains("Bootstrap failed"));
    }

    #[test]
    fn io_errors_convert() {
        fn fails() -> Result<(), InstallerError> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(InstallerError::Io(_))));
    }

    #[test]
    fn broken_registration_suggests_reboot() {
        let err = InstallerError::BrokenRegistration {
            label: "com.keyhelm.kanata".into(),
        };
        assert!(err.to_string().contains("reboot"));
    }
}
