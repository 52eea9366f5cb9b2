//! Action determination: observed context + declared intent → ordered
//! abstract remediation intents. Pure data in, pure data out; all side
//! effects live in recipes.

use serde::Serialize;
use std::fmt;

use crate::context::SystemContext;

/// What the caller wants from this reconciliation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallIntent {
    Install,
    Repair,
    InspectOnly,
    Uninstall,
}

/// Closed vocabulary of remediation intents. Every variant must have a
/// recipe mapping in `plan::recipe_for`; the compiler enforces the match is
/// total there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbstractAction {
    ResolveMechanismConflict,
    TerminateConflictingProcesses,
    InstallBundledBinary,
    VerifyDriverPresence,
    FixDriverVersionMismatch,
    InstallVhidServices,
    ActivateVhidManager,
    InstallDaemonService,
    RestartUnhealthyServices,
    SyncConfigPaths,
    InstallLogRotation,
    UninstallAll,
}

impl fmt::Display for AbstractAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ResolveMechanismConflict => "resolve-mechanism-conflict",
            Self::TerminateConflictingProcesses => "terminate-conflicting-processes",
            Self::InstallBundledBinary => "install-bundled-binary",
            Self::VerifyDriverPresence => "verify-driver-presence",
            Self::FixDriverVersionMismatch => "fix-driver-version-mismatch",
            Self::InstallVhidServices => "install-vhid-services",
            Self::ActivateVhidManager => "activate-vhid-manager",
            Self::InstallDaemonService => "install-daemon-service",
            Self::RestartUnhealthyServices => "restart-unhealthy-services",
            Self::SyncConfigPaths => "sync-config-paths",
            Self::InstallLogRotation => "install-log-rotation",
            Self::UninstallAll => "uninstall-all",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for AbstractAction {
    type Err = crate::error::InstallerError;

    /// Parse the kebab-case action name a UI or `--only` flag surfaces.
    /// An unknown name is a defect-grade error, never a silent no-op.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let action = match s {
            "resolve-mechanism-conflict" => Self::ResolveMechanismConflict,
            "terminate-conflicting-processes" => Self::TerminateConflictingProcesses,
            "install-bundled-binary" => Self::InstallBundledBinary,
            "verify-driver-presence" => Self::VerifyDriverPresence,
            "fix-driver-version-mismatch" => Self::FixDriverVersionMismatch,
            "install-vhid-services" => Self::InstallVhidServices,
            "activate-vhid-manager" => Self::ActivateVhidManager,
            "install-daemon-service" => Self::InstallDaemonService,
            "restart-unhealthy-services" => Self::RestartUnhealthyServices,
            "sync-config-paths" => Self::SyncConfigPaths,
            "install-log-rotation" => Self::InstallLogRotation,
            "uninstall-all" => Self::UninstallAll,
            other => {
                return Err(crate::error::InstallerError::UnknownRecipe {
                    action: other.to_string(),
                });
            }
        };
        Ok(action)
    }
}

/// Determine remediation actions for an intent against a snapshot.
///
/// Conflict resolution always comes first when conflicts are present,
/// regardless of what other issues exist.
pub fn determine_actions(intent: InstallIntent, ctx: &SystemContext) -> Vec<AbstractAction> {
    match intent {
        InstallIntent::InspectOnly => Vec::new(),
        InstallIntent::Uninstall => vec![AbstractAction::UninstallAll],
        InstallIntent::Install => converge_actions(ctx, true),
        InstallIntent::Repair => converge_actions(ctx, false),
    }
}

fn converge_actions(ctx: &SystemContext, baseline: bool) -> Vec<AbstractAction> {
    let mut actions = Vec::new();

    // Conflicts first, always.
    if ctx.daemon_state == crate::state::ManagementState::Conflicted {
        actions.push(AbstractAction::ResolveMechanismConflict);
    }
    if !ctx.conflicting_pids.is_empty() {
        actions.push(AbstractAction::TerminateConflictingProcesses);
    }

    if baseline || !ctx.kanata_binary_installed {
        actions.push(AbstractAction::InstallBundledBinary);
    }

    // The driver package is installed externally; when it is absent the
    // plan carries an explicit requirement check so the run fails with a
    // precise reason instead of an opaque service-start error.
    if !ctx.driver_installed {
        actions.push(AbstractAction::VerifyDriverPresence);
    }
    if ctx.driver_installed && !ctx.driver_version_ok {
        actions.push(AbstractAction::FixDriverVersionMismatch);
    }

    let vhid_missing = !ctx.vhid_daemon.loaded || !ctx.vhid_manager.loaded;
    if baseline || vhid_missing {
        actions.push(AbstractAction::InstallVhidServices);
    }
    if baseline || !ctx.vhid_manager.loaded || !ctx.vhid_manager.healthy {
        actions.push(AbstractAction::ActivateVhidManager);
    }

    // The primary daemon: install only when no mechanism already owns it;
    // a legacy install under modern ownership would regress the mechanism.
    if (baseline && !ctx.daemon_state.suppresses_install()) || ctx.daemon_needs_install() {
        actions.push(AbstractAction::InstallDaemonService);
    }

    if ctx.kanata.needs_restart() || ctx.vhid_daemon.needs_restart() {
        actions.push(AbstractAction::RestartUnhealthyServices);
    }

    if baseline || !ctx.config_synced {
        actions.push(AbstractAction::SyncConfigPaths);
    }
    if baseline || !ctx.log_rotation_installed {
        actions.push(AbstractAction::InstallLogRotation);
    }

    actions
}
