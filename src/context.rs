//! Immutable system snapshot.
//!
//! A `SystemContext` is produced fresh on every inspection and never
//! mutated afterwards; planning and display both consume the same snapshot
//! so they can never disagree about what was observed.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::health::ServiceKind;
use crate::state::ManagementState;

/// Best-effort permission verdict for one principal. macOS offers no
/// unprivileged query for input-monitoring grants, so this derives from run
/// and respond evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    Granted,
    Denied,
    Unknown,
}

/// Observed load/health for one managed service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub label: String,
    pub kind: ServiceKind,
    /// The service manager has a loaded entry for the label.
    pub loaded: bool,
    /// Health per the policy for `kind`, warm-up credit included.
    pub healthy: bool,
}

impl ServiceStatus {
    pub fn needs_restart(&self) -> bool {
        self.loaded && !self.healthy && self.kind == ServiceKind::KeepAlive
    }
}

/// Everything one reconciliation cycle knows about the system.
#[derive(Debug, Clone, Serialize)]
pub struct SystemContext {
    pub captured_at: DateTime<Utc>,

    /// Permission verdicts for the two principals.
    pub app_permissions: PermissionStatus,
    pub daemon_permissions: PermissionStatus,

    /// Component installation evidence.
    pub kanata_binary_installed: bool,
    pub driver_installed: bool,
    /// Installed driver version matches the bundled requirement.
    pub driver_version_ok: bool,
    pub helper_ready: bool,
    pub config_synced: bool,
    pub log_rotation_installed: bool,

    /// Per-service observations.
    pub kanata: ServiceStatus,
    pub vhid_daemon: ServiceStatus,
    pub vhid_manager: ServiceStatus,

    /// Which mechanism owns the primary daemon.
    pub daemon_state: ManagementState,
    /// Advisory TCP probe result for the daemon.
    pub daemon_responding: bool,

    /// kanata processes not owned by the service manager.
    pub conflicting_pids: Vec<i32>,
}

impl SystemContext {
    /// Conflicts of either kind: mechanism ownership or rogue processes.
    pub fn has_conflicts(&self) -> bool {
        self.daemon_state == ManagementState::Conflicted || !self.conflicting_pids.is_empty()
    }

    /// The daemon needs installing: not loaded and no mechanism that would
    /// object to a fresh legacy install.
    pub fn daemon_needs_install(&self) -> bool {
        !self.kanata.loaded && !self.daemon_state.suppresses_install()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::paths;

    fn service(label: &str, kind: ServiceKind, loaded: bool, healthy: bool) -> ServiceStatus {
        ServiceStatus {
            label: label.to_string(),
            kind,
            loaded,
            healthy,
        }
    }

    /// A fully converged, healthy system.
    pub fn converged() -> SystemContext {
        SystemContext {
            captured_at: Utc::now(),
            app_permissions: PermissionStatus::Granted,
            daemon_permissions: PermissionStatus::Granted,
            kanata_binary_installed: true,
            driver_installed: true,
            driver_version_ok: true,
            helper_ready: true,
            config_synced: true,
            log_rotation_installed: true,
            kanata: service(paths::KANATA_LABEL, ServiceKind::KeepAlive, true, true),
            vhid_daemon: service(paths::VHID_DAEMON_LABEL, ServiceKind::KeepAlive, true, true),
            vhid_manager: service(paths::VHID_MANAGER_LABEL, ServiceKind::OneShot, true, true),
            daemon_state: ManagementState::ModernActive,
            daemon_responding: true,
            conflicting_pids: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::converged;
    use super::*;
    use crate::state::ManagementState;

    #[test]
    fn converged_context_has_no_conflicts() {
        let ctx = converged();
        assert!(!ctx.has_conflicts());
        assert!(!ctx.daemon_needs_install());
    }

    #[test]
    fn rogue_pids_are_conflicts() {
        let mut ctx = converged();
        ctx.conflicting_pids = vec![123];
        assert!(ctx.has_conflicts());
    }

    #[test]
    fn modern_ownership_suppresses_install() {
        let mut ctx = converged();
        ctx.kanata.loaded = false;
        // ModernActive still owns the daemon: installing a legacy descriptor
        // would regress it.
        assert!(!ctx.daemon_needs_install());

        ctx.daemon_state = ManagementState::Uninstalled;
        assert!(ctx.daemon_needs_install());
    }

    #[test]
    fn context_serializes_for_json_inspect() {
        let ctx = converged();
        let json = serde_json::to_string(&ctx).unwrap();
        assert!(json.contains("com.keyhelm.kanata"));
        assert!(json.contains("modern_active"));
    }
}
