//! Management state resolution for the primary daemon.
//!
//! The kanata daemon can be owned by the legacy LaunchDaemon descriptor or
//! by the modern registration API; the two driver services only ever use
//! the legacy mechanism. State is derived, never stored: every inspection
//! recomputes it from raw evidence, which keeps the decision tree in one
//! place instead of drifting copies per consumer.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::health::LaunchdServiceInfo;
use crate::paths;
use crate::runner;

/// Which mechanism currently owns the daemon. Exactly one state holds at
/// any inspection instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagementState {
    Uninstalled,
    /// The legacy descriptor file owns the service.
    LegacyActive,
    /// The modern registration API owns it and is enabled.
    ModernActive,
    /// Registered via the modern API but awaiting user approval.
    ModernPending,
    /// Both mechanisms are simultaneously present. Always takes precedence
    /// in remediation ordering.
    Conflicted,
    /// Process evidence exists but the mechanism cannot be determined.
    Unknown,
}

impl ManagementState {
    /// The modern mechanism owns (or is about to own) the daemon; installing
    /// a legacy descriptor would regress it and is forbidden.
    pub fn is_modern_managed(&self) -> bool {
        matches!(self, Self::ModernActive | Self::ModernPending)
    }

    /// `Unknown` with live process evidence is treated as probably
    /// modern-managed so we do not fight an already-working daemon.
    pub fn suppresses_install(&self) -> bool {
        self.is_modern_managed() || matches!(self, Self::Unknown)
    }
}

/// Status reported by the modern registration API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Enabled,
    RequiresApproval,
    NotFound,
}

/// Raw evidence an inspection gathers before classification.
#[derive(Debug, Clone, Copy)]
pub struct ManagementEvidence {
    pub legacy_plist_present: bool,
    pub registration: RegistrationStatus,
    pub process_alive: bool,
}

/// Classify the evidence. Short-circuit order matters: conflict detection
/// first, then modern, then legacy, then ambiguity.
pub fn resolve(evidence: &ManagementEvidence) -> ManagementState {
    if evidence.legacy_plist_present && evidence.registration == RegistrationStatus::Enabled {
        return ManagementState::Conflicted;
    }
    match evidence.registration {
        RegistrationStatus::Enabled => return ManagementState::ModernActive,
        RegistrationStatus::RequiresApproval => return ManagementState::ModernPending,
        RegistrationStatus::NotFound => {}
    }
    if evidence.legacy_plist_present {
        return ManagementState::LegacyActive;
    }
    if evidence.process_alive {
        return ManagementState::Unknown;
    }
    ManagementState::Uninstalled
}

/// The known launchd defect: the registration API accepted the service but
/// the service manager never attempts a load. Detected as "enabled" with no
/// process evidence once the warm-up window has lapsed.
pub fn is_registered_but_not_loaded(
    registration: RegistrationStatus,
    info: Option<&LaunchdServiceInfo>,
    warmed: bool,
) -> bool {
    if registration != RegistrationStatus::Enabled || warmed {
        return false;
    }
    match info {
        None => true,
        Some(info) => {
            info.pid.is_none()
                && !matches!(info.state.as_deref(), Some("running" | "launching"))
        }
    }
}

/// Seam over the modern registration API for the primary daemon.
pub trait RegistrationApi {
    fn status(&self) -> RegistrationStatus;
    fn register(&self) -> Result<()>;
    fn unregister(&self) -> Result<()>;

    /// Whether the backing mechanism is present at all.
    fn ready(&self) -> bool {
        true
    }
}

/// Production implementation backed by the bundled helper binary, which
/// owns the actual SMAppService calls.
pub struct HelperRegistrationApi {
    helper: PathBuf,
}

impl HelperRegistrationApi {
    pub fn new() -> Self {
        Self {
            helper: paths::registration_helper_path(),
        }
    }

    pub fn helper_ready(&self) -> bool {
        self.helper.is_file()
    }
}

impl Default for HelperRegistrationApi {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistrationApi for HelperRegistrationApi {
    fn status(&self) -> RegistrationStatus {
        if !self.helper_ready() {
            return RegistrationStatus::NotFound;
        }
        let helper = self.helper.to_string_lossy();
        match runner::run_with_timeout(
            &helper,
            &["--registration-status"],
            Duration::from_secs(10),
        ) {
            Ok(result) if result.success() => match result.stdout.trim() {
                "enabled" => RegistrationStatus::Enabled,
                "requires-approval" => RegistrationStatus::RequiresApproval,
                _ => RegistrationStatus::NotFound,
            },
            _ => RegistrationStatus::NotFound,
        }
    }

    fn register(&self) -> Result<()> {
        let helper = self.helper.to_string_lossy().into_owned();
        runner::run_capture(&helper, &["--register"])
            .context("Registration helper failed to register the daemon")?;
        Ok(())
    }

    fn unregister(&self) -> Result<()> {
        let helper = self.helper.to_string_lossy().into_owned();
        runner::run_capture(&helper, &["--unregister"])
            .context("Registration helper failed to unregister the daemon")?;
        Ok(())
    }

    fn ready(&self) -> bool {
        self.helper_ready()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evidence(
        legacy: bool,
        registration: RegistrationStatus,
        alive: bool,
    ) -> ManagementEvidence {
        ManagementEvidence {
            legacy_plist_present: legacy,
            registration,
            process_alive: alive,
        }
    }

    #[test]
    fn conflict_takes_precedence_over_everything() {
        let state = resolve(&evidence(true, RegistrationStatus::Enabled, true));
        assert_eq!(state, ManagementState::Conflicted);
    }

    #[test]
    fn modern_enabled_wins_over_process_evidence() {
        let state = resolve(&evidence(false, RegistrationStatus::Enabled, false));
        assert_eq!(state, ManagementState::ModernActive);
    }

    #[test]
    fn pending_approval_is_distinct() {
        let state = resolve(&evidence(false, RegistrationStatus::RequiresApproval, false));
        assert_eq!(state, ManagementState::ModernPending);
    }

    #[test]
    fn legacy_plist_alone_is_legacy_active() {
        let state = resolve(&evidence(true, RegistrationStatus::NotFound, true));
        assert_eq!(state, ManagementState::LegacyActive);
    }

    #[test]
    fn orphan_process_is_unknown() {
        let state = resolve(&evidence(false, RegistrationStatus::NotFound, true));
        assert_eq!(state, ManagementState::Unknown);
        assert!(state.suppresses_install());
    }

    #[test]
    fn nothing_at_all_is_uninstalled() {
        let state = resolve(&evidence(false, RegistrationStatus::NotFound, false));
        assert_eq!(state, ManagementState::Uninstalled);
        assert!(!state.suppresses_install());
    }

    #[test]
    fn pending_conflict_resolves_as_pending_not_conflicted() {
        // Only an *enabled* modern registration conflicts with a legacy
        // descriptor; a pending one has not taken ownership yet.
        let state = resolve(&evidence(true, RegistrationStatus::RequiresApproval, false));
        assert_eq!(state, ManagementState::ModernPending);
    }

    #[test]
    fn broken_registration_requires_enabled_and_no_evidence() {
        assert!(is_registered_but_not_loaded(
            RegistrationStatus::Enabled,
            None,
            false
        ));

        let idle = LaunchdServiceInfo {
            state: Some("waiting".into()),
            pid: None,
            last_exit_code: None,
        };
        assert!(is_registered_but_not_loaded(
            RegistrationStatus::Enabled,
            Some(&idle),
            false
        ));

        let running = LaunchdServiceInfo {
            state: Some("running".into()),
            pid: Some(99),
            last_exit_code: None,
        };
        assert!(!is_registered_but_not_loaded(
            RegistrationStatus::Enabled,
            Some(&running),
            false
        ));
    }

    #[test]
    fn warmup_defers_broken_diagnosis() {
        assert!(!is_registered_but_not_loaded(
            RegistrationStatus::Enabled,
            None,
            true
        ));
    }

    #[test]
    fn not_registered_is_never_broken() {
        assert!(!is_registered_but_not_loaded(
            RegistrationStatus::NotFound,
            None,
            false
        ));
    }
}
