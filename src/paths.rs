//! Centralized path resolution for keyhelm.
//!
//! Every well-known filesystem location and service label lives here.
//! Test/automation escape hatches are environment variables that are only
//! honored when `KEYHELM_AUTOMATION=1` is set, so a stray variable in a
//! normal shell can never redirect privileged writes.
//!
//! # Environment Variables (automation mode only)
//!
//! - `KEYHELM_LAUNCHD_DIR` - Override the LaunchDaemons directory
//! - `KEYHELM_LAUNCHCTL` - Override the launchctl executable path
//! - `KEYHELM_NONINTERACTIVE_SUDO` - Force the non-interactive elevation strategy

use std::path::PathBuf;

/// Service label for the primary kanata remapping daemon (keep-alive).
pub const KANATA_LABEL: &str = "com.keyhelm.kanata";

/// Service label for the Karabiner VirtualHID device daemon (keep-alive).
pub const VHID_DAEMON_LABEL: &str = "com.keyhelm.vhiddaemon";

/// Service label for the VirtualHID manager activation service (one-shot).
pub const VHID_MANAGER_LABEL: &str = "com.keyhelm.vhidmanager";

/// Driver version required by the bundled kanata build.
pub const REQUIRED_DRIVER_VERSION: &str = "5.0.0";

/// Default TCP port the kanata daemon listens on for health queries.
pub const DEFAULT_TCP_PORT: u16 = 37000;

pub const ENV_AUTOMATION: &str = "KEYHELM_AUTOMATION";
pub const ENV_LAUNCHD_DIR: &str = "KEYHELM_LAUNCHD_DIR";
pub const ENV_LAUNCHCTL: &str = "KEYHELM_LAUNCHCTL";
pub const ENV_NONINTERACTIVE_SUDO: &str = "KEYHELM_NONINTERACTIVE_SUDO";

/// Whether the process runs in explicitly-flagged test/automation mode.
pub fn automation_mode() -> bool {
    std::env::var(ENV_AUTOMATION).is_ok_and(|v| v == "1")
}

fn automation_override(var: &str) -> Option<String> {
    if automation_mode() {
        std::env::var(var).ok()
    } else {
        None
    }
}

/// Directory launchd watches for system daemon descriptors.
///
/// If this directory does not exist at all the OS is unsupported and every
/// plan is blocked.
pub fn launchd_daemons_dir() -> PathBuf {
    automation_override(ENV_LAUNCHD_DIR)
        .map_or_else(|| PathBuf::from("/Library/LaunchDaemons"), PathBuf::from)
}

/// Path to the launchctl executable.
pub fn launchctl_path() -> String {
    automation_override(ENV_LAUNCHCTL).unwrap_or_else(|| "/bin/launchctl".to_string())
}

/// Whether the non-interactive elevation strategy is forced.
pub fn noninteractive_sudo() -> bool {
    automation_override(ENV_NONINTERACTIVE_SUDO).is_some_and(|v| v == "1")
}

/// Descriptor path for a service label inside the LaunchDaemons directory.
pub fn plist_path(label: &str) -> PathBuf {
    launchd_daemons_dir().join(format!("{label}.plist"))
}

/// Root of the keyhelm system installation.
pub fn install_root() -> PathBuf {
    PathBuf::from("/Library/KeyHelm")
}

/// Installed location of the kanata binary.
pub fn kanata_installed_path() -> PathBuf {
    install_root().join("bin").join("kanata")
}

/// Bundled kanata binary shipped next to the keyhelm executable.
pub fn kanata_bundled_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.join("kanata")))
        .unwrap_or_else(|| PathBuf::from("/usr/local/share/keyhelm/kanata"))
}

/// Helper binary that fronts the modern registration API for the daemon.
pub fn registration_helper_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.join("keyhelm-agent")))
        .unwrap_or_else(|| PathBuf::from("/usr/local/share/keyhelm/keyhelm-agent"))
}

/// System-side kanata configuration the daemon actually reads.
pub fn system_config_path() -> PathBuf {
    install_root().join("config").join("keyhelm.kbd")
}

/// User-editable kanata configuration.
pub fn user_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".config").join("keyhelm").join("keyhelm.kbd"))
        .unwrap_or_else(|| PathBuf::from("/etc/keyhelm/keyhelm.kbd"))
}

/// Directory for daemon stdout/stderr redirection.
pub fn log_dir() -> PathBuf {
    PathBuf::from("/var/log/keyhelm")
}

/// newsyslog configuration artifact for daemon log rotation.
pub fn newsyslog_conf_path() -> PathBuf {
    PathBuf::from("/etc/newsyslog.d/keyhelm.conf")
}

/// Karabiner VirtualHID installation root.
pub fn vhid_root() -> PathBuf {
    PathBuf::from("/Library/Application Support/org.pqrs/Karabiner-DriverKit-VirtualHIDDevice")
}

/// Executable of the VirtualHID device daemon.
pub fn vhid_daemon_exe() -> PathBuf {
    vhid_root()
        .join("Applications/Karabiner-VirtualHIDDevice-Daemon.app/Contents/MacOS")
        .join("Karabiner-VirtualHIDDevice-Daemon")
}

/// Executable of the VirtualHID manager (its `activate` verb registers the
/// DriverKit extension).
pub fn vhid_manager_exe() -> PathBuf {
    vhid_root()
        .join("Applications/Karabiner-VirtualHIDDevice-Manager.app/Contents/MacOS")
        .join("Karabiner-VirtualHIDDevice-Manager")
}

/// File recording the installed driver version.
pub fn vhid_version_path() -> PathBuf {
    vhid_root().join("version")
}

/// Staging directory for descriptor files rendered before privileged copy.
pub fn staging_dir() -> PathBuf {
    std::env::temp_dir().join("keyhelm-staging")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plist_path_uses_label_and_dir() {
        let path = plist_path(KANATA_LABEL);
        assert!(path.to_string_lossy().ends_with("com.keyhelm.kanata.plist"));
    }

    #[test]
    fn overrides_ignored_outside_automation_mode() {
        // Without KEYHELM_AUTOMATION=1 the override must not be honored.
        if std::env::var(ENV_AUTOMATION).is_err() {
            assert_eq!(
                launchd_daemons_dir(),
                PathBuf::from("/Library/LaunchDaemons")
            );
        }
    }

    #[test]
    fn labels_are_distinct() {
        assert_ne!(KANATA_LABEL, VHID_DAEMON_LABEL);
        assert_ne!(VHID_DAEMON_LABEL, VHID_MANAGER_LABEL);
    }
}
