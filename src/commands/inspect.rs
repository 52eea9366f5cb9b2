use anyhow::Result;
use colored::Colorize;

use crate::Context;
use crate::context::{PermissionStatus, ServiceStatus, SystemContext};
use crate::engine::InstallerEngine;
use crate::state::ManagementState;
use crate::ui;

/// Full read-only inspection. `--json` emits the raw snapshot for tooling.
pub fn run(_ctx: &Context, json: bool) -> Result<()> {
    let engine = InstallerEngine::new();
    let snapshot = engine.inspect_system();

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    ui::header("Service Inspection");

    ui::section("Services");
    print_service(&snapshot.kanata);
    print_service(&snapshot.vhid_daemon);
    print_service(&snapshot.vhid_manager);

    ui::section("Daemon Management");
    ui::kv("mechanism", describe_state(snapshot.daemon_state));
    ui::kv(
        "responding",
        &format!("{} tcp probe", ui::check(snapshot.daemon_responding)),
    );
    if !snapshot.conflicting_pids.is_empty() {
        let pids: Vec<String> = snapshot
            .conflicting_pids
            .iter()
            .map(ToString::to_string)
            .collect();
        ui::warn(&format!(
            "unmanaged kanata processes: {}",
            pids.join(", ")
        ));
    }

    ui::section("Components");
    ui::kv(
        "kanata binary",
        &ui::check(snapshot.kanata_binary_installed),
    );
    ui::kv("virtual hid driver", &ui::check(snapshot.driver_installed));
    ui::kv("driver version", &ui::check(snapshot.driver_version_ok));
    ui::kv("registration helper", &ui::check(snapshot.helper_ready));
    ui::kv("config synced", &ui::check(snapshot.config_synced));
    ui::kv("log rotation", &ui::check(snapshot.log_rotation_installed));

    ui::section("Permissions");
    ui::kv("app", describe_permission(snapshot.app_permissions));
    ui::kv("daemon", describe_permission(snapshot.daemon_permissions));

    println!();
    if converged(&snapshot) {
        ui::success("All services healthy.");
    } else {
        ui::warn("System has diverged; run `keyhelm repair` to converge it.");
    }
    Ok(())
}

/// One-screen dashboard: the three services plus the daemon verdict.
pub fn status(_ctx: &Context) -> Result<()> {
    let engine = InstallerEngine::new();
    let snapshot = engine.inspect_system();

    ui::header("keyhelm status");
    print_service(&snapshot.kanata);
    print_service(&snapshot.vhid_daemon);
    print_service(&snapshot.vhid_manager);
    println!();
    ui::kv("mechanism", describe_state(snapshot.daemon_state));
    ui::kv("responding", &ui::check(snapshot.daemon_responding));
    Ok(())
}

fn print_service(status: &ServiceStatus) {
    let verdict = if status.healthy {
        "healthy".green()
    } else if status.loaded {
        "unhealthy".red()
    } else {
        "not loaded".yellow()
    };
    println!("  {} {} ({verdict})", ui::check(status.healthy), status.label);
}

fn converged(snapshot: &SystemContext) -> bool {
    snapshot.kanata.healthy
        && snapshot.vhid_daemon.healthy
        && snapshot.vhid_manager.healthy
        && !snapshot.has_conflicts()
}

fn describe_state(state: ManagementState) -> &'static str {
    match state {
        ManagementState::Uninstalled => "uninstalled",
        ManagementState::LegacyActive => "legacy launch daemon",
        ManagementState::ModernActive => "modern registration (enabled)",
        ManagementState::ModernPending => "modern registration (awaiting approval)",
        ManagementState::Conflicted => "conflicted: legacy and modern both present",
        ManagementState::Unknown => "unknown (orphan process evidence)",
    }
}

fn describe_permission(status: PermissionStatus) -> &'static str {
    match status {
        PermissionStatus::Granted => "granted",
        PermissionStatus::Denied => "denied (check Input Monitoring in System Settings)",
        PermissionStatus::Unknown => "unknown",
    }
}
