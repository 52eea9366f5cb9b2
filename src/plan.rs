//! Recipe generation and planning.
//!
//! Each abstract action maps to exactly one recipe through a total match;
//! adding an action variant without a mapping is a compile error, never a
//! silent no-op. Recipes are idempotent against the context they were
//! planned from: re-planning a converged system yields no recipes at all.
//!
//! Ordering uses a fixed precedence table rather than dependency-graph
//! inference; the action space is small and finite, and the one ordering
//! that genuinely matters (VirtualHID manager activation before any
//! daemon start) is hard-coded into the table. Starting kanata before the
//! manager is activated fails with an opaque I/O error at the OS level.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;

use crate::actions::{AbstractAction, InstallIntent};
use crate::context::SystemContext;
use crate::descriptor;
use crate::elevate::PrivilegedCommand;
use crate::health::ServiceKind;
use crate::paths;

/// Concrete operation category a recipe performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipeKind {
    InstallService,
    RestartService,
    InstallComponent,
    WriteConfig,
    CheckRequirement,
    TerminateProcesses,
    RemoveService,
}

/// Post-condition checked immediately after a recipe's commands succeed.
/// Command success and state convergence are different success criteria;
/// both must hold.
#[derive(Debug, Clone)]
pub struct HealthCheckCriteria {
    pub label: String,
    pub kind: ServiceKind,
    pub should_be_running: bool,
}

/// A concrete, idempotent, orderable unit of remediation work.
#[derive(Debug, Clone)]
pub struct Recipe {
    pub id: String,
    pub kind: RecipeKind,
    pub action: AbstractAction,
    pub service: Option<String>,
    pub commands: Vec<PrivilegedCommand>,
    /// Labels whose warm-up clock starts when this recipe executes.
    pub restarts: Vec<String>,
    pub health_check: Option<HealthCheckCriteria>,
    pub description: String,
}

/// Plan status: ready to execute, or blocked on a hard prerequisite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanStatus {
    Ready,
    Blocked { requirement: String },
}

/// An ordered recipe list for one reconciliation cycle. Created fresh,
/// never persisted, executed at most once.
#[derive(Debug)]
pub struct InstallPlan {
    pub intent: InstallIntent,
    pub recipes: Vec<Recipe>,
    pub status: PlanStatus,
    /// Whether executing this plan will need an elevation prompt.
    pub needs_elevation: bool,
}

/// Fixed precedence table. Lower runs earlier. Conflict resolution leads;
/// prerequisite components precede the services that depend on them.
fn precedence(action: AbstractAction) -> u8 {
    match action {
        AbstractAction::ResolveMechanismConflict => 0,
        AbstractAction::TerminateConflictingProcesses => 1,
        AbstractAction::InstallBundledBinary => 2,
        AbstractAction::VerifyDriverPresence => 3,
        AbstractAction::FixDriverVersionMismatch => 4,
        AbstractAction::InstallVhidServices => 5,
        AbstractAction::ActivateVhidManager => 6,
        AbstractAction::InstallDaemonService => 7,
        AbstractAction::RestartUnhealthyServices => 8,
        AbstractAction::SyncConfigPaths => 9,
        AbstractAction::InstallLogRotation => 10,
        AbstractAction::UninstallAll => 11,
    }
}

/// Staged location a descriptor is rendered to before privileged copy.
pub fn staged_plist_path(label: &str) -> PathBuf {
    paths::staging_dir().join(format!("{label}.plist"))
}

fn staged_newsyslog_path() -> PathBuf {
    paths::staging_dir().join("keyhelm.newsyslog.conf")
}

fn launchctl_cmd(args: &[&str]) -> PrivilegedCommand {
    PrivilegedCommand::new(paths::launchctl_path(), args)
}

fn install_plist_commands(label: &str, currently_loaded: bool) -> Vec<PrivilegedCommand> {
    let staged = staged_plist_path(label).to_string_lossy().into_owned();
    let target = paths::plist_path(label).to_string_lossy().into_owned();
    let domain_target = format!("system/{label}");

    let mut commands = Vec::new();
    if currently_loaded {
        commands.push(launchctl_cmd(&["bootout", &domain_target]));
    }
    commands.push(PrivilegedCommand::new("/bin/cp", &[&staged, &target]));
    commands.push(PrivilegedCommand::new("/usr/sbin/chown", &["root:wheel", &target]));
    commands.push(PrivilegedCommand::new("/bin/chmod", &["644", &target]));
    commands.push(launchctl_cmd(&["bootstrap", "system", &target]));
    commands
}

/// Map one abstract action to its concrete recipe. Total by construction.
pub fn recipe_for(action: AbstractAction, ctx: &SystemContext) -> Recipe {
    match action {
        AbstractAction::ResolveMechanismConflict => {
            // The modern mechanism always wins: the legacy descriptor is
            // stale the moment a modern registration exists.
            let target = paths::plist_path(paths::KANATA_LABEL)
                .to_string_lossy()
                .into_owned();
            let mut commands = Vec::new();
            if ctx.kanata.loaded {
                commands.push(launchctl_cmd(&[
                    "bootout",
                    &format!("system/{}", paths::KANATA_LABEL),
                ]));
            }
            commands.push(PrivilegedCommand::new("/bin/rm", &["-f", &target]));
            Recipe {
                id: action.to_string(),
                kind: RecipeKind::RemoveService,
                action,
                service: Some(paths::KANATA_LABEL.into()),
                commands,
                restarts: Vec::new(),
                health_check: None,
                description: "Remove the stale legacy daemon descriptor".into(),
            }
        }

        AbstractAction::TerminateConflictingProcesses => {
            let commands = ctx
                .conflicting_pids
                .iter()
                .map(|pid| PrivilegedCommand::new("/bin/kill", &["-TERM", &pid.to_string()]))
                .collect();
            Recipe {
                id: action.to_string(),
                kind: RecipeKind::TerminateProcesses,
                action,
                service: None,
                commands,
                restarts: Vec::new(),
                health_check: None,
                description: "Terminate kanata processes not owned by the service manager".into(),
            }
        }

        AbstractAction::InstallBundledBinary => {
            let bundled = paths::kanata_bundled_path().to_string_lossy().into_owned();
            let installed = paths::kanata_installed_path()
                .to_string_lossy()
                .into_owned();
            let bin_dir = paths::install_root().join("bin").to_string_lossy().into_owned();
            Recipe {
                id: action.to_string(),
                kind: RecipeKind::InstallComponent,
                action,
                service: None,
                commands: vec![
                    PrivilegedCommand::new("/bin/mkdir", &["-p", &bin_dir]),
                    PrivilegedCommand::new("/bin/cp", &[&bundled, &installed]),
                    PrivilegedCommand::new("/bin/chmod", &["755", &installed]),
                ],
                restarts: Vec::new(),
                health_check: None,
                description: "Install the bundled kanata binary".into(),
            }
        }

        AbstractAction::VerifyDriverPresence => {
            // The driver ships in an external package this tool never
            // installs. The probe fails the run early, with the requirement
            // in the recipe description, instead of letting a later service
            // start fail opaquely.
            let daemon_exe = paths::vhid_daemon_exe().to_string_lossy().into_owned();
            Recipe {
                id: action.to_string(),
                kind: RecipeKind::CheckRequirement,
                action,
                service: None,
                commands: vec![PrivilegedCommand::new("/bin/test", &["-x", &daemon_exe])],
                restarts: Vec::new(),
                health_check: None,
                description: "Verify the VirtualHID driver package is installed".into(),
            }
        }

        AbstractAction::FixDriverVersionMismatch => {
            let manager = paths::vhid_manager_exe().to_string_lossy().into_owned();
            Recipe {
                id: action.to_string(),
                kind: RecipeKind::InstallComponent,
                action,
                service: None,
                commands: vec![PrivilegedCommand::new(manager, &["activate"])],
                restarts: Vec::new(),
                health_check: None,
                description: "Re-activate the VirtualHID driver to match the bundled version"
                    .into(),
            }
        }

        AbstractAction::InstallVhidServices => {
            let mut commands =
                install_plist_commands(paths::VHID_DAEMON_LABEL, ctx.vhid_daemon.loaded);
            commands.extend(install_plist_commands(
                paths::VHID_MANAGER_LABEL,
                ctx.vhid_manager.loaded,
            ));
            Recipe {
                id: action.to_string(),
                kind: RecipeKind::InstallService,
                action,
                service: Some(paths::VHID_DAEMON_LABEL.into()),
                commands,
                restarts: vec![
                    paths::VHID_DAEMON_LABEL.into(),
                    paths::VHID_MANAGER_LABEL.into(),
                ],
                health_check: Some(HealthCheckCriteria {
                    label: paths::VHID_DAEMON_LABEL.into(),
                    kind: ServiceKind::KeepAlive,
                    should_be_running: true,
                }),
                description: "Install and load the VirtualHID service descriptors".into(),
            }
        }

        AbstractAction::ActivateVhidManager => {
            // Loaded: force a fresh run of the one-shot. Not loaded: invoke
            // the activation verb directly so we never depend on a
            // bootstrap that may not have happened yet.
            let commands = if ctx.vhid_manager.loaded {
                vec![launchctl_cmd(&[
                    "kickstart",
                    "-k",
                    &format!("system/{}", paths::VHID_MANAGER_LABEL),
                ])]
            } else {
                let manager = paths::vhid_manager_exe().to_string_lossy().into_owned();
                vec![PrivilegedCommand::new(manager, &["activate"])]
            };
            Recipe {
                id: action.to_string(),
                kind: RecipeKind::RestartService,
                action,
                service: Some(paths::VHID_MANAGER_LABEL.into()),
                commands,
                restarts: vec![paths::VHID_MANAGER_LABEL.into()],
                health_check: Some(HealthCheckCriteria {
                    label: paths::VHID_MANAGER_LABEL.into(),
                    kind: ServiceKind::OneShot,
                    should_be_running: false,
                }),
                description: "Activate the VirtualHID device manager".into(),
            }
        }

        AbstractAction::InstallDaemonService => {
            let mut commands = install_plist_commands(paths::KANATA_LABEL, ctx.kanata.loaded);
            commands.push(launchctl_cmd(&[
                "kickstart",
                "-k",
                &format!("system/{}", paths::KANATA_LABEL),
            ]));
            Recipe {
                id: action.to_string(),
                kind: RecipeKind::InstallService,
                action,
                service: Some(paths::KANATA_LABEL.into()),
                commands,
                restarts: vec![paths::KANATA_LABEL.into()],
                health_check: Some(HealthCheckCriteria {
                    label: paths::KANATA_LABEL.into(),
                    kind: ServiceKind::KeepAlive,
                    should_be_running: true,
                }),
                description: "Install and start the kanata daemon service".into(),
            }
        }

        AbstractAction::RestartUnhealthyServices => {
            let mut restarts = Vec::new();
            for status in [&ctx.kanata, &ctx.vhid_daemon] {
                if status.needs_restart() {
                    restarts.push(status.label.clone());
                }
            }
            let commands = restarts
                .iter()
                .map(|label| launchctl_cmd(&["kickstart", "-k", &format!("system/{label}")]))
                .collect();
            let health_check = restarts.first().map(|label| HealthCheckCriteria {
                label: label.clone(),
                kind: ServiceKind::KeepAlive,
                should_be_running: true,
            });
            Recipe {
                id: action.to_string(),
                kind: RecipeKind::RestartService,
                action,
                service: restarts.first().cloned(),
                commands,
                restarts,
                health_check,
                description: "Restart unhealthy keep-alive services".into(),
            }
        }

        AbstractAction::SyncConfigPaths => {
            let config_dir = paths::install_root()
                .join("config")
                .to_string_lossy()
                .into_owned();
            let system_cfg = paths::system_config_path().to_string_lossy().into_owned();
            let user_cfg = paths::user_config_path();
            let mut commands = vec![PrivilegedCommand::new("/bin/mkdir", &["-p", &config_dir])];
            if user_cfg.is_file() {
                let user_cfg = user_cfg.to_string_lossy().into_owned();
                commands.push(PrivilegedCommand::new("/bin/cp", &[&user_cfg, &system_cfg]));
            }
            Recipe {
                id: action.to_string(),
                kind: RecipeKind::WriteConfig,
                action,
                service: None,
                commands,
                restarts: Vec::new(),
                health_check: None,
                description: "Synchronize the daemon configuration path".into(),
            }
        }

        AbstractAction::InstallLogRotation => {
            let staged = staged_newsyslog_path().to_string_lossy().into_owned();
            let target = paths::newsyslog_conf_path().to_string_lossy().into_owned();
            let log_dir = paths::log_dir().to_string_lossy().into_owned();
            Recipe {
                id: action.to_string(),
                kind: RecipeKind::WriteConfig,
                action,
                service: None,
                commands: vec![
                    PrivilegedCommand::new("/bin/mkdir", &["-p", &log_dir]),
                    PrivilegedCommand::new("/bin/cp", &[&staged, &target]),
                    PrivilegedCommand::new("/bin/chmod", &["644", &target]),
                ],
                restarts: Vec::new(),
                health_check: None,
                description: "Install log rotation for the daemon log files".into(),
            }
        }

        AbstractAction::UninstallAll => {
            let mut commands = Vec::new();
            for status in [&ctx.kanata, &ctx.vhid_daemon, &ctx.vhid_manager] {
                if status.loaded {
                    commands.push(launchctl_cmd(&[
                        "bootout",
                        &format!("system/{}", status.label),
                    ]));
                }
                let target = paths::plist_path(&status.label)
                    .to_string_lossy()
                    .into_owned();
                commands.push(PrivilegedCommand::new("/bin/rm", &["-f", &target]));
            }
            let conf = paths::newsyslog_conf_path().to_string_lossy().into_owned();
            commands.push(PrivilegedCommand::new("/bin/rm", &["-f", &conf]));
            Recipe {
                id: action.to_string(),
                kind: RecipeKind::RemoveService,
                action,
                service: None,
                commands,
                restarts: Vec::new(),
                health_check: None,
                description: "Unload services and remove installed descriptors".into(),
            }
        }
    }
}

/// Build an ordered plan from determined actions.
pub fn build_plan(
    intent: InstallIntent,
    actions: &[AbstractAction],
    ctx: &SystemContext,
) -> InstallPlan {
    let status = if paths::launchd_daemons_dir().exists() {
        PlanStatus::Ready
    } else {
        PlanStatus::Blocked {
            requirement: format!(
                "launchd daemons directory {} does not exist; this OS is unsupported",
                paths::launchd_daemons_dir().display()
            ),
        }
    };

    let mut recipes: Vec<Recipe> = actions.iter().map(|a| recipe_for(*a, ctx)).collect();
    // Stable sort: determiner order survives within equal precedence.
    recipes.sort_by_key(|r| precedence(r.action));

    let needs_elevation = recipes.iter().any(|r| !r.commands.is_empty());

    InstallPlan {
        intent,
        recipes,
        status,
        needs_elevation,
    }
}

/// Render staged artifacts the plan's privileged commands will copy into
/// place. Always regenerates from current configuration; never edits.
pub fn stage_artifacts(plan: &InstallPlan) -> Result<()> {
    let staging = paths::staging_dir();
    for recipe in &plan.recipes {
        match recipe.action {
            AbstractAction::InstallVhidServices => {
                descriptor::vhid_daemon_descriptor().write_to(&staging)?;
                descriptor::vhid_manager_descriptor().write_to(&staging)?;
            }
            AbstractAction::InstallDaemonService => {
                descriptor::kanata_descriptor().write_to(&staging)?;
            }
            AbstractAction::InstallLogRotation => {
                fs::create_dir_all(&staging)
                    .with_context(|| format!("Could not create {}", staging.display()))?;
                let conf = format!(
                    "# Rotate keyhelm daemon logs\n{}/*.log\t644  5  1024\t*\tJ\n",
                    paths::log_dir().display()
                );
                fs::write(staged_newsyslog_path(), conf)
                    .context("Could not stage newsyslog configuration")?;
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::fixtures::converged;
    use crate::state::ManagementState;
    use crate::testutil::temp_env;

    #[test]
    fn every_action_maps_to_a_recipe() {
        let ctx = converged();
        let all = [
            AbstractAction::ResolveMechanismConflict,
            AbstractAction::TerminateConflictingProcesses,
            AbstractAction::InstallBundledBinary,
            AbstractAction::VerifyDriverPresence,
            AbstractAction::FixDriverVersionMismatch,
            AbstractAction::InstallVhidServices,
            AbstractAction::ActivateVhidManager,
            AbstractAction::InstallDaemonService,
            AbstractAction::RestartUnhealthyServices,
            AbstractAction::SyncConfigPaths,
            AbstractAction::InstallLogRotation,
            AbstractAction::UninstallAll,
        ];
        for action in all {
            let recipe = recipe_for(action, &ctx);
            assert_eq!(recipe.action, action);
            assert!(!recipe.id.is_empty());
        }
    }

    #[test]
    fn manager_activation_precedes_daemon_start() {
        let mut ctx = converged();
        ctx.kanata.loaded = false;
        ctx.daemon_state = ManagementState::Uninstalled;
        ctx.vhid_manager.loaded = false;

        // Determiner order intentionally reversed; the precedence table
        // must fix it.
        let actions = [
            AbstractAction::InstallDaemonService,
            AbstractAction::ActivateVhidManager,
        ];
        let plan = build_plan(InstallIntent::Repair, &actions, &ctx);
        assert_eq!(plan.recipes[0].action, AbstractAction::ActivateVhidManager);
        assert_eq!(plan.recipes[1].action, AbstractAction::InstallDaemonService);
    }

    #[test]
    fn daemon_install_recipe_checks_convergence() {
        let mut ctx = converged();
        ctx.kanata.loaded = false;
        let recipe = recipe_for(AbstractAction::InstallDaemonService, &ctx);
        let check = recipe.health_check.expect("daemon install must verify health");
        assert_eq!(check.label, paths::KANATA_LABEL);
        assert!(check.should_be_running);
        assert!(recipe.restarts.contains(&paths::KANATA_LABEL.to_string()));
        // Not loaded: no bootout before bootstrap.
        assert!(!recipe.commands.iter().any(|c| c.args.contains(&"bootout".to_string())));
    }

    #[test]
    fn reinstall_of_loaded_service_bootouts_first() {
        let ctx = converged();
        let recipe = recipe_for(AbstractAction::InstallDaemonService, &ctx);
        let first = &recipe.commands[0];
        assert!(first.args.first().is_some_and(|a| a == "bootout"));
    }

    #[test]
    fn driver_presence_check_probes_the_daemon_executable() {
        let recipe = recipe_for(AbstractAction::VerifyDriverPresence, &converged());
        assert_eq!(recipe.kind, RecipeKind::CheckRequirement);
        assert!(recipe.health_check.is_none());
        let rendered = recipe.commands[0].render();
        assert!(rendered.starts_with("/bin/test -x"));
        assert!(rendered.contains("Karabiner-VirtualHIDDevice-Daemon"));
    }

    #[test]
    fn terminate_recipe_targets_each_pid() {
        let mut ctx = converged();
        ctx.conflicting_pids = vec![101, 202];
        let recipe = recipe_for(AbstractAction::TerminateConflictingProcesses, &ctx);
        assert_eq!(recipe.commands.len(), 2);
        assert!(recipe.commands[0].args.contains(&"101".to_string()));
        assert!(recipe.commands[1].args.contains(&"202".to_string()));
    }

    #[test]
    fn conflict_recipe_removes_legacy_descriptor() {
        let mut ctx = converged();
        ctx.daemon_state = ManagementState::Conflicted;
        let recipe = recipe_for(AbstractAction::ResolveMechanismConflict, &ctx);
        let rendered: Vec<String> = recipe.commands.iter().map(|c| c.render()).collect();
        assert!(rendered.iter().any(|c| c.contains("rm -f")));
        assert!(rendered.iter().any(|c| c.contains("com.keyhelm.kanata.plist")));
    }

    #[test]
    fn empty_action_list_yields_no_elevation() {
        // Point at an existing directory so the test does not depend on the
        // host having a real /Library/LaunchDaemons.
        let dir = tempfile::tempdir().unwrap();
        let ctx = converged();
        temp_env(&[
            (paths::ENV_AUTOMATION, Some("1")),
            (paths::ENV_LAUNCHD_DIR, Some(dir.path().to_str().unwrap())),
        ], || {
            let plan = build_plan(InstallIntent::InspectOnly, &[], &ctx);
            assert!(plan.recipes.is_empty());
            assert!(!plan.needs_elevation);
            assert_eq!(plan.status, PlanStatus::Ready);
        });
    }

    #[test]
    fn blocked_plan_reports_requirement_verbatim() {
        // The real LaunchDaemons directory exists on macOS hosts; exercise
        // the blocked branch through the automation override.
        let ctx = converged();
        temp_env(&[
            (paths::ENV_AUTOMATION, Some("1")),
            (paths::ENV_LAUNCHD_DIR, Some("/nonexistent/keyhelm-test")),
        ], || {
            let plan = build_plan(
                InstallIntent::Repair,
                &[AbstractAction::SyncConfigPaths],
                &ctx,
            );
            match &plan.status {
                PlanStatus::Blocked { requirement } => {
                    assert!(requirement.contains("/nonexistent/keyhelm-test"));
                }
                PlanStatus::Ready => panic!("plan should be blocked"),
            }
        });
    }

    #[test]
    fn staging_renders_descriptors_for_install_recipes() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = converged();
        ctx.kanata.loaded = false;
        ctx.daemon_state = ManagementState::Uninstalled;

        temp_env(&[("TMPDIR", Some(dir.path().to_str().unwrap()))], || {
            let plan = build_plan(
                InstallIntent::Repair,
                &[AbstractAction::InstallDaemonService],
                &ctx,
            );
            stage_artifacts(&plan).unwrap();
            assert!(staged_plist_path(paths::KANATA_LABEL).is_file());
        });
    }
}
