//! Installer engine: inspect → plan → execute → report.
//!
//! The engine is the single logical owner of all mutation; contexts, plans
//! and reports are immutable values. Recipes run strictly sequentially and
//! execution stops at the first failure, because later recipes depend on
//! filesystem and service-manager changes made by earlier ones.

use std::time::{Duration, Instant};

use crate::actions::{AbstractAction, InstallIntent, determine_actions};
use crate::context::{PermissionStatus, ServiceStatus, SystemContext};
use crate::descriptor;
use crate::elevate::{BatchOutput, PrivilegeBroker, PrivilegedCommand};
use crate::error::InstallerError;
use crate::health::{self, DaemonHealth, HealthApi, HealthChecker, LaunchdServiceInfo, ServiceKind};
use crate::paths;
use crate::plan::{self, HealthCheckCriteria, InstallPlan, PlanStatus, Recipe};
use crate::report::{self, InstallerReport, RecipeResult};
use crate::runner;
use crate::state::{
    HelperRegistrationApi, ManagementEvidence, RegistrationApi, RegistrationStatus,
    is_registered_but_not_loaded, resolve,
};

const ELEVATION_JUSTIFICATION: &str =
    "Install and repair the keyhelm background services (launchd descriptors and service loads)";

/// How long a post-recipe health check may poll before the recipe is
/// declared failed despite its commands exiting zero.
const POST_CHECK_WINDOW: Duration = Duration::from_secs(3);
const POST_CHECK_STEP: Duration = Duration::from_millis(200);

/// Bounded attempts for the registered-but-not-loaded launchd defect.
const MAX_RECOVERY_ATTEMPTS: usize = 2;
const UNREGISTER_SETTLE: Duration = Duration::from_secs(1);
const REGISTER_SETTLE: Duration = Duration::from_secs(2);

const PROBE_TIMEOUT: Duration = Duration::from_millis(300);

pub struct InstallerEngine {
    health: Box<dyn HealthApi>,
    registration: Box<dyn RegistrationApi>,
    probe_port: u16,
    post_check_window: Duration,
}

impl InstallerEngine {
    pub fn new() -> Self {
        Self::with_parts(
            Box::new(HealthChecker::new()),
            Box::new(HelperRegistrationApi::new()),
            paths::DEFAULT_TCP_PORT,
        )
    }

    pub fn with_parts(
        health: Box<dyn HealthApi>,
        registration: Box<dyn RegistrationApi>,
        probe_port: u16,
    ) -> Self {
        Self {
            health,
            registration,
            probe_port,
            post_check_window: POST_CHECK_WINDOW,
        }
    }

    #[cfg(test)]
    fn with_post_check_window(mut self, window: Duration) -> Self {
        self.post_check_window = window;
        self
    }

    /// Take a fresh read-only snapshot. Safe to call repeatedly; each call
    /// produces an independent immutable context.
    pub fn inspect_system(&self) -> SystemContext {
        let kanata_info = self.health.query(paths::KANATA_LABEL);
        let vhid_daemon_info = self.health.query(paths::VHID_DAEMON_LABEL);
        let vhid_manager_info = self.health.query(paths::VHID_MANAGER_LABEL);

        let legacy_present = paths::plist_path(paths::KANATA_LABEL).is_file();

        let registration = self.registration.status();
        let conflicting_pids = conflicting_kanata_pids(kanata_info.as_ref());
        let process_alive =
            kanata_info.as_ref().is_some_and(|i| i.pid.is_some()) || !conflicting_pids.is_empty();

        let daemon_state = resolve(&ManagementEvidence {
            legacy_plist_present: legacy_present,
            registration,
            process_alive,
        });

        let daemon_health = self.health.check_daemon_health(self.probe_port, PROBE_TIMEOUT);
        let daemon_permissions = permission_heuristic(kanata_info.as_ref(), daemon_health);
        // The GUI principal cannot be probed from the CLI; it inherits a
        // verdict only when the daemon proves the grants work end to end.
        let app_permissions = if daemon_permissions == PermissionStatus::Granted {
            PermissionStatus::Granted
        } else {
            PermissionStatus::Unknown
        };

        SystemContext {
            captured_at: chrono::Utc::now(),
            app_permissions,
            daemon_permissions,
            kanata_binary_installed: paths::kanata_installed_path().is_file(),
            driver_installed: paths::vhid_daemon_exe().is_file(),
            driver_version_ok: installed_driver_version()
                .is_some_and(|v| v == paths::REQUIRED_DRIVER_VERSION),
            helper_ready: self.registration.ready(),
            config_synced: paths::system_config_path().is_file(),
            log_rotation_installed: paths::newsyslog_conf_path().is_file(),
            kanata: service_status(paths::KANATA_LABEL, ServiceKind::KeepAlive, kanata_info),
            vhid_daemon: service_status(
                paths::VHID_DAEMON_LABEL,
                ServiceKind::KeepAlive,
                vhid_daemon_info,
            ),
            vhid_manager: service_status(
                paths::VHID_MANAGER_LABEL,
                ServiceKind::OneShot,
                vhid_manager_info,
            ),
            daemon_state,
            daemon_responding: daemon_health.is_responding,
            conflicting_pids,
        }
    }

    /// Turn an intent and a snapshot into an ordered plan.
    pub fn make_plan(&self, intent: InstallIntent, ctx: &SystemContext) -> InstallPlan {
        let actions = determine_actions(intent, ctx);
        plan::build_plan(intent, &actions, ctx)
    }

    /// Execute a plan strictly in order, stopping at the first failure.
    pub fn execute(&self, plan: &InstallPlan, broker: &dyn PrivilegeBroker) -> InstallerReport {
        let mut log = Vec::new();

        if let PlanStatus::Blocked { requirement } = &plan.status {
            let err = InstallerError::BlockedByRequirement {
                requirement: requirement.clone(),
            };
            return InstallerReport::failed(format!("{err}."), Vec::new(), log);
        }

        rewrite_legacy_descriptor(plan.intent, &mut log);

        // An empty plan still gets the post-execution pass: the canonical
        // broken registration (modern mechanism accepted, launchd never
        // loaded it) produces no recipes at all, because a modern-managed
        // state suppresses every install action.
        if plan.recipes.is_empty() {
            log.push("System already converged; nothing to do.".to_string());
            self.post_execution_pass(plan.intent, &mut log);
            return InstallerReport::succeeded(Vec::new(), log);
        }

        if let Err(err) = plan::stage_artifacts(plan) {
            // Packaging-grade defect; no recipe can fix it.
            return InstallerReport::failed(
                format!("Could not stage descriptor artifacts: {err:#}."),
                Vec::new(),
                log,
            );
        }

        log::debug!(
            "executing {:?} plan with {} recipe(s)",
            plan.intent,
            plan.recipes.len()
        );

        if plan.needs_elevation
            && let Err(err) = broker.prepare(ELEVATION_JUSTIFICATION)
        {
            return InstallerReport::failed(
                format!("Elevation was not granted: {err}."),
                Vec::new(),
                log,
            );
        }

        let mut results = Vec::new();
        for recipe in &plan.recipes {
            let started = Instant::now();
            let rendered: Vec<String> =
                recipe.commands.iter().map(PrivilegedCommand::render).collect();
            log.push(format!("Executing recipe {}", recipe.id));
            log::debug!(
                "recipe {} kind={:?} service={:?}",
                recipe.id,
                recipe.kind,
                recipe.service
            );

            let outcome = if recipe.commands.is_empty() {
                Ok(BatchOutput {
                    success: true,
                    combined_output: String::new(),
                })
            } else {
                broker.execute_batch(&recipe.commands, &recipe.description)
            };

            match outcome {
                // A broker may report failure through the output instead of
                // an error; both mean the recipe did not apply.
                Ok(output) if !output.success => {
                    let reason = format!(
                        "Recipe '{}' failed: {}.",
                        recipe.description,
                        report::output_tail(&output.combined_output, 5)
                    );
                    results.push(failed_result(recipe, rendered, started, reason.clone()));
                    return InstallerReport::failed(reason, results, log);
                }
                Ok(output) => {
                    for label in &recipe.restarts {
                        health::note_restart(label);
                    }
                    let trimmed = output.combined_output.trim();
                    if !trimmed.is_empty() {
                        log.push(report::output_tail(trimmed, 10));
                    }

                    if let Some(check) = &recipe.health_check
                        && !self.verify_health(check)
                    {
                        let reason = format!(
                            "Recipe '{}' ran its commands but service {} did not converge \
                             to a healthy state.",
                            recipe.description, check.label
                        );
                        results.push(failed_result(
                            recipe,
                            rendered,
                            started,
                            InstallerError::HealthCheckFailed {
                                service: check.label.clone(),
                            }
                            .to_string(),
                        ));
                        return InstallerReport::failed(reason, results, log);
                    }

                    results.push(RecipeResult {
                        id: recipe.id.clone(),
                        description: recipe.description.clone(),
                        success: true,
                        error: None,
                        duration_ms: duration_ms(started),
                        commands: rendered,
                    });
                }
                Err(err) => {
                    let reason = match &err {
                        InstallerError::CommandFailed { output, .. } => format!(
                            "Recipe '{}' failed: {}.",
                            recipe.description,
                            report::output_tail(output, 5)
                        ),
                        other => format!("Recipe '{}' failed: {other}.", recipe.description),
                    };
                    results.push(failed_result(recipe, rendered, started, err.to_string()));
                    return InstallerReport::failed(reason, results, log);
                }
            }
        }

        self.post_execution_pass(plan.intent, &mut log);

        InstallerReport::succeeded(results, log)
    }

    /// Registration work that is not recipe-shaped. Runs after the recipes
    /// of a mutating plan, and for an empty plan as well. Never for
    /// inspect-only, which must stay read-only.
    fn post_execution_pass(&self, intent: InstallIntent, log: &mut Vec<String>) {
        match intent {
            InstallIntent::Uninstall => self.unregister_modern_mechanism(log),
            InstallIntent::Install | InstallIntent::Repair => {
                self.recover_if_registration_broken(log);
            }
            InstallIntent::InspectOnly => {}
        }
    }

    /// Convenience chain: inspect, plan, execute.
    pub fn run(&self, intent: InstallIntent, broker: &dyn PrivilegeBroker) -> InstallerReport {
        let ctx = self.inspect_system();
        let plan = self.make_plan(intent, &ctx);
        self.execute(&plan, broker)
    }

    /// Generate and execute the single recipe for one action against a fresh
    /// snapshot, bypassing intent-based planning. Used for targeted retries.
    pub fn run_single_action(
        &self,
        action: AbstractAction,
        broker: &dyn PrivilegeBroker,
    ) -> InstallerReport {
        let ctx = self.inspect_system();
        let plan = plan::build_plan(InstallIntent::Repair, &[action], &ctx);
        self.execute(&plan, broker)
    }

    /// Poll until the post-condition holds or the window lapses. Command
    /// success alone is not convergence.
    fn verify_health(&self, check: &HealthCheckCriteria) -> bool {
        let deadline = Instant::now() + self.post_check_window;
        loop {
            let healthy = self.health.is_healthy(&check.label, check.kind);
            let registered_ok = !check.should_be_running || self.health.is_registered(&check.label);
            if healthy && registered_ok {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(POST_CHECK_STEP);
        }
    }

    /// The modern registration is not a launchd artifact the recipes can
    /// remove; an uninstall releases it through the API directly.
    fn unregister_modern_mechanism(&self, log: &mut Vec<String>) {
        if self.registration.status() == RegistrationStatus::NotFound {
            return;
        }
        match self.registration.unregister() {
            Ok(()) => log.push("Released the modern daemon registration.".to_string()),
            Err(err) => {
                log::warn!("could not release the daemon registration: {err:#}");
                log.push(format!("Could not release the daemon registration: {err:#}."));
            }
        }
    }

    /// Detect and recover the registered-but-not-loaded launchd defect.
    /// Bounded; a persistent case is surfaced as non-fatal with a reboot
    /// suggestion, because the stale cache lives inside launchd itself.
    fn recover_if_registration_broken(&self, log: &mut Vec<String>) {
        if self.registration.status() != RegistrationStatus::Enabled {
            return;
        }
        let broken = || {
            is_registered_but_not_loaded(
                self.registration.status(),
                self.health.query(paths::KANATA_LABEL).as_ref(),
                health::within_warmup(paths::KANATA_LABEL),
            )
        };
        if !broken() {
            return;
        }

        log.push(
            "Daemon registration is accepted but launchd never loaded it; attempting recovery."
                .to_string(),
        );
        if recover_broken_registration(
            self.registration.as_ref(),
            &broken,
            UNREGISTER_SETTLE,
            REGISTER_SETTLE,
        ) {
            health::note_restart(paths::KANATA_LABEL);
            log.push("Registration recovery succeeded.".to_string());
        } else {
            let diagnostic = InstallerError::BrokenRegistration {
                label: paths::KANATA_LABEL.to_string(),
            }
            .to_string();
            log::warn!("{diagnostic}");
            log.push(diagnostic);
        }
    }
}

impl Default for InstallerEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Backward-compat rewrite of the literal `~` marker old installations left
/// in the legacy descriptor. Remediation, so it only runs for mutating
/// intents. Best effort: the file is root-owned on real systems and the
/// rewrite only succeeds where we can write it.
fn rewrite_legacy_descriptor(intent: InstallIntent, log: &mut Vec<String>) {
    if !matches!(intent, InstallIntent::Install | InstallIntent::Repair) {
        return;
    }
    let legacy_path = paths::plist_path(paths::KANATA_LABEL);
    if !legacy_path.is_file() {
        return;
    }
    match descriptor::rewrite_legacy_home_marker(&legacy_path) {
        Ok(true) => log.push(format!(
            "Expanded the legacy home marker in {}.",
            legacy_path.display()
        )),
        Ok(false) => {}
        Err(err) => log::debug!("legacy descriptor rewrite skipped: {err:#}"),
    }
}

/// Unregister, wait for the registration to settle, re-register, wait for
/// launchd to attempt a load, and re-check. At most two attempts; this is
/// a bounded retry, never a loop.
pub fn recover_broken_registration(
    api: &dyn RegistrationApi,
    is_broken: &dyn Fn() -> bool,
    unregister_settle: Duration,
    register_settle: Duration,
) -> bool {
    for attempt in 1..=MAX_RECOVERY_ATTEMPTS {
        log::info!("registration recovery attempt {attempt}/{MAX_RECOVERY_ATTEMPTS}");
        if let Err(err) = api.unregister() {
            log::warn!("unregister failed during recovery: {err:#}");
        }
        settle(unregister_settle, || {
            api.status() != RegistrationStatus::Enabled
        });
        if let Err(err) = api.register() {
            log::warn!("re-register failed during recovery: {err:#}");
        }
        if settle(register_settle, || !is_broken()) {
            return true;
        }
    }
    false
}

/// Poll `done` until it holds or `window` lapses.
fn settle(window: Duration, done: impl Fn() -> bool) -> bool {
    let step = (window / 10).clamp(Duration::from_millis(5), Duration::from_millis(100));
    let deadline = Instant::now() + window;
    loop {
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(step);
    }
}

fn service_status(
    label: &str,
    kind: ServiceKind,
    info: Option<LaunchdServiceInfo>,
) -> ServiceStatus {
    let healthy = health::evaluate_health(info.as_ref(), kind, health::within_warmup(label));
    ServiceStatus {
        label: label.to_string(),
        kind,
        loaded: info.is_some(),
        healthy,
    }
}

fn installed_driver_version() -> Option<String> {
    std::fs::read_to_string(paths::vhid_version_path())
        .ok()
        .map(|s| s.trim().to_string())
}

const PGREP: &str = "/usr/bin/pgrep";

/// kanata processes not owned by the service manager. An externally started
/// instance holds the virtual device and starves the managed daemon.
fn conflicting_kanata_pids(managed: Option<&LaunchdServiceInfo>) -> Vec<i32> {
    let managed_pid = managed.and_then(|i| i.pid);
    match runner::run_with_timeout(PGREP, &["-x", "kanata"], Duration::from_secs(5)) {
        Ok(result) if result.success() => parse_pgrep_pids(&result.stdout, managed_pid),
        _ => Vec::new(),
    }
}

fn parse_pgrep_pids(output: &str, managed_pid: Option<i32>) -> Vec<i32> {
    output
        .lines()
        .filter_map(|line| line.trim().parse::<i32>().ok())
        .filter(|pid| Some(*pid) != managed_pid)
        .collect()
}

fn permission_heuristic(
    info: Option<&LaunchdServiceInfo>,
    health: DaemonHealth,
) -> PermissionStatus {
    if health.is_running && health.is_responding {
        return PermissionStatus::Granted;
    }
    match info {
        // A crash loop with a non-zero exit and no pid is the signature of
        // a missing input-monitoring grant.
        Some(i) if i.pid.is_none() && i.last_exit_code.is_some_and(|c| c != 0) => {
            PermissionStatus::Denied
        }
        _ => PermissionStatus::Unknown,
    }
}

fn duration_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn failed_result(
    recipe: &Recipe,
    commands: Vec<String>,
    started: Instant,
    error: String,
) -> RecipeResult {
    RecipeResult {
        id: recipe.id.clone(),
        description: recipe.description.clone(),
        success: false,
        error: Some(error),
        duration_ms: duration_ms(started),
        commands,
    }
}
