//! Service health checking.
//!
//! Registration and health are read from `launchctl print` evidence. Health
//! for a keep-alive service is different from a one-shot service: exit is a
//! fault for the former and the success signal for the latter. A warm-up
//! window after any restart/load request suppresses false failures while
//! launchd is still spinning the service up.

use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::paths;
use crate::runner;

/// How long after a restart/load request a service keeps warm-up credit.
pub const WARMUP_WINDOW: Duration = Duration::from_secs(2);

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle contract of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// Expected to run continuously; launchd restarts it on exit.
    KeepAlive,
    /// Runs once per load and exits promptly; exit is the success signal.
    OneShot,
}

/// Evidence parsed from `launchctl print system/<label>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchdServiceInfo {
    pub state: Option<String>,
    pub pid: Option<i32>,
    pub last_exit_code: Option<i32>,
}

impl LaunchdServiceInfo {
    fn is_running(&self) -> bool {
        matches!(self.state.as_deref(), Some("running" | "launching"))
    }
}

/// Parse the fields we care about out of `launchctl print` output.
///
/// The format is not a stable API; the parser only relies on the
/// `key = value` lines that have been present across macOS releases.
pub fn parse_launchctl_print(output: &str) -> LaunchdServiceInfo {
    static STATE_RE: OnceLock<Regex> = OnceLock::new();
    static PID_RE: OnceLock<Regex> = OnceLock::new();
    static EXIT_RE: OnceLock<Regex> = OnceLock::new();

    let state_re = STATE_RE.get_or_init(|| Regex::new(r"(?m)^\s*state = (\S+)").unwrap());
    let pid_re = PID_RE.get_or_init(|| Regex::new(r"(?m)^\s*pid = (\d+)").unwrap());
    let exit_re =
        EXIT_RE.get_or_init(|| Regex::new(r"(?m)^\s*last exit code = (.+?)\s*$").unwrap());

    LaunchdServiceInfo {
        state: state_re
            .captures(output)
            .map(|c| c[1].to_string()),
        pid: pid_re
            .captures(output)
            .and_then(|c| c[1].parse().ok()),
        last_exit_code: exit_re
            .captures(output)
            .and_then(|c| c[1].parse().ok()),
    }
}

// ============================================================================
// Warm-up registry
// ============================================================================

// Process-wide, lock-guarded, no teardown: the data is small, bounded by the
// number of service labels, and purely advisory.
fn restart_times() -> &'static Mutex<HashMap<String, Instant>> {
    static TIMES: OnceLock<Mutex<HashMap<String, Instant>>> = OnceLock::new();
    TIMES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Record that a restart/load command was just issued for `label`.
pub fn note_restart(label: &str) {
    let mut map = match restart_times().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    map.insert(label.to_string(), Instant::now());
}

/// Whether `label` still has warm-up credit from a recent restart.
pub fn within_warmup(label: &str) -> bool {
    within_warmup_window(label, WARMUP_WINDOW)
}

fn within_warmup_window(label: &str, window: Duration) -> bool {
    let map = match restart_times().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    map.get(label).is_some_and(|t| t.elapsed() < window)
}

// ============================================================================
// Health evaluation
// ============================================================================

/// Pure health policy over parsed evidence; `warmed` is the warm-up credit.
pub fn evaluate_health(info: Option<&LaunchdServiceInfo>, kind: ServiceKind, warmed: bool) -> bool {
    match kind {
        ServiceKind::KeepAlive => match info {
            // Healthy when launchd says running/launching, or a pid is
            // assigned; a recorded exit with neither is a genuine failure
            // unless the service is still warming up.
            Some(info) => info.is_running() || info.pid.is_some() || warmed,
            None => warmed,
        },
        ServiceKind::OneShot => match info {
            Some(info) => {
                info.last_exit_code == Some(0)
                    || info.is_running()
                    // No exit evidence at all: ran fine, already cleaned up.
                    // Absence of failure evidence for a by-design transient
                    // process is not itself failure evidence.
                    || info.last_exit_code.is_none()
            }
            None => true,
        },
    }
}

/// Advisory daemon health probe result.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DaemonHealth {
    pub is_running: bool,
    pub is_responding: bool,
}

/// Health evidence seam. The production implementation queries launchd;
/// tests substitute fakes, mirroring the registration API seam.
pub trait HealthApi {
    /// Raw launchd evidence for a label; `None` when the service manager
    /// has no loaded entry for it.
    fn query(&self, label: &str) -> Option<LaunchdServiceInfo>;

    /// Whether the service manager has a loaded entry for `label`.
    fn is_registered(&self, label: &str) -> bool {
        self.query(label).is_some()
    }

    /// Health per the policy for `kind`, with warm-up credit applied.
    fn is_healthy(&self, label: &str, kind: ServiceKind) -> bool {
        evaluate_health(self.query(label).as_ref(), kind, within_warmup(label))
    }

    /// Daemon health: launchd evidence plus a best-effort TCP probe.
    ///
    /// `is_responding` is advisory; a daemon that is running but not yet
    /// listening is a diagnostic concern, not a failure.
    fn check_daemon_health(&self, port: u16, timeout: Duration) -> DaemonHealth {
        let info = self.query(paths::KANATA_LABEL);
        let is_running = info
            .as_ref()
            .is_some_and(|i| i.is_running() || i.pid.is_some());
        DaemonHealth {
            is_running,
            is_responding: probe_tcp(port, timeout),
        }
    }
}

/// Queries launchd for named services.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    launchctl: String,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            launchctl: paths::launchctl_path(),
        }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthApi for HealthChecker {
    fn query(&self, label: &str) -> Option<LaunchdServiceInfo> {
        let target = format!("system/{label}");
        let result =
            runner::run_with_timeout(&self.launchctl, &["print", &target], QUERY_TIMEOUT).ok()?;
        if result.success() {
            Some(parse_launchctl_print(&result.stdout))
        } else {
            None
        }
    }
}

fn probe_tcp(port: u16, timeout: Duration) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    TcpStream::connect_timeout(&addr, timeout).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUNNING_OUTPUT: &str = r"system/com.keyhelm.kanata = {
	active count = 1
	path = /Library/LaunchDaemons/com.keyhelm.kanata.plist
	state = running

	program = /Library/KeyHelm/bin/kanata
	pid = 4821
	immediate reason = speculative
	forks = 0
	execs = 1
}";

    const EXITED_OUTPUT: &str = r"system/com.keyhelm.vhidmanager = {
	active count = 0
	state = waiting

	last exit code = 0
}";

    const CRASHED_OUTPUT: &str = r"system/com.keyhelm.kanata = {
	active count = 0
	state = waiting

	last exit code = 6
}";

    const NEVER_EXITED_OUTPUT: &str = r"system/com.keyhelm.vhidmanager = {
	active count = 0
	state = waiting

	last exit code = (never exited)
}";

    #[test]
    fn parses_running_service() {
        let info = parse_launchctl_print(RUNNING_OUTPUT);
        assert_eq!(info.state.as_deref(), Some("running"));
        assert_eq!(info.pid, Some(4821));
        assert_eq!(info.last_exit_code, None);
    }

    #[test]
    fn parses_exit_codes() {
        assert_eq!(parse_launchctl_print(EXITED_OUTPUT).last_exit_code, Some(0));
        assert_eq!(parse_launchctl_print(CRASHED_OUTPUT).last_exit_code, Some(6));
        assert_eq!(
            parse_launchctl_print(NEVER_EXITED_OUTPUT).last_exit_code,
            None
        );
    }

    #[test]
    fn keepalive_running_is_healthy() {
        let info = parse_launchctl_print(RUNNING_OUTPUT);
        assert!(evaluate_health(Some(&info), ServiceKind::KeepAlive, false));
    }

    #[test]
    fn keepalive_crashed_without_warmup_is_unhealthy() {
        let info = parse_launchctl_print(CRASHED_OUTPUT);
        assert!(!evaluate_health(Some(&info), ServiceKind::KeepAlive, false));
    }

    #[test]
    fn keepalive_crashed_with_warmup_is_still_starting() {
        let info = parse_launchctl_print(CRASHED_OUTPUT);
        assert!(evaluate_health(Some(&info), ServiceKind::KeepAlive, true));
    }

    #[test]
    fn oneshot_clean_exit_is_healthy() {
        let info = parse_launchctl_print(EXITED_OUTPUT);
        assert!(evaluate_health(Some(&info), ServiceKind::OneShot, false));
    }

    #[test]
    fn oneshot_nonzero_exit_is_unhealthy() {
        let info = parse_launchctl_print(CRASHED_OUTPUT);
        assert!(!evaluate_health(Some(&info), ServiceKind::OneShot, false));
    }

    #[test]
    fn oneshot_without_exit_evidence_is_optimistically_healthy() {
        let info = parse_launchctl_print(NEVER_EXITED_OUTPUT);
        assert!(evaluate_health(Some(&info), ServiceKind::OneShot, false));
        assert!(evaluate_health(None, ServiceKind::OneShot, false));
    }

    #[test]
    fn warmup_credit_expires() {
        let label = "com.keyhelm.test.warmup-expiry";
        note_restart(label);
        assert!(within_warmup_window(label, Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(30));
        assert!(!within_warmup_window(label, Duration::from_millis(10)));
    }

    #[test]
    fn warmup_suppresses_missing_evidence_for_keepalive() {
        let label = "com.keyhelm.test.warmup-suppression";
        assert!(!evaluate_health(None, ServiceKind::KeepAlive, false));
        note_restart(label);
        assert!(evaluate_health(
            None,
            ServiceKind::KeepAlive,
            within_warmup(label)
        ));
    }

    #[test]
    fn tcp_probe_fails_closed_port() {
        // Port 1 is essentially never listening on a test machine.
        assert!(!probe_tcp(1, Duration::from_millis(100)));
    }
}
