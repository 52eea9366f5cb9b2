//! launchd service descriptors.
//!
//! Descriptors are write-only artifacts: regenerated deterministically from
//! the current configuration every time one must be (re)installed, never
//! hand-edited in place. The single exception is the backward-compatibility
//! rewrite of a literal `~` marker left behind by old installations.

use anyhow::{Context, Result};
use plist::{Dictionary, Value};
use std::fs;
use std::path::{Path, PathBuf};

use crate::paths;

/// Declarative description of one background service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub label: String,
    pub program: PathBuf,
    pub arguments: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub keep_alive: bool,
    pub run_at_load: bool,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
    /// Seconds launchd waits before relaunching a crashed keep-alive service.
    pub throttle_interval: u32,
    pub soft_file_limit: Option<u32>,
}

impl ServiceDescriptor {
    /// Render the descriptor as a launchd property list.
    pub fn to_plist(&self) -> Value {
        let mut dict = Dictionary::new();
        dict.insert("Label".into(), Value::String(self.label.clone()));

        let mut args = vec![Value::String(self.program.to_string_lossy().into_owned())];
        args.extend(self.arguments.iter().cloned().map(Value::String));
        dict.insert("ProgramArguments".into(), Value::Array(args));

        if let Some(dir) = &self.working_directory {
            dict.insert(
                "WorkingDirectory".into(),
                Value::String(dir.to_string_lossy().into_owned()),
            );
        }

        dict.insert("RunAtLoad".into(), Value::Boolean(self.run_at_load));
        dict.insert("KeepAlive".into(), Value::Boolean(self.keep_alive));
        dict.insert(
            "ThrottleInterval".into(),
            Value::Integer(i64::from(self.throttle_interval).into()),
        );

        if let Some(path) = &self.stdout_path {
            dict.insert(
                "StandardOutPath".into(),
                Value::String(path.to_string_lossy().into_owned()),
            );
        }
        if let Some(path) = &self.stderr_path {
            dict.insert(
                "StandardErrorPath".into(),
                Value::String(path.to_string_lossy().into_owned()),
            );
        }

        if let Some(limit) = self.soft_file_limit {
            let mut limits = Dictionary::new();
            limits.insert(
                "NumberOfFiles".into(),
                Value::Integer(i64::from(limit).into()),
            );
            dict.insert("SoftResourceLimits".into(), Value::Dictionary(limits));
        }

        Value::Dictionary(dict)
    }

    /// Write `<label>.plist` into `dir`, fully regenerating the file.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Could not create {}", dir.display()))?;
        let path = dir.join(format!("{}.plist", self.label));
        let file = fs::File::create(&path)
            .with_context(|| format!("Could not create {}", path.display()))?;
        self.to_plist()
            .to_writer_xml(file)
            .with_context(|| format!("Could not serialize {}", path.display()))?;
        Ok(path)
    }
}

/// Descriptor for the primary kanata daemon.
pub fn kanata_descriptor() -> ServiceDescriptor {
    let log = paths::log_dir();
    ServiceDescriptor {
        label: paths::KANATA_LABEL.into(),
        program: paths::kanata_installed_path(),
        arguments: vec![
            "--cfg".into(),
            paths::system_config_path().to_string_lossy().into_owned(),
            "--port".into(),
            paths::DEFAULT_TCP_PORT.to_string(),
        ],
        working_directory: Some(paths::install_root()),
        keep_alive: true,
        run_at_load: true,
        stdout_path: Some(log.join("kanata.log")),
        stderr_path: Some(log.join("kanata.err.log")),
        throttle_interval: 5,
        soft_file_limit: Some(4096),
    }
}

/// Descriptor for the VirtualHID device daemon.
pub fn vhid_daemon_descriptor() -> ServiceDescriptor {
    let log = paths::log_dir();
    ServiceDescriptor {
        label: paths::VHID_DAEMON_LABEL.into(),
        program: paths::vhid_daemon_exe(),
        arguments: Vec::new(),
        working_directory: None,
        keep_alive: true,
        run_at_load: true,
        stdout_path: Some(log.join("vhiddaemon.log")),
        stderr_path: Some(log.join("vhiddaemon.err.log")),
        throttle_interval: 5,
        soft_file_limit: None,
    }
}

/// Descriptor for the one-shot VirtualHID manager activation service.
pub fn vhid_manager_descriptor() -> ServiceDescriptor {
    let log = paths::log_dir();
    ServiceDescriptor {
        label: paths::VHID_MANAGER_LABEL.into(),
        program: paths::vhid_manager_exe(),
        arguments: vec!["activate".into()],
        working_directory: None,
        keep_alive: false,
        run_at_load: true,
        stdout_path: Some(log.join("vhidmanager.log")),
        stderr_path: Some(log.join("vhidmanager.err.log")),
        throttle_interval: 5,
        soft_file_limit: None,
    }
}

/// Expand a literal `~` path marker in an already-installed descriptor.
///
/// Old installations wrote `~/...` into ProgramArguments and
/// WorkingDirectory; launchd runs daemons without a home, so those entries
/// never resolve. Returns `true` if the file was rewritten.
pub fn rewrite_legacy_home_marker(path: &Path) -> Result<bool> {
    let value = Value::from_file(path)
        .with_context(|| format!("Could not parse descriptor {}", path.display()))?;
    let Value::Dictionary(mut dict) = value else {
        anyhow::bail!("Expected plist dictionary at root of {}", path.display());
    };

    let mut changed = false;

    if let Some(Value::Array(args)) = dict.get_mut("ProgramArguments") {
        for arg in args.iter_mut() {
            if let Value::String(s) = arg
                && s.starts_with('~')
            {
                *s = shellexpand::tilde(s.as_str()).into_owned();
                changed = true;
            }
        }
    }

    if let Some(Value::String(dir)) = dict.get_mut("WorkingDirectory")
        && dir.starts_with('~')
    {
        *dir = shellexpand::tilde(dir.as_str()).into_owned();
        changed = true;
    }

    if changed {
        let file = fs::File::create(path)
            .with_context(|| format!("Could not rewrite {}", path.display()))?;
        Value::Dictionary(dict)
            .to_writer_xml(file)
            .with_context(|| format!("Could not serialize {}", path.display()))?;
    }

    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict_of(value: Value) -> Dictionary {
        match value {
            Value::Dictionary(d) => d,
            other => panic!("expected dictionary, got {other:?}"),
        }
    }

    #[test]
    fn kanata_plist_has_expected_fields() {
        let dict = dict_of(kanata_descriptor().to_plist());
        assert_eq!(
            dict.get("Label"),
            Some(&Value::String(paths::KANATA_LABEL.into()))
        );
        assert_eq!(dict.get("KeepAlive"), Some(&Value::Boolean(true)));
        assert_eq!(dict.get("RunAtLoad"), Some(&Value::Boolean(true)));
        assert!(dict.get("SoftResourceLimits").is_some());

        let Some(Value::Array(args)) = dict.get("ProgramArguments") else {
            panic!("missing ProgramArguments");
        };
        assert!(args.len() >= 3);
        assert_eq!(args[1], Value::String("--cfg".into()));
    }

    #[test]
    fn one_shot_manager_has_no_keepalive() {
        let dict = dict_of(vhid_manager_descriptor().to_plist());
        assert_eq!(dict.get("KeepAlive"), Some(&Value::Boolean(false)));
        let Some(Value::Array(args)) = dict.get("ProgramArguments") else {
            panic!("missing ProgramArguments");
        };
        assert_eq!(args.last(), Some(&Value::String("activate".into())));
    }

    #[test]
    fn write_is_deterministic_and_parseable() {
        let dir = tempfile::tempdir().unwrap();
        let desc = vhid_daemon_descriptor();
        let path = desc.write_to(dir.path()).unwrap();
        let first = fs::read(&path).unwrap();
        desc.write_to(dir.path()).unwrap();
        let second = fs::read(&path).unwrap();
        assert_eq!(first, second);

        let dict = dict_of(Value::from_file(&path).unwrap());
        assert_eq!(
            dict.get("Label"),
            Some(&Value::String(paths::VHID_DAEMON_LABEL.into()))
        );
    }

    #[test]
    fn home_marker_rewrite_expands_tilde() {
        let dir = tempfile::tempdir().unwrap();
        let mut desc = kanata_descriptor();
        desc.arguments = vec!["--cfg".into(), "~/.config/keyhelm/keyhelm.kbd".into()];
        let path = desc.write_to(dir.path()).unwrap();

        assert!(rewrite_legacy_home_marker(&path).unwrap());

        let dict = dict_of(Value::from_file(&path).unwrap());
        let Some(Value::Array(args)) = dict.get("ProgramArguments") else {
            panic!("missing ProgramArguments");
        };
        let Value::String(cfg) = &args[2] else {
            panic!("expected string argument");
        };
        assert!(!cfg.starts_with('~'));
        assert!(cfg.ends_with(".config/keyhelm/keyhelm.kbd"));
    }

    #[test]
    fn rewrite_is_noop_for_absolute_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = kanata_descriptor().write_to(dir.path()).unwrap();
        assert!(!rewrite_legacy_home_marker(&path).unwrap());
    }
}
