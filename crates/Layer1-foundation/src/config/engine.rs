//! Engine Config
//!
//! Loaded from `<home>/config.json`; every key is optional. Two environment
//! variables take precedence so a shim inherits its launcher's view.

use crate::storage::JsonStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file inside the home directory
pub const CONFIG_FILE: &str = "config.json";

/// Overrides the home directory (`~/.multi-tasker`)
pub const ENV_HOME: &str = "MULT_HOME";

/// Overrides the isolation backend
pub const ENV_ISOLATION: &str = "MULT_ISOLATION";

// ============================================================================
// Isolation backend
// ============================================================================

/// Which primitive confines a task's context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationKind {
    /// cgroup v2 group per task plus UTS/IPC namespaces
    #[default]
    Cgroup,

    /// setrlimit plus SIGSTOP/SIGCONT cpu duty-cycling (unprivileged)
    Rlimit,
}

impl IsolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationKind::Cgroup => "cgroup",
            IsolationKind::Rlimit => "rlimit",
        }
    }
}

impl std::str::FromStr for IsolationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cgroup" => Ok(IsolationKind::Cgroup),
            "rlimit" => Ok(IsolationKind::Rlimit),
            other => Err(Error::Config(format!("unknown isolation backend `{}`", other))),
        }
    }
}

impl std::fmt::Display for IsolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Engine Config
// ============================================================================

/// multi-tasker engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root of all persisted state; not read from the file itself
    #[serde(skip)]
    pub home: PathBuf,

    pub isolation: IsolationKind,

    /// Parent cgroup under which `task-<id>` groups are created
    pub cgroup_root: PathBuf,

    /// Grace period between SIGTERM and SIGKILL
    pub stop_timeout_ms: u64,

    /// How long `start` waits for the shim to publish its process set
    pub ready_timeout_ms: u64,

    /// Shim refresh cadence for the process set and deep samples
    pub sample_interval_ms: u64,

    /// Default tail length for `logs`
    pub log_lines: usize,

    /// Executable re-invoked as `<program> shim <id>`; current exe when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shim_program: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            home: PathBuf::from(".multi-tasker"),
            isolation: IsolationKind::default(),
            cgroup_root: PathBuf::from("/sys/fs/cgroup/multi-tasker"),
            stop_timeout_ms: 5_000,
            ready_timeout_ms: 5_000,
            sample_interval_ms: 1_000,
            log_lines: 15,
            shim_program: None,
        }
    }
}

impl EngineConfig {
    /// Defaults rooted at `home`, ignoring files and environment
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            ..Self::default()
        }
    }

    // ========================================================================
    // Load / Save
    // ========================================================================

    /// Resolve home, merge `config.json`, then apply environment overrides
    pub fn load() -> Result<Self> {
        let home = match std::env::var_os(ENV_HOME) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => JsonStore::global()?.base_dir().to_path_buf(),
        };
        let mut config = Self::load_from(&home)?;
        if let Ok(kind) = std::env::var(ENV_ISOLATION) {
            if !kind.is_empty() {
                config.isolation = kind.parse()?;
            }
        }
        tracing::debug!(
            "Engine config: home={}, isolation={}",
            config.home.display(),
            config.isolation
        );
        Ok(config)
    }

    /// Load `home/config.json`, defaults when absent
    pub fn load_from(home: &Path) -> Result<Self> {
        let store = JsonStore::new(home);
        let mut config = store
            .load_optional::<EngineConfig>(CONFIG_FILE)?
            .unwrap_or_default();
        config.home = home.to_path_buf();
        Ok(config)
    }

    // ========================================================================
    // Derived values
    // ========================================================================

    pub fn tasks_dir(&self) -> PathBuf {
        self.home.join("tasks")
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(50))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::with_home("/tmp/mult");
        assert_eq!(config.isolation, IsolationKind::Cgroup);
        assert_eq!(config.log_lines, 15);
        assert_eq!(config.tasks_dir(), PathBuf::from("/tmp/mult/tasks"));
        assert_eq!(config.stop_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{ "isolation": "rlimit", "stop_timeout_ms": 250 }"#,
        )
        .unwrap();

        let config = EngineConfig::load_from(dir.path()).unwrap();
        assert_eq!(config.isolation, IsolationKind::Rlimit);
        assert_eq!(config.stop_timeout_ms, 250);
        assert_eq!(config.ready_timeout_ms, 5_000);
        assert_eq!(config.home, dir.path());
    }

    #[test]
    fn test_home_is_not_serialized() {
        let mut config = EngineConfig::with_home("/tmp/mult");
        config.log_lines = 40;
        let raw = serde_json::to_string(&config).unwrap();
        assert!(!raw.contains("home"));
        assert!(raw.contains("\"log_lines\":40"));
    }

    #[test]
    fn test_isolation_kind_parse() {
        assert_eq!("RLIMIT".parse::<IsolationKind>().unwrap(), IsolationKind::Rlimit);
        assert!("docker".parse::<IsolationKind>().is_err());
    }
}
