//! Per-task artifacts persisted under `tasks/<id>/`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The essential files of a task directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Artifact {
    Stats,
    Resources,
    Processes,
    Env,
    Stdout,
    Stderr,
}

impl Artifact {
    /// Every essential artifact, in the order health checks report them
    pub const ALL: [Artifact; 6] = [
        Artifact::Stats,
        Artifact::Resources,
        Artifact::Processes,
        Artifact::Env,
        Artifact::Stdout,
        Artifact::Stderr,
    ];

    pub fn file_name(&self) -> &'static str {
        match self {
            Artifact::Stats => "stats.json",
            Artifact::Resources => "resources.json",
            Artifact::Processes => "processes.json",
            Artifact::Env => "env.json",
            Artifact::Stdout => "stdout",
            Artifact::Stderr => "stderr",
        }
    }
}

impl std::fmt::Display for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.file_name())
    }
}

// ============================================================================
// processes.json
// ============================================================================

/// A pid paired with its kernel start time, so a recycled pid is not
/// mistaken for the process that was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessRef {
    pub pid: i32,
    /// Field 22 of `/proc/<pid>/stat`, in clock ticks since boot
    pub starttime: u64,
}

/// Bookkeeping for the most recent launch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub shim_pid: i32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Live process tree of a task; empty unless running
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    #[serde(default)]
    pub shim: Option<ProcessRef>,
    #[serde(default)]
    pub children: Vec<ProcessRef>,
    #[serde(default)]
    pub last_run: Option<RunRecord>,
}

impl ProcessSnapshot {
    /// Every recorded process, shim first
    pub fn all(&self) -> impl Iterator<Item = &ProcessRef> {
        self.shim.iter().chain(self.children.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.shim.is_none() && self.children.is_empty()
    }

    /// Drop the live set, keeping the run record
    pub fn clear(&mut self, exit_code: Option<i32>) {
        self.shim = None;
        self.children.clear();
        if let Some(run) = self.last_run.as_mut() {
            if run.exited_at.is_none() {
                run.exited_at = Some(Utc::now());
            }
            if exit_code.is_some() {
                run.exit_code = exit_code;
            }
        }
    }
}

// ============================================================================
// resources.json
// ============================================================================

/// Latest usage sample; only written for deep monitoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    pub sampled_at: DateTime<Utc>,
}

/// Limits actually applied to the live context
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub memory_limit: u64,
    #[serde(default)]
    pub cpu_limit: u32,
    #[serde(default)]
    pub applied_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl ResourceDescriptor {
    pub fn memory_collected(&self) -> bool {
        self.usage.as_ref().is_some_and(|u| u.memory_bytes.is_some())
    }

    pub fn cpu_collected(&self) -> bool {
        self.usage.as_ref().is_some_and(|u| u.cpu_percent.is_some())
    }
}

// ============================================================================
// env.json
// ============================================================================

/// Ordered `KEY=VALUE` environment captured at start
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvSnapshot {
    #[serde(default)]
    pub map_string: Vec<String>,
}

impl EnvSnapshot {
    /// Capture the calling process's environment
    pub fn capture() -> Self {
        let map_string = std::env::vars_os()
            .map(|(k, v)| format!("{}={}", k.to_string_lossy(), v.to_string_lossy()))
            .collect();
        Self { map_string }
    }

    pub fn is_empty(&self) -> bool {
        self.map_string.is_empty()
    }

    /// Entries split at the first `=`; malformed entries are skipped
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map_string
            .iter()
            .filter_map(|entry| entry.split_once('='))
            .filter(|(key, _)| !key.is_empty())
    }
}
