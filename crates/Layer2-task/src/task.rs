//! Task definition and types

use crate::state::TaskStatus;
use serde::{Deserialize, Serialize};

/// Unique identifier for a task, allocated from 1 upwards
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u32);

impl TaskId {
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = mult_foundation::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().parse::<u32>() {
            Ok(id) if id > 0 => Ok(Self(id)),
            _ => Err(mult_foundation::Error::Validation(format!(
                "`{}` is not a valid task id",
                s
            ))),
        }
    }
}

/// Monitoring depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Monitoring {
    /// Liveness only
    #[default]
    Shallow,

    /// Liveness plus periodic memory/cpu samples
    Deep,
}

impl Monitoring {
    pub fn display_name(&self) -> &'static str {
        match self {
            Monitoring::Shallow => "shallow",
            Monitoring::Deep => "deep",
        }
    }
}

impl std::fmt::Display for Monitoring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Declared configuration of a task, persisted as `stats.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Shell command line
    pub command: String,

    /// Bytes; 0 = unlimited
    #[serde(default)]
    pub memory_limit: u64,

    /// Percent of one CPU; 0 = unlimited
    #[serde(default)]
    pub cpu_limit: u32,

    /// Survive the launching session going away
    #[serde(default)]
    pub persist: bool,

    #[serde(default)]
    pub monitoring: Monitoring,

    /// Started by `boot()`
    #[serde(default)]
    pub boot: bool,

    /// Inherit the caller's terminal instead of capturing logs
    #[serde(default)]
    pub interactive: bool,
}

impl TaskSpec {
    /// Create a spec with every option at its default
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            memory_limit: 0,
            cpu_limit: 0,
            persist: false,
            monitoring: Monitoring::Shallow,
            boot: false,
            interactive: false,
        }
    }

    /// Apply a partial update in place
    pub fn apply(&mut self, patch: &TaskPatch) {
        patch.command.apply_to(&mut self.command);
        patch.memory_limit.apply_to(&mut self.memory_limit);
        patch.cpu_limit.apply_to(&mut self.cpu_limit);
        patch.persist.apply_to(&mut self.persist);
        patch.monitoring.apply_to(&mut self.monitoring);
        patch.boot.apply_to(&mut self.boot);
        patch.interactive.apply_to(&mut self.interactive);
    }

    /// Builder-style variant of [`TaskSpec::apply`]
    pub fn with_patch(mut self, patch: &TaskPatch) -> Self {
        self.apply(patch);
        self
    }
}

// ============================================================================
// Partial updates
// ============================================================================

/// Three-state field update
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Patch<T> {
    /// Keep the current value
    #[default]
    Unchanged,

    /// Reset to the field's empty default
    Clear,

    /// Replace with a value
    Set(T),
}

impl<T: Clone + Default> Patch<T> {
    pub fn apply_to(&self, target: &mut T) {
        match self {
            Patch::Unchanged => {}
            Patch::Clear => *target = T::default(),
            Patch::Set(value) => *target = value.clone(),
        }
    }

    pub fn is_unchanged(&self) -> bool {
        matches!(self, Patch::Unchanged)
    }
}

impl<T> From<Option<T>> for Patch<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Patch::Set(v),
            None => Patch::Unchanged,
        }
    }
}

/// Partial update of a [`TaskSpec`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskPatch {
    pub command: Patch<String>,
    pub memory_limit: Patch<u64>,
    pub cpu_limit: Patch<u32>,
    pub persist: Patch<bool>,
    pub monitoring: Patch<Monitoring>,
    pub boot: Patch<bool>,
    pub interactive: Patch<bool>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self.command.is_unchanged()
            && self.memory_limit.is_unchanged()
            && self.cpu_limit.is_unchanged()
            && self.persist.is_unchanged()
            && self.monitoring.is_unchanged()
            && self.boot.is_unchanged()
            && self.interactive.is_unchanged()
    }
}

/// A persisted task as read back from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub spec: TaskSpec,
}

impl Task {
    pub fn new(id: TaskId, spec: TaskSpec) -> Self {
        Self { id, spec }
    }
}

/// A task plus its observed runtime state, as returned by listing
#[derive(Debug, Clone)]
pub struct TaskView {
    pub task: Task,
    pub status: TaskStatus,
    pub processes: crate::artifact::ProcessSnapshot,
    pub resources: crate::artifact::ResourceDescriptor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults() {
        let spec = TaskSpec::new("echo hi");
        assert_eq!(spec.memory_limit, 0);
        assert_eq!(spec.cpu_limit, 0);
        assert!(!spec.persist);
        assert_eq!(spec.monitoring, Monitoring::Shallow);
        assert!(!spec.boot);
        assert!(!spec.interactive);
    }

    #[test]
    fn test_patch_touches_only_supplied_fields() {
        let mut spec = TaskSpec::new("echo hi");
        spec.cpu_limit = 20;
        spec.persist = true;

        spec.apply(&TaskPatch {
            memory_limit: Patch::Set(1_000),
            ..Default::default()
        });

        assert_eq!(spec.memory_limit, 1_000);
        assert_eq!(spec.cpu_limit, 20);
        assert!(spec.persist);
        assert_eq!(spec.command, "echo hi");
    }

    #[test]
    fn test_patch_clear_resets_to_default() {
        let mut spec = TaskSpec::new("sleep 5");
        spec.cpu_limit = 50;
        spec.monitoring = Monitoring::Deep;
        spec.boot = true;

        spec.apply(&TaskPatch {
            cpu_limit: Patch::Clear,
            monitoring: Patch::Clear,
            boot: Patch::Clear,
            ..Default::default()
        });

        assert_eq!(spec.cpu_limit, 0);
        assert_eq!(spec.monitoring, Monitoring::Shallow);
        assert!(!spec.boot);
    }

    #[test]
    fn test_stats_json_shape() {
        let json = serde_json::to_value(TaskSpec::new("echo hi")).unwrap();
        assert_eq!(json["command"], "echo hi");
        assert_eq!(json["monitoring"], "Shallow");
        assert_eq!(json["memory_limit"], 0);
        assert_eq!(json["interactive"], false);
    }

    #[test]
    fn test_task_id_parse() {
        assert_eq!("4".parse::<TaskId>().unwrap(), TaskId(4));
        assert!("0".parse::<TaskId>().is_err());
        assert!("abc".parse::<TaskId>().is_err());
    }

    #[test]
    fn test_empty_patch() {
        assert!(TaskPatch::default().is_empty());
        let patch = TaskPatch {
            interactive: Patch::Set(true),
            ..Default::default()
        };
        assert!(!patch.is_empty());
    }
}
