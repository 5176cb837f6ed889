//! Task status

use serde::{Deserialize, Serialize};

/// Derived state of a task; never persisted, always observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// The shim or one of its recorded children is alive
    Running,

    /// Nothing recorded is alive
    Stopped,
}

impl TaskStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, TaskStatus::Running)
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            TaskStatus::Running => "Running",
            TaskStatus::Stopped => "Stopped",
        }
    }
}

impl From<bool> for TaskStatus {
    fn from(alive: bool) -> Self {
        if alive {
            TaskStatus::Running
        } else {
            TaskStatus::Stopped
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}
