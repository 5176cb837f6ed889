//! # mult-task
//!
//! Task supervision engine for multi-tasker.
//! Each task is a directory of artifacts under `<home>/tasks/<id>/`; a shim
//! process runs the task's command inside an isolation context.
//!
//! ## Features
//!
//! - Task Store with restart-safe id allocation and per-id locking
//! - Isolation backends (cgroup v2 + namespaces, setrlimit + cpu duty-cycling)
//! - Shim launch, tree termination with SIGKILL escalation
//! - Liveness by `(pid, starttime)` and deep usage sampling
//! - Append-only log capture with stream-labelled reading and following
//! - Health checks with optional repair

pub mod artifact;
pub mod engine;
pub mod health;
pub mod isolation;
pub mod launcher;
pub mod log;
pub mod monitor;
pub mod process;
pub mod shim;
pub mod state;
pub mod store;
pub mod task;

// Engine
pub use engine::{
    BootResult, CreateOptions, Created, DeleteResult, Deleted, Engine, StartOptions,
};
pub use launcher::{Launch, Launcher, StartOutcome, StopOutcome};

// Task model
pub use artifact::{
    Artifact, EnvSnapshot, ProcessRef, ProcessSnapshot, ResourceDescriptor, RunRecord, Usage,
};
pub use state::TaskStatus;
pub use task::{Monitoring, Patch, Task, TaskId, TaskPatch, TaskSpec, TaskView};

// Store, logs, health
pub use health::{HealthChecker, HealthReport, IsolationHealth, TaskHealth};
pub use log::{LogCapture, LogFollower, LogLine, LogStream, LogView};
pub use monitor::{Monitor, ProcessInfo};
pub use store::{RootEntry, TaskStore};

// Isolation
pub use isolation::{Isolation, ResourceLimits};
