//! Isolation backends
//!
//! A task runs inside a context that confines it and carries its resource
//! ceilings. Each supported platform primitive is one [`Isolation`] impl:
//!
//! - **cgroup**: cgroup v2 group per task, UTS/IPC namespaces (Linux, root)
//! - **rlimit**: `RLIMIT_AS` plus SIGSTOP/SIGCONT cpu duty-cycling (Linux, unprivileged)
//!
//! There is no unconfined fallback: an unavailable backend fails `check`,
//! `prepare` and therefore `start`.

#[cfg(target_os = "linux")]
mod cgroup;
#[cfg(target_os = "linux")]
mod rlimit;
mod throttle;

#[cfg(target_os = "linux")]
pub use cgroup::CgroupIsolation;
#[cfg(target_os = "linux")]
pub use rlimit::RlimitIsolation;
pub use throttle::CpuThrottle;

use crate::task::{TaskId, TaskSpec};
use mult_foundation::{EngineConfig, IsolationKind, Result};
use std::sync::Arc;
use tokio::process::Command;

/// Hard ceilings for one context; 0 means unlimited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    /// Percent of one CPU
    pub cpu_percent: u32,
}

impl ResourceLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn is_unlimited(&self) -> bool {
        self.memory_bytes == 0 && self.cpu_percent == 0
    }
}

impl From<&TaskSpec> for ResourceLimits {
    fn from(spec: &TaskSpec) -> Self {
        Self {
            memory_bytes: spec.memory_limit,
            cpu_percent: spec.cpu_limit,
        }
    }
}

/// Capability interface over a host isolation primitive
pub trait Isolation: Send + Sync {
    fn kind(&self) -> IsolationKind;

    /// Verify the primitive is usable on this host; returns a short description
    fn check(&self) -> Result<String>;

    /// Create and configure the task's context before its shim launches
    fn prepare(&self, id: TaskId, limits: &ResourceLimits) -> Result<()>;

    /// Move the calling shim into the context
    fn enter(&self, id: TaskId) -> Result<()>;

    /// Per-command hooks, run in the child before exec
    fn configure(&self, command: &mut Command, limits: &ResourceLimits);

    /// Cpu limiting the shim must drive itself, if the backend needs it
    fn cpu_throttle(&self, _limits: &ResourceLimits) -> Option<CpuThrottle> {
        None
    }

    /// Pids the context knows about independently of the process tree
    fn members(&self, _id: TaskId) -> Vec<i32> {
        Vec::new()
    }

    /// Tear down the context once nothing runs in it
    fn release(&self, _id: TaskId) -> Result<()> {
        Ok(())
    }
}

/// Build the backend named by the configuration
#[cfg(target_os = "linux")]
pub fn backend(config: &EngineConfig) -> Result<Arc<dyn Isolation>> {
    Ok(match config.isolation {
        IsolationKind::Cgroup => Arc::new(CgroupIsolation::new(&config.cgroup_root)),
        IsolationKind::Rlimit => Arc::new(RlimitIsolation::new()),
    })
}

#[cfg(not(target_os = "linux"))]
pub fn backend(config: &EngineConfig) -> Result<Arc<dyn Isolation>> {
    Err(mult_foundation::Error::Isolation(format!(
        "the {} backend is only available on Linux",
        config.isolation
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_from_spec() {
        let mut spec = TaskSpec::new("echo hi");
        assert!(ResourceLimits::from(&spec).is_unlimited());

        spec.memory_limit = 20_000_000;
        spec.cpu_limit = 20;
        let limits = ResourceLimits::from(&spec);
        assert_eq!(limits.memory_bytes, 20_000_000);
        assert_eq!(limits.cpu_percent, 20);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_backend_selection() {
        let mut config = EngineConfig::with_home("/tmp/mult-test");
        assert_eq!(backend(&config).unwrap().kind(), IsolationKind::Cgroup);
        config.isolation = IsolationKind::Rlimit;
        assert_eq!(backend(&config).unwrap().kind(), IsolationKind::Rlimit);
    }
}
