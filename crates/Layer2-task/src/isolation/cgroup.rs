//! cgroup v2 backend
//!
//! Layout: `<root>/task-<id>/` with `memory.max` and `cpu.max` written
//! before the shim starts. The shim joins via `cgroup.procs` and unshares
//! the UTS and IPC namespaces so its command gets a private hostname and
//! SysV IPC space.

use super::{Isolation, ResourceLimits};
use crate::task::TaskId;
use mult_foundation::{Error, IsolationKind, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

const CONTROLLERS: [&str; 2] = ["memory", "cpu"];

/// cpu.max period in microseconds
const CPU_PERIOD_US: u64 = 100_000;

#[derive(Debug, Clone)]
pub struct CgroupIsolation {
    root: PathBuf,
}

impl CgroupIsolation {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn group(&self, id: TaskId) -> PathBuf {
        self.root.join(format!("task-{}", id))
    }

    /// `memory.max` value for a limit
    pub fn memory_max(limits: &ResourceLimits) -> String {
        match limits.memory_bytes {
            0 => "max".to_string(),
            bytes => bytes.to_string(),
        }
    }

    /// `cpu.max` value: quota and period in microseconds
    pub fn cpu_max(limits: &ResourceLimits) -> String {
        match limits.cpu_percent {
            0 => format!("max {}", CPU_PERIOD_US),
            percent => format!("{} {}", u64::from(percent) * CPU_PERIOD_US / 100, CPU_PERIOD_US),
        }
    }

    fn parent(&self) -> Result<&Path> {
        self.root.parent().ok_or_else(|| {
            Error::Isolation(format!("cgroup root {} has no parent", self.root.display()))
        })
    }

    /// Create the root group and delegate the controllers down to task groups
    fn ensure_root(&self) -> Result<()> {
        let parent = self.parent()?;
        let available = read(&parent.join("cgroup.controllers"))?;
        let missing: Vec<_> = CONTROLLERS
            .iter()
            .filter(|c| !available.split_whitespace().any(|a| a == **c))
            .collect();
        if !missing.is_empty() {
            return Err(Error::Isolation(format!(
                "cgroup v2 controllers missing at {}: {:?}",
                parent.display(),
                missing
            )));
        }

        fs::create_dir_all(&self.root).map_err(|e| isolation_err(&self.root, e))?;
        enable_controllers(parent)?;
        enable_controllers(&self.root)
    }
}

impl Isolation for CgroupIsolation {
    fn kind(&self) -> IsolationKind {
        IsolationKind::Cgroup
    }

    fn check(&self) -> Result<String> {
        self.ensure_root()?;
        Ok(format!("cgroup v2 at {}", self.root.display()))
    }

    fn prepare(&self, id: TaskId, limits: &ResourceLimits) -> Result<()> {
        self.ensure_root()?;
        let group = self.group(id);
        fs::create_dir_all(&group).map_err(|e| isolation_err(&group, e))?;
        write(&group.join("memory.max"), &Self::memory_max(limits))?;
        write(&group.join("cpu.max"), &Self::cpu_max(limits))?;
        debug!("Prepared {} ({:?})", group.display(), limits);
        Ok(())
    }

    fn enter(&self, id: TaskId) -> Result<()> {
        let group = self.group(id);
        write(&group.join("cgroup.procs"), &std::process::id().to_string())?;

        let rc = unsafe { libc::unshare(libc::CLONE_NEWUTS | libc::CLONE_NEWIPC) };
        if rc != 0 {
            return Err(Error::Isolation(format!(
                "unshare(UTS|IPC) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    fn configure(&self, _command: &mut Command, _limits: &ResourceLimits) {}

    fn members(&self, id: TaskId) -> Vec<i32> {
        fs::read_to_string(self.group(id).join("cgroup.procs"))
            .map(|procs| procs.lines().filter_map(|l| l.trim().parse().ok()).collect())
            .unwrap_or_default()
    }

    fn release(&self, id: TaskId) -> Result<()> {
        let group = self.group(id);
        match fs::remove_dir(&group) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            // the exiting shim itself is still a member
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                debug!("{} still busy, left for the next stop", group.display());
                Ok(())
            }
            Err(e) => {
                warn!("Leaving {} in place: {}", group.display(), e);
                Ok(())
            }
        }
    }
}

fn enable_controllers(dir: &Path) -> Result<()> {
    let control = dir.join("cgroup.subtree_control");
    let enabled = read(&control)?;
    for controller in CONTROLLERS {
        if !enabled.split_whitespace().any(|c| c == controller) {
            write(&control, &format!("+{}", controller))?;
        }
    }
    Ok(())
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| isolation_err(path, e))
}

fn write(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value).map_err(|e| isolation_err(path, e))
}

fn isolation_err(path: &Path, e: std::io::Error) -> Error {
    Error::Isolation(format!("{}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_limit_values() {
        let unlimited = ResourceLimits::unlimited();
        assert_eq!(CgroupIsolation::memory_max(&unlimited), "max");
        assert_eq!(CgroupIsolation::cpu_max(&unlimited), "max 100000");

        let limits = ResourceLimits {
            memory_bytes: 20_000_000,
            cpu_percent: 20,
        };
        assert_eq!(CgroupIsolation::memory_max(&limits), "20000000");
        assert_eq!(CgroupIsolation::cpu_max(&limits), "20000 100000");

        let two_cpus = ResourceLimits {
            memory_bytes: 0,
            cpu_percent: 200,
        };
        assert_eq!(CgroupIsolation::cpu_max(&two_cpus), "200000 100000");
    }

    #[test]
    fn test_group_path() {
        let isolation = CgroupIsolation::new("/sys/fs/cgroup/multi-tasker");
        assert_eq!(
            isolation.group(TaskId(4)),
            PathBuf::from("/sys/fs/cgroup/multi-tasker/task-4")
        );
    }

    #[test]
    fn test_missing_controllers_fail_check() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("cgroup.controllers"), "cpuset io pids").unwrap();
        let isolation = CgroupIsolation::new(dir.path().join("multi-tasker"));

        let err = isolation.check().unwrap_err();
        assert!(matches!(err, Error::Isolation(_)));
        assert!(err.to_string().contains("memory"));
    }

    #[test]
    fn test_prepare_writes_limits_on_fake_hierarchy() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("multi-tasker");
        fs::write(dir.path().join("cgroup.controllers"), "cpu memory pids").unwrap();
        fs::write(dir.path().join("cgroup.subtree_control"), "cpu memory").unwrap();
        fs::create_dir(&root).unwrap();
        fs::write(root.join("cgroup.subtree_control"), "cpu memory").unwrap();

        let isolation = CgroupIsolation::new(&root);
        let limits = ResourceLimits {
            memory_bytes: 1_000_000,
            cpu_percent: 50,
        };
        isolation.prepare(TaskId(2), &limits).unwrap();

        let group = isolation.group(TaskId(2));
        assert_eq!(fs::read_to_string(group.join("memory.max")).unwrap(), "1000000");
        assert_eq!(fs::read_to_string(group.join("cpu.max")).unwrap(), "50000 100000");
    }

    #[test]
    fn test_members_of_missing_group() {
        let dir = tempdir().unwrap();
        let isolation = CgroupIsolation::new(dir.path());
        assert!(isolation.members(TaskId(1)).is_empty());
        assert!(isolation.release(TaskId(1)).is_ok());
    }
}
