//! setrlimit backend
//!
//! Works without privileges: memory is capped with `RLIMIT_AS` in the
//! command's pre-exec hook and cpu is duty-cycled by the shim.

use super::{CpuThrottle, Isolation, ResourceLimits};
use crate::process::ProcStat;
use crate::task::TaskId;
use mult_foundation::{Error, IsolationKind, Result};
use tokio::process::Command;

#[derive(Debug, Clone, Default)]
pub struct RlimitIsolation;

impl RlimitIsolation {
    pub fn new() -> Self {
        Self
    }
}

impl Isolation for RlimitIsolation {
    fn kind(&self) -> IsolationKind {
        IsolationKind::Rlimit
    }

    fn check(&self) -> Result<String> {
        if ProcStat::read(std::process::id() as i32).is_none() {
            return Err(Error::Isolation("/proc is not readable".to_string()));
        }

        let mut current = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if unsafe { libc::getrlimit(libc::RLIMIT_AS, &mut current) } != 0 {
            return Err(Error::Isolation(format!(
                "getrlimit(RLIMIT_AS) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok("setrlimit with cpu duty-cycling".to_string())
    }

    fn prepare(&self, _id: TaskId, _limits: &ResourceLimits) -> Result<()> {
        self.check().map(|_| ())
    }

    fn enter(&self, _id: TaskId) -> Result<()> {
        Ok(())
    }

    fn configure(&self, command: &mut Command, limits: &ResourceLimits) {
        if limits.memory_bytes == 0 {
            return;
        }
        let limit = libc::rlimit {
            rlim_cur: limits.memory_bytes as libc::rlim_t,
            rlim_max: limits.memory_bytes as libc::rlim_t,
        };
        // setrlimit is async-signal-safe
        unsafe {
            command.pre_exec(move || {
                if libc::setrlimit(libc::RLIMIT_AS, &limit) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    fn cpu_throttle(&self, limits: &ResourceLimits) -> Option<CpuThrottle> {
        CpuThrottle::new(limits.cpu_percent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_passes_on_linux() {
        assert!(RlimitIsolation::new().check().is_ok());
    }

    #[test]
    fn test_throttle_only_for_partial_cpu() {
        let isolation = RlimitIsolation::new();
        let mut limits = ResourceLimits::unlimited();
        assert!(isolation.cpu_throttle(&limits).is_none());
        limits.cpu_percent = 30;
        assert!(isolation.cpu_throttle(&limits).is_some());
    }

    #[tokio::test]
    async fn test_memory_limit_applies_to_command() {
        let mut command = Command::new("sh");
        command.args(["-c", "ulimit -v"]);
        command.stdout(std::process::Stdio::piped());
        RlimitIsolation::new().configure(
            &mut command,
            &ResourceLimits {
                memory_bytes: 512_000_000,
                cpu_percent: 0,
            },
        );

        let output = command.output().await.unwrap();
        // `ulimit -v` reports KiB
        let reported = String::from_utf8_lossy(&output.stdout);
        assert_eq!(reported.trim(), "500000");
    }
}
