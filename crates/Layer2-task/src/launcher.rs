//! Launcher - shim spawn and tree termination
//!
//! `start` prepares the isolation context, spawns `<program> shim <id>` and
//! returns once the shim has published its process set. `stop` signals the
//! live set, escalates to SIGKILL after the grace period and clears the
//! snapshot. Both hold the task lock for their whole duration.

use crate::artifact::{EnvSnapshot, ProcessRef, ProcessSnapshot, ResourceDescriptor};
use crate::isolation::{Isolation, ResourceLimits};
use crate::log::{LogCapture, LogStream};
use crate::process::signal::{self, exit_code};
use crate::process::tree::live_set;
use crate::process::{is_alive, Signal};
use crate::store::TaskStore;
use crate::task::{Task, TaskId};
use chrono::Utc;
use mult_foundation::config::{ENV_HOME, ENV_ISOLATION};
use mult_foundation::error::EXIT_ISOLATION;
use mult_foundation::{EngineConfig, Error, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Poll cadence while waiting for the shim's ready signal
const READY_POLL: Duration = Duration::from_millis(20);

/// Poll cadence while waiting for a signalled tree to exit
const STOP_POLL: Duration = Duration::from_millis(50);

/// Wait after SIGKILL before giving up on stragglers
const KILL_GRACE: Duration = Duration::from_secs(1);

// ============================================================================
// Outcomes
// ============================================================================

/// A freshly launched shim
#[derive(Debug)]
pub struct Launch {
    pub id: TaskId,
    pub pid: i32,
    pub interactive: bool,
    child: Child,
}

impl Launch {
    /// Wait for the shim to exit; returns the command's exit code
    pub async fn wait(mut self) -> Result<i32> {
        let status = self.child.wait().await?;
        Ok(exit_code(status))
    }
}

#[derive(Debug)]
pub enum StartOutcome {
    Started(Launch),
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// `escalated` when SIGKILL was needed
    Stopped { escalated: bool },
    NotRunning,
}

// ============================================================================
// Launcher
// ============================================================================

pub struct Launcher {
    config: EngineConfig,
    store: TaskStore,
    isolation: Arc<dyn Isolation>,
}

impl Launcher {
    pub fn new(config: EngineConfig, store: TaskStore, isolation: Arc<dyn Isolation>) -> Self {
        Self {
            config,
            store,
            isolation,
        }
    }

    /// Is anything of the task still alive, including context members
    pub fn is_running(&self, id: TaskId) -> bool {
        !live_set(&self.snapshot(id), &self.isolation.members(id)).is_empty()
    }

    /// Recorded process set; an unreadable one counts as empty so the
    /// context members can still be found and signalled
    fn snapshot(&self, id: TaskId) -> ProcessSnapshot {
        self.store.read_processes(id).unwrap_or_else(|e| {
            warn!("Process set of task {} unreadable, treating it as empty: {}", id, e);
            ProcessSnapshot::default()
        })
    }

    // ========================================================================
    // Start
    // ========================================================================

    pub async fn start(&self, task: &Task, refresh_env: bool) -> Result<StartOutcome> {
        let id = task.id;
        let _lock = self.store.lock(id)?;

        if self.is_running(id) {
            info!("Task {} is already running", id);
            return Ok(StartOutcome::AlreadyRunning);
        }

        let env = self.store.read_env(id)?;
        if refresh_env || env.is_empty() {
            let captured = EnvSnapshot::capture();
            debug!("Captured {} environment entries for task {}", captured.map_string.len(), id);
            self.store.write_env(id, &captured)?;
        }

        let limits = ResourceLimits::from(&task.spec);
        self.isolation.prepare(id, &limits)?;
        self.store.write_resources(
            id,
            &ResourceDescriptor {
                backend: Some(self.isolation.kind().to_string()),
                memory_limit: limits.memory_bytes,
                cpu_limit: limits.cpu_percent,
                applied_at: Some(Utc::now()),
                usage: None,
            },
        )?;
        // a stale run record must not be mistaken for the new shim's
        self.store.write_processes(id, &ProcessSnapshot::default())?;

        let mut child = self.spawn_shim(task)?;
        let pid = child
            .id()
            .map(|pid| pid as i32)
            .ok_or_else(|| Error::Process(format!("shim for task {} exited at spawn", id)))?;
        debug!("Spawned shim {} for task {}", pid, id);

        if let Err(e) = self.wait_ready(id, pid, &mut child).await {
            if let Err(release) = self.isolation.release(id) {
                warn!("Releasing context of task {} failed: {}", id, release);
            }
            return Err(e);
        }

        info!("Task {} started with shim {}", id, pid);
        Ok(StartOutcome::Started(Launch {
            id,
            pid,
            interactive: task.spec.interactive,
            child,
        }))
    }

    fn shim_program(&self) -> Result<PathBuf> {
        match &self.config.shim_program {
            Some(program) => Ok(program.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }

    fn spawn_shim(&self, task: &Task) -> Result<Child> {
        let mut command = Command::new(self.shim_program()?);
        command
            .arg("shim")
            .arg(task.id.to_string())
            .env(ENV_HOME, &self.config.home)
            .env(ENV_ISOLATION, self.isolation.kind().as_str());

        if task.spec.interactive {
            command
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        } else {
            let stderr = LogCapture::open(&self.store, task.id, LogStream::Stderr)?;
            command
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::from(stderr));
        }

        if task.spec.persist {
            // a new session keeps the tree out of the caller's hangup
            unsafe {
                command.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        command
            .spawn()
            .map_err(|e| Error::Process(format!("failed to spawn shim for task {}: {}", task.id, e)))
    }

    /// The shim is ready once `processes.json` names it in `last_run`
    async fn wait_ready(&self, id: TaskId, pid: i32, child: &mut Child) -> Result<()> {
        let deadline = Instant::now() + self.config.ready_timeout();
        loop {
            let exited = child.try_wait()?;
            match self.store.read_processes(id) {
                Ok(snapshot) if snapshot.last_run.as_ref().is_some_and(|r| r.shim_pid == pid) => {
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => debug!("processes.json of task {} not readable yet: {}", id, e),
            }

            if let Some(status) = exited {
                let code = exit_code(status);
                let reason = format!(
                    "shim for task {} exited with code {} before it was ready, see its stderr log",
                    id, code
                );
                return Err(if code == EXIT_ISOLATION {
                    Error::Isolation(reason)
                } else {
                    Error::Process(reason)
                });
            }

            if Instant::now() >= deadline {
                warn!("Shim {} of task {} missed the ready deadline", pid, id);
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(Error::Process(format!(
                    "shim for task {} was not ready within {} ms",
                    id, self.config.ready_timeout_ms
                )));
            }
            sleep(READY_POLL).await;
        }
    }

    // ========================================================================
    // Stop
    // ========================================================================

    pub async fn stop(&self, id: TaskId) -> Result<StopOutcome> {
        let _lock = self.store.lock(id)?;
        let snapshot = self.snapshot(id);
        let live = live_set(&snapshot, &self.isolation.members(id));

        if live.is_empty() {
            if !snapshot.is_empty() {
                debug!("Task {} left a stale process set, clearing it", id);
                self.clear_snapshot(id, snapshot)?;
            }
            self.isolation.release(id)?;
            return Ok(StopOutcome::NotRunning);
        }

        info!("Stopping task {} ({} processes)", id, live.len());
        signal::send_all(&live, Signal::Term)?;
        // throttled processes sit in SIGSTOP and would never see the TERM
        signal::send_all(&live, Signal::Cont)?;

        let mut escalated = false;
        let survivors = self
            .wait_exit(id, &snapshot, &live, self.config.stop_timeout())
            .await;
        if !survivors.is_empty() {
            warn!(
                "Task {} still has {} processes after {} ms, sending SIGKILL",
                id,
                survivors.len(),
                self.config.stop_timeout_ms
            );
            signal::send_all(&survivors, Signal::Kill)?;
            escalated = true;

            let stragglers = self.wait_exit(id, &snapshot, &survivors, KILL_GRACE).await;
            if !stragglers.is_empty() {
                warn!("Task {}: {} processes survived SIGKILL", id, stragglers.len());
            }
        }

        // the shim may have recorded its exit code in the meantime
        let latest = self.store.read_processes(id).unwrap_or(snapshot);
        self.clear_snapshot(id, latest)?;
        self.isolation.release(id)?;
        info!("Task {} stopped", id);
        Ok(StopOutcome::Stopped { escalated })
    }

    /// Poll until nothing of the task is alive or `timeout` passes;
    /// returns what is still alive
    async fn wait_exit(
        &self,
        id: TaskId,
        snapshot: &ProcessSnapshot,
        signalled: &[ProcessRef],
        timeout: Duration,
    ) -> Vec<ProcessRef> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut alive = live_set(snapshot, &self.isolation.members(id));
            for process in signalled.iter().filter(|p| is_alive(p)) {
                if !alive.iter().any(|a| a.pid == process.pid) {
                    alive.push(*process);
                }
            }
            if alive.is_empty() || Instant::now() >= deadline {
                return alive;
            }
            sleep(STOP_POLL).await;
        }
    }

    fn clear_snapshot(&self, id: TaskId, mut snapshot: ProcessSnapshot) -> Result<()> {
        snapshot.clear(None);
        self.store.write_processes(id, &snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::CpuThrottle;
    use crate::process::identify;
    use crate::task::TaskSpec;
    use mult_foundation::IsolationKind;
    use tempfile::tempdir;

    /// Backend that confines nothing, for exercising the launcher alone
    struct NoopIsolation;

    impl Isolation for NoopIsolation {
        fn kind(&self) -> IsolationKind {
            IsolationKind::Rlimit
        }

        fn check(&self) -> Result<String> {
            Ok("noop".to_string())
        }

        fn prepare(&self, _id: TaskId, _limits: &ResourceLimits) -> Result<()> {
            Ok(())
        }

        fn enter(&self, _id: TaskId) -> Result<()> {
            Ok(())
        }

        fn configure(&self, _command: &mut Command, _limits: &ResourceLimits) {}

        fn cpu_throttle(&self, _limits: &ResourceLimits) -> Option<CpuThrottle> {
            None
        }
    }

    /// Reports one fixed pid as a member of every context
    struct MemberIsolation(i32);

    impl Isolation for MemberIsolation {
        fn kind(&self) -> IsolationKind {
            IsolationKind::Cgroup
        }

        fn check(&self) -> Result<String> {
            Ok("member".to_string())
        }

        fn prepare(&self, _id: TaskId, _limits: &ResourceLimits) -> Result<()> {
            Ok(())
        }

        fn enter(&self, _id: TaskId) -> Result<()> {
            Ok(())
        }

        fn configure(&self, _command: &mut Command, _limits: &ResourceLimits) {}

        fn members(&self, _id: TaskId) -> Vec<i32> {
            vec![self.0]
        }
    }

    fn launcher() -> (tempfile::TempDir, Launcher) {
        let dir = tempdir().unwrap();
        let mut config = EngineConfig::with_home(dir.path());
        config.stop_timeout_ms = 300;
        config.ready_timeout_ms = 300;
        let store = TaskStore::from_config(&config);
        (dir, Launcher::new(config, store, Arc::new(NoopIsolation)))
    }

    /// Record an externally spawned process as the task's shim
    fn adopt(launcher: &Launcher, id: TaskId, pid: u32) {
        let snapshot = ProcessSnapshot {
            shim: identify(pid as i32),
            ..Default::default()
        };
        launcher.store.write_processes(id, &snapshot).unwrap();
    }

    #[tokio::test]
    async fn test_stop_not_running() {
        let (_dir, launcher) = launcher();
        let id = launcher.store.create(&TaskSpec::new("echo hi")).unwrap().id;
        assert_eq!(launcher.stop(id).await.unwrap(), StopOutcome::NotRunning);
    }

    #[tokio::test]
    async fn test_stop_terminates_and_clears() {
        let (_dir, launcher) = launcher();
        let id = launcher.store.create(&TaskSpec::new("sleep 30")).unwrap().id;
        let mut child = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        adopt(&launcher, id, child.id().unwrap());
        assert!(launcher.is_running(id));

        // reap concurrently so the pid does not linger as a zombie
        let reaper = tokio::spawn(async move { child.wait().await });
        let outcome = launcher.stop(id).await.unwrap();
        reaper.await.unwrap().unwrap();

        assert_eq!(outcome, StopOutcome::Stopped { escalated: false });
        assert!(launcher.store.read_processes(id).unwrap().is_empty());
        assert!(!launcher.is_running(id));
    }

    #[tokio::test]
    async fn test_stop_escalates_when_term_is_ignored() {
        let (_dir, launcher) = launcher();
        let id = launcher.store.create(&TaskSpec::new("stubborn")).unwrap().id;
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "trap '' TERM; while true; do sleep 0.05; done"])
            .spawn()
            .unwrap();
        adopt(&launcher, id, child.id().unwrap());
        // give the shell time to install its trap
        sleep(Duration::from_millis(100)).await;

        let reaper = tokio::spawn(async move { child.wait().await });
        let outcome = launcher.stop(id).await.unwrap();
        reaper.await.unwrap().unwrap();

        assert_eq!(outcome, StopOutcome::Stopped { escalated: true });
    }

    #[tokio::test]
    async fn test_stop_with_corrupt_process_set() {
        let (_dir, launcher) = launcher();
        let id = launcher.store.create(&TaskSpec::new("echo hi")).unwrap().id;
        let path = launcher.store.artifact_path(id, crate::artifact::Artifact::Processes);
        std::fs::write(&path, "{ garbage").unwrap();

        assert!(!launcher.is_running(id));
        assert_eq!(launcher.stop(id).await.unwrap(), StopOutcome::NotRunning);
    }

    /// A context member outliving its shim still counts as running
    #[tokio::test]
    async fn test_surviving_member_blocks_second_start() {
        let (_dir, mut launcher) = launcher();
        let mut child = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap() as i32;
        launcher.isolation = Arc::new(MemberIsolation(pid));
        let task = launcher.store.create(&TaskSpec::new("sleep 30")).unwrap();

        assert!(launcher.is_running(task.id));
        let outcome = launcher.start(&task, false).await.unwrap();
        assert!(matches!(outcome, StartOutcome::AlreadyRunning));

        let reaper = tokio::spawn(async move { child.wait().await });
        assert!(matches!(
            launcher.stop(task.id).await.unwrap(),
            StopOutcome::Stopped { .. }
        ));
        reaper.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_missing_shim_program_fails_start() {
        let (dir, mut launcher) = launcher();
        launcher.config.shim_program = Some(dir.path().join("no-such-binary"));
        let task = launcher.store.create(&TaskSpec::new("echo hi")).unwrap();

        let err = launcher.start(&task, false).await.unwrap_err();
        assert!(matches!(err, Error::Process(_)));
        // the environment is still captured for the next attempt
        assert!(!launcher.store.read_env(task.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shim_exiting_early_is_reported() {
        let (_dir, mut launcher) = launcher();
        launcher.config.shim_program = Some(PathBuf::from("/bin/false"));
        let task = launcher.store.create(&TaskSpec::new("echo hi")).unwrap();

        let err = launcher.start(&task, false).await.unwrap_err();
        assert!(err.to_string().contains("before it was ready"));
        let resources = launcher.store.read_resources(task.id).unwrap();
        assert_eq!(resources.backend.as_deref(), Some("rlimit"));
    }
}
