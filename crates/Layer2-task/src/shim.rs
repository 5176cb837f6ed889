//! Shim - the first process of a task's context
//!
//! Runs as `<program> shim <id>`. It enters the isolation context, spawns
//! the user command through a shell, publishes `processes.json` (the
//! launcher's ready signal) and supervises until the command and every
//! adopted descendant have exited.

use crate::artifact::{EnvSnapshot, ProcessSnapshot, RunRecord};
use crate::isolation::{self, Isolation, ResourceLimits};
use crate::log::{LogCapture, LogStream};
use crate::monitor::UsageSampler;
use crate::process::tree::refresh_children;
use crate::process::{descendants, exit_code, identify, signal, Signal};
use crate::store::TaskStore;
use crate::task::{Monitoring, Task, TaskId};
use chrono::Utc;
use mult_foundation::{EngineConfig, Error, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::signal::unix::{signal as unix_signal, Signal as UnixSignal, SignalKind};
use tokio::time::{interval_at, sleep, Instant, Interval};
use tracing::{debug, info, warn};

/// Shells trusted from the captured `$SHELL`
const SHELLS: [&str; 3] = ["sh", "bash", "zsh"];

const FALLBACK_SHELL: &str = "/bin/sh";

/// Poll cadence while waiting for adopted orphans
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Run the shim for task `id`; returns the command's exit code
pub async fn run(config: &EngineConfig, id: TaskId) -> Result<i32> {
    let store = TaskStore::from_config(config);
    let task = store.get(id)?;
    let isolation = isolation::backend(config)?;

    let mut shim = Shim::new(config, store, task, isolation);
    shim.supervise().await
}

/// `$SHELL` from the snapshot when it names a known shell, else `/bin/sh`
pub fn resolve_shell(env: &EnvSnapshot) -> PathBuf {
    env.pairs()
        .find(|(key, _)| *key == "SHELL")
        .map(|(_, value)| PathBuf::from(value))
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| SHELLS.contains(&name))
                && path.is_file()
        })
        .unwrap_or_else(|| PathBuf::from(FALLBACK_SHELL))
}

struct Shim {
    store: TaskStore,
    task: Task,
    isolation: Arc<dyn Isolation>,
    limits: ResourceLimits,
    pid: i32,
    sample_interval: Duration,
    snapshot: ProcessSnapshot,
    sampler: Option<UsageSampler>,
}

impl Shim {
    fn new(
        config: &EngineConfig,
        store: TaskStore,
        task: Task,
        isolation: Arc<dyn Isolation>,
    ) -> Self {
        let limits = ResourceLimits::from(&task.spec);
        let sampler = (task.spec.monitoring == Monitoring::Deep).then(UsageSampler::new);
        Self {
            store,
            limits,
            isolation,
            pid: std::process::id() as i32,
            sample_interval: config.sample_interval(),
            snapshot: ProcessSnapshot::default(),
            sampler,
            task,
        }
    }

    fn id(&self) -> TaskId {
        self.task.id
    }

    async fn supervise(&mut self) -> Result<i32> {
        let id = self.id();
        become_subreaper();
        self.isolation.enter(id)?;

        // installed before the command exists so no stop request is lost
        let mut term = unix_signal(SignalKind::terminate())?;
        let mut hangup = unix_signal(SignalKind::hangup())?;
        let persist = self.task.spec.persist;

        // the throttle walks the shim's descendants, so it is armed before
        // the command exists and never lets it run uncapped
        let throttle = self
            .isolation
            .cpu_throttle(&self.limits)
            .map(|throttle| tokio::spawn(throttle.run(self.pid)));

        let spawned = self.command().and_then(|mut command| {
            command.spawn().map_err(|e| {
                Error::Process(format!("failed to spawn `{}`: {}", self.task.spec.command, e))
            })
        });
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                if let Some(handle) = throttle {
                    handle.abort();
                }
                return Err(e);
            }
        };

        self.snapshot = ProcessSnapshot {
            shim: identify(self.pid),
            children: Vec::new(),
            last_run: Some(RunRecord {
                shim_pid: self.pid,
                started_at: Utc::now(),
                exited_at: None,
                exit_code: None,
            }),
        };
        refresh_children(&mut self.snapshot, self.pid);
        self.store.write_processes(id, &self.snapshot)?;
        info!("Task {} running `{}`", id, self.task.spec.command);

        let mut ticker = self.ticker();
        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                _ = ticker.tick() => self.refresh(),
                _ = term.recv() => self.forward("SIGTERM"),
                _ = hangup.recv(), if !persist => self.forward("SIGHUP"),
            }
        };
        let code = exit_code(status);
        debug!("Command of task {} exited with {}", id, code);

        self.drain(&mut ticker, &mut term, &mut hangup).await;

        if let Some(handle) = throttle {
            handle.abort();
            isolation::CpuThrottle::resume(self.pid);
        }

        self.snapshot.clear(Some(code));
        self.publish();
        if let Err(e) = self.isolation.release(id) {
            warn!("Releasing context of task {} failed: {}", id, e);
        }
        Ok(code)
    }

    fn command(&self) -> Result<Command> {
        let id = self.id();
        let env = self.store.read_env(id)?;
        let mut command = Command::new(resolve_shell(&env));
        command
            .arg("-c")
            .arg(&self.task.spec.command)
            .env_clear()
            .envs(env.pairs())
            .env("FORCE_COLOR", "true");

        if self.task.spec.interactive {
            command
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        } else {
            command
                .stdin(Stdio::null())
                .stdout(LogCapture::open(&self.store, id, LogStream::Stdout)?)
                .stderr(LogCapture::open(&self.store, id, LogStream::Stderr)?);
        }

        if let Some(dir) = env.pairs().find(|(key, _)| *key == "PWD").map(|(_, v)| v) {
            if Path::new(dir).is_dir() {
                command.current_dir(dir);
            }
        }

        self.isolation.configure(&mut command, &self.limits);
        Ok(command)
    }

    fn ticker(&self) -> Interval {
        interval_at(Instant::now() + self.sample_interval, self.sample_interval)
    }

    /// Tick: refresh the child set and, when deep, the usage sample
    fn refresh(&mut self) {
        let before = self.snapshot.children.clone();
        refresh_children(&mut self.snapshot, self.pid);
        if self.snapshot.children != before {
            self.publish();
        }

        let Some(sampler) = self.sampler.as_mut() else {
            return;
        };
        let usage = sampler.sample(&descendants(self.pid));
        let id = self.task.id;
        let result = self.store.read_resources(id).and_then(|mut resources| {
            resources.usage = Some(usage);
            self.store.write_resources(id, &resources)
        });
        if let Err(e) = result {
            debug!("Usage sample of task {} not stored: {}", id, e);
        }
    }

    fn publish(&self) {
        if let Err(e) = self.store.write_processes(self.id(), &self.snapshot) {
            // a deleted task directory is not recreated
            debug!("Process set of task {} not stored: {}", self.id(), e);
        }
    }

    /// Pass a stop request on to the whole tree
    fn forward(&self, received: &str) {
        let tree: Vec<_> = descendants(self.pid).iter().map(|s| s.identity()).collect();
        debug!("{} received, terminating {} processes", received, tree.len());
        for sig in [Signal::Term, Signal::Cont] {
            if let Err(e) = signal::send_all(&tree, sig) {
                warn!("Forwarding {} failed: {}", sig.name(), e);
            }
        }
    }

    /// Wait for orphans the shim adopted as subreaper
    async fn drain(
        &mut self,
        ticker: &mut Interval,
        term: &mut UnixSignal,
        hangup: &mut UnixSignal,
    ) {
        let persist = self.task.spec.persist;
        loop {
            reap_orphans();
            if descendants(self.pid).is_empty() {
                return;
            }
            tokio::select! {
                _ = sleep(DRAIN_POLL) => {}
                _ = ticker.tick() => self.refresh(),
                _ = term.recv() => self.forward("SIGTERM"),
                _ = hangup.recv(), if !persist => self.forward("SIGHUP"),
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn become_subreaper() {
    if unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) } != 0 {
        warn!(
            "PR_SET_CHILD_SUBREAPER failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn become_subreaper() {}

/// Collect exited adopted processes; only safe once the command is reaped
fn reap_orphans() {
    loop {
        let mut status = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            return;
        }
        debug!("Reaped adopted process {}", pid);
    }
}
