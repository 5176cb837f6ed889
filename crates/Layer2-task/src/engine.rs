//! Engine - the operations the dispatcher calls
//!
//! One method per administrative operation. Each invocation reads what it
//! needs from the tasks root, acts, and returns; nothing is cached between
//! calls.

use crate::artifact::ResourceDescriptor;
use crate::health::{HealthChecker, HealthReport};
use crate::isolation::{self, Isolation};
use crate::launcher::{Launcher, StartOutcome, StopOutcome};
use crate::log::{LogCapture, LogFollower, LogView};
use crate::monitor::Monitor;
use crate::store::TaskStore;
use crate::task::{Patch, Task, TaskId, TaskPatch, TaskSpec, TaskView};
use mult_foundation::{EngineConfig, Error, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Options for [`Engine::create`]
#[derive(Debug, Clone, Copy)]
pub struct CreateOptions {
    /// Start right after creating
    pub run: bool,
    pub refresh_env: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            run: true,
            refresh_env: false,
        }
    }
}

/// Options for [`Engine::start`]
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Recapture the caller's environment before launching
    pub refresh_env: bool,
    /// Stats changes applied before launching
    pub patch: TaskPatch,
}

/// Result of [`Engine::create`]; the task exists even if starting failed
#[derive(Debug)]
pub struct Created {
    pub task: Task,
    pub start: Option<Result<StartOutcome>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deleted {
    pub id: TaskId,
    /// A live tree had to be stopped first
    pub terminated: bool,
}

/// One task of [`Engine::delete_all`] and what deleting it did
#[derive(Debug)]
pub struct DeleteResult {
    pub id: TaskId,
    pub outcome: Result<Deleted>,
}

/// One boot-eligible task and what starting it did
#[derive(Debug)]
pub struct BootResult {
    pub id: TaskId,
    pub outcome: Result<StartOutcome>,
}

pub struct Engine {
    config: EngineConfig,
    store: TaskStore,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let store = TaskStore::from_config(&config);
        Self { config, store }
    }

    /// Engine over the configured home (`$MULT_HOME` or `~/.multi-tasker`)
    pub fn load() -> Result<Self> {
        Ok(Self::new(EngineConfig::load()?))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    fn isolation(&self) -> Result<Arc<dyn Isolation>> {
        isolation::backend(&self.config)
    }

    fn launcher(&self) -> Result<Launcher> {
        Ok(Launcher::new(
            self.config.clone(),
            self.store.clone(),
            self.isolation()?,
        ))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub async fn create(&self, spec: TaskSpec, options: CreateOptions) -> Result<Created> {
        validate_command(&spec.command)?;
        let task = self.store.create(&spec)?;

        let start = if options.run {
            Some(self.launch(&task, options.refresh_env).await)
        } else {
            None
        };
        Ok(Created { task, start })
    }

    pub async fn start(&self, id: TaskId, options: StartOptions) -> Result<StartOutcome> {
        let task = if options.patch.is_empty() {
            self.store.get(id)?
        } else {
            validate_patch(&options.patch)?;
            self.store.update(id, &options.patch)?
        };
        self.launch(&task, options.refresh_env).await
    }

    async fn launch(&self, task: &Task, refresh_env: bool) -> Result<StartOutcome> {
        self.launcher()?.start(task, refresh_env).await
    }

    pub async fn stop(&self, id: TaskId) -> Result<StopOutcome> {
        self.store.get(id)?;
        self.launcher()?.stop(id).await
    }

    pub async fn restart(&self, id: TaskId, options: StartOptions) -> Result<StartOutcome> {
        let outcome = self.stop(id).await?;
        debug!("Restarting task {} after {:?}", id, outcome);
        self.start(id, options).await
    }

    /// Rewrite stats only; a running tree keeps its old limits until restart
    pub fn edit(&self, id: TaskId, patch: &TaskPatch) -> Result<Task> {
        validate_patch(patch)?;
        let task = self.store.update(id, patch)?;
        info!("Task {} edited", id);
        Ok(task)
    }

    /// Stop the tree if anything is alive, then remove the directory.
    /// `on_terminate` runs before a live tree is signalled.
    pub async fn delete(&self, id: TaskId, on_terminate: impl FnOnce(TaskId)) -> Result<Deleted> {
        if !self.store.exists(id) {
            return Err(Error::TaskNotFound(id.get()));
        }
        let launcher = self.launcher()?;
        if launcher.is_running(id) {
            on_terminate(id);
        }
        let terminated = match launcher.stop(id).await? {
            StopOutcome::Stopped { escalated } => {
                debug!("Task {} terminated before removal (escalated: {})", id, escalated);
                true
            }
            StopOutcome::NotRunning => false,
        };
        self.store.remove(id)?;
        Ok(Deleted { id, terminated })
    }

    /// Delete every task; a failing task does not keep the rest alive
    pub async fn delete_all(&self, mut on_terminate: impl FnMut(TaskId)) -> Result<Vec<DeleteResult>> {
        let mut results = Vec::new();
        for id in self.store.ids()? {
            let outcome = self.delete(id, &mut on_terminate).await;
            if let Err(e) = &outcome {
                warn!("Deleting task {} failed: {}", id, e);
            }
            results.push(DeleteResult { id, outcome });
        }
        Ok(results)
    }

    /// Start every boot-eligible task that is not already running
    pub async fn boot(&self) -> Result<Vec<BootResult>> {
        let mut results = Vec::new();
        for task in self.store.list(&[])? {
            if !task.spec.boot {
                continue;
            }
            let outcome = self.launch(&task, false).await;
            if let Err(e) = &outcome {
                warn!("Boot start of task {} failed: {}", task.id, e);
            }
            results.push(BootResult {
                id: task.id,
                outcome,
            });
        }
        Ok(results)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn list(&self, filter: &[TaskId]) -> Result<Vec<TaskView>> {
        let tasks = self.store.list(filter)?;
        Ok(tasks.into_iter().map(|task| self.view(task)).collect())
    }

    fn view(&self, task: Task) -> TaskView {
        let id = task.id;
        let processes = self.store.read_processes(id).unwrap_or_else(|e| {
            warn!("Process set of task {} unreadable: {}", id, e);
            Default::default()
        });
        let resources = self.store.read_resources(id).unwrap_or_else(|e| {
            warn!("Resources of task {} unreadable: {}", id, e);
            ResourceDescriptor::default()
        });
        TaskView {
            status: Monitor::status(&processes),
            task,
            processes,
            resources,
        }
    }

    /// Tail of both log streams; `None` uses the configured default
    pub fn logs(&self, id: TaskId, lines: Option<usize>) -> Result<LogView> {
        self.store.get(id)?;
        LogCapture::read(&self.store, id, lines.unwrap_or(self.config.log_lines))
    }

    /// The same tail, plus a follower for what gets appended afterwards
    pub fn follow_logs(&self, id: TaskId, lines: Option<usize>) -> Result<(LogView, LogFollower)> {
        self.store.get(id)?;
        LogCapture::follow(&self.store, id, lines.unwrap_or(self.config.log_lines))
    }

    pub fn health(&self, fix: bool) -> Result<HealthReport> {
        HealthChecker::new(&self.store).run(fix, self.config.isolation, self.isolation())
    }

    /// Entry point of the hidden `shim` subcommand
    pub async fn run_shim(&self, id: TaskId) -> Result<i32> {
        crate::shim::run(&self.config, id).await
    }
}

fn validate_command(command: &str) -> Result<()> {
    if command.trim().is_empty() {
        return Err(Error::Validation("command must not be empty".to_string()));
    }
    Ok(())
}

fn validate_patch(patch: &TaskPatch) -> Result<()> {
    match &patch.command {
        Patch::Set(command) => validate_command(command),
        Patch::Clear => Err(Error::Validation("command cannot be cleared".to_string())),
        Patch::Unchanged => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Artifact;
    use crate::task::Monitoring;
    use mult_foundation::IsolationKind;
    use tempfile::tempdir;

    fn engine() -> (tempfile::TempDir, Engine) {
        let dir = tempdir().unwrap();
        let mut config = EngineConfig::with_home(dir.path());
        config.isolation = IsolationKind::Rlimit;
        (dir, Engine::new(config))
    }

    fn no_run() -> CreateOptions {
        CreateOptions {
            run: false,
            refresh_env: false,
        }
    }

    #[tokio::test]
    async fn test_create_without_run_reads_back_defaults() {
        let (_dir, engine) = engine();
        let created = engine.create(TaskSpec::new("echo hi"), no_run()).await.unwrap();
        assert!(created.start.is_none());
        assert_eq!(created.task.id, TaskId(1));

        let views = engine.list(&[]).unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].task.spec, TaskSpec::new("echo hi"));
        assert!(!views[0].status.is_running());
    }

    #[tokio::test]
    async fn test_empty_command_is_rejected_before_persisting() {
        let (_dir, engine) = engine();
        let err = engine.create(TaskSpec::new("  "), no_run()).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(engine.store().ids().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_edit_is_partial() {
        let (_dir, engine) = engine();
        let mut spec = TaskSpec::new("sleep 5");
        spec.cpu_limit = 20;
        spec.monitoring = Monitoring::Deep;
        let id = engine.create(spec, no_run()).await.unwrap().task.id;

        let task = engine
            .edit(
                id,
                &TaskPatch {
                    memory_limit: Patch::Set(1_000_000),
                    cpu_limit: Patch::Clear,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(task.spec.memory_limit, 1_000_000);
        assert_eq!(task.spec.cpu_limit, 0);
        assert_eq!(task.spec.monitoring, Monitoring::Deep);

        let err = engine
            .edit(
                id,
                &TaskPatch {
                    command: Patch::Clear,
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_delete_then_not_found() {
        let (_dir, engine) = engine();
        let id = engine.create(TaskSpec::new("echo hi"), no_run()).await.unwrap().task.id;

        let deleted = engine.delete(id, |_| panic!("nothing to terminate")).await.unwrap();
        assert_eq!(deleted, Deleted { id, terminated: false });
        assert!(engine.delete(id, |_| {}).await.unwrap_err().is_not_found());
        assert!(engine.list(&[id]).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_all() {
        let (_dir, engine) = engine();
        for command in ["a", "b"] {
            engine.create(TaskSpec::new(command), no_run()).await.unwrap();
        }
        let deleted = engine.delete_all(|_| {}).await.unwrap();
        assert_eq!(deleted.len(), 2);
        assert!(deleted.iter().all(|result| result.outcome.is_ok()));
        assert!(engine.list(&[]).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_with_corrupt_artifacts() {
        let (_dir, engine) = engine();
        let id = engine.create(TaskSpec::new("echo hi"), no_run()).await.unwrap().task.id;
        for artifact in [Artifact::Processes, Artifact::Stats] {
            std::fs::write(engine.store().artifact_path(id, artifact), "{ garbage").unwrap();
        }

        let deleted = engine.delete(id, |_| {}).await.unwrap();
        assert!(!deleted.terminated);
        assert!(!engine.store().exists(id));
    }

    #[tokio::test]
    async fn test_delete_all_continues_past_failure() {
        let (_dir, engine) = engine();
        for command in ["a", "b"] {
            engine.create(TaskSpec::new(command), no_run()).await.unwrap();
        }
        // a directory where the lock file belongs makes task 1 unlockable
        let lock = engine.store().task_dir(TaskId(1)).join(crate::store::LOCK_FILE);
        let _ = std::fs::remove_file(&lock);
        std::fs::create_dir(&lock).unwrap();

        let results = engine.delete_all(|_| {}).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, TaskId(1));
        assert!(results[0].outcome.is_err());
        assert_eq!(results[1].outcome.as_ref().unwrap().id, TaskId(2));
        assert!(engine.store().exists(TaskId(1)));
        assert!(!engine.store().exists(TaskId(2)));
    }

    #[tokio::test]
    async fn test_boot_only_starts_boot_tasks() {
        let (dir, mut engine) = engine();
        engine.config.shim_program = Some(dir.path().join("no-such-binary"));
        engine.create(TaskSpec::new("echo a"), no_run()).await.unwrap();
        let mut spec = TaskSpec::new("echo b");
        spec.boot = true;
        let boot_id = engine.create(spec, no_run()).await.unwrap().task.id;

        let results = engine.boot().await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, boot_id);
        assert!(matches!(results[0].outcome, Err(Error::Process(_))));
    }

    #[tokio::test]
    async fn test_restart_of_stopped_task_starts_it() {
        let (dir, mut engine) = engine();
        engine.config.shim_program = Some(dir.path().join("no-such-binary"));
        let id = engine.create(TaskSpec::new("echo a"), no_run()).await.unwrap().task.id;

        // stopping finds nothing, so the failure comes from the start half
        let err = engine.restart(id, StartOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::Process(_)));
        assert!(engine.restart(TaskId(9), StartOptions::default()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_stop_of_stopped_task() {
        let (_dir, engine) = engine();
        let id = engine.create(TaskSpec::new("echo hi"), no_run()).await.unwrap().task.id;
        assert_eq!(engine.stop(id).await.unwrap(), StopOutcome::NotRunning);
        assert!(engine.stop(TaskId(42)).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_logs_need_existing_task() {
        let (_dir, engine) = engine();
        assert!(engine.logs(TaskId(1), None).unwrap_err().is_not_found());

        let id = engine.create(TaskSpec::new("echo hi"), no_run()).await.unwrap().task.id;
        assert!(engine.logs(id, None).unwrap().is_empty());
        assert!(engine.follow_logs(TaskId(9), None).unwrap_err().is_not_found());
        let (view, _follower) = engine.follow_logs(id, None).unwrap();
        assert!(view.is_empty());
    }

    #[tokio::test]
    async fn test_health_reports_missing_stats() {
        let (_dir, engine) = engine();
        let id = engine.create(TaskSpec::new("echo hi"), no_run()).await.unwrap().task.id;
        std::fs::remove_file(engine.store().artifact_path(id, Artifact::Stats)).unwrap();

        let report = engine.health(false).unwrap();
        assert_eq!(report.tasks[0].missing, [Artifact::Stats]);
        assert!(!report.tasks[0].is_healthy());
        assert_eq!(report.isolation.kind, IsolationKind::Rlimit);
    }
}
