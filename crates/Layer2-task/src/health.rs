//! Health Checker - structural scan of the tasks root
//!
//! Every task directory is checked on its own; a broken task is recorded in
//! the report and the scan moves on. The isolation primitive is checked
//! once per run.

use crate::artifact::Artifact;
use crate::isolation::Isolation;
use crate::store::{RootEntry, TaskStore};
use crate::task::TaskId;
use mult_foundation::{IsolationKind, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Findings for one task directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHealth {
    pub id: TaskId,
    pub found: Vec<Artifact>,
    pub missing: Vec<Artifact>,
    /// Present but unparsable, with the parse error
    pub corrupt: Vec<(Artifact, String)>,
    /// Missing or corrupt artifacts re-created in fix mode
    pub restored: Vec<Artifact>,
    /// Why the task could not be read back
    pub error: Option<String>,
}

impl TaskHealth {
    /// Stats readable and every corrupt artifact restored
    pub fn is_healthy(&self) -> bool {
        self.error.is_none()
            && self
                .corrupt
                .iter()
                .all(|(artifact, _)| self.restored.contains(artifact))
    }
}

/// State of the isolation primitive on this host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationHealth {
    pub kind: IsolationKind,
    /// Backend description when usable, failure reason otherwise
    pub status: std::result::Result<String, String>,
}

impl IsolationHealth {
    pub fn is_healthy(&self) -> bool {
        self.status.is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub tasks: Vec<TaskHealth>,
    /// Entries of the tasks root that are not task directories
    pub foreign: Vec<String>,
    pub isolation: IsolationHealth,
    /// The tasks root was missing and fix mode created it
    pub root_created: bool,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.isolation.is_healthy() && self.tasks.iter().all(TaskHealth::is_healthy)
    }
}

pub struct HealthChecker<'a> {
    store: &'a TaskStore,
}

impl<'a> HealthChecker<'a> {
    pub fn new(store: &'a TaskStore) -> Self {
        Self { store }
    }

    /// Scan every task, then the backend. `fix` restores what can be
    /// restored; declared stats never can.
    pub fn run(
        &self,
        fix: bool,
        kind: IsolationKind,
        isolation: Result<Arc<dyn Isolation>>,
    ) -> Result<HealthReport> {
        let mut root_created = false;
        if fix && !self.store.root().is_dir() {
            self.store.ensure_root()?;
            info!("Created tasks root {}", self.store.root().display());
            root_created = true;
        }

        let mut tasks = Vec::new();
        let mut foreign = Vec::new();
        for entry in self.store.entries()? {
            match entry {
                RootEntry::Task(id) => tasks.push(self.check_task(id, fix)),
                RootEntry::Foreign(name) => {
                    warn!("Foreign entry in tasks root: {}", name);
                    foreign.push(name);
                }
            }
        }

        Ok(HealthReport {
            tasks,
            foreign,
            isolation: Self::check_isolation(kind, isolation),
            root_created,
        })
    }

    pub fn check_task(&self, id: TaskId, fix: bool) -> TaskHealth {
        debug!("Checking task {}", id);
        let mut health = TaskHealth {
            id,
            found: Vec::new(),
            missing: Vec::new(),
            corrupt: Vec::new(),
            restored: Vec::new(),
            error: None,
        };

        for artifact in Artifact::ALL {
            if self.store.artifact_path(id, artifact).is_file() {
                health.found.push(artifact);
                if let Err(e) = self.store.validate_artifact(id, artifact) {
                    warn!("Task {} has a corrupt {}: {}", id, artifact, e);
                    health.corrupt.push((artifact, e.to_string()));
                    self.restore(&mut health, artifact, fix);
                }
                continue;
            }
            warn!("Task {} is missing {}", id, artifact);
            health.missing.push(artifact);
            self.restore(&mut health, artifact, fix);
        }

        if let Err(e) = self.store.get(id) {
            health.error = Some(e.to_string());
        }
        health
    }

    fn restore(&self, health: &mut TaskHealth, artifact: Artifact, fix: bool) {
        if !fix || artifact == Artifact::Stats {
            return;
        }
        match self.store.restore_artifact(health.id, artifact) {
            Ok(()) => health.restored.push(artifact),
            Err(e) => warn!("Could not restore {} of task {}: {}", artifact, health.id, e),
        }
    }

    pub fn check_isolation(
        kind: IsolationKind,
        isolation: Result<Arc<dyn Isolation>>,
    ) -> IsolationHealth {
        let status = isolation
            .and_then(|backend| backend.check())
            .map_err(|e| e.to_string());
        if let Err(reason) = &status {
            warn!("Isolation backend {} unavailable: {}", kind, reason);
        }
        IsolationHealth { kind, status }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskSpec;
    use mult_foundation::Error;
    use tempfile::tempdir;

    fn unavailable() -> Result<Arc<dyn Isolation>> {
        Err(Error::Isolation("not on this host".to_string()))
    }

    #[test]
    fn test_missing_stats_does_not_stop_scan() {
        let dir = tempdir().unwrap();
        let store = TaskStore::new(dir.path().join("tasks"));
        for command in ["a", "b", "c"] {
            store.create(&TaskSpec::new(command)).unwrap();
        }
        std::fs::remove_file(store.artifact_path(TaskId(2), Artifact::Stats)).unwrap();

        let report = HealthChecker::new(&store)
            .run(false, IsolationKind::Rlimit, unavailable())
            .unwrap();

        assert_eq!(report.tasks.len(), 3);
        let broken = &report.tasks[1];
        assert_eq!(broken.missing, [Artifact::Stats]);
        assert_eq!(broken.found.len(), 5);
        assert!(broken.error.as_deref().unwrap().contains("Task file not found"));
        assert!(report.tasks[0].is_healthy());
        assert!(report.tasks[2].is_healthy());
        assert!(!report.is_healthy());
    }

    #[test]
    fn test_fix_restores_all_but_stats() {
        let dir = tempdir().unwrap();
        let store = TaskStore::new(dir.path().join("tasks"));
        let id = store.create(&TaskSpec::new("a")).unwrap().id;
        std::fs::remove_file(store.artifact_path(id, Artifact::Stdout)).unwrap();
        std::fs::remove_file(store.artifact_path(id, Artifact::Processes)).unwrap();

        let health = HealthChecker::new(&store).check_task(id, true);
        assert_eq!(health.missing, [Artifact::Processes, Artifact::Stdout]);
        assert_eq!(health.restored, health.missing);
        assert!(health.is_healthy());
        assert!(store.artifact_path(id, Artifact::Stdout).is_file());
    }

    #[test]
    fn test_corrupt_artifacts_are_reported_per_task() {
        let dir = tempdir().unwrap();
        let store = TaskStore::new(dir.path().join("tasks"));
        for command in ["a", "b"] {
            store.create(&TaskSpec::new(command)).unwrap();
        }
        std::fs::write(store.artifact_path(TaskId(1), Artifact::Processes), "{ garbage").unwrap();
        std::fs::write(store.artifact_path(TaskId(1), Artifact::Env), "42").unwrap();

        let report = HealthChecker::new(&store)
            .run(false, IsolationKind::Rlimit, unavailable())
            .unwrap();

        let broken = &report.tasks[0];
        let corrupt: Vec<_> = broken.corrupt.iter().map(|(a, _)| *a).collect();
        assert_eq!(corrupt, [Artifact::Processes, Artifact::Env]);
        assert!(broken.error.is_none());
        assert!(!broken.is_healthy());
        assert!(report.tasks[1].is_healthy());
    }

    #[test]
    fn test_fix_restores_corrupt_artifacts() {
        let dir = tempdir().unwrap();
        let store = TaskStore::new(dir.path().join("tasks"));
        let id = store.create(&TaskSpec::new("a")).unwrap().id;
        std::fs::write(store.artifact_path(id, Artifact::Resources), "{ garbage").unwrap();

        let health = HealthChecker::new(&store).check_task(id, true);
        assert_eq!(health.corrupt.len(), 1);
        assert_eq!(health.restored, [Artifact::Resources]);
        assert!(health.is_healthy());
        assert!(store.read_resources(id).is_ok());
        assert!(HealthChecker::new(&store).check_task(id, false).corrupt.is_empty());
    }

    #[test]
    fn test_foreign_entries_and_missing_root() {
        let dir = tempdir().unwrap();
        let store = TaskStore::new(dir.path().join("tasks"));

        let report = HealthChecker::new(&store)
            .run(true, IsolationKind::Rlimit, unavailable())
            .unwrap();
        assert!(report.root_created);
        assert!(report.tasks.is_empty());

        std::fs::write(store.root().join("stray"), "").unwrap();
        let report = HealthChecker::new(&store)
            .run(false, IsolationKind::Rlimit, unavailable())
            .unwrap();
        assert_eq!(report.foreign, ["stray"]);
        assert!(!report.root_created);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_isolation_checked_independently_of_tasks() {
        let dir = tempdir().unwrap();
        let store = TaskStore::new(dir.path().join("tasks"));
        let id = store.create(&TaskSpec::new("a")).unwrap().id;
        std::fs::remove_file(store.artifact_path(id, Artifact::Stats)).unwrap();

        let backend: Arc<dyn Isolation> = Arc::new(crate::isolation::RlimitIsolation::new());
        let report = HealthChecker::new(&store)
            .run(false, IsolationKind::Rlimit, Ok(backend))
            .unwrap();

        assert!(!report.tasks[0].is_healthy());
        assert!(report.isolation.is_healthy());
    }
}
