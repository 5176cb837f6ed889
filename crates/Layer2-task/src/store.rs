//! Task Store - one `tasks/<id>/` directory per task
//!
//! The store never keeps a counter: ids come from scanning the tasks root
//! and claiming the next directory with an exclusive `create_dir`.

use crate::artifact::{Artifact, EnvSnapshot, ProcessSnapshot, ResourceDescriptor};
use crate::task::{Task, TaskId, TaskPatch, TaskSpec};
use mult_foundation::{EngineConfig, Error, JsonStore, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Advisory lock file inside each task directory
pub const LOCK_FILE: &str = ".lock";

/// How long an invocation waits for another one holding a task lock
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// An entry found in the tasks root
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootEntry {
    Task(TaskId),
    Foreign(String),
}

/// Persisted task state rooted at `<home>/tasks`
#[derive(Debug, Clone)]
pub struct TaskStore {
    root: PathBuf,
}

impl TaskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.tasks_dir())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn task_dir(&self, id: TaskId) -> PathBuf {
        self.root.join(id.to_string())
    }

    pub fn artifact_path(&self, id: TaskId, artifact: Artifact) -> PathBuf {
        self.task_dir(id).join(artifact.file_name())
    }

    fn artifacts(&self, id: TaskId) -> JsonStore {
        JsonStore::new(self.task_dir(id))
    }

    pub fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    /// Directory exists; the task may still be missing its stats
    pub fn exists(&self, id: TaskId) -> bool {
        self.task_dir(id).is_dir()
    }

    // ========================================================================
    // Scanning
    // ========================================================================

    /// Every entry of the tasks root, task directories in ascending id order
    pub fn entries(&self) -> Result<Vec<RootEntry>> {
        let read = match fs::read_dir(&self.root) {
            Ok(read) => read,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        let mut foreign = Vec::new();
        for entry in read {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            match name.parse::<TaskId>() {
                Ok(id) if is_dir && id.to_string() == name => ids.push(id),
                _ => foreign.push(name),
            }
        }
        ids.sort();
        foreign.sort();

        Ok(ids
            .into_iter()
            .map(RootEntry::Task)
            .chain(foreign.into_iter().map(RootEntry::Foreign))
            .collect())
    }

    /// Ids of every task directory, ascending
    pub fn ids(&self) -> Result<Vec<TaskId>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter_map(|entry| match entry {
                RootEntry::Task(id) => Some(id),
                RootEntry::Foreign(_) => None,
            })
            .collect())
    }

    /// Claim the next id by creating its directory
    pub fn allocate_id(&self) -> Result<TaskId> {
        self.ensure_root()?;
        let mut next = self.ids()?.last().map(|id| id.0).unwrap_or(0);
        loop {
            next = next
                .checked_add(1)
                .ok_or_else(|| Error::Internal("task id space exhausted".to_string()))?;
            let id = TaskId(next);
            match fs::create_dir(self.task_dir(id)) {
                Ok(()) => {
                    debug!("Allocated task id {}", id);
                    return Ok(id);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    // ========================================================================
    // CRUD
    // ========================================================================

    /// Allocate an id and write the initial artifacts; stats go last
    pub fn create(&self, spec: &TaskSpec) -> Result<Task> {
        let id = self.allocate_id()?;
        let result = self.write_initial(id, spec);
        if let Err(e) = result {
            warn!("Creating task {} failed, removing its directory: {}", id, e);
            let _ = fs::remove_dir_all(self.task_dir(id));
            return Err(e);
        }
        info!("Task {} created: {}", id, spec.command);
        Ok(Task::new(id, spec.clone()))
    }

    fn write_initial(&self, id: TaskId, spec: &TaskSpec) -> Result<()> {
        let _lock = self.lock(id)?;
        for artifact in Artifact::ALL {
            if artifact != Artifact::Stats {
                self.restore_artifact(id, artifact)?;
            }
        }
        self.write_json(id, Artifact::Stats, spec)
    }

    pub fn get(&self, id: TaskId) -> Result<Task> {
        if !self.exists(id) {
            return Err(Error::TaskNotFound(id.get()));
        }
        let path = self.artifact_path(id, Artifact::Stats);
        if !path.is_file() {
            return Err(Error::TaskFileNotFound(path.display().to_string()));
        }
        let spec: TaskSpec = self.artifacts(id).load(Artifact::Stats.file_name())?;
        Ok(Task::new(id, spec))
    }

    /// Merge a patch into `stats.json` under the task lock
    pub fn update(&self, id: TaskId, patch: &TaskPatch) -> Result<Task> {
        let _lock = self.lock(id)?;
        let mut task = self.get(id)?;
        task.spec.apply(patch);
        self.write_json(id, Artifact::Stats, &task.spec)?;
        debug!("Task {} stats updated", id);
        Ok(task)
    }

    /// Tasks in ascending id order; a filter must name existing tasks only
    pub fn list(&self, filter: &[TaskId]) -> Result<Vec<Task>> {
        if !filter.is_empty() {
            let mut ids = filter.to_vec();
            ids.sort();
            ids.dedup();
            return ids.into_iter().map(|id| self.get(id)).collect();
        }

        let mut tasks = Vec::new();
        for id in self.ids()? {
            match self.get(id) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!("Skipping task {}: {}", id, e),
            }
        }
        Ok(tasks)
    }

    /// Remove the task directory; callers stop the task first
    pub fn remove(&self, id: TaskId) -> Result<()> {
        if !self.exists(id) {
            return Err(Error::TaskNotFound(id.get()));
        }
        fs::remove_dir_all(self.task_dir(id))?;
        info!("Task {} removed", id);
        Ok(())
    }

    // ========================================================================
    // Artifacts
    // ========================================================================

    fn write_json<T: Serialize>(&self, id: TaskId, artifact: Artifact, data: &T) -> Result<()> {
        if !self.exists(id) {
            return Err(Error::TaskNotFound(id.get()));
        }
        self.artifacts(id).save(artifact.file_name(), data)
    }

    /// Missing file reads as the default value
    fn read_json<T: DeserializeOwned + Default>(&self, id: TaskId, artifact: Artifact) -> Result<T> {
        Ok(self
            .artifacts(id)
            .load_optional(artifact.file_name())?
            .unwrap_or_default())
    }

    pub fn read_processes(&self, id: TaskId) -> Result<ProcessSnapshot> {
        self.read_json(id, Artifact::Processes)
    }

    pub fn write_processes(&self, id: TaskId, snapshot: &ProcessSnapshot) -> Result<()> {
        self.write_json(id, Artifact::Processes, snapshot)
    }

    pub fn read_resources(&self, id: TaskId) -> Result<ResourceDescriptor> {
        self.read_json(id, Artifact::Resources)
    }

    pub fn write_resources(&self, id: TaskId, resources: &ResourceDescriptor) -> Result<()> {
        self.write_json(id, Artifact::Resources, resources)
    }

    pub fn read_env(&self, id: TaskId) -> Result<EnvSnapshot> {
        self.read_json(id, Artifact::Env)
    }

    pub fn write_env(&self, id: TaskId, env: &EnvSnapshot) -> Result<()> {
        self.write_json(id, Artifact::Env, env)
    }

    /// Parse a JSON artifact to check it is usable; logs always pass
    pub fn validate_artifact(&self, id: TaskId, artifact: Artifact) -> Result<()> {
        match artifact {
            Artifact::Stats => self.artifacts(id).load::<TaskSpec>(artifact.file_name()).map(drop),
            Artifact::Resources => self.read_resources(id).map(drop),
            Artifact::Processes => self.read_processes(id).map(drop),
            Artifact::Env => self.read_env(id).map(drop),
            Artifact::Stdout | Artifact::Stderr => Ok(()),
        }
    }

    /// Recreate a non-stats artifact with its empty default
    pub fn restore_artifact(&self, id: TaskId, artifact: Artifact) -> Result<()> {
        match artifact {
            Artifact::Stats => Err(Error::artifact(
                artifact.file_name(),
                "declared stats cannot be regenerated",
            )),
            Artifact::Resources => self.write_json(id, artifact, &ResourceDescriptor::default()),
            Artifact::Processes => self.write_json(id, artifact, &ProcessSnapshot::default()),
            Artifact::Env => self.write_json(id, artifact, &EnvSnapshot::default()),
            Artifact::Stdout | Artifact::Stderr => {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.artifact_path(id, artifact))?;
                Ok(())
            }
        }
    }

    // ========================================================================
    // Locking
    // ========================================================================

    /// Exclusive advisory lock on one task, released on drop
    pub fn lock(&self, id: TaskId) -> Result<TaskLock> {
        if !self.exists(id) {
            return Err(Error::TaskNotFound(id.get()));
        }
        TaskLock::acquire(&self.task_dir(id).join(LOCK_FILE), LOCK_TIMEOUT)
    }
}

/// Holds `flock(LOCK_EX)` on a task's lock file
#[derive(Debug)]
pub struct TaskLock {
    _file: File,
}

impl TaskLock {
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        let deadline = Instant::now() + timeout;

        loop {
            match try_lock(&file) {
                Ok(()) => return Ok(Self { _file: file }),
                Err(e) if e.kind() == ErrorKind::WouldBlock && Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    return Err(Error::Io(std::io::Error::new(
                        ErrorKind::WouldBlock,
                        format!("{} is held by another invocation", path.display()),
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(unix)]
fn try_lock(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Err(std::io::Error::from(ErrorKind::WouldBlock))
        } else {
            Err(err)
        }
    }
}

#[cfg(not(unix))]
fn try_lock(_file: &File) -> std::io::Result<()> {
    Ok(())
}
