//! Monitor - liveness and resource usage of a task's process tree
//!
//! Shallow monitoring only answers "is anything recorded still alive".
//! Deep monitoring additionally samples memory and cpu of the whole tree;
//! the shim drives [`UsageSampler`] on its tick and persists the result.

use crate::artifact::{ProcessRef, ProcessSnapshot, Usage};
use crate::process::proc::{boot_time, clock_ticks_per_sec, page_size};
use crate::process::{is_alive, ProcStat};
use crate::state::TaskStatus;
use chrono::{DateTime, Utc};
use std::time::Instant;

/// What `ls -a` shows for one live process of a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: i32,
    pub comm: String,
    pub memory_bytes: u64,
    pub started_at: Option<DateTime<Utc>>,
}

/// Liveness evaluation over a persisted process snapshot
pub struct Monitor;

impl Monitor {
    /// Shim alive, or any recorded child alive
    pub fn is_alive(snapshot: &ProcessSnapshot) -> bool {
        snapshot.all().any(is_alive)
    }

    pub fn status(snapshot: &ProcessSnapshot) -> TaskStatus {
        TaskStatus::from(Self::is_alive(snapshot))
    }

    /// Name, memory and start time of a recorded process; `None` once it
    /// is gone or its pid was reused
    pub fn inspect(process: &ProcessRef) -> Option<ProcessInfo> {
        let stat = ProcStat::read(process.pid)
            .filter(|stat| stat.starttime == process.starttime && !stat.is_zombie())?;
        let started_at = boot_time().and_then(|boot| {
            let secs = boot + (stat.starttime / clock_ticks_per_sec()) as i64;
            DateTime::from_timestamp(secs, 0)
        });
        Some(ProcessInfo {
            pid: stat.pid,
            comm: stat.comm,
            memory_bytes: stat.rss_pages * page_size(),
            started_at,
        })
    }
}

/// Turns successive `/proc` readings into usage samples
#[derive(Debug)]
pub struct UsageSampler {
    ticks_per_sec: u64,
    page_size: u64,
    previous: Option<(Instant, u64)>,
}

impl Default for UsageSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageSampler {
    pub fn new() -> Self {
        Self {
            ticks_per_sec: clock_ticks_per_sec(),
            page_size: page_size(),
            previous: None,
        }
    }

    /// Sample the given processes. Cpu needs two readings, so the first
    /// sample only carries memory.
    pub fn sample(&mut self, tree: &[ProcStat]) -> Usage {
        self.sample_at(tree, Instant::now())
    }

    fn sample_at(&mut self, tree: &[ProcStat], now: Instant) -> Usage {
        let memory_bytes: u64 = tree.iter().map(|p| p.rss_pages * self.page_size).sum();
        let ticks: u64 = tree.iter().map(|p| p.cpu_ticks()).sum();

        let cpu_percent = self.previous.and_then(|(at, prev_ticks)| {
            let elapsed = now.duration_since(at).as_secs_f64();
            if elapsed <= 0.0 {
                return None;
            }
            // processes that exited take their ticks with them
            let delta = ticks.saturating_sub(prev_ticks) as f64 / self.ticks_per_sec as f64;
            Some((delta / elapsed * 10_000.0).round() / 100.0)
        });
        self.previous = Some((now, ticks));

        Usage {
            memory_bytes: Some(memory_bytes),
            cpu_percent,
            sampled_at: Utc::now(),
        }
    }
}
