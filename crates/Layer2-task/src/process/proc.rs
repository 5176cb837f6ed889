//! Process lookup through `/proc`

use crate::artifact::ProcessRef;
use std::collections::{HashMap, VecDeque};
use std::fs;

/// The fields of `/proc/<pid>/stat` the engine relies on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcStat {
    pub pid: i32,
    pub comm: String,
    pub state: char,
    pub ppid: i32,
    /// User time, clock ticks
    pub utime: u64,
    /// System time, clock ticks
    pub stime: u64,
    /// Clock ticks since boot
    pub starttime: u64,
    /// Resident set size, pages
    pub rss_pages: u64,
}

impl ProcStat {
    /// Parse one stat line; `comm` may itself contain spaces and parens
    pub fn parse(line: &str) -> Option<Self> {
        let open = line.find('(')?;
        let close = line.rfind(')')?;
        let pid = line[..open].trim().parse().ok()?;
        let comm = line.get(open + 1..close)?.to_string();
        let fields: Vec<&str> = line.get(close + 1..)?.split_whitespace().collect();
        if fields.len() < 22 {
            return None;
        }

        Some(Self {
            pid,
            comm,
            state: fields[0].chars().next()?,
            ppid: fields[1].parse().ok()?,
            utime: fields[11].parse().ok()?,
            stime: fields[12].parse().ok()?,
            starttime: fields[19].parse().ok()?,
            rss_pages: fields[21].parse().unwrap_or(0),
        })
    }

    pub fn read(pid: i32) -> Option<Self> {
        if pid <= 0 {
            return None;
        }
        let line = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
        Self::parse(&line)
    }

    /// Exited but not yet reaped, or being torn down
    pub fn is_zombie(&self) -> bool {
        matches!(self.state, 'Z' | 'X' | 'x')
    }

    pub fn identity(&self) -> ProcessRef {
        ProcessRef {
            pid: self.pid,
            starttime: self.starttime,
        }
    }

    pub fn cpu_ticks(&self) -> u64 {
        self.utime + self.stime
    }
}

/// Identity of a live pid
pub fn identify(pid: i32) -> Option<ProcessRef> {
    ProcStat::read(pid)
        .filter(|stat| !stat.is_zombie())
        .map(|stat| stat.identity())
}

/// True while the recorded process still runs: same pid, same start time
pub fn is_alive(process: &ProcessRef) -> bool {
    ProcStat::read(process.pid)
        .is_some_and(|stat| stat.starttime == process.starttime && !stat.is_zombie())
}

/// Every readable process on the host
pub fn all_processes() -> Vec<ProcStat> {
    let Ok(read) = fs::read_dir("/proc") else {
        return Vec::new();
    };
    read.filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .filter_map(ProcStat::read)
        .collect()
}

/// Live descendants of `root` (not including it), breadth first
pub fn descendants(root: i32) -> Vec<ProcStat> {
    descendants_in(root, all_processes())
}

fn descendants_in(root: i32, processes: Vec<ProcStat>) -> Vec<ProcStat> {
    let mut by_parent: HashMap<i32, Vec<ProcStat>> = HashMap::new();
    for stat in processes {
        by_parent.entry(stat.ppid).or_default().push(stat);
    }

    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        if let Some(children) = by_parent.remove(&pid) {
            for child in children {
                queue.push_back(child.pid);
                if !child.is_zombie() {
                    found.push(child);
                }
            }
        }
    }
    found
}

/// Seconds since the epoch at which the host booted (`btime` of `/proc/stat`)
pub fn boot_time() -> Option<i64> {
    parse_boot_time(&fs::read_to_string("/proc/stat").ok()?)
}

fn parse_boot_time(stat: &str) -> Option<i64> {
    stat.lines()
        .find_map(|line| line.strip_prefix("btime "))
        .and_then(|value| value.trim().parse().ok())
}

/// `sysconf(_SC_CLK_TCK)`, falling back to the common 100 Hz
pub fn clock_ticks_per_sec() -> u64 {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as u64
    } else {
        100
    }
}

pub fn page_size() -> u64 {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}
