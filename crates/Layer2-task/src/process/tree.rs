//! Live process set of a task

use super::proc::{descendants, identify, is_alive};
use crate::artifact::{ProcessRef, ProcessSnapshot};
use std::collections::HashSet;

/// Every live process belonging to a task: recorded refs that still match
/// their start time, their current descendants, and any extra pids the
/// isolation context reports (e.g. cgroup members that re-parented away).
pub fn live_set(snapshot: &ProcessSnapshot, members: &[i32]) -> Vec<ProcessRef> {
    let mut seen = HashSet::new();
    let mut live = Vec::new();

    for recorded in snapshot.all().filter(|p| is_alive(p)) {
        if seen.insert(recorded.pid) {
            live.push(*recorded);
        }
        for stat in descendants(recorded.pid) {
            if seen.insert(stat.pid) {
                live.push(stat.identity());
            }
        }
    }

    for pid in members {
        if seen.contains(pid) {
            continue;
        }
        if let Some(identity) = identify(*pid) {
            seen.insert(*pid);
            live.push(identity);
        }
    }

    live
}

/// Refresh the recorded children from the shim's current descendants
pub fn refresh_children(snapshot: &mut ProcessSnapshot, shim_pid: i32) {
    snapshot.children = descendants(shim_pid).iter().map(|s| s.identity()).collect();
}
