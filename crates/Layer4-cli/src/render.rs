//! Text rendering for listings and health reports

use chrono::{DateTime, Utc};
use mult_foundation::format_bytes;
use mult_task::{HealthReport, LogLine, LogStream, Monitor, ProcessInfo, TaskView};

const NOT_AVAILABLE: &str = "N/A";

/// Left-aligned plain-text table
pub struct Table {
    headers: Vec<&'static str>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: Vec<&'static str>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    pub fn render(&self) -> String {
        let mut widths: Vec<usize> = self.headers.iter().map(|h| h.chars().count()).collect();
        for row in &self.rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.chars().count());
            }
        }

        let line = |cells: Vec<&str>| {
            let padded: Vec<String> = cells
                .iter()
                .zip(&widths)
                .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
                .collect();
            padded.join("  ").trim_end().to_string()
        };

        let mut out = line(self.headers.clone());
        out.push('\n');
        for row in &self.rows {
            out.push_str(&line(row.iter().map(String::as_str).collect()));
            out.push('\n');
        }
        out
    }
}

// ============================================================================
// ls
// ============================================================================

/// One row per task; with `all`, one extra row per live child process
pub fn task_table(views: &[TaskView], all: bool) -> String {
    let now = Utc::now();
    let mut table = Table::new(vec!["ID", "COMMAND", "PID", "STATUS", "MEMORY", "CPU", "RUNTIME"]);
    for view in views {
        let running = view.status.is_running();
        let children: Vec<ProcessInfo> = if running {
            view.processes.children.iter().filter_map(Monitor::inspect).collect()
        } else {
            Vec::new()
        };
        let usage = view.resources.usage.as_ref().filter(|_| running);
        let pid = view
            .processes
            .shim
            .filter(|_| running)
            .map(|shim| shim.pid.to_string());
        let runtime = view
            .processes
            .last_run
            .as_ref()
            .filter(|_| running)
            .map(|run| format_runtime(run.started_at, now));
        let command = if all || children.is_empty() {
            view.task.spec.command.clone()
        } else {
            format!("{} (+{} more processes)", view.task.spec.command, children.len())
        };

        table.push(vec![
            view.task.id.to_string(),
            command,
            or_na(pid),
            view.status.to_string(),
            or_na(usage.and_then(|u| u.memory_bytes).map(format_bytes)),
            or_na(usage.and_then(|u| u.cpu_percent).map(|cpu| format!("{:.2}%", cpu))),
            or_na(runtime),
        ]);
        if all {
            for child in &children {
                table.push(child_row(child, now));
            }
        }
    }
    table.render()
}

fn child_row(child: &ProcessInfo, now: DateTime<Utc>) -> Vec<String> {
    vec![
        String::new(),
        format!("  {}", child.comm),
        child.pid.to_string(),
        "Running".to_string(),
        format_bytes(child.memory_bytes),
        NOT_AVAILABLE.to_string(),
        or_na(child.started_at.map(|started| format_runtime(started, now))),
    ]
}

pub fn stats_table(views: &[TaskView]) -> String {
    let mut table = Table::new(vec![
        "ID",
        "MEMORY LIMIT",
        "CPU LIMIT",
        "MONITORING",
        "MEMORY COLLECTED",
        "CPU COLLECTED",
    ]);
    for view in views {
        let spec = &view.task.spec;
        table.push(vec![
            view.task.id.to_string(),
            match spec.memory_limit {
                0 => "None".to_string(),
                bytes => format_bytes(bytes),
            },
            match spec.cpu_limit {
                0 => "None".to_string(),
                percent => format!("{}%", percent),
            },
            spec.monitoring.to_string(),
            collected(view.resources.memory_collected()),
            collected(view.resources.cpu_collected()),
        ]);
    }
    table.render()
}

fn or_na(value: Option<String>) -> String {
    value.unwrap_or_else(|| NOT_AVAILABLE.to_string())
}

fn collected(yes: bool) -> String {
    if yes { "Yes" } else { "None" }.to_string()
}

/// `1h 2m 3s` style elapsed time
pub fn format_runtime(started: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - started).num_seconds().max(0);
    let (h, m, s) = (secs / 3600, secs % 3600 / 60, secs % 60);
    match (h, m) {
        (0, 0) => format!("{}s", s),
        (0, _) => format!("{}m {}s", m, s),
        _ => format!("{}h {}m {}s", h, m, s),
    }
}

/// A followed log line; stderr is marked, stdout is printed as-is
pub fn follow_line(line: &LogLine) -> String {
    match line.stream {
        LogStream::Stdout => line.text.clone(),
        LogStream::Stderr => format!("{} {}", line.stream.label(), line.text),
    }
}

// ============================================================================
// health
// ============================================================================

/// Health output split by stream: `(stdout, stderr)`
pub fn health_lines(report: &HealthReport) -> (Vec<String>, Vec<String>) {
    let mut out = Vec::new();
    let mut err = Vec::new();

    if report.root_created {
        out.push("Created missing tasks directory".to_string());
    }
    for name in &report.foreign {
        err.push(format!("Unknown item in tasks directory: {}", name));
    }

    for task in &report.tasks {
        out.push(format!("Testing item: {}", task.id));
        for artifact in &task.found {
            out.push(format!("Found inner item: {}", artifact));
        }
        for artifact in &task.missing {
            err.push(format!("Missing essential file `{}` in task dir", artifact));
        }
        for (artifact, reason) in &task.corrupt {
            err.push(format!("Corrupt essential file `{}` in task dir: {}", artifact, reason));
        }
        for artifact in &task.restored {
            out.push(format!("Restored essential file `{}`", artifact));
        }
        match &task.error {
            Some(reason) => {
                err.push(format!("Cannot get task with id: {}", task.id));
                err.push(reason.clone());
            }
            None if task.is_healthy() => out.push(format!("Task {} is healthy", task.id)),
            None => err.push(format!("Task {} is unhealthy", task.id)),
        }
    }

    match &report.isolation.status {
        Ok(detail) => out.push(format!("Namespaces are healthy ({})", detail)),
        Err(reason) => err.push(format!("Namespaces are unhealthy: {}", reason)),
    }
    (out, err)
}
