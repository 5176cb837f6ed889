//! Command handlers
//!
//! Each handler calls one engine operation, prints the outcome and returns
//! the process exit code. Errors are left to `main`.

use crate::options::{join_command, TaskOptions};
use crate::render;
use crossterm::cursor::MoveUp;
use crossterm::execute;
use crossterm::terminal::{Clear, ClearType};
use mult_foundation::{Error, Result};
use mult_task::{
    CreateOptions, Engine, Launch, StartOptions, StartOutcome, StopOutcome, TaskId, TaskSpec,
};
use std::io::Write;
use std::time::Duration;
use tracing::debug;

/// Refresh period of `ls -w`
const WATCH_INTERVAL: Duration = Duration::from_secs(1);

pub fn success(message: impl std::fmt::Display) {
    println!("[SUCCESS] {}", message);
}

pub fn info(message: impl std::fmt::Display) {
    println!("[INFO] {}", message);
}

pub fn error(message: impl std::fmt::Display) {
    eprintln!("[ERROR] {}", message);
}

pub async fn create(
    engine: &Engine,
    options: &TaskOptions,
    no_run: bool,
    refresh_env: bool,
    words: &[String],
) -> Result<i32> {
    let patch = options.to_patch()?;
    let command = match (join_command(words)?, &options.comm) {
        (_, Some(comm)) => comm.clone(),
        (Some(command), None) => command,
        (None, None) => return Err(Error::Validation("no command given".to_string())),
    };
    let spec = TaskSpec::new(command).with_patch(&patch);

    let created = engine
        .create(
            spec,
            CreateOptions {
                run: !no_run,
                refresh_env,
            },
        )
        .await?;
    success(format!("Task created with id {}", created.task.id));

    match created.start {
        Some(outcome) => report_start(created.task.id, outcome?).await,
        None => Ok(0),
    }
}

pub async fn start(
    engine: &Engine,
    id: TaskId,
    options: &TaskOptions,
    refresh_env: bool,
) -> Result<i32> {
    let outcome = engine
        .start(
            id,
            StartOptions {
                refresh_env,
                patch: options.to_patch()?,
            },
        )
        .await?;
    report_start(id, outcome).await
}

pub async fn restart(engine: &Engine, id: TaskId, refresh_env: bool) -> Result<i32> {
    let outcome = engine
        .restart(
            id,
            StartOptions {
                refresh_env,
                ..Default::default()
            },
        )
        .await?;
    report_start(id, outcome).await
}

/// Interactive tasks keep the terminal until the command exits
async fn report_start(id: TaskId, outcome: StartOutcome) -> Result<i32> {
    match outcome {
        StartOutcome::Started(launch) => {
            success(format!("Task started with id {}.", id));
            wait_interactive(launch).await
        }
        StartOutcome::AlreadyRunning => {
            info(format!("Task {} is already running", id));
            Ok(0)
        }
    }
}

async fn wait_interactive(launch: Launch) -> Result<i32> {
    if launch.interactive {
        launch.wait().await
    } else {
        Ok(0)
    }
}

pub async fn stop(engine: &Engine, id: TaskId) -> Result<i32> {
    match engine.stop(id).await? {
        StopOutcome::Stopped { .. } => success(format!("Task stopped with id {}", id)),
        StopOutcome::NotRunning => info(format!("Task {} is not running", id)),
    }
    Ok(0)
}

pub fn edit(engine: &Engine, id: TaskId, options: &TaskOptions) -> Result<i32> {
    let task = engine.edit(id, &options.to_patch()?)?;
    success(format!("Task edited with id {}", task.id));
    Ok(0)
}

pub async fn delete(engine: &Engine, id: Option<TaskId>, all: bool) -> Result<i32> {
    let notice = |_: TaskId| info("Killing existing processes");
    match (id, all) {
        (_, true) => {
            let mut code = 0;
            for result in engine.delete_all(notice).await? {
                match result.outcome {
                    Ok(deleted) => success(format!("Task deleted with id {}", deleted.id)),
                    Err(e) => {
                        error(format!("Task {}: {}", result.id, e));
                        code = e.exit_code();
                    }
                }
            }
            Ok(code)
        }
        (Some(id), false) => {
            let deleted = engine.delete(id, notice).await?;
            success(format!("Task deleted with id {}", deleted.id));
            Ok(0)
        }
        (None, false) => Err(Error::Validation("no task id given".to_string())),
    }
}

/// With `watch`, redraw in place every second until interrupted
pub async fn list(engine: &Engine, stats: bool, all: bool, watch: bool, ids: &[TaskId]) -> Result<i32> {
    let draw = || -> Result<String> {
        let views = engine.list(ids)?;
        Ok(if stats {
            render::stats_table(&views)
        } else {
            render::task_table(&views, all)
        })
    };

    let mut table = draw()?;
    print!("{}", table);
    if !watch {
        return Ok(0);
    }

    let mut stdout = std::io::stdout();
    stdout.flush()?;
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(WATCH_INTERVAL) => {}
            _ = &mut interrupted => break,
        }
        let next = draw()?;
        let height = table.lines().count() as u16;
        execute!(stdout, MoveUp(height), Clear(ClearType::FromCursorDown))?;
        print!("{}", next);
        stdout.flush()?;
        table = next;
    }
    Ok(0)
}

/// With `watch`, keep printing appended lines until interrupted
pub async fn logs(engine: &Engine, id: TaskId, lines: Option<usize>, watch: bool) -> Result<i32> {
    if !watch {
        print!("{}", engine.logs(id, lines)?.render());
        return Ok(0);
    }

    let (view, mut follower) = engine.follow_logs(id, lines)?;
    print!("{}", view.render());
    std::io::stdout().flush()?;
    debug!("Following logs of task {}", id);

    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    loop {
        tokio::select! {
            batch = follower.next() => {
                for line in batch? {
                    println!("{}", render::follow_line(&line));
                }
            }
            _ = &mut interrupted => break,
        }
    }
    info("Logs stopped.");
    Ok(0)
}

pub fn health(engine: &Engine, fix: bool) -> Result<i32> {
    let report = engine.health(fix)?;
    let (out, err) = render::health_lines(&report);
    for line in out {
        println!("{}", line);
    }
    for line in err {
        eprintln!("{}", line);
    }
    Ok(if report.is_healthy() { 0 } else { 1 })
}

pub async fn boot(engine: &Engine) -> Result<i32> {
    let mut code = 0;
    for result in engine.boot().await? {
        match result.outcome {
            Ok(StartOutcome::Started(_)) => success(format!("Task started with id {}.", result.id)),
            Ok(StartOutcome::AlreadyRunning) => {
                info(format!("Task {} is already running", result.id))
            }
            Err(e) => {
                error(format!("Task {}: {}", result.id, e));
                code = e.exit_code();
            }
        }
    }
    Ok(code)
}

/// Hidden `shim` subcommand; stderr here is the task's stderr log
pub async fn shim(engine: &Engine, id: TaskId) -> Result<i32> {
    engine.run_shim(id).await
}
