//! multi-tasker CLI - Main entry point

mod cli;
mod options;
mod render;

use clap::error::{ContextKind, ContextValue, ErrorKind};
use clap::{Parser, Subcommand};
use mult_foundation::error::EXIT_VALIDATION;
use mult_task::{Engine, TaskId};
use options::TaskOptions;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// multi-tasker - run shell commands as isolated, resource-bounded tasks
#[derive(Parser, Debug)]
#[command(name = "mult")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a task and start it
    #[command(alias = "c")]
    Create {
        #[command(flatten)]
        options: TaskOptions,

        /// Only create the task
        #[arg(long)]
        no_run: bool,

        /// Capture the current environment
        #[arg(short = 'e', long = "refresh-env")]
        refresh_env: bool,

        /// Command to run; several words are shell-quoted and joined
        #[arg(value_name = "COMMAND")]
        command: Vec<String>,
    },
    /// Start a stopped task
    #[command(alias = "s")]
    Start {
        id: TaskId,

        #[command(flatten)]
        options: TaskOptions,

        /// Recapture the environment before starting
        #[arg(short = 'e', long = "refresh-env")]
        refresh_env: bool,
    },
    /// Stop a running task
    Stop { id: TaskId },
    /// Stop a task if it runs, then start it
    Restart {
        id: TaskId,

        /// Recapture the environment before starting
        #[arg(short = 'e', long = "refresh-env")]
        refresh_env: bool,
    },
    /// Change a task's options
    #[command(alias = "e")]
    Edit {
        id: TaskId,

        #[command(flatten)]
        options: TaskOptions,
    },
    /// Delete a task, stopping it first
    Delete {
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        id: Option<TaskId>,

        /// Delete every task
        #[arg(long)]
        all: bool,
    },
    /// List tasks
    Ls {
        /// Show limits and monitoring instead of runtime state
        #[arg(short = 's', long = "stats")]
        stats: bool,

        /// Also list every child process of running tasks
        #[arg(short = 'a', long = "all")]
        all: bool,

        /// Refresh every second until interrupted
        #[arg(short = 'w', long = "watch")]
        watch: bool,

        ids: Vec<TaskId>,
    },
    /// Show the last lines of a task's output
    Logs {
        id: TaskId,

        /// Lines per stream (0 = all)
        #[arg(short = 'l', long = "lines")]
        lines: Option<usize>,

        /// Keep printing new output until interrupted
        #[arg(short = 'w', long = "watch")]
        watch: bool,
    },
    /// Check every task directory and the isolation backend
    Health {
        /// Re-create missing artifacts
        #[arg(short = 'f', long = "fix")]
        fix: bool,
    },
    /// Start every task marked with --boot
    Boot,
    #[command(hide = true)]
    Shim { id: TaskId },
}

#[tokio::main]
async fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => exit_with_usage_error(e),
    };

    init_logging(args.debug);

    let code = match run(args.command).await {
        Ok(code) => code,
        Err(e) => {
            cli::error(&e);
            e.downcast_ref::<mult_foundation::Error>()
                .map(mult_foundation::Error::exit_code)
                .unwrap_or(1)
        }
    };
    std::process::exit(code);
}

async fn run(command: Command) -> anyhow::Result<i32> {
    let engine = Engine::load()?;
    debug!("Dispatching {:?} with home {}", command, engine.config().home.display());
    let code = match command {
        Command::Create {
            options,
            no_run,
            refresh_env,
            command,
        } => cli::create(&engine, &options, no_run, refresh_env, &command).await?,
        Command::Start {
            id,
            options,
            refresh_env,
        } => cli::start(&engine, id, &options, refresh_env).await?,
        Command::Stop { id } => cli::stop(&engine, id).await?,
        Command::Restart { id, refresh_env } => cli::restart(&engine, id, refresh_env).await?,
        Command::Edit { id, options } => cli::edit(&engine, id, &options)?,
        Command::Delete { id, all } => cli::delete(&engine, id, all).await?,
        Command::Ls {
            stats,
            all,
            watch,
            ids,
        } => cli::list(&engine, stats, all, watch, &ids).await?,
        Command::Logs { id, lines, watch } => cli::logs(&engine, id, lines, watch).await?,
        Command::Health { fix } => cli::health(&engine, fix)?,
        Command::Boot => cli::boot(&engine).await?,
        Command::Shim { id } => cli::shim(&engine, id).await?,
    };
    Ok(code)
}

/// stderr only, so command output stays parseable
fn init_logging(debug: bool) {
    let log_level = if debug { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

/// Rejected arguments never reach the engine, so nothing is persisted
fn exit_with_usage_error(e: clap::Error) -> ! {
    match e.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => e.exit(),
        ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => e.exit(),
        _ => {}
    }

    let missing_value = e.kind() == ErrorKind::MissingRequiredArgument
        || matches!(
            e.get(ContextKind::InvalidValue),
            Some(ContextValue::String(value)) if value.is_empty()
        );
    if missing_value {
        cli::error("One or more arguments are missing its value.");
    } else {
        cli::error("One or more options are invalid.");
    }
    eprint!("{}", e.render());
    std::process::exit(EXIT_VALIDATION);
}
