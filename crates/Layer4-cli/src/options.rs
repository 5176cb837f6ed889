//! Task options shared by `create`, `start` and `edit`
//!
//! Flags are turned into a [`TaskPatch`] here, so the engine never sees
//! sentinel strings like `none`.

use clap::Args;
use mult_foundation::{parse_size, Error, Result};
use mult_task::{Monitoring, Patch, TaskPatch};

/// Sentinel that clears a limit
const NONE: &str = "none";

#[derive(Args, Debug, Clone, Default)]
pub struct TaskOptions {
    /// Memory limit with a decimal size suffix (B, k, M, G, T; `b` = bits), or `none`
    #[arg(short = 'm', long = "memory", value_name = "SIZE")]
    pub memory: Option<String>,

    /// CPU limit in percent of one CPU, or `none`
    #[arg(short = 'c', long = "cpu", value_name = "PERCENT")]
    pub cpu: Option<String>,

    /// Monitoring depth: shallow or deep
    #[arg(short = 's', long = "monitoring", value_name = "DEPTH")]
    pub monitoring: Option<String>,

    /// Start with the host
    #[arg(short = 'b', long = "boot")]
    pub boot: bool,

    /// Do not start with the host (wins over -b)
    #[arg(short = 'B', long = "no-boot")]
    pub no_boot: bool,

    /// Keep running after this session ends
    #[arg(short = 'p', long = "persist")]
    pub persist: bool,

    /// Stop with this session (wins over -p)
    #[arg(short = 'P', long = "no-persist")]
    pub no_persist: bool,

    /// Attach to the terminal instead of capturing logs
    #[arg(short = 'i', long = "interactive")]
    pub interactive: bool,

    /// Capture logs (wins over -i)
    #[arg(short = 'I', long = "no-interactive")]
    pub no_interactive: bool,

    /// Replace the command
    #[arg(long = "comm", value_name = "COMMAND")]
    pub comm: Option<String>,
}

impl TaskOptions {
    /// Validate every value; nothing is persisted when this fails
    pub fn to_patch(&self) -> Result<TaskPatch> {
        Ok(TaskPatch {
            command: match &self.comm {
                Some(command) => Patch::Set(command.clone()),
                None => Patch::Unchanged,
            },
            memory_limit: parse_limit(self.memory.as_deref(), parse_size)?,
            cpu_limit: parse_limit(self.cpu.as_deref(), parse_cpu)?,
            persist: toggle(self.persist, self.no_persist),
            monitoring: match self.monitoring.as_deref() {
                None => Patch::Unchanged,
                Some(depth) => parse_monitoring(depth)?,
            },
            boot: toggle(self.boot, self.no_boot),
            interactive: toggle(self.interactive, self.no_interactive),
        })
    }
}

fn toggle(enable: bool, disable: bool) -> Patch<bool> {
    match (enable, disable) {
        (_, true) => Patch::Clear,
        (true, false) => Patch::Set(true),
        (false, false) => Patch::Unchanged,
    }
}

fn parse_limit<T>(value: Option<&str>, parse: fn(&str) -> Result<T>) -> Result<Patch<T>> {
    match value {
        None => Ok(Patch::Unchanged),
        Some(v) if v.trim().eq_ignore_ascii_case(NONE) => Ok(Patch::Clear),
        Some(v) => parse(v).map(Patch::Set),
    }
}

fn parse_cpu(value: &str) -> Result<u32> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| Error::Validation(format!("`{}` is not a valid cpu limit", value)))
}

fn parse_monitoring(value: &str) -> Result<Patch<Monitoring>> {
    match value.trim().to_ascii_lowercase().as_str() {
        "shallow" => Ok(Patch::Set(Monitoring::Shallow)),
        "deep" => Ok(Patch::Set(Monitoring::Deep)),
        NONE => Ok(Patch::Clear),
        _ => Err(Error::Validation(format!(
            "`{}` is not a monitoring depth (shallow, deep)",
            value
        ))),
    }
}

/// Positional words become one shell command line. A single word is taken
/// verbatim so `mult create "echo hi"` runs `echo hi`.
pub fn join_command(words: &[String]) -> Result<Option<String>> {
    match words {
        [] => Ok(None),
        [single] => Ok(Some(single.clone())),
        words => shlex::try_join(words.iter().map(String::as_str))
            .map(Some)
            .map_err(|e| Error::Validation(format!("command cannot be quoted: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_flags_is_empty_patch() {
        assert!(TaskOptions::default().to_patch().unwrap().is_empty());
    }

    #[test]
    fn test_values_and_sentinels() {
        let options = TaskOptions {
            memory: Some("20M".into()),
            cpu: Some("none".into()),
            monitoring: Some("Deep".into()),
            ..Default::default()
        };
        let patch = options.to_patch().unwrap();
        assert_eq!(patch.memory_limit, Patch::Set(20_000_000));
        assert_eq!(patch.cpu_limit, Patch::Clear);
        assert_eq!(patch.monitoring, Patch::Set(Monitoring::Deep));
    }

    #[test]
    fn test_disable_wins() {
        let options = TaskOptions {
            boot: true,
            no_boot: true,
            persist: true,
            interactive: true,
            ..Default::default()
        };
        let patch = options.to_patch().unwrap();
        assert_eq!(patch.boot, Patch::Clear);
        assert_eq!(patch.persist, Patch::Set(true));
        assert_eq!(patch.interactive, Patch::Set(true));
    }

    #[test]
    fn test_bad_values_are_validation_errors() {
        for options in [
            TaskOptions {
                memory: Some("20X".into()),
                ..Default::default()
            },
            TaskOptions {
                cpu: Some("-3".into()),
                ..Default::default()
            },
            TaskOptions {
                monitoring: Some("medium".into()),
                ..Default::default()
            },
        ] {
            assert!(matches!(options.to_patch(), Err(Error::Validation(_))));
        }
    }

    #[test]
    fn test_join_command() {
        assert_eq!(join_command(&[]).unwrap(), None);
        assert_eq!(
            join_command(&["echo hi".into()]).unwrap().as_deref(),
            Some("echo hi")
        );
        assert_eq!(
            join_command(&["sh".into(), "-c".into(), "echo a".into()])
                .unwrap()
                .as_deref(),
            Some("sh -c 'echo a'")
        );
    }
}
