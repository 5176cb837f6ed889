//! Process inspection and control
//!
//! - `proc`: `/proc/<pid>/stat` parsing, identity and descendant walks
//! - `signal`: signal delivery to single pids and whole trees
//! - `tree`: the live set of a task (recorded refs + descendants + context members)

pub mod proc;
pub mod signal;
pub mod tree;

pub use proc::{descendants, identify, is_alive, ProcStat};
pub use signal::{exit_code, Signal};
