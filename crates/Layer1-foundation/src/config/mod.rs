//! Config - engine settings
//!
//! - `engine.rs` - EngineConfig (home, isolation backend, timeouts)

mod engine;

pub use engine::{EngineConfig, IsolationKind, CONFIG_FILE, ENV_HOME, ENV_ISOLATION};
