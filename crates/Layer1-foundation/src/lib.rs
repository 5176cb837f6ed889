//! # mult-foundation
//!
//! Foundation layer for multi-tasker:
//! - Error: shared error taxonomy (NotFound, Validation, Isolation, IO, Process)
//! - Storage: JsonStore (atomic temp + rename writes)
//! - Config: EngineConfig (home, isolation backend, timeouts)
//! - Units: memory size parsing/formatting

pub mod config;
pub mod error;
pub mod storage;
pub mod units;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Storage & Config
// ============================================================================
pub use config::{EngineConfig, IsolationKind};
pub use storage::JsonStore;
pub use units::{format_bytes, parse_size};
