//! Storage module for multi-tasker
//!
//! - `json`: JSON artifact load/save with atomic replace

mod json;

pub use json::JsonStore;
