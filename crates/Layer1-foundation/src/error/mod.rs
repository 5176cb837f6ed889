//! Error types for multi-tasker
//!
//! Every engine failure funnels into one enum so the dispatcher can map it
//! to a message and an exit status in a single place.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Exit status for a rejected option or value
pub const EXIT_VALIDATION: i32 = 2;
/// Exit status for a task that does not exist
pub const EXIT_NOT_FOUND: i32 = 3;
/// Exit status when the isolation primitive is unusable; the launcher also
/// reads it back from a shim that failed to enter its context
pub const EXIT_ISOLATION: i32 = 4;
/// Exit status for a failed signal or spawn
pub const EXIT_PROCESS: i32 = 5;

/// multi-tasker error type
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // NotFound
    // ========================================================================
    #[error("Task does not exist: {0}")]
    TaskNotFound(u32),

    #[error("Task file not found: {0}")]
    TaskFileNotFound(String),

    // ========================================================================
    // Validation
    // ========================================================================
    #[error("Validation error: {0}")]
    Validation(String),

    // ========================================================================
    // Isolation / resource limits
    // ========================================================================
    #[error("Isolation error: {0}")]
    Isolation(String),

    // ========================================================================
    // Persisted artifacts
    // ========================================================================
    #[error("Artifact `{artifact}` is unusable: {reason}")]
    Artifact { artifact: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ========================================================================
    // Process control
    // ========================================================================
    #[error("Process error: {0}")]
    Process(String),

    // ========================================================================
    // Other
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The task directory or its stats file is missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::TaskNotFound(_) | Error::TaskFileNotFound(_))
    }

    /// Process exit status used by the dispatcher
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Validation(_) => EXIT_VALIDATION,
            Error::TaskNotFound(_) | Error::TaskFileNotFound(_) => EXIT_NOT_FOUND,
            Error::Isolation(_) => EXIT_ISOLATION,
            Error::Process(_) => EXIT_PROCESS,
            _ => 1,
        }
    }

    /// Artifact error with any displayable reason
    pub fn artifact(artifact: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Artifact {
            artifact: artifact.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_variants() {
        assert!(Error::TaskNotFound(3).is_not_found());
        assert!(Error::TaskFileNotFound("stats.json".into()).is_not_found());
        assert!(!Error::Validation("x".into()).is_not_found());
    }

    #[test]
    fn test_messages_carry_reason() {
        assert_eq!(Error::TaskNotFound(7).to_string(), "Task does not exist: 7");
        assert!(Error::TaskFileNotFound("/tmp/1/stats.json".into())
            .to_string()
            .starts_with("Task file not found"));
        let err = Error::artifact("env.json", "expected value at line 1");
        assert_eq!(
            err.to_string(),
            "Artifact `env.json` is unusable: expected value at line 1"
        );
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::Validation("bad".into()).exit_code(), 2);
        assert_eq!(Error::TaskNotFound(1).exit_code(), 3);
        assert_eq!(Error::Isolation("no cgroup".into()).exit_code(), 4);
        assert_eq!(Error::Process("EPERM".into()).exit_code(), 5);
        assert_eq!(Error::Internal("x".into()).exit_code(), 1);
    }
}
