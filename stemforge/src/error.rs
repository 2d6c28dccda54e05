//! Application-wide error types.

use sidecar::SidecarError;
use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Runner error: {0}")]
    Sidecar(#[from] SidecarError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

/// Failure of one stage attempt, as recorded on the job and used to decide
/// whether the queue may try again.
#[derive(Error, Debug)]
pub enum StageError {
    /// Runtime or script missing.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Bad options, rejected before anything is spawned.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Source file not found for track {track_id}")]
    FileNotFound { track_id: String },

    #[error("Runner output could not be parsed")]
    Parse { raw: String },

    #[error("{0}")]
    Script(String),

    #[error("Runner exited with code {}", .code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    ExitCode { code: Option<i32>, raw: String },

    #[error("Timed out after {0}s")]
    Timeout(u64),

    #[error("Runner crashed: {0}")]
    Crashed(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl StageError {
    /// Transient failures go back to the queue for another attempt;
    /// deterministic ones are discarded immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Parse { .. }
                | Self::Script(_)
                | Self::ExitCode { .. }
                | Self::Timeout(_)
                | Self::Crashed(_)
                | Self::Persistence(_)
        )
    }

    /// Short machine-readable kind, stored alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::Validation(_) => "validation_error",
            Self::FileNotFound { .. } => "file_not_found",
            Self::Parse { .. } => "parse_error",
            Self::Script(_) => "script_error",
            Self::ExitCode { .. } => "exit_code",
            Self::Timeout(_) => "timeout",
            Self::Crashed(_) => "crashed",
            Self::Cancelled => "cancelled",
            Self::Persistence(_) => "persistence_error",
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

impl From<SidecarError> for StageError {
    fn from(err: SidecarError) -> Self {
        match err {
            SidecarError::Configuration(msg) => Self::Configuration(msg),
            SidecarError::Spawn(e) => Self::Configuration(format!("failed to spawn runner: {e}")),
            SidecarError::Parse { raw } => Self::Parse { raw },
            SidecarError::Script { message } => Self::Script(message),
            SidecarError::ExitCode { code, raw } => Self::ExitCode { code, raw },
            SidecarError::Timeout { after } => Self::Timeout(after.as_secs()),
            SidecarError::Crashed(reason) => Self::Crashed(reason),
            SidecarError::Cancelled => Self::Cancelled,
            SidecarError::Io(e) => Self::Crashed(format!("runner IO failure: {e}")),
        }
    }
}

impl From<Error> for StageError {
    fn from(err: Error) -> Self {
        match err {
            Error::Validation(msg) => Self::Validation(msg),
            Error::Configuration(msg) => Self::Configuration(msg),
            Error::Sidecar(e) => e.into(),
            other => Self::Persistence(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_retry_classification() {
        assert!(StageError::Timeout(300).is_retryable());
        assert!(StageError::ExitCode { code: Some(1), raw: String::new() }.is_retryable());
        assert!(StageError::Parse { raw: String::new() }.is_retryable());
        assert!(StageError::Script("CUDA out of memory".into()).is_retryable());

        assert!(!StageError::validation("Unsupported model: foo").is_retryable());
        assert!(!StageError::FileNotFound { track_id: "t1".into() }.is_retryable());
        assert!(!StageError::Configuration("python missing".into()).is_retryable());
        assert!(!StageError::Cancelled.is_retryable());
    }

    #[test]
    fn test_from_sidecar_error() {
        let err: StageError = SidecarError::Timeout {
            after: Duration::from_secs(120),
        }
        .into();
        assert!(matches!(err, StageError::Timeout(120)));
        assert_eq!(err.to_string(), "Timed out after 120s");
        assert_eq!(err.kind(), "timeout");

        let err: StageError = SidecarError::config("script not found").into();
        assert_eq!(err.kind(), "configuration_error");
    }

    #[test]
    fn test_not_found_display() {
        let err = Error::not_found("StageJob", "abc");
        assert_eq!(err.to_string(), "Entity not found: StageJob with id abc");
    }
}
