use std::time::Duration;
use thiserror::Error;

/// Terminal failure of one runner invocation.
#[derive(Error, Debug)]
pub enum SidecarError {
    /// Runtime or script could not be resolved. Nothing was spawned.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to spawn runner: {0}")]
    Spawn(#[source] std::io::Error),

    /// The runner exited successfully but never emitted a result message.
    #[error("Runner produced no result message")]
    Parse { raw: String },

    #[error("{message}")]
    Script { message: String },

    #[error("Runner exited with code {}", describe_code(.code))]
    ExitCode { code: Option<i32>, raw: String },

    #[error("Runner timed out after {}s", .after.as_secs())]
    Timeout { after: Duration },

    /// The task driving the call panicked or was aborted.
    #[error("Runner task crashed: {0}")]
    Crashed(String),

    #[error("Runner call cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

impl SidecarError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether a later attempt of the same call could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Parse { .. }
                | Self::Script { .. }
                | Self::ExitCode { .. }
                | Self::Timeout { .. }
                | Self::Crashed(_)
        )
    }

    /// Raw stdout captured for diagnostics, when the error carries it.
    pub fn raw_output(&self) -> Option<&str> {
        match self {
            Self::Parse { raw } | Self::ExitCode { raw, .. } => Some(raw),
            _ => None,
        }
    }
}
