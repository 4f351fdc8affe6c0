//! Backend error taxonomy
//!
//! Subprocess failures normalize into three kinds the retry classifier
//! understands: timeout, cancelled, and process.

use std::time::Duration;
use thiserror::Error;

/// Errors from invoking the code-agent subprocess
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend invocation cancelled")]
    Cancelled,

    #[error("backend process failed (exit code {exit_code:?}): {message}")]
    Process { exit_code: Option<i32>, message: String },

    #[error("failed to spawn backend process: {0}")]
    Spawn(#[from] std::io::Error),
}

impl BackendError {
    /// Discriminator string used in logs and node error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Process { .. } => "process",
            Self::Spawn(_) => "process",
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Process { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}
