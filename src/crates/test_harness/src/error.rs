use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::process::CapturedOutput;

/// Result alias for harness operations.
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Errors that can occur while launching, driving or stopping the simulator and the IOC.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to launch {process}: {reason}")]
    Launch { process: String, reason: String },
    #[error("{process} failed to start: {reason}")]
    Startup {
        process: String,
        reason: String,
        output: Option<CapturedOutput>,
    },
    #[error("point {name} unavailable after {timeout:?}")]
    PointUnavailable { name: String, timeout: Duration },
    #[error("precondition violated: {0}")]
    Precondition(String),
    #[error("{process} did not exit within {timeout:?}")]
    ShutdownTimeout { process: String, timeout: Duration },
    #[error("{0} has not exited yet")]
    NotExited(String),
    #[error("{0} is already stopped")]
    AlreadyStopped(String),
    #[error("point transport error: {0}")]
    Transport(String),
    #[error("{0} assertion(s) failed")]
    AssertionsFailed(usize),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HarnessError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        HarnessError::Config(message.into())
    }

    pub(crate) fn launch(process: impl Into<String>, reason: impl Into<String>) -> Self {
        HarnessError::Launch {
            process: process.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn precondition(message: impl Into<String>) -> Self {
        HarnessError::Precondition(message.into())
    }

    pub(crate) fn transport(message: impl Into<String>) -> Self {
        HarnessError::Transport(message.into())
    }

    /// Captured process output attached to a startup failure, if any.
    pub fn output(&self) -> Option<&CapturedOutput> {
        match self {
            HarnessError::Startup { output, .. } => output.as_ref(),
            _ => None,
        }
    }
}
