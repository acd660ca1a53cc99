//! Top-level error type for scripting operations.

use thiserror::Error;

use crate::session::SessionError;
use crate::streamer::StreamError;
use crate::templating::TemplateError;

/// A command exited with a code outside the accepted set.
///
/// Output is attached when it was captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidReturnCode {
    pub return_code: i32,
    pub stdout: Option<Vec<u8>>,
    pub stderr: Option<Vec<u8>>,
}

impl InvalidReturnCode {
    /// Returns captured stdout decoded lossily.
    pub fn stdout_lossy(&self) -> Option<String> {
        self.stdout
            .as_deref()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    /// Returns captured stderr decoded lossily.
    pub fn stderr_lossy(&self) -> Option<String> {
        self.stderr
            .as_deref()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }
}

impl std::fmt::Display for InvalidReturnCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid return code {}", self.return_code)?;
        if let Some(stderr) = self.stderr_lossy().filter(|s| !s.trim().is_empty()) {
            write!(f, ": {}", stderr.trim_end())?;
        }
        Ok(())
    }
}

/// Errors returned by the orchestrator.
#[derive(Error, Debug)]
pub enum ScriptingError {
    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("terminal session error: {0}")]
    Session(#[from] SessionError),

    #[error("{0}")]
    InvalidReturnCode(InvalidReturnCode),

    #[error("captured stdout is not valid UTF-8: {0}")]
    Decode(#[from] std::string::FromUtf8Error),

    #[error("failed to start runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

impl ScriptingError {
    /// Returns the exit code when the error is a rejected return code.
    pub fn return_code(&self) -> Option<i32> {
        match self {
            ScriptingError::InvalidReturnCode(invalid) => Some(invalid.return_code),
            _ => None,
        }
    }
}
