use std::fmt;

use thiserror::Error;

use crate::storage::StorageError;

/// One parsed frame of a script-side stack trace.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StackFrame {
    pub function_name: String,
    pub source_name: String,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let function_name = if self.function_name.is_empty() {
            "<anonymous>"
        } else {
            self.function_name.as_str()
        };
        write!(f, "   at {function_name}")?;
        if !self.source_name.is_empty() {
            write!(
                f,
                " in {}:line {} {}",
                self.source_name, self.line, self.column
            )?;
        }
        Ok(())
    }
}

/// A structured script exception, as reconstructed on the native side.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JsException {
    pub name: String,
    pub message: String,
    pub frames: Vec<StackFrame>,
}

impl JsException {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            frames: Vec::new(),
        }
    }

    pub fn with_frames(mut self, frames: Vec<StackFrame>) -> Self {
        self.frames = frames;
        self
    }

    pub fn stack_trace(&self) -> String {
        self.frames
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl fmt::Display for JsException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

#[derive(Debug, Error)]
pub enum ViewError {
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("script fault: {0}")]
    ScriptFault(JsException),
    #[error("uncaught asynchronous script fault: {0}")]
    UncaughtAsyncFault(JsException),
    #[error("script engine is unavailable")]
    EngineUnavailable,
    #[error("invalid plugin: {0}")]
    InvalidPlugin(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("native call failed: {0}")]
    Native(#[source] anyhow::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ViewError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ViewError::Timeout(_))
    }

    /// The script exception carried by this error, if any.
    pub fn exception(&self) -> Option<&JsException> {
        match self {
            ViewError::ScriptFault(exception) | ViewError::UncaughtAsyncFault(exception) => {
                Some(exception)
            }
            _ => None,
        }
    }
}

pub type ViewResult<T> = Result<T, ViewError>;
