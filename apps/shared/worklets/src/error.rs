use std::fmt;

use thiserror::Error;

use crate::engine::EngineKind;

pub type Result<T> = std::result::Result<T, WorkletsError>;

/// A script-level exception, re-expressed outside of the engine that raised it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptError {
    /// Error class name (e.g. "TypeError")
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl ScriptError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum WorkletsError {
    #[error("[Worklets] Engine '{}' is not available in this build", .0.name())]
    UnsupportedEngine(EngineKind),

    #[error("[Worklets] Invalid configuration: {0}")]
    Configuration(String),

    #[error("[Worklets] Failed to initialize runtime \"{runtime}\": {error}")]
    Bootstrap { runtime: String, error: ScriptError },

    #[error("{0}")]
    InvocationType(String),

    #[error("[Worklets] Runtime \"{0}\" doesn't support locking.")]
    LockingNotSupported(String),

    #[error("{0}")]
    Script(ScriptError),

    #[error("[Worklets] Worklet runtime \"{0}\" has already been destroyed")]
    RuntimeDestroyed(String),

    #[error("[Worklets] Context \"{0}\" is already entered on this thread")]
    ReentrantEntry(String),

    #[error("[Worklets] Engine error: {0}")]
    Engine(String),
}

impl WorkletsError {
    pub fn invocation_type(message: impl Into<String>) -> Self {
        WorkletsError::InvocationType(message.into())
    }

    /// The error as seen by script code: class name, message and stack.
    pub fn to_script_error(&self) -> ScriptError {
        match self {
            WorkletsError::Script(error) => error.clone(),
            WorkletsError::InvocationType(message) => ScriptError::new("TypeError", message.clone()),
            other => ScriptError::new("WorkletsError", other.to_string()),
        }
    }
}

impl From<ScriptError> for WorkletsError {
    fn from(error: ScriptError) -> Self {
        WorkletsError::Script(error)
    }
}
