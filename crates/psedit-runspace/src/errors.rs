//! Error types surfaced by the runspace core.

use std::fmt;

use thiserror::Error;

use crate::engine::{EngineError, ErrorRecord, InvocationError, RunspaceState};

/// Failures delivered through a [`crate::TaskHandle`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    /// The request was cancelled before or while it ran.
    #[error("execution was cancelled")]
    Cancelled,
    /// User script raised errors and the request asked to fail on them.
    #[error("script failed: {}", summarise(.records))]
    ScriptFailed {
        /// Error records raised by the script.
        records: Vec<ErrorRecord>,
    },
    /// The engine failed outside user script content.
    #[error("execution faulted: {message}")]
    Faulted {
        /// Description of the fault.
        message: String,
    },
    /// The request panicked on the pipeline thread.
    #[error("execution panicked: {message}")]
    Panicked {
        /// Panic payload rendered as text.
        message: String,
    },
    /// The runspace of the current frame can no longer run commands.
    #[error("runspace is not usable ({state:?})")]
    RunspaceUnusable {
        /// State reported by the runspace.
        state: RunspaceState,
    },
    /// The executor is shutting down.
    #[error("the pipeline executor is shutting down")]
    ShuttingDown,
    /// No result arrived in time.
    #[error("timed out waiting for the pipeline thread")]
    Timeout,
    /// The frame stack reached its configured depth.
    #[error("frame stack is already {depth} frames deep")]
    NestingLimit {
        /// Depth at the time of the refused push.
        depth: usize,
    },
    /// The current frame has no engine to run the request on.
    #[error("no engine instance is available for the current frame")]
    EngineUnavailable,
    /// A blocking request was issued from the pipeline thread itself.
    #[error("blocking request issued from the pipeline thread")]
    Reentrant,
}

impl ExecutionError {
    /// Maps an engine invocation failure onto the execution error space.
    pub(crate) fn from_invocation(error: InvocationError) -> Self {
        match error {
            InvocationError::Script { records } => Self::ScriptFailed { records },
            InvocationError::Stopped => Self::Cancelled,
            InvocationError::RunspaceUnusable { state } => Self::RunspaceUnusable { state },
            InvocationError::Fault(message) => Self::Faulted { message },
        }
    }

    /// Whether the error only reports a cancellation.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

fn summarise(records: &[ErrorRecord]) -> String {
    match records {
        [] => String::from("no error records"),
        [only] => only.message.clone(),
        [first, rest @ ..] => format!("{} (and {} more)", first.message, rest.len()),
    }
}

/// Startup phase that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupPhase {
    /// Configuration values were rejected.
    Configuration,
    /// The pipeline thread could not be spawned.
    PipelineThread,
    /// The session runspace could not be created or opened.
    RunspaceOpen,
    /// The first engine instance could not be created.
    EngineCreation,
    /// No usable breakpoint API was found.
    BreakpointApi,
    /// A required module failed to import.
    ModuleImport,
}

impl fmt::Display for StartupPhase {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Configuration => "configuration",
            Self::PipelineThread => "pipeline thread",
            Self::RunspaceOpen => "runspace open",
            Self::EngineCreation => "engine creation",
            Self::BreakpointApi => "breakpoint API selection",
            Self::ModuleImport => "module import",
        };
        formatter.write_str(label)
    }
}

/// Fatal errors raised while starting a session.
#[derive(Debug, Error)]
#[error("session startup failed during {phase}: {message}")]
pub struct StartupError {
    /// Phase that failed.
    pub phase: StartupPhase,
    /// Human-readable reason.
    pub message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl StartupError {
    pub(crate) fn new(phase: StartupPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn engine(phase: StartupPhase, source: EngineError) -> Self {
        Self {
            phase,
            message: source.message().to_owned(),
            source: Some(Box::new(source)),
        }
    }

    pub(crate) fn execution(phase: StartupPhase, source: ExecutionError) -> Self {
        Self {
            phase,
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }
}

/// Errors raised by breakpoint operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BreakpointError {
    /// The breakpoint kind cannot be set through the runspace debugger.
    #[error("breakpoint kind '{kind}' is not supported")]
    UnsupportedKind {
        /// Kind named by the request.
        kind: String,
    },
    /// The engine does not expose the breakpoint API its version requires.
    #[error("the engine does not provide a breakpoint API for PowerShell {version}")]
    ApiUnavailable {
        /// Engine version that was probed.
        version: String,
    },
    /// A hit condition was not an integer.
    #[error("hit count '{value}' is not an integer")]
    InvalidHitCount {
        /// Rejected hit condition.
        value: String,
    },
    /// The request could not be executed on the pipeline thread.
    #[error("breakpoint request failed: {0}")]
    Execution(#[from] ExecutionError),
}

/// Errors raised by debugger inspection and control operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContextError {
    /// The operation needs the debugger to be stopped.
    #[error("the debugger is not stopped")]
    NotStopped,
    /// No variable container or expandable variable has this id.
    #[error("no variable container with id {id}")]
    UnknownContainer {
        /// Requested id.
        id: u32,
    },
    /// No stack frame has this index.
    #[error("no stack frame at index {index}")]
    UnknownFrame {
        /// Requested index.
        index: usize,
    },
    /// The request could not be executed on the pipeline thread.
    #[error("context request failed: {0}")]
    Execution(#[from] ExecutionError),
}
