//! Abstractions over the hosted PowerShell engine.
//!
//! The engine object graph is not thread-safe: every [`Engine`] method is
//! called from the pipeline thread only. [`Runspace`] handles are shared and
//! may report state changes from any thread.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Identifier the engine assigns to a runspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunspaceId(pub u32);

impl fmt::Display for RunspaceId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "runspace-{}", self.0)
    }
}

/// Where a runspace lives relative to the host process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunspaceOrigin {
    /// The session runspace created by the host.
    Local,
    /// A runspace reached through `Enter-PSSession`.
    PSSession,
    /// A runspace of another local process reached through `Enter-PSHostProcess`.
    EnteredProcess,
    /// A runspace attached through `Debug-Runspace`.
    DebuggedRunspace,
}

impl RunspaceOrigin {
    /// Whether invocations against the runspace render output asynchronously.
    #[must_use]
    pub fn is_remote(self) -> bool {
        !matches!(self, Self::Local)
    }
}

/// Availability reported by a runspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunspaceState {
    /// Created but not opened yet.
    BeforeOpen,
    /// Opening is in progress.
    Opening,
    /// Ready for invocations.
    Opened,
    /// Closing is in progress.
    Closing,
    /// Closed by its owner.
    Closed,
    /// Failed and can no longer run commands.
    Broken,
    /// A remote runspace is disconnecting.
    Disconnecting,
    /// A remote runspace lost its connection.
    Disconnected,
    /// A remote runspace is reconnecting.
    Connecting,
}

impl RunspaceState {
    /// Whether commands can still run against the runspace.
    #[must_use]
    pub fn is_usable(self) -> bool {
        !matches!(
            self,
            Self::Broken | Self::Closed | Self::Closing | Self::Disconnecting | Self::Disconnected
        )
    }
}

/// How a [`Command`] is presented to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    /// Free-form script text.
    Script,
    /// A single command invocation with named parameters.
    Command,
}

/// Unit of script submitted for execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    kind: CommandKind,
    text: String,
    parameters: Vec<(String, Option<Value>)>,
}

impl Command {
    /// Builds a command from script text.
    #[must_use]
    pub fn script(text: impl Into<String>) -> Self {
        Self {
            kind: CommandKind::Script,
            text: text.into(),
            parameters: Vec::new(),
        }
    }

    /// Builds an invocation of a named command.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            kind: CommandKind::Command,
            text: name.into(),
            parameters: Vec::new(),
        }
    }

    /// Adds a named parameter with a value.
    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.push((name.into(), Some(value.into())));
        self
    }

    /// Adds a switch parameter.
    #[must_use]
    pub fn with_switch(mut self, name: impl Into<String>) -> Self {
        self.parameters.push((name.into(), None));
        self
    }

    /// Whether this is script text or a named command.
    #[must_use]
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Script text or command name.
    #[must_use]
    pub fn text(&self) -> &str {
        self.text.as_str()
    }

    /// Named parameters in insertion order; `None` marks a switch.
    #[must_use]
    pub fn parameters(&self) -> &[(String, Option<Value>)] {
        self.parameters.as_slice()
    }

    /// Looks up a parameter value by case-insensitive name.
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .and_then(|(_, value)| value.as_ref())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.text)?;
        for (name, value) in &self.parameters {
            match value {
                None => write!(formatter, " -{name}")?,
                Some(Value::String(text)) => {
                    write!(formatter, " -{name} '{}'", text.replace('\'', "''"))?;
                }
                Some(Value::Bool(true)) => write!(formatter, " -{name}:$true")?,
                Some(Value::Bool(false)) => write!(formatter, " -{name}:$false")?,
                Some(other) => write!(formatter, " -{name} {other}")?,
            }
        }
        Ok(())
    }
}

/// Host streams an invocation may write to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputStream {
    /// Success output rendered by `Out-Default`.
    Output,
    /// Error records.
    Error,
    /// `Write-Warning` messages.
    Warning,
    /// `Write-Verbose` messages.
    Verbose,
    /// `Write-Debug` messages.
    Debug,
    /// `Write-Information` and `Write-Host` messages.
    Information,
}

/// Sink receiving text rendered by the engine while an invocation runs.
pub trait HostOutput {
    /// Writes one rendered line.
    fn write(&self, stream: OutputStream, text: &str);
}

/// Host that drops everything written to it.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SilentHost;

impl HostOutput for SilentHost {
    fn write(&self, _stream: OutputStream, _text: &str) {}
}

/// Per-invocation settings handed to the engine.
pub struct Invocation<'a> {
    /// Signalled when the invocation should stop early.
    pub cancellation: &'a CancellationToken,
    /// Receives rendered output.
    pub host: &'a dyn HostOutput,
    /// Whether success output is rendered to the host.
    pub write_output_to_host: bool,
    /// Whether the command is recorded in the session history.
    pub add_to_history: bool,
}

/// Error record produced by user script content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Rendered exception message.
    pub message: String,
    /// Engine error identifier, when present.
    pub fully_qualified_error_id: Option<String>,
    /// Script position of the failure, when known.
    pub script_position: Option<String>,
}

impl ErrorRecord {
    /// Builds a record carrying only a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fully_qualified_error_id: None,
            script_position: None,
        }
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.message)
    }
}

/// Failures reported by [`Engine`] invocations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvocationError {
    /// User script content raised terminating errors.
    #[error("script raised {} error record(s)", .records.len())]
    Script {
        /// Records raised by the script.
        records: Vec<ErrorRecord>,
    },
    /// The pipeline was stopped before completion.
    #[error("pipeline stopped")]
    Stopped,
    /// The runspace cannot run commands any more.
    #[error("runspace is {state:?}")]
    RunspaceUnusable {
        /// State reported by the runspace.
        state: RunspaceState,
    },
    /// The engine failed outside user script content.
    #[error("engine fault: {0}")]
    Fault(String),
}

/// Action the engine takes when a debugger stop handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebuggerResumeAction {
    /// Run until the next breakpoint.
    Continue,
    /// Step into the next statement.
    StepInto,
    /// Step out of the current function.
    StepOut,
    /// Step over the next statement.
    StepOver,
    /// Stop the running pipeline.
    Stop,
}

impl fmt::Display for DebuggerResumeAction {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Continue => "continue",
            Self::StepInto => "stepInto",
            Self::StepOut => "stepOut",
            Self::StepOver => "stepOver",
            Self::Stop => "stop",
        };
        formatter.write_str(label)
    }
}

/// Results of a command typed at a debugger prompt.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DebuggerCommandResults {
    /// Output produced by the command.
    pub values: Vec<Value>,
    /// Set when the command resumes execution (`c`, `s`, `v`, `o`, `q`).
    pub resume_action: Option<DebuggerResumeAction>,
}

/// Raised by the engine when execution stops in the debugger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebuggerStopEvent {
    /// Script being executed, absent for interactive input.
    pub script_path: Option<PathBuf>,
    /// One-based line of the current statement.
    pub line: u32,
    /// One-based column of the current statement.
    pub column: u32,
    /// Breakpoints hit by this stop.
    pub breakpoint_ids: Vec<u32>,
    /// Name of the command that was executing.
    pub invocation_name: Option<String>,
}

/// Breakpoint as represented by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineBreakpoint {
    /// Engine-assigned breakpoint id.
    pub id: u32,
    /// Breakpoint location.
    pub kind: EngineBreakpointKind,
    /// Whether the breakpoint is enabled.
    pub enabled: bool,
    /// Action script attached to the breakpoint.
    pub action: Option<String>,
    /// Number of times the breakpoint was hit.
    pub hit_count: u32,
}

/// Location of an [`EngineBreakpoint`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineBreakpointKind {
    /// Stops at a script line.
    Line {
        /// Script containing the line.
        script: PathBuf,
        /// One-based line.
        line: u32,
        /// One-based column, when targeted.
        column: Option<u32>,
    },
    /// Stops when a command is invoked.
    Command {
        /// Command name or wildcard.
        name: String,
        /// Script restricting where the command is matched.
        script: Option<PathBuf>,
    },
    /// Stops when a variable is accessed.
    Variable {
        /// Variable name without `$`.
        name: String,
    },
}

/// Change reported for a breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakpointUpdateKind {
    /// The breakpoint was created.
    Set,
    /// The breakpoint was deleted.
    Removed,
    /// The breakpoint was enabled.
    Enabled,
    /// The breakpoint was disabled.
    Disabled,
}

/// Raised when a breakpoint changes inside the runspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointUpdatedEvent {
    /// Breakpoint after the change.
    pub breakpoint: EngineBreakpoint,
    /// Kind of change.
    pub kind: BreakpointUpdateKind,
}

/// Variable scope queried when building debugger snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VariableScope {
    /// The scope of the current statement.
    Local,
    /// The scope of the current script.
    Script,
    /// The session scope.
    Global,
}

impl VariableScope {
    /// Scope name as presented to users.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "Local",
            Self::Script => "Script",
            Self::Global => "Global",
        }
    }
}

/// Variable read from the engine's variable table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineVariable {
    /// Variable name without `$`.
    pub name: String,
    /// Projected value.
    pub value: Value,
    /// .NET type name of the value, when known.
    pub type_name: Option<String>,
}

/// Entry of the engine's live call stack, innermost first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStackFrame {
    /// Function or script block name.
    pub function_name: String,
    /// Script being executed, absent for interactive input.
    pub script_path: Option<PathBuf>,
    /// One-based line of the current statement.
    pub line: u32,
    /// One-based column of the current statement.
    pub column: u32,
    /// Variables local to the frame.
    pub locals: Vec<EngineVariable>,
}

/// Native breakpoint operations exposed by newer engines.
pub trait EngineDebugger {
    /// Sets a line breakpoint.
    fn set_line_breakpoint(
        &mut self,
        script: &Path,
        line: u32,
        column: Option<u32>,
        action: Option<&str>,
    ) -> Result<EngineBreakpoint, InvocationError>;

    /// Sets a command breakpoint.
    fn set_command_breakpoint(
        &mut self,
        name: &str,
        script: Option<&Path>,
        action: Option<&str>,
    ) -> Result<EngineBreakpoint, InvocationError>;

    /// Lists breakpoints in the runspace.
    fn breakpoints(&mut self) -> Result<Vec<EngineBreakpoint>, InvocationError>;

    /// Removes a breakpoint, returning whether it existed.
    fn remove_breakpoint(&mut self, id: u32) -> Result<bool, InvocationError>;
}

/// One engine instance bound to a runspace.
pub trait Engine: Send {
    /// Runspace the engine invokes against.
    fn runspace(&self) -> Arc<dyn Runspace>;

    /// Runs a command to completion.
    fn invoke(
        &mut self,
        command: &Command,
        invocation: &Invocation<'_>,
    ) -> Result<Vec<Value>, InvocationError>;

    /// Runs a command typed while the debugger is stopped.
    fn process_debugger_command(
        &mut self,
        command: &Command,
        invocation: &Invocation<'_>,
    ) -> Result<DebuggerCommandResults, InvocationError>;

    /// Reads the live call stack while the debugger is stopped.
    fn call_stack(&mut self) -> Result<Vec<EngineStackFrame>, InvocationError>;

    /// Reads variables of a scope while the debugger is stopped.
    fn variables(&mut self, scope: VariableScope) -> Result<Vec<EngineVariable>, InvocationError>;

    /// Waits until output of remote invocations has been rendered.
    fn synchronize_output(&mut self) -> Result<(), InvocationError> {
        Ok(())
    }

    /// Native breakpoint API, when the engine provides one.
    fn debugger_api(&mut self) -> Option<&mut dyn EngineDebugger> {
        None
    }

    /// Releases the engine instance.
    fn dispose(&mut self) {}
}

impl fmt::Debug for dyn Engine {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("Engine")
    }
}

/// Token identifying a registered [`RunspaceEventHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Receives events raised by a runspace.
pub trait RunspaceEventHandler: Send + Sync {
    /// Called on the pipeline thread when execution stops in the debugger;
    /// the engine resumes with the returned action once this returns.
    fn debugger_stop(&self, event: &DebuggerStopEvent) -> DebuggerResumeAction;

    /// Called when a breakpoint changes.
    fn breakpoint_updated(&self, event: &BreakpointUpdatedEvent);

    /// Called from any thread when the runspace changes state.
    fn state_changed(&self, runspace: RunspaceId, state: RunspaceState);
}

/// Execution environment shared by engine instances.
///
/// Implementations must not invoke handlers synchronously from within
/// [`Runspace::subscribe`] or [`Runspace::unsubscribe`].
pub trait Runspace: Send + Sync {
    /// Engine-assigned identifier.
    fn id(&self) -> RunspaceId;

    /// Where the runspace lives.
    fn origin(&self) -> RunspaceOrigin;

    /// Remote computer name, for remote runspaces.
    fn computer_name(&self) -> Option<String> {
        None
    }

    /// Current state.
    fn state(&self) -> RunspaceState;

    /// Opens the runspace.
    fn open(&self) -> Result<(), EngineError>;

    /// Registers an event handler.
    fn subscribe(&self, handler: Arc<dyn RunspaceEventHandler>) -> SubscriptionId;

    /// Removes a handler registered by [`Runspace::subscribe`].
    fn unsubscribe(&self, id: SubscriptionId);
}

impl fmt::Debug for dyn Runspace {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "Runspace({}, {:?})", self.id(), self.origin())
    }
}

/// Creates runspaces and engine instances.
pub trait EngineFactory: Send + Sync {
    /// Creates the local session runspace; it is opened by the caller.
    fn create_runspace(&self) -> Result<Arc<dyn Runspace>, EngineError>;

    /// Creates a new engine instance bound to `runspace`.
    fn create_engine(&self, runspace: &Arc<dyn Runspace>) -> Result<Box<dyn Engine>, EngineError>;
}

/// Console line reader driven by the interactive prompt.
pub trait ReadLine: Send + Sync {
    /// Reads one line; returns `None` once `cancellation` is signalled.
    fn read_line(
        &self,
        prompt: &str,
        cancellation: &CancellationToken,
    ) -> Result<Option<String>, EngineError>;
}

/// Errors reported while creating or opening engine objects.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct EngineError {
    message: String,
}

impl EngineError {
    /// Builds an error from a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Human-friendly description.
    #[must_use]
    pub fn message(&self) -> &str {
        self.message.as_str()
    }
}
