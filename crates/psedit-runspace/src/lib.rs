//! PowerShell runspace execution core for the editor services host.
//!
//! Every engine invocation runs on one dedicated pipeline thread. Callers on
//! other threads queue requests and receive a [`TaskHandle`]. The pipeline
//! thread services a stack of frames: nested prompts, debugger stops and
//! entered remote runspaces each push a frame and keep draining the queue
//! until they are popped. The engine itself sits behind the [`Engine`],
//! [`Runspace`] and [`EngineFactory`] traits so hosts and tests can supply
//! their own implementations.

#![deny(missing_docs)]

mod breakpoints;
mod cache;
mod cancellation;
mod context;
mod debugging;
mod engine;
mod errors;
mod executor;
mod frame;
mod observer;
mod options;
mod subscription;
pub mod telemetry;
mod version;

pub use breakpoints::{
    BreakpointApi, BreakpointOptions, BreakpointService, BreakpointSpec, NativeBreakpointApi,
    ScriptBreakpointApi, select_breakpoint_api,
};
pub use cache::{CommandInfo, SessionCache};
pub use cancellation::{CancellationContext, CancellationScope, ScopeId};
pub use context::{ExecutionOutput, PowerShellContext};
pub use debugging::{
    BreakpointDetails, BreakpointDetailsBase, DebuggerStopped, NO_FILE, StackFrameDetails,
    VariableContainerDetails, VariableDetails,
};
pub use engine::{
    BreakpointUpdateKind, BreakpointUpdatedEvent, Command, CommandKind, DebuggerCommandResults,
    DebuggerResumeAction, DebuggerStopEvent, Engine, EngineBreakpoint, EngineBreakpointKind,
    EngineDebugger, EngineError, EngineFactory, EngineStackFrame, EngineVariable, ErrorRecord,
    HostOutput, Invocation, InvocationError, OutputStream, ReadLine, Runspace,
    RunspaceEventHandler, RunspaceId, RunspaceOrigin, RunspaceState, SubscriptionId,
    VariableScope,
};
pub use errors::{BreakpointError, ContextError, ExecutionError, StartupError, StartupPhase};
pub use executor::{
    ExecutorSettings, PipelineThreadExecutor, RequestId, TaskContext, TaskHandle,
};
pub use frame::{FrameId, PowerShellFrameType, RunspaceInfo};
pub use observer::{RunspaceChangeKind, SessionObserver, StructuredSessionObserver};
pub use options::{ExecutionOptions, ExecutionPriority};
pub use version::{
    PowerShellEdition, PowerShellVersion, PowerShellVersionDetails, ProcessArchitecture,
    VERSION_QUERY,
};

#[cfg(test)]
mod tests;
