//! Session orchestrator: owns the frame stack's lifecycle and the inbound
//! API used by protocol handlers.
//!
//! The context reacts to runspace events (debugger stops, breakpoint changes,
//! state changes), pushes and pops frames in response, and publishes
//! outbound notifications through a [`SessionObserver`].

mod events;
mod execution;
mod startup;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::JoinHandle;

use psedit_config::Config;

use crate::breakpoints::{BreakpointService, BreakpointSpec};
use crate::cache::{CommandInfo, SessionCache};
use crate::debugging::{
    BreakpointDetails, DebuggerSnapshot, StackFrameDetails, VariableContainerDetails,
    VariableDetails,
};
use crate::engine::{
    Command, DebuggerCommandResults, DebuggerResumeAction, EngineFactory, Runspace,
    RunspaceEventHandler,
};
use crate::errors::{BreakpointError, ContextError, ExecutionError};
use crate::executor::{PipelineThreadExecutor, TaskContext, TaskHandle};
use crate::frame::{FrameId, PowerShellContextFrame, PowerShellFrameType, RunspaceInfo};
use crate::observer::{RunspaceChangeKind, SessionObserver};
use crate::options::ExecutionOptions;
use crate::subscription::RunspaceSubscription;

pub use execution::ExecutionOutput;

use events::ContextEventHandler;

const CONTEXT_TARGET: &str = "psedit_runspace::context";

struct StopState {
    frame_id: FrameId,
    snapshot: DebuggerSnapshot,
    resume_action: Option<DebuggerResumeAction>,
}

pub(crate) struct ContextShared {
    executor: PipelineThreadExecutor,
    factory: Arc<dyn EngineFactory>,
    observer: Arc<dyn SessionObserver>,
    config: Config,
    cache: SessionCache,
    subscription: Mutex<Option<RunspaceSubscription>>,
    stops: Mutex<Vec<StopState>>,
    pipeline: Mutex<Option<JoinHandle<()>>>,
    ended: AtomicBool,
    this: Weak<ContextShared>,
}

/// Handle to a running session. Clones share the same session.
#[derive(Clone)]
pub struct PowerShellContext {
    shared: Arc<ContextShared>,
}

impl PowerShellContext {
    /// Queues a command for the pipeline thread.
    ///
    /// While the debugger is stopped the command only runs when `options`
    /// allow it; it is then evaluated at the debugger prompt.
    pub fn execute_command(
        &self,
        command: Command,
        options: ExecutionOptions,
    ) -> TaskHandle<ExecutionOutput> {
        let shared = Arc::clone(&self.shared);
        self.shared.executor.submit(options, move |context| {
            shared.run_command(context, &command, &options)
        })
    }

    /// Queues arbitrary work that needs the current frame's engine.
    pub fn submit_delegate<T, F>(&self, options: ExecutionOptions, work: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut TaskContext<'_>) -> Result<T, ExecutionError> + Send + 'static,
    {
        self.shared.executor.submit(options, work)
    }

    /// Pushes a frame for `runspace` and services it until
    /// [`PowerShellContext::set_should_exit`] is called or the runspace
    /// breaks. The handle resolves when the frame is popped.
    pub fn enter_runspace(&self, runspace: Arc<dyn Runspace>) -> TaskHandle<()> {
        let shared = Arc::clone(&self.shared);
        self.shared
            .executor
            .submit(ExecutionOptions::default(), move |context| {
                shared.run_remote_frame(context, runspace)
            })
    }

    /// Cancels the innermost running request or interactive read.
    pub fn cancel_current_task(&self) {
        self.shared.executor.cancel_current_task();
    }

    /// Asks the top frame to exit. Ignored when only the session frame is
    /// left; returns whether a frame was asked to exit.
    pub fn set_should_exit(&self) -> bool {
        match self.shared.executor.request_top_exit() {
            Some((frame_id, frame_type)) => {
                if frame_type.is_interactive() {
                    self.shared.executor.cancellation().cancel_idle_parent_task();
                }
                tracing::debug!(
                    target: CONTEXT_TARGET,
                    frame = %frame_id,
                    frame_type = %frame_type,
                    "frame asked to exit"
                );
                true
            }
            None => {
                tracing::debug!(
                    target: CONTEXT_TARGET,
                    "ignoring exit request for the session frame"
                );
                false
            }
        }
    }

    /// Records `action` for the current debugger stop and lets execution
    /// resume.
    pub fn resume_debugger(&self, action: DebuggerResumeAction) -> Result<(), ContextError> {
        self.shared.resume_debugger(action)
    }

    /// Resumes the debugger when a debugger command produced a resume action.
    ///
    /// Returns whether execution is resuming.
    pub fn process_debugger_result(
        &self,
        results: &DebuggerCommandResults,
    ) -> Result<bool, ContextError> {
        match results.resume_action {
            Some(action) => self.shared.resume_debugger(action).map(|()| true),
            None => Ok(false),
        }
    }

    /// Whether execution is stopped in the debugger.
    #[must_use]
    pub fn is_debugger_stopped(&self) -> bool {
        !self.shared.lock_stops().is_empty()
    }

    /// Call stack of the current debugger stop.
    pub fn call_stack(&self) -> Result<Vec<StackFrameDetails>, ContextError> {
        let stops = self.shared.lock_stops();
        let stop = stops.last().ok_or(ContextError::NotStopped)?;
        Ok(stop.snapshot.call_stack().to_vec())
    }

    /// Variable containers visible from a stack frame of the current stop.
    pub fn variable_scopes(
        &self,
        frame_index: usize,
    ) -> Result<Vec<VariableContainerDetails>, ContextError> {
        let stops = self.shared.lock_stops();
        let stop = stops.last().ok_or(ContextError::NotStopped)?;
        stop.snapshot.variable_scopes(frame_index)
    }

    /// Variables of a container, or children of an expandable variable.
    pub fn variables(&self, id: u32) -> Result<Vec<VariableDetails>, ContextError> {
        let mut stops = self.shared.lock_stops();
        let stop = stops.last_mut().ok_or(ContextError::NotStopped)?;
        stop.snapshot.variables(id)
    }

    /// Sets breakpoints and waits for one detail per spec, in order.
    ///
    /// Must not be called from the pipeline thread.
    pub fn set_breakpoints(
        &self,
        specs: Vec<BreakpointSpec>,
    ) -> Result<Vec<BreakpointDetails>, BreakpointError> {
        if let Some(spec) = specs
            .iter()
            .find(|spec| !matches!(spec, BreakpointSpec::Line { .. } | BreakpointSpec::Command { .. }))
        {
            return Err(BreakpointError::UnsupportedKind {
                kind: spec.kind_name().to_owned(),
            });
        }
        let service = self.breakpoint_service()?;
        self.run_breakpoint_request(move |context| {
            let token = context.cancellation().clone();
            service.set_breakpoints(context.engine(), &token, &specs)
        })
    }

    /// Lists line and command breakpoints in the current runspace.
    pub fn breakpoints(&self) -> Result<Vec<BreakpointDetails>, BreakpointError> {
        let service = self.breakpoint_service()?;
        self.run_breakpoint_request(move |context| {
            let token = context.cancellation().clone();
            service.get_breakpoints(context.engine(), &token)
        })
    }

    /// Removes a breakpoint, returning whether it existed.
    pub fn remove_breakpoint(&self, id: u32) -> Result<bool, BreakpointError> {
        let service = self.breakpoint_service()?;
        self.run_breakpoint_request(move |context| {
            let token = context.cancellation().clone();
            service.remove_breakpoint(context.engine(), &token, id)
        })
    }

    /// Resolves a command through the session cache.
    pub fn command_info(&self, name: &str) -> Result<Option<CommandInfo>, ExecutionError> {
        self.ensure_off_pipeline()?;
        let shared = Arc::clone(&self.shared);
        let name = name.to_owned();
        self.shared
            .executor
            .submit(ExecutionOptions::default().in_debugger(), move |context| {
                let token = context.cancellation().clone();
                shared
                    .cache
                    .command_info(context.engine(), &token, &name)
                    .map_err(ExecutionError::from_invocation)
            })
            .wait()
    }

    /// Resolves a command's help synopsis through the session cache.
    pub fn command_synopsis(&self, name: &str) -> Result<Option<String>, ExecutionError> {
        self.ensure_off_pipeline()?;
        let shared = Arc::clone(&self.shared);
        let name = name.to_owned();
        self.shared
            .executor
            .submit(ExecutionOptions::default().in_debugger(), move |context| {
                let token = context.cancellation().clone();
                shared
                    .cache
                    .command_synopsis(context.engine(), &token, &name)
                    .map_err(ExecutionError::from_invocation)
            })
            .wait()
    }

    /// Type of the top frame.
    #[must_use]
    pub fn current_frame_type(&self) -> Option<PowerShellFrameType> {
        self.shared.executor.current_frame_type()
    }

    /// Number of frames on the stack.
    #[must_use]
    pub fn frame_depth(&self) -> usize {
        self.shared.executor.frame_depth()
    }

    /// Runspace of the top frame.
    #[must_use]
    pub fn runspace_info(&self) -> Option<RunspaceInfo> {
        self.shared.executor.current_runspace()
    }

    /// Configuration the session was started with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Whether the session has ended or been shut down.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.shared.ended.load(Ordering::Acquire) && !self.shared.executor.is_shut_down()
    }

    /// Stops the pipeline thread, resolving queued requests with
    /// [`ExecutionError::ShuttingDown`], and waits for it to exit.
    pub fn shutdown(&self) {
        self.shared.executor.shutdown();
        let handle = self
            .shared
            .pipeline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if self.shared.executor.is_pipeline_thread() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!(target: CONTEXT_TARGET, "pipeline thread panicked");
            }
        }
    }

    fn ensure_off_pipeline(&self) -> Result<(), ExecutionError> {
        if self.shared.executor.is_pipeline_thread() {
            Err(ExecutionError::Reentrant)
        } else {
            Ok(())
        }
    }

    fn breakpoint_service(&self) -> Result<Arc<BreakpointService>, BreakpointError> {
        self.shared
            .cache
            .breakpoints()
            .ok_or_else(|| BreakpointError::ApiUnavailable {
                version: self
                    .runspace_info()
                    .map_or_else(|| String::from("unknown"), |info| info.version().version.to_string()),
            })
    }

    fn run_breakpoint_request<T, F>(&self, work: F) -> Result<T, BreakpointError>
    where
        T: Send + 'static,
        F: FnOnce(&mut TaskContext<'_>) -> Result<T, BreakpointError> + Send + 'static,
    {
        self.ensure_off_pipeline()?;
        self.shared
            .executor
            .submit(ExecutionOptions::default().in_debugger(), move |context| {
                Ok(work(context))
            })
            .wait()?
    }
}

impl std::fmt::Debug for PowerShellContext {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("PowerShellContext")
            .field("frame_depth", &self.frame_depth())
            .field("frame_type", &self.current_frame_type())
            .finish_non_exhaustive()
    }
}

impl ContextShared {
    fn lock_stops(&self) -> MutexGuard<'_, Vec<StopState>> {
        self.stops.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn event_handler(&self) -> Arc<dyn RunspaceEventHandler> {
        Arc::new(ContextEventHandler::new(self.this.clone()))
    }

    /// Pushes a frame and moves the runspace subscription to it.
    fn push_frame(&self, frame: PowerShellContextFrame) -> Result<FrameId, ExecutionError> {
        let previous = self.executor.current_runspace().map(|info| info.id());
        let runspace = frame.runspace().clone();
        let frame_id = self.executor.push_frame(frame)?;
        self.rebind_subscription();
        if previous.is_some_and(|id| id != runspace.id()) {
            self.observer
                .runspace_changed(RunspaceChangeKind::Entered, &runspace);
        }
        Ok(frame_id)
    }

    /// Pops a frame, releasing its subscription before the new top frame's
    /// subscription is acquired, then disposes the frame's engine.
    fn pop_frame(&self, frame_id: FrameId) {
        let Some(frame) = self.executor.pop_frame(frame_id) else {
            return;
        };
        self.rebind_subscription();
        if let Some(top) = self.executor.current_runspace() {
            if top.id() != frame.runspace().id() {
                self.observer
                    .runspace_changed(RunspaceChangeKind::Exited, &top);
            }
        }
        drop(frame);
    }

    fn rebind_subscription(&self) {
        let mut slot = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        drop(slot.take());
        if let Some(top) = self.executor.current_runspace() {
            *slot = Some(RunspaceSubscription::acquire(
                Arc::clone(top.runspace()),
                self.event_handler(),
            ));
        }
    }

    fn resume_debugger(&self, action: DebuggerResumeAction) -> Result<(), ContextError> {
        let frame_id = {
            let mut stops = self.lock_stops();
            let stop = stops.last_mut().ok_or(ContextError::NotStopped)?;
            stop.resume_action = Some(action);
            stop.frame_id
        };
        self.executor.request_exit(frame_id);
        self.executor.cancellation().cancel_idle_parent_task();
        tracing::debug!(
            target: CONTEXT_TARGET,
            frame = %frame_id,
            action = %action,
            "debugger resume requested"
        );
        self.observer.debugger_resuming(action);
        Ok(())
    }

    fn end_session(&self, reason: &str) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        self.observer.session_ended(reason);
        self.executor.shutdown();
    }
}
