//! Reactions to events raised by the subscribed runspace.

use std::sync::Weak;

use crate::debugging::{DebuggerSnapshot, DebuggerStopped};
use crate::engine::{
    BreakpointUpdatedEvent, DebuggerResumeAction, DebuggerStopEvent, RunspaceEventHandler,
    RunspaceId, RunspaceState,
};
use crate::executor::LoopExit;
use crate::frame::{PowerShellContextFrame, PowerShellFrameType};

use super::{CONTEXT_TARGET, ContextShared, StopState};

/// Registered with the top frame's runspace; forwards to the context while
/// it is alive.
pub(super) struct ContextEventHandler {
    context: Weak<ContextShared>,
}

impl ContextEventHandler {
    pub(super) fn new(context: Weak<ContextShared>) -> Self {
        Self { context }
    }
}

impl RunspaceEventHandler for ContextEventHandler {
    fn debugger_stop(&self, event: &DebuggerStopEvent) -> DebuggerResumeAction {
        match self.context.upgrade() {
            Some(context) => context.on_debugger_stop(event),
            None => DebuggerResumeAction::Continue,
        }
    }

    fn breakpoint_updated(&self, event: &BreakpointUpdatedEvent) {
        if let Some(context) = self.context.upgrade() {
            context.observer.breakpoint_updated(event);
        }
    }

    fn state_changed(&self, runspace: RunspaceId, state: RunspaceState) {
        if let Some(context) = self.context.upgrade() {
            context.on_state_changed(runspace, state);
        }
    }
}

impl ContextShared {
    /// Services a debug frame until a resume action is chosen.
    ///
    /// Runs on the pipeline thread, nested inside the request whose script
    /// hit the stop, and returns the action the engine should take.
    pub(super) fn on_debugger_stop(&self, event: &DebuggerStopEvent) -> DebuggerResumeAction {
        if !self.executor.is_pipeline_thread() {
            tracing::warn!(
                target: CONTEXT_TARGET,
                "debugger stop raised off the pipeline thread; continuing"
            );
            return DebuggerResumeAction::Continue;
        }
        let Some((_, outer_type, runspace)) = self.executor.current_frame() else {
            return DebuggerResumeAction::Continue;
        };
        let mut engine = match self.factory.create_engine(runspace.runspace()) {
            Ok(engine) => engine,
            Err(error) => {
                tracing::warn!(
                    target: CONTEXT_TARGET,
                    error = %error,
                    "could not create an engine for the debugger prompt; continuing"
                );
                return DebuggerResumeAction::Continue;
            }
        };

        let workspace_root = self
            .config
            .workspace_root
            .as_deref()
            .map(|root| root.as_std_path());
        let snapshot = DebuggerSnapshot::capture(engine.as_mut(), workspace_root);

        let mut frame_type = PowerShellFrameType::NESTED | PowerShellFrameType::DEBUG;
        if outer_type.contains(PowerShellFrameType::REMOTE) || runspace.origin().is_remote() {
            frame_type = frame_type | PowerShellFrameType::REMOTE;
        }
        let frame = PowerShellContextFrame::new(Some(engine), runspace.clone(), frame_type);
        let frame_id = match self.push_frame(frame) {
            Ok(frame_id) => frame_id,
            Err(error) => {
                tracing::warn!(
                    target: CONTEXT_TARGET,
                    error = %error,
                    "could not push a debug frame; continuing"
                );
                return DebuggerResumeAction::Continue;
            }
        };

        let stopped = DebuggerStopped {
            event: event.clone(),
            call_stack: snapshot.call_stack().to_vec(),
            runspace: runspace.id(),
            is_remote: frame_type.contains(PowerShellFrameType::REMOTE),
            frame_depth: self.executor.frame_depth(),
        };
        self.lock_stops().push(StopState {
            frame_id,
            snapshot,
            resume_action: None,
        });
        self.observer.debugger_stopped(&stopped);

        let exit = self.executor.run_frame_loop(frame_id);

        let recorded = {
            let mut stops = self.lock_stops();
            stops
                .iter()
                .rposition(|stop| stop.frame_id == frame_id)
                .map(|position| stops.remove(position))
                .and_then(|stop| stop.resume_action)
        };
        let action = recorded.unwrap_or(match exit {
            LoopExit::ExitRequested | LoopExit::Popped => DebuggerResumeAction::Continue,
            LoopExit::Shutdown | LoopExit::RunspaceUnusable => DebuggerResumeAction::Stop,
        });
        self.pop_frame(frame_id);
        tracing::debug!(
            target: CONTEXT_TARGET,
            frame = %frame_id,
            exit = ?exit,
            action = %action,
            "debugger stop finished"
        );
        action
    }

    pub(super) fn on_state_changed(&self, runspace: RunspaceId, state: RunspaceState) {
        tracing::debug!(
            target: CONTEXT_TARGET,
            runspace = %runspace,
            state = ?state,
            "runspace state changed"
        );
        if state.is_usable() {
            return;
        }
        let marked = self.executor.mark_unusable_frames();
        if marked > 0 {
            tracing::warn!(
                target: CONTEXT_TARGET,
                runspace = %runspace,
                frames = marked,
                "runspace became unusable; unwinding frames"
            );
        }
    }
}
