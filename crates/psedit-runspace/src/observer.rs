//! Outbound notifications raised by a running session.

use std::sync::Arc;

use crate::debugging::DebuggerStopped;
use crate::engine::{BreakpointUpdatedEvent, DebuggerResumeAction, OutputStream};
use crate::frame::RunspaceInfo;

/// How the runspace at the top of the frame stack changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunspaceChangeKind {
    /// A frame bound to another runspace was pushed.
    Entered,
    /// The frame bound to the previous runspace was popped.
    Exited,
}

/// Observer used to surface session events to the editor and to telemetry.
pub trait SessionObserver: Send + Sync {
    /// Invoked for every line rendered to the host.
    fn output(&self, stream: OutputStream, text: &str);

    /// Invoked after the debug frame for a stop was pushed.
    fn debugger_stopped(&self, stopped: &DebuggerStopped);

    /// Invoked when a resume action was recorded for the current stop.
    fn debugger_resuming(&self, action: DebuggerResumeAction);

    /// Invoked when a breakpoint changed inside the runspace.
    fn breakpoint_updated(&self, event: &BreakpointUpdatedEvent);

    /// Invoked when the top frame moved to a different runspace.
    fn runspace_changed(&self, kind: RunspaceChangeKind, runspace: &RunspaceInfo);

    /// Invoked after a broken session runspace was replaced.
    fn runspace_reinitialised(&self, runspace: &RunspaceInfo);

    /// Invoked once when the session cannot continue.
    fn session_ended(&self, reason: &str);
}

impl<T> SessionObserver for Arc<T>
where
    T: SessionObserver + ?Sized,
{
    fn output(&self, stream: OutputStream, text: &str) {
        (**self).output(stream, text);
    }

    fn debugger_stopped(&self, stopped: &DebuggerStopped) {
        (**self).debugger_stopped(stopped);
    }

    fn debugger_resuming(&self, action: DebuggerResumeAction) {
        (**self).debugger_resuming(action);
    }

    fn breakpoint_updated(&self, event: &BreakpointUpdatedEvent) {
        (**self).breakpoint_updated(event);
    }

    fn runspace_changed(&self, kind: RunspaceChangeKind, runspace: &RunspaceInfo) {
        (**self).runspace_changed(kind, runspace);
    }

    fn runspace_reinitialised(&self, runspace: &RunspaceInfo) {
        (**self).runspace_reinitialised(runspace);
    }

    fn session_ended(&self, reason: &str) {
        (**self).session_ended(reason);
    }
}

/// Default observer that records session events using `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredSessionObserver;

impl StructuredSessionObserver {
    /// Builds a new observer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl SessionObserver for StructuredSessionObserver {
    fn output(&self, stream: OutputStream, text: &str) {
        tracing::trace!(
            target: "psedit_runspace::session",
            event = "output",
            stream = ?stream,
            text,
            "host output"
        );
    }

    fn debugger_stopped(&self, stopped: &DebuggerStopped) {
        tracing::info!(
            target: "psedit_runspace::session",
            event = "debugger_stopped",
            runspace = %stopped.runspace,
            line = stopped.event.line,
            column = stopped.event.column,
            breakpoints = ?stopped.event.breakpoint_ids,
            frame_depth = stopped.frame_depth,
            "debugger stopped"
        );
    }

    fn debugger_resuming(&self, action: DebuggerResumeAction) {
        tracing::info!(
            target: "psedit_runspace::session",
            event = "debugger_resuming",
            action = %action,
            "debugger resuming"
        );
    }

    fn breakpoint_updated(&self, event: &BreakpointUpdatedEvent) {
        tracing::debug!(
            target: "psedit_runspace::session",
            event = "breakpoint_updated",
            id = event.breakpoint.id,
            kind = ?event.kind,
            "breakpoint updated"
        );
    }

    fn runspace_changed(&self, kind: RunspaceChangeKind, runspace: &RunspaceInfo) {
        tracing::info!(
            target: "psedit_runspace::session",
            event = "runspace_changed",
            change = ?kind,
            runspace = %runspace.id(),
            origin = ?runspace.origin(),
            computer = runspace.computer_name().unwrap_or("localhost"),
            "runspace changed"
        );
    }

    fn runspace_reinitialised(&self, runspace: &RunspaceInfo) {
        tracing::warn!(
            target: "psedit_runspace::session",
            event = "runspace_reinitialised",
            runspace = %runspace.id(),
            "session runspace was broken and has been replaced"
        );
    }

    fn session_ended(&self, reason: &str) {
        tracing::error!(
            target: "psedit_runspace::session",
            event = "session_ended",
            reason,
            "session ended"
        );
    }
}
