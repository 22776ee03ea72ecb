//! Observer and console doubles.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::debugging::DebuggerStopped;
use crate::engine::{
    BreakpointUpdateKind, BreakpointUpdatedEvent, DebuggerResumeAction, EngineError,
    OutputStream, ReadLine, RunspaceId,
};
use crate::frame::RunspaceInfo;
use crate::observer::{RunspaceChangeKind, SessionObserver};

/// Default time tests wait for the pipeline thread.
pub const PATIENCE: Duration = Duration::from_secs(5);

/// Polls `condition` until it holds or `timeout` elapses.
pub fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// Session event captured by [`RecordingObserver`].
#[derive(Debug, Clone, PartialEq)]
pub enum ObservedEvent {
    /// Host output line.
    Output(OutputStream, String),
    /// Debugger stop.
    Stopped(DebuggerStopped),
    /// Recorded resume action.
    Resuming(DebuggerResumeAction),
    /// Breakpoint change.
    BreakpointUpdated(u32, BreakpointUpdateKind),
    /// Top runspace change.
    RunspaceChanged(RunspaceChangeKind, RunspaceId),
    /// Session runspace rebuilt.
    Reinitialised(RunspaceId),
    /// Session ended.
    SessionEnded(String),
}

/// Observer that stores every event.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObservedEvent>>,
}

impl RecordingObserver {
    fn push(&self, event: ObservedEvent) {
        self.events
            .lock()
            .expect("observer mutex poisoned")
            .push(event);
    }

    /// Events observed so far.
    #[must_use]
    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events.lock().expect("observer mutex poisoned").clone()
    }

    /// Debugger stops observed so far.
    #[must_use]
    pub fn stops(&self) -> Vec<DebuggerStopped> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ObservedEvent::Stopped(stopped) => Some(stopped),
                _ => None,
            })
            .collect()
    }

    /// Host output lines written to `stream`.
    #[must_use]
    pub fn output(&self, stream: OutputStream) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ObservedEvent::Output(observed, text) if observed == stream => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Waits until an event matching `predicate` was observed.
    pub fn wait_for(&self, predicate: impl Fn(&ObservedEvent) -> bool) -> bool {
        eventually(PATIENCE, || self.events().iter().any(&predicate))
    }

    /// Waits until `count` debugger stops were observed.
    pub fn wait_for_stops(&self, count: usize) -> bool {
        eventually(PATIENCE, || self.stops().len() >= count)
    }
}

impl SessionObserver for RecordingObserver {
    fn output(&self, stream: OutputStream, text: &str) {
        self.push(ObservedEvent::Output(stream, text.to_owned()));
    }

    fn debugger_stopped(&self, stopped: &DebuggerStopped) {
        self.push(ObservedEvent::Stopped(stopped.clone()));
    }

    fn debugger_resuming(&self, action: DebuggerResumeAction) {
        self.push(ObservedEvent::Resuming(action));
    }

    fn breakpoint_updated(&self, event: &BreakpointUpdatedEvent) {
        self.push(ObservedEvent::BreakpointUpdated(event.breakpoint.id, event.kind));
    }

    fn runspace_changed(&self, kind: RunspaceChangeKind, runspace: &RunspaceInfo) {
        self.push(ObservedEvent::RunspaceChanged(kind, runspace.id()));
    }

    fn runspace_reinitialised(&self, runspace: &RunspaceInfo) {
        self.push(ObservedEvent::Reinitialised(runspace.id()));
    }

    fn session_ended(&self, reason: &str) {
        self.push(ObservedEvent::SessionEnded(reason.to_owned()));
    }
}

/// Console that replays queued lines, then blocks until cancelled.
#[derive(Debug, Default)]
pub struct ScriptedConsole {
    lines: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedConsole {
    /// Queues a line for the next read.
    pub fn type_line(&self, line: &str) {
        self.lines
            .lock()
            .expect("console mutex poisoned")
            .push_back(line.to_owned());
    }

    /// Prompts shown so far.
    #[must_use]
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("console mutex poisoned").clone()
    }
}

impl ReadLine for ScriptedConsole {
    fn read_line(
        &self,
        prompt: &str,
        cancellation: &CancellationToken,
    ) -> Result<Option<String>, EngineError> {
        self.prompts
            .lock()
            .expect("console mutex poisoned")
            .push(prompt.to_owned());
        loop {
            if let Some(line) = self.lines.lock().expect("console mutex poisoned").pop_front() {
                return Ok(Some(line));
            }
            if cancellation.is_cancelled() {
                return Ok(None);
            }
            thread::sleep(Duration::from_millis(2));
        }
    }
}
