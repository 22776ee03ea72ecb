//! Execution frames and the frame stack.

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use crate::cancellation::CancellationScope;
use crate::engine::{Engine, Runspace, RunspaceId, RunspaceOrigin};
use crate::version::PowerShellVersionDetails;

/// Bitmask describing why a frame was pushed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PowerShellFrameType(u8);

impl PowerShellFrameType {
    /// The bottom frame of a session.
    pub const NORMAL: Self = Self(0);
    /// Any frame pushed above the bottom frame.
    pub const NESTED: Self = Self(1);
    /// Pushed while the debugger is stopped.
    pub const DEBUG: Self = Self(1 << 1);
    /// Bound to a remote runspace.
    pub const REMOTE: Self = Self(1 << 2);
    /// Scoped to a single non-interactive invocation.
    pub const NON_INTERACTIVE: Self = Self(1 << 3);
    /// Pushed for an interactive nested prompt.
    pub const REPL: Self = Self(1 << 4);

    /// Whether every bit of `other` is set.
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether the frame may drive an interactive prompt.
    #[must_use]
    pub fn is_interactive(self) -> bool {
        !self.contains(Self::NON_INTERACTIVE)
    }
}

impl BitOr for PowerShellFrameType {
    type Output = Self;

    fn bitor(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl fmt::Display for PowerShellFrameType {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(PowerShellFrameType, &str); 5] = [
            (PowerShellFrameType::NESTED, "Nested"),
            (PowerShellFrameType::DEBUG, "Debug"),
            (PowerShellFrameType::REMOTE, "Remote"),
            (PowerShellFrameType::NON_INTERACTIVE, "NonInteractive"),
            (PowerShellFrameType::REPL, "Repl"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            formatter.write_str("Normal")
        } else {
            formatter.write_str(&names.join("|"))
        }
    }
}

impl fmt::Debug for PowerShellFrameType {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "PowerShellFrameType({self})")
    }
}

/// Runspace a frame is bound to, with facts resolved when it was pushed.
#[derive(Clone)]
pub struct RunspaceInfo {
    runspace: Arc<dyn Runspace>,
    origin: RunspaceOrigin,
    computer_name: Option<String>,
    version: PowerShellVersionDetails,
}

impl RunspaceInfo {
    /// Captures the origin and computer name of `runspace`.
    #[must_use]
    pub fn new(runspace: Arc<dyn Runspace>, version: PowerShellVersionDetails) -> Self {
        let origin = runspace.origin();
        let computer_name = runspace.computer_name();
        Self {
            runspace,
            origin,
            computer_name,
            version,
        }
    }

    /// Engine identifier of the runspace.
    #[must_use]
    pub fn id(&self) -> RunspaceId {
        self.runspace.id()
    }

    /// Shared runspace handle.
    #[must_use]
    pub fn runspace(&self) -> &Arc<dyn Runspace> {
        &self.runspace
    }

    /// Where the runspace lives.
    #[must_use]
    pub fn origin(&self) -> RunspaceOrigin {
        self.origin
    }

    /// Remote computer name, for remote runspaces.
    #[must_use]
    pub fn computer_name(&self) -> Option<&str> {
        self.computer_name.as_deref()
    }

    /// Version of the engine behind the runspace.
    #[must_use]
    pub fn version(&self) -> PowerShellVersionDetails {
        self.version
    }

    /// Whether the runspace can still run commands.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.runspace.state().is_usable()
    }
}

impl fmt::Debug for RunspaceInfo {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RunspaceInfo")
            .field("id", &self.id())
            .field("origin", &self.origin)
            .field("computer_name", &self.computer_name)
            .field("version", &self.version)
            .finish()
    }
}

/// Identifier of a pushed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub(crate) u64);

impl fmt::Display for FrameId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "frame-{}", self.0)
    }
}

/// One level of the execution stack.
///
/// The engine is exclusive to the frame. It is lent to the pipeline thread
/// while a request runs and disposed when the frame is dropped.
pub(crate) struct PowerShellContextFrame {
    id: FrameId,
    engine: Option<Box<dyn Engine>>,
    runspace: RunspaceInfo,
    frame_type: PowerShellFrameType,
    exit_requested: bool,
    unusable: bool,
    boundary: Option<CancellationScope>,
}

impl PowerShellContextFrame {
    pub(crate) fn new(
        engine: Option<Box<dyn Engine>>,
        runspace: RunspaceInfo,
        frame_type: PowerShellFrameType,
    ) -> Self {
        Self {
            id: FrameId(0),
            engine,
            runspace,
            frame_type,
            exit_requested: false,
            unusable: false,
            boundary: None,
        }
    }

    pub(crate) fn id(&self) -> FrameId {
        self.id
    }

    pub(crate) fn frame_type(&self) -> PowerShellFrameType {
        self.frame_type
    }

    pub(crate) fn runspace(&self) -> &RunspaceInfo {
        &self.runspace
    }

    pub(crate) fn take_engine(&mut self) -> Option<Box<dyn Engine>> {
        self.engine.take()
    }

    /// Holds `scope` until the frame is dropped.
    pub(crate) fn hold_boundary(&mut self, scope: CancellationScope) {
        self.boundary = Some(scope);
    }

    pub(crate) fn restore_engine(&mut self, engine: Box<dyn Engine>) {
        self.engine = Some(engine);
    }

    pub(crate) fn request_exit(&mut self) {
        self.exit_requested = true;
    }

    pub(crate) fn exit_requested(&self) -> bool {
        self.exit_requested
    }

    pub(crate) fn mark_unusable(&mut self) {
        self.unusable = true;
    }

    pub(crate) fn is_unusable(&self) -> bool {
        self.unusable || !self.runspace.is_usable()
    }
}

impl Drop for PowerShellContextFrame {
    fn drop(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.dispose();
        }
    }
}

/// LIFO stack of frames; only the top frame's engine is invoked.
#[derive(Default)]
pub(crate) struct FrameStack {
    frames: Vec<PowerShellContextFrame>,
    next_id: u64,
}

impl FrameStack {
    pub(crate) fn push(&mut self, mut frame: PowerShellContextFrame) -> FrameId {
        self.next_id += 1;
        frame.id = FrameId(self.next_id);
        let id = frame.id;
        self.frames.push(frame);
        id
    }

    /// Pops `id` when it is on top; frames above it are never skipped.
    pub(crate) fn pop(&mut self, id: FrameId) -> Option<PowerShellContextFrame> {
        if self.top().map(PowerShellContextFrame::id) == Some(id) {
            self.frames.pop()
        } else {
            None
        }
    }

    pub(crate) fn pop_any(&mut self) -> Option<PowerShellContextFrame> {
        self.frames.pop()
    }

    pub(crate) fn top(&self) -> Option<&PowerShellContextFrame> {
        self.frames.last()
    }

    pub(crate) fn top_mut(&mut self) -> Option<&mut PowerShellContextFrame> {
        self.frames.last_mut()
    }

    pub(crate) fn get_mut(&mut self, id: FrameId) -> Option<&mut PowerShellContextFrame> {
        self.frames.iter_mut().rev().find(|frame| frame.id == id)
    }

    pub(crate) fn contains(&self, id: FrameId) -> bool {
        self.frames.iter().any(|frame| frame.id == id)
    }

    pub(crate) fn len(&self) -> usize {
        self.frames.len()
    }

    /// Marks unusable frames from the top down, stopping at the first usable
    /// one, and returns how many were marked.
    pub(crate) fn mark_unusable_from_top(&mut self) -> usize {
        let mut marked = 0;
        for frame in self.frames.iter_mut().rev() {
            if frame.runspace.is_usable() {
                break;
            }
            frame.mark_unusable();
            marked += 1;
        }
        marked
    }
}
