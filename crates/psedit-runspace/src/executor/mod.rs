//! Single-threaded executor that owns every engine invocation.
//!
//! Callers on any thread submit requests into three lanes. The pipeline
//! thread drains them from [`PipelineThreadExecutor::run_frame_loop`], which
//! is re-entered whenever a nested frame is pushed, so nested prompts and
//! debugger stops keep servicing the queue on the same thread.

mod queue;
mod task;

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use crossbeam_channel::bounded;
use once_cell::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::cancellation::{CancellationContext, CancellationScope, ScopeId};
use crate::engine::{Engine, ReadLine};
use crate::errors::ExecutionError;
use crate::frame::{
    FrameId, FrameStack, PowerShellContextFrame, PowerShellFrameType, RunspaceInfo,
};
use crate::options::ExecutionOptions;

pub use queue::RequestId;
pub use task::{TaskContext, TaskHandle};

use queue::{RequestQueue, WorkItem};
use task::{Job, TaskJob};

const EXECUTOR_TARGET: &str = "psedit_runspace::executor";

/// Reason a frame loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopExit {
    /// The executor is shutting down.
    Shutdown,
    /// The frame is no longer on the stack.
    Popped,
    /// The frame was asked to exit.
    ExitRequested,
    /// The frame's runspace can no longer run commands.
    RunspaceUnusable,
}

/// Limits applied by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorSettings {
    /// Maximum number of frames on the stack.
    pub max_frame_depth: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_frame_depth: psedit_config::DEFAULT_MAX_FRAME_DEPTH,
        }
    }
}

type ConsoleRunner = dyn Fn(&mut TaskContext<'_>, &str) + Send + Sync;

struct ConsoleRepl {
    reader: Arc<dyn ReadLine>,
    runner: Box<ConsoleRunner>,
}

struct RunningRequest {
    id: RequestId,
    scope: ScopeId,
}

#[derive(Default)]
struct PipelineState {
    queue: RequestQueue,
    frames: FrameStack,
    running: Vec<RunningRequest>,
    reading: Option<ScopeId>,
    next_request: u64,
    shutdown: bool,
    console_closed: bool,
}

enum Step {
    Exit(LoopExit),
    Run(WorkItem, CancellationScope),
    Read(CancellationScope),
}

struct EngineLease {
    engine: Box<dyn Engine>,
    frame_id: FrameId,
    frame_type: PowerShellFrameType,
    runspace: RunspaceInfo,
}

pub(crate) struct ExecutorShared {
    state: Mutex<PipelineState>,
    wake: Condvar,
    cancellation: CancellationContext,
    settings: ExecutorSettings,
    pipeline_thread: OnceCell<ThreadId>,
    console: OnceCell<ConsoleRepl>,
}

/// Queue and frame stack serviced by the pipeline thread.
#[derive(Clone)]
pub struct PipelineThreadExecutor {
    shared: Arc<ExecutorShared>,
}

impl PipelineThreadExecutor {
    /// Builds an executor with an empty queue and frame stack.
    #[must_use]
    pub fn new(cancellation: CancellationContext, settings: ExecutorSettings) -> Self {
        Self {
            shared: Arc::new(ExecutorShared {
                state: Mutex::new(PipelineState::default()),
                wake: Condvar::new(),
                cancellation,
                settings,
                pipeline_thread: OnceCell::new(),
                console: OnceCell::new(),
            }),
        }
    }

    /// Cancellation scopes used by requests and interactive reads.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationContext {
        &self.shared.cancellation
    }

    /// Queues `work` for the pipeline thread.
    ///
    /// Foreground submissions cancel any idle work or pending interactive
    /// read at the top of the scope stack; idle submissions cancel only a
    /// pending read. After shutdown the handle resolves
    /// immediately with [`ExecutionError::ShuttingDown`].
    pub fn submit<T, F>(&self, options: ExecutionOptions, work: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut TaskContext<'_>) -> Result<T, ExecutionError> + Send + 'static,
    {
        let (sender, receiver) = bounded(1);
        let job: Box<dyn Job> = Box::new(TaskJob::new(work, sender));
        let mut state = self.shared.lock();
        let id = RequestId(state.next_request);
        state.next_request += 1;
        let handle = TaskHandle::new(id, receiver, Arc::downgrade(&self.shared));
        if state.shutdown {
            drop(state);
            job.abandon(ExecutionError::ShuttingDown);
            return handle;
        }

        state.queue.push(WorkItem { id, options, job });
        if !options.is_idle() {
            self.shared.cancellation.cancel_idle_parent_task();
        } else if let Some(read) = state.reading {
            self.shared.cancellation.cancel_scope(read);
        }
        let pending = state.queue.len();
        drop(state);
        self.shared.wake.notify_all();
        tracing::trace!(
            target: EXECUTOR_TARGET,
            request = id.0,
            priority = ?options.priority,
            pending,
            "request queued"
        );
        handle
    }

    /// Cancels the innermost running request or interactive read.
    pub fn cancel_current_task(&self) {
        self.shared.cancellation.cancel_current_task();
    }

    /// Number of frames on the stack.
    #[must_use]
    pub fn frame_depth(&self) -> usize {
        self.shared.lock().frames.len()
    }

    /// Type of the top frame.
    #[must_use]
    pub fn current_frame_type(&self) -> Option<PowerShellFrameType> {
        self.shared.lock().frames.top().map(PowerShellContextFrame::frame_type)
    }

    /// Runspace of the top frame.
    #[must_use]
    pub fn current_runspace(&self) -> Option<RunspaceInfo> {
        self.shared
            .lock()
            .frames
            .top()
            .map(|frame| frame.runspace().clone())
    }

    pub(crate) fn current_frame(&self) -> Option<(FrameId, PowerShellFrameType, RunspaceInfo)> {
        self.shared.lock().frames.top().map(|frame| {
            (
                frame.id(),
                frame.frame_type(),
                frame.runspace().clone(),
            )
        })
    }

    /// Whether [`PipelineThreadExecutor::shutdown`] has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.lock().shutdown
    }

    /// Records the calling thread as the pipeline thread.
    pub(crate) fn bind_current_thread(&self) {
        let current = thread::current().id();
        if self.shared.pipeline_thread.set(current).is_err() {
            tracing::warn!(
                target: EXECUTOR_TARGET,
                "pipeline thread already bound; ignoring rebind"
            );
        }
    }

    /// Whether the caller runs on the pipeline thread.
    #[must_use]
    pub fn is_pipeline_thread(&self) -> bool {
        self.shared.pipeline_thread.get() == Some(&thread::current().id())
    }

    /// Enables the interactive prompt for frames without runnable work.
    pub(crate) fn install_console<R>(&self, reader: Arc<dyn ReadLine>, runner: R)
    where
        R: Fn(&mut TaskContext<'_>, &str) + Send + Sync + 'static,
    {
        let console = ConsoleRepl {
            reader,
            runner: Box::new(runner),
        };
        if self.shared.console.set(console).is_err() {
            tracing::warn!(target: EXECUTOR_TARGET, "console already installed");
        }
    }

    /// Pushes `frame`, refusing when the stack is at its depth limit.
    ///
    /// Nested frames serviced by their own loop get a frame boundary scope
    /// that lives as long as the frame.
    pub(crate) fn push_frame(
        &self,
        mut frame: PowerShellContextFrame,
    ) -> Result<FrameId, ExecutionError> {
        let mut state = self.shared.lock();
        if state.shutdown {
            return Err(ExecutionError::ShuttingDown);
        }
        let depth = state.frames.len();
        if depth >= self.shared.settings.max_frame_depth {
            return Err(ExecutionError::NestingLimit { depth });
        }
        let frame_type = frame.frame_type();
        if frame_type.contains(PowerShellFrameType::NESTED) && frame_type.is_interactive() {
            frame.hold_boundary(self.shared.cancellation.enter_frame_scope());
        }
        let id = state.frames.push(frame);
        drop(state);
        self.shared.wake.notify_all();
        tracing::debug!(
            target: EXECUTOR_TARGET,
            frame = %id,
            frame_type = %frame_type,
            depth = depth + 1,
            "pushed frame"
        );
        Ok(id)
    }

    /// Pops `id` when it is the top frame. The caller drops the frame, which
    /// disposes its engine.
    pub(crate) fn pop_frame(&self, id: FrameId) -> Option<PowerShellContextFrame> {
        let mut state = self.shared.lock();
        let popped = state.frames.pop(id);
        let depth = state.frames.len();
        drop(state);
        self.shared.wake.notify_all();
        match &popped {
            Some(frame) => tracing::debug!(
                target: EXECUTOR_TARGET,
                frame = %id,
                frame_type = %frame.frame_type(),
                depth,
                "popped frame"
            ),
            None => tracing::debug!(
                target: EXECUTOR_TARGET,
                frame = %id,
                "frame was not on top of the stack"
            ),
        }
        popped
    }

    /// Pops every remaining frame, top first.
    pub(crate) fn pop_all_frames(&self) -> Vec<PowerShellContextFrame> {
        let mut state = self.shared.lock();
        let mut frames = Vec::with_capacity(state.frames.len());
        while let Some(frame) = state.frames.pop_any() {
            frames.push(frame);
        }
        frames
    }

    /// Asks the top frame to exit unless it is the bottom frame.
    ///
    /// Returns the frame that was asked to exit.
    pub(crate) fn request_top_exit(&self) -> Option<(FrameId, PowerShellFrameType)> {
        let mut state = self.shared.lock();
        if state.frames.len() <= 1 {
            return None;
        }
        let frame = state.frames.top_mut()?;
        frame.request_exit();
        let target = (frame.id(), frame.frame_type());
        drop(state);
        self.shared.wake.notify_all();
        Some(target)
    }

    /// Asks a specific frame to exit.
    pub(crate) fn request_exit(&self, id: FrameId) -> bool {
        let mut state = self.shared.lock();
        let found = match state.frames.get_mut(id) {
            Some(frame) => {
                frame.request_exit();
                true
            }
            None => false,
        };
        drop(state);
        self.shared.wake.notify_all();
        found
    }

    /// Marks frames whose runspace became unusable and interrupts the work
    /// running on them. Returns how many frames were marked.
    pub(crate) fn mark_unusable_frames(&self) -> usize {
        let mut state = self.shared.lock();
        let marked = state.frames.mark_unusable_from_top();
        if marked > 0 {
            self.shared.cancellation.cancel_current_task();
        }
        drop(state);
        self.shared.wake.notify_all();
        marked
    }

    /// Services requests for `frame_id` until the frame is popped, asked to
    /// exit, loses its runspace, or the executor shuts down.
    pub(crate) fn run_frame_loop(&self, frame_id: FrameId) -> LoopExit {
        tracing::debug!(target: EXECUTOR_TARGET, frame = %frame_id, "entering frame loop");
        let exit = loop {
            match self.next_step(frame_id) {
                Step::Exit(exit) => break exit,
                Step::Run(item, scope) => self.run_item(frame_id, item, scope),
                Step::Read(scope) => self.read_console(frame_id, scope),
            }
        };
        tracing::debug!(
            target: EXECUTOR_TARGET,
            frame = %frame_id,
            exit = ?exit,
            "leaving frame loop"
        );
        exit
    }

    fn next_step(&self, frame_id: FrameId) -> Step {
        let mut state = self.shared.lock();
        loop {
            if state.shutdown {
                return Step::Exit(LoopExit::Shutdown);
            }
            if !state.frames.contains(frame_id) {
                return Step::Exit(LoopExit::Popped);
            }
            if let Some(top) = state.frames.top().filter(|top| top.id() == frame_id) {
                if top.exit_requested() {
                    return Step::Exit(LoopExit::ExitRequested);
                }
                if top.is_unusable() {
                    return Step::Exit(LoopExit::RunspaceUnusable);
                }
                let frame_type = top.frame_type();
                let in_debugger = frame_type.contains(PowerShellFrameType::DEBUG);
                if let Some(item) = state.queue.take_runnable(in_debugger) {
                    let scope = self.shared.cancellation.enter_scope(item.options.is_idle());
                    state.running.push(RunningRequest {
                        id: item.id,
                        scope: scope.id(),
                    });
                    return Step::Run(item, scope);
                }
                if frame_type.is_interactive()
                    && !state.console_closed
                    && self.shared.console.get().is_some()
                {
                    let scope = self.shared.cancellation.enter_scope(true);
                    state.reading = Some(scope.id());
                    return Step::Read(scope);
                }
            }
            state = self
                .shared
                .wake
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn run_item(&self, frame_id: FrameId, item: WorkItem, scope: CancellationScope) {
        let WorkItem { id, job, .. } = item;
        tracing::trace!(target: EXECUTOR_TARGET, request = id.0, frame = %frame_id, "running request");
        match self.lease_engine(frame_id) {
            Ok(mut lease) => {
                let mut context = TaskContext::new(
                    lease.engine.as_mut(),
                    lease.frame_id,
                    lease.frame_type,
                    lease.runspace.clone(),
                    scope.token().clone(),
                );
                job.run(&mut context);
                self.return_engine(lease);
            }
            Err(error) => job.abandon(error),
        }
        self.shared.lock().running.retain(|running| running.id != id);
        drop(scope);
    }

    fn read_console(&self, frame_id: FrameId, scope: CancellationScope) {
        let Some(console) = self.shared.console.get() else {
            return;
        };
        let prompt = self.prompt_for(frame_id);
        let read = console.reader.read_line(&prompt, scope.token());
        self.shared.lock().reading = None;
        let line = match read {
            Ok(Some(line)) if !scope.token().is_cancelled() => line,
            Ok(Some(_)) => return,
            Ok(None) => {
                if !scope.token().is_cancelled() {
                    tracing::info!(target: EXECUTOR_TARGET, "console input closed");
                    self.shared.lock().console_closed = true;
                }
                return;
            }
            Err(error) => {
                tracing::warn!(
                    target: EXECUTOR_TARGET,
                    error = %error,
                    "console read failed; disabling the interactive prompt"
                );
                self.shared.lock().console_closed = true;
                return;
            }
        };
        drop(scope);
        if line.trim().is_empty() {
            return;
        }

        let scope = self.shared.cancellation.enter_scope(false);
        let outcome = self.with_frame_engine(frame_id, scope.token().clone(), |context| {
            panic::catch_unwind(AssertUnwindSafe(|| (console.runner)(context, &line)))
        });
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(_)) => tracing::error!(
                target: EXECUTOR_TARGET,
                frame = %frame_id,
                "console command panicked on the pipeline thread"
            ),
            Err(error) => tracing::warn!(
                target: EXECUTOR_TARGET,
                frame = %frame_id,
                error = %error,
                "console command could not run"
            ),
        }
    }

    fn prompt_for(&self, frame_id: FrameId) -> String {
        let state = self.shared.lock();
        let Some(frame) = state.frames.top().filter(|frame| frame.id() == frame_id) else {
            return String::from("PS> ");
        };
        let mut prompt = String::new();
        if frame.frame_type().contains(PowerShellFrameType::DEBUG) {
            prompt.push_str("[DBG]: ");
        }
        if let Some(computer) = frame.runspace().computer_name() {
            prompt.push_str(&format!("[{computer}]: "));
        }
        prompt.push_str("PS> ");
        prompt
    }

    /// Runs `work` on `frame_id`'s engine inside a fresh scope.
    pub(crate) fn run_on_frame<R>(
        &self,
        frame_id: FrameId,
        is_idle: bool,
        work: impl FnOnce(&mut TaskContext<'_>) -> R,
    ) -> Result<R, ExecutionError> {
        let scope = self.shared.cancellation.enter_scope(is_idle);
        self.with_frame_engine(frame_id, scope.token().clone(), work)
    }

    /// Runs `work` on `frame_id`'s engine with the caller's token.
    pub(crate) fn with_frame_engine<R>(
        &self,
        frame_id: FrameId,
        cancellation: CancellationToken,
        work: impl FnOnce(&mut TaskContext<'_>) -> R,
    ) -> Result<R, ExecutionError> {
        let mut lease = self.lease_engine(frame_id)?;
        let result = {
            let mut context = TaskContext::new(
                lease.engine.as_mut(),
                lease.frame_id,
                lease.frame_type,
                lease.runspace.clone(),
                cancellation,
            );
            work(&mut context)
        };
        self.return_engine(lease);
        Ok(result)
    }

    fn lease_engine(&self, frame_id: FrameId) -> Result<EngineLease, ExecutionError> {
        let mut state = self.shared.lock();
        let frame = state
            .frames
            .get_mut(frame_id)
            .ok_or(ExecutionError::EngineUnavailable)?;
        let engine = frame
            .take_engine()
            .ok_or(ExecutionError::EngineUnavailable)?;
        Ok(EngineLease {
            engine,
            frame_id,
            frame_type: frame.frame_type(),
            runspace: frame.runspace().clone(),
        })
    }

    fn return_engine(&self, lease: EngineLease) {
        let EngineLease {
            engine, frame_id, ..
        } = lease;
        let orphaned = {
            let mut state = self.shared.lock();
            match state.frames.get_mut(frame_id) {
                Some(frame) => {
                    frame.restore_engine(engine);
                    None
                }
                None => Some(engine),
            }
        };
        if let Some(mut engine) = orphaned {
            tracing::debug!(
                target: EXECUTOR_TARGET,
                frame = %frame_id,
                "frame popped while its engine was in use; disposing engine"
            );
            engine.dispose();
        }
    }

    /// Stops every loop, cancels all scopes and resolves queued requests with
    /// [`ExecutionError::ShuttingDown`].
    pub fn shutdown(&self) {
        let abandoned = {
            let mut state = self.shared.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.queue.drain()
        };
        self.shared.cancellation.cancel_current_task_stack();
        self.shared.wake.notify_all();
        tracing::info!(
            target: EXECUTOR_TARGET,
            abandoned = abandoned.len(),
            "pipeline executor shutting down"
        );
        for item in abandoned {
            item.job.abandon(ExecutionError::ShuttingDown);
        }
    }
}

impl ExecutorShared {
    fn lock(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn cancel_request(&self, id: RequestId) {
        let removed = {
            let mut state = self.lock();
            let removed = state.queue.remove(id);
            if removed.is_none() {
                if let Some(running) = state.running.iter().find(|running| running.id == id) {
                    self.cancellation.cancel_scope(running.scope);
                }
            }
            removed
        };
        if let Some(item) = removed {
            tracing::debug!(target: EXECUTOR_TARGET, request = id.0, "queued request cancelled");
            item.job.abandon(ExecutionError::Cancelled);
        }
    }
}
