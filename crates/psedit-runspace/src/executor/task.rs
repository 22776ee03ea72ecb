//! Request jobs, the context they run in, and the handles callers wait on.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Weak;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use tokio_util::sync::CancellationToken;

use crate::engine::Engine;
use crate::errors::ExecutionError;
use crate::frame::{FrameId, PowerShellFrameType, RunspaceInfo};

use super::ExecutorShared;
use super::queue::RequestId;

const TASK_TARGET: &str = "psedit_runspace::executor";

/// Access granted to a request while it runs on the pipeline thread.
pub struct TaskContext<'a> {
    engine: &'a mut dyn Engine,
    frame_id: FrameId,
    frame_type: PowerShellFrameType,
    runspace: RunspaceInfo,
    cancellation: CancellationToken,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(
        engine: &'a mut dyn Engine,
        frame_id: FrameId,
        frame_type: PowerShellFrameType,
        runspace: RunspaceInfo,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            engine,
            frame_id,
            frame_type,
            runspace,
            cancellation,
        }
    }

    /// Engine instance of the frame the request runs on.
    pub fn engine(&mut self) -> &mut dyn Engine {
        &mut *self.engine
    }

    /// Frame the request runs on.
    #[must_use]
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Type of the frame the request runs on.
    #[must_use]
    pub fn frame_type(&self) -> PowerShellFrameType {
        self.frame_type
    }

    /// Runspace of the frame the request runs on.
    #[must_use]
    pub fn runspace(&self) -> &RunspaceInfo {
        &self.runspace
    }

    /// Token signalled when the request should stop.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

/// Type-erased request body.
pub(crate) trait Job: Send {
    /// Runs the request and delivers its result.
    fn run(self: Box<Self>, context: &mut TaskContext<'_>);

    /// Delivers `error` without running the request.
    fn abandon(self: Box<Self>, error: ExecutionError);
}

pub(crate) struct TaskJob<T, F> {
    work: F,
    sender: Sender<Result<T, ExecutionError>>,
}

impl<T, F> TaskJob<T, F> {
    pub(crate) fn new(work: F, sender: Sender<Result<T, ExecutionError>>) -> Self {
        Self { work, sender }
    }
}

impl<T, F> Job for TaskJob<T, F>
where
    T: Send + 'static,
    F: FnOnce(&mut TaskContext<'_>) -> Result<T, ExecutionError> + Send + 'static,
{
    fn run(self: Box<Self>, context: &mut TaskContext<'_>) {
        let Self { work, sender } = *self;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(context)))
            .unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                tracing::error!(
                    target: TASK_TARGET,
                    frame = %context.frame_id(),
                    message = %message,
                    "request panicked on the pipeline thread"
                );
                Err(ExecutionError::Panicked { message })
            });
        if let Err(error) = &outcome {
            if error.is_cancellation() {
                tracing::debug!(target: TASK_TARGET, "request cancelled");
            }
        }
        if sender.send(outcome).is_err() {
            tracing::trace!(target: TASK_TARGET, "request result dropped by caller");
        }
    }

    fn abandon(self: Box<Self>, error: ExecutionError) {
        if self.sender.send(Err(error)).is_err() {
            tracing::trace!(target: TASK_TARGET, "request result dropped by caller");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        String::from("non-string panic payload")
    }
}

/// Handle to the eventual result of a submitted request.
pub struct TaskHandle<T> {
    id: RequestId,
    receiver: Receiver<Result<T, ExecutionError>>,
    executor: Weak<ExecutorShared>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(
        id: RequestId,
        receiver: Receiver<Result<T, ExecutionError>>,
        executor: Weak<ExecutorShared>,
    ) -> Self {
        Self {
            id,
            receiver,
            executor,
        }
    }

    /// Identifier assigned at submission.
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Blocks until the request completes.
    pub fn wait(self) -> Result<T, ExecutionError> {
        self.receiver
            .recv()
            .unwrap_or(Err(ExecutionError::ShuttingDown))
    }

    /// Blocks until the request completes or `timeout` elapses.
    ///
    /// A timeout leaves the request running; the handle can be waited on
    /// again or cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T, ExecutionError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(ExecutionError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(ExecutionError::ShuttingDown),
        }
    }

    /// Returns the result when it is already available.
    #[must_use]
    pub fn try_result(&self) -> Option<Result<T, ExecutionError>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(ExecutionError::ShuttingDown)),
        }
    }

    /// Cancels the request.
    ///
    /// A queued request is removed and resolves with
    /// [`ExecutionError::Cancelled`]; a running request has its cancellation
    /// scope signalled.
    pub fn cancel(&self) {
        if let Some(executor) = self.executor.upgrade() {
            executor.cancel_request(self.id);
        }
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TaskHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
