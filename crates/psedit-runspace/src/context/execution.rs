//! Running commands on the frame a request was dispatched to.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::{
    Command, ErrorRecord, HostOutput, Invocation, InvocationError, OutputStream, Runspace,
};
use crate::errors::ExecutionError;
use crate::executor::{LoopExit, TaskContext};
use crate::frame::{PowerShellContextFrame, PowerShellFrameType, RunspaceInfo};
use crate::observer::SessionObserver;
use crate::options::ExecutionOptions;
use crate::version::PowerShellVersionDetails;

use super::{CONTEXT_TARGET, ContextShared};

/// Result of a command request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    /// Pipeline output.
    pub values: Vec<Value>,
    /// Error records kept when the request did not throw on errors.
    pub errors: Vec<ErrorRecord>,
}

/// Forwards host output to the session observer.
pub(super) struct ObserverHost<'a> {
    observer: &'a dyn SessionObserver,
}

impl<'a> ObserverHost<'a> {
    pub(super) fn new(observer: &'a dyn SessionObserver) -> Self {
        Self { observer }
    }
}

impl HostOutput for ObserverHost<'_> {
    fn write(&self, stream: OutputStream, text: &str) {
        self.observer.output(stream, text);
    }
}

impl ContextShared {
    pub(super) fn run_command(
        &self,
        context: &mut TaskContext<'_>,
        command: &Command,
        options: &ExecutionOptions,
    ) -> Result<ExecutionOutput, ExecutionError> {
        let frame_type = context.frame_type();
        if options.non_interactive && !frame_type.contains(PowerShellFrameType::NON_INTERACTIVE) {
            return self.run_non_interactive(context, command, options);
        }

        let token = context.cancellation().clone();
        let host = ObserverHost::new(self.observer.as_ref());
        let invocation = Invocation {
            cancellation: &token,
            host: &host,
            write_output_to_host: options.write_output_to_host,
            add_to_history: options.add_to_history,
        };

        if frame_type.contains(PowerShellFrameType::DEBUG) {
            let results = context
                .engine()
                .process_debugger_command(command, &invocation)
                .map_err(ExecutionError::from_invocation)?;
            if let Some(action) = results.resume_action {
                if let Err(error) = self.resume_debugger(action) {
                    tracing::debug!(
                        target: CONTEXT_TARGET,
                        error = %error,
                        "debugger command asked to resume outside a stop"
                    );
                }
            }
            return Ok(ExecutionOutput {
                values: results.values,
                errors: Vec::new(),
            });
        }

        let remote = frame_type.contains(PowerShellFrameType::REMOTE)
            || context.runspace().origin().is_remote();
        if remote {
            synchronize_output(context);
        }
        let outcome = context.engine().invoke(command, &invocation);
        if remote {
            synchronize_output(context);
        }

        match outcome {
            Ok(values) => Ok(ExecutionOutput {
                values,
                errors: Vec::new(),
            }),
            Err(InvocationError::Script { records }) if !options.throw_on_error => {
                Ok(ExecutionOutput {
                    values: Vec::new(),
                    errors: records,
                })
            }
            Err(error) => Err(ExecutionError::from_invocation(error)),
        }
    }

    /// Runs the command on a scoped frame that never prompts, popping it
    /// afterwards.
    fn run_non_interactive(
        &self,
        context: &mut TaskContext<'_>,
        command: &Command,
        options: &ExecutionOptions,
    ) -> Result<ExecutionOutput, ExecutionError> {
        let runspace = context.runspace().clone();
        let engine = self
            .factory
            .create_engine(runspace.runspace())
            .map_err(|error| ExecutionError::Faulted {
                message: error.to_string(),
            })?;
        let mut frame_type = PowerShellFrameType::NESTED | PowerShellFrameType::NON_INTERACTIVE;
        if context.frame_type().contains(PowerShellFrameType::REMOTE) {
            frame_type = frame_type | PowerShellFrameType::REMOTE;
        }
        let frame_id = self.push_frame(PowerShellContextFrame::new(Some(engine), runspace, frame_type))?;
        let token = context.cancellation().clone();
        let outcome = self.executor.with_frame_engine(frame_id, token, |inner| {
            self.run_command(inner, command, options)
        });
        self.pop_frame(frame_id);
        outcome?
    }

    /// Services a frame bound to another runspace until it is asked to exit.
    pub(super) fn run_remote_frame(
        &self,
        context: &mut TaskContext<'_>,
        runspace: Arc<dyn Runspace>,
    ) -> Result<(), ExecutionError> {
        let state = runspace.state();
        if !state.is_usable() {
            return Err(ExecutionError::RunspaceUnusable { state });
        }
        let mut engine = self
            .factory
            .create_engine(&runspace)
            .map_err(|error| ExecutionError::Faulted {
                message: error.to_string(),
            })?;
        let version =
            PowerShellVersionDetails::get_version_details(engine.as_mut(), context.cancellation());
        let info = RunspaceInfo::new(Arc::clone(&runspace), version);
        let frame_type = PowerShellFrameType::NESTED | PowerShellFrameType::REMOTE;
        let frame_id = self.push_frame(PowerShellContextFrame::new(Some(engine), info, frame_type))?;
        tracing::info!(
            target: CONTEXT_TARGET,
            frame = %frame_id,
            runspace = %runspace.id(),
            "entered runspace"
        );

        let exit = self.executor.run_frame_loop(frame_id);
        self.pop_frame(frame_id);
        match exit {
            LoopExit::ExitRequested | LoopExit::Popped => Ok(()),
            LoopExit::Shutdown => Err(ExecutionError::ShuttingDown),
            LoopExit::RunspaceUnusable => Err(ExecutionError::RunspaceUnusable {
                state: runspace.state(),
            }),
        }
    }

    /// Runs a line typed at the interactive prompt.
    pub(super) fn run_console_line(&self, context: &mut TaskContext<'_>, line: &str) {
        let options = ExecutionOptions::interactive();
        match self.run_command(context, &Command::script(line), &options) {
            Ok(output) => {
                for record in output.errors {
                    self.observer.output(OutputStream::Error, &record.message);
                }
            }
            Err(error) if error.is_cancellation() => {
                tracing::debug!(target: CONTEXT_TARGET, "console command cancelled");
            }
            Err(error) => self.observer.output(OutputStream::Error, &error.to_string()),
        }
    }
}

fn synchronize_output(context: &mut TaskContext<'_>) {
    if let Err(error) = context.engine().synchronize_output() {
        tracing::warn!(
            target: CONTEXT_TARGET,
            error = %error,
            "could not synchronise remote output"
        );
    }
}
