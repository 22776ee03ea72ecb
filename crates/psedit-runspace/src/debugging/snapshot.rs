//! State captured once per debugger stop.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::engine::{DebuggerStopEvent, Engine, EngineVariable, RunspaceId, VariableScope};
use crate::errors::ContextError;

use super::stack_frame::StackFrameDetails;
use super::variables::{VariableContainerDetails, VariableDetails, VariableStore};

const SNAPSHOT_TARGET: &str = "psedit_runspace::debugging";

/// Published to observers when execution stops in the debugger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebuggerStopped {
    /// Event raised by the engine.
    pub event: DebuggerStopEvent,
    /// Call stack at the stop, innermost first.
    pub call_stack: Vec<StackFrameDetails>,
    /// Runspace that stopped.
    pub runspace: RunspaceId,
    /// Whether the stopped runspace is remote.
    pub is_remote: bool,
    /// Frame depth after the debug frame was pushed.
    pub frame_depth: usize,
}

/// Call stack and variables of one stop; discarded on resume.
pub(crate) struct DebuggerSnapshot {
    call_stack: Vec<StackFrameDetails>,
    script_scope: VariableContainerDetails,
    global_scope: VariableContainerDetails,
    store: VariableStore,
}

impl DebuggerSnapshot {
    pub(crate) fn capture(engine: &mut dyn Engine, workspace_root: Option<&Path>) -> Self {
        let mut store = VariableStore::default();
        let frames = engine.call_stack().unwrap_or_else(|error| {
            tracing::warn!(
                target: SNAPSHOT_TARGET,
                error = %error,
                "could not read the call stack"
            );
            Vec::new()
        });

        let mut read_scope = |scope: VariableScope| -> Vec<EngineVariable> {
            engine.variables(scope).unwrap_or_else(|error| {
                tracing::warn!(
                    target: SNAPSHOT_TARGET,
                    scope = scope.as_str(),
                    error = %error,
                    "could not read variables"
                );
                Vec::new()
            })
        };
        let local = read_scope(VariableScope::Local);
        let script = read_scope(VariableScope::Script);
        let global = read_scope(VariableScope::Global);

        let top_locals = store.add_container(VariableScope::Local.as_str(), &local);
        let script_scope = store.add_container(VariableScope::Script.as_str(), &script);
        let global_scope = store.add_container(VariableScope::Global.as_str(), &global);

        let call_stack = frames
            .iter()
            .enumerate()
            .map(|(index, frame)| {
                let locals_id = if index == 0 {
                    top_locals.id
                } else {
                    store.add_container(VariableScope::Local.as_str(), &frame.locals).id
                };
                StackFrameDetails::from_engine(frame, locals_id, workspace_root)
            })
            .collect();

        Self {
            call_stack,
            script_scope,
            global_scope,
            store,
        }
    }

    pub(crate) fn call_stack(&self) -> &[StackFrameDetails] {
        &self.call_stack
    }

    /// Containers visible from a stack frame: its locals, then the script and
    /// global scopes.
    pub(crate) fn variable_scopes(
        &self,
        frame_index: usize,
    ) -> Result<Vec<VariableContainerDetails>, ContextError> {
        let frame = self
            .call_stack
            .get(frame_index)
            .ok_or(ContextError::UnknownFrame { index: frame_index })?;
        let locals = VariableContainerDetails {
            id: frame.locals_id,
            name: String::from(VariableScope::Local.as_str()),
            len: self.store.container_len(frame.locals_id),
        };
        Ok(vec![
            locals,
            self.script_scope.clone(),
            self.global_scope.clone(),
        ])
    }

    pub(crate) fn variables(&mut self, id: u32) -> Result<Vec<VariableDetails>, ContextError> {
        self.store.children(id)
    }
}
