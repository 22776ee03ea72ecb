//! Breakpoints through the debugger methods of version 7 engines.

use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::engine::{Engine, EngineBreakpoint, EngineDebugger, InvocationError};

use super::BreakpointApi;

/// Calls the engine's native debugger breakpoint methods.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeBreakpointApi;

fn debugger(engine: &mut dyn Engine) -> Result<&mut dyn EngineDebugger, InvocationError> {
    engine
        .debugger_api()
        .ok_or_else(|| InvocationError::Fault(String::from("native breakpoint API is unavailable")))
}

impl BreakpointApi for NativeBreakpointApi {
    fn name(&self) -> &'static str {
        "native"
    }

    fn set_line_breakpoint(
        &self,
        engine: &mut dyn Engine,
        _cancellation: &CancellationToken,
        script: &Path,
        line: u32,
        column: Option<u32>,
        action: Option<&str>,
    ) -> Result<EngineBreakpoint, InvocationError> {
        debugger(engine)?.set_line_breakpoint(script, line, column, action)
    }

    fn set_command_breakpoint(
        &self,
        engine: &mut dyn Engine,
        _cancellation: &CancellationToken,
        name: &str,
        action: Option<&str>,
    ) -> Result<EngineBreakpoint, InvocationError> {
        debugger(engine)?.set_command_breakpoint(name, None, action)
    }

    fn list_breakpoints(
        &self,
        engine: &mut dyn Engine,
        _cancellation: &CancellationToken,
    ) -> Result<Vec<EngineBreakpoint>, InvocationError> {
        debugger(engine)?.breakpoints()
    }

    fn remove_breakpoint(
        &self,
        engine: &mut dyn Engine,
        _cancellation: &CancellationToken,
        id: u32,
    ) -> Result<bool, InvocationError> {
        debugger(engine)?.remove_breakpoint(id)
    }
}
