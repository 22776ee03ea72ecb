//! Breakpoints through the `*-PSBreakpoint` cmdlets.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::engine::{
    Command, Engine, EngineBreakpoint, EngineBreakpointKind, Invocation, InvocationError,
    SilentHost,
};

use super::BreakpointApi;

/// Drives breakpoints with cmdlets on engines without the native API.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptBreakpointApi;

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BreakpointRecord {
    id: u32,
    #[serde(default)]
    script: Option<PathBuf>,
    #[serde(default)]
    line: Option<u32>,
    #[serde(default)]
    column: Option<u32>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    variable: Option<String>,
    #[serde(default = "enabled_by_default")]
    enabled: bool,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    hit_count: u32,
}

fn enabled_by_default() -> bool {
    true
}

impl BreakpointRecord {
    fn into_engine(self) -> Option<EngineBreakpoint> {
        let kind = match (self.line.filter(|line| *line > 0), self.command, self.variable) {
            (Some(line), _, _) => EngineBreakpointKind::Line {
                script: self.script?,
                line,
                column: self.column.filter(|column| *column > 0),
            },
            (None, Some(name), _) => EngineBreakpointKind::Command {
                name,
                script: self.script,
            },
            (None, None, Some(name)) => EngineBreakpointKind::Variable { name },
            (None, None, None) => return None,
        };
        Some(EngineBreakpoint {
            id: self.id,
            kind,
            enabled: self.enabled,
            action: self.action,
            hit_count: self.hit_count,
        })
    }
}

fn run(
    engine: &mut dyn Engine,
    cancellation: &CancellationToken,
    command: &Command,
) -> Result<Vec<Value>, InvocationError> {
    let invocation = Invocation {
        cancellation,
        host: &SilentHost,
        write_output_to_host: false,
        add_to_history: false,
    };
    engine.invoke(command, &invocation)
}

fn parse_records(values: Vec<Value>) -> Result<Vec<EngineBreakpoint>, InvocationError> {
    values
        .into_iter()
        .map(|value| {
            serde_json::from_value::<BreakpointRecord>(value)
                .map_err(|error| InvocationError::Fault(format!("unreadable breakpoint: {error}")))
                .and_then(|record| {
                    record.into_engine().ok_or_else(|| {
                        InvocationError::Fault(String::from("breakpoint has no location"))
                    })
                })
        })
        .collect()
}

fn single(values: Vec<Value>) -> Result<EngineBreakpoint, InvocationError> {
    parse_records(values)?
        .into_iter()
        .next()
        .ok_or_else(|| InvocationError::Fault(String::from("Set-PSBreakpoint returned nothing")))
}

fn with_action(command: Command, action: Option<&str>) -> Command {
    match action {
        Some(action) => command.with_parameter("Action", action),
        None => command,
    }
}

impl BreakpointApi for ScriptBreakpointApi {
    fn name(&self) -> &'static str {
        "cmdlet"
    }

    fn set_line_breakpoint(
        &self,
        engine: &mut dyn Engine,
        cancellation: &CancellationToken,
        script: &Path,
        line: u32,
        column: Option<u32>,
        action: Option<&str>,
    ) -> Result<EngineBreakpoint, InvocationError> {
        let mut command = Command::named("Set-PSBreakpoint")
            .with_parameter("Script", script.display().to_string())
            .with_parameter("Line", line);
        if let Some(column) = column {
            command = command.with_parameter("Column", column);
        }
        single(run(engine, cancellation, &with_action(command, action))?)
    }

    fn set_command_breakpoint(
        &self,
        engine: &mut dyn Engine,
        cancellation: &CancellationToken,
        name: &str,
        action: Option<&str>,
    ) -> Result<EngineBreakpoint, InvocationError> {
        let command = Command::named("Set-PSBreakpoint").with_parameter("Command", name);
        single(run(engine, cancellation, &with_action(command, action))?)
    }

    fn list_breakpoints(
        &self,
        engine: &mut dyn Engine,
        cancellation: &CancellationToken,
    ) -> Result<Vec<EngineBreakpoint>, InvocationError> {
        parse_records(run(engine, cancellation, &Command::named("Get-PSBreakpoint"))?)
    }

    fn remove_breakpoint(
        &self,
        engine: &mut dyn Engine,
        cancellation: &CancellationToken,
        id: u32,
    ) -> Result<bool, InvocationError> {
        let lookup = Command::named("Get-PSBreakpoint")
            .with_parameter("Id", id)
            .with_parameter("ErrorAction", "Ignore");
        if run(engine, cancellation, &lookup)?.is_empty() {
            return Ok(false);
        }
        run(
            engine,
            cancellation,
            &Command::named("Remove-PSBreakpoint").with_parameter("Id", id),
        )?;
        Ok(true)
    }
}
