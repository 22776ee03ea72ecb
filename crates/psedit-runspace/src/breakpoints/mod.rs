//! Breakpoint operations over whichever API the engine provides.
//!
//! Engines from version 7 expose breakpoint methods on their debugger;
//! older engines only offer the `*-PSBreakpoint` cmdlets. The API is chosen
//! once per session by [`select_breakpoint_api`] and used through
//! [`BreakpointService`].

mod action;
mod native;
mod script;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::debugging::{BreakpointDetails, BreakpointDetailsBase};
use crate::engine::{Engine, EngineBreakpoint, InvocationError};
use crate::errors::{BreakpointError, ExecutionError};
use crate::version::PowerShellVersionDetails;

pub use native::NativeBreakpointApi;
pub use script::ScriptBreakpointApi;

const BREAKPOINT_TARGET: &str = "psedit_runspace::breakpoints";

/// Optional behaviour attached to a breakpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakpointOptions {
    /// Expression that must be true for the breakpoint to stop.
    pub condition: Option<String>,
    /// Integer hit count at which the breakpoint stops.
    pub hit_condition: Option<String>,
    /// Message written to the host instead of stopping; `{expr}` is
    /// interpolated.
    pub log_message: Option<String>,
}

/// Breakpoint requested by the editor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BreakpointSpec {
    /// Stop at a script line.
    Line {
        /// Script containing the line.
        script: PathBuf,
        /// One-based line.
        line: u32,
        /// One-based column.
        #[serde(default)]
        column: Option<u32>,
        /// Optional behaviour.
        #[serde(flatten)]
        options: BreakpointOptions,
    },
    /// Stop when a command is invoked.
    Command {
        /// Command name or wildcard.
        name: String,
        /// Optional behaviour.
        #[serde(flatten)]
        options: BreakpointOptions,
    },
    /// Stop when a variable is accessed.
    Variable {
        /// Variable name without `$`.
        name: String,
        /// Optional behaviour.
        #[serde(flatten)]
        options: BreakpointOptions,
    },
    /// Any other kind.
    #[serde(other)]
    Unrecognized,
}

impl BreakpointSpec {
    /// Builds a line breakpoint without options.
    #[must_use]
    pub fn line(script: impl Into<PathBuf>, line: u32) -> Self {
        Self::Line {
            script: script.into(),
            line,
            column: None,
            options: BreakpointOptions::default(),
        }
    }

    /// Builds a command breakpoint without options.
    #[must_use]
    pub fn command(name: impl Into<String>) -> Self {
        Self::Command {
            name: name.into(),
            options: BreakpointOptions::default(),
        }
    }

    /// Replaces the breakpoint's options.
    #[must_use]
    pub fn with_options(mut self, new_options: BreakpointOptions) -> Self {
        match &mut self {
            Self::Line { options, .. }
            | Self::Command { options, .. }
            | Self::Variable { options, .. } => *options = new_options,
            Self::Unrecognized => {}
        }
        self
    }

    /// Kind name used in diagnostics.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Line { .. } => "line",
            Self::Command { .. } => "command",
            Self::Variable { .. } => "variable",
            Self::Unrecognized => "unrecognized",
        }
    }

    fn is_supported(&self) -> bool {
        matches!(self, Self::Line { .. } | Self::Command { .. })
    }

    fn options(&self) -> BreakpointOptions {
        match self {
            Self::Line { options, .. }
            | Self::Command { options, .. }
            | Self::Variable { options, .. } => options.clone(),
            Self::Unrecognized => BreakpointOptions::default(),
        }
    }

    fn unverified(&self, base: BreakpointDetailsBase, message: String) -> Option<BreakpointDetails> {
        let base = BreakpointDetailsBase {
            id: None,
            verified: false,
            message: Some(message),
            ..base
        };
        match self {
            Self::Line {
                script,
                line,
                column,
                ..
            } => Some(BreakpointDetails::Line {
                base,
                source: script.clone(),
                line: *line,
                column: *column,
            }),
            Self::Command { name, .. } => Some(BreakpointDetails::Command {
                base,
                name: name.clone(),
            }),
            Self::Variable { .. } | Self::Unrecognized => None,
        }
    }
}

/// Engine-specific breakpoint operations.
pub trait BreakpointApi: Send + Sync {
    /// Name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Sets a line breakpoint.
    fn set_line_breakpoint(
        &self,
        engine: &mut dyn Engine,
        cancellation: &CancellationToken,
        script: &Path,
        line: u32,
        column: Option<u32>,
        action: Option<&str>,
    ) -> Result<EngineBreakpoint, InvocationError>;

    /// Sets a command breakpoint.
    fn set_command_breakpoint(
        &self,
        engine: &mut dyn Engine,
        cancellation: &CancellationToken,
        name: &str,
        action: Option<&str>,
    ) -> Result<EngineBreakpoint, InvocationError>;

    /// Lists breakpoints in the runspace.
    fn list_breakpoints(
        &self,
        engine: &mut dyn Engine,
        cancellation: &CancellationToken,
    ) -> Result<Vec<EngineBreakpoint>, InvocationError>;

    /// Removes a breakpoint, returning whether it existed.
    fn remove_breakpoint(
        &self,
        engine: &mut dyn Engine,
        cancellation: &CancellationToken,
        id: u32,
    ) -> Result<bool, InvocationError>;
}

/// Chooses the breakpoint API for an engine.
///
/// Engines at version 7 or later must expose the native API; its absence is
/// an infrastructure failure rather than a reason to fall back.
pub fn select_breakpoint_api(
    version: &PowerShellVersionDetails,
    engine: &mut dyn Engine,
) -> Result<Arc<dyn BreakpointApi>, BreakpointError> {
    if !version.supports_native_breakpoints() {
        tracing::debug!(
            target: BREAKPOINT_TARGET,
            version = %version.version,
            "using cmdlet breakpoint API"
        );
        return Ok(Arc::new(ScriptBreakpointApi));
    }
    if engine.debugger_api().is_none() {
        return Err(BreakpointError::ApiUnavailable {
            version: version.version.to_string(),
        });
    }
    tracing::debug!(
        target: BREAKPOINT_TARGET,
        version = %version.version,
        "using native breakpoint API"
    );
    Ok(Arc::new(NativeBreakpointApi))
}

/// Uniform breakpoint operations over the selected API.
pub struct BreakpointService {
    api: Arc<dyn BreakpointApi>,
    hit_counters: AtomicU64,
}

impl BreakpointService {
    /// Wraps the selected API.
    #[must_use]
    pub fn new(api: Arc<dyn BreakpointApi>) -> Self {
        Self {
            api,
            hit_counters: AtomicU64::new(1),
        }
    }

    /// Sets each breakpoint and returns one detail per spec, in order.
    ///
    /// Unsupported kinds fail the whole request before the engine is called.
    /// A breakpoint the engine rejects yields an unverified detail carrying
    /// the engine's message.
    pub fn set_breakpoints(
        &self,
        engine: &mut dyn Engine,
        cancellation: &CancellationToken,
        specs: &[BreakpointSpec],
    ) -> Result<Vec<BreakpointDetails>, BreakpointError> {
        if let Some(spec) = specs.iter().find(|spec| !spec.is_supported()) {
            return Err(BreakpointError::UnsupportedKind {
                kind: spec.kind_name().to_owned(),
            });
        }
        specs
            .iter()
            .map(|spec| self.set_one(engine, cancellation, spec))
            .collect()
    }

    fn set_one(
        &self,
        engine: &mut dyn Engine,
        cancellation: &CancellationToken,
        spec: &BreakpointSpec,
    ) -> Result<BreakpointDetails, BreakpointError> {
        let options = spec.options();
        let base = BreakpointDetailsBase {
            condition: options.condition.clone(),
            hit_condition: options.hit_condition.clone(),
            log_message: options.log_message.clone(),
            ..BreakpointDetailsBase::default()
        };
        let unsupported = || BreakpointError::UnsupportedKind {
            kind: spec.kind_name().to_owned(),
        };

        let action = match action::build_action(&options, || {
            self.hit_counters.fetch_add(1, Ordering::Relaxed)
        }) {
            Ok(action) => action,
            Err(error) => {
                return spec
                    .unverified(base, error.to_string())
                    .ok_or_else(unsupported);
            }
        };

        let outcome = match spec {
            BreakpointSpec::Line {
                script,
                line,
                column,
                ..
            } => self.api.set_line_breakpoint(
                engine,
                cancellation,
                script,
                *line,
                *column,
                action.as_deref(),
            ),
            BreakpointSpec::Command { name, .. } => {
                self.api
                    .set_command_breakpoint(engine, cancellation, name, action.as_deref())
            }
            BreakpointSpec::Variable { .. } | BreakpointSpec::Unrecognized => {
                return Err(unsupported());
            }
        };

        match outcome {
            Ok(breakpoint) => {
                tracing::debug!(
                    target: BREAKPOINT_TARGET,
                    id = breakpoint.id,
                    kind = spec.kind_name(),
                    "breakpoint set"
                );
                match BreakpointDetails::from_engine(&breakpoint, base.clone()) {
                    Some(details) => Ok(details),
                    None => spec
                        .unverified(base, String::from("engine returned a different breakpoint kind"))
                        .ok_or_else(unsupported),
                }
            }
            Err(InvocationError::Stopped) => Err(ExecutionError::Cancelled.into()),
            Err(InvocationError::RunspaceUnusable { state }) => {
                Err(ExecutionError::RunspaceUnusable { state }.into())
            }
            Err(error) => {
                let message = rejection_message(&error);
                tracing::debug!(
                    target: BREAKPOINT_TARGET,
                    kind = spec.kind_name(),
                    message = %message,
                    "engine rejected breakpoint"
                );
                spec.unverified(base, message).ok_or_else(unsupported)
            }
        }
    }

    /// Lists line and command breakpoints in the runspace.
    pub fn get_breakpoints(
        &self,
        engine: &mut dyn Engine,
        cancellation: &CancellationToken,
    ) -> Result<Vec<BreakpointDetails>, BreakpointError> {
        let breakpoints = self
            .api
            .list_breakpoints(engine, cancellation)
            .map_err(ExecutionError::from_invocation)?;
        Ok(breakpoints
            .iter()
            .filter_map(|breakpoint| {
                BreakpointDetails::from_engine(breakpoint, BreakpointDetailsBase::default())
            })
            .collect())
    }

    /// Removes a breakpoint, returning whether it existed.
    pub fn remove_breakpoint(
        &self,
        engine: &mut dyn Engine,
        cancellation: &CancellationToken,
        id: u32,
    ) -> Result<bool, BreakpointError> {
        self.api
            .remove_breakpoint(engine, cancellation, id)
            .map_err(|error| ExecutionError::from_invocation(error).into())
    }
}

impl std::fmt::Debug for BreakpointService {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("BreakpointService")
            .field("api", &self.api.name())
            .finish_non_exhaustive()
    }
}

fn rejection_message(error: &InvocationError) -> String {
    match error {
        InvocationError::Script { records } => records
            .first()
            .map_or_else(|| error.to_string(), |record| record.message.clone()),
        InvocationError::Fault(message) => message.clone(),
        other => other.to_string(),
    }
}
