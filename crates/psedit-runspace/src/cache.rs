//! Lookups cached for the lifetime of one session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::breakpoints::BreakpointService;
use crate::engine::{Command, Engine, Invocation, InvocationError, SilentHost};

const CACHE_TARGET: &str = "psedit_runspace::cache";

/// Facts about a command resolved through `Get-Command`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CommandInfo {
    /// Command name.
    pub name: String,
    /// Cmdlet, function, alias or application.
    pub command_type: String,
    /// Module exporting the command.
    #[serde(default)]
    pub module_name: Option<String>,
}

/// Session-scoped caches shared by requests.
#[derive(Default)]
pub struct SessionCache {
    breakpoints: OnceCell<Arc<BreakpointService>>,
    commands: Mutex<HashMap<String, Option<CommandInfo>>>,
    synopses: Mutex<HashMap<String, Option<String>>>,
}

impl SessionCache {
    /// Creates empty caches.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Breakpoint service selected at startup.
    #[must_use]
    pub fn breakpoints(&self) -> Option<Arc<BreakpointService>> {
        self.breakpoints.get().cloned()
    }

    pub(crate) fn set_breakpoints(&self, service: BreakpointService) {
        if self.breakpoints.set(Arc::new(service)).is_err() {
            tracing::debug!(target: CACHE_TARGET, "breakpoint API already selected");
        }
    }

    /// Resolves a command, consulting the engine only on the first lookup of
    /// each name. Unknown commands are cached as `None`.
    pub fn command_info(
        &self,
        engine: &mut dyn Engine,
        cancellation: &CancellationToken,
        name: &str,
    ) -> Result<Option<CommandInfo>, InvocationError> {
        let key = name.to_ascii_lowercase();
        if let Some(cached) = self.lock_commands().get(&key) {
            return Ok(cached.clone());
        }
        let command = Command::named("Get-Command")
            .with_parameter("Name", name)
            .with_parameter("ErrorAction", "Ignore");
        let values = invoke_silently(engine, cancellation, &command)?;
        let info = values
            .into_iter()
            .next()
            .and_then(|value| serde_json::from_value::<CommandInfo>(value).ok());
        self.lock_commands().insert(key, info.clone());
        Ok(info)
    }

    /// Resolves a command's help synopsis, cached like
    /// [`SessionCache::command_info`].
    pub fn command_synopsis(
        &self,
        engine: &mut dyn Engine,
        cancellation: &CancellationToken,
        name: &str,
    ) -> Result<Option<String>, InvocationError> {
        let key = name.to_ascii_lowercase();
        if let Some(cached) = self.lock_synopses().get(&key) {
            return Ok(cached.clone());
        }
        let command = Command::named("Get-Help")
            .with_parameter("Name", name)
            .with_parameter("ErrorAction", "Ignore");
        let values = invoke_silently(engine, cancellation, &command)?;
        let synopsis = values.first().and_then(synopsis_of);
        self.lock_synopses().insert(key, synopsis.clone());
        Ok(synopsis)
    }

    /// Forgets command lookups, e.g. after the runspace was rebuilt.
    pub fn clear_commands(&self) {
        self.lock_commands().clear();
        self.lock_synopses().clear();
    }

    fn lock_commands(&self) -> std::sync::MutexGuard<'_, HashMap<String, Option<CommandInfo>>> {
        self.commands.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_synopses(&self) -> std::sync::MutexGuard<'_, HashMap<String, Option<String>>> {
        self.synopses.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SessionCache {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SessionCache")
            .field("breakpoints", &self.breakpoints.get())
            .field("commands", &self.lock_commands().len())
            .finish_non_exhaustive()
    }
}

fn synopsis_of(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(text) => text.as_str(),
        Value::Object(members) => members.get("Synopsis")?.as_str()?,
        _ => return None,
    };
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

fn invoke_silently(
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
