//! Shared configuration for the PowerShell editor session host.
//!
//! Values are layered by `ortho_config`: defaults, then `psedit.toml`, then
//! `PSEDIT_*` environment variables, then command-line flags. The resulting
//! [`Config`] is consumed by the runspace core when it builds the session
//! runspace and by the telemetry helper when it installs the subscriber.

mod defaults;
mod logging;
mod policy;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use defaults::{
    DEFAULT_LOG_FILTER, DEFAULT_MAX_FRAME_DEPTH, default_load_profiles, default_log_filter,
    default_log_filter_string, default_log_format, default_max_frame_depth,
};
pub use logging::{LogFormat, LogFormatParseError};
pub use policy::{ExecutionPolicy, ExecutionPolicyParseError};

/// Session configuration shared by the host binaries and the runspace core.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "PSEDIT")]
pub struct Config {
    /// `tracing` filter expression, e.g. `info,psedit_runspace=debug`.
    #[ortho_config(default = default_log_filter_string())]
    pub log_filter: String,
    /// Output format of the structured log.
    #[ortho_config(default = default_log_format())]
    pub log_format: LogFormat,
    /// Process-scope execution policy applied before profiles load.
    #[serde(default)]
    pub execution_policy: Option<ExecutionPolicy>,
    /// Whether profile scripts are dot-sourced into the session runspace.
    #[ortho_config(default = default_load_profiles())]
    pub load_profiles: bool,
    /// Profile scripts to load, in order.
    #[serde(default)]
    #[ortho_config(merge_strategy = "append")]
    pub profile_paths: Vec<Utf8PathBuf>,
    /// Modules that must import successfully for the session to start.
    #[serde(default)]
    #[ortho_config(merge_strategy = "append")]
    pub required_modules: Vec<String>,
    /// Whether the pipeline thread drives an interactive console prompt.
    #[ortho_config(default = false)]
    pub enable_console_repl: bool,
    /// Maximum number of frames on the execution stack.
    #[ortho_config(default = default_max_frame_depth())]
    pub max_frame_depth: usize,
    /// Workspace root used to classify stack frames as user or external code.
    #[serde(default)]
    pub workspace_root: Option<Utf8PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
            execution_policy: None,
            load_profiles: default_load_profiles(),
            profile_paths: Vec::new(),
            required_modules: Vec::new(),
            enable_console_repl: false,
            max_frame_depth: default_max_frame_depth(),
            workspace_root: None,
        }
    }
}

impl Config {
    /// Filter expression used when installing the tracing subscriber.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        self.log_filter.as_str()
    }

    /// Configured log output format.
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Profile scripts to load, or nothing when profile loading is disabled.
    #[must_use]
    pub fn effective_profile_paths(&self) -> &[Utf8PathBuf] {
        if self.load_profiles {
            self.profile_paths.as_slice()
        } else {
            &[]
        }
    }

    /// Rejects values the runspace core cannot honour.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.max_frame_depth == 0 {
            return Err(ConfigValidationError::ZeroFrameDepth);
        }
        if let Some(name) = self
            .required_modules
            .iter()
            .find(|name| name.trim().is_empty())
        {
            return Err(ConfigValidationError::BlankModuleName {
                value: name.clone(),
            });
        }
        Ok(())
    }
}

/// Configuration values that parse but cannot be used.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigValidationError {
    /// The frame stack needs room for at least the session frame.
    #[error("max_frame_depth must be at least 1")]
    ZeroFrameDepth,
    /// A required module entry was empty.
    #[error("required module name '{value}' is blank")]
    BlankModuleName {
        /// Offending entry.
        value: String,
    },
}
