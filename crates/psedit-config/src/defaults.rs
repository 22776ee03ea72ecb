//! Default values shared by the configuration loader and programmatic callers.

use crate::logging::LogFormat;

/// Default log filter expression.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Maximum number of nested frames (debugger stops, remote sessions,
/// non-interactive executions) stacked above the session frame.
pub const DEFAULT_MAX_FRAME_DEPTH: usize = 32;

/// Default log filter expression.
#[must_use]
pub fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Owned log filter value used where allocation is required (e.g. serde).
#[must_use]
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format.
#[must_use]
pub fn default_log_format() -> LogFormat {
    LogFormat::Json
}

/// Default nesting limit for the frame stack.
#[must_use]
pub fn default_max_frame_depth() -> usize {
    DEFAULT_MAX_FRAME_DEPTH
}

/// Profiles are loaded unless explicitly disabled.
#[must_use]
pub fn default_load_profiles() -> bool {
    true
}
