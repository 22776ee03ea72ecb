//! Structured telemetry for hosts embedding the runspace core.
//!
//! Every event raised on the pipeline thread sits inside a `pipeline` span
//! carrying the session runspace id, so output from nested frames can be told
//! apart from caller threads.

use std::io::{self, IsTerminal};

use once_cell::sync::OnceCell;
use tracing::{Span, Subscriber, field, subscriber::SetGlobalDefaultError};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

use psedit_config::{Config, LogFormat};

use crate::engine::RunspaceId;

static TELEMETRY_GUARD: OnceCell<()> = OnceCell::new();

const PIPELINE_SPAN_TARGET: &str = "psedit_runspace::pipeline";

/// Targets that trace every scope entry; held at `info` unless the
/// configured filter names them.
const CHATTY_TARGETS: [&str; 1] = ["psedit_runspace::cancellation"];

/// Handle returned when telemetry has been initialised.
#[derive(Debug, Default, Clone, Copy)]
pub struct TelemetryHandle;

/// Errors encountered while configuring telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// Failed to parse the configured log filter expression.
    #[error("invalid log filter: {0}")]
    Filter(String),
    /// Failed to install the tracing subscriber.
    #[error("failed to install telemetry subscriber: {0}")]
    Subscriber(SetGlobalDefaultError),
}

/// Installs the global tracing subscriber on the first call.
///
/// Later calls return a fresh [`TelemetryHandle`] without touching the
/// global state. Output goes to stderr so stdout stays free for the editor
/// protocol.
///
/// # Examples
///
/// ```rust
/// use psedit_config::Config;
/// use psedit_runspace::telemetry;
///
/// # fn main() -> Result<(), psedit_runspace::telemetry::TelemetryError> {
/// let config = Config::default();
/// let first = telemetry::initialise(&config)?;
/// let second = telemetry::initialise(&config)?;
/// drop(first);
/// drop(second);
/// # Ok(())
/// # }
/// ```
pub fn initialise(config: &Config) -> Result<TelemetryHandle, TelemetryError> {
    TELEMETRY_GUARD
        .get_or_try_init(|| install_subscriber(config))
        .map(|_| TelemetryHandle)
}

/// Span entered by the pipeline thread for the life of the session.
pub(crate) fn pipeline_span() -> Span {
    tracing::info_span!(target: PIPELINE_SPAN_TARGET, "pipeline", runspace = field::Empty)
}

/// Records the runspace now serving as the session's bottom frame.
pub(crate) fn record_session_runspace(span: &Span, runspace: RunspaceId) {
    span.record("runspace", field::display(runspace));
}

fn filter_directives(filter: &str) -> Vec<String> {
    let mut directives: Vec<String> = filter
        .split(',')
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
        .map(str::to_owned)
        .collect();
    for target in CHATTY_TARGETS {
        if !directives.iter().any(|directive| directive.starts_with(target)) {
            directives.push(format!("{target}=info"));
        }
    }
    directives
}

fn install_subscriber(config: &Config) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_new(filter_directives(config.log_filter()).join(","))
        .map_err(|error| TelemetryError::Filter(error.to_string()))?;

    let builder = |filter: EnvFilter| {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_level(true)
            .with_thread_ids(false)
            .with_thread_names(true)
            .with_writer(io::stderr)
            .with_ansi(io::stderr().is_terminal())
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
    };

    let subscriber: Box<dyn Subscriber + Send + Sync> = match config.log_format() {
        LogFormat::Json => Box::new(
            builder(filter)
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
                .finish(),
        ),
        LogFormat::Compact => Box::new(builder(filter).compact().finish()),
    };

    tracing::subscriber::set_global_default(subscriber).map_err(TelemetryError::Subscriber)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::filter_directives;

    #[rstest]
    #[case("info", &["info", "psedit_runspace::cancellation=info"])]
    #[case(" debug , psedit_runspace::executor=trace", &[
        "debug",
        "psedit_runspace::executor=trace",
        "psedit_runspace::cancellation=info",
    ])]
    #[case("", &["psedit_runspace::cancellation=info"])]
    fn quiets_scope_tracing_by_default(#[case] filter: &str, #[case] expected: &[&str]) {
        assert_eq!(filter_directives(filter), expected);
    }

    #[rstest]
    fn honours_an_explicit_cancellation_directive() {
        assert_eq!(
            filter_directives("warn,psedit_runspace::cancellation=trace"),
            ["warn", "psedit_runspace::cancellation=trace"]
        );
    }
}
