//! Running session plus the doubles behind it.

use std::sync::Arc;

use psedit_config::Config;
use serde_json::Value;

use crate::context::{ExecutionOutput, PowerShellContext};
use crate::engine::{Command, DebuggerStopEvent, ReadLine};
use crate::errors::{ExecutionError, StartupError};
use crate::executor::TaskHandle;
use crate::observer::SessionObserver;
use crate::options::ExecutionOptions;

use super::engine::{Behaviour, FakeFactory, FakeRunspace, FakeRuntime};
use super::observer::{PATIENCE, RecordingObserver, ScriptedConsole};

/// Session started against a [`FakeRuntime`]; shut down when dropped.
pub struct TestSession {
    /// Engine double shared by every runspace of the session.
    pub runtime: Arc<FakeRuntime>,
    /// Observer receiving session events.
    pub observer: Arc<RecordingObserver>,
    /// Console double, when the prompt is enabled.
    pub console: Option<Arc<ScriptedConsole>>,
    /// Session under test.
    pub context: PowerShellContext,
}

impl TestSession {
    /// Starts a session with default configuration.
    #[must_use]
    pub fn start(runtime: Arc<FakeRuntime>) -> Self {
        Self::try_start(runtime, Config::default()).expect("session should start")
    }

    /// Starts a session, returning startup failures.
    pub fn try_start(runtime: Arc<FakeRuntime>, config: Config) -> Result<Self, StartupError> {
        let observer = Arc::new(RecordingObserver::default());
        let context = PowerShellContext::start(
            config,
            FakeFactory::new(&runtime),
            Arc::clone(&observer) as Arc<dyn SessionObserver>,
        )?;
        Ok(Self {
            runtime,
            observer,
            console: None,
            context,
        })
    }

    /// Starts a session with the interactive prompt enabled.
    #[must_use]
    pub fn with_console(runtime: Arc<FakeRuntime>) -> Self {
        let observer = Arc::new(RecordingObserver::default());
        let console = Arc::new(ScriptedConsole::default());
        let config = Config {
            enable_console_repl: true,
            ..Config::default()
        };
        let context = PowerShellContext::start_with_console(
            config,
            FakeFactory::new(&runtime),
            Arc::clone(&observer) as Arc<dyn SessionObserver>,
            Some(Arc::clone(&console) as Arc<dyn ReadLine>),
        )
        .expect("session should start");
        Self {
            runtime,
            observer,
            console: Some(console),
            context,
        }
    }

    /// Queues a script with default options.
    #[must_use]
    pub fn run(&self, script: &str) -> TaskHandle<ExecutionOutput> {
        self.context
            .execute_command(Command::script(script), ExecutionOptions::default())
    }

    /// Queues a script with the given options.
    #[must_use]
    pub fn run_with(&self, script: &str, options: ExecutionOptions) -> TaskHandle<ExecutionOutput> {
        self.context.execute_command(Command::script(script), options)
    }

    /// Runs a script and waits for its output values.
    pub fn evaluate(&self, script: &str) -> Result<Vec<Value>, ExecutionError> {
        self.run(script)
            .wait_timeout(PATIENCE)
            .map(|output| output.values)
    }
}

impl Drop for TestSession {
    fn drop(&mut self) {
        self.context.shutdown();
    }
}

/// Builds a stop event for a script line.
#[must_use]
pub fn stop_at(script: &str, line: u32) -> DebuggerStopEvent {
    DebuggerStopEvent {
        script_path: Some(script.into()),
        line,
        column: 1,
        breakpoint_ids: vec![1],
        invocation_name: None,
    }
}

/// State shared by behaviour steps.
#[derive(Default)]
pub struct TestWorld {
    /// Engine double configured by `given` steps.
    pub runtime: Arc<FakeRuntime>,
    /// Session started by a `when` step.
    pub session: Option<TestSession>,
    /// Request left running while steps inspect the session.
    pub pending: Option<TaskHandle<ExecutionOutput>>,
    /// Result of the last completed request.
    pub last_result: Option<Result<ExecutionOutput, ExecutionError>>,
    /// Result of the last debugger command.
    pub debugger_result: Option<Result<ExecutionOutput, ExecutionError>>,
    /// Requests queued behind the pending one, by script.
    pub queued: Vec<(String, TaskHandle<ExecutionOutput>)>,
    /// Remote runspace created by a step.
    pub remote: Option<Arc<FakeRunspace>>,
    /// Handle of the request servicing the entered runspace.
    pub entered: Option<TaskHandle<()>>,
}

impl TestWorld {
    /// Starts the session if it is not running yet.
    pub fn session(&mut self) -> &TestSession {
        let runtime = Arc::clone(&self.runtime);
        self.session.get_or_insert_with(|| TestSession::start(runtime))
    }

    /// Scripts a command that stops in the debugger.
    pub fn script_stop(&self, script: &str, line: u32) {
        self.runtime
            .on(script, Behaviour::Stop(stop_at("/workspace/app.ps1", line)));
    }

    /// Session, panicking when no step started it.
    #[must_use]
    pub fn running(&self) -> &TestSession {
        self.session.as_ref().expect("session should be running")
    }

    /// Waits for the pending request and stores its result.
    pub fn settle(&mut self) {
        if let Some(handle) = self.pending.take() {
            self.last_result = Some(handle.wait_timeout(PATIENCE));
        }
    }

    /// Queued request for `script`.
    #[must_use]
    pub fn queued(&self, script: &str) -> Option<&TaskHandle<ExecutionOutput>> {
        self.queued
            .iter()
            .find(|(queued, _)| queued == script)
            .map(|(_, handle)| handle)
    }
}
