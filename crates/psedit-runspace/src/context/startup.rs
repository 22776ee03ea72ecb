//! Session startup, the session frame's loop and runspace rebuilds.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use crossbeam_channel::{Sender, bounded};
use psedit_config::Config;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::breakpoints::{BreakpointService, select_breakpoint_api};
use crate::cache::SessionCache;
use crate::cancellation::CancellationContext;
use crate::engine::{
    Command, EngineFactory, Invocation, InvocationError, OutputStream, ReadLine,
};
use crate::errors::{StartupError, StartupPhase};
use crate::executor::{ExecutorSettings, LoopExit, PipelineThreadExecutor, TaskContext};
use crate::frame::{FrameId, PowerShellContextFrame, PowerShellFrameType, RunspaceInfo};
use crate::observer::SessionObserver;
use crate::telemetry;
use crate::version::PowerShellVersionDetails;

use super::execution::ObserverHost;
use super::{CONTEXT_TARGET, ContextShared, PowerShellContext};

const PIPELINE_THREAD_NAME: &str = "psedit-pipeline";

impl PowerShellContext {
    /// Starts a session without an interactive prompt.
    ///
    /// Returns once the session runspace is open and every required module
    /// has been imported.
    pub fn start(
        config: Config,
        factory: Arc<dyn EngineFactory>,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<Self, StartupError> {
        Self::start_with_console(config, factory, observer, None)
    }

    /// Starts a session, reading interactive input from `console` when the
    /// configuration enables the prompt.
    pub fn start_with_console(
        config: Config,
        factory: Arc<dyn EngineFactory>,
        observer: Arc<dyn SessionObserver>,
        console: Option<Arc<dyn ReadLine>>,
    ) -> Result<Self, StartupError> {
        config
            .validate()
            .map_err(|error| StartupError::new(StartupPhase::Configuration, error.to_string()))?;

        let executor = PipelineThreadExecutor::new(
            CancellationContext::new(),
            ExecutorSettings {
                max_frame_depth: config.max_frame_depth,
            },
        );
        let enable_console = config.enable_console_repl;
        let shared = Arc::new_cyclic(|this| ContextShared {
            executor,
            factory,
            observer,
            config,
            cache: SessionCache::new(),
            subscription: Mutex::new(None),
            stops: Mutex::new(Vec::new()),
            pipeline: Mutex::new(None),
            ended: AtomicBool::new(false),
            this: this.clone(),
        });

        match (enable_console, console) {
            (true, Some(reader)) => {
                let weak = Arc::downgrade(&shared);
                shared.executor.install_console(reader, move |context, line| {
                    if let Some(shared) = weak.upgrade() {
                        shared.run_console_line(context, line);
                    }
                });
            }
            (true, None) => tracing::warn!(
                target: CONTEXT_TARGET,
                "console prompt enabled without an input reader"
            ),
            (false, _) => {}
        }

        let (ready_tx, ready_rx) = bounded(1);
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(PIPELINE_THREAD_NAME.to_owned())
            .spawn(move || thread_shared.pipeline_main(&ready_tx))
            .map_err(|error| StartupError::new(StartupPhase::PipelineThread, error.to_string()))?;

        let outcome = ready_rx.recv().unwrap_or_else(|_| {
            Err(StartupError::new(
                StartupPhase::PipelineThread,
                "pipeline thread exited during startup",
            ))
        });
        match outcome {
            Ok(()) => {
                *shared
                    .pipeline
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(handle);
                tracing::info!(target: CONTEXT_TARGET, "session started");
                Ok(Self { shared })
            }
            Err(error) => {
                if handle.join().is_err() {
                    tracing::error!(target: CONTEXT_TARGET, "pipeline thread panicked during startup");
                }
                Err(error)
            }
        }
    }
}

impl ContextShared {
    fn pipeline_main(self: Arc<Self>, ready: &Sender<Result<(), StartupError>>) {
        let span = telemetry::pipeline_span();
        let _entered = span.enter();
        self.executor.bind_current_thread();
        let bottom = match self.initialise() {
            Ok(frame_id) => {
                if let Some(runspace) = self.executor.current_runspace() {
                    telemetry::record_session_runspace(&span, runspace.id());
                }
                frame_id
            }
            Err(error) => {
                tracing::error!(
                    target: CONTEXT_TARGET,
                    phase = %error.phase,
                    error = %error,
                    "session startup failed"
                );
                self.executor.shutdown();
                self.release_frames();
                if ready.send(Err(error)).is_err() {
                    tracing::debug!(target: CONTEXT_TARGET, "startup caller went away");
                }
                return;
            }
        };
        if ready.send(Ok(())).is_err() {
            tracing::debug!(target: CONTEXT_TARGET, "startup caller went away");
        }
        self.run_session(bottom, &span);
        self.release_frames();
        tracing::info!(target: CONTEXT_TARGET, "pipeline thread exiting");
    }

    /// Services the session frame, rebuilding the runspace whenever the
    /// stack unwinds because it broke.
    fn run_session(&self, mut bottom: FrameId, span: &Span) {
        loop {
            match self.executor.run_frame_loop(bottom) {
                LoopExit::Shutdown => break,
                LoopExit::RunspaceUnusable => {
                    self.pop_frame(bottom);
                    match self.reinitialise() {
                        Ok((frame_id, runspace)) => {
                            bottom = frame_id;
                            telemetry::record_session_runspace(span, runspace.id());
                            self.observer.runspace_reinitialised(&runspace);
                        }
                        Err(error) => {
                            tracing::error!(
                                target: CONTEXT_TARGET,
                                phase = %error.phase,
                                error = %error,
                                "could not rebuild the session runspace"
                            );
                            self.end_session(&error.to_string());
                            break;
                        }
                    }
                }
                LoopExit::ExitRequested | LoopExit::Popped => {
                    self.end_session("session frame exited");
                    break;
                }
            }
        }
    }

    fn release_frames(&self) {
        drop(
            self.subscription
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        self.lock_stops().clear();
        drop(self.executor.pop_all_frames());
    }

    fn initialise(&self) -> Result<FrameId, StartupError> {
        let (frame_id, runspace) = self.open_session_frame()?;
        let api = {
            let token = CancellationToken::new();
            self.executor
                .with_frame_engine(frame_id, token, |context| {
                    select_breakpoint_api(&runspace.version(), context.engine())
                })
                .map_err(|error| StartupError::execution(StartupPhase::BreakpointApi, error))?
                .map_err(|error| StartupError::new(StartupPhase::BreakpointApi, error.to_string()))?
        };
        self.cache.set_breakpoints(BreakpointService::new(api));

        self.executor
            .run_on_frame(frame_id, false, |context| {
                self.apply_execution_policy(context);
                self.load_profiles(context);
                self.import_required_modules(context)
            })
            .map_err(|error| StartupError::execution(StartupPhase::ModuleImport, error))??;
        Ok(frame_id)
    }

    fn reinitialise(&self) -> Result<(FrameId, RunspaceInfo), StartupError> {
        tracing::warn!(target: CONTEXT_TARGET, "rebuilding the session runspace");
        self.cache.clear_commands();
        let (frame_id, runspace) = self.open_session_frame()?;
        self.executor
            .run_on_frame(frame_id, false, |context| {
                self.apply_execution_policy(context);
                self.import_required_modules(context)
            })
            .map_err(|error| StartupError::execution(StartupPhase::ModuleImport, error))??;
        Ok((frame_id, runspace))
    }

    /// Creates and opens a runspace, then pushes the session frame for it.
    fn open_session_frame(&self) -> Result<(FrameId, RunspaceInfo), StartupError> {
        let runspace = self
            .factory
            .create_runspace()
            .map_err(|error| StartupError::engine(StartupPhase::RunspaceOpen, error))?;
        runspace
            .open()
            .map_err(|error| StartupError::engine(StartupPhase::RunspaceOpen, error))?;
        let mut engine = self
            .factory
            .create_engine(&runspace)
            .map_err(|error| StartupError::engine(StartupPhase::EngineCreation, error))?;
        let version =
            PowerShellVersionDetails::get_version_details(engine.as_mut(), &CancellationToken::new());
        tracing::info!(
            target: CONTEXT_TARGET,
            runspace = %runspace.id(),
            version = %version.version,
            edition = ?version.edition,
            "session runspace opened"
        );
        let info = RunspaceInfo::new(runspace, version);
        let frame = PowerShellContextFrame::new(Some(engine), info.clone(), PowerShellFrameType::NORMAL);
        let frame_id = self
            .push_frame(frame)
            .map_err(|error| StartupError::execution(StartupPhase::EngineCreation, error))?;
        Ok((frame_id, info))
    }

    fn apply_execution_policy(&self, context: &mut TaskContext<'_>) {
        let Some(policy) = self.config.execution_policy else {
            return;
        };
        let command = Command::named("Set-ExecutionPolicy")
            .with_parameter("ExecutionPolicy", policy.to_string())
            .with_parameter("Scope", "Process")
            .with_switch("Force");
        if let Err(error) = self.invoke_startup(context, &command) {
            tracing::warn!(
                target: CONTEXT_TARGET,
                policy = %policy,
                error = %error,
                "could not set the execution policy"
            );
        }
    }

    fn load_profiles(&self, context: &mut TaskContext<'_>) {
        let profiles = self.config.effective_profile_paths();
        if profiles.is_empty() {
            return;
        }
        if self
            .config
            .execution_policy
            .is_some_and(|policy| policy.blocks_unsigned_scripts())
        {
            tracing::debug!(
                target: CONTEXT_TARGET,
                "execution policy may reject unsigned profiles"
            );
        }
        for profile in profiles {
            let command = Command::script(format!(". '{}'", profile.as_str().replace('\'', "''")));
            match self.invoke_startup(context, &command) {
                Ok(()) => tracing::debug!(
                    target: CONTEXT_TARGET,
                    profile = %profile,
                    "profile loaded"
                ),
                Err(error) => {
                    tracing::warn!(
                        target: CONTEXT_TARGET,
                        profile = %profile,
                        error = %error,
                        "profile failed to load"
                    );
                    self.observer.output(
                        OutputStream::Warning,
                        &format!("profile '{profile}' failed to load: {error}"),
                    );
                }
            }
        }
    }

    fn import_required_modules(&self, context: &mut TaskContext<'_>) -> Result<(), StartupError> {
        for module in &self.config.required_modules {
            let command = Command::named("Import-Module")
                .with_parameter("Name", module.as_str())
                .with_parameter("ErrorAction", "Stop");
            self.invoke_startup(context, &command).map_err(|error| {
                StartupError::new(StartupPhase::ModuleImport, format!("{module}: {error}"))
            })?;
            tracing::debug!(target: CONTEXT_TARGET, module = %module, "module imported");
        }
        Ok(())
    }

    fn invoke_startup(
        &self,
        context: &mut TaskContext<'_>,
        command: &Command,
    ) -> Result<(), InvocationError> {
        let token = context.cancellation().clone();
        let host = ObserverHost::new(self.observer.as_ref());
        let invocation = Invocation {
            cancellation: &token,
            host: &host,
            write_output_to_host: true,
            add_to_history: false,
        };
        context.engine().invoke(command, &invocation).map(drop)
    }
}
