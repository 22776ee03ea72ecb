//! In-memory engine that records invocations and scripts their outcomes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::engine::{
    BreakpointUpdateKind, BreakpointUpdatedEvent, Command, CommandKind, DebuggerCommandResults,
    DebuggerResumeAction, DebuggerStopEvent, Engine, EngineBreakpoint, EngineBreakpointKind,
    EngineDebugger, EngineError, EngineFactory, EngineStackFrame, EngineVariable, ErrorRecord,
    Invocation, InvocationError, OutputStream, Runspace, RunspaceEventHandler, RunspaceId,
    RunspaceOrigin, RunspaceState, SubscriptionId, VariableScope,
};
use crate::version::VERSION_QUERY;

/// Script path the fake engine refuses to set breakpoints in.
pub const MISSING_SCRIPT: &str = "/workspace/missing.ps1";

/// Gate that blocks an invocation until opened or cancelled.
#[derive(Debug, Default)]
pub struct Latch {
    open: Mutex<bool>,
    changed: Condvar,
}

impl Latch {
    /// Creates a closed latch.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Releases every waiter.
    pub fn open(&self) {
        *self.open.lock().expect("latch mutex poisoned") = true;
        self.changed.notify_all();
    }

    /// Waits until the latch opens (`true`) or `token` is cancelled
    /// (`false`).
    pub fn wait(&self, token: &CancellationToken) -> bool {
        let mut open = self.open.lock().expect("latch mutex poisoned");
        loop {
            if *open {
                return true;
            }
            if token.is_cancelled() {
                return false;
            }
            let (guard, _) = self
                .changed
                .wait_timeout(open, Duration::from_millis(5))
                .expect("latch mutex poisoned");
            open = guard;
        }
    }
}

/// Outcome scripted for a command text.
#[derive(Debug, Clone)]
pub enum Behaviour {
    /// Returns the values, rendering them when output goes to the host.
    Return(Vec<Value>),
    /// Writes one line to a host stream.
    Write(OutputStream, String),
    /// Raises a script error record.
    Fail(String),
    /// Fails outside user script content.
    Fault(String),
    /// Blocks until the latch opens or the invocation is cancelled.
    Block(Arc<Latch>),
    /// Raises a debugger stop and reports the chosen action as output.
    Stop(DebuggerStopEvent),
    /// Breaks the runspace.
    Break,
    /// Panics on the calling thread.
    Panic(String),
}

/// One recorded engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    /// Runspace the engine was bound to.
    pub runspace: RunspaceId,
    /// Script text or command name.
    pub text: String,
    /// Name of the calling thread.
    pub thread: Option<String>,
    /// Whether the call was a debugger prompt command.
    pub at_debugger: bool,
    /// Whether output was rendered to the host.
    pub to_host: bool,
}

struct RuntimeState {
    calls: Vec<Call>,
    behaviours: HashMap<String, Behaviour>,
    version: Result<Value, String>,
    native_debugger: bool,
    runspaces: Vec<Arc<FakeRunspace>>,
    breakpoints: Vec<EngineBreakpoint>,
    next_breakpoint: u32,
    stack: Vec<EngineStackFrame>,
    variables: HashMap<VariableScope, Vec<EngineVariable>>,
    resume_actions: Vec<DebuggerResumeAction>,
    refuse_runspaces: bool,
    failing_modules: Vec<String>,
    engines_created: usize,
    engines_disposed: usize,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            behaviours: HashMap::new(),
            version: Ok(version_record("7.4.1", "Core", "AMD64")),
            native_debugger: true,
            runspaces: Vec::new(),
            breakpoints: Vec::new(),
            next_breakpoint: 1,
            stack: Vec::new(),
            variables: HashMap::new(),
            resume_actions: Vec::new(),
            refuse_runspaces: false,
            failing_modules: Vec::new(),
            engines_created: 0,
            engines_disposed: 0,
        }
    }
}

/// Builds the record the version query returns.
#[must_use]
pub fn version_record(version: &str, edition: &str, architecture: &str) -> Value {
    json!({
        "PSVersion": version,
        "PSEdition": edition,
        "Architecture": architecture,
    })
}

/// State shared by the fake factory, its runspaces and engines.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
    next_runspace: AtomicU64,
}

impl FakeRuntime {
    /// Creates a runtime reporting PowerShell 7.4 with the native debugger.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RuntimeState> {
        self.state.lock().expect("runtime mutex poisoned")
    }

    /// Scripts the outcome of a command text or name.
    pub fn on(&self, text: impl Into<String>, behaviour: Behaviour) {
        self.lock().behaviours.insert(text.into(), behaviour);
    }

    /// Sets the version query response.
    pub fn report_version(&self, version: &str, edition: &str) {
        self.lock().version = Ok(version_record(version, edition, "AMD64"));
    }

    /// Makes the version query fail.
    pub fn fail_version_query(&self) {
        self.lock().version = Err(String::from("version table unavailable"));
    }

    /// Toggles the native debugger API.
    pub fn set_native_debugger(&self, available: bool) {
        self.lock().native_debugger = available;
    }

    /// Sets the call stack reported while stopped.
    pub fn set_stack(&self, stack: Vec<EngineStackFrame>) {
        self.lock().stack = stack;
    }

    /// Sets the variables of one scope.
    pub fn set_variables(&self, scope: VariableScope, variables: Vec<EngineVariable>) {
        self.lock().variables.insert(scope, variables);
    }

    /// Makes the factory refuse new runspaces.
    pub fn refuse_runspaces(&self) {
        self.lock().refuse_runspaces = true;
    }

    /// Makes `Import-Module` fail for a module.
    pub fn fail_module(&self, name: &str) {
        self.lock().failing_modules.push(name.to_owned());
    }

    /// Recorded calls, oldest first.
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Texts of recorded calls, oldest first.
    #[must_use]
    pub fn call_texts(&self) -> Vec<String> {
        self.calls().into_iter().map(|call| call.text).collect()
    }

    /// Whether a call with this text was recorded.
    #[must_use]
    pub fn was_called(&self, text: &str) -> bool {
        self.lock().calls.iter().any(|call| call.text == text)
    }

    /// Actions returned by debugger stop handlers.
    #[must_use]
    pub fn resume_actions(&self) -> Vec<DebuggerResumeAction> {
        self.lock().resume_actions.clone()
    }

    /// Breakpoints currently set.
    #[must_use]
    pub fn breakpoints(&self) -> Vec<EngineBreakpoint> {
        self.lock().breakpoints.clone()
    }

    /// Runspaces created so far, oldest first.
    #[must_use]
    pub fn runspaces(&self) -> Vec<Arc<FakeRunspace>> {
        self.lock().runspaces.clone()
    }

    /// Most recently created runspace.
    #[must_use]
    pub fn latest_runspace(&self) -> Arc<FakeRunspace> {
        self.lock()
            .runspaces
            .last()
            .cloned()
            .expect("no runspace was created")
    }

    /// Number of engine instances created and disposed.
    #[must_use]
    pub fn engine_counts(&self) -> (usize, usize) {
        let state = self.lock();
        (state.engines_created, state.engines_disposed)
    }

    /// Registers an opened remote runspace.
    #[must_use]
    pub fn remote_runspace(&self, computer: &str) -> Arc<FakeRunspace> {
        let runspace = Arc::new(FakeRunspace::new(
            self.allocate_id(),
            RunspaceOrigin::PSSession,
            Some(computer.to_owned()),
            RunspaceState::Opened,
        ));
        self.lock().runspaces.push(Arc::clone(&runspace));
        runspace
    }

    fn allocate_id(&self) -> RunspaceId {
        let next = self.next_runspace.fetch_add(1, Ordering::Relaxed) + 1;
        RunspaceId(u32::try_from(next).expect("runspace id overflow"))
    }

    fn find_runspace(&self, id: RunspaceId) -> Option<Arc<FakeRunspace>> {
        self.lock()
            .runspaces
            .iter()
            .find(|runspace| runspace.id == id)
            .cloned()
    }

    fn record(&self, runspace: RunspaceId, command: &Command, at_debugger: bool, to_host: bool) {
        let call = Call {
            runspace,
            text: command.text().to_owned(),
            thread: thread::current().name().map(str::to_owned),
            at_debugger,
            to_host,
        };
        self.lock().calls.push(call);
    }

    fn behaviour(&self, text: &str) -> Option<Behaviour> {
        self.lock().behaviours.get(text).cloned()
    }

    fn add_breakpoint(
        &self,
        kind: EngineBreakpointKind,
        action: Option<&str>,
    ) -> Result<EngineBreakpoint, InvocationError> {
        if let EngineBreakpointKind::Line { script, .. } = &kind {
            if script == Path::new(MISSING_SCRIPT) {
                return Err(InvocationError::Script {
                    records: vec![ErrorRecord::new(format!(
                        "Cannot find path '{}' because it does not exist.",
                        script.display()
                    ))],
                });
            }
        }
        let mut state = self.lock();
        let breakpoint = EngineBreakpoint {
            id: state.next_breakpoint,
            kind,
            enabled: true,
            action: action.map(str::to_owned),
            hit_count: 0,
        };
        state.next_breakpoint += 1;
        state.breakpoints.push(breakpoint.clone());
        Ok(breakpoint)
    }

    fn remove_breakpoint(&self, id: u32) -> Option<EngineBreakpoint> {
        let mut state = self.lock();
        let position = state.breakpoints.iter().position(|bp| bp.id == id)?;
        Some(state.breakpoints.remove(position))
    }
}

/// Runspace double that fans events out to its subscribers.
pub struct FakeRunspace {
    id: RunspaceId,
    origin: RunspaceOrigin,
    computer: Option<String>,
    state: Mutex<RunspaceState>,
    listeners: Mutex<Vec<(SubscriptionId, Arc<dyn RunspaceEventHandler>)>>,
    next_subscription: AtomicU64,
}

impl FakeRunspace {
    fn new(
        id: RunspaceId,
        origin: RunspaceOrigin,
        computer: Option<String>,
        state: RunspaceState,
    ) -> Self {
        Self {
            id,
            origin,
            computer,
            state: Mutex::new(state),
            listeners: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Identifier of the runspace.
    #[must_use]
    pub fn runspace_id(&self) -> RunspaceId {
        self.id
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.listeners.lock().expect("listener mutex poisoned").len()
    }

    /// Changes the state and notifies subscribers.
    pub fn set_state(&self, state: RunspaceState) {
        *self.state.lock().expect("state mutex poisoned") = state;
        for (_, listener) in self.snapshot_listeners() {
            listener.state_changed(self.id, state);
        }
    }

    /// Raises a debugger stop to the newest subscriber.
    pub fn raise_debugger_stop(&self, event: &DebuggerStopEvent) -> DebuggerResumeAction {
        self.snapshot_listeners()
            .last()
            .map_or(DebuggerResumeAction::Continue, |(_, listener)| {
                listener.debugger_stop(event)
            })
    }

    /// Raises a breakpoint change to every subscriber.
    pub fn raise_breakpoint_updated(&self, event: &BreakpointUpdatedEvent) {
        for (_, listener) in self.snapshot_listeners() {
            listener.breakpoint_updated(event);
        }
    }

    fn snapshot_listeners(&self) -> Vec<(SubscriptionId, Arc<dyn RunspaceEventHandler>)> {
        self.listeners
            .lock()
            .expect("listener mutex poisoned")
            .clone()
    }
}

impl Runspace for FakeRunspace {
    fn id(&self) -> RunspaceId {
        self.id
    }

    fn origin(&self) -> RunspaceOrigin {
        self.origin
    }

    fn computer_name(&self) -> Option<String> {
        self.computer.clone()
    }

    fn state(&self) -> RunspaceState {
        *self.state.lock().expect("state mutex poisoned")
    }

    fn open(&self) -> Result<(), EngineError> {
        *self.state.lock().expect("state mutex poisoned") = RunspaceState::Opened;
        Ok(())
    }

    fn subscribe(&self, handler: Arc<dyn RunspaceEventHandler>) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .expect("listener mutex poisoned")
            .push((id, handler));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners
            .lock()
            .expect("listener mutex poisoned")
            .retain(|(existing, _)| *existing != id);
    }
}

/// Factory handing out fake runspaces and engines.
#[derive(Clone)]
pub struct FakeFactory {
    runtime: Arc<FakeRuntime>,
}

impl FakeFactory {
    /// Wraps a runtime.
    #[must_use]
    pub fn new(runtime: &Arc<FakeRuntime>) -> Arc<Self> {
        Arc::new(Self {
            runtime: Arc::clone(runtime),
        })
    }
}

impl EngineFactory for FakeFactory {
    fn create_runspace(&self) -> Result<Arc<dyn Runspace>, EngineError> {
        if self.runtime.lock().refuse_runspaces {
            return Err(EngineError::new("runspace creation refused"));
        }
        let runspace = Arc::new(FakeRunspace::new(
            self.runtime.allocate_id(),
            RunspaceOrigin::Local,
            None,
            RunspaceState::BeforeOpen,
        ));
        self.runtime.lock().runspaces.push(Arc::clone(&runspace));
        Ok(runspace)
    }

    fn create_engine(&self, runspace: &Arc<dyn Runspace>) -> Result<Box<dyn Engine>, EngineError> {
        let fake = self
            .runtime
            .find_runspace(runspace.id())
            .ok_or_else(|| EngineError::new("unknown runspace"))?;
        self.runtime.lock().engines_created += 1;
        Ok(Box::new(FakeEngine {
            runtime: Arc::clone(&self.runtime),
            debugger: FakeDebugger {
                runtime: Arc::clone(&self.runtime),
                runspace: Arc::clone(&fake),
            },
            runspace: fake,
        }))
    }
}

struct FakeDebugger {
    runtime: Arc<FakeRuntime>,
    runspace: Arc<FakeRunspace>,
}

impl FakeDebugger {
    fn announce(&self, breakpoint: &EngineBreakpoint, kind: BreakpointUpdateKind) {
        self.runspace.raise_breakpoint_updated(&BreakpointUpdatedEvent {
            breakpoint: breakpoint.clone(),
            kind,
        });
    }
}

impl EngineDebugger for FakeDebugger {
    fn set_line_breakpoint(
        &mut self,
        script: &Path,
        line: u32,
        column: Option<u32>,
        action: Option<&str>,
    ) -> Result<EngineBreakpoint, InvocationError> {
        let breakpoint = self.runtime.add_breakpoint(
            EngineBreakpointKind::Line {
                script: script.to_path_buf(),
                line,
                column,
            },
            action,
        )?;
        self.announce(&breakpoint, BreakpointUpdateKind::Set);
        Ok(breakpoint)
    }

    fn set_command_breakpoint(
        &mut self,
        name: &str,
        script: Option<&Path>,
        action: Option<&str>,
    ) -> Result<EngineBreakpoint, InvocationError> {
        let breakpoint = self.runtime.add_breakpoint(
            EngineBreakpointKind::Command {
                name: name.to_owned(),
                script: script.map(Path::to_path_buf),
            },
            action,
        )?;
        self.announce(&breakpoint, BreakpointUpdateKind::Set);
        Ok(breakpoint)
    }

    fn breakpoints(&mut self) -> Result<Vec<EngineBreakpoint>, InvocationError> {
        Ok(self.runtime.breakpoints())
    }

    fn remove_breakpoint(&mut self, id: u32) -> Result<bool, InvocationError> {
        match self.runtime.remove_breakpoint(id) {
            Some(breakpoint) => {
                self.announce(&breakpoint, BreakpointUpdateKind::Removed);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

struct FakeEngine {
    runtime: Arc<FakeRuntime>,
    runspace: Arc<FakeRunspace>,
    debugger: FakeDebugger,
}

impl FakeEngine {
    fn perform(
        &self,
        behaviour: Behaviour,
        invocation: &Invocation<'_>,
    ) -> Result<Vec<Value>, InvocationError> {
        match behaviour {
            Behaviour::Return(values) => {
                if invocation.write_output_to_host {
                    for value in &values {
                        invocation.host.write(OutputStream::Output, &render(value));
                    }
                }
                Ok(values)
            }
            Behaviour::Write(stream, text) => {
                invocation.host.write(stream, &text);
                Ok(Vec::new())
            }
            Behaviour::Fail(message) => Err(InvocationError::Script {
                records: vec![ErrorRecord::new(message)],
            }),
            Behaviour::Fault(message) => Err(InvocationError::Fault(message)),
            Behaviour::Block(latch) => {
                if latch.wait(invocation.cancellation) {
                    Ok(Vec::new())
                } else {
                    Err(InvocationError::Stopped)
                }
            }
            Behaviour::Stop(event) => {
                let action = self.runspace.raise_debugger_stop(&event);
                self.runtime.lock().resume_actions.push(action);
                if action == DebuggerResumeAction::Stop {
                    Err(InvocationError::Stopped)
                } else {
                    Ok(vec![Value::String(action.to_string())])
                }
            }
            Behaviour::Break => {
                self.runspace.set_state(RunspaceState::Broken);
                Err(InvocationError::RunspaceUnusable {
                    state: RunspaceState::Broken,
                })
            }
            Behaviour::Panic(message) => panic!("{message}"),
        }
    }

    fn run_cmdlet(&self, command: &Command) -> Option<Result<Vec<Value>, InvocationError>> {
        let outcome = match command.text() {
            "Import-Module" => {
                let name = command.parameter("Name").and_then(Value::as_str)?;
                if self
                    .runtime
                    .lock()
                    .failing_modules
                    .iter()
                    .any(|module| module == name)
                {
                    Err(InvocationError::Script {
                        records: vec![ErrorRecord::new(format!(
                            "The specified module '{name}' was not loaded."
                        ))],
                    })
                } else {
                    Ok(Vec::new())
                }
            }
            "Set-PSBreakpoint" => self.set_breakpoint_cmdlet(command),
            "Get-PSBreakpoint" => {
                let wanted = command.parameter("Id").and_then(Value::as_u64);
                Ok(self
                    .runtime
                    .breakpoints()
                    .iter()
                    .filter(|bp| wanted.is_none_or(|id| u64::from(bp.id) == id))
                    .map(breakpoint_record)
                    .collect())
            }
            "Remove-PSBreakpoint" => {
                let id = command
                    .parameter("Id")
                    .and_then(Value::as_u64)
                    .and_then(|id| u32::try_from(id).ok())?;
                self.runtime.remove_breakpoint(id);
                Ok(Vec::new())
            }
            _ => return None,
        };
        Some(outcome)
    }

    fn set_breakpoint_cmdlet(&self, command: &Command) -> Result<Vec<Value>, InvocationError> {
        let action = command.parameter("Action").and_then(Value::as_str);
        let number = |name: &str| {
            command
                .parameter(name)
                .and_then(Value::as_u64)
                .and_then(|value| u32::try_from(value).ok())
        };
        let kind = match (command.parameter("Script").and_then(Value::as_str), number("Line")) {
            (Some(script), Some(line)) => EngineBreakpointKind::Line {
                script: script.into(),
                line,
                column: number("Column"),
            },
            _ => EngineBreakpointKind::Command {
                name: command
                    .parameter("Command")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
                script: None,
            },
        };
        let breakpoint = self.runtime.add_breakpoint(kind, action)?;
        Ok(vec![breakpoint_record(&breakpoint)])
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn breakpoint_record(breakpoint: &EngineBreakpoint) -> Value {
    let mut record = json!({
        "Id": breakpoint.id,
        "Enabled": breakpoint.enabled,
        "Action": breakpoint.action,
        "HitCount": breakpoint.hit_count,
    });
    let fields = match &breakpoint.kind {
        EngineBreakpointKind::Line {
            script,
            line,
            column,
        } => json!({
            "Script": script.display().to_string(),
            "Line": line,
            "Column": column.unwrap_or(0),
        }),
        EngineBreakpointKind::Command { name, .. } => json!({ "Command": name }),
        EngineBreakpointKind::Variable { name } => json!({ "Variable": name }),
    };
    if let (Some(target), Value::Object(extra)) = (record.as_object_mut(), fields) {
        target.extend(extra);
    }
    record
}

impl Engine for FakeEngine {
    fn runspace(&self) -> Arc<dyn Runspace> {
        Arc::clone(&self.runspace) as Arc<dyn Runspace>
    }

    fn invoke(
        &mut self,
        command: &Command,
        invocation: &Invocation<'_>,
    ) -> Result<Vec<Value>, InvocationError> {
        self.runtime.record(
            self.runspace.id,
            command,
            false,
            invocation.write_output_to_host,
        );
        let state = self.runspace.state();
        if !state.is_usable() {
            return Err(InvocationError::RunspaceUnusable { state });
        }
        if command.kind() == CommandKind::Script && command.text() == VERSION_QUERY {
            let version = self.runtime.lock().version.clone();
            return version
                .map(|record| vec![record])
                .map_err(InvocationError::Fault);
        }
        if command.kind() == CommandKind::Command {
            if let Some(outcome) = self.run_cmdlet(command) {
                return outcome;
            }
        }
        let behaviour = self
            .runtime
            .behaviour(command.text())
            .unwrap_or(Behaviour::Return(Vec::new()));
        self.perform(behaviour, invocation)
    }

    fn process_debugger_command(
        &mut self,
        command: &Command,
        invocation: &Invocation<'_>,
    ) -> Result<DebuggerCommandResults, InvocationError> {
        self.runtime.record(
            self.runspace.id,
            command,
            true,
            invocation.write_output_to_host,
        );
        let resume_action = match command.text().trim() {
            "c" | "continue" => Some(DebuggerResumeAction::Continue),
            "s" | "stepInto" => Some(DebuggerResumeAction::StepInto),
            "v" | "stepOver" => Some(DebuggerResumeAction::StepOver),
            "o" | "stepOut" => Some(DebuggerResumeAction::StepOut),
            "q" | "quit" => Some(DebuggerResumeAction::Stop),
            _ => None,
        };
        if resume_action.is_some() {
            return Ok(DebuggerCommandResults {
                values: Vec::new(),
                resume_action,
            });
        }
        let behaviour = self
            .runtime
            .behaviour(command.text())
            .unwrap_or(Behaviour::Return(Vec::new()));
        let values = self.perform(behaviour, invocation)?;
        Ok(DebuggerCommandResults {
            values,
            resume_action: None,
        })
    }

    fn call_stack(&mut self) -> Result<Vec<EngineStackFrame>, InvocationError> {
        Ok(self.runtime.lock().stack.clone())
    }

    fn variables(&mut self, scope: VariableScope) -> Result<Vec<EngineVariable>, InvocationError> {
        Ok(self
            .runtime
            .lock()
            .variables
            .get(&scope)
            .cloned()
            .unwrap_or_default())
    }

    fn debugger_api(&mut self) -> Option<&mut dyn EngineDebugger> {
        if self.runtime.lock().native_debugger {
            Some(&mut self.debugger)
        } else {
            None
        }
    }

    fn dispose(&mut self) {
        self.runtime.lock().engines_disposed += 1;
    }
}
