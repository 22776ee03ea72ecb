//! Options attached to requests submitted to the pipeline thread.

use serde::{Deserialize, Serialize};

/// Queue lane a request is placed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExecutionPriority {
    /// First-in first-out with other normal requests.
    #[default]
    Normal,
    /// Runs ahead of every normal request.
    Next,
    /// Runs only when nothing else is runnable and yields to new work.
    Idle,
}

/// How a request is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOptions {
    /// Queue lane.
    pub priority: ExecutionPriority,
    /// Whether success output is rendered to the host.
    pub write_output_to_host: bool,
    /// Whether script errors fail the request instead of being returned.
    pub throw_on_error: bool,
    /// Whether the command is recorded in the session history.
    pub add_to_history: bool,
    /// Whether the request may run while the debugger is stopped.
    pub run_in_debugger: bool,
    /// Whether the request runs on a scoped non-interactive frame.
    pub non_interactive: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            priority: ExecutionPriority::Normal,
            write_output_to_host: false,
            throw_on_error: true,
            add_to_history: false,
            run_in_debugger: false,
            non_interactive: false,
        }
    }
}

impl ExecutionOptions {
    /// Options for commands typed by the user: rendered and recorded.
    #[must_use]
    pub fn interactive() -> Self {
        Self {
            write_output_to_host: true,
            add_to_history: true,
            throw_on_error: false,
            ..Self::default()
        }
    }

    /// Options for background work that yields to foreground requests.
    #[must_use]
    pub fn idle() -> Self {
        Self {
            priority: ExecutionPriority::Idle,
            ..Self::default()
        }
    }

    /// Sets the queue lane.
    #[must_use]
    pub fn with_priority(mut self, priority: ExecutionPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Allows the request to run while the debugger is stopped.
    #[must_use]
    pub fn in_debugger(mut self) -> Self {
        self.run_in_debugger = true;
        self
    }

    /// Runs the request on a scoped non-interactive frame.
    #[must_use]
    pub fn non_interactive(mut self) -> Self {
        self.non_interactive = true;
        self
    }

    /// Whether the request runs in an idle cancellation scope.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.priority == ExecutionPriority::Idle
    }
}
