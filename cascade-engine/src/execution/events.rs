// Execution Events
// Progress reporting and event types for engine execution

use crate::execution::lifecycle::RunPhase;
use crate::workflow::models::UnitStatus;

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted while the engine runs
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// A pass over the group graph started
    RunStarted {
        run_id: String,
        iteration: u32,
        parallel: bool,
        total_groups: usize,
    },

    /// A pass finished; blocked groups leave the run stalled in `RUNNING`
    RunCompleted {
        run_id: String,
        phase: RunPhase,
        completed: usize,
        failed: usize,
        blocked: usize,
        duration: Duration,
    },

    /// Run phase transition
    PhaseChanged { from: RunPhase, to: RunPhase },

    /// Group execution started
    GroupStarted {
        group_id: String,
        total_modules: usize,
    },

    /// Group reached a terminal status
    GroupCompleted {
        group_id: String,
        status: UnitStatus,
        duration: Duration,
    },

    /// Group excluded from the pass by a skip rule
    GroupSkipped { group_id: String, reason: String },

    /// Module execution started
    ModuleStarted { group_id: String, module_id: String },

    /// Module progress checkpoint
    ModuleProgress {
        group_id: String,
        module_id: String,
        progress: u8,
    },

    /// Module reached a terminal status
    ModuleCompleted {
        group_id: String,
        module_id: String,
        status: UnitStatus,
        duration: Duration,
    },

    /// A unit with a breakpoint completed and paused the run
    BreakpointHit { unit_id: String },

    /// Execution paused (on a breakpoint when `on` is set)
    Paused { on: Option<String> },

    /// Execution resumed
    Resumed,

    /// Log message (info, warning, error)
    Log {
        level: LogLevel,
        message: String,
        unit_id: Option<String>,
    },

    /// Execution error occurred
    Error {
        message: String,
        group_id: Option<String>,
        module_id: Option<String>,
    },
}

/// Log level for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl ExecutionEvent {
    /// Create a run started event
    pub fn run_started(
        run_id: impl Into<String>,
        iteration: u32,
        parallel: bool,
        total_groups: usize,
    ) -> Self {
        Self::RunStarted {
            run_id: run_id.into(),
            iteration,
            parallel,
            total_groups,
        }
    }

    /// Create a group started event
    pub fn group_started(group_id: impl Into<String>, total_modules: usize) -> Self {
        Self::GroupStarted {
            group_id: group_id.into(),
            total_modules,
        }
    }

    /// Create a group completed event
    pub fn group_completed(
        group_id: impl Into<String>,
        status: UnitStatus,
        duration: Duration,
    ) -> Self {
        Self::GroupCompleted {
            group_id: group_id.into(),
            status,
            duration,
        }
    }

    /// Create a module started event
    pub fn module_started(group_id: impl Into<String>, module_id: impl Into<String>) -> Self {
        Self::ModuleStarted {
            group_id: group_id.into(),
            module_id: module_id.into(),
        }
    }

    /// Create a module completed event
    pub fn module_completed(
        group_id: impl Into<String>,
        module_id: impl Into<String>,
        status: UnitStatus,
        duration: Duration,
    ) -> Self {
        Self::ModuleCompleted {
            group_id: group_id.into(),
            module_id: module_id.into(),
            status,
            duration,
        }
    }

    /// Create an info log event
    pub fn info(message: impl Into<String>, unit_id: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Info,
            message: message.into(),
            unit_id,
        }
    }

    /// Create a warning log event
    pub fn warning(message: impl Into<String>, unit_id: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Warning,
            message: message.into(),
            unit_id,
        }
    }

    /// Create an execution error event
    pub fn execution_error(
        message: impl Into<String>,
        group_id: Option<String>,
        module_id: Option<String>,
    ) -> Self {
        Self::Error {
            message: message.into(),
            group_id,
            module_id,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}
