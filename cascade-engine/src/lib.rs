// Cascade Engine Library
// Dependency-aware orchestration of model groups and their modules

pub mod error;
pub mod execution;
pub mod persistence;
pub mod workflow;

// Re-export commonly used types
pub use error::{EngineError, EngineResult};

// Re-export workflow types
pub use workflow::{
    ConfigError, ConfigErrorKind, ModelGroup, Module, Output, OutputValue, UnitStatus, WorkSpec,
    Workflow, WorkflowParser, WorkflowSettings,
};

// Re-export execution types
pub use execution::{
    progress_channel, Compute, ComputeError, ConditionalRule, DependencyGraph, DependencyReport,
    EngineConfig, EngineSnapshot, ExecutionEngine, ExecutionEvent, ProgressHandle, ProgressReceiver,
    ProgressSender, RunOutcome, RunPhase, RunState, SimulatedCompute,
};

// Re-export persistence types
pub use persistence::{PersistedState, StateStore};
