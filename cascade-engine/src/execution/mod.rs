// Execution Engine Module
// Dependency graphs, rule evaluation, scheduling, and run orchestration

pub mod compute;
pub mod conditions;
pub mod events;
pub mod executor;
pub mod freeze;
pub mod graph;
pub mod lifecycle;
pub mod scheduler;
pub(crate) mod table;
pub mod tasks;

// Re-export key types
pub use compute::{Compute, ComputeError, ComputeInputs, ModuleRequest, SimulatedCompute};
pub use conditions::{
    evaluate, evaluate_rules, ComparisonOperator, ConditionalRule, RuleAction, RuleError,
    RuleVerdicts,
};
pub use events::{progress_channel, EventSender, ExecutionEvent, LogLevel, ProgressReceiver, ProgressSender};
pub use executor::{
    DependencyReport, DependencyStatus, EngineBuilder, EngineConfig, ExecutionEngine, RunOutcome,
};
pub use freeze::FreezeRegistry;
pub use graph::{DependencyGraph, GraphError, GraphErrorKind, GraphNode, NodeSpec};
pub use lifecycle::{PassStart, RunLifecycle, RunPhase, RunState};
pub use scheduler::{Scheduler, StatusMap, UnitState};
pub use table::EngineSnapshot;
pub use tasks::{PauseGate, ProgressHandle, ProgressSink, TaskCoordinator, TaskInfo};
