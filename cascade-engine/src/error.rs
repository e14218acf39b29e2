// Engine Errors
// Error type shared by the orchestration engine and its public operations

use crate::execution::graph::{GraphError, GraphErrorKind};
use crate::execution::lifecycle::RunPhase;
use crate::workflow::error::ConfigError;

use thiserror::Error;

/// Errors returned by engine operations
///
/// Runtime failures of individual units are recorded on the entity and never
/// surface through this type mid-run; these are the rejections a caller sees.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("circular dependency detected: {}", members.join(" -> "))]
    CycleDetected { members: Vec<String> },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("graph error: {0}")]
    Graph(GraphError),

    #[error("unknown entity '{0}'")]
    UnknownEntity(String),

    #[error("'{id}' is waiting on unsatisfied dependencies: {}", pending.join(", "))]
    DependencyUnsatisfied { id: String, pending: Vec<String> },

    #[error("module '{module_id}' in group '{group_id}' failed: {message}")]
    ModuleExecutionFailure {
        group_id: String,
        module_id: String,
        message: String,
    },

    #[error("cannot {operation} while run is {phase}: {reason}")]
    InvalidStateTransition {
        operation: &'static str,
        phase: RunPhase,
        reason: String,
    },

    #[error("no active breakpoint pause on '{id}'")]
    BreakpointWithoutActiveRun { id: String },

    #[error("state store error: {0}")]
    Store(String),
}

impl EngineError {
    pub(crate) fn invalid_transition(
        operation: &'static str,
        phase: RunPhase,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidStateTransition {
            operation,
            phase,
            reason: reason.into(),
        }
    }
}

impl From<GraphError> for EngineError {
    fn from(err: GraphError) -> Self {
        match err.kind {
            GraphErrorKind::CyclicDependency => Self::CycleDetected {
                members: err.members,
            },
            _ => Self::Graph(err),
        }
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_names_members() {
        let err: EngineError = GraphError::cyclic(vec![
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
        ])
        .into();

        assert!(matches!(err, EngineError::CycleDetected { ref members } if members.len() == 3));
        assert_eq!(err.to_string(), "circular dependency detected: a -> b -> a");
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = EngineError::invalid_transition("finalize run", RunPhase::Idle, "no run yet");
        assert_eq!(err.to_string(), "cannot finalize run while run is IDLE: no run yet");
    }
}
