pub mod error;
pub mod models;
pub mod parser;

pub use error::{ConfigError, ConfigErrorKind, ConfigResult};
pub use models::{
    find_output, ModelGroup, Module, Output, OutputValue, UnitStatus, WorkSpec, Workflow,
    WorkflowSettings,
};
pub use parser::{WorkflowGraphs, WorkflowParser};
