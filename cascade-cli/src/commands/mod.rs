pub mod plan;
pub mod run;
pub mod validate;

use crate::output;

use std::path::Path;

use cascade_engine::{Workflow, WorkflowParser};
use color_eyre::Result;

/// Load a workflow file, printing located parse errors
pub fn load_workflow(path: &Path) -> Result<Workflow> {
    if !path.exists() {
        color_eyre::eyre::bail!("Workflow file not found: {}", path.display());
    }

    match WorkflowParser::from_file(path) {
        Ok(workflow) => Ok(workflow),
        Err(e) => {
            if e.line > 0 {
                output::problem(format!("{} (line {}:{})", e.message, e.line, e.column));
            } else {
                output::problem(&e.message);
            }
            if !e.context.is_empty() {
                output::detail(e.context.trim_end());
            }
            if let Some(suggestion) = &e.suggestion {
                output::hint(suggestion);
            }
            std::process::exit(1);
        }
    }
}
