use crate::commands::load_workflow;
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use cascade_engine::{EngineError, WorkflowParser};

/// Validate a workflow YAML file
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the workflow YAML file
    pub workflow: PathBuf,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    let workflow_path = &args.workflow;

    // Step 1: Parse YAML
    output::notice("Validating", workflow_path.display());
    let workflow = load_workflow(workflow_path)?;
    output::passed("YAML syntax valid");

    output::passed(format!(
        "Structure: {} groups, {} modules, {} rules",
        workflow.groups.len(),
        workflow.module_count(),
        workflow.rules.len()
    ));

    // Step 2: Ids, dependency graphs and rule references
    match WorkflowParser::validate(&workflow) {
        Ok(graphs) => {
            output::passed(format!(
                "Dependency graph acyclic ({} groups, {} module graphs)",
                graphs.groups.len(),
                graphs.modules.len()
            ));
        }
        Err(EngineError::Config(e)) => {
            output::problem(&e.message);
            if let Some(suggestion) = &e.suggestion {
                output::hint(suggestion);
            }
            std::process::exit(1);
        }
        Err(e) => {
            output::problem(e);
            std::process::exit(1);
        }
    }

    output::pass_result(true, format!("workflow '{}' is valid", workflow.name));

    Ok(())
}
