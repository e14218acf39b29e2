use crate::commands::load_workflow;
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use cascade_engine::ExecutionEngine;

/// Show the order a workflow would run in
#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Path to the workflow YAML file
    pub workflow: PathBuf,

    /// Show parallel batches instead of the sequential order
    #[arg(long, short = 'p')]
    pub parallel: bool,
}

pub fn execute(args: PlanArgs) -> Result<()> {
    let workflow = load_workflow(&args.workflow)?;
    let engine = ExecutionEngine::new(workflow)?;

    output::title(format!("Plan for '{}'", engine.workflow_name()));

    if args.parallel {
        for (level, batch) in engine.get_parallel_execution_groups().iter().enumerate() {
            println!("  Batch {}: {}", level + 1, batch.join(", "));
        }
    } else {
        for (index, id) in engine.get_execution_sequence().iter().enumerate() {
            println!("  {:>3}. {}", index + 1, id);
        }
    }

    let snapshot = engine.snapshot();
    for group in &snapshot.groups {
        if !group.enabled {
            output::detail(format!("  {} disabled", group.id));
        } else if group.frozen {
            output::detail(format!("  {} frozen", group.id));
        }
    }

    if !engine.rules().is_empty() {
        println!();
        output::notice("Rules", format!("{} conditional", engine.rules().len()));
        for rule in engine.rules() {
            output::detail(format!("  {}", rule));
        }
    }

    Ok(())
}
