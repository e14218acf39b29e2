use crate::commands::load_workflow;
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

use cascade_engine::execution::LogLevel;
use cascade_engine::{progress_channel, ExecutionEngine, ExecutionEvent, RunPhase, StateStore};

/// Run a workflow locally with simulated compute
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the workflow YAML file
    pub workflow: PathBuf,

    /// Run dependency-level batches concurrently (also enabled by the workflow's settings)
    #[arg(long, short = 'p')]
    pub parallel: bool,

    /// Freeze a group or module before running (can be repeated)
    #[arg(long, value_name = "ID")]
    pub freeze: Vec<String>,

    /// Continue past breakpoints without waiting for input
    #[arg(long)]
    pub continue_breakpoints: bool,

    /// Run-state file to resume from and save to
    #[arg(long, value_name = "FILE")]
    pub state: Option<PathBuf>,

    /// Use the default run-state location
    #[arg(long, conflicts_with = "state")]
    pub persist: bool,

    /// Finalize the run once the main pass completes
    #[arg(long)]
    pub finalize: bool,

    /// Print module progress updates
    #[arg(long)]
    pub progress: bool,
}

pub async fn execute(args: RunArgs) -> Result<()> {
    let workflow = load_workflow(&args.workflow)?;
    output::notice(
        "Workflow",
        format!(
            "{}: {} groups, {} modules",
            workflow.name,
            workflow.groups.len(),
            workflow.module_count()
        ),
    );

    let parallel = args.parallel || workflow.settings.parallel;

    // Create progress channel and engine
    let (tx, mut rx) = progress_channel();
    let engine = ExecutionEngine::builder(workflow)
        .with_progress(tx)
        .build()?;

    let store = match (&args.state, args.persist) {
        (Some(path), _) => Some(StateStore::new(path)),
        (None, true) => Some(StateStore::default_location()),
        (None, false) => None,
    };

    if let Some(store) = &store {
        if let Some(state) = store.load()? {
            engine.restore(&state)?;
            output::notice("Restored", store.path().display());

            // A finished run continues as its next iteration
            let phase = engine.get_run_state().phase;
            if matches!(
                phase,
                RunPhase::MainComplete | RunPhase::Adjustments | RunPhase::Finalized
            ) {
                let iteration = engine.increment_iteration_count()?;
                output::notice("Iteration", iteration);
            }
        }
    }

    for id in &args.freeze {
        if !engine.snapshot().run.frozen_ids.contains(id) {
            engine.toggle_frozen(id)?;
        }
        output::notice("Frozen", id);
    }

    // Spawn execution in background
    let runner = engine.clone();
    let mut exec_handle = tokio::spawn(async move { runner.run_all(parallel).await });

    // Process events in the foreground until the pass returns
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let outcome = loop {
        tokio::select! {
            biased;
            Some(event) = rx.recv() => render_event(&engine, &args, &mut stdin, event).await?,
            joined = &mut exec_handle => break joined??,
        }
    };
    while let Ok(event) = rx.try_recv() {
        render_event(&engine, &args, &mut stdin, event).await?;
    }

    if outcome.is_complete() {
        output::pass_result(
            true,
            format!(
                "main pass: {} groups in {:.2}s",
                outcome.completed.len(),
                outcome.duration.as_secs_f64()
            ),
        );
    } else {
        output::pass_result(
            false,
            format!(
                "{} failed, {} blocked",
                outcome.failed.len(),
                outcome.blocked.len()
            ),
        );
        for id in &outcome.blocked {
            let report = engine.debug_model_dependency_status(id)?;
            let pending: Vec<&str> = report
                .dependency_status
                .iter()
                .filter(|d| !d.satisfied)
                .map(|d| d.id.as_str())
                .chain(report.waiting_modules.iter().map(String::as_str))
                .collect();
            output::waiting(id, &pending);
        }
    }
    for id in &outcome.skipped {
        output::skipped(id, "by conditional rule");
    }

    if args.finalize && outcome.is_complete() {
        engine.finalize_run()?;
        output::phase(RunPhase::Finalized);
    }

    if let Some(store) = &store {
        store.save(&engine.persisted_state())?;
        output::notice("Saved", store.path().display());
    }

    if !outcome.is_complete() {
        std::process::exit(1);
    }

    Ok(())
}

async fn render_event(
    engine: &ExecutionEngine,
    args: &RunArgs,
    stdin: &mut Lines<BufReader<Stdin>>,
    event: ExecutionEvent,
) -> Result<()> {
    match &event {
        ExecutionEvent::RunStarted {
            run_id,
            iteration,
            parallel,
            total_groups,
        } => output::run_banner(run_id, *iteration, *total_groups, *parallel),

        ExecutionEvent::PhaseChanged { to, .. } => output::phase(*to),

        ExecutionEvent::GroupStarted {
            group_id,
            total_modules,
        } => output::group_started(group_id, *total_modules),

        ExecutionEvent::GroupCompleted {
            group_id,
            status,
            duration,
        } => output::unit_finished(1, group_id, *status, *duration),

        ExecutionEvent::GroupSkipped { group_id, reason } => output::skipped(group_id, reason),

        ExecutionEvent::ModuleStarted { module_id, .. } => output::module_started(module_id),

        ExecutionEvent::ModuleProgress {
            module_id,
            progress,
            ..
        } => {
            if args.progress {
                output::module_progress(module_id, *progress);
            }
        }

        ExecutionEvent::ModuleCompleted {
            module_id,
            status,
            duration,
            ..
        } => output::unit_finished(2, module_id, *status, *duration),

        ExecutionEvent::BreakpointHit { unit_id } => {
            output::breakpoint(unit_id, !args.continue_breakpoints);
            if !args.continue_breakpoints {
                stdin.next_line().await?;
            }
            // A sibling breakpoint in the same batch may have taken over the pause
            if let Err(e) = engine.continue_after_breakpoint(unit_id) {
                output::detail(format!("  {}", e));
            }
        }

        ExecutionEvent::Paused { on: None } => output::caution("execution paused"),

        ExecutionEvent::Paused { on: Some(_) } | ExecutionEvent::Resumed => {}

        ExecutionEvent::Log { level, message, .. } => match level {
            LogLevel::Error => output::problem(message),
            LogLevel::Warning => output::caution(message),
            _ => output::detail(message),
        },

        ExecutionEvent::Error { message, .. } => output::problem(message),

        ExecutionEvent::RunCompleted { .. } => {}
    }
    Ok(())
}
