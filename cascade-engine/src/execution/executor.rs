// Execution Engine
// Orchestrates model groups and their modules with DAG-based scheduling

use crate::error::{EngineError, EngineResult};
use crate::execution::compute::{Compute, ComputeError, ComputeInputs, ModuleRequest, SimulatedCompute};
use crate::execution::conditions::{ConditionalRule, RuleAction, RuleVerdicts};
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::graph::DependencyGraph;
use crate::execution::lifecycle::{PassStart, RunPhase, RunState};
use crate::execution::scheduler::Scheduler;
use crate::execution::table::{EngineSnapshot, EntityRef, StatusTable};
use crate::execution::tasks::{PauseGate, ProgressSink, TaskCoordinator, TaskInfo};
use crate::persistence::PersistedState;
use crate::workflow::models::{ModelGroup, Module, Output, UnitStatus, Workflow, WorkflowSettings};
use crate::workflow::parser::{WorkflowGraphs, WorkflowParser};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

/// Configuration for engine execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum parallel groups (0 = unlimited)
    pub max_parallel_groups: usize,
    /// Maximum parallel modules within a group (0 = unlimited)
    pub max_parallel_modules: usize,
}

impl From<&WorkflowSettings> for EngineConfig {
    fn from(settings: &WorkflowSettings) -> Self {
        Self {
            max_parallel_groups: settings.max_parallel_groups,
            max_parallel_modules: settings.max_parallel_modules,
        }
    }
}

/// Result of one pass over the group graph
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub run_id: String,
    pub iteration: u32,
    pub parallel: bool,
    /// Groups in the order they were scheduled
    pub sequence: Vec<String>,
    /// Scheduled batches; single-element batches in sequential mode
    pub batches: Vec<Vec<String>>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    /// Groups excluded by an active skip rule
    pub skipped: Vec<String>,
    /// Groups left idle behind unsatisfied dependencies
    pub blocked: Vec<String>,
    pub phase: RunPhase,
    pub duration: Duration,
}

impl RunOutcome {
    /// The pass reached `MAIN_COMPLETE`
    pub fn is_complete(&self) -> bool {
        self.phase == RunPhase::MainComplete
    }
}

/// State of one dependency as seen by a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyStatus {
    pub id: String,
    pub status: UnitStatus,
    pub enabled: bool,
    pub frozen: bool,
    pub skipped_by_rule: bool,
    pub satisfied: bool,
}

/// Diagnostic view of why a group is or is not ready
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyReport {
    pub model: String,
    pub status: UnitStatus,
    pub dependency_status: Vec<DependencyStatus>,
    /// The group completed or failed
    pub processed: bool,
    pub ready: bool,
    pub skipped_by_rule: bool,
    pub forced_by_rule: bool,
    /// Dependencies in other groups that the group's modules still wait on
    pub waiting_modules: Vec<String>,
}

/// Builder for [`ExecutionEngine`]
pub struct EngineBuilder {
    workflow: Workflow,
    config: Option<EngineConfig>,
    compute: Arc<dyn Compute>,
    event_tx: Option<ProgressSender>,
}

impl EngineBuilder {
    /// Override the settings declared by the workflow
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the compute collaborator (defaults to [`SimulatedCompute`])
    pub fn with_compute(mut self, compute: Arc<dyn Compute>) -> Self {
        self.compute = compute;
        self
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Validate the workflow and create the engine
    pub fn build(self) -> EngineResult<ExecutionEngine> {
        let graphs = WorkflowParser::validate(&self.workflow)?;
        let config = self
            .config
            .unwrap_or_else(|| EngineConfig::from(&self.workflow.settings));

        let table = StatusTable::new(self.workflow.groups);
        let (snapshots, _) = watch::channel(Arc::new(table.snapshot()));

        debug!(
            workflow = %self.workflow.name,
            groups = graphs.groups.len(),
            rules = self.workflow.rules.len(),
            "engine created"
        );

        Ok(ExecutionEngine {
            inner: Arc::new(EngineInner {
                name: self.workflow.name,
                graphs,
                rules: self.workflow.rules,
                config,
                compute: self.compute,
                table: Mutex::new(table),
                gate: PauseGate::new(),
                tasks: TaskCoordinator::new(),
                snapshots,
                event_tx: self.event_tx,
                busy: AtomicBool::new(false),
            }),
        })
    }
}

/// Dependency-aware engine over the model groups of one workflow
///
/// Cheap to clone; clones share the same state. Only the engine mutates the
/// status table; readers get immutable snapshots.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    name: String,
    graphs: WorkflowGraphs,
    rules: Vec<ConditionalRule>,
    config: EngineConfig,
    compute: Arc<dyn Compute>,
    table: Mutex<StatusTable>,
    gate: PauseGate,
    tasks: TaskCoordinator,
    snapshots: watch::Sender<Arc<EngineSnapshot>>,
    event_tx: Option<ProgressSender>,
    /// Set while a pass or a single-unit run is in flight
    busy: AtomicBool,
}

/// Releases the busy flag when dropped
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("workflow", &self.inner.name)
            .field("config", &self.inner.config)
            .finish()
    }
}

impl ExecutionEngine {
    /// Start building an engine for a workflow
    pub fn builder(workflow: Workflow) -> EngineBuilder {
        EngineBuilder {
            workflow,
            config: None,
            compute: Arc::new(SimulatedCompute::new()),
            event_tx: None,
        }
    }

    /// Create an engine with simulated compute and the workflow's settings
    pub fn new(workflow: Workflow) -> EngineResult<Self> {
        Self::builder(workflow).build()
    }

    pub fn workflow_name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn rules(&self) -> &[ConditionalRule] {
        &self.inner.rules
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Arc<EngineSnapshot> {
        self.inner.snapshots.borrow().clone()
    }

    /// Receiver that observes every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<Arc<EngineSnapshot>> {
        self.inner.snapshots.subscribe()
    }

    /// Snapshots as a stream
    pub fn snapshot_stream(&self) -> WatchStream<Arc<EngineSnapshot>> {
        WatchStream::new(self.subscribe())
    }

    pub fn groups(&self) -> Vec<ModelGroup> {
        self.snapshot().groups.clone()
    }

    /// Units currently executing, with their progress
    pub fn in_flight_tasks(&self) -> Vec<(String, TaskInfo)> {
        self.inner.tasks.in_flight()
    }

    fn claim(&self, operation: &'static str) -> EngineResult<BusyGuard<'_>> {
        if self
            .inner
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let phase = self.inner.table.lock().lifecycle.phase();
            return Err(EngineError::invalid_transition(
                operation,
                phase,
                "another execution is in progress",
            ));
        }
        Ok(BusyGuard(&self.inner.busy))
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Run every eligible group, sequentially or in dependency-level batches
    pub async fn run_all(&self, parallel: bool) -> EngineResult<RunOutcome> {
        let _busy = self.claim("run all")?;
        let start = self.inner.begin_pass()?;

        info!(
            workflow = %self.inner.name,
            run_id = %start.run_id,
            iteration = start.iteration,
            parallel,
            "run started"
        );
        self.inner.event_tx.send_event(ExecutionEvent::run_started(
            &start.run_id,
            start.iteration,
            parallel,
            self.inner.graphs.groups.len(),
        ));

        let mut batches = Vec::new();
        // Groups sent back to idle this pass; not rescheduled until the next one
        let mut deferred = Vec::new();
        loop {
            self.inner.gate.wait_until_resumed().await;

            let batch = self.inner.next_groups(parallel, &deferred);
            if batch.is_empty() {
                break;
            }

            let finished = if batch.len() > 1 {
                self.run_group_batch(&batch, parallel).await
            } else {
                let mut finished = Vec::new();
                for group_id in &batch {
                    let status = self.execute_group(group_id, parallel).await;
                    finished.push((group_id.clone(), status));
                }
                finished
            };
            deferred.extend(
                finished
                    .into_iter()
                    .filter(|(_, status)| *status == UnitStatus::Idle)
                    .map(|(id, _)| id),
            );
            batches.push(batch);
        }

        Ok(self.inner.finish_pass(start, parallel, batches))
    }

    /// Run one group whose dependencies are satisfied
    pub async fn run_model(&self, id: &str) -> EngineResult<UnitStatus> {
        let _busy = self.claim("run model")?;
        self.inner.prepare_group_run(id)?;

        info!(group = id, "running single group");
        let status = self.execute_group(id, false).await;
        self.inner.settle_pass();
        Ok(status)
    }

    /// Run one module of a group; the group's outputs are refreshed when it
    /// had already been processed
    pub async fn run_module(&self, group_id: &str, module_id: &str) -> EngineResult<UnitStatus> {
        let _busy = self.claim("run module")?;
        let group_processed = self.inner.prepare_module_run(group_id, module_id)?;

        info!(group = group_id, module = module_id, "running single module");
        let status = self.execute_module(group_id, module_id).await;
        if group_processed {
            self.finish_group(group_id).await;
        }
        self.inner.settle_pass();
        Ok(status)
    }

    async fn run_group_batch(&self, batch: &[String], parallel: bool) -> Vec<(String, UnitStatus)> {
        let limit = self.inner.config.max_parallel_groups;
        let semaphore = (limit > 0).then(|| Arc::new(Semaphore::new(limit)));
        let mut join_set = JoinSet::new();

        for group_id in batch {
            let engine = self.clone();
            let group_id = group_id.clone();
            let semaphore = semaphore.clone();
            join_set.spawn(async move {
                let _permit = match semaphore {
                    Some(s) => s.acquire_owned().await.ok(),
                    None => None,
                };
                let status = engine.execute_group(&group_id, parallel).await;
                (group_id, status)
            });
        }

        let mut finished = Vec::with_capacity(batch.len());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => finished.push(result),
                Err(e) => warn!(error = %e, "group task aborted"),
            }
        }
        finished
    }

    async fn run_module_batch(&self, group_id: &str, batch: &[String]) {
        let limit = self.inner.config.max_parallel_modules;
        let semaphore = (limit > 0).then(|| Arc::new(Semaphore::new(limit)));
        let mut join_set = JoinSet::new();

        for module_id in batch {
            let engine = self.clone();
            let group_id = group_id.to_string();
            let module_id = module_id.clone();
            let semaphore = semaphore.clone();
            join_set.spawn(async move {
                let _permit = match semaphore {
                    Some(s) => s.acquire_owned().await.ok(),
                    None => None,
                };
                engine.execute_module(&group_id, &module_id).await
            });
        }

        while let Some(joined) = join_set.join_next().await {
            if let Err(e) = joined {
                warn!(group = group_id, error = %e, "module task aborted");
            }
        }
    }

    /// Wait for the gate, then move the unit to `running`
    async fn enter_running(&self, id: &str) {
        loop {
            self.inner.gate.wait_until_resumed().await;
            if self.inner.try_mark_running(id) {
                return;
            }
        }
    }

    async fn execute_group(&self, group_id: &str, parallel: bool) -> UnitStatus {
        self.enter_running(group_id).await;

        loop {
            self.inner.gate.wait_until_resumed().await;

            let ready = self.inner.next_modules(group_id, parallel);
            if ready.is_empty() {
                break;
            }

            if ready.len() > 1 {
                self.run_module_batch(group_id, &ready).await;
            } else {
                for module_id in &ready {
                    self.execute_module(group_id, module_id).await;
                }
            }
        }

        self.finish_group(group_id).await
    }

    async fn execute_module(&self, group_id: &str, module_id: &str) -> UnitStatus {
        self.enter_running(module_id).await;

        let (request, start) = self.inner.module_request(group_id, module_id);
        let sink: Arc<dyn ProgressSink> = self.inner.clone();
        let handle = self
            .inner
            .tasks
            .register(module_id, start, self.inner.gate.clone(), sink);

        let result = self.inner.compute.compute_module(request, &handle).await;
        drop(handle);

        self.inner.finish_module(group_id, module_id, result)
    }

    async fn finish_group(&self, group_id: &str) -> UnitStatus {
        let result = match self.inner.group_collection(group_id) {
            Collection::Ready(group, module_outputs) => self
                .inner
                .compute
                .collect_group(&group, &module_outputs)
                .await
                .map_err(|e| e.message),
            Collection::Failed(message) => Err(message),
            Collection::Waiting(reason) => return self.inner.return_to_idle(group_id, &reason),
        };
        self.inner.complete_group(group_id, result)
    }

    // ------------------------------------------------------------------
    // Pause / resume
    // ------------------------------------------------------------------

    /// Pause globally; idempotent
    pub fn pause_execution(&self) {
        let mut table = self.inner.table.lock();
        if table.lifecycle.is_paused() {
            return;
        }
        table.lifecycle.set_paused(true, None);
        self.inner.gate.pause();
        info!("execution paused");
        self.inner.event_tx.send_event(ExecutionEvent::Paused { on: None });
        self.inner.publish(&table);
    }

    /// Resume after a pause or breakpoint; idempotent
    pub fn resume_execution(&self) {
        let mut table = self.inner.table.lock();
        self.inner.resume_locked(&mut table);
    }

    /// Resume a run halted on the breakpoint of `id`
    pub fn continue_after_breakpoint(&self, id: &str) -> EngineResult<()> {
        let mut table = self.inner.table.lock();
        if table.locate(id).is_none() {
            return Err(EngineError::UnknownEntity(id.to_string()));
        }
        if !table.lifecycle.is_paused() || table.lifecycle.paused_on_id() != Some(id) {
            return Err(EngineError::BreakpointWithoutActiveRun { id: id.to_string() });
        }
        self.inner.resume_locked(&mut table);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Entity mutations
    // ------------------------------------------------------------------

    /// Return unfrozen groups and modules to idle with cleared results
    pub fn reset_outputs(&self) -> EngineResult<usize> {
        let _busy = self.claim("reset outputs")?;
        let mut table = self.inner.table.lock();
        EngineInner::ensure_unlocked(&table, "reset outputs")?;

        let reset = table.reset_unfrozen();
        info!(reset, frozen = table.freeze().len(), "outputs reset");
        self.inner.publish(&table);
        Ok(reset)
    }

    /// Flip `enabled` on an optional group; returns the new value
    pub fn toggle_model_enabled(&self, id: &str) -> EngineResult<bool> {
        let _busy = self.claim("toggle enabled")?;
        let mut table = self.inner.table.lock();
        EngineInner::ensure_unlocked(&table, "toggle enabled")?;
        let phase = table.lifecycle.phase();

        let group = table
            .group_mut(id)
            .ok_or_else(|| EngineError::UnknownEntity(id.to_string()))?;
        let enabled = flip_enabled(
            id,
            phase,
            group.optional,
            &mut group.enabled,
            &mut group.status,
        )?;

        info!(group = id, enabled, "group toggled");
        self.inner.publish(&table);
        Ok(enabled)
    }

    /// Flip `enabled` on an optional module; returns the new value
    pub fn toggle_module_enabled(&self, group_id: &str, module_id: &str) -> EngineResult<bool> {
        let _busy = self.claim("toggle enabled")?;
        let mut table = self.inner.table.lock();
        EngineInner::ensure_unlocked(&table, "toggle enabled")?;
        let phase = table.lifecycle.phase();

        match table.module(module_id) {
            Some((owner, _)) if owner == group_id => {}
            _ => return Err(EngineError::UnknownEntity(format!("{}/{}", group_id, module_id))),
        }
        let module = table
            .module_mut(module_id)
            .ok_or_else(|| EngineError::UnknownEntity(module_id.to_string()))?;
        let enabled = flip_enabled(
            module_id,
            phase,
            module.optional,
            &mut module.enabled,
            &mut module.status,
        )?;
        table.refresh_group_progress(group_id);

        info!(group = group_id, module = module_id, enabled, "module toggled");
        self.inner.publish(&table);
        Ok(enabled)
    }

    /// Flip the breakpoint on a group or module; allowed while running
    pub fn toggle_breakpoint(&self, id: &str) -> EngineResult<bool> {
        let mut table = self.inner.table.lock();
        EngineInner::ensure_unlocked(&table, "toggle breakpoint")?;

        let breakpoint = match table.locate(id) {
            Some(EntityRef::Group(_)) => table.group_mut(id).map(|g| {
                g.breakpoint = !g.breakpoint;
                g.breakpoint
            }),
            Some(EntityRef::Module(..)) => table.module_mut(id).map(|m| {
                m.breakpoint = !m.breakpoint;
                m.breakpoint
            }),
            None => None,
        }
        .ok_or_else(|| EngineError::UnknownEntity(id.to_string()))?;

        debug!(id, breakpoint, "breakpoint toggled");
        self.inner.publish(&table);
        Ok(breakpoint)
    }

    /// Flip the frozen flag on a group or module; returns the new value
    pub fn toggle_frozen(&self, id: &str) -> EngineResult<bool> {
        let _busy = self.claim("toggle frozen")?;
        let mut table = self.inner.table.lock();
        EngineInner::ensure_unlocked(&table, "toggle frozen")?;

        if table.locate(id).is_none() {
            return Err(EngineError::UnknownEntity(id.to_string()));
        }
        let frozen = table.toggle_frozen(id);

        info!(id, frozen, "freeze toggled");
        self.inner.publish(&table);
        Ok(frozen)
    }

    /// Mark a group completed without running it
    pub fn force_complete_model(&self, id: &str) -> EngineResult<()> {
        let _busy = self.claim("force complete")?;
        let mut table = self.inner.table.lock();
        EngineInner::ensure_unlocked(&table, "force complete")?;
        let phase = table.lifecycle.phase();

        if table.freeze().is_frozen(id) {
            return Err(EngineError::invalid_transition(
                "force complete",
                phase,
                format!("'{}' is frozen", id),
            ));
        }
        let now = Utc::now();
        let group = table
            .group_mut(id)
            .ok_or_else(|| EngineError::UnknownEntity(id.to_string()))?;
        if !group.enabled {
            return Err(EngineError::invalid_transition(
                "force complete",
                phase,
                format!("'{}' is disabled", id),
            ));
        }

        group.status = UnitStatus::Completed;
        group.progress = 100;
        group.error = None;
        let started = *group.start_time.get_or_insert(now);
        group.end_time = Some(now);

        warn!(group = id, "group force-completed");
        self.inner.event_tx.send_event(ExecutionEvent::group_completed(
            id,
            UnitStatus::Completed,
            elapsed(Some(started), now),
        ));
        self.inner.settle_locked(&mut table);
        self.inner.publish(&table);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Static topological order of enabled, unfrozen groups
    pub fn get_execution_sequence(&self) -> Vec<String> {
        let table = self.inner.table.lock();
        let states = table.group_states();
        self.inner
            .graphs
            .groups
            .topological_order(|id| states.get(id).is_some_and(|s| s.enabled && !s.frozen))
            .into_iter()
            .map(String::from)
            .collect()
    }

    /// Static parallel levels of enabled, unfrozen groups
    pub fn get_parallel_execution_groups(&self) -> Vec<Vec<String>> {
        let table = self.inner.table.lock();
        let states = table.group_states();
        self.inner
            .graphs
            .groups
            .levels(|id| states.get(id).is_some_and(|s| s.enabled && !s.frozen))
            .into_iter()
            .map(|level| level.into_iter().map(String::from).collect())
            .collect()
    }

    pub fn get_run_state(&self) -> RunState {
        self.inner.table.lock().run_state()
    }

    pub fn get_run_id(&self) -> Option<String> {
        self.inner.table.lock().lifecycle.run_id().map(String::from)
    }

    /// Elapsed time of the current pass; still counting while running
    pub fn get_run_duration(&self) -> Option<Duration> {
        self.inner.table.lock().lifecycle.duration(Utc::now())
    }

    /// Why a group is (or is not) ready to run
    pub fn debug_model_dependency_status(&self, id: &str) -> EngineResult<DependencyReport> {
        let table = self.inner.table.lock();
        let group = table
            .group(id)
            .ok_or_else(|| EngineError::UnknownEntity(id.to_string()))?;

        let states = table.group_states();
        let verdicts = table.verdicts(&self.inner.rules);
        let held = self.inner.held_groups(&table, &verdicts);
        let scheduler = Scheduler::new(&self.inner.graphs.groups).holding(&held);

        let dependency_status = group
            .dependencies
            .iter()
            .filter_map(|dep| {
                let state = states.get(dep)?;
                let skipped = verdicts.is_skipped(dep);
                Some(DependencyStatus {
                    id: dep.clone(),
                    status: state.status,
                    enabled: state.enabled,
                    frozen: state.frozen,
                    skipped_by_rule: skipped,
                    satisfied: skipped || state.satisfies_dependents(),
                })
            })
            .collect();

        let report = DependencyReport {
            model: id.to_string(),
            status: group.status,
            dependency_status,
            processed: group.status.is_terminal(),
            ready: scheduler.is_ready(id, &states, &verdicts),
            skipped_by_rule: verdicts.is_skipped(id),
            forced_by_rule: verdicts.is_forced(id),
            waiting_modules: self
                .inner
                .waiting_modules(&table, id, &verdicts)
                .into_iter()
                .flat_map(|(_, pending)| pending)
                .collect(),
        };
        debug!(group = id, ready = report.ready, processed = report.processed, "dependency status");
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Run lifecycle
    // ------------------------------------------------------------------

    /// `MAIN_COMPLETE -> ADJUSTMENTS`
    pub fn transition_to_adjustments_phase(&self) -> EngineResult<()> {
        let mut table = self.inner.table.lock();
        let from = table.lifecycle.phase();
        table.lifecycle.transition_to_adjustments()?;
        self.inner.phase_changed(from, table.lifecycle.phase());
        self.inner.publish(&table);
        Ok(())
    }

    /// Lock results; `MAIN_COMPLETE | ADJUSTMENTS -> FINALIZED`
    pub fn finalize_run(&self) -> EngineResult<()> {
        let _busy = self.claim("finalize run")?;
        let mut table = self.inner.table.lock();
        let from = table.lifecycle.phase();
        table.lifecycle.finalize()?;
        self.inner.phase_changed(from, table.lifecycle.phase());
        self.inner.publish(&table);
        Ok(())
    }

    /// Start a new iteration of the current run; returns the new count
    pub fn increment_iteration_count(&self) -> EngineResult<u32> {
        let mut table = self.inner.table.lock();
        let iteration = table.lifecycle.increment_iteration()?;
        info!(
            run_id = table.lifecycle.run_id().unwrap_or_default(),
            iteration, "iteration pending"
        );
        self.inner.publish(&table);
        Ok(iteration)
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Current state as the persisted JSON document
    pub fn persisted_state(&self) -> PersistedState {
        PersistedState::from(self.snapshot().as_ref())
    }

    /// Apply a persisted document to the configured groups
    pub fn restore(&self, state: &PersistedState) -> EngineResult<()> {
        let _busy = self.claim("restore")?;
        let mut table = self.inner.table.lock();
        state.apply_to(&mut table);
        self.inner.gate.resume();
        info!(
            run_id = state.run_id.as_deref().unwrap_or_default(),
            phase = %table.lifecycle.phase(),
            "state restored"
        );
        self.inner.publish(&table);
        Ok(())
    }
}

/// Toggle `enabled` on an optional, idle-or-done unit
fn flip_enabled(
    id: &str,
    phase: RunPhase,
    optional: bool,
    enabled: &mut bool,
    status: &mut UnitStatus,
) -> EngineResult<bool> {
    if !optional {
        return Err(EngineError::invalid_transition(
            "toggle enabled",
            phase,
            format!("'{}' is not optional", id),
        ));
    }
    if *status == UnitStatus::Running {
        return Err(EngineError::invalid_transition(
            "toggle enabled",
            phase,
            format!("'{}' is running", id),
        ));
    }
    *enabled = !*enabled;
    *status = if *enabled {
        UnitStatus::Idle
    } else {
        UnitStatus::Disabled
    };
    Ok(*enabled)
}

/// State of a group once none of its modules can start
enum Collection {
    /// Every module is done; collect the group outputs
    Ready(ModelGroup, Vec<(String, Vec<Output>)>),
    Failed(String),
    /// A module still waits on a dependency outside the group
    Waiting(EngineError),
}

fn elapsed(start: Option<DateTime<Utc>>, end: DateTime<Utc>) -> Duration {
    start
        .and_then(|s| (end - s).to_std().ok())
        .unwrap_or_default()
}

impl EngineInner {
    fn publish(&self, table: &StatusTable) {
        self.snapshots.send_replace(Arc::new(table.snapshot()));
    }

    fn phase_changed(&self, from: RunPhase, to: RunPhase) {
        if from != to {
            info!(%from, %to, "run phase changed");
            self.event_tx.send_event(ExecutionEvent::PhaseChanged { from, to });
        }
    }

    fn ensure_unlocked(table: &StatusTable, operation: &'static str) -> EngineResult<()> {
        if table.lifecycle.is_locked() {
            return Err(EngineError::invalid_transition(
                operation,
                table.lifecycle.phase(),
                "results are finalized",
            ));
        }
        Ok(())
    }

    fn ensure_not_paused(table: &StatusTable, operation: &'static str) -> EngineResult<()> {
        if table.lifecycle.is_paused() {
            return Err(EngineError::invalid_transition(
                operation,
                table.lifecycle.phase(),
                "execution is paused",
            ));
        }
        Ok(())
    }

    fn resume_locked(&self, table: &mut StatusTable) {
        if !table.lifecycle.is_paused() {
            return;
        }
        table.lifecycle.set_paused(false, None);
        self.gate.resume();
        info!("execution resumed");
        self.event_tx.send_event(ExecutionEvent::Resumed);
        self.publish(table);
    }

    fn pause_on_breakpoint(&self, table: &mut StatusTable, id: &str) {
        table.lifecycle.set_paused(true, Some(id.to_string()));
        self.gate.pause();
        info!(unit = id, "breakpoint hit, execution paused");
        self.event_tx.send_event(ExecutionEvent::BreakpointHit {
            unit_id: id.to_string(),
        });
        self.event_tx.send_event(ExecutionEvent::Paused {
            on: Some(id.to_string()),
        });
    }

    fn begin_pass(&self) -> EngineResult<PassStart> {
        let mut table = self.table.lock();
        let from = table.lifecycle.phase();
        let start = table.lifecycle.begin_pass(Utc::now())?;
        self.phase_changed(from, RunPhase::Initiated);

        table.reset_unfrozen();
        if table.lifecycle.is_paused() {
            self.gate.pause();
        } else {
            self.gate.resume();
        }
        self.publish(&table);

        table.lifecycle.mark_running()?;
        self.phase_changed(RunPhase::Initiated, RunPhase::Running);
        self.publish(&table);
        Ok(start)
    }

    fn next_groups(&self, parallel: bool, deferred: &[String]) -> Vec<String> {
        let table = self.table.lock();
        let states = table.group_states();
        let verdicts = table.verdicts(&self.rules);
        let mut held = self.held_groups(&table, &verdicts);
        held.extend(deferred.iter().cloned());
        let scheduler = Scheduler::new(&self.graphs.groups).holding(&held);

        let ready = if parallel {
            scheduler.next_parallel_batch(&states, &verdicts)
        } else {
            scheduler.next_sequential(&states, &verdicts).into_iter().collect()
        };
        ready.into_iter().map(String::from).collect()
    }

    fn module_graph(&self, group_id: &str) -> Option<&DependencyGraph> {
        self.graphs.modules.get(group_id)
    }

    /// Rule verdicts as seen by the modules of `group_id`
    ///
    /// Modules of a rule-skipped group satisfy their dependents like the
    /// group does. A group forced by a `run` rule waives the cross-group
    /// dependencies of its modules.
    fn module_verdicts(
        &self,
        table: &StatusTable,
        group_id: &str,
        verdicts: &RuleVerdicts,
    ) -> RuleVerdicts {
        let mut modules = RuleVerdicts::default();
        for group in table.groups().iter().filter(|g| verdicts.is_skipped(&g.id)) {
            for module in &group.modules {
                modules.record(&module.id, RuleAction::Skip);
            }
        }
        if verdicts.is_forced(group_id) {
            if let Some(graph) = self.module_graph(group_id) {
                for dep in graph.nodes().iter().flat_map(|n| n.external.iter()) {
                    modules.record(dep, RuleAction::Skip);
                }
            }
        }
        modules
    }

    /// Cross-group module dependencies of `group_id` that are not satisfied
    fn waiting_modules(
        &self,
        table: &StatusTable,
        group_id: &str,
        verdicts: &RuleVerdicts,
    ) -> Vec<(String, Vec<String>)> {
        let Some(graph) = self.module_graph(group_id) else {
            return Vec::new();
        };
        let states = table.module_states();
        let module_verdicts = self.module_verdicts(table, group_id, verdicts);
        let scheduler = Scheduler::new(graph);

        graph
            .nodes()
            .iter()
            .filter(|n| !n.external.is_empty())
            .filter(|n| states.get(&n.id).is_some_and(|s| s.enabled && !s.frozen))
            .filter_map(|n| {
                let pending: Vec<String> = scheduler
                    .pending_dependencies(&n.id, &states, &module_verdicts)
                    .into_iter()
                    .filter(|dep| n.external.iter().any(|e| e == dep))
                    .map(String::from)
                    .collect();
                (!pending.is_empty()).then(|| (n.id.clone(), pending))
            })
            .collect()
    }

    /// Idle groups that must not start because a module still waits on
    /// another group
    fn held_groups(&self, table: &StatusTable, verdicts: &RuleVerdicts) -> Vec<String> {
        table
            .groups()
            .iter()
            .filter(|g| g.status == UnitStatus::Idle)
            .filter(|g| !self.waiting_modules(table, &g.id, verdicts).is_empty())
            .map(|g| g.id.clone())
            .collect()
    }

    fn next_modules(&self, group_id: &str, parallel: bool) -> Vec<String> {
        let Some(graph) = self.module_graph(group_id) else {
            return Vec::new();
        };
        let table = self.table.lock();
        let states = table.module_states();
        let verdicts = self.module_verdicts(&table, group_id, &table.verdicts(&self.rules));
        let scheduler = Scheduler::new(graph);

        let ready = if parallel {
            scheduler.next_parallel_batch(&states, &verdicts)
        } else {
            scheduler.next_sequential(&states, &verdicts).into_iter().collect()
        };
        ready.into_iter().map(String::from).collect()
    }

    /// Move a unit to `running` unless the engine is paused
    fn try_mark_running(&self, id: &str) -> bool {
        let mut table = self.table.lock();
        if table.lifecycle.is_paused() {
            return false;
        }
        let now = Utc::now();

        match table.locate(id) {
            Some(EntityRef::Group(_)) => {
                let Some(group) = table.group_mut(id) else {
                    return false;
                };
                group.status = UnitStatus::Running;
                group.progress = 0;
                group.start_time = Some(now);
                group.end_time = None;
                group.error = None;
                let modules = group.modules.iter().filter(|m| m.enabled).count();
                debug!(group = id, modules, "group started");
                self.event_tx
                    .send_event(ExecutionEvent::group_started(id, modules));
            }
            Some(EntityRef::Module(..)) => {
                let group_id = match table.module(id) {
                    Some((group_id, _)) => group_id.to_string(),
                    None => return false,
                };
                let Some(module) = table.module_mut(id) else {
                    return false;
                };
                module.status = UnitStatus::Running;
                module.start_time = Some(now);
                module.end_time = None;
                module.error = None;
                debug!(group = %group_id, module = id, "module started");
                self.event_tx
                    .send_event(ExecutionEvent::module_started(&group_id, id));
            }
            None => return false,
        }

        self.publish(&table);
        true
    }

    /// Build the compute request; inputs are the outputs of upstream groups
    /// and module dependencies
    fn module_request(&self, group_id: &str, module_id: &str) -> (ModuleRequest, u8) {
        let table = self.table.lock();
        let mut inputs = ComputeInputs::new();

        if let Some(group) = table.group(group_id) {
            for dep in &group.dependencies {
                if let Some(outputs) = table.available_outputs(dep) {
                    inputs.insert(dep.clone(), outputs);
                }
            }
        }

        let module = table
            .module(module_id)
            .map(|(_, m)| m.clone())
            .unwrap_or_else(|| Module::new(module_id));
        for dep in &module.dependencies {
            if let Some(outputs) = table.available_outputs(dep) {
                inputs.insert(dep.clone(), outputs);
            }
        }

        let start = module.progress;
        (
            ModuleRequest {
                group_id: group_id.to_string(),
                module,
                inputs,
            },
            start,
        )
    }

    fn finish_module(
        &self,
        group_id: &str,
        module_id: &str,
        result: Result<Vec<Output>, ComputeError>,
    ) -> UnitStatus {
        let mut table = self.table.lock();
        let now = Utc::now();
        let Some(module) = table.module_mut(module_id) else {
            return UnitStatus::Failed;
        };

        module.end_time = Some(now);
        match result {
            Ok(outputs) => {
                module.status = UnitStatus::Completed;
                module.progress = 100;
                module.outputs = outputs;
            }
            Err(e) => {
                warn!(group = group_id, module = module_id, error = %e, "module failed");
                module.status = UnitStatus::Failed;
                module.error = Some(e.message.clone());
                self.event_tx.send_event(ExecutionEvent::execution_error(
                    e.message,
                    Some(group_id.to_string()),
                    Some(module_id.to_string()),
                ));
            }
        }

        let status = module.status;
        let breakpoint = module.breakpoint;
        let duration = elapsed(module.start_time, now);
        self.event_tx.send_event(ExecutionEvent::module_completed(
            group_id, module_id, status, duration,
        ));

        table.refresh_group_progress(group_id);
        if status == UnitStatus::Completed && breakpoint {
            self.pause_on_breakpoint(&mut table, module_id);
        }
        self.publish(&table);
        status
    }

    /// What the group's modules left behind once none of them can start
    fn group_collection(&self, group_id: &str) -> Collection {
        let table = self.table.lock();
        let Some(group) = table.group(group_id) else {
            return Collection::Failed(EngineError::UnknownEntity(group_id.to_string()).to_string());
        };

        if let Some(failed) = group
            .modules
            .iter()
            .find(|m| m.status == UnitStatus::Failed)
        {
            return Collection::Failed(
                EngineError::ModuleExecutionFailure {
                    group_id: group_id.to_string(),
                    module_id: failed.id.clone(),
                    message: failed.error.clone().unwrap_or_default(),
                }
                .to_string(),
            );
        }

        if let Some(graph) = self.module_graph(group_id) {
            let states = table.module_states();
            let verdicts = self.module_verdicts(&table, group_id, &table.verdicts(&self.rules));
            let scheduler = Scheduler::new(graph);
            if let Some(blocked) = scheduler.blocked(&states, &verdicts).first() {
                return Collection::Waiting(EngineError::DependencyUnsatisfied {
                    id: blocked.to_string(),
                    pending: scheduler
                        .pending_dependencies(blocked, &states, &verdicts)
                        .into_iter()
                        .map(String::from)
                        .collect(),
                });
            }
        }

        let module_outputs = group
            .modules
            .iter()
            .filter(|m| m.enabled)
            .filter(|m| m.status == UnitStatus::Completed || table.freeze().is_frozen(&m.id))
            .map(|m| (m.id.clone(), m.outputs.clone()))
            .collect();

        Collection::Ready(group.clone(), module_outputs)
    }

    /// Send a started group back to idle; it shows as blocked until its
    /// modules can proceed
    fn return_to_idle(&self, group_id: &str, reason: &EngineError) -> UnitStatus {
        let mut table = self.table.lock();
        let Some(group) = table.group_mut(group_id) else {
            return UnitStatus::Failed;
        };
        group.status = UnitStatus::Idle;
        group.start_time = None;
        group.end_time = None;

        warn!(group = group_id, reason = %reason, "group waiting on dependencies");
        self.event_tx.send_event(ExecutionEvent::warning(
            reason.to_string(),
            Some(group_id.to_string()),
        ));
        self.publish(&table);
        UnitStatus::Idle
    }

    fn complete_group(&self, group_id: &str, result: Result<Vec<Output>, String>) -> UnitStatus {
        let mut table = self.table.lock();
        let now = Utc::now();
        let Some(group) = table.group_mut(group_id) else {
            return UnitStatus::Failed;
        };

        group.end_time = Some(now);
        match result {
            Ok(outputs) => {
                group.status = UnitStatus::Completed;
                group.progress = 100;
                group.outputs = outputs;
                group.error = None;
            }
            Err(message) => {
                warn!(group = group_id, error = %message, "group failed");
                group.status = UnitStatus::Failed;
                group.error = Some(message.clone());
                self.event_tx.send_event(ExecutionEvent::execution_error(
                    message,
                    Some(group_id.to_string()),
                    None,
                ));
            }
        }

        let status = group.status;
        let breakpoint = group.breakpoint;
        let duration = elapsed(group.start_time, now);
        info!(group = group_id, %status, ?duration, "group finished");
        self.event_tx
            .send_event(ExecutionEvent::group_completed(group_id, status, duration));

        if status == UnitStatus::Completed && breakpoint {
            self.pause_on_breakpoint(&mut table, group_id);
        }
        self.publish(&table);
        status
    }

    fn finish_pass(&self, start: PassStart, parallel: bool, batches: Vec<Vec<String>>) -> RunOutcome {
        let mut table = self.table.lock();
        let now = Utc::now();
        let states = table.group_states();
        let verdicts = table.verdicts(&self.rules);
        let scheduler = Scheduler::new(&self.graphs.groups);

        let blocked: Vec<String> = scheduler
            .blocked(&states, &verdicts)
            .into_iter()
            .map(String::from)
            .collect();
        let skipped: Vec<String> = verdicts
            .skipped()
            .filter(|id| {
                states
                    .get(*id)
                    .is_some_and(|s| s.enabled && !s.frozen && s.status == UnitStatus::Idle)
            })
            .map(String::from)
            .collect();
        for id in &skipped {
            self.event_tx.send_event(ExecutionEvent::GroupSkipped {
                group_id: id.clone(),
                reason: "excluded by conditional rule".to_string(),
            });
        }

        let with_status = |status: UnitStatus| -> Vec<String> {
            table
                .groups()
                .iter()
                .filter(|g| g.status == status && !table.freeze().is_frozen(&g.id))
                .map(|g| g.id.clone())
                .collect()
        };
        let completed = with_status(UnitStatus::Completed);
        let failed = with_status(UnitStatus::Failed);

        if blocked.is_empty() {
            if table.lifecycle.complete_main(now).is_ok() {
                self.phase_changed(RunPhase::Running, RunPhase::MainComplete);
            }
        } else {
            warn!(blocked = ?blocked, failed = ?failed, "pass stalled on unsatisfied dependencies");
        }

        let phase = table.lifecycle.phase();
        let duration = table.lifecycle.duration(now).unwrap_or_default();
        info!(
            run_id = %start.run_id,
            %phase,
            completed = completed.len(),
            failed = failed.len(),
            blocked = blocked.len(),
            "run finished"
        );
        self.event_tx.send_event(ExecutionEvent::RunCompleted {
            run_id: start.run_id.clone(),
            phase,
            completed: completed.len(),
            failed: failed.len(),
            blocked: blocked.len(),
            duration,
        });
        self.publish(&table);

        RunOutcome {
            run_id: start.run_id,
            iteration: start.iteration,
            parallel,
            sequence: batches.iter().flatten().cloned().collect(),
            batches,
            completed,
            failed,
            skipped,
            blocked,
            phase,
            duration,
        }
    }

    /// Checks before a single group run; clears a previous result
    fn prepare_group_run(&self, id: &str) -> EngineResult<()> {
        let mut table = self.table.lock();
        Self::ensure_unlocked(&table, "run model")?;
        Self::ensure_not_paused(&table, "run model")?;
        let phase = table.lifecycle.phase();

        let group = table
            .group(id)
            .ok_or_else(|| EngineError::UnknownEntity(id.to_string()))?;
        if !group.enabled {
            return Err(EngineError::invalid_transition(
                "run model",
                phase,
                format!("'{}' is disabled", id),
            ));
        }
        if table.freeze().is_frozen(id) {
            return Err(EngineError::invalid_transition(
                "run model",
                phase,
                format!("'{}' is frozen", id),
            ));
        }

        let states = table.group_states();
        let pending = Scheduler::new(&self.graphs.groups).pending_dependencies(
            id,
            &states,
            &RuleVerdicts::default(),
        );
        if !pending.is_empty() {
            return Err(EngineError::DependencyUnsatisfied {
                id: id.to_string(),
                pending: pending.into_iter().map(String::from).collect(),
            });
        }
        let verdicts = table.verdicts(&self.rules);
        let waiting = self.waiting_modules(&table, id, &verdicts);
        if let Some((module_id, pending)) = waiting.into_iter().next() {
            return Err(EngineError::DependencyUnsatisfied {
                id: module_id,
                pending,
            });
        }

        table.reset_group(id);
        self.publish(&table);
        Ok(())
    }

    /// Checks before a single module run; returns whether the owning group
    /// had already been processed
    fn prepare_module_run(&self, group_id: &str, module_id: &str) -> EngineResult<bool> {
        let mut table = self.table.lock();
        Self::ensure_unlocked(&table, "run module")?;
        Self::ensure_not_paused(&table, "run module")?;
        let phase = table.lifecycle.phase();

        let group = table
            .group(group_id)
            .ok_or_else(|| EngineError::UnknownEntity(group_id.to_string()))?;
        let group_processed = group.status.is_terminal();
        let module = group
            .module(module_id)
            .ok_or_else(|| EngineError::UnknownEntity(format!("{}/{}", group_id, module_id)))?;
        if !group.enabled || !module.enabled {
            return Err(EngineError::invalid_transition(
                "run module",
                phase,
                format!("'{}' is disabled", module_id),
            ));
        }
        if table.freeze().is_frozen(group_id) || table.freeze().is_frozen(module_id) {
            return Err(EngineError::invalid_transition(
                "run module",
                phase,
                format!("'{}' is frozen", module_id),
            ));
        }

        let verdicts = RuleVerdicts::default();
        let group_states = table.group_states();
        let mut pending: Vec<String> = Scheduler::new(&self.graphs.groups)
            .pending_dependencies(group_id, &group_states, &verdicts)
            .into_iter()
            .map(String::from)
            .collect();
        if let Some(graph) = self.module_graph(group_id) {
            let module_states = table.module_states();
            let module_verdicts =
                self.module_verdicts(&table, group_id, &table.verdicts(&self.rules));
            pending.extend(
                Scheduler::new(graph)
                    .pending_dependencies(module_id, &module_states, &module_verdicts)
                    .into_iter()
                    .map(String::from),
            );
        }
        if !pending.is_empty() {
            return Err(EngineError::DependencyUnsatisfied {
                id: module_id.to_string(),
                pending,
            });
        }

        table.reset_module(module_id);
        self.publish(&table);
        Ok(group_processed)
    }

    /// Re-check a stalled pass after a manual run
    fn settle_pass(&self) {
        let mut table = self.table.lock();
        self.settle_locked(&mut table);
        self.publish(&table);
    }

    fn settle_locked(&self, table: &mut StatusTable) {
        if table.lifecycle.phase() != RunPhase::Running {
            return;
        }
        let states = table.group_states();
        let verdicts = table.verdicts(&self.rules);
        let blocked = Scheduler::new(&self.graphs.groups).blocked(&states, &verdicts);
        if blocked.is_empty() && table.lifecycle.complete_main(Utc::now()).is_ok() {
            self.phase_changed(RunPhase::Running, RunPhase::MainComplete);
        }
    }
}

impl ProgressSink for EngineInner {
    fn record_progress(&self, unit_id: &str, percent: u8) {
        let mut table = self.table.lock();
        let Some(group_id) = table.module(unit_id).map(|(g, _)| g.to_string()) else {
            return;
        };
        if let Some(module) = table.module_mut(unit_id) {
            module.progress = percent;
        }
        table.refresh_group_progress(&group_id);
        self.event_tx.send_event(ExecutionEvent::ModuleProgress {
            group_id,
            module_id: unit_id.to_string(),
            progress: percent,
        });
        self.publish(&table);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::conditions::{ComparisonOperator, RuleAction};
    use crate::execution::events::{progress_channel, ProgressReceiver};
    use crate::workflow::models::WorkSpec;

    fn work(duration_ms: u64, outputs: Vec<Output>) -> WorkSpec {
        WorkSpec {
            duration_ms,
            ticks: 2,
            outputs,
            fail: false,
        }
    }

    fn failing() -> WorkSpec {
        WorkSpec {
            fail: true,
            ..work(2, Vec::new())
        }
    }

    fn group(id: &str, deps: &[&str], module: &str, spec: WorkSpec) -> ModelGroup {
        ModelGroup::new(id)
            .with_dependencies(deps.iter().copied())
            .with_module(Module::new(module).with_work(spec))
    }

    /// Econ -> Fin -> Risk, Risk optional
    fn chain() -> Workflow {
        Workflow::new(
            "chain",
            vec![
                group("Econ", &[], "gdp", work(4, vec![Output::new("gdp", 2.0)])),
                group("Fin", &["Econ"], "spread", work(4, vec![Output::new("spread", 1.5)])),
                group("Risk", &["Fin"], "var", work(4, vec![Output::new("var", 0.3)])).optional(),
            ],
        )
    }

    fn engine(workflow: Workflow) -> ExecutionEngine {
        ExecutionEngine::new(workflow).unwrap()
    }

    fn engine_with_events(workflow: Workflow) -> (ExecutionEngine, ProgressReceiver) {
        let (tx, rx) = progress_channel();
        let engine = ExecutionEngine::builder(workflow)
            .with_progress(tx)
            .build()
            .unwrap();
        (engine, rx)
    }

    fn drain(rx: &mut ProgressReceiver) -> Vec<ExecutionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn wait_for(
        engine: &ExecutionEngine,
        condition: impl FnMut(&Arc<EngineSnapshot>) -> bool,
    ) -> Arc<EngineSnapshot> {
        let mut rx = engine.subscribe();
        let snapshot = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(condition))
            .await
            .expect("timed out waiting for snapshot")
            .expect("engine dropped");
        snapshot.clone()
    }

    #[tokio::test]
    async fn test_sequential_run() {
        let engine = engine(chain());
        let outcome = engine.run_all(false).await.unwrap();

        assert_eq!(outcome.sequence, vec!["Econ", "Fin", "Risk"]);
        assert_eq!(outcome.completed, vec!["Econ", "Fin", "Risk"]);
        assert!(outcome.failed.is_empty());
        assert!(outcome.is_complete());

        let snapshot = engine.snapshot();
        let econ = snapshot.group("Econ").unwrap();
        assert_eq!(econ.outputs, vec![Output::new("gdp", 2.0)]);
        assert_eq!(econ.progress, 100);
        assert!(econ.start_time.is_some() && econ.end_time.is_some());
        assert_eq!(snapshot.run.phase, RunPhase::MainComplete);
        assert_eq!(snapshot.run.iteration_count, 1);
        assert!(engine.get_run_duration().is_some());
    }

    #[tokio::test]
    async fn test_parallel_batches_follow_levels() {
        let engine = engine(chain());
        let outcome = engine.run_all(true).await.unwrap();

        assert_eq!(
            outcome.batches,
            vec![vec!["Econ"], vec!["Fin"], vec!["Risk"]]
        );
        assert!(outcome.is_complete());
    }

    #[tokio::test]
    async fn test_parallel_batch_runs_siblings_together() {
        let workflow = Workflow::new(
            "diamond",
            vec![
                group("Econ", &[], "gdp", work(10, Vec::new())),
                group("Climate", &[], "temp", work(10, Vec::new())),
                group("Fin", &["Econ"], "spread", work(2, Vec::new())),
                group("Risk", &["Fin", "Climate"], "var", work(2, Vec::new())),
            ],
        );
        let engine = ExecutionEngine::builder(workflow)
            .with_config(EngineConfig {
                max_parallel_groups: 1,
                max_parallel_modules: 0,
            })
            .build()
            .unwrap();

        assert_eq!(
            engine.get_parallel_execution_groups(),
            vec![vec!["Econ", "Climate"], vec!["Fin"], vec!["Risk"]]
        );

        let outcome = engine.run_all(true).await.unwrap();
        assert_eq!(
            outcome.batches,
            vec![vec!["Econ", "Climate"], vec!["Fin"], vec!["Risk"]]
        );
        assert_eq!(outcome.completed.len(), 4);
    }

    #[tokio::test]
    async fn test_modules_follow_their_graph() {
        let workflow = Workflow::new(
            "modules",
            vec![
                ModelGroup::new("Econ")
                    .with_module(Module::new("gdp").with_work(work(2, vec![Output::new("gdp", 1.0)])))
                    .with_module(
                        Module::new("cpi")
                            .with_dependencies(["gdp"])
                            .with_work(work(2, vec![Output::new("cpi", 2.0)])),
                    ),
                ModelGroup::new("Fin").with_dependencies(["Econ"]).with_module(
                    Module::new("spread")
                        .with_dependencies(["cpi"])
                        .with_work(work(2, Vec::new())),
                ),
            ],
        );
        let (engine, mut rx) = engine_with_events(workflow);
        engine.run_all(true).await.unwrap();

        let started: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                ExecutionEvent::ModuleStarted { module_id, .. } => Some(module_id),
                _ => None,
            })
            .collect();
        assert_eq!(started, vec!["gdp", "cpi", "spread"]);

        // Group outputs default to the concatenated module outputs
        let econ = engine.snapshot().group("Econ").unwrap().clone();
        assert_eq!(
            econ.outputs,
            vec![Output::new("gdp", 1.0), Output::new("cpi", 2.0)]
        );
    }

    #[tokio::test]
    async fn test_breakpoint_halts_until_continue() {
        let mut workflow = chain();
        workflow.groups[1].breakpoint = true;
        let engine = engine(workflow);

        let runner = engine.clone();
        let handle = tokio::spawn(async move { runner.run_all(false).await });

        let snapshot = wait_for(&engine, |s| s.run.paused).await;
        assert_eq!(snapshot.run.paused_on_id.as_deref(), Some("Fin"));
        assert_eq!(snapshot.status_of("Fin"), Some(UnitStatus::Completed));
        assert_eq!(snapshot.status_of("Risk"), Some(UnitStatus::Idle));

        // Only the breakpoint that paused the run can continue it
        assert!(matches!(
            engine.continue_after_breakpoint("Risk"),
            Err(EngineError::BreakpointWithoutActiveRun { .. })
        ));

        engine.continue_after_breakpoint("Fin").unwrap();
        let outcome = handle.await.unwrap().unwrap();

        assert_eq!(engine.snapshot().status_of("Risk"), Some(UnitStatus::Completed));
        assert!(outcome.is_complete());
        assert!(!engine.get_run_state().paused);
    }

    #[tokio::test]
    async fn test_continue_without_pause_is_rejected() {
        let engine = engine(chain());
        let err = engine.continue_after_breakpoint("Fin").unwrap_err();
        assert!(matches!(err, EngineError::BreakpointWithoutActiveRun { .. }));
        assert_eq!(engine.get_run_state().phase, RunPhase::Idle);
    }

    #[tokio::test]
    async fn test_failure_blocks_dependents() {
        let mut workflow = chain();
        workflow.groups[0] = group("Econ", &[], "gdp", failing());
        let engine = engine(workflow);

        let outcome = engine.run_all(false).await.unwrap();

        assert_eq!(outcome.failed, vec!["Econ"]);
        assert_eq!(outcome.blocked, vec!["Fin", "Risk"]);
        assert_eq!(outcome.phase, RunPhase::Running);
        assert!(!outcome.is_complete());

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.status_of("gdp"), Some(UnitStatus::Failed));
        assert_eq!(snapshot.status_of("Fin"), Some(UnitStatus::Idle));
        assert_eq!(snapshot.status_of("Risk"), Some(UnitStatus::Idle));
        assert!(snapshot.group("Econ").unwrap().error.as_deref().unwrap().contains("gdp"));

        let report = engine.debug_model_dependency_status("Fin").unwrap();
        assert!(!report.processed);
        assert!(!report.ready);
        assert_eq!(report.dependency_status[0].status, UnitStatus::Failed);
        assert!(!report.dependency_status[0].satisfied);
    }

    #[tokio::test]
    async fn test_force_complete_and_run_model_settle_stalled_pass() {
        let mut workflow = chain();
        workflow.groups[0] = group("Econ", &[], "gdp", failing());
        let engine = engine(workflow);
        engine.run_all(false).await.unwrap();

        engine.force_complete_model("Econ").unwrap();
        assert_eq!(engine.get_run_state().phase, RunPhase::Running);
        assert!(engine.debug_model_dependency_status("Fin").unwrap().ready);

        assert_eq!(engine.run_model("Fin").await.unwrap(), UnitStatus::Completed);
        assert_eq!(engine.get_run_state().phase, RunPhase::Running);

        assert_eq!(engine.run_model("Risk").await.unwrap(), UnitStatus::Completed);
        assert_eq!(engine.get_run_state().phase, RunPhase::MainComplete);
    }

    #[tokio::test]
    async fn test_run_model_requires_dependencies() {
        let engine = engine(chain());
        let err = engine.run_model("Fin").await.unwrap_err();

        match err {
            EngineError::DependencyUnsatisfied { id, pending } => {
                assert_eq!(id, "Fin");
                assert_eq!(pending, vec!["Econ"]);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(engine.snapshot().status_of("Fin"), Some(UnitStatus::Idle));
    }

    #[tokio::test]
    async fn test_run_module_refreshes_group() {
        let engine = engine(chain());
        engine.run_all(false).await.unwrap();

        let status = engine.run_module("Econ", "gdp").await.unwrap();
        assert_eq!(status, UnitStatus::Completed);
        assert_eq!(engine.snapshot().status_of("Econ"), Some(UnitStatus::Completed));

        assert!(matches!(
            engine.run_module("Econ", "spread").await,
            Err(EngineError::UnknownEntity(_))
        ));
    }

    #[tokio::test]
    async fn test_finalize_from_idle_rejected() {
        let engine = engine(chain());
        let err = engine.finalize_run().unwrap_err();

        assert!(matches!(err, EngineError::InvalidStateTransition { .. }));
        assert_eq!(engine.get_run_state().phase, RunPhase::Idle);
    }

    #[tokio::test]
    async fn test_pause_is_idempotent() {
        let (engine, mut rx) = engine_with_events(chain());

        engine.pause_execution();
        engine.pause_execution();
        assert!(engine.get_run_state().paused);

        engine.resume_execution();
        engine.resume_execution();
        assert!(!engine.get_run_state().paused);

        let events = drain(&mut rx);
        let paused = events
            .iter()
            .filter(|e| matches!(e, ExecutionEvent::Paused { .. }))
            .count();
        let resumed = events
            .iter()
            .filter(|e| matches!(e, ExecutionEvent::Resumed))
            .count();
        assert_eq!((paused, resumed), (1, 1));
    }

    #[tokio::test]
    async fn test_pause_suspends_running_work() {
        let workflow = Workflow::new(
            "slow",
            vec![ModelGroup::new("Econ").with_module(Module::new("gdp").with_work(WorkSpec {
                duration_ms: 400,
                ticks: 20,
                outputs: Vec::new(),
                fail: false,
            }))],
        );
        let engine = engine(workflow);
        let runner = engine.clone();
        let handle = tokio::spawn(async move { runner.run_all(false).await });

        wait_for(&engine, |s| s.module("gdp").is_some_and(|m| m.progress >= 20)).await;
        engine.pause_execution();

        // Let the tick in flight land, then progress must hold still
        tokio::time::sleep(Duration::from_millis(80)).await;
        let held = engine.snapshot().module("gdp").unwrap().progress;
        assert_eq!(engine.in_flight_tasks().len(), 1);
        assert!(engine.in_flight_tasks()[0].1.suspended);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(engine.snapshot().module("gdp").unwrap().progress, held);
        assert!(held < 100);

        engine.resume_execution();
        let outcome = handle.await.unwrap().unwrap();
        assert!(outcome.is_complete());
        assert!(engine.in_flight_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_run_all_rejected_while_running() {
        let workflow = Workflow::new(
            "slow",
            vec![group("Econ", &[], "gdp", work(200, Vec::new()))],
        );
        let engine = engine(workflow);
        let runner = engine.clone();
        let handle = tokio::spawn(async move { runner.run_all(false).await });

        wait_for(&engine, |s| s.status_of("Econ") == Some(UnitStatus::Running)).await;
        assert!(matches!(
            engine.run_all(true).await,
            Err(EngineError::InvalidStateTransition { .. })
        ));
        assert!(engine.reset_outputs().is_err());

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_freeze_survives_reset() {
        let engine = engine(chain());
        engine.run_all(false).await.unwrap();

        assert!(engine.toggle_frozen("Econ").unwrap());
        engine.reset_outputs().unwrap();

        let snapshot = engine.snapshot();
        let econ = snapshot.group("Econ").unwrap();
        assert_eq!(econ.status, UnitStatus::Completed);
        assert_eq!(econ.outputs, vec![Output::new("gdp", 2.0)]);
        assert_eq!(snapshot.status_of("Fin"), Some(UnitStatus::Idle));
        assert!(snapshot.group("Fin").unwrap().outputs.is_empty());

        assert!(!engine.toggle_frozen("Econ").unwrap());
        engine.reset_outputs().unwrap();

        let econ = engine.snapshot().group("Econ").unwrap().clone();
        assert_eq!(econ.status, UnitStatus::Idle);
        assert!(econ.outputs.is_empty());
        assert_eq!(econ.progress, 0);
    }

    #[tokio::test]
    async fn test_iteration_keeps_run_id_and_frozen() {
        let engine = engine(chain());
        engine.run_all(false).await.unwrap();
        let run_id = engine.get_run_id().unwrap();

        engine.toggle_frozen("Econ").unwrap();
        engine.transition_to_adjustments_phase().unwrap();
        engine.finalize_run().unwrap();

        // Finalized results are locked
        assert!(engine.run_all(false).await.is_err());
        assert!(engine.toggle_breakpoint("Fin").is_err());
        assert_eq!(engine.get_run_state().phase, RunPhase::Finalized);

        assert_eq!(engine.increment_iteration_count().unwrap(), 2);
        let outcome = engine.run_all(false).await.unwrap();

        assert_eq!(outcome.run_id, run_id);
        assert_eq!(outcome.iteration, 2);
        assert_eq!(outcome.sequence, vec!["Fin", "Risk"]);
        assert!(outcome.is_complete());

        let state = engine.get_run_state();
        assert_eq!(state.frozen_ids, vec!["Econ"]);
        assert_eq!(state.iteration_count, 2);
        assert_eq!(engine.snapshot().status_of("Econ"), Some(UnitStatus::Completed));

        // A plain run starts a new run id
        let fresh = engine.run_all(false).await.unwrap();
        assert_ne!(fresh.run_id, run_id);
        assert_eq!(fresh.iteration, 1);
    }

    #[tokio::test]
    async fn test_disable_non_optional_rejected() {
        let engine = engine(chain());
        let before = engine.snapshot();

        let err = engine.toggle_model_enabled("Econ").unwrap_err();
        assert!(matches!(err, EngineError::InvalidStateTransition { .. }));
        assert_eq!(engine.snapshot().groups, before.groups);

        assert!(!engine.toggle_model_enabled("Risk").unwrap());
        assert_eq!(engine.get_execution_sequence(), vec!["Econ", "Fin"]);

        let outcome = engine.run_all(false).await.unwrap();
        assert_eq!(outcome.sequence, vec!["Econ", "Fin"]);
        assert_eq!(engine.snapshot().status_of("Risk"), Some(UnitStatus::Disabled));
        assert!(outcome.is_complete());
    }

    #[tokio::test]
    async fn test_disabled_module_passes_through() {
        let workflow = Workflow::new(
            "modules",
            vec![ModelGroup::new("Econ")
                .with_module(Module::new("gdp").optional().with_work(work(2, Vec::new())))
                .with_module(
                    Module::new("cpi")
                        .with_dependencies(["gdp"])
                        .with_work(work(2, vec![Output::new("cpi", 1.0)])),
                )],
        );
        let engine = engine(workflow);

        assert!(!engine.toggle_module_enabled("Econ", "gdp").unwrap());
        assert!(engine.toggle_module_enabled("Econ", "cpi").is_err());

        engine.run_all(false).await.unwrap();
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.status_of("gdp"), Some(UnitStatus::Disabled));
        assert_eq!(snapshot.status_of("cpi"), Some(UnitStatus::Completed));
        assert_eq!(snapshot.status_of("Econ"), Some(UnitStatus::Completed));
    }

    #[tokio::test]
    async fn test_skip_rule_excludes_target() {
        let workflow = chain().with_rules(vec![ConditionalRule {
            target_id: "Risk".to_string(),
            source_id: "Econ".to_string(),
            output_field: "gdp".to_string(),
            operator: ComparisonOperator::Gt,
            value: 1.0.into(),
            action: RuleAction::Skip,
        }]);
        let (engine, mut rx) = engine_with_events(workflow);

        let outcome = engine.run_all(false).await.unwrap();

        assert_eq!(outcome.sequence, vec!["Econ", "Fin"]);
        assert_eq!(outcome.skipped, vec!["Risk"]);
        assert!(outcome.blocked.is_empty());
        assert!(outcome.is_complete());
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, ExecutionEvent::GroupSkipped { group_id, .. } if group_id == "Risk")));
    }

    #[tokio::test]
    async fn test_run_rule_overrides_failed_dependency() {
        let mut workflow = chain().with_rules(vec![ConditionalRule {
            target_id: "Risk".to_string(),
            source_id: "Econ".to_string(),
            output_field: "gdp".to_string(),
            operator: ComparisonOperator::Ge,
            value: 2.0.into(),
            action: RuleAction::Run,
        }]);
        workflow.groups[1] = group("Fin", &["Econ"], "spread", failing());
        let engine = engine(workflow);

        let outcome = engine.run_all(false).await.unwrap();

        assert_eq!(outcome.failed, vec!["Fin"]);
        assert_eq!(engine.snapshot().status_of("Risk"), Some(UnitStatus::Completed));
        assert!(outcome.blocked.is_empty());
    }

    #[tokio::test]
    async fn test_skipped_group_releases_module_dependents() {
        let workflow = Workflow::new(
            "skip",
            vec![
                group("S", &[], "s1", work(2, vec![Output::new("x", 1.0)])),
                group("U", &["S"], "u1", work(2, Vec::new())),
                ModelGroup::new("D").with_dependencies(["U"]).with_module(
                    Module::new("d1")
                        .with_dependencies(["u1"])
                        .with_work(work(2, Vec::new())),
                ),
            ],
        )
        .with_rules(vec![ConditionalRule {
            target_id: "U".to_string(),
            source_id: "S".to_string(),
            output_field: "x".to_string(),
            operator: ComparisonOperator::Gt,
            value: 0.0.into(),
            action: RuleAction::Skip,
        }]);
        let engine = engine(workflow);

        let outcome = engine.run_all(false).await.unwrap();

        assert_eq!(outcome.sequence, vec!["S", "D"]);
        assert_eq!(outcome.skipped, vec!["U"]);
        assert!(outcome.failed.is_empty());
        assert!(outcome.blocked.is_empty());
        assert!(outcome.is_complete());

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.status_of("D"), Some(UnitStatus::Completed));
        assert_eq!(snapshot.status_of("d1"), Some(UnitStatus::Completed));
        assert_eq!(snapshot.status_of("u1"), Some(UnitStatus::Idle));
        assert!(snapshot.group("D").unwrap().error.is_none());
    }

    #[tokio::test]
    async fn test_module_waiting_on_failed_upstream_keeps_group_idle() {
        // U is forced past the failed S, but d1 still needs s1
        let workflow = Workflow::new(
            "held",
            vec![
                group("C", &[], "c1", work(2, vec![Output::new("x", 1.0)])),
                group("S", &[], "s1", failing()),
                group("U", &["S"], "u1", work(2, Vec::new())),
                ModelGroup::new("D").with_dependencies(["U"]).with_module(
                    Module::new("d1")
                        .with_dependencies(["s1"])
                        .with_work(work(2, Vec::new())),
                ),
            ],
        )
        .with_rules(vec![ConditionalRule {
            target_id: "U".to_string(),
            source_id: "C".to_string(),
            output_field: "x".to_string(),
            operator: ComparisonOperator::Gt,
            value: 0.0.into(),
            action: RuleAction::Run,
        }]);
        let engine = engine(workflow);

        let outcome = engine.run_all(false).await.unwrap();

        assert_eq!(outcome.sequence, vec!["C", "S", "U"]);
        assert_eq!(outcome.failed, vec!["S"]);
        assert_eq!(outcome.blocked, vec!["D"]);
        assert_eq!(outcome.phase, RunPhase::Running);

        let snapshot = engine.snapshot();
        let d = snapshot.group("D").unwrap();
        assert_eq!(d.status, UnitStatus::Idle);
        assert!(d.error.is_none());
        assert_eq!(snapshot.status_of("d1"), Some(UnitStatus::Idle));

        let report = engine.debug_model_dependency_status("D").unwrap();
        assert!(!report.ready);
        assert!(report.dependency_status.iter().all(|d| d.satisfied));
        assert_eq!(report.waiting_modules, vec!["s1"]);

        match engine.run_model("D").await.unwrap_err() {
            EngineError::DependencyUnsatisfied { id, pending } => {
                assert_eq!(id, "d1");
                assert_eq!(pending, vec!["s1"]);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_pause_before_run_holds_pass() {
        let engine = engine(chain());
        engine.pause_execution();

        let runner = engine.clone();
        let handle = tokio::spawn(async move { runner.run_all(false).await });

        wait_for(&engine, |s| s.run.phase == RunPhase::Running).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        let snapshot = engine.snapshot();
        assert!(snapshot.run.paused);
        assert_eq!(
            snapshot.groups_with_status(UnitStatus::Idle),
            vec!["Econ", "Fin", "Risk"]
        );

        engine.resume_execution();
        let outcome = handle.await.unwrap().unwrap();
        assert!(outcome.is_complete());
        assert_eq!(outcome.completed.len(), 3);
    }

    #[tokio::test]
    async fn test_snapshot_stream_follows_run() {
        use tokio_stream::StreamExt;

        let engine = engine(chain());
        let mut stream = engine.snapshot_stream();
        assert_eq!(stream.next().await.unwrap().run.phase, RunPhase::Idle);

        let runner = engine.clone();
        let handle = tokio::spawn(async move { runner.run_all(false).await });

        let done = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(snapshot) = stream.next().await {
                if snapshot.run.phase == RunPhase::MainComplete {
                    return snapshot;
                }
            }
            panic!("snapshot stream ended");
        })
        .await
        .expect("timed out waiting for main pass");

        assert_eq!(done.status_of("Risk"), Some(UnitStatus::Completed));
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_toggle_breakpoint_on_module() {
        let engine = engine(chain());

        assert!(engine.toggle_breakpoint("gdp").unwrap());
        let runner = engine.clone();
        let handle = tokio::spawn(async move { runner.run_all(false).await });

        let snapshot = wait_for(&engine, |s| s.run.paused).await;
        assert_eq!(snapshot.run.paused_on_id.as_deref(), Some("gdp"));
        assert_eq!(snapshot.status_of("Fin"), Some(UnitStatus::Idle));

        engine.resume_execution();
        assert!(handle.await.unwrap().unwrap().is_complete());
        assert!(matches!(
            engine.toggle_breakpoint("missing"),
            Err(EngineError::UnknownEntity(_))
        ));
    }

    #[tokio::test]
    async fn test_phase_events_in_order() {
        let (engine, mut rx) = engine_with_events(chain());
        engine.run_all(false).await.unwrap();
        engine.transition_to_adjustments_phase().unwrap();

        let phases: Vec<RunPhase> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                ExecutionEvent::PhaseChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(
            phases,
            vec![
                RunPhase::Initiated,
                RunPhase::Running,
                RunPhase::MainComplete,
                RunPhase::Adjustments
            ]
        );
    }
}
