// Run Lifecycle
// Run identity, timestamps, iteration count and phase transitions

use crate::error::{EngineError, EngineResult};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Phase of the current run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunPhase {
    #[default]
    Idle,
    Initiated,
    Running,
    MainComplete,
    Adjustments,
    Finalized,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunPhase::Idle => "IDLE",
            RunPhase::Initiated => "INITIATED",
            RunPhase::Running => "RUNNING",
            RunPhase::MainComplete => "MAIN_COMPLETE",
            RunPhase::Adjustments => "ADJUSTMENTS",
            RunPhase::Finalized => "FINALIZED",
        };
        f.write_str(s)
    }
}

/// Immutable view of the run, as handed to readers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub run_id: Option<String>,
    pub phase: RunPhase,
    pub paused: bool,
    pub paused_on_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub iteration_count: u32,
    pub frozen_ids: Vec<String>,
}

/// How a new pass relates to the previous one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassStart {
    pub run_id: String,
    pub iteration: u32,
    /// The pass continues an existing run (iteration) rather than starting a new one
    pub continued: bool,
}

/// Run-level state machine
///
/// `IDLE -> INITIATED -> RUNNING -> MAIN_COMPLETE -> ADJUSTMENTS -> FINALIZED`,
/// with `paused` tracked alongside the phase. Rejected transitions leave the
/// state untouched.
#[derive(Debug, Clone, Default)]
pub struct RunLifecycle {
    run_id: Option<String>,
    phase: RunPhase,
    paused: bool,
    paused_on_id: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    iteration_count: u32,
    iteration_pending: bool,
}

impl RunLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    pub fn iteration_count(&self) -> u32 {
        self.iteration_count
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn paused_on_id(&self) -> Option<&str> {
        self.paused_on_id.as_deref()
    }

    /// Results are locked once finalized, until the next iteration starts
    pub fn is_locked(&self) -> bool {
        self.phase == RunPhase::Finalized && !self.iteration_pending
    }

    pub fn iteration_pending(&self) -> bool {
        self.iteration_pending
    }

    /// Snapshot of the run, with the frozen ids supplied by the caller
    pub fn state(&self, frozen_ids: Vec<String>) -> RunState {
        RunState {
            run_id: self.run_id.clone(),
            phase: self.phase,
            paused: self.paused,
            paused_on_id: self.paused_on_id.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            iteration_count: self.iteration_count,
            frozen_ids,
        }
    }

    /// Enter `INITIATED` for a new pass
    ///
    /// A pending iteration keeps the run id; otherwise a fresh run id is
    /// issued and the iteration count restarts at 1. A global pause stays
    /// in effect.
    pub fn begin_pass(&mut self, now: DateTime<Utc>) -> EngineResult<PassStart> {
        match self.phase {
            RunPhase::Initiated => {
                return Err(EngineError::invalid_transition(
                    "start a pass",
                    self.phase,
                    "a pass is already being initiated",
                ))
            }
            RunPhase::Finalized if !self.iteration_pending => {
                return Err(EngineError::invalid_transition(
                    "start a pass",
                    self.phase,
                    "results are finalized; increment the iteration count first",
                ))
            }
            _ => {}
        }

        let continued = self.iteration_pending && self.run_id.is_some();
        let run_id = match (&self.run_id, continued) {
            (Some(id), true) => id.clone(),
            _ => {
                self.iteration_count = 1;
                Uuid::new_v4().to_string()
            }
        };

        self.run_id = Some(run_id.clone());
        self.phase = RunPhase::Initiated;
        self.iteration_pending = false;
        // A global pause holds the new pass; a breakpoint belongs to the old one
        if self.paused_on_id.take().is_some() {
            self.paused = false;
        }
        self.start_time = Some(now);
        self.end_time = None;

        Ok(PassStart {
            run_id,
            iteration: self.iteration_count,
            continued,
        })
    }

    /// `INITIATED -> RUNNING`
    pub fn mark_running(&mut self) -> EngineResult<()> {
        if self.phase != RunPhase::Initiated {
            return Err(EngineError::invalid_transition(
                "mark running",
                self.phase,
                "only an initiated pass can start running",
            ));
        }
        self.phase = RunPhase::Running;
        Ok(())
    }

    /// `RUNNING -> MAIN_COMPLETE`
    pub fn complete_main(&mut self, now: DateTime<Utc>) -> EngineResult<()> {
        if self.phase != RunPhase::Running {
            return Err(EngineError::invalid_transition(
                "complete the main pass",
                self.phase,
                "no pass is running",
            ));
        }
        self.phase = RunPhase::MainComplete;
        self.end_time = Some(now);
        self.paused = false;
        self.paused_on_id = None;
        Ok(())
    }

    /// `MAIN_COMPLETE -> ADJUSTMENTS`
    pub fn transition_to_adjustments(&mut self) -> EngineResult<()> {
        if self.phase != RunPhase::MainComplete {
            return Err(EngineError::invalid_transition(
                "enter adjustments",
                self.phase,
                "adjustments follow a completed main pass",
            ));
        }
        self.phase = RunPhase::Adjustments;
        Ok(())
    }

    /// `MAIN_COMPLETE | ADJUSTMENTS -> FINALIZED`
    pub fn finalize(&mut self) -> EngineResult<()> {
        if !matches!(self.phase, RunPhase::MainComplete | RunPhase::Adjustments) {
            return Err(EngineError::invalid_transition(
                "finalize run",
                self.phase,
                "only a completed or adjusted run can be finalized",
            ));
        }
        self.phase = RunPhase::Finalized;
        Ok(())
    }

    /// Count a new iteration; the next pass reuses the run id
    pub fn increment_iteration(&mut self) -> EngineResult<u32> {
        if !matches!(
            self.phase,
            RunPhase::MainComplete | RunPhase::Adjustments | RunPhase::Finalized
        ) {
            return Err(EngineError::invalid_transition(
                "increment iteration",
                self.phase,
                "iterations start after the main pass completes",
            ));
        }
        if self.iteration_pending {
            return Err(EngineError::invalid_transition(
                "increment iteration",
                self.phase,
                "an iteration is already pending",
            ));
        }
        self.iteration_count += 1;
        self.iteration_pending = true;
        Ok(self.iteration_count)
    }

    pub fn set_paused(&mut self, paused: bool, on: Option<String>) {
        self.paused = paused;
        self.paused_on_id = if paused { on } else { None };
    }

    /// Elapsed time of the current pass; still counting while running
    pub fn duration(&self, now: DateTime<Utc>) -> Option<Duration> {
        let start = self.start_time?;
        let end = self.end_time.unwrap_or(now);
        (end - start).to_std().ok()
    }

    /// Rebuild from persisted state; an interrupted pass comes back as
    /// `RUNNING` (stalled) and never paused
    pub fn restore(&mut self, state: &RunState) {
        self.run_id = state.run_id.clone();
        self.phase = match state.phase {
            RunPhase::Initiated => RunPhase::Running,
            phase => phase,
        };
        self.paused = false;
        self.paused_on_id = None;
        self.start_time = state.start_time;
        self.end_time = state.end_time;
        self.iteration_count = state.iteration_count;
        self.iteration_pending = false;
    }
}
