// Run State Persistence
// JSON document of the run and entity state, plus a file-backed store

use crate::error::{EngineError, EngineResult};
use crate::execution::lifecycle::{RunPhase, RunState};
use crate::execution::table::{EngineSnapshot, StatusTable};
use crate::workflow::models::{ModelGroup, Module, Output, UnitStatus};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Persisted state of one module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedModule {
    pub id: String,
    pub status: UnitStatus,
    pub enabled: bool,
    pub breakpoint: bool,
    pub frozen: bool,
    #[serde(default)]
    pub progress: u8,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub outputs: Vec<Output>,
}

/// Persisted state of one group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedGroup {
    pub id: String,
    pub status: UnitStatus,
    pub enabled: bool,
    pub breakpoint: bool,
    pub frozen: bool,
    #[serde(default)]
    pub progress: u8,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub outputs: Vec<Output>,
    #[serde(default)]
    pub modules: Vec<PersistedModule>,
}

/// The run-state document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub run_id: Option<String>,
    pub phase: RunPhase,
    pub iteration_count: u32,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub frozen_ids: Vec<String>,
    #[serde(default)]
    pub groups: Vec<PersistedGroup>,
}

impl From<&Module> for PersistedModule {
    fn from(module: &Module) -> Self {
        Self {
            id: module.id.clone(),
            status: module.status,
            enabled: module.enabled,
            breakpoint: module.breakpoint,
            frozen: module.frozen,
            progress: module.progress,
            start_time: module.start_time,
            end_time: module.end_time,
            outputs: module.outputs.clone(),
        }
    }
}

impl From<&ModelGroup> for PersistedGroup {
    fn from(group: &ModelGroup) -> Self {
        Self {
            id: group.id.clone(),
            status: group.status,
            enabled: group.enabled,
            breakpoint: group.breakpoint,
            frozen: group.frozen,
            progress: group.progress,
            start_time: group.start_time,
            end_time: group.end_time,
            outputs: group.outputs.clone(),
            modules: group.modules.iter().map(PersistedModule::from).collect(),
        }
    }
}

impl From<&EngineSnapshot> for PersistedState {
    fn from(snapshot: &EngineSnapshot) -> Self {
        let run = &snapshot.run;
        Self {
            run_id: run.run_id.clone(),
            phase: run.phase,
            iteration_count: run.iteration_count,
            start_time: run.start_time,
            end_time: run.end_time,
            frozen_ids: run.frozen_ids.clone(),
            groups: snapshot.groups.iter().map(PersistedGroup::from).collect(),
        }
    }
}

/// Fields shared by groups and modules when restoring
struct Restored<'a> {
    id: &'a str,
    status: UnitStatus,
    enabled: bool,
    breakpoint: bool,
    progress: u8,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    outputs: &'a [Output],
}

#[allow(clippy::too_many_arguments)]
fn restore_unit(
    saved: Restored<'_>,
    optional: bool,
    enabled: &mut bool,
    breakpoint: &mut bool,
    status: &mut UnitStatus,
    progress: &mut u8,
    start_time: &mut Option<DateTime<Utc>>,
    end_time: &mut Option<DateTime<Utc>>,
    outputs: &mut Vec<Output>,
) {
    *enabled = if !saved.enabled && !optional {
        warn!(id = saved.id, "ignoring persisted disable of a non-optional unit");
        true
    } else {
        saved.enabled
    };
    *breakpoint = saved.breakpoint;
    *start_time = saved.start_time;
    *end_time = saved.end_time;
    *outputs = saved.outputs.to_vec();
    *progress = saved.progress.min(100);

    // Work in flight when the state was written did not finish
    *status = match (saved.status, *enabled) {
        (_, false) => UnitStatus::Disabled,
        (UnitStatus::Running | UnitStatus::Disabled, true) => {
            *progress = 0;
            UnitStatus::Idle
        }
        (status, true) => status,
    };
}

impl PersistedState {
    /// Overlay this document onto the configured entities
    ///
    /// Ids that no longer exist in the workflow are skipped with a warning.
    pub(crate) fn apply_to(&self, table: &mut StatusTable) {
        table.lifecycle.restore(&RunState {
            run_id: self.run_id.clone(),
            phase: self.phase,
            paused: false,
            paused_on_id: None,
            start_time: self.start_time,
            end_time: self.end_time,
            iteration_count: self.iteration_count,
            frozen_ids: self.frozen_ids.clone(),
        });

        for saved in &self.groups {
            let Some(group) = table.group_mut(&saved.id) else {
                warn!(group = %saved.id, "persisted group not in workflow, skipping");
                continue;
            };
            restore_unit(
                Restored {
                    id: &saved.id,
                    status: saved.status,
                    enabled: saved.enabled,
                    breakpoint: saved.breakpoint,
                    progress: saved.progress,
                    start_time: saved.start_time,
                    end_time: saved.end_time,
                    outputs: &saved.outputs,
                },
                group.optional,
                &mut group.enabled,
                &mut group.breakpoint,
                &mut group.status,
                &mut group.progress,
                &mut group.start_time,
                &mut group.end_time,
                &mut group.outputs,
            );

            for saved_module in &saved.modules {
                let Some(module) = group.modules.iter_mut().find(|m| m.id == saved_module.id) else {
                    warn!(
                        group = %saved.id,
                        module = %saved_module.id,
                        "persisted module not in group, skipping"
                    );
                    continue;
                };
                restore_unit(
                    Restored {
                        id: &saved_module.id,
                        status: saved_module.status,
                        enabled: saved_module.enabled,
                        breakpoint: saved_module.breakpoint,
                        progress: saved_module.progress,
                        start_time: saved_module.start_time,
                        end_time: saved_module.end_time,
                        outputs: &saved_module.outputs,
                    },
                    module.optional,
                    &mut module.enabled,
                    &mut module.breakpoint,
                    &mut module.status,
                    &mut module.progress,
                    &mut module.start_time,
                    &mut module.end_time,
                    &mut module.outputs,
                );
            }
        }

        // frozenIds is authoritative; entity flags are kept in sync with it
        let frozen: Vec<(String, bool)> = table
            .groups()
            .iter()
            .flat_map(|g| {
                std::iter::once(g.id.clone()).chain(g.modules.iter().map(|m| m.id.clone()))
            })
            .map(|id| {
                let is_frozen = self.frozen_ids.contains(&id)
                    || self.groups.iter().any(|g| {
                        (g.id == id && g.frozen) || g.modules.iter().any(|m| m.id == id && m.frozen)
                    });
                (id, is_frozen)
            })
            .collect();
        for (id, is_frozen) in frozen {
            table.set_frozen(&id, is_frozen);
        }
        for unknown in self.frozen_ids.iter().filter(|id| table.locate(id).is_none()) {
            warn!(id = %unknown, "persisted frozen id not in workflow, skipping");
        }
    }
}

/// File-backed storage for [`PersistedState`]
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store under the platform data directory (`<data_dir>/cascade/run-state.json`)
    pub fn default_location() -> Self {
        let base = dirs::data_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(base.join("cascade").join("run-state.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, state: &PersistedState) -> EngineResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Store(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| EngineError::Store(format!("failed to serialize run state: {}", e)))?;
        fs::write(&self.path, json).map_err(|e| {
            EngineError::Store(format!("failed to write {}: {}", self.path.display(), e))
        })?;

        debug!(path = %self.path.display(), "run state saved");
        Ok(())
    }

    /// Load the stored document; `None` when nothing has been saved yet
    pub fn load(&self) -> EngineResult<Option<PersistedState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&self.path).map_err(|e| {
            EngineError::Store(format!("failed to read {}: {}", self.path.display(), e))
        })?;
        let state = serde_json::from_str(&json).map_err(|e| {
            EngineError::Store(format!("invalid run state in {}: {}", self.path.display(), e))
        })?;

        debug!(path = %self.path.display(), "run state loaded");
        Ok(Some(state))
    }
}
