// Status Table
// Single owner of entity state: statuses, outputs, flags and the run lifecycle

use crate::execution::conditions::{evaluate_rules, ConditionalRule, RuleVerdicts};
use crate::execution::freeze::FreezeRegistry;
use crate::execution::lifecycle::{RunLifecycle, RunState};
use crate::execution::scheduler::{StatusMap, UnitState};
use crate::workflow::models::{ModelGroup, Module, Output, UnitStatus};

use serde::Serialize;
use std::collections::HashMap;

/// Location of an entity inside the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntityRef {
    Group(usize),
    Module(usize, usize),
}

/// Consistent point-in-time copy of the engine state
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub run: RunState,
    pub groups: Vec<ModelGroup>,
}

impl EngineSnapshot {
    pub fn group(&self, id: &str) -> Option<&ModelGroup> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn module(&self, id: &str) -> Option<&Module> {
        self.groups.iter().find_map(|g| g.module(id))
    }

    /// Status of a group or module
    pub fn status_of(&self, id: &str) -> Option<UnitStatus> {
        self.group(id)
            .map(|g| g.status)
            .or_else(|| self.module(id).map(|m| m.status))
    }

    pub fn groups_with_status(&self, status: UnitStatus) -> Vec<&str> {
        self.groups
            .iter()
            .filter(|g| g.status == status)
            .map(|g| g.id.as_str())
            .collect()
    }
}

/// Mutable engine state, kept behind the engine's lock
#[derive(Debug, Clone)]
pub(crate) struct StatusTable {
    groups: Vec<ModelGroup>,
    index: HashMap<String, EntityRef>,
    freeze: FreezeRegistry,
    pub(crate) lifecycle: RunLifecycle,
}

impl StatusTable {
    pub fn new(mut groups: Vec<ModelGroup>) -> Self {
        let mut index = HashMap::new();
        let mut freeze = FreezeRegistry::new();

        for (gi, group) in groups.iter_mut().enumerate() {
            index.insert(group.id.clone(), EntityRef::Group(gi));
            if group.frozen {
                freeze.set_frozen(&group.id, true);
            }
            if !group.enabled {
                group.status = UnitStatus::Disabled;
            }
            for (mi, module) in group.modules.iter_mut().enumerate() {
                index.insert(module.id.clone(), EntityRef::Module(gi, mi));
                if module.frozen {
                    freeze.set_frozen(&module.id, true);
                }
                if !module.enabled {
                    module.status = UnitStatus::Disabled;
                }
            }
        }

        Self {
            groups,
            index,
            freeze,
            lifecycle: RunLifecycle::new(),
        }
    }

    pub fn locate(&self, id: &str) -> Option<EntityRef> {
        self.index.get(id).copied()
    }

    pub fn groups(&self) -> &[ModelGroup] {
        &self.groups
    }

    pub fn group(&self, id: &str) -> Option<&ModelGroup> {
        match self.locate(id)? {
            EntityRef::Group(gi) => Some(&self.groups[gi]),
            EntityRef::Module(..) => None,
        }
    }

    pub fn group_mut(&mut self, id: &str) -> Option<&mut ModelGroup> {
        match self.locate(id)? {
            EntityRef::Group(gi) => Some(&mut self.groups[gi]),
            EntityRef::Module(..) => None,
        }
    }

    /// Module and the id of the group that owns it
    pub fn module(&self, id: &str) -> Option<(&str, &Module)> {
        match self.locate(id)? {
            EntityRef::Module(gi, mi) => {
                let group = &self.groups[gi];
                Some((group.id.as_str(), &group.modules[mi]))
            }
            EntityRef::Group(_) => None,
        }
    }

    pub fn module_mut(&mut self, id: &str) -> Option<&mut Module> {
        match self.locate(id)? {
            EntityRef::Module(gi, mi) => Some(&mut self.groups[gi].modules[mi]),
            EntityRef::Group(_) => None,
        }
    }

    pub fn freeze(&self) -> &FreezeRegistry {
        &self.freeze
    }

    /// Set the frozen flag on the registry and the entity together
    pub fn set_frozen(&mut self, id: &str, frozen: bool) {
        self.freeze.set_frozen(id, frozen);
        self.mirror_frozen(id, frozen);
    }

    /// Flip the frozen flag in the registry and mirror it onto the entity
    pub fn toggle_frozen(&mut self, id: &str) -> bool {
        let frozen = self.freeze.toggle_frozen(id);
        self.mirror_frozen(id, frozen);
        frozen
    }

    fn mirror_frozen(&mut self, id: &str, frozen: bool) {
        match self.locate(id) {
            Some(EntityRef::Group(gi)) => self.groups[gi].frozen = frozen,
            Some(EntityRef::Module(gi, mi)) => self.groups[gi].modules[mi].frozen = frozen,
            None => {}
        }
    }

    pub fn group_states(&self) -> StatusMap {
        self.groups
            .iter()
            .map(|g| {
                let frozen = self.freeze.is_frozen(&g.id);
                (g.id.clone(), UnitState::new(g.status, g.enabled, frozen))
            })
            .collect()
    }

    /// States of every module, so cross-group dependencies resolve too
    ///
    /// Modules inherit the frozen and disabled flags of their group.
    pub fn module_states(&self) -> StatusMap {
        self.groups
            .iter()
            .flat_map(|g| {
                let group_frozen = self.freeze.is_frozen(&g.id);
                g.modules.iter().map(move |m| {
                    let frozen = group_frozen || self.freeze.is_frozen(&m.id);
                    let state = UnitState::new(m.status, m.enabled && g.enabled, frozen);
                    (m.id.clone(), state)
                })
            })
            .collect()
    }

    /// Outputs a rule may read: completed groups, or frozen groups that kept
    /// their outputs
    pub fn rule_outputs(&self, id: &str) -> Option<&[Output]> {
        let group = self.group(id)?;
        let frozen = self.freeze.is_frozen(id) && !group.outputs.is_empty();
        if group.status == UnitStatus::Completed || frozen {
            Some(group.outputs.as_slice())
        } else {
            None
        }
    }

    pub fn verdicts(&self, rules: &[ConditionalRule]) -> RuleVerdicts {
        evaluate_rules(rules, |id| self.rule_outputs(id))
    }

    /// Outputs of a completed or frozen group or module
    pub fn available_outputs(&self, id: &str) -> Option<Vec<Output>> {
        let (status, outputs) = match self.locate(id)? {
            EntityRef::Group(gi) => (self.groups[gi].status, &self.groups[gi].outputs),
            EntityRef::Module(gi, mi) => {
                let module = &self.groups[gi].modules[mi];
                (module.status, &module.outputs)
            }
        };
        if status == UnitStatus::Completed || self.freeze.is_frozen(id) {
            Some(outputs.clone())
        } else {
            None
        }
    }

    /// Clear results of every unfrozen entity; disabled entities stay disabled
    pub fn reset_unfrozen(&mut self) -> usize {
        let ids: Vec<String> = self.groups.iter().map(|g| g.id.clone()).collect();
        ids.iter().map(|id| self.reset_group(id)).sum()
    }

    /// Clear one group and its unfrozen modules; frozen entities are untouched
    pub fn reset_group(&mut self, id: &str) -> usize {
        let Some(EntityRef::Group(gi)) = self.locate(id) else {
            return 0;
        };

        let mut reset = 0;
        let group_frozen = self.freeze.is_frozen(id);
        let frozen_modules: Vec<bool> = self.groups[gi]
            .modules
            .iter()
            .map(|m| self.freeze.is_frozen(&m.id))
            .collect();

        let group = &mut self.groups[gi];
        if !group_frozen {
            clear_results(
                &mut group.status,
                group.enabled,
                &mut group.progress,
                &mut group.outputs,
                &mut group.error,
            );
            group.start_time = None;
            group.end_time = None;
            reset += 1;

            for (module, frozen) in group.modules.iter_mut().zip(frozen_modules) {
                if frozen {
                    continue;
                }
                clear_results(
                    &mut module.status,
                    module.enabled,
                    &mut module.progress,
                    &mut module.outputs,
                    &mut module.error,
                );
                module.start_time = None;
                module.end_time = None;
                reset += 1;
            }
        }
        reset
    }

    /// Clear a single unfrozen module
    pub fn reset_module(&mut self, id: &str) {
        if self.freeze.is_frozen(id) {
            return;
        }
        if let Some(module) = self.module_mut(id) {
            clear_results(
                &mut module.status,
                module.enabled,
                &mut module.progress,
                &mut module.outputs,
                &mut module.error,
            );
            module.start_time = None;
            module.end_time = None;
        }
    }

    /// Recompute a group's progress from its modules
    pub fn refresh_group_progress(&mut self, group_id: &str) {
        let frozen: Vec<bool> = match self.group(group_id) {
            Some(group) => group
                .modules
                .iter()
                .map(|m| self.freeze.is_frozen(&m.id))
                .collect(),
            None => return,
        };
        let Some(group) = self.group_mut(group_id) else {
            return;
        };

        let counted: Vec<u32> = group
            .modules
            .iter()
            .zip(frozen)
            .filter(|(m, _)| m.enabled)
            .map(|(m, frozen)| if frozen { 100 } else { u32::from(m.progress) })
            .collect();
        if counted.is_empty() {
            return;
        }
        let total: u32 = counted.iter().sum();
        group.progress = (total / counted.len() as u32) as u8;
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            run: self.run_state(),
            groups: self.groups.clone(),
        }
    }

    pub fn run_state(&self) -> RunState {
        self.lifecycle.state(self.freeze.frozen_ids())
    }
}

fn clear_results(
    status: &mut UnitStatus,
    enabled: bool,
    progress: &mut u8,
    outputs: &mut Vec<Output>,
    error: &mut Option<String>,
) {
    *status = if enabled {
        UnitStatus::Idle
    } else {
        UnitStatus::Disabled
    };
    *progress = 0;
    outputs.clear();
    *error = None;
}
