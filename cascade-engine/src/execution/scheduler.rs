// Scheduler
// Computes which units may start given the graph, rule verdicts and current statuses

use crate::execution::conditions::RuleVerdicts;
use crate::execution::graph::DependencyGraph;
use crate::workflow::models::UnitStatus;

use std::collections::HashMap;

/// Scheduling-relevant view of one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitState {
    pub status: UnitStatus,
    pub enabled: bool,
    pub frozen: bool,
}

impl UnitState {
    pub fn new(status: UnitStatus, enabled: bool, frozen: bool) -> Self {
        Self {
            status,
            enabled,
            frozen,
        }
    }

    /// Whether dependents may treat this unit as done
    ///
    /// Frozen units keep their previous results and disabled units are
    /// passed through.
    pub fn satisfies_dependents(&self) -> bool {
        self.frozen || !self.enabled || self.status == UnitStatus::Completed
    }
}

/// Unit states keyed by id; may also hold units outside the graph
/// (cross-group module dependencies)
pub type StatusMap = HashMap<String, UnitState>;

/// Ready-set computation over one dependency graph
#[derive(Debug, Clone, Copy)]
pub struct Scheduler<'g> {
    graph: &'g DependencyGraph,
    held: &'g [String],
}

impl<'g> Scheduler<'g> {
    pub fn new(graph: &'g DependencyGraph) -> Self {
        Self { graph, held: &[] }
    }

    /// Keep `held` units out of the ready set; idle held units still count
    /// as blocked
    pub fn holding(self, held: &'g [String]) -> Self {
        Self { held, ..self }
    }

    fn dependency_satisfied(&self, dep: &str, states: &StatusMap, verdicts: &RuleVerdicts) -> bool {
        verdicts.is_skipped(dep)
            || states
                .get(dep)
                .map(UnitState::satisfies_dependents)
                .unwrap_or(false)
    }

    /// Static and external dependencies of `id` that are not yet satisfied
    pub fn pending_dependencies(
        &self,
        id: &str,
        states: &StatusMap,
        verdicts: &RuleVerdicts,
    ) -> Vec<&'g str> {
        let Some(node) = self.graph.get(id) else {
            return Vec::new();
        };

        node.dependencies
            .iter()
            .chain(node.external.iter())
            .filter(|dep| !self.dependency_satisfied(dep, states, verdicts))
            .map(String::as_str)
            .collect()
    }

    /// A unit is ready when it is enabled, not frozen, idle, not held, not
    /// skipped by a rule, and either all its dependencies are satisfied or a
    /// `run` rule forces it
    pub fn is_ready(&self, id: &str, states: &StatusMap, verdicts: &RuleVerdicts) -> bool {
        let Some(state) = states.get(id) else {
            return false;
        };

        if !state.enabled || state.frozen || state.status != UnitStatus::Idle {
            return false;
        }
        if self.held.iter().any(|h| h == id) || verdicts.is_skipped(id) {
            return false;
        }
        if verdicts.is_forced(id) {
            return true;
        }

        self.pending_dependencies(id, states, verdicts).is_empty()
    }

    /// All ready units in topological order
    pub fn ready_set(&self, states: &StatusMap, verdicts: &RuleVerdicts) -> Vec<&'g str> {
        let mut ready: Vec<&'g str> = self
            .graph
            .nodes()
            .iter()
            .map(|n| n.id.as_str())
            .filter(|id| self.is_ready(id, states, verdicts))
            .collect();
        ready.sort_by_key(|id| self.graph.position(id));
        ready
    }

    /// Exactly one ready unit, first in topological order
    pub fn next_sequential(&self, states: &StatusMap, verdicts: &RuleVerdicts) -> Option<&'g str> {
        self.ready_set(states, verdicts).into_iter().next()
    }

    /// Ready units at the lowest dependency level present in the ready set
    pub fn next_parallel_batch(&self, states: &StatusMap, verdicts: &RuleVerdicts) -> Vec<&'g str> {
        let ready = self.ready_set(states, verdicts);
        if ready.is_empty() {
            return ready;
        }

        // Frozen units are satisfied up front, so they do not add depth
        let levels = self
            .graph
            .level_map(|id| states.get(id).is_some_and(|s| s.enabled && !s.frozen));
        let level_of = |id: &str| levels.get(id).copied().unwrap_or(0);
        let current = ready.iter().map(|id| level_of(*id)).min().unwrap_or(0);

        ready.into_iter().filter(|id| level_of(*id) == current).collect()
    }

    /// Enabled, unfrozen, unskipped units still idle
    pub fn blocked(&self, states: &StatusMap, verdicts: &RuleVerdicts) -> Vec<&'g str> {
        let mut blocked: Vec<&'g str> = self
            .graph
            .nodes()
            .iter()
            .map(|n| n.id.as_str())
            .filter(|id| {
                states.get(*id).is_some_and(|s| {
                    s.enabled && !s.frozen && s.status == UnitStatus::Idle
                }) && !verdicts.is_skipped(id)
            })
            .collect();
        blocked.sort_by_key(|id| self.graph.position(id));
        blocked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::conditions::RuleAction;
    use crate::execution::graph::NodeSpec;

    fn chain() -> DependencyGraph {
        DependencyGraph::build(vec![
            NodeSpec::new("Econ", Vec::<String>::new()),
            NodeSpec::new("Fin", ["Econ"]),
            NodeSpec::new("Risk", ["Fin"]),
        ])
        .unwrap()
    }

    fn states(entries: &[(&str, UnitStatus)]) -> StatusMap {
        entries
            .iter()
            .map(|(id, status)| (id.to_string(), UnitState::new(*status, true, false)))
            .collect()
    }

    #[test]
    fn test_ready_set_follows_completion() {
        let graph = chain();
        let scheduler = Scheduler::new(&graph);
        let verdicts = RuleVerdicts::default();

        let mut map = states(&[
            ("Econ", UnitStatus::Idle),
            ("Fin", UnitStatus::Idle),
            ("Risk", UnitStatus::Idle),
        ]);
        assert_eq!(scheduler.ready_set(&map, &verdicts), vec!["Econ"]);

        map.get_mut("Econ").unwrap().status = UnitStatus::Running;
        assert!(scheduler.ready_set(&map, &verdicts).is_empty());

        map.get_mut("Econ").unwrap().status = UnitStatus::Completed;
        assert_eq!(scheduler.next_sequential(&map, &verdicts), Some("Fin"));
    }

    #[test]
    fn test_held_unit_is_blocked_not_ready() {
        let graph = chain();
        let held = vec!["Fin".to_string()];
        let scheduler = Scheduler::new(&graph).holding(&held);
        let verdicts = RuleVerdicts::default();

        let map = states(&[
            ("Econ", UnitStatus::Completed),
            ("Fin", UnitStatus::Idle),
            ("Risk", UnitStatus::Idle),
        ]);
        assert!(scheduler.ready_set(&map, &verdicts).is_empty());
        assert_eq!(scheduler.blocked(&map, &verdicts), vec!["Fin", "Risk"]);
        assert!(scheduler.pending_dependencies("Fin", &map, &verdicts).is_empty());
    }

    #[test]
    fn test_failed_dependency_blocks_dependents() {
        let graph = chain();
        let scheduler = Scheduler::new(&graph);
        let verdicts = RuleVerdicts::default();
        let map = states(&[
            ("Econ", UnitStatus::Failed),
            ("Fin", UnitStatus::Idle),
            ("Risk", UnitStatus::Idle),
        ]);

        assert!(scheduler.ready_set(&map, &verdicts).is_empty());
        assert_eq!(scheduler.blocked(&map, &verdicts), vec!["Fin", "Risk"]);
        assert_eq!(scheduler.pending_dependencies("Fin", &map, &verdicts), vec!["Econ"]);
    }

    #[test]
    fn test_frozen_dependency_counts_as_satisfied() {
        let graph = chain();
        let scheduler = Scheduler::new(&graph);
        let verdicts = RuleVerdicts::default();
        let mut map = states(&[
            ("Econ", UnitStatus::Idle),
            ("Fin", UnitStatus::Idle),
            ("Risk", UnitStatus::Idle),
        ]);
        map.get_mut("Econ").unwrap().frozen = true;

        // Frozen units never run themselves
        assert_eq!(scheduler.ready_set(&map, &verdicts), vec!["Fin"]);
        assert!(!scheduler.blocked(&map, &verdicts).contains(&"Econ"));
    }

    #[test]
    fn test_disabled_dependency_passes_through() {
        let graph = chain();
        let scheduler = Scheduler::new(&graph);
        let verdicts = RuleVerdicts::default();
        let mut map = states(&[
            ("Econ", UnitStatus::Completed),
            ("Fin", UnitStatus::Disabled),
            ("Risk", UnitStatus::Idle),
        ]);
        map.get_mut("Fin").unwrap().enabled = false;

        assert_eq!(scheduler.ready_set(&map, &verdicts), vec!["Risk"]);
    }

    #[test]
    fn test_skip_beats_run_beats_static() {
        let graph = chain();
        let scheduler = Scheduler::new(&graph);
        let map = states(&[
            ("Econ", UnitStatus::Completed),
            ("Fin", UnitStatus::Idle),
            ("Risk", UnitStatus::Idle),
        ]);

        // run overrides the unmet static dependency on Fin
        let mut verdicts = RuleVerdicts::default();
        verdicts.record("Risk", RuleAction::Run);
        assert_eq!(scheduler.ready_set(&map, &verdicts), vec!["Fin", "Risk"]);

        // skip wins even when a run rule also fires
        verdicts.record("Risk", RuleAction::Skip);
        assert_eq!(scheduler.ready_set(&map, &verdicts), vec!["Fin"]);

        // skip also beats plain static readiness
        let mut verdicts = RuleVerdicts::default();
        verdicts.record("Fin", RuleAction::Skip);
        assert!(!scheduler.is_ready("Fin", &map, &verdicts));
        assert!(!scheduler.blocked(&map, &verdicts).contains(&"Fin"));
    }

    #[test]
    fn test_skipped_dependency_releases_dependents() {
        let graph = chain();
        let scheduler = Scheduler::new(&graph);
        let map = states(&[
            ("Econ", UnitStatus::Completed),
            ("Fin", UnitStatus::Idle),
            ("Risk", UnitStatus::Idle),
        ]);
        let mut verdicts = RuleVerdicts::default();
        verdicts.record("Fin", RuleAction::Skip);

        assert_eq!(scheduler.ready_set(&map, &verdicts), vec!["Risk"]);
    }

    #[test]
    fn test_parallel_batch_is_lowest_level() {
        let graph = DependencyGraph::build(vec![
            NodeSpec::new("Econ", Vec::<String>::new()),
            NodeSpec::new("Climate", Vec::<String>::new()),
            NodeSpec::new("Fin", ["Econ"]),
            NodeSpec::new("Risk", ["Fin", "Climate"]),
        ])
        .unwrap();
        let scheduler = Scheduler::new(&graph);
        let map = states(&[
            ("Econ", UnitStatus::Idle),
            ("Climate", UnitStatus::Idle),
            ("Fin", UnitStatus::Idle),
            ("Risk", UnitStatus::Idle),
        ]);
        let mut verdicts = RuleVerdicts::default();

        assert_eq!(
            scheduler.next_parallel_batch(&map, &verdicts),
            vec!["Econ", "Climate"]
        );

        // A forced unit at a deeper level waits for the current level
        verdicts.record("Risk", RuleAction::Run);
        assert_eq!(
            scheduler.next_parallel_batch(&map, &verdicts),
            vec!["Econ", "Climate"]
        );
    }

    #[test]
    fn test_external_dependencies_checked() {
        let graph = DependencyGraph::build(vec![
            NodeSpec::new("price", Vec::<String>::new()).with_external(vec!["gdp".to_string()])
        ])
        .unwrap();
        let scheduler = Scheduler::new(&graph);
        let verdicts = RuleVerdicts::default();
        let mut map = states(&[("price", UnitStatus::Idle), ("gdp", UnitStatus::Running)]);

        assert!(!scheduler.is_ready("price", &map, &verdicts));

        map.get_mut("gdp").unwrap().status = UnitStatus::Completed;
        assert!(scheduler.is_ready("price", &map, &verdicts));
    }
}
