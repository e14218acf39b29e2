// Dependency Graph (DAG) Builder
// Validates static dependencies and derives execution order and parallel levels

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt;

/// Error type for graph operations
#[derive(Debug, Clone)]
pub struct GraphError {
    pub message: String,
    pub kind: GraphErrorKind,
    /// Ids involved in the error (the cycle path for cyclic dependencies)
    pub members: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphErrorKind {
    /// Circular dependency detected
    CyclicDependency,
    /// Reference to an undeclared node
    UnknownDependency,
    /// Same id declared twice
    DuplicateId,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for GraphError {}

impl GraphError {
    pub fn cyclic(members: Vec<String>) -> Self {
        Self {
            message: format!("circular dependency detected: {}", members.join(" -> ")),
            kind: GraphErrorKind::CyclicDependency,
            members,
        }
    }

    pub fn unknown_dependency(id: &str, dependency: &str) -> Self {
        Self {
            message: format!("'{}' depends on unknown '{}'", id, dependency),
            kind: GraphErrorKind::UnknownDependency,
            members: vec![id.to_string(), dependency.to_string()],
        }
    }

    pub fn duplicate_id(id: &str) -> Self {
        Self {
            message: format!("id '{}' is declared more than once", id),
            kind: GraphErrorKind::DuplicateId,
            members: vec![id.to_string()],
        }
    }
}

/// Declaration of a node handed to [`DependencyGraph::build`]
#[derive(Debug, Clone, Default)]
pub struct NodeSpec {
    pub id: String,
    /// Dependencies on other nodes of the same graph
    pub dependencies: Vec<String>,
    /// Dependencies resolved outside this graph (cross-group modules)
    pub external: Vec<String>,
}

impl NodeSpec {
    pub fn new<I, S>(id: impl Into<String>, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            dependencies: dependencies.into_iter().map(Into::into).collect(),
            external: Vec::new(),
        }
    }

    pub fn with_external(mut self, external: Vec<String>) -> Self {
        self.external = external;
        self
    }
}

/// A validated node of the graph
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub id: String,
    /// Declaration index, the primary topological tie-breaker
    pub index: usize,
    pub dependencies: Vec<String>,
    pub external: Vec<String>,
}

/// Static dependency DAG over groups, or over the modules of one group
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<GraphNode>,
    /// Quick lookup of node index by id
    indices: HashMap<String, usize>,
    /// Direct dependents of each node, by index
    dependents: Vec<Vec<usize>>,
    /// Position of each node in the full topological order
    positions: Vec<usize>,
}

impl DependencyGraph {
    /// Build and validate a graph; nodes keep their declaration order
    pub fn build(specs: Vec<NodeSpec>) -> Result<Self, GraphError> {
        let mut indices = HashMap::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            if indices.insert(spec.id.clone(), i).is_some() {
                return Err(GraphError::duplicate_id(&spec.id));
            }
        }

        let mut dependents = vec![Vec::new(); specs.len()];
        for (i, spec) in specs.iter().enumerate() {
            for dep in &spec.dependencies {
                match indices.get(dep) {
                    Some(&d) => dependents[d].push(i),
                    None => return Err(GraphError::unknown_dependency(&spec.id, dep)),
                }
            }
        }

        let nodes = specs
            .into_iter()
            .enumerate()
            .map(|(index, spec)| GraphNode {
                id: spec.id,
                index,
                dependencies: spec.dependencies,
                external: spec.external,
            })
            .collect();

        let mut graph = Self {
            nodes,
            indices,
            dependents,
            positions: Vec::new(),
        };

        graph.detect_cycles()?;

        let order: Vec<usize> = graph.kahn(|_| true);
        let mut positions = vec![0; graph.nodes.len()];
        for (pos, idx) in order.into_iter().enumerate() {
            positions[idx] = pos;
        }
        graph.positions = positions;

        Ok(graph)
    }

    /// Detect cycles using DFS, reporting the cycle path
    fn detect_cycles(&self) -> Result<(), GraphError> {
        let mut visited = HashSet::new();
        let mut stack = Vec::new();

        for node in &self.nodes {
            if !visited.contains(&node.index) {
                if let Some(cycle) = self.dfs_cycle(node.index, &mut visited, &mut stack) {
                    return Err(GraphError::cyclic(cycle));
                }
            }
        }

        Ok(())
    }

    fn dfs_cycle(
        &self,
        idx: usize,
        visited: &mut HashSet<usize>,
        stack: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        visited.insert(idx);
        stack.push(idx);

        for dep in &self.nodes[idx].dependencies {
            let dep_idx = self.indices[dep];
            if let Some(pos) = stack.iter().position(|&s| s == dep_idx) {
                let mut cycle: Vec<String> =
                    stack[pos..].iter().map(|&s| self.nodes[s].id.clone()).collect();
                cycle.push(self.nodes[dep_idx].id.clone());
                return Some(cycle);
            }
            if !visited.contains(&dep_idx) {
                if let Some(cycle) = self.dfs_cycle(dep_idx, visited, stack) {
                    return Some(cycle);
                }
            }
        }

        stack.pop();
        None
    }

    /// Kahn's algorithm over the included nodes; ties go to declaration index
    fn kahn(&self, include: impl Fn(&GraphNode) -> bool) -> Vec<usize> {
        let included: Vec<bool> = self.nodes.iter().map(&include).collect();
        let mut in_degree = vec![0usize; self.nodes.len()];

        for node in &self.nodes {
            if !included[node.index] {
                continue;
            }
            in_degree[node.index] = node
                .dependencies
                .iter()
                .filter(|dep| included[self.indices[dep.as_str()]])
                .count();
        }

        let mut queue: BinaryHeap<Reverse<(usize, &str)>> = self
            .nodes
            .iter()
            .filter(|n| included[n.index] && in_degree[n.index] == 0)
            .map(|n| Reverse((n.index, n.id.as_str())))
            .collect();

        let mut result = Vec::with_capacity(self.nodes.len());

        while let Some(Reverse((idx, _))) = queue.pop() {
            result.push(idx);

            for &dependent in &self.dependents[idx] {
                if !included[dependent] {
                    continue;
                }
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    let node = &self.nodes[dependent];
                    queue.push(Reverse((node.index, node.id.as_str())));
                }
            }
        }

        result
    }

    /// Ids in topological order, considering only nodes accepted by `enabled`
    pub fn topological_order(&self, enabled: impl Fn(&str) -> bool) -> Vec<&str> {
        self.kahn(|n| enabled(&n.id))
            .into_iter()
            .map(|idx| self.nodes[idx].id.as_str())
            .collect()
    }

    /// Level of every accepted node: 0 without accepted dependencies, else 1 + max
    pub fn level_map(&self, enabled: impl Fn(&str) -> bool) -> HashMap<&str, usize> {
        let mut assigned: HashMap<&str, usize> = HashMap::new();

        for id in self.topological_order(&enabled) {
            let level = self.nodes[self.indices[id]]
                .dependencies
                .iter()
                .filter_map(|dep| assigned.get(dep.as_str()))
                .max()
                .map(|l| l + 1)
                .unwrap_or(0);
            assigned.insert(id, level);
        }

        assigned
    }

    /// Nodes grouped by level; members of one level share no edge
    pub fn levels(&self, enabled: impl Fn(&str) -> bool) -> Vec<Vec<&str>> {
        let mut levels: Vec<Vec<&str>> = Vec::new();
        let assigned = self.level_map(&enabled);

        for id in self.topological_order(&enabled) {
            let level = assigned[id];
            if level >= levels.len() {
                levels.resize(level + 1, Vec::new());
            }
            levels[level].push(id);
        }

        levels
    }

    /// Get a node by id
    pub fn get(&self, id: &str) -> Option<&GraphNode> {
        self.indices.get(id).map(|&idx| &self.nodes[idx])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.indices.contains_key(id)
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Position of a node in the full topological order
    pub fn position(&self, id: &str) -> Option<usize> {
        self.indices.get(id).map(|&idx| self.positions[idx])
    }

    /// Direct dependents of a node, in declaration order
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        let Some(&idx) = self.indices.get(id) else {
            return Vec::new();
        };
        let mut deps: Vec<usize> = self.dependents[idx].clone();
        deps.sort_unstable();
        deps.into_iter().map(|d| self.nodes[d].id.as_str()).collect()
    }

    /// All direct and indirect dependents of a node, in topological order
    pub fn transitive_dependents(&self, id: &str) -> Vec<&str> {
        let Some(&start) = self.indices.get(id) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(idx) = queue.pop_front() {
            for &dependent in &self.dependents[idx] {
                if seen.insert(dependent) {
                    queue.push_back(dependent);
                }
            }
        }

        let mut found: Vec<usize> = seen.into_iter().collect();
        found.sort_by_key(|&idx| self.positions[idx]);
        found.into_iter().map(|idx| self.nodes[idx].id.as_str()).collect()
    }

    /// Whether `ancestor` is a direct or indirect dependency of `id`
    pub fn is_upstream(&self, ancestor: &str, id: &str) -> bool {
        self.transitive_dependents(ancestor).contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(nodes: &[(&str, &[&str])]) -> Result<DependencyGraph, GraphError> {
        DependencyGraph::build(
            nodes
                .iter()
                .map(|(id, deps)| NodeSpec::new(*id, deps.iter().copied()))
                .collect(),
        )
    }

    #[test]
    fn test_simple_linear_chain() {
        let g = graph(&[("Econ", &[]), ("Fin", &["Econ"]), ("Risk", &["Fin"])]).unwrap();

        assert_eq!(g.topological_order(|_| true), vec!["Econ", "Fin", "Risk"]);
        assert_eq!(g.levels(|_| true), vec![vec!["Econ"], vec!["Fin"], vec!["Risk"]]);
    }

    #[test]
    fn test_order_ties_follow_declaration() {
        // Declared out of dependency order on purpose
        let g = graph(&[
            ("Report", &["B", "A"]),
            ("B", &[]),
            ("A", &[]),
            ("C", &["A"]),
        ])
        .unwrap();

        assert_eq!(g.topological_order(|_| true), vec!["B", "A", "Report", "C"]);
    }

    #[test]
    fn test_dependencies_precede_dependents() {
        let g = graph(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["b", "c"]),
            ("e", &["d", "a"]),
            ("f", &[]),
        ])
        .unwrap();

        let order = g.topological_order(|_| true);
        let pos = |id: &str| order.iter().position(|x| *x == id).unwrap();
        for node in g.nodes() {
            for dep in &node.dependencies {
                assert!(pos(dep) < pos(&node.id), "{} must precede {}", dep, node.id);
            }
        }
    }

    #[test]
    fn test_parallel_levels() {
        let g = graph(&[
            ("Build", &[]),
            ("UnitTest", &["Build"]),
            ("IntegrationTest", &["Build"]),
            ("Deploy", &["UnitTest", "IntegrationTest"]),
            ("Lint", &[]),
        ])
        .unwrap();

        let levels = g.levels(|_| true);
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[0], vec!["Build", "Lint"]);
        assert_eq!(levels[1], vec!["UnitTest", "IntegrationTest"]);
        assert_eq!(levels[2], vec!["Deploy"]);

        let assigned = g.level_map(|_| true);
        for level in &levels {
            for a in level {
                for b in level {
                    assert!(!g.get(a).unwrap().dependencies.iter().any(|d| d == b));
                }
                let deps = &g.get(a).unwrap().dependencies;
                let expected = deps.iter().map(|d| assigned[d.as_str()] + 1).max().unwrap_or(0);
                assert_eq!(assigned[a], expected);
            }
        }
    }

    #[test]
    fn test_disabled_nodes_are_ignored() {
        let g = graph(&[("Econ", &[]), ("Fin", &["Econ"]), ("Risk", &["Fin"])]).unwrap();

        let order = g.topological_order(|id| id != "Fin");
        assert_eq!(order, vec!["Econ", "Risk"]);

        // Risk no longer waits on anything enabled
        let levels = g.levels(|id| id != "Fin");
        assert_eq!(levels, vec![vec!["Econ", "Risk"]]);
    }

    #[test]
    fn test_cycle_detection_names_members() {
        let err = graph(&[("A", &["C"]), ("B", &["A"]), ("C", &["B"])]).unwrap_err();

        assert_eq!(err.kind, GraphErrorKind::CyclicDependency);
        assert_eq!(err.members, vec!["A", "C", "B", "A"]);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = graph(&[("A", &["A"])]).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::CyclicDependency);
        assert_eq!(err.members, vec!["A", "A"]);
    }

    #[test]
    fn test_unknown_dependency() {
        let err = graph(&[("Build", &[]), ("Test", &["Unknown"])]).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::UnknownDependency);
    }

    #[test]
    fn test_duplicate_id() {
        let err = graph(&[("Build", &[]), ("Build", &[])]).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::DuplicateId);
    }

    #[test]
    fn test_transitive_dependents() {
        let g = graph(&[
            ("Econ", &[]),
            ("Fin", &["Econ"]),
            ("Risk", &["Fin"]),
            ("Climate", &[]),
        ])
        .unwrap();

        assert_eq!(g.dependents("Econ"), vec!["Fin"]);
        assert_eq!(g.transitive_dependents("Econ"), vec!["Fin", "Risk"]);
        assert!(g.is_upstream("Econ", "Risk"));
        assert!(!g.is_upstream("Climate", "Risk"));
        assert!(!g.is_upstream("Risk", "Econ"));
    }
}
