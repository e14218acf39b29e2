use crate::error::{EngineError, EngineResult};
use crate::execution::conditions::ConditionalRule;
use crate::execution::graph::{DependencyGraph, GraphError, NodeSpec};
use crate::workflow::error::{ConfigError, ConfigResult};
use crate::workflow::models::{
    ModelGroup, Module, Output, UnitStatus, WorkSpec, Workflow, WorkflowSettings,
};

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

/// Workflow file as written in YAML
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct WorkflowFile {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    settings: WorkflowSettings,
    groups: Vec<GroupConfig>,
    #[serde(default)]
    rules: Vec<ConditionalRule>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct GroupConfig {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    optional: bool,
    #[serde(default)]
    frozen: bool,
    #[serde(default)]
    breakpoint: bool,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    modules: Vec<ModuleConfig>,
    /// Results carried over from an earlier run, kept when frozen
    #[serde(default)]
    outputs: Vec<Output>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ModuleConfig {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    optional: bool,
    #[serde(default)]
    frozen: bool,
    #[serde(default)]
    breakpoint: bool,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    work: WorkSpec,
    #[serde(default)]
    outputs: Vec<Output>,
}

fn default_true() -> bool {
    true
}

/// Frozen entities declared with outputs start out completed
fn initial_status(frozen: bool, outputs: &[Output]) -> (UnitStatus, u8) {
    if frozen && !outputs.is_empty() {
        (UnitStatus::Completed, 100)
    } else {
        (UnitStatus::Idle, 0)
    }
}

impl From<ModuleConfig> for Module {
    fn from(config: ModuleConfig) -> Self {
        let (status, progress) = initial_status(config.frozen, &config.outputs);
        let mut module = Module::new(config.id.clone())
            .with_dependencies(config.dependencies)
            .with_work(config.work);
        module.name = config.name.unwrap_or(config.id);
        module.enabled = config.enabled;
        module.optional = config.optional;
        module.frozen = config.frozen;
        module.breakpoint = config.breakpoint;
        module.outputs = config.outputs;
        module.status = status;
        module.progress = progress;
        module
    }
}

impl From<GroupConfig> for ModelGroup {
    fn from(config: GroupConfig) -> Self {
        let (status, progress) = initial_status(config.frozen, &config.outputs);
        let mut group = ModelGroup::new(config.id.clone()).with_dependencies(config.dependencies);
        group.name = config.name.unwrap_or(config.id);
        group.enabled = config.enabled;
        group.optional = config.optional;
        group.frozen = config.frozen;
        group.breakpoint = config.breakpoint;
        group.outputs = config.outputs;
        group.status = status;
        group.progress = progress;
        group.modules = config.modules.into_iter().map(Module::from).collect();
        group
    }
}

/// Validated dependency graphs of a workflow
#[derive(Debug, Clone)]
pub struct WorkflowGraphs {
    /// Graph over groups
    pub groups: DependencyGraph,
    /// One graph per group over its modules, keyed by group id
    pub modules: HashMap<String, DependencyGraph>,
}

/// Parser for model-group workflow YAML files.
pub struct WorkflowParser;

impl WorkflowParser {
    /// Parse a workflow from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Workflow> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::io(format!("failed to read {}: {}", path.display(), e)))?;
        let fallback = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workflow".to_string());
        Self::parse_named(&content, &fallback)
    }

    /// Parse a workflow from a YAML string.
    pub fn parse(content: &str) -> ConfigResult<Workflow> {
        Self::parse_named(content, "workflow")
    }

    fn parse_named(content: &str, fallback_name: &str) -> ConfigResult<Workflow> {
        let file: WorkflowFile = serde_yaml::from_str(content)
            .map_err(|e| ConfigError::from_yaml_error(&e, content))?;

        Ok(Workflow {
            name: file.name.unwrap_or_else(|| fallback_name.to_string()),
            settings: file.settings,
            groups: file.groups.into_iter().map(ModelGroup::from).collect(),
            rules: file.rules,
        })
    }

    /// Parse and validate a workflow from a YAML string.
    pub fn parse_and_validate(content: &str) -> EngineResult<(Workflow, WorkflowGraphs)> {
        let workflow = Self::parse(content)?;
        let graphs = Self::validate(&workflow)?;
        Ok((workflow, graphs))
    }

    /// Validate a parsed workflow and build its dependency graphs.
    pub fn validate(workflow: &Workflow) -> EngineResult<WorkflowGraphs> {
        // Groups and modules share one id namespace
        let mut seen = HashSet::new();
        let mut owner: HashMap<&str, &str> = HashMap::new();
        for group in &workflow.groups {
            if !seen.insert(group.id.as_str()) {
                return Err(GraphError::duplicate_id(&group.id).into());
            }
            for module in &group.modules {
                if !seen.insert(module.id.as_str()) {
                    return Err(GraphError::duplicate_id(&module.id).into());
                }
                owner.insert(module.id.as_str(), group.id.as_str());
            }
        }

        for group in &workflow.groups {
            if !group.optional && !group.enabled {
                return Err(Self::not_optional(&group.id));
            }
            for module in &group.modules {
                if !module.optional && !module.enabled {
                    return Err(Self::not_optional(&module.id));
                }
            }
        }

        let group_graph = DependencyGraph::build(
            workflow
                .groups
                .iter()
                .map(|g| NodeSpec::new(g.id.clone(), g.dependencies.iter().cloned()))
                .collect(),
        )?;

        let mut module_graphs = HashMap::with_capacity(workflow.groups.len());
        for group in &workflow.groups {
            let mut specs = Vec::with_capacity(group.modules.len());
            for module in &group.modules {
                let mut internal = Vec::new();
                let mut external = Vec::new();
                for dep in &module.dependencies {
                    match owner.get(dep.as_str()) {
                        Some(&g) if g == group.id => internal.push(dep.clone()),
                        Some(&g) => {
                            if !group_graph.is_upstream(g, &group.id) {
                                return Err(ConfigError::validation(format!(
                                    "module '{}' depends on '{}' in group '{}', which is not upstream of group '{}'",
                                    module.id, dep, g, group.id
                                ))
                                .with_suggestion(format!(
                                    "add '{}' to the dependencies of group '{}'",
                                    g, group.id
                                ))
                                .into());
                            }
                            external.push(dep.clone());
                        }
                        None => return Err(GraphError::unknown_dependency(&module.id, dep).into()),
                    }
                }
                specs.push(NodeSpec::new(module.id.clone(), internal).with_external(external));
            }
            module_graphs.insert(group.id.clone(), DependencyGraph::build(specs)?);
        }

        for rule in &workflow.rules {
            for id in [&rule.source_id, &rule.target_id] {
                if !group_graph.contains(id) {
                    return Err(ConfigError::validation(format!(
                        "rule '{}' references unknown group '{}'",
                        rule, id
                    ))
                    .into());
                }
            }
            if rule.source_id == rule.target_id {
                return Err(ConfigError::validation(format!(
                    "rule '{}' uses its own target as source",
                    rule
                ))
                .into());
            }
        }

        Ok(WorkflowGraphs {
            groups: group_graph,
            modules: module_graphs,
        })
    }

    fn not_optional(id: &str) -> EngineError {
        ConfigError::validation(format!("'{}' is disabled but not optional", id))
            .with_suggestion("mark it `optional: true` or enable it")
            .into()
    }
}
