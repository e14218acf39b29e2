// Workflow Models
// Entity types for model groups, modules and their output values

use crate::execution::conditions::ConditionalRule;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::fmt;

/// Execution status shared by groups and modules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
    Disabled,
}

impl UnitStatus {
    /// Whether the unit has been processed in the current pass
    pub fn is_terminal(self) -> bool {
        matches!(self, UnitStatus::Completed | UnitStatus::Failed)
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnitStatus::Idle => "idle",
            UnitStatus::Running => "running",
            UnitStatus::Completed => "completed",
            UnitStatus::Failed => "failed",
            UnitStatus::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

/// A value produced by a module or group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputValue {
    Boolean(bool),
    Number(f64),
    Text(String),
    List(Vec<OutputValue>),
    Struct(BTreeMap<String, OutputValue>),
}

impl OutputValue {
    /// Name of the variant, used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            OutputValue::Boolean(_) => "boolean",
            OutputValue::Number(_) => "number",
            OutputValue::Text(_) => "text",
            OutputValue::List(_) => "list",
            OutputValue::Struct(_) => "struct",
        }
    }
}

impl fmt::Display for OutputValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputValue::Boolean(b) => write!(f, "{}", b),
            OutputValue::Number(n) => write!(f, "{}", n),
            OutputValue::Text(s) => f.write_str(s),
            OutputValue::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            OutputValue::Struct(fields) => {
                f.write_str("{")?;
                for (i, (k, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<f64> for OutputValue {
    fn from(value: f64) -> Self {
        OutputValue::Number(value)
    }
}

impl From<bool> for OutputValue {
    fn from(value: bool) -> Self {
        OutputValue::Boolean(value)
    }
}

impl From<&str> for OutputValue {
    fn from(value: &str) -> Self {
        OutputValue::Text(value.to_string())
    }
}

impl From<String> for OutputValue {
    fn from(value: String) -> Self {
        OutputValue::Text(value)
    }
}

/// A named output with an optional unit label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub name: String,
    pub value: OutputValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl Output {
    pub fn new(name: impl Into<String>, value: impl Into<OutputValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            unit: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }
}

/// Look up an output by name
pub fn find_output<'a>(outputs: &'a [Output], name: &str) -> Option<&'a Output> {
    outputs.iter().find(|o| o.name == name)
}

/// Simulated work attached to a module (consumed by `SimulatedCompute`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkSpec {
    /// Total simulated duration in milliseconds
    #[serde(default)]
    pub duration_ms: u64,
    /// Number of progress ticks the duration is split into
    #[serde(default = "default_ticks")]
    pub ticks: u32,
    /// Outputs produced on success
    #[serde(default)]
    pub outputs: Vec<Output>,
    /// Fail instead of producing outputs
    #[serde(default)]
    pub fail: bool,
}

fn default_ticks() -> u32 {
    10
}

/// A unit of work nested inside a model group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Module {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub optional: bool,
    pub frozen: bool,
    pub breakpoint: bool,
    pub status: UnitStatus,
    pub progress: u8,
    pub dependencies: Vec<String>,
    pub outputs: Vec<Output>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
    #[serde(default)]
    pub work: WorkSpec,
}

impl Module {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            enabled: true,
            optional: false,
            frozen: false,
            breakpoint: false,
            status: UnitStatus::Idle,
            progress: 0,
            dependencies: Vec::new(),
            outputs: Vec::new(),
            start_time: None,
            end_time: None,
            error: None,
            work: WorkSpec::default(),
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_work(mut self, work: WorkSpec) -> Self {
        self.work = work;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// A top-level schedulable unit composed of modules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelGroup {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub optional: bool,
    pub frozen: bool,
    pub breakpoint: bool,
    pub status: UnitStatus,
    pub progress: u8,
    pub dependencies: Vec<String>,
    pub modules: Vec<Module>,
    pub outputs: Vec<Output>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl ModelGroup {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            enabled: true,
            optional: false,
            frozen: false,
            breakpoint: false,
            status: UnitStatus::Idle,
            progress: 0,
            dependencies: Vec::new(),
            modules: Vec::new(),
            outputs: Vec::new(),
            start_time: None,
            end_time: None,
            error: None,
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_module(mut self, module: Module) -> Self {
        self.modules.push(module);
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_breakpoint(mut self) -> Self {
        self.breakpoint = true;
        self
    }

    /// Get a module by id
    pub fn module(&self, id: &str) -> Option<&Module> {
        self.modules.iter().find(|m| m.id == id)
    }

    pub(crate) fn module_mut(&mut self, id: &str) -> Option<&mut Module> {
        self.modules.iter_mut().find(|m| m.id == id)
    }
}

/// Workflow-level execution settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WorkflowSettings {
    /// Run groups in dependency-level batches by default
    #[serde(default)]
    pub parallel: bool,
    /// Maximum groups running at once (0 = unlimited)
    #[serde(default)]
    pub max_parallel_groups: usize,
    /// Maximum modules running at once inside a group (0 = unlimited)
    #[serde(default)]
    pub max_parallel_modules: usize,
}

/// A loaded workflow: groups, conditional rules and settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub settings: WorkflowSettings,
    pub groups: Vec<ModelGroup>,
    pub rules: Vec<ConditionalRule>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, groups: Vec<ModelGroup>) -> Self {
        Self {
            name: name.into(),
            settings: WorkflowSettings::default(),
            groups,
            rules: Vec::new(),
        }
    }

    pub fn with_rules(mut self, rules: Vec<ConditionalRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_settings(mut self, settings: WorkflowSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Get a group by id
    pub fn group(&self, id: &str) -> Option<&ModelGroup> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn module_count(&self) -> usize {
        self.groups.iter().map(|g| g.modules.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_value_untagged_yaml() {
        let yaml = r#"
- name: gdp
  value: 2.5
  unit: "%"
- name: regime
  value: expansion
- name: stressed
  value: false
- name: path
  value: [1, 2, 3]
- name: detail
  value:
    low: 1
    high: 4
"#;
        let outputs: Vec<Output> = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(outputs[0].value, OutputValue::Number(2.5));
        assert_eq!(outputs[0].unit.as_deref(), Some("%"));
        assert_eq!(outputs[1].value, OutputValue::Text("expansion".to_string()));
        assert_eq!(outputs[2].value, OutputValue::Boolean(false));
        assert!(matches!(outputs[3].value, OutputValue::List(ref v) if v.len() == 3));
        assert!(matches!(outputs[4].value, OutputValue::Struct(ref m) if m.len() == 2));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&UnitStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
        assert!(UnitStatus::Failed.is_terminal());
        assert!(!UnitStatus::Disabled.is_terminal());
    }

    #[test]
    fn test_output_display() {
        let value = OutputValue::List(vec![1.0.into(), "a".into()]);
        assert_eq!(value.to_string(), "[1, a]");
    }
}
