// Conditional Dependencies
// Runtime run/skip rules layered on top of the static dependency graph

use crate::workflow::models::{find_output, Output, OutputValue};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

/// Comparison applied between a source output and the rule value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOperator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl ComparisonOperator {
    fn is_equality(self) -> bool {
        matches!(self, ComparisonOperator::Eq | ComparisonOperator::Ne)
    }
}

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComparisonOperator::Gt => ">",
            ComparisonOperator::Lt => "<",
            ComparisonOperator::Ge => ">=",
            ComparisonOperator::Le => "<=",
            ComparisonOperator::Eq => "==",
            ComparisonOperator::Ne => "!=",
        };
        f.write_str(s)
    }
}

/// What happens to the target when a rule fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Run,
    Skip,
}

/// "If source's output field meets a comparison, then run|skip target"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalRule {
    pub target_id: String,
    pub source_id: String,
    pub output_field: String,
    pub operator: ComparisonOperator,
    pub value: OutputValue,
    pub action: RuleAction,
}

impl fmt::Display for ConditionalRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "if {}.{} {} {} then {:?} {}",
            self.source_id, self.output_field, self.operator, self.value, self.action, self.target_id
        )
    }
}

/// Rule evaluation errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuleError {
    #[error("output '{field}' not found on '{source_id}'")]
    MissingOutput { source_id: String, field: String },

    #[error("cannot compare {found} with {expected} using '{operator}'")]
    TypeMismatch {
        operator: ComparisonOperator,
        expected: &'static str,
        found: &'static str,
    },
}

/// Evaluate a single rule against the source's current outputs
pub fn evaluate(rule: &ConditionalRule, source_outputs: &[Output]) -> Result<bool, RuleError> {
    let output =
        find_output(source_outputs, &rule.output_field).ok_or_else(|| RuleError::MissingOutput {
            source_id: rule.source_id.clone(),
            field: rule.output_field.clone(),
        })?;

    compare(&output.value, rule.operator, &rule.value)
}

fn compare(
    actual: &OutputValue,
    operator: ComparisonOperator,
    expected: &OutputValue,
) -> Result<bool, RuleError> {
    let mismatch = || RuleError::TypeMismatch {
        operator,
        expected: expected.kind(),
        found: actual.kind(),
    };

    match (actual, expected) {
        (OutputValue::Number(a), OutputValue::Number(b)) => {
            if a.is_nan() || b.is_nan() {
                return Err(mismatch());
            }
            Ok(match operator {
                ComparisonOperator::Gt => a > b,
                ComparisonOperator::Lt => a < b,
                ComparisonOperator::Ge => a >= b,
                ComparisonOperator::Le => a <= b,
                ComparisonOperator::Eq => a == b,
                ComparisonOperator::Ne => a != b,
            })
        }
        (OutputValue::Text(a), OutputValue::Text(b)) if operator.is_equality() => {
            Ok((a == b) == (operator == ComparisonOperator::Eq))
        }
        (OutputValue::Boolean(a), OutputValue::Boolean(b)) if operator.is_equality() => {
            Ok((a == b) == (operator == ComparisonOperator::Eq))
        }
        _ => Err(mismatch()),
    }
}

/// Targets affected by active rules during one scheduling step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleVerdicts {
    skip: BTreeSet<String>,
    run: BTreeSet<String>,
}

impl RuleVerdicts {
    /// Excluded from this pass; wins over any `run` rule
    pub fn is_skipped(&self, id: &str) -> bool {
        self.skip.contains(id)
    }

    /// Eligible despite unmet static dependencies, unless also skipped
    pub fn is_forced(&self, id: &str) -> bool {
        self.run.contains(id) && !self.skip.contains(id)
    }

    pub fn skipped(&self) -> impl Iterator<Item = &str> {
        self.skip.iter().map(String::as_str)
    }

    pub fn record(&mut self, target: &str, action: RuleAction) {
        match action {
            RuleAction::Skip => self.skip.insert(target.to_string()),
            RuleAction::Run => self.run.insert(target.to_string()),
        };
    }
}

/// Evaluate all rules whose source has outputs available
///
/// `outputs_of` returns the outputs of a completed (or frozen) source and
/// `None` while the source has not produced anything this pass. Rules that
/// fail to evaluate are logged and treated as inactive.
pub fn evaluate_rules<'a, F>(rules: &[ConditionalRule], outputs_of: F) -> RuleVerdicts
where
    F: Fn(&str) -> Option<&'a [Output]>,
{
    let mut verdicts = RuleVerdicts::default();

    for rule in rules {
        let Some(outputs) = outputs_of(&rule.source_id) else {
            continue;
        };

        match evaluate(rule, outputs) {
            Ok(true) => {
                debug!(rule = %rule, "conditional rule active");
                verdicts.record(&rule.target_id, rule.action);
            }
            Ok(false) => {}
            Err(e) => {
                warn!(rule = %rule, error = %e, "conditional rule could not be evaluated");
            }
        }
    }

    verdicts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(op: ComparisonOperator, value: OutputValue, action: RuleAction) -> ConditionalRule {
        ConditionalRule {
            target_id: "Risk".to_string(),
            source_id: "Econ".to_string(),
            output_field: "gdp".to_string(),
            operator: op,
            value,
            action,
        }
    }

    #[test]
    fn test_numeric_comparisons() {
        let outputs = vec![Output::new("gdp", 2.5)];
        let cases = [
            (ComparisonOperator::Gt, 2.0, true),
            (ComparisonOperator::Gt, 2.5, false),
            (ComparisonOperator::Ge, 2.5, true),
            (ComparisonOperator::Lt, 3.0, true),
            (ComparisonOperator::Le, 2.0, false),
            (ComparisonOperator::Eq, 2.5, true),
            (ComparisonOperator::Ne, 2.5, false),
        ];

        for (op, value, expected) in cases {
            let r = rule(op, value.into(), RuleAction::Skip);
            assert_eq!(evaluate(&r, &outputs), Ok(expected), "{} {}", op, value);
        }
    }

    #[test]
    fn test_text_and_boolean_equality() {
        let outputs = vec![Output::new("gdp", "recession"), Output::new("flag", true)];

        let r = rule(ComparisonOperator::Eq, "recession".into(), RuleAction::Skip);
        assert_eq!(evaluate(&r, &outputs), Ok(true));

        let r = rule(ComparisonOperator::Ne, "recession".into(), RuleAction::Skip);
        assert_eq!(evaluate(&r, &outputs), Ok(false));

        let mut r = rule(ComparisonOperator::Eq, true.into(), RuleAction::Run);
        r.output_field = "flag".to_string();
        assert_eq!(evaluate(&r, &outputs), Ok(true));
    }

    #[test]
    fn test_ordering_on_text_is_type_mismatch() {
        let outputs = vec![Output::new("gdp", "high")];
        let r = rule(ComparisonOperator::Gt, "low".into(), RuleAction::Skip);

        assert!(matches!(
            evaluate(&r, &outputs),
            Err(RuleError::TypeMismatch { found: "text", .. })
        ));
    }

    #[test]
    fn test_mixed_variants_are_type_mismatch() {
        let outputs = vec![Output::new("gdp", "2.5")];
        let r = rule(ComparisonOperator::Eq, 2.5.into(), RuleAction::Skip);

        let err = evaluate(&r, &outputs).unwrap_err();
        assert_eq!(
            err,
            RuleError::TypeMismatch {
                operator: ComparisonOperator::Eq,
                expected: "number",
                found: "text",
            }
        );
    }

    #[test]
    fn test_nan_never_compares() {
        let outputs = vec![Output::new("gdp", f64::NAN)];
        let r = rule(ComparisonOperator::Ne, 1.0.into(), RuleAction::Skip);
        assert!(evaluate(&r, &outputs).is_err());
    }

    #[test]
    fn test_missing_output() {
        let r = rule(ComparisonOperator::Gt, 1.0.into(), RuleAction::Skip);
        assert!(matches!(
            evaluate(&r, &[]),
            Err(RuleError::MissingOutput { .. })
        ));
    }

    #[test]
    fn test_skip_wins_over_run() {
        let outputs = vec![Output::new("gdp", 5.0)];
        let rules = vec![
            rule(ComparisonOperator::Gt, 1.0.into(), RuleAction::Run),
            rule(ComparisonOperator::Gt, 1.0.into(), RuleAction::Skip),
        ];

        let verdicts = evaluate_rules(&rules, |_| Some(outputs.as_slice()));
        assert!(verdicts.is_skipped("Risk"));
        assert!(!verdicts.is_forced("Risk"));
    }

    #[test]
    fn test_inactive_rules_without_source_outputs() {
        let rules = vec![rule(ComparisonOperator::Gt, 1.0.into(), RuleAction::Skip)];

        let verdicts = evaluate_rules(&rules, |_| None);
        assert_eq!(verdicts, RuleVerdicts::default());
    }

    #[test]
    fn test_erroring_rule_is_inactive() {
        let outputs = vec![Output::new("gdp", "n/a")];
        let rules = vec![rule(ComparisonOperator::Gt, 1.0.into(), RuleAction::Skip)];

        let verdicts = evaluate_rules(&rules, |_| Some(outputs.as_slice()));
        assert!(!verdicts.is_skipped("Risk"));
    }

    #[test]
    fn test_rule_deserializes_from_yaml() {
        let yaml = r#"
targetId: Risk
sourceId: Econ
outputField: gdp
operator: "<="
value: 0
action: skip
"#;
        let r: ConditionalRule = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(r.operator, ComparisonOperator::Le);
        assert_eq!(r.action, RuleAction::Skip);
        assert_eq!(r.value, OutputValue::Number(0.0));
    }
}
