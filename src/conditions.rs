//! Boolean gates evaluated against a request environment.
//!
//! Conditions fail closed: an evaluation error counts as "not satisfied"
//! while the error is still reported next to the condition that raised it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::expr::{self, Evaluator, ExprError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionOperator {
    In,
    NotIn,
}

/// `{key, operator, values}`: `key` is resolved and tested for membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionSelector {
    pub key: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl ConditionSelector {
    fn describe(&self) -> String {
        let op = match self.operator {
            ConditionOperator::In => "in",
            ConditionOperator::NotIn => "notin",
        };
        format!("{} {op} ({})", self.key, self.values.join(", "))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConditionError {
    #[error("error evaluating {expression:?}: {source}")]
    Evaluation {
        expression: String,
        #[source]
        source: ExprError,
    },

    #[error("expression {expression:?} evaluated to {found}, expected a boolean")]
    NotBoolean {
        expression: String,
        found: &'static str,
    },
}

/// Evaluates a membership selector.
pub fn evaluate_selector(
    evaluator: &dyn Evaluator,
    selector: &ConditionSelector,
    env: &Value,
) -> Result<bool, ConditionError> {
    let value = expr::evaluate_string(evaluator, &selector.key, env).map_err(|source| {
        ConditionError::Evaluation {
            expression: selector.key.clone(),
            source,
        }
    })?;
    let member = selector.values.iter().any(|v| *v == value);
    Ok(match selector.operator {
        ConditionOperator::In => member,
        ConditionOperator::NotIn => !member,
    })
}

/// Evaluates a boolean expression template.
///
/// The strings `"true"` and `"false"` are accepted so interpolated
/// templates work as gates.
pub fn evaluate_when(
    evaluator: &dyn Evaluator,
    template: &str,
    env: &Value,
) -> Result<bool, ConditionError> {
    let value = evaluator
        .evaluate(template, env)
        .map_err(|source| ConditionError::Evaluation {
            expression: template.to_string(),
            source,
        })?;
    match &value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(false),
        other => Err(ConditionError::NotBoolean {
            expression: template.to_string(),
            found: expr::type_name(other),
        }),
    }
}

/// One gate of a batch.
#[derive(Debug, Clone, Copy)]
pub enum Condition<'a> {
    When(&'a str),
    Selector(&'a ConditionSelector),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConditionResult {
    pub expression: String,
    pub satisfied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    pub satisfied: bool,
    pub conditions: Vec<ConditionResult>,
}

/// Evaluates every condition and ANDs the results. Any error makes the batch
/// unsatisfied. All conditions are evaluated so each reports its outcome.
pub fn evaluate_all(evaluator: &dyn Evaluator, conditions: &[Condition<'_>], env: &Value) -> BatchResult {
    let mut satisfied = true;
    let mut results = Vec::with_capacity(conditions.len());

    for condition in conditions {
        let (expression, outcome) = match condition {
            Condition::When(template) => (template.to_string(), evaluate_when(evaluator, template, env)),
            Condition::Selector(selector) => (
                selector.describe(),
                evaluate_selector(evaluator, selector, env),
            ),
        };
        let result = match outcome {
            Ok(ok) => ConditionResult {
                expression,
                satisfied: ok,
                error: None,
            },
            Err(e) => ConditionResult {
                expression,
                satisfied: false,
                error: Some(e.to_string()),
            },
        };
        satisfied &= result.satisfied;
        results.push(result);
    }

    BatchResult {
        satisfied,
        conditions: results,
    }
}
