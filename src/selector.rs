//! Compiles declarative target selection criteria into store predicates.
//!
//! Index and label values may embed expressions; every resolved value must
//! be a string because index and label predicates compare strings.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::expr::{self, Evaluator, ExprError};
use crate::types::{ResourceKind, NAME_INDEX};

static LABEL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9]([-A-Za-z0-9_.]{0,61}[A-Za-z0-9])?$").unwrap());
static DNS_SUBDOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap()
});

// ---------------------------------------------------------------------------
// Declarative criteria
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSelectionCriteria {
    #[serde(default)]
    pub kind: ResourceKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub index_selector: IndexSelector,
    #[serde(default)]
    pub label_selector: LabelSelectorSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSelector {
    #[serde(default)]
    pub match_indices: Vec<IndexSelectorRequirement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexOperator {
    Equal,
    NotEqual,
    #[serde(untagged)]
    Other(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSelectorRequirement {
    pub key: String,
    pub operator: IndexOperator,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorSpec {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
    Gt,
    Lt,
    #[serde(untagged)]
    Other(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: LabelOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

// ---------------------------------------------------------------------------
// Compiled predicates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryPredicate {
    InNamespace(String),
    Field(FieldPredicate),
    Labels(LabelSelector),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOp {
    Equals,
    NotEquals,
}

/// Predicate over a store index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPredicate {
    pub key: String,
    pub op: FieldOp,
    pub value: String,
}

impl FieldPredicate {
    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op: FieldOp::Equals,
            value: value.into(),
        }
    }

    /// Applies the predicate to the index values of one object.
    pub fn matches(&self, indexed: &[String]) -> bool {
        let present = indexed.iter().any(|v| *v == self.value);
        match self.op {
            FieldOp::Equals => present,
            FieldOp::NotEquals => !present,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelOp {
    Equals,
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl fmt::Display for LabelOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LabelOp::Equals => "=",
            LabelOp::In => "in",
            LabelOp::NotIn => "notin",
            LabelOp::Exists => "exists",
            LabelOp::DoesNotExist => "!",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelRequirement {
    key: String,
    op: LabelOp,
    values: BTreeSet<String>,
}

impl LabelRequirement {
    /// Validates and builds a requirement.
    pub fn new(
        key: impl Into<String>,
        op: LabelOp,
        values: impl IntoIterator<Item = String>,
    ) -> Result<Self, SelectorError> {
        let key = key.into();
        let values: BTreeSet<String> = values.into_iter().collect();
        validate_label_key(&key)?;

        match op {
            LabelOp::Equals if values.len() != 1 => {
                return Err(SelectorError::InvalidRequirement(format!(
                    "key {key:?}: exactly one value is required for operator {op}"
                )))
            }
            LabelOp::In | LabelOp::NotIn if values.is_empty() => {
                return Err(SelectorError::InvalidRequirement(format!(
                    "key {key:?}: values must be non-empty for operator {op}"
                )))
            }
            LabelOp::Exists | LabelOp::DoesNotExist if !values.is_empty() => {
                return Err(SelectorError::InvalidRequirement(format!(
                    "key {key:?}: values must be empty for operator {op}"
                )))
            }
            _ => {}
        }
        for value in &values {
            validate_label_value(&key, value)?;
        }

        Ok(Self { key, op, values })
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.op {
            LabelOp::Equals | LabelOp::In => value.is_some_and(|v| self.values.contains(v)),
            LabelOp::NotIn => value.map_or(true, |v| !self.values.contains(v)),
            LabelOp::Exists => value.is_some(),
            LabelOp::DoesNotExist => value.is_none(),
        }
    }
}

/// Conjunction of label requirements. Never empty when emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSelector {
    pub requirements: Vec<LabelRequirement>,
}

impl LabelSelector {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SelectorError {
    #[error("error resolving {field}: {source}")]
    Expression {
        field: String,
        #[source]
        source: ExprError,
    },

    #[error("unsupported index selector operator {0:?}")]
    UnsupportedIndexOperator(String),

    #[error("unsupported label selector operator {0:?}")]
    UnsupportedLabelOperator(String),

    #[error("invalid label requirement: {0}")]
    InvalidRequirement(String),
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Resolves `criteria` against `env` into predicates scoped to `project`.
///
/// The namespace predicate is always first. A label predicate is emitted
/// only when at least one label requirement was produced.
pub fn build(
    evaluator: &dyn Evaluator,
    project: &str,
    criteria: &TargetSelectionCriteria,
    env: &Value,
) -> Result<Vec<QueryPredicate>, SelectorError> {
    let mut predicates = vec![QueryPredicate::InNamespace(project.to_string())];

    if let Some(name) = &criteria.name {
        let name = resolve(evaluator, "name", name, env)?;
        predicates.push(QueryPredicate::Field(FieldPredicate::equals(NAME_INDEX, name)));
    }

    for entry in &criteria.index_selector.match_indices {
        let op = match &entry.operator {
            IndexOperator::Equal => FieldOp::Equals,
            IndexOperator::NotEqual => FieldOp::NotEquals,
            IndexOperator::Other(other) => {
                return Err(SelectorError::UnsupportedIndexOperator(other.clone()))
            }
        };
        let value = resolve(evaluator, &format!("index {:?}", entry.key), &entry.value, env)?;
        predicates.push(QueryPredicate::Field(FieldPredicate {
            key: entry.key.clone(),
            op,
            value,
        }));
    }

    let mut requirements = Vec::new();
    for (key, value) in &criteria.label_selector.match_labels {
        let value = resolve(evaluator, &format!("label {key:?}"), value, env)?;
        requirements.push(LabelRequirement::new(key.as_str(), LabelOp::Equals, [value])?);
    }
    for expression in &criteria.label_selector.match_expressions {
        let op = match &expression.operator {
            LabelOperator::In => LabelOp::In,
            LabelOperator::NotIn => LabelOp::NotIn,
            LabelOperator::Exists => LabelOp::Exists,
            LabelOperator::DoesNotExist => LabelOp::DoesNotExist,
            LabelOperator::Gt => return Err(SelectorError::UnsupportedLabelOperator("Gt".into())),
            LabelOperator::Lt => return Err(SelectorError::UnsupportedLabelOperator("Lt".into())),
            LabelOperator::Other(other) => {
                return Err(SelectorError::UnsupportedLabelOperator(other.clone()))
            }
        };
        let field = format!("label expression {:?}", expression.key);
        let values = expression
            .values
            .iter()
            .map(|v| resolve(evaluator, &field, v, env))
            .collect::<Result<Vec<_>, _>>()?;
        requirements.push(LabelRequirement::new(expression.key.as_str(), op, values)?);
    }
    if !requirements.is_empty() {
        predicates.push(QueryPredicate::Labels(LabelSelector { requirements }));
    }

    Ok(predicates)
}

fn resolve(evaluator: &dyn Evaluator, field: &str, raw: &str, env: &Value) -> Result<String, SelectorError> {
    expr::evaluate_string(evaluator, raw, env).map_err(|source| SelectorError::Expression {
        field: field.to_string(),
        source,
    })
}

fn validate_label_key(key: &str) -> Result<(), SelectorError> {
    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };
    if let Some(prefix) = prefix {
        if prefix.is_empty() || prefix.len() > 253 || !DNS_SUBDOMAIN.is_match(prefix) {
            return Err(SelectorError::InvalidRequirement(format!(
                "key {key:?}: prefix must be a DNS subdomain"
            )));
        }
    }
    if !LABEL_NAME.is_match(name) {
        return Err(SelectorError::InvalidRequirement(format!(
            "key {key:?}: name must be 1-63 alphanumeric characters, '-', '_' or '.'"
        )));
    }
    Ok(())
}

fn validate_label_value(key: &str, value: &str) -> Result<(), SelectorError> {
    if value.is_empty() || LABEL_NAME.is_match(value) {
        Ok(())
    } else {
        Err(SelectorError::InvalidRequirement(format!(
            "key {key:?}: invalid label value {value:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::TemplateEvaluator;
    use serde_json::json;

    fn env() -> Value {
        json!({"request": {"body": {"region": "us-west-1", "tier": "gold", "n": 7}}})
    }

    fn criteria(value: serde_json::Value) -> TargetSelectionCriteria {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn literal_index_entry_yields_one_field_predicate() {
        let c = criteria(json!({
            "kind": "Warehouse",
            "indexSelector": {"matchIndices": [
                {"key": "region", "operator": "Equal", "value": "us-west-1"}
            ]}
        }));
        let predicates = build(&TemplateEvaluator, "proj", &c, &env()).unwrap();
        assert_eq!(
            predicates,
            vec![
                QueryPredicate::InNamespace("proj".into()),
                QueryPredicate::Field(FieldPredicate::equals("region", "us-west-1")),
            ]
        );
        assert!(!predicates.iter().any(|p| matches!(p, QueryPredicate::Labels(_))));
    }

    #[test]
    fn expressions_resolve_in_every_position() {
        let c = criteria(json!({
            "name": "${{ 'wh-' + 'x' }}",
        }));
        // `+` is not part of the language.
        assert!(matches!(
            build(&TemplateEvaluator, "proj", &c, &env()),
            Err(SelectorError::Expression { .. })
        ));

        let c = criteria(json!({
            "name": "wh-${{ request.body.tier }}",
            "indexSelector": {"matchIndices": [
                {"key": "region", "operator": "NotEqual", "value": "${{ request.body.region }}"}
            ]},
            "labelSelector": {
                "matchLabels": {"tier": "${{ request.body.tier }}"},
                "matchExpressions": [
                    {"key": "env", "operator": "In", "values": ["prod", "${{ request.body.region }}"]}
                ]
            }
        }));
        let predicates = build(&TemplateEvaluator, "proj", &c, &env()).unwrap();
        assert_eq!(predicates.len(), 4);
        assert_eq!(
            predicates[1],
            QueryPredicate::Field(FieldPredicate::equals(NAME_INDEX, "wh-gold"))
        );
        assert_eq!(
            predicates[2],
            QueryPredicate::Field(FieldPredicate {
                key: "region".into(),
                op: FieldOp::NotEquals,
                value: "us-west-1".into(),
            })
        );
        let QueryPredicate::Labels(labels) = &predicates[3] else {
            panic!("expected a label predicate");
        };
        assert_eq!(labels.requirements.len(), 2);

        let matching = BTreeMap::from([
            ("tier".to_string(), "gold".to_string()),
            ("env".to_string(), "us-west-1".to_string()),
        ]);
        assert!(labels.matches(&matching));
        let other = BTreeMap::from([("tier".to_string(), "gold".to_string())]);
        assert!(!labels.matches(&other));
    }

    #[test]
    fn non_string_values_are_rejected() {
        let c = criteria(json!({
            "indexSelector": {"matchIndices": [
                {"key": "n", "operator": "Equal", "value": "${{ request.body.n }}"}
            ]}
        }));
        let err = build(&TemplateEvaluator, "proj", &c, &env()).unwrap_err();
        assert!(matches!(err, SelectorError::Expression { .. }), "{err}");
    }

    #[test]
    fn unsupported_operators_fail_fast() {
        let c = criteria(json!({
            "indexSelector": {"matchIndices": [{"key": "a", "operator": "GreaterThan", "value": "1"}]}
        }));
        assert!(matches!(
            build(&TemplateEvaluator, "proj", &c, &env()),
            Err(SelectorError::UnsupportedIndexOperator(op)) if op == "GreaterThan"
        ));

        let c = criteria(json!({
            "labelSelector": {"matchExpressions": [{"key": "a", "operator": "Gt", "values": ["1"]}]}
        }));
        assert!(matches!(
            build(&TemplateEvaluator, "proj", &c, &env()),
            Err(SelectorError::UnsupportedLabelOperator(op)) if op == "Gt"
        ));
    }

    #[test]
    fn requirement_errors_propagate() {
        let c = criteria(json!({
            "labelSelector": {"matchExpressions": [{"key": "a", "operator": "In", "values": []}]}
        }));
        assert!(matches!(
            build(&TemplateEvaluator, "proj", &c, &env()),
            Err(SelectorError::InvalidRequirement(_))
        ));

        let c = criteria(json!({
            "labelSelector": {"matchExpressions": [{"key": "a", "operator": "Exists", "values": ["x"]}]}
        }));
        assert!(build(&TemplateEvaluator, "proj", &c, &env()).is_err());
    }

    #[test]
    fn requirement_semantics() {
        let labels = BTreeMap::from([("team".to_string(), "a".to_string())]);
        let not_in = LabelRequirement::new("team", LabelOp::NotIn, ["b".to_string()]).unwrap();
        assert!(not_in.matches(&labels));
        assert!(not_in.matches(&BTreeMap::new()));
        let missing = LabelRequirement::new("owner", LabelOp::DoesNotExist, []).unwrap();
        assert!(missing.matches(&labels));
        assert!(LabelRequirement::new("example.com/team", LabelOp::Exists, []).is_ok());
        assert!(LabelRequirement::new("bad key", LabelOp::Exists, []).is_err());
    }
}
