//! Condition trees used by filters and conditional steps.
//!
//! A node is either a `simple` leaf comparison or a `complex` boolean
//! combination. The `type` tag is the only discriminant; a node never
//! carries both shapes.

use serde::{Deserialize, Serialize};

/// Comparison operator of a simple condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    #[serde(alias = "==", alias = "equals")]
    Eq,
    #[serde(alias = "!=", alias = "not_equals")]
    Ne,
    #[serde(alias = ">", alias = "greater_than")]
    Gt,
    #[serde(alias = ">=")]
    Gte,
    #[serde(alias = "<", alias = "less_than")]
    Lt,
    #[serde(alias = "<=")]
    Lte,
    Contains,
    NotContains,
    /// Field contains at least one entry of a literal list.
    ContainsAny,
    StartsWith,
    EndsWith,
    /// Field value is a member of a literal list.
    In,
    NotIn,
    Exists,
    NotExists,
}

impl ConditionOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionOperator::Eq => "eq",
            ConditionOperator::Ne => "ne",
            ConditionOperator::Gt => "gt",
            ConditionOperator::Gte => "gte",
            ConditionOperator::Lt => "lt",
            ConditionOperator::Lte => "lte",
            ConditionOperator::Contains => "contains",
            ConditionOperator::NotContains => "not_contains",
            ConditionOperator::ContainsAny => "contains_any",
            ConditionOperator::StartsWith => "starts_with",
            ConditionOperator::EndsWith => "ends_with",
            ConditionOperator::In => "in",
            ConditionOperator::NotIn => "not_in",
            ConditionOperator::Exists => "exists",
            ConditionOperator::NotExists => "not_exists",
        }
    }

    /// Operators whose right-hand side must be a literal list.
    pub fn expects_list(&self) -> bool {
        matches!(
            self,
            ConditionOperator::In | ConditionOperator::NotIn | ConditionOperator::ContainsAny
        )
    }
}

impl std::fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Boolean combinator of a complex condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Combinator {
    #[serde(alias = "AND")]
    And,
    #[serde(alias = "OR")]
    Or,
    #[serde(alias = "NOT")]
    Not,
}

/// Leaf comparison `field <operator> value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleCondition {
    /// Dotted path into the evaluated item (array indexes are numeric segments).
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub case_insensitive: bool,
}

/// Boolean combination of child conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexCondition {
    pub combinator: Combinator,
    #[serde(alias = "conditions")]
    pub children: Vec<Condition>,
}

/// Condition tree node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Simple(SimpleCondition),
    Complex(ComplexCondition),
}

impl Condition {
    pub fn simple(
        field: impl Into<String>,
        operator: ConditionOperator,
        value: serde_json::Value,
    ) -> Self {
        Condition::Simple(SimpleCondition {
            field: field.into(),
            operator,
            value,
            case_insensitive: false,
        })
    }

    /// Keyword-OR matching as one membership test against a literal list.
    pub fn keywords(field: impl Into<String>, keywords: &[String]) -> Self {
        Condition::Simple(SimpleCondition {
            field: field.into(),
            operator: ConditionOperator::ContainsAny,
            value: serde_json::Value::Array(
                keywords
                    .iter()
                    .map(|k| serde_json::Value::String(k.clone()))
                    .collect(),
            ),
            case_insensitive: true,
        })
    }

    pub fn all(children: Vec<Condition>) -> Self {
        Condition::Complex(ComplexCondition {
            combinator: Combinator::And,
            children,
        })
    }

    pub fn any(children: Vec<Condition>) -> Self {
        Condition::Complex(ComplexCondition {
            combinator: Combinator::Or,
            children,
        })
    }

    pub fn negate(child: Condition) -> Self {
        Condition::Complex(ComplexCondition {
            combinator: Combinator::Not,
            children: vec![child],
        })
    }

    /// Fields referenced by every leaf, depth-first.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Condition::Simple(leaf) => out.push(leaf.field.as_str()),
            Condition::Complex(node) => {
                for child in &node.children {
                    child.collect_fields(out);
                }
            }
        }
    }
}
