//! Condition evaluator.
//!
//! Pure and state free: the result depends only on the condition and the
//! values its field paths resolve to. Dispatch is on the node variant, so a
//! complex node never looks at leaf fields and a leaf never looks at
//! children.

use std::cmp::Ordering;

use agentpilot_compiler::workflow::{
    Combinator, ComplexCondition, Condition, ConditionOperator, SimpleCondition,
};
use serde_json::Value;

use crate::error::{type_name, ConditionError};

/// Where condition field paths are looked up.
pub trait FieldSource {
    /// Value at a dotted path, `None` when any segment is missing.
    fn field(&self, path: &str) -> Option<Value>;
}

/// Paths into a single JSON value (a filter item).
impl FieldSource for Value {
    fn field(&self, path: &str) -> Option<Value> {
        let mut current = self;
        for segment in path.split('.') {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current.clone())
    }
}

pub fn evaluate(condition: &Condition, source: &dyn FieldSource) -> Result<bool, ConditionError> {
    match condition {
        Condition::Simple(simple) => evaluate_simple(simple, source),
        Condition::Complex(complex) => evaluate_complex(complex, source),
    }
}

fn evaluate_complex(
    complex: &ComplexCondition,
    source: &dyn FieldSource,
) -> Result<bool, ConditionError> {
    match complex.combinator {
        Combinator::And => {
            for child in &complex.children {
                if !evaluate(child, source)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Combinator::Or => {
            for child in &complex.children {
                if evaluate(child, source)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Combinator::Not => match complex.children.as_slice() {
            [only] => Ok(!evaluate(only, source)?),
            children => Err(ConditionError::NotArity(children.len())),
        },
    }
}

fn evaluate_simple(
    simple: &SimpleCondition,
    source: &dyn FieldSource,
) -> Result<bool, ConditionError> {
    let op = simple.operator;
    let expected = &simple.value;
    let ci = simple.case_insensitive;

    let list = if op.expects_list() {
        match expected {
            Value::Array(items) => Some(items),
            other => {
                return Err(ConditionError::ExpectedList {
                    operator: op.as_str().to_string(),
                    found: type_name(other).to_string(),
                })
            }
        }
    } else {
        None
    };

    let actual = source.field(&simple.field).filter(|v| !v.is_null());

    let result = match op {
        ConditionOperator::Exists => actual.is_some(),
        ConditionOperator::NotExists => actual.is_none(),
        ConditionOperator::Eq => match &actual {
            Some(a) => loose_eq(a, expected, ci),
            None => expected.is_null(),
        },
        ConditionOperator::Ne => match &actual {
            Some(a) => !loose_eq(a, expected, ci),
            None => !expected.is_null(),
        },
        ConditionOperator::Gt => compare(actual.as_ref(), expected, ci) == Some(Ordering::Greater),
        ConditionOperator::Gte => matches!(
            compare(actual.as_ref(), expected, ci),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        ConditionOperator::Lt => compare(actual.as_ref(), expected, ci) == Some(Ordering::Less),
        ConditionOperator::Lte => matches!(
            compare(actual.as_ref(), expected, ci),
            Some(Ordering::Less | Ordering::Equal)
        ),
        ConditionOperator::Contains => actual
            .as_ref()
            .map(|a| contains(a, expected, ci))
            .unwrap_or(false),
        ConditionOperator::NotContains => !actual
            .as_ref()
            .map(|a| contains(a, expected, ci))
            .unwrap_or(false),
        ConditionOperator::ContainsAny => match (&actual, list) {
            (Some(a), Some(needles)) => needles.iter().any(|n| contains(a, n, ci)),
            _ => false,
        },
        ConditionOperator::StartsWith => text_pair(actual.as_ref(), expected, ci)
            .map(|(a, e)| a.starts_with(&e))
            .unwrap_or(false),
        ConditionOperator::EndsWith => text_pair(actual.as_ref(), expected, ci)
            .map(|(a, e)| a.ends_with(&e))
            .unwrap_or(false),
        ConditionOperator::In => match (&actual, list) {
            (Some(a), Some(members)) => members.iter().any(|m| loose_eq(a, m, ci)),
            _ => false,
        },
        ConditionOperator::NotIn => match (&actual, list) {
            (Some(a), Some(members)) => !members.iter().any(|m| loose_eq(a, m, ci)),
            _ => true,
        },
    };
    Ok(result)
}

/// String form used for loose comparisons.
pub(crate) fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn fold(s: String, ci: bool) -> String {
    if ci {
        s.to_lowercase()
    } else {
        s
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Equality that tolerates `"3" == 3` and optional case folding.
fn loose_eq(actual: &Value, expected: &Value, ci: bool) -> bool {
    if actual == expected {
        return true;
    }
    if let (Some(a), Some(e)) = (as_number(actual), as_number(expected)) {
        if actual.is_number() || expected.is_number() {
            return a == e;
        }
    }
    match (as_text(actual), as_text(expected)) {
        (Some(a), Some(e)) => fold(a, ci) == fold(e, ci),
        _ => false,
    }
}

fn compare(actual: Option<&Value>, expected: &Value, ci: bool) -> Option<Ordering> {
    let actual = actual?;
    if let (Some(a), Some(e)) = (as_number(actual), as_number(expected)) {
        return a.partial_cmp(&e);
    }
    match (actual, expected) {
        (Value::String(a), Value::String(e)) => {
            Some(fold(a.clone(), ci).cmp(&fold(e.clone(), ci)))
        }
        _ => None,
    }
}

fn contains(actual: &Value, needle: &Value, ci: bool) -> bool {
    match actual {
        Value::Array(items) => items.iter().any(|i| loose_eq(i, needle, ci)),
        Value::Object(map) => as_text(needle).map(|k| map.contains_key(&k)).unwrap_or(false),
        other => match (as_text(other), as_text(needle)) {
            (Some(a), Some(n)) => fold(a, ci).contains(&fold(n, ci)),
            _ => false,
        },
    }
}

fn text_pair(actual: Option<&Value>, expected: &Value, ci: bool) -> Option<(String, String)> {
    let a = as_text(actual?)?;
    let e = as_text(expected)?;
    Some((fold(a, ci), fold(e, ci)))
}
