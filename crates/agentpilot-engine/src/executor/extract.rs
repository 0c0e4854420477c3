//! Input extraction for transforms and scatter steps.
//!
//! Compiled workflows reference either a field path (`{{step2.data.items}}`)
//! or a whole step (`{{step2}}`, `{{step2.data}}`). Both forms resolve to a
//! usable input here, identically for top-level transforms and scatter
//! bodies.

use serde_json::Value;

use agentpilot_compiler::workflow::TransformOperation;

use crate::error::{type_name, TransformError};
use crate::output::StepOutput;

/// Array fields tried first, in order, when an object stands in for an array.
pub const CANONICAL_ARRAY_FIELDS: [&str; 5] = ["filtered", "items", "results", "data", "rows"];

/// `.data` of a serialized step output, the value itself otherwise.
pub fn unwrap_output(value: Value) -> Value {
    if StepOutput::is_output_shaped(&value) {
        match value {
            Value::Object(mut map) => map.remove("data").unwrap_or(Value::Null),
            other => other,
        }
    } else {
        value
    }
}

/// The array an array-requiring operation works on.
///
/// An object yields its first array-valued field, canonical names first,
/// then the remaining fields in key order.
pub fn array_input(operation: &str, value: Value) -> Result<Vec<Value>, TransformError> {
    match unwrap_output(value) {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => {
            let field = CANONICAL_ARRAY_FIELDS
                .iter()
                .map(|f| f.to_string())
                .find(|f| matches!(map.get(f), Some(Value::Array(_))))
                .or_else(|| {
                    map.iter()
                        .find(|(_, v)| v.is_array())
                        .map(|(k, _)| k.clone())
                });
            match field.and_then(|f| map.remove(&f)) {
                Some(Value::Array(items)) => Ok(items),
                _ => Err(TransformError::NoArrayField {
                    operation: operation.to_string(),
                    available: map.keys().cloned().collect(),
                }),
            }
        }
        other => Err(TransformError::NotAnArray {
            operation: operation.to_string(),
            found: type_name(&other).to_string(),
        }),
    }
}

/// Input of a transform: an array for array operations, the unwrapped
/// value for the others.
pub fn transform_input(operation: TransformOperation, value: Value) -> Result<Value, TransformError> {
    if operation.requires_array() {
        array_input(operation.as_str(), value).map(Value::Array)
    } else {
        Ok(unwrap_output(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn whole_step(data: Value) -> Value {
        serde_json::to_value(StepOutput::success("step2", "sheets", "read", data, 0)).unwrap()
    }

    #[test]
    fn test_prefers_filtered_over_items() {
        let value = whole_step(json!({"items": [1, 2, 3], "filtered": [2]}));
        let items = transform_input(TransformOperation::Filter, value).unwrap();
        assert_eq!(items, json!([2]));
    }

    #[test]
    fn test_step_reference_without_metadata() {
        let value = json!({"stepId": "step2", "data": {"items": [1, 2, 3], "filtered": [2]}});
        let items = transform_input(TransformOperation::Filter, value).unwrap();
        assert_eq!(items, json!([2]));
    }

    #[test]
    fn test_data_array_used_directly() {
        let value = whole_step(json!([{"id": 1}]));
        assert_eq!(array_input("map", value).unwrap(), vec![json!({"id": 1})]);
    }

    #[test]
    fn test_non_canonical_array_field() {
        let value = json!({"count": 2, "messages": [{"id": "a"}]});
        assert_eq!(array_input("sort", value).unwrap().len(), 1);
    }

    #[test]
    fn test_no_array_field_lists_fields() {
        let value = whole_step(json!({"count": 2, "status": "ok"}));
        assert_eq!(
            transform_input(TransformOperation::Map, value).unwrap_err(),
            TransformError::NoArrayField {
                operation: "map".to_string(),
                available: vec!["count".to_string(), "status".to_string()],
            }
        );
    }

    #[test]
    fn test_pass_through_for_value_operations() {
        let value = whole_step(json!({"count": 2}));
        assert_eq!(
            transform_input(TransformOperation::Set, value).unwrap(),
            json!({"count": 2})
        );
        assert_eq!(
            transform_input(TransformOperation::Join, json!("plain")).unwrap(),
            json!("plain")
        );
    }

    #[test]
    fn test_scalar_is_not_an_array() {
        assert_eq!(
            array_input("flatten", json!(3)).unwrap_err(),
            TransformError::NotAnArray {
                operation: "flatten".to_string(),
                found: "number".to_string(),
            }
        );
    }
}
