//! Parameter and output schemas for capability operations.

use serde::{Deserialize, Serialize};

/// JSON type accepted by a capability parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    #[default]
    Any,
}

impl ParamType {
    /// Returns true if a literal value plausibly matches this type.
    ///
    /// Scalars are accepted for `string` because providers commonly
    /// stringify ids and counters.
    pub fn accepts(&self, value: &serde_json::Value) -> bool {
        use serde_json::Value;

        match self {
            ParamType::Any => true,
            ParamType::String => matches!(
                value,
                Value::String(_) | Value::Number(_) | Value::Bool(_)
            ),
            ParamType::Number => value.is_number(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Object => value.is_object(),
            ParamType::Array => value.is_array(),
        }
    }
}

impl std::fmt::Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Integer => "integer",
            ParamType::Boolean => "boolean",
            ParamType::Object => "object",
            ParamType::Array => "array",
            ParamType::Any => "any",
        };
        write!(f, "{}", s)
    }
}

/// A single declared parameter of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Parameter name as the provider expects it.
    pub name: String,

    /// Expected JSON type.
    #[serde(rename = "type", default)]
    pub param_type: ParamType,

    /// Whether the provider rejects calls without this parameter.
    #[serde(default)]
    pub required: bool,

    /// Marks the parameter that receives rendered content on delivery operations.
    #[serde(default)]
    pub accepts_content: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ParameterSpec {
    pub fn required(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: true,
            accepts_content: false,
            description: None,
        }
    }

    pub fn optional(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type)
        }
    }

    /// Mark this parameter as the content sink of a delivery operation.
    pub fn content(mut self) -> Self {
        self.accepts_content = true;
        self
    }
}

/// Declared parameters of an operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParametersSchema {
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
}

impl ParametersSchema {
    pub fn new(parameters: Vec<ParameterSpec>) -> Self {
        Self { parameters }
    }

    pub fn get(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn required(&self) -> impl Iterator<Item = &ParameterSpec> {
        self.parameters.iter().filter(|p| p.required)
    }

    /// The parameter flagged as the content sink, if exactly one is declared.
    pub fn content_parameter(&self) -> Option<&ParameterSpec> {
        let mut content = self.parameters.iter().filter(|p| p.accepts_content);
        match (content.next(), content.next()) {
            (Some(p), None) => Some(p),
            _ => None,
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.parameters.iter().map(|p| p.name.as_str()).collect()
    }
}

/// Shape of the data an operation returns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputSchema {
    /// Field of the result object that carries the record array, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_field: Option<String>,

    /// Known top-level fields of the result.
    #[serde(default)]
    pub fields: Vec<String>,
}

impl OutputSchema {
    pub fn with_items_field(field: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            fields: vec![field.clone()],
            items_field: Some(field),
        }
    }
}

/// Resolved schema of one `(plugin_key, operation_type)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSchema {
    pub plugin_key: String,
    pub operation_type: String,
    #[serde(default)]
    pub parameters_schema: ParametersSchema,
    #[serde(default)]
    pub output_schema: OutputSchema,
}

impl OperationSchema {
    pub fn new(plugin_key: impl Into<String>, operation_type: impl Into<String>) -> Self {
        Self {
            plugin_key: plugin_key.into(),
            operation_type: operation_type.into(),
            parameters_schema: ParametersSchema::default(),
            output_schema: OutputSchema::default(),
        }
    }

    pub fn with_parameters(mut self, parameters: Vec<ParameterSpec>) -> Self {
        self.parameters_schema = ParametersSchema::new(parameters);
        self
    }

    pub fn with_output(mut self, output: OutputSchema) -> Self {
        self.output_schema = output;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_param_type_accepts() {
        assert!(ParamType::String.accepts(&json!("a@x.com")));
        assert!(ParamType::String.accepts(&json!(42)));
        assert!(!ParamType::String.accepts(&json!({"a": 1})));
        assert!(ParamType::Integer.accepts(&json!(7)));
        assert!(!ParamType::Integer.accepts(&json!(7.5)));
        assert!(ParamType::Array.accepts(&json!([])));
        assert!(ParamType::Any.accepts(&json!(null)));
    }

    #[test]
    fn test_content_parameter() {
        let schema = ParametersSchema::new(vec![
            ParameterSpec::required("to", ParamType::String),
            ParameterSpec::required("body", ParamType::String).content(),
        ]);
        assert_eq!(schema.content_parameter().map(|p| p.name.as_str()), Some("body"));
        assert_eq!(schema.required().count(), 2);
    }

    #[test]
    fn test_ambiguous_content_parameter() {
        let schema = ParametersSchema::new(vec![
            ParameterSpec::optional("html", ParamType::String).content(),
            ParameterSpec::optional("text", ParamType::String).content(),
        ]);
        assert!(schema.content_parameter().is_none());
    }

    #[test]
    fn test_schema_deserialization() {
        let schema: OperationSchema = serde_json::from_value(json!({
            "plugin_key": "google-sheets",
            "operation_type": "read_range",
            "parameters_schema": {
                "parameters": [{"name": "spreadsheet_id", "type": "string", "required": true}]
            },
            "output_schema": {"items_field": "rows", "fields": ["rows"]}
        }))
        .unwrap();

        assert_eq!(schema.parameters_schema.parameters[0].param_type, ParamType::String);
        assert_eq!(schema.output_schema.items_field.as_deref(), Some("rows"));
    }
}
