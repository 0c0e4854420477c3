//! Static data source capability.

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::ProviderError;
use crate::registry::Capability;
use crate::schema::OperationSchema;

/// Capability returning a fixed payload per operation.
#[derive(Debug, Clone)]
pub struct StaticSource {
    plugin_key: String,
    operations: BTreeMap<String, (OperationSchema, serde_json::Value)>,
}

impl StaticSource {
    pub fn new(plugin_key: impl Into<String>) -> Self {
        Self {
            plugin_key: plugin_key.into(),
            operations: BTreeMap::new(),
        }
    }

    /// Add an operation that always answers with `data`.
    pub fn with_operation(mut self, schema: OperationSchema, data: serde_json::Value) -> Self {
        let schema = OperationSchema {
            plugin_key: self.plugin_key.clone(),
            ..schema
        };
        self.operations
            .insert(schema.operation_type.clone(), (schema, data));
        self
    }
}

#[async_trait]
impl Capability for StaticSource {
    fn plugin_key(&self) -> &str {
        &self.plugin_key
    }

    fn operations(&self) -> Vec<OperationSchema> {
        self.operations.values().map(|(s, _)| s.clone()).collect()
    }

    async fn execute(
        &self,
        operation_type: &str,
        _params: &serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError> {
        self.operations
            .get(operation_type)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| ProviderError::OperationNotFound {
                plugin_key: self.plugin_key.clone(),
                operation_type: operation_type.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_static_source_returns_payload() {
        let source = StaticSource::new("mock-sheets").with_operation(
            OperationSchema::new("ignored", "read_range"),
            json!({"rows": [{"id": "1"}]}),
        );

        assert_eq!(source.operations()[0].plugin_key, "mock-sheets");
        let data = source.execute("read_range", &json!({})).await.unwrap();
        assert_eq!(data["rows"][0]["id"], "1");
    }

    #[test]
    fn test_static_source_unknown_operation() {
        let source = StaticSource::new("mock-sheets");
        let err = tokio_test::block_on(source.execute("write_range", &json!({}))).unwrap_err();
        assert!(err.is_unresolved());
    }
}
