//! Declarative intermediate representation.
//!
//! The IR is produced upstream with exact, grounded field names. The
//! compiler never guesses field names or capabilities beyond what is
//! written here.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::workflow::condition::Condition;

fn default_ir_version() -> String {
    "1.0".to_string()
}

/// Root intent object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclarativeIR {
    #[serde(default = "default_ir_version")]
    pub ir_version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,

    pub data_sources: Vec<DataSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<FilterSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deduplication: Option<DeduplicationRule>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grouping: Option<GroupingRule>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ai_operations: Vec<AiOperation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendering: Option<RenderingRule>,

    pub delivery_rules: DeliveryRules,
}

impl DeclarativeIR {
    /// Primary sources with their position in `data_sources`.
    pub fn primary_sources(&self) -> impl Iterator<Item = (usize, &DataSource)> {
        self.data_sources
            .iter()
            .enumerate()
            .filter(|(_, s)| s.role == SourceRole::Primary)
    }

    /// The reference source used for deduplication, if any.
    pub fn reference_source(&self) -> Option<(usize, &DataSource)> {
        self.data_sources
            .iter()
            .enumerate()
            .find(|(_, s)| s.role == SourceRole::Reference)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceRole {
    /// Candidate records flowing to delivery.
    #[default]
    Primary,
    /// Already-processed records used as the deduplication set.
    Reference,
}

/// A read against a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename = "type", default)]
    pub source_type: String,

    #[serde(default)]
    pub role: SourceRole,

    pub plugin_key: String,
    pub operation_type: String,

    /// Resolved capability parameters, passed through verbatim.
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
}

/// Either a full condition tree or the keyword shorthand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterSpec {
    Condition(Condition),
    Keywords { keywords: Vec<String>, field: String },
}

impl FilterSpec {
    /// Lower to a condition tree. Keywords become one membership test.
    pub fn to_condition(&self) -> Condition {
        match self {
            FilterSpec::Condition(c) => c.clone(),
            FilterSpec::Keywords { keywords, field } => Condition::keywords(field.clone(), keywords),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeduplicationRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier_field: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier_fields: Option<Vec<String>>,

    /// Field of reference records holding the key, when it differs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_field: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window_hours: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_field: Option<String>,
}

impl DeduplicationRule {
    /// Key fields of candidate items, single or composite.
    pub fn key_fields(&self) -> Option<Vec<String>> {
        match (&self.identifier_field, &self.identifier_fields) {
            (_, Some(fields)) if !fields.is_empty() => Some(fields.clone()),
            (Some(field), _) => Some(vec![field.clone()]),
            _ => None,
        }
    }

    /// Key fields of reference records. A single `reference_field` applies
    /// only to single-field keys.
    pub fn reference_fields(&self) -> Option<Vec<String>> {
        let keys = self.key_fields()?;
        match &self.reference_field {
            Some(field) if keys.len() == 1 => Some(vec![field.clone()]),
            _ => Some(keys),
        }
    }

    pub fn time_window(&self) -> Option<(f64, &str)> {
        match (self.time_window_hours, self.timestamp_field.as_deref()) {
            (Some(hours), Some(field)) => Some((hours, field)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupingRule {
    pub group_by: String,
}

/// An AI-assisted step (summarize, classify, extract) backed by a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiOperation {
    #[serde(rename = "type")]
    pub op_type: String,

    pub plugin_key: String,
    pub operation_type: String,

    #[serde(default)]
    pub instruction: String,

    /// Run once per item instead of once over the whole set.
    #[serde(default)]
    pub per_item: bool,

    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_param: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderType {
    Template,
    HtmlTable,
    PlainList,
    #[default]
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderingRule {
    #[serde(rename = "type", default)]
    pub render_type: RenderType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,

    #[serde(default)]
    pub per_item: bool,
}

/// A delivery target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub plugin_key: String,
    pub operation_type: String,

    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,

    /// Parameter that receives the rendered content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_param: Option<String>,
}

impl Destination {
    pub fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}.{}", self.plugin_key, self.operation_type))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_delivery: Option<Destination>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_item_delivery: Option<Destination>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_group_delivery: Option<Destination>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub multiple_destinations: Vec<Destination>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

impl DeliveryRules {
    pub fn is_empty(&self) -> bool {
        self.summary_delivery.is_none()
            && self.per_item_delivery.is_none()
            && self.per_group_delivery.is_none()
            && self.multiple_destinations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::condition::ConditionOperator;
    use serde_json::json;

    #[test]
    fn test_keyword_filter_shorthand() {
        let spec: FilterSpec =
            serde_json::from_value(json!({"keywords": ["invoice", "receipt"], "field": "subject"}))
                .unwrap();
        match spec.to_condition() {
            Condition::Simple(leaf) => {
                assert_eq!(leaf.field, "subject");
                assert_eq!(leaf.operator, ConditionOperator::ContainsAny);
            }
            Condition::Complex(_) => panic!("expected single leaf"),
        }
    }

    #[test]
    fn test_condition_filter() {
        let spec: FilterSpec = serde_json::from_value(json!({
            "type": "simple", "field": "amount", "operator": "gt", "value": 100
        }))
        .unwrap();
        assert!(matches!(spec, FilterSpec::Condition(Condition::Simple(_))));
    }

    #[test]
    fn test_dedup_key_fields() {
        let single = DeduplicationRule {
            identifier_field: Some("id".to_string()),
            reference_field: Some("message_id".to_string()),
            ..Default::default()
        };
        assert_eq!(single.key_fields(), Some(vec!["id".to_string()]));
        assert_eq!(single.reference_fields(), Some(vec!["message_id".to_string()]));

        let composite = DeduplicationRule {
            identifier_fields: Some(vec!["email".to_string(), "date".to_string()]),
            reference_field: Some("ignored".to_string()),
            ..Default::default()
        };
        assert_eq!(composite.key_fields().map(|k| k.len()), Some(2));
        assert_eq!(composite.reference_fields(), composite.key_fields());

        let window = DeduplicationRule {
            time_window_hours: Some(24.0),
            timestamp_field: Some("received_at".to_string()),
            ..Default::default()
        };
        assert!(window.key_fields().is_none());
        assert_eq!(window.time_window(), Some((24.0, "received_at")));
    }

    #[test]
    fn test_source_roles() {
        let ir: DeclarativeIR = serde_json::from_value(json!({
            "data_sources": [
                {"type": "sheet", "role": "reference", "plugin_key": "s", "operation_type": "read"},
                {"type": "mail", "plugin_key": "m", "operation_type": "search"}
            ],
            "delivery_rules": {}
        }))
        .unwrap();

        assert_eq!(ir.ir_version, "1.0");
        assert_eq!(ir.primary_sources().map(|(i, _)| i).collect::<Vec<_>>(), vec![1]);
        assert_eq!(ir.reference_source().map(|(i, _)| i), Some(0));
        assert!(ir.delivery_rules.is_empty());
    }
}
