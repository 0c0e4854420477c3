//! IR document parser.
//!
//! Accepts JSON or YAML. Structural checks that serde cannot express are
//! applied after deserialization.

use crate::error::{CompilationError, CompileResult};
use crate::ir::types::{DeclarativeIR, FilterSpec, RenderType};

/// Parse an IR document, detecting JSON or YAML by content.
pub fn parse_ir(content: &str) -> CompileResult<DeclarativeIR> {
    let trimmed = content.trim_start();
    let ir: DeclarativeIR = if trimmed.starts_with('{') {
        serde_json::from_str(trimmed)?
    } else {
        serde_yaml::from_str(content)?
    };

    validate_ir(&ir)?;
    Ok(ir)
}

/// Validate a deserialized IR.
pub fn validate_ir(ir: &DeclarativeIR) -> CompileResult<()> {
    if ir.data_sources.is_empty() {
        return Err(CompilationError::missing("ir", "data_sources"));
    }

    if ir.primary_sources().next().is_none() {
        return Err(CompilationError::InvalidIr(
            "at least one data source must have role 'primary'".to_string(),
        ));
    }

    let reference_count = ir
        .data_sources
        .iter()
        .filter(|s| s.role == crate::ir::types::SourceRole::Reference)
        .count();
    if reference_count > 1 {
        return Err(CompilationError::InvalidIr(format!(
            "expected at most one reference data source, found {}",
            reference_count
        )));
    }

    for (idx, source) in ir.data_sources.iter().enumerate() {
        if source.plugin_key.is_empty() || source.operation_type.is_empty() {
            return Err(CompilationError::missing(
                format!("data_sources[{}]", idx),
                "plugin_key/operation_type",
            ));
        }
    }

    if let Some(FilterSpec::Keywords { keywords, field }) = &ir.filters {
        if keywords.is_empty() {
            return Err(CompilationError::missing("filters", "keywords"));
        }
        if field.is_empty() {
            return Err(CompilationError::missing("filters", "field"));
        }
    }

    if let Some(dedup) = &ir.deduplication {
        if dedup.identifier_field.is_some() && dedup.identifier_fields.is_some() {
            return Err(CompilationError::InvalidIr(
                "deduplication: identifier_field and identifier_fields are mutually exclusive"
                    .to_string(),
            ));
        }
        match (dedup.time_window_hours, &dedup.timestamp_field) {
            (Some(_), None) => {
                return Err(CompilationError::missing("deduplication", "timestamp_field"))
            }
            (None, Some(_)) => {
                return Err(CompilationError::missing("deduplication", "time_window_hours"))
            }
            (Some(hours), Some(_)) if hours <= 0.0 => {
                return Err(CompilationError::InvalidIr(format!(
                    "deduplication: time_window_hours must be positive, got {}",
                    hours
                )))
            }
            _ => {}
        }
        if dedup.key_fields().is_none() && dedup.time_window().is_none() {
            return Err(CompilationError::missing(
                "deduplication",
                "identifier_field|identifier_fields|time_window_hours",
            ));
        }
    }

    if let Some(grouping) = &ir.grouping {
        if grouping.group_by.is_empty() {
            return Err(CompilationError::missing("grouping", "group_by"));
        }
    }

    if let Some(rendering) = &ir.rendering {
        match rendering.render_type {
            RenderType::Template if rendering.template.is_none() => {
                return Err(CompilationError::missing("rendering", "template"))
            }
            RenderType::HtmlTable if rendering.columns.is_empty() => {
                return Err(CompilationError::missing("rendering", "columns"))
            }
            _ => {}
        }
    }

    if ir.delivery_rules.is_empty() {
        return Err(CompilationError::missing("delivery_rules", "destination"));
    }

    if ir.delivery_rules.max_concurrency == Some(0) {
        return Err(CompilationError::InvalidIr(
            "delivery_rules.max_concurrency must be at least 1".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const JSON_IR: &str = r#"{
        "goal": "Email me new invoices",
        "data_sources": [
            {"type": "mail", "plugin_key": "google-mail", "operation_type": "search",
             "config": {"query": "has:attachment"}}
        ],
        "filters": {"keywords": ["invoice"], "field": "subject"},
        "delivery_rules": {
            "summary_delivery": {"plugin_key": "google-mail", "operation_type": "send_email",
                                 "config": {"to": "a@x.com"}}
        }
    }"#;

    #[test]
    fn test_parse_json_ir() {
        let ir = parse_ir(JSON_IR).unwrap();
        assert_eq!(ir.data_sources.len(), 1);
        assert_eq!(ir.data_sources[0].config["query"], "has:attachment");
        assert!(ir.filters.is_some());
    }

    #[test]
    fn test_parse_yaml_ir() {
        let yaml = r##"
goal: Post grouped leads
data_sources:
  - type: sheet
    plugin_key: google-sheets
    operation_type: read_range
    config:
      spreadsheet_id: abc
grouping:
  group_by: owner
delivery_rules:
  per_group_delivery:
    plugin_key: slack
    operation_type: post_message
    config:
      channel: "#sales"
"##;
        let ir = parse_ir(yaml).unwrap();
        assert_eq!(ir.grouping.unwrap().group_by, "owner");
        assert!(ir.delivery_rules.per_group_delivery.is_some());
    }

    #[test]
    fn test_missing_delivery() {
        let err = parse_ir(
            r#"{"data_sources": [{"plugin_key": "a", "operation_type": "b"}], "delivery_rules": {}}"#,
        )
        .unwrap_err();
        assert_eq!(err, CompilationError::missing("delivery_rules", "destination"));
    }

    #[test]
    fn test_time_window_requires_timestamp_field() {
        let err = parse_ir(
            r#"{"data_sources": [{"plugin_key": "a", "operation_type": "b"}],
                "deduplication": {"time_window_hours": 24},
                "delivery_rules": {"summary_delivery": {"plugin_key": "m", "operation_type": "send"}}}"#,
        )
        .unwrap_err();
        assert_eq!(err, CompilationError::missing("deduplication", "timestamp_field"));
    }

    #[test]
    fn test_conflicting_identifier_fields() {
        let err = parse_ir(
            r#"{"data_sources": [{"plugin_key": "a", "operation_type": "b"}],
                "deduplication": {"identifier_field": "id", "identifier_fields": ["a", "b"]},
                "delivery_rules": {"summary_delivery": {"plugin_key": "m", "operation_type": "send"}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, CompilationError::InvalidIr(_)));
    }

    #[test]
    fn test_invalid_syntax() {
        let err = parse_ir("{ not json").unwrap_err();
        assert!(matches!(err, CompilationError::Parse(_)));
    }
}
