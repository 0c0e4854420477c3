use super::*;
use crate::workflow::*;
use agentpilot_tools::{CapabilityRegistry, OperationSchema, RecordingSink, StaticSource};
use serde_json::json;
use std::collections::BTreeMap;

fn action(id: &str, plugin: &str, op: &str, params: serde_json::Value) -> WorkflowStep {
    let params: BTreeMap<String, serde_json::Value> = serde_json::from_value(params).unwrap();
    WorkflowStep::new(
        id,
        format!("{} {}", plugin, op),
        StepKind::Action(ActionStep {
            plugin_key: plugin.to_string(),
            operation_type: op.to_string(),
            params,
            fail_fast: false,
        }),
    )
}

fn registry() -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    registry.register(
        StaticSource::new("sheets").with_operation(OperationSchema::new("", "read"), json!([])),
    );
    registry.register(RecordingSink::email("mail"));
    registry
}

#[test]
fn test_validator_registers_all_rules() {
    assert_eq!(
        Validator::new().rule_ids(),
        vec![
            "action-transform-separation",
            "transform-input",
            "unresolved-reference",
            "missing-dependency",
            "dag-integrity",
            "capability-params",
        ]
    );
}

#[test]
fn test_auto_fix_splits_and_adds_dependencies() {
    let workflow = Workflow::new(
        vec![
            action("step1", "sheets", "read", json!({})),
            // No declared dependency and an embedded filter with explicit input.
            action(
                "step2",
                "mail",
                "send_email",
                json!({
                    "to": "a@x.com",
                    "body": {"input": "{{step1.data}}", "condition": {
                        "type": "simple", "field": "status", "operator": "eq", "value": "new"
                    }}
                }),
            ),
        ],
        WorkflowMetadata::default(),
    );

    let registry = registry();
    let validator = Validator::new().with_catalog(&registry);
    let report = validator.validate(&workflow, true);

    assert!(report.valid, "issues: {:?}", report.issues);
    let fixed = report.fixed_workflow.clone().unwrap();
    assert_eq!(fixed.step_ids(), vec!["step1", "step2", "step3"]);
    assert!(fixed.steps[1].dependencies.contains("step1"));
    assert!(fixed.steps[2].dependencies.contains("step2"));
    assert!(report.issues.iter().all(|i| !i.is_blocking()));
    assert!(report.issues.iter().any(|i| i.fixed));

    // Validating the repaired graph changes nothing further.
    let again = validator.validate(&fixed, true);
    assert!(again.valid);
    assert!(again.fixed_workflow.is_none());
}

#[test]
fn test_without_auto_fix_issues_block() {
    let workflow = Workflow::new(
        vec![
            action("step1", "sheets", "read", json!({})),
            action(
                "step2",
                "mail",
                "send_email",
                json!({"to": "a@x.com", "body": {"expression": "item.name"}}),
            )
            .depends_on(["step1"]),
        ],
        WorkflowMetadata::default(),
    );

    let report = validate(&workflow, false);
    assert!(!report.valid);
    assert!(report.fixed_workflow.is_none());
    assert_eq!(report.errors().count(), 1);
}

#[test]
fn test_forward_reference_rejected_before_execution() {
    let workflow = Workflow::new(
        vec![
            action("step1", "sheets", "read", json!({})),
            action("step2", "mail", "send_email", json!({"to": "a", "body": "{{step3.data}}"}))
                .depends_on(["step3"]),
            action("step3", "sheets", "read", json!({})),
        ],
        WorkflowMetadata::default(),
    );

    let report = validate(&workflow, true);
    assert!(!report.valid);
    let rules: Vec<&str> = report.errors().map(|i| i.rule_id.as_str()).collect();
    assert!(rules.contains(&"dag-integrity"));
    assert!(rules.contains(&"unresolved-reference"));
}

#[test]
fn test_issue_display() {
    let issue = ValidationIssue::error("dag-integrity", Some("step2"), "depends on unknown step 'x'")
        .with_alternatives(vec!["step1".to_string()]);
    assert_eq!(
        issue.to_string(),
        "error at step2: depends on unknown step 'x' [dag-integrity] valid: step1"
    );
}

#[test]
fn test_report_serializes() {
    let report = validate(&Workflow::default(), false);
    let value = serde_json::to_value(&report).unwrap();
    assert_eq!(value, json!({"valid": true, "issues": []}));
}
