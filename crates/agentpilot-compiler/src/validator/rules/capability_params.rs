//! Rule: Capability Parameters
//!
//! Action params are checked against the capability's declared schema:
//! required params present, literal values of a plausible type, and no
//! undeclared params. Missing params are reported, never filled in.
//! Skipped when the validator has no catalog.

use crate::validator::{RuleContext, ValidationIssue, ValidationRule};
use crate::workflow::{reference, StepKind, Workflow, WorkflowStep};

pub struct CapabilityParamsRule;

fn check(
    steps: &[WorkflowStep],
    rule_id: &str,
    ctx: &RuleContext<'_>,
    issues: &mut Vec<ValidationIssue>,
) {
    let Some(catalog) = ctx.catalog else {
        return;
    };

    for step in steps {
        if let StepKind::Action(action) = &step.kind {
            match catalog.resolve(&action.plugin_key, &action.operation_type) {
                Err(e) => issues.push(ValidationIssue::error(
                    rule_id,
                    Some(&step.id),
                    format!(
                        "capability {}.{} cannot be resolved: {}",
                        action.plugin_key, action.operation_type, e
                    ),
                )),
                Ok(schema) => {
                    let declared = &schema.parameters_schema;

                    for spec in declared.required() {
                        if !action.params.contains_key(&spec.name) {
                            issues.push(
                                ValidationIssue::error(
                                    rule_id,
                                    Some(&step.id),
                                    format!("missing required parameter '{}'", spec.name),
                                )
                                .with_alternatives(
                                    declared.names().into_iter().map(str::to_string).collect(),
                                ),
                            );
                        }
                    }

                    for (name, value) in &action.params {
                        match declared.get(name) {
                            // Schemas without parameters declare nothing to compare against.
                            None if !declared.parameters.is_empty() => issues.push(
                                ValidationIssue::warning(
                                    rule_id,
                                    Some(&step.id),
                                    format!("parameter '{}' is not declared by the capability", name),
                                )
                                .with_alternatives(
                                    declared.names().into_iter().map(str::to_string).collect(),
                                ),
                            ),
                            None => {}
                            Some(spec) => {
                                let is_reference = value
                                    .as_str()
                                    .map(reference::is_template)
                                    .unwrap_or(false);
                                if !is_reference && !spec.param_type.accepts(value) {
                                    issues.push(ValidationIssue::error(
                                        rule_id,
                                        Some(&step.id),
                                        format!(
                                            "parameter '{}' expects {}, got {}",
                                            name,
                                            spec.param_type,
                                            json_type_name(value)
                                        ),
                                    ));
                                }
                            }
                        }
                    }
                }
            }
        }

        for body in step.bodies() {
            check(body, rule_id, ctx, issues);
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

impl ValidationRule for CapabilityParamsRule {
    fn id(&self) -> &'static str {
        "capability-params"
    }

    fn description(&self) -> &'static str {
        "Action params must match the capability's parameter schema"
    }

    fn validate(&self, workflow: &Workflow, ctx: &RuleContext<'_>) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        check(&workflow.steps, self.id(), ctx, &mut issues);
        issues
    }
}
