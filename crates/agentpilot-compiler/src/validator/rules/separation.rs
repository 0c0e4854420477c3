//! Rule: Action/Transform Separation
//!
//! Action params carry literals and references only. A param whose value is
//! an object with an `expression` or `condition` key is transform
//! configuration that leaked into the action. The repair moves it into a
//! new transform placed right before the action and points the param at
//! the transform's output.
//!
//! ```json
//! {"type": "action", "dependencies": ["step2"],
//!  "params": {"body": {"condition": {...}}}}
//! ```
//! becomes a `filter` transform over `{{step2.data}}` followed by the
//! action with `"body": "{{<transform>.data}}"`.

use std::collections::BTreeSet;

use crate::validator::{RuleContext, ValidationIssue, ValidationRule};
use crate::workflow::{
    reference, ActionStep, StepKind, TransformOperation, TransformStep, Workflow, WorkflowStep,
};

pub struct ActionTransformSeparationRule;

const CONFIG_KEYS: [&str; 2] = ["expression", "condition"];

/// An embedded transform config found in an action param.
struct Embedded<'a> {
    param: &'a str,
    config: &'a serde_json::Map<String, serde_json::Value>,
}

fn embedded_configs(action: &ActionStep) -> Vec<Embedded<'_>> {
    action
        .params
        .iter()
        .filter_map(|(param, value)| {
            let obj = value.as_object()?;
            CONFIG_KEYS
                .iter()
                .any(|k| obj.contains_key(*k))
                .then_some(Embedded {
                    param: param.as_str(),
                    config: obj,
                })
        })
        .collect()
}

/// Input the extracted transform should read, if it can be inferred.
fn infer_input(step: &WorkflowStep, embedded: &Embedded<'_>) -> Option<String> {
    if let Some(input) = embedded.config.get("input").and_then(|v| v.as_str()) {
        return Some(input.to_string());
    }
    match step.dependencies.len() {
        1 => step.dependencies.iter().next().map(|d| reference::data_ref(d)),
        _ => None,
    }
}

fn infer_operation(config: &serde_json::Map<String, serde_json::Value>) -> TransformOperation {
    config
        .get("operation")
        .and_then(|v| v.as_str())
        .and_then(TransformOperation::from_name)
        .unwrap_or(if config.contains_key("condition") {
            TransformOperation::Filter
        } else {
            TransformOperation::Map
        })
}

fn extracted_id(action_id: &str, param: &str) -> String {
    let param: String = param
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}_{}_transform", action_id, param)
}

fn split_step(step: &WorkflowStep) -> Vec<WorkflowStep> {
    let StepKind::Action(action) = &step.kind else {
        return vec![step.clone()];
    };

    let mut inserted = Vec::new();
    let mut cleaned = step.clone();
    let mut extra_deps = BTreeSet::new();

    for embedded in embedded_configs(action) {
        let Some(input) = infer_input(step, &embedded) else {
            continue;
        };

        let operation = infer_operation(embedded.config);
        let config: serde_json::Map<String, serde_json::Value> = embedded
            .config
            .iter()
            .filter(|(k, _)| !matches!(k.as_str(), "operation" | "input"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let id = extracted_id(&step.id, embedded.param);
        inserted.push(
            WorkflowStep::new(
                id.clone(),
                format!("Prepare {} for {}", embedded.param, step.name),
                StepKind::Transform(TransformStep {
                    operation,
                    input: Some(input),
                    config: serde_json::Value::Object(config),
                }),
            )
            .depends_on(step.dependencies.iter().cloned()),
        );

        if let StepKind::Action(a) = &mut cleaned.kind {
            a.params.insert(
                embedded.param.to_string(),
                serde_json::Value::String(reference::data_ref(&id)),
            );
        }
        extra_deps.insert(id);
    }

    cleaned.dependencies.extend(extra_deps);
    inserted.push(cleaned);
    inserted
}

fn split_steps(steps: &[WorkflowStep]) -> Vec<WorkflowStep> {
    steps
        .iter()
        .flat_map(|step| {
            let mut parts = split_step(step);
            if let Some(last) = parts.last_mut() {
                for body in last.bodies_mut() {
                    let split = split_steps(body);
                    *body = split;
                }
            }
            parts
        })
        .collect()
}

fn check(steps: &[WorkflowStep], rule_id: &str, issues: &mut Vec<ValidationIssue>) {
    for step in steps {
        if let StepKind::Action(action) = &step.kind {
            for embedded in embedded_configs(action) {
                let message = format!(
                    "param '{}' contains transform configuration; actions accept only literals and references",
                    embedded.param
                );
                let issue = ValidationIssue::error(rule_id, Some(&step.id), message);
                issues.push(match infer_input(step, &embedded) {
                    Some(_) => issue
                        .with_suggestion("move the configuration into a preceding transform step")
                        .fixable(),
                    None => issue
                        .with_suggestion(
                            "add an explicit 'input' to the embedded configuration or declare exactly one dependency",
                        )
                        .with_alternatives(step.dependencies.iter().map(|d| reference::data_ref(d)).collect()),
                });
            }
        }
        for body in step.bodies() {
            check(body, rule_id, issues);
        }
    }
}

impl ValidationRule for ActionTransformSeparationRule {
    fn id(&self) -> &'static str {
        "action-transform-separation"
    }

    fn description(&self) -> &'static str {
        "Action params must not embed transform configuration"
    }

    fn validate(&self, workflow: &Workflow, _ctx: &RuleContext<'_>) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        check(&workflow.steps, self.id(), &mut issues);
        issues
    }

    fn fix(&self, workflow: &Workflow, _ctx: &RuleContext<'_>) -> Option<Workflow> {
        let steps = split_steps(&workflow.steps);
        if steps == workflow.steps {
            return None;
        }
        Some(Workflow {
            steps,
            metadata: workflow.metadata.clone(),
        })
    }
}
