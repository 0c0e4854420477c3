//! Rule: Transform Input
//!
//! Every transform must name its input. Not auto-fixed: with more than one
//! predecessor there is no safe way to pick one.

use crate::validator::{walk_scoped, RuleContext, ValidationIssue, ValidationRule};
use crate::workflow::{reference, StepKind, Workflow};

pub struct TransformInputRule;

impl ValidationRule for TransformInputRule {
    fn id(&self) -> &'static str {
        "transform-input"
    }

    fn description(&self) -> &'static str {
        "Transform steps must declare an input reference"
    }

    fn validate(&self, workflow: &Workflow, _ctx: &RuleContext<'_>) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        walk_scoped(&workflow.steps, &mut |step, scope| {
            let StepKind::Transform(t) = &step.kind else {
                return;
            };
            let missing = t.input.as_deref().map(|s| s.trim().is_empty()).unwrap_or(true);
            if !missing {
                return;
            }

            let available: Vec<String> = scope
                .ids
                .iter()
                .map(|id| reference::data_ref(id))
                .chain(scope.bindings.iter().map(|b| reference::binding_ref(b)))
                .collect();

            issues.push(
                ValidationIssue::error(
                    self.id(),
                    Some(&step.id),
                    format!("{} transform has no input", t.operation),
                )
                .with_suggestion("set 'input' to one of the available references")
                .with_alternatives(available),
            );
        });

        issues
    }
}
