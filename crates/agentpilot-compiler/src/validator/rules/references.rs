//! Rule: Reference Resolution
//!
//! Every `{{...}}` root must be an id or binding visible where the step
//! runs. Ids nested in a sibling scatter or loop body do not count.

use crate::validator::{walk_scoped, RuleContext, ValidationIssue, ValidationRule};
use crate::workflow::Workflow;

pub struct ReferenceResolutionRule;

impl ValidationRule for ReferenceResolutionRule {
    fn id(&self) -> &'static str {
        "unresolved-reference"
    }

    fn description(&self) -> &'static str {
        "References must resolve to a step or variable visible in scope"
    }

    fn validate(&self, workflow: &Workflow, _ctx: &RuleContext<'_>) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        walk_scoped(&workflow.steps, &mut |step, scope| {
            for root in step.referenced_roots() {
                if scope.contains(&root) {
                    continue;
                }
                issues.push(
                    ValidationIssue::error(
                        self.id(),
                        Some(&step.id),
                        format!("reference '{}' does not resolve in this scope", root),
                    )
                    .with_alternatives(scope.alternatives()),
                );
            }
        });

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn deliver(id: &str, body: &str) -> WorkflowStep {
        let mut params = BTreeMap::new();
        params.insert("body".to_string(), json!(body));
        WorkflowStep::new(
            id,
            "Deliver",
            StepKind::Action(ActionStep {
                plugin_key: "mail".to_string(),
                operation_type: "send".to_string(),
                params,
                fail_fast: false,
            }),
        )
    }

    #[test]
    fn test_unresolved_reference_reports_valid_ids() {
        let workflow = Workflow::new(
            vec![deliver("step1", "static"), deliver("step2", "{{step7.data}}")],
            WorkflowMetadata::default(),
        );

        let issues = ReferenceResolutionRule.validate(&workflow, &RuleContext { catalog: None });
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.contains("step7"));
        assert_eq!(issues[0].alternatives, vec!["step1"]);
    }

    #[test]
    fn test_sibling_scatter_scope_is_not_visible() {
        let scatter = WorkflowStep::new(
            "step2",
            "Each",
            StepKind::ScatterGather(ScatterGatherStep {
                scatter: ScatterSpec {
                    input: "{{step1.data}}".to_string(),
                    item_variable: "item".to_string(),
                    steps: vec![deliver("step3", "{{ item.name }}")],
                    max_concurrency: Some(2),
                    on_item_error: ItemErrorPolicy::FailFast,
                },
                gather: GatherSpec {
                    operation: GatherOperation::Collect,
                    output_variable: None,
                    combiner: None,
                },
            }),
        );
        let workflow = Workflow::new(
            vec![deliver("step1", "x"), scatter, deliver("step4", "{{step3.data}}")],
            WorkflowMetadata::default(),
        );

        let issues = ReferenceResolutionRule.validate(&workflow, &RuleContext { catalog: None });
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].step_id.as_deref(), Some("step4"));
    }
}
