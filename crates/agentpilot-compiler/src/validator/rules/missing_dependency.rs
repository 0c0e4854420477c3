//! Rule: Missing Dependency
//!
//! A step that references an earlier sibling must declare it. References
//! made from inside a nested body to an outer step are declared on the
//! enclosing step of that outer scope. Repairs add the dependency.

use std::collections::{BTreeMap, BTreeSet};

use crate::validator::{RuleContext, Scope, ValidationIssue, ValidationRule};
use crate::workflow::{Workflow, WorkflowStep};

pub struct MissingDependencyRule;

/// Sibling ids the step needs, given `owners` (published id -> sibling id).
fn required_dependencies(step: &WorkflowStep, owners: &BTreeMap<String, String>) -> BTreeSet<String> {
    step.deep_referenced_roots()
        .iter()
        .filter_map(|root| owners.get(root).cloned())
        .collect()
}

fn check(steps: &[WorkflowStep], rule_id: &str, issues: &mut Vec<ValidationIssue>) {
    let mut owners = BTreeMap::new();
    for step in steps {
        for dep in required_dependencies(step, &owners) {
            if !step.dependencies.contains(&dep) {
                issues.push(
                    ValidationIssue::warning(
                        rule_id,
                        Some(&step.id),
                        format!("references {} without declaring it as a dependency", dep),
                    )
                    .with_suggestion(format!("add '{}' to dependencies", dep))
                    .fixable(),
                );
            }
        }
        for body in step.bodies() {
            check(body, rule_id, issues);
        }
        for id in Scope::published_by(step) {
            owners.insert(id, step.id.clone());
        }
    }
}

fn repair(steps: &[WorkflowStep]) -> Vec<WorkflowStep> {
    let mut owners = BTreeMap::new();
    let mut out = Vec::with_capacity(steps.len());
    for step in steps {
        let mut fixed = step.clone();
        fixed.dependencies.extend(required_dependencies(step, &owners));
        for body in fixed.bodies_mut() {
            let repaired = repair(body);
            *body = repaired;
        }
        for id in Scope::published_by(step) {
            owners.insert(id, step.id.clone());
        }
        out.push(fixed);
    }
    out
}

impl ValidationRule for MissingDependencyRule {
    fn id(&self) -> &'static str {
        "missing-dependency"
    }

    fn description(&self) -> &'static str {
        "Referenced sibling steps must be declared as dependencies"
    }

    fn validate(&self, workflow: &Workflow, _ctx: &RuleContext<'_>) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        check(&workflow.steps, self.id(), &mut issues);
        issues
    }

    fn fix(&self, workflow: &Workflow, _ctx: &RuleContext<'_>) -> Option<Workflow> {
        let steps = repair(&workflow.steps);
        if steps == workflow.steps {
            return None;
        }
        Some(Workflow {
            steps,
            metadata: workflow.metadata.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::*;
    use serde_json::json;

    fn transform(id: &str, input: &str) -> WorkflowStep {
        WorkflowStep::new(
            id,
            id,
            StepKind::Transform(TransformStep {
                operation: TransformOperation::Map,
                input: Some(input.to_string()),
                config: json!({"expression": "item"}),
            }),
        )
    }

    #[test]
    fn test_missing_dependency_is_added() {
        let workflow = Workflow::new(
            vec![
                transform("step1", "{{seed}}"),
                transform("step2", "{{step1.data}}"),
            ],
            WorkflowMetadata::default(),
        );
        let ctx = RuleContext { catalog: None };

        let issues = MissingDependencyRule.validate(&workflow, &ctx);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].auto_fixable);

        let fixed = MissingDependencyRule.fix(&workflow, &ctx).unwrap();
        assert!(fixed.steps[1].dependencies.contains("step1"));
        assert!(MissingDependencyRule.validate(&fixed, &ctx).is_empty());
        assert!(MissingDependencyRule.fix(&fixed, &ctx).is_none());
    }

    #[test]
    fn test_nested_reference_declared_on_enclosing_step() {
        let group = WorkflowStep::new(
            "step2",
            "Deliver all",
            StepKind::ParallelGroup(ParallelGroupStep {
                steps: vec![transform("step3", "{{step1.data}}")],
            }),
        );
        let workflow = Workflow::new(
            vec![transform("step1", "{{seed}}"), group],
            WorkflowMetadata::default(),
        );
        let ctx = RuleContext { catalog: None };

        let fixed = MissingDependencyRule.fix(&workflow, &ctx).unwrap();
        assert!(fixed.steps[1].dependencies.contains("step1"));
        match &fixed.steps[1].kind {
            StepKind::ParallelGroup(p) => assert!(p.steps[0].dependencies.is_empty()),
            other => panic!("unexpected kind {:?}", other),
        }
    }
}
