//! Canonical step numbering.

use std::collections::BTreeMap;

use super::condition::Condition;
use super::reference::{self, Reference};
use super::types::{StepKind, Workflow, WorkflowStep};

/// Rewrite every id to `step1..N` in depth-first order.
///
/// Dependencies, `{{...}}` roots and conditional field roots are rewritten
/// with the same mapping. The input is left untouched and renumbering an
/// already canonical workflow returns an equal value.
pub fn renumber(workflow: &Workflow) -> Workflow {
    let mapping: BTreeMap<String, String> = workflow
        .step_ids()
        .into_iter()
        .enumerate()
        .map(|(i, id)| (id.to_string(), format!("step{}", i + 1)))
        .collect();

    let mut counter = 0;
    let steps = workflow
        .steps
        .iter()
        .map(|s| renumber_step(s, &mapping, &mut counter))
        .collect();

    Workflow {
        steps,
        metadata: workflow.metadata.clone(),
    }
}

fn renumber_step(
    step: &WorkflowStep,
    mapping: &BTreeMap<String, String>,
    counter: &mut usize,
) -> WorkflowStep {
    // Numbering follows position, so duplicated ids still come out unique.
    *counter += 1;
    let id = format!("step{}", *counter);

    let dependencies = step
        .dependencies
        .iter()
        .map(|d| mapping.get(d).cloned().unwrap_or_else(|| d.clone()))
        .collect();

    let mut kind = step.kind.clone();
    match &mut kind {
        StepKind::Action(a) => {
            for value in a.params.values_mut() {
                *value = reference::rewrite_value(value, mapping);
            }
        }
        StepKind::Transform(t) => {
            if let Some(input) = &t.input {
                t.input = Some(reference::rewrite_roots(input, mapping));
            }
            t.config = reference::rewrite_value(&t.config, mapping);
        }
        StepKind::Conditional(c) => {
            c.condition = rewrite_condition(&c.condition, mapping);
            c.then = renumber_body(&c.then, mapping, counter);
            c.otherwise = renumber_body(&c.otherwise, mapping, counter);
        }
        StepKind::ScatterGather(s) => {
            s.scatter.input = reference::rewrite_roots(&s.scatter.input, mapping);
            s.scatter.steps = renumber_body(&s.scatter.steps, mapping, counter);
        }
        StepKind::Loop(l) => {
            l.input = reference::rewrite_roots(&l.input, mapping);
            l.steps = renumber_body(&l.steps, mapping, counter);
        }
        StepKind::ParallelGroup(p) => {
            p.steps = renumber_body(&p.steps, mapping, counter);
        }
    }

    WorkflowStep {
        id,
        name: step.name.clone(),
        dependencies,
        kind,
    }
}

fn renumber_body(
    steps: &[WorkflowStep],
    mapping: &BTreeMap<String, String>,
    counter: &mut usize,
) -> Vec<WorkflowStep> {
    steps
        .iter()
        .map(|s| renumber_step(s, mapping, counter))
        .collect()
}

fn rewrite_condition(condition: &Condition, mapping: &BTreeMap<String, String>) -> Condition {
    match condition {
        Condition::Simple(leaf) => {
            let mut leaf = leaf.clone();
            if let Ok(r) = Reference::parse(&leaf.field) {
                if let Some(new_root) = mapping.get(&r.root) {
                    leaf.field = Reference {
                        root: new_root.clone(),
                        path: r.path,
                    }
                    .to_string();
                }
            }
            Condition::Simple(leaf)
        }
        Condition::Complex(node) => {
            let mut node = node.clone();
            node.children = node
                .children
                .iter()
                .map(|c| rewrite_condition(c, mapping))
                .collect();
            Condition::Complex(node)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::condition::ConditionOperator;
    use crate::workflow::types::*;
    use serde_json::json;

    fn read(id: &str) -> WorkflowStep {
        WorkflowStep::new(
            id,
            "Read",
            StepKind::Action(ActionStep {
                plugin_key: "mock-sheets".to_string(),
                operation_type: "read_range".to_string(),
                params: BTreeMap::new(),
                fail_fast: false,
            }),
        )
    }

    fn transform(id: &str, input: &str) -> WorkflowStep {
        WorkflowStep::new(
            id,
            "Filter",
            StepKind::Transform(TransformStep {
                operation: TransformOperation::Filter,
                input: Some(input.to_string()),
                config: json!({"condition": {"type": "simple", "field": "a", "operator": "exists"}}),
            }),
        )
    }

    #[test]
    fn test_renumber_rewrites_ids_and_references() {
        let workflow = Workflow::new(
            vec![
                read("read_a"),
                transform("split_1", "{{read_a.data}}").depends_on(["read_a"]),
                WorkflowStep::new(
                    "branch",
                    "Branch",
                    StepKind::Conditional(ConditionalStep {
                        condition: Condition::simple(
                            "split_1.data.0",
                            ConditionOperator::Exists,
                            json!(null),
                        ),
                        then: vec![transform("inner", "{{split_1.data}}")],
                        otherwise: vec![],
                    }),
                )
                .depends_on(["split_1"]),
            ],
            WorkflowMetadata::default(),
        );

        let renumbered = renumber(&workflow);
        assert_eq!(renumbered.step_ids(), vec!["step1", "step2", "step3", "step4"]);

        let step2 = renumbered.find("step2").unwrap();
        assert!(step2.dependencies.contains("step1"));
        match &step2.kind {
            StepKind::Transform(t) => assert_eq!(t.input.as_deref(), Some("{{step1.data}}")),
            other => panic!("unexpected step kind: {:?}", other),
        }

        match &renumbered.find("step3").unwrap().kind {
            StepKind::Conditional(c) => match &c.condition {
                Condition::Simple(leaf) => assert_eq!(leaf.field, "step2.data.0"),
                Condition::Complex(_) => panic!("expected simple condition"),
            },
            other => panic!("unexpected step kind: {:?}", other),
        }

        // Input untouched.
        assert_eq!(workflow.steps[0].id, "read_a");
    }

    #[test]
    fn test_renumber_is_idempotent() {
        let workflow = Workflow::new(
            vec![
                read("x"),
                transform("y", "{{x.data}}").depends_on(["x"]),
            ],
            WorkflowMetadata::default(),
        );
        let once = renumber(&workflow);
        let twice = renumber(&once);
        assert_eq!(once, twice);
    }
}
