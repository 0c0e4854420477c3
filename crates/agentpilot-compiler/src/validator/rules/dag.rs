//! Rule: DAG Integrity
//!
//! Ids are unique, every dependency names a step numbered strictly before
//! the dependent one and visible from it, and the dependency graph has no
//! cycle. A step nested in a sibling's body is not visible; the sibling is.

use std::collections::{BTreeMap, BTreeSet};

use crate::validator::{walk_scoped, RuleContext, Scope, ValidationIssue, ValidationRule};
use crate::workflow::{Workflow, WorkflowStep};

pub struct DagIntegrityRule;

fn flatten<'a>(steps: &'a [WorkflowStep], out: &mut Vec<&'a WorkflowStep>) {
    for step in steps {
        out.push(step);
        for body in step.bodies() {
            flatten(body, out);
        }
    }
}

/// Nested step id -> id of the step whose body holds it.
fn parents<'a>(steps: &'a [WorkflowStep], out: &mut BTreeMap<&'a str, &'a str>) {
    for step in steps {
        for body in step.bodies() {
            for child in body {
                out.insert(child.id.as_str(), step.id.as_str());
            }
            parents(body, out);
        }
    }
}

/// Nearest step enclosing `id` that is visible in `scope`.
fn visible_owner<'a>(parents: &BTreeMap<&'a str, &'a str>, id: &'a str, scope: &Scope) -> Option<&'a str> {
    let mut current = id;
    while let Some(&parent) = parents.get(current) {
        if scope.ids.contains(parent) {
            return Some(parent);
        }
        current = parent;
    }
    None
}

fn encloses(parents: &BTreeMap<&str, &str>, outer: &str, id: &str) -> bool {
    let mut current = id;
    while let Some(&parent) = parents.get(current) {
        if parent == outer {
            return true;
        }
        current = parent;
    }
    false
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

fn find_cycles<'a>(graph: &BTreeMap<&'a str, Vec<&'a str>>) -> Vec<Vec<String>> {
    fn visit<'a>(
        node: &'a str,
        graph: &BTreeMap<&'a str, Vec<&'a str>>,
        marks: &mut BTreeMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        marks.insert(node, Mark::Visiting);
        path.push(node);

        for &dep in graph.get(node).map(|d| d.as_slice()).unwrap_or_default() {
            if !graph.contains_key(dep) {
                continue;
            }
            match marks.get(dep) {
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|n| *n == dep).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|n| n.to_string()).collect();
                    cycle.push(dep.to_string());
                    cycles.push(cycle);
                }
                Some(Mark::Done) => {}
                None => visit(dep, graph, marks, path, cycles),
            }
        }

        path.pop();
        marks.insert(node, Mark::Done);
    }

    let mut marks = BTreeMap::new();
    let mut cycles = Vec::new();
    for &node in graph.keys() {
        if !marks.contains_key(node) {
            let mut path = Vec::new();
            visit(node, graph, &mut marks, &mut path, &mut cycles);
        }
    }
    cycles
}

impl ValidationRule for DagIntegrityRule {
    fn id(&self) -> &'static str {
        "dag-integrity"
    }

    fn description(&self) -> &'static str {
        "Step ids are unique and dependencies point backwards without cycles"
    }

    fn validate(&self, workflow: &Workflow, _ctx: &RuleContext<'_>) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        let mut ordered = Vec::new();
        flatten(&workflow.steps, &mut ordered);

        let mut index: BTreeMap<&str, usize> = BTreeMap::new();
        let mut reported_duplicates = BTreeSet::new();
        for (pos, step) in ordered.iter().enumerate() {
            if index.contains_key(step.id.as_str()) {
                if reported_duplicates.insert(step.id.as_str()) {
                    issues.push(ValidationIssue::error(
                        self.id(),
                        Some(&step.id),
                        format!("duplicate step id '{}'", step.id),
                    ));
                }
            } else {
                index.insert(step.id.as_str(), pos);
            }
        }

        for (pos, step) in ordered.iter().enumerate() {
            for dep in &step.dependencies {
                match index.get(dep.as_str()) {
                    None => {
                        let earlier: Vec<String> = ordered[..pos]
                            .iter()
                            .map(|s| s.id.clone())
                            .collect();
                        issues.push(
                            ValidationIssue::error(
                                self.id(),
                                Some(&step.id),
                                format!("depends on unknown step '{}'", dep),
                            )
                            .with_alternatives(earlier),
                        );
                    }
                    Some(&dep_pos) if dep_pos >= pos && dep != &step.id => {
                        issues.push(
                            ValidationIssue::error(
                                self.id(),
                                Some(&step.id),
                                format!("forward reference to '{}', which is defined later", dep),
                            )
                            .with_suggestion("dependencies may only name earlier steps"),
                        );
                    }
                    Some(_) => {}
                }
            }
        }

        let mut owners = BTreeMap::new();
        parents(&workflow.steps, &mut owners);
        walk_scoped(&workflow.steps, &mut |step, scope| {
            let Some(&pos) = index.get(step.id.as_str()) else {
                return;
            };
            for dep in &step.dependencies {
                let Some((&dep_id, &dep_pos)) = index.get_key_value(dep.as_str()) else {
                    continue;
                };
                if dep_pos >= pos || scope.ids.contains(dep) || encloses(&owners, dep_id, &step.id) {
                    continue;
                }
                let mut issue = ValidationIssue::error(
                    self.id(),
                    Some(&step.id),
                    format!("depends on '{}', which is nested inside another step's body", dep),
                );
                if let Some(owner) = visible_owner(&owners, dep_id, scope) {
                    issue = issue.with_suggestion(format!("depend on '{}' instead", owner));
                }
                issues.push(issue);
            }
        });

        let graph: BTreeMap<&str, Vec<&str>> = ordered
            .iter()
            .map(|s| {
                (
                    s.id.as_str(),
                    s.dependencies.iter().map(|d| d.as_str()).collect(),
                )
            })
            .collect();
        for cycle in find_cycles(&graph) {
            issues.push(ValidationIssue::error(
                self.id(),
                cycle.first().map(|s| s.as_str()),
                format!("dependency cycle: {}", cycle.join(" -> ")),
            ));
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::*;
    use serde_json::json;

    fn step(id: &str, deps: &[&str]) -> WorkflowStep {
        WorkflowStep::new(
            id,
            id,
            StepKind::Transform(TransformStep {
                operation: TransformOperation::Set,
                input: Some("{{seed}}".to_string()),
                config: json!({"value": 1}),
            }),
        )
        .depends_on(deps.iter().copied())
    }

    fn run(steps: Vec<WorkflowStep>) -> Vec<ValidationIssue> {
        DagIntegrityRule.validate(
            &Workflow::new(steps, WorkflowMetadata::default()),
            &RuleContext { catalog: None },
        )
    }

    #[test]
    fn test_valid_chain() {
        assert!(run(vec![step("step1", &[]), step("step2", &["step1"])]).is_empty());
    }

    #[test]
    fn test_forward_reference_rejected() {
        let issues = run(vec![
            step("step1", &[]),
            step("step2", &["step3"]),
            step("step3", &["step1"]),
        ]);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.contains("forward reference"));
        assert_eq!(issues[0].step_id.as_deref(), Some("step2"));
    }

    #[test]
    fn test_unknown_dependency() {
        let issues = run(vec![step("step1", &[]), step("step2", &["step9"])]);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].alternatives, vec!["step1"]);
    }

    #[test]
    fn test_duplicate_ids() {
        let issues = run(vec![step("step1", &[]), step("step1", &[])]);
        assert!(issues.iter().any(|i| i.message.contains("duplicate")));
    }

    #[test]
    fn test_cycle_detected() {
        let issues = run(vec![step("a", &["b"]), step("b", &["a"])]);
        assert!(issues.iter().any(|i| i.message.contains("forward reference")));
        let cycle = issues
            .iter()
            .find(|i| i.message.starts_with("dependency cycle"))
            .unwrap();
        assert!(cycle.message.contains("a -> b -> a"));
    }

    #[test]
    fn test_dependency_on_step_inside_sibling_scatter() {
        let scatter = WorkflowStep::new(
            "step2",
            "per item",
            StepKind::ScatterGather(ScatterGatherStep {
                scatter: ScatterSpec {
                    input: "{{step1.data}}".to_string(),
                    item_variable: "item".to_string(),
                    steps: vec![step("step3", &[])],
                    max_concurrency: None,
                    on_item_error: ItemErrorPolicy::FailFast,
                },
                gather: GatherSpec {
                    operation: GatherOperation::Collect,
                    output_variable: None,
                    combiner: None,
                },
            }),
        )
        .depends_on(["step1"]);

        let issues = run(vec![step("step1", &[]), scatter, step("step4", &["step3"])]);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].step_id.as_deref(), Some("step4"));
        assert!(issues[0].message.contains("nested inside"));
        assert_eq!(issues[0].suggestion.as_deref(), Some("depend on 'step2' instead"));

        assert!(run(vec![
            step("step1", &[]),
            WorkflowStep::new(
                "step2",
                "group",
                StepKind::ParallelGroup(ParallelGroupStep {
                    steps: vec![step("step3", &["step1"])],
                }),
            ),
            step("step4", &["step3"]),
        ])
        .is_empty());
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let issues = run(vec![step("step1", &["step1"])]);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.contains("step1 -> step1"));
    }
}
