//! Reference visibility.
//!
//! A step sees every earlier sibling, everything its enclosing scopes see,
//! and the item variable of an enclosing scatter or loop. Steps nested in
//! a sibling scatter, loop or conditional branch are not visible; direct
//! children of a parallel group are, since the group publishes them.

use std::collections::BTreeSet;

use crate::workflow::{StepKind, WorkflowStep};

#[derive(Debug, Clone, Default)]
pub(crate) struct Scope {
    pub ids: BTreeSet<String>,
    pub bindings: BTreeSet<String>,
}

impl Scope {
    pub fn contains(&self, root: &str) -> bool {
        self.ids.contains(root) || self.bindings.contains(root)
    }

    /// Everything a reference may name here, ids first.
    pub fn alternatives(&self) -> Vec<String> {
        self.ids
            .iter()
            .chain(self.bindings.iter())
            .cloned()
            .collect()
    }

    /// Ids a step publishes into the scope of later siblings.
    pub fn published_by(step: &WorkflowStep) -> Vec<String> {
        let mut ids = vec![step.id.clone()];
        if let StepKind::ParallelGroup(group) = &step.kind {
            ids.extend(group.steps.iter().map(|s| s.id.clone()));
        }
        ids
    }
}

/// Visit every step depth-first with the scope it executes in.
pub(crate) fn walk_scoped<'a, F>(steps: &'a [WorkflowStep], visit: &mut F)
where
    F: FnMut(&'a WorkflowStep, &Scope),
{
    walk_inner(steps, &Scope::default(), visit);
}

fn walk_inner<'a, F>(steps: &'a [WorkflowStep], outer: &Scope, visit: &mut F)
where
    F: FnMut(&'a WorkflowStep, &Scope),
{
    let mut scope = outer.clone();
    for step in steps {
        visit(step, &scope);

        let mut inner = scope.clone();
        if let Some(var) = step.item_variable() {
            inner.bindings.insert(var.to_string());
        }
        for body in step.bodies() {
            walk_inner(body, &inner, visit);
        }

        scope.ids.extend(Scope::published_by(step));
    }
}
