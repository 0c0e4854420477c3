//! Execution context.
//!
//! A context maps step ids to their outputs and names to bound values
//! (scatter and loop item variables). Contexts form a chain: a scatter
//! child gets its own scope whose parent is the scope the scatter step ran
//! in, so item bindings and body outputs never leak into siblings while
//! upstream outputs stay readable.
//!
//! Each step id is written exactly once, by the runner that owns the scope.
//! Executors only ever see an `Arc` snapshot, so reads need no locking.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use agentpilot_compiler::workflow::{Reference, Segment};
use serde_json::Value;

use crate::condition::FieldSource;
use crate::error::{EngineResult, ExecutionError};
use crate::output::{ProviderFailure, StepOutput};

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    parent: Option<Arc<ExecutionContext>>,
    outputs: BTreeMap<String, Arc<StepOutput>>,
    bindings: BTreeMap<String, Value>,
    run_started_ms: i64,
    item_index: Option<usize>,
    failures: Arc<Mutex<Vec<ProviderFailure>>>,
}

impl ExecutionContext {
    /// Root context of a run. `run_started_ms` is shared by every step.
    pub fn new(run_started_ms: i64) -> Self {
        Self {
            parent: None,
            outputs: BTreeMap::new(),
            bindings: BTreeMap::new(),
            run_started_ms,
            item_index: None,
            failures: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Empty scope nested in `parent`.
    pub fn child(parent: &Arc<ExecutionContext>) -> Self {
        Self {
            parent: Some(parent.clone()),
            outputs: BTreeMap::new(),
            bindings: BTreeMap::new(),
            run_started_ms: parent.run_started_ms,
            item_index: parent.item_index,
            failures: parent.failures.clone(),
        }
    }

    pub fn with_binding(mut self, name: impl Into<String>, value: Value) -> Self {
        self.bindings.insert(name.into(), value);
        self
    }

    pub(crate) fn with_item_index(mut self, index: usize) -> Self {
        self.item_index = Some(index);
        self
    }

    pub fn run_started_ms(&self) -> i64 {
        self.run_started_ms
    }

    pub fn item_index(&self) -> Option<usize> {
        self.item_index
    }

    /// Record a step output in this scope.
    pub fn insert(&mut self, output: StepOutput) {
        self.outputs.insert(output.step_id.clone(), Arc::new(output));
    }

    pub fn output(&self, step_id: &str) -> Option<&StepOutput> {
        match self.outputs.get(step_id) {
            Some(output) => Some(output),
            None => self.parent.as_ref().and_then(|p| p.output(step_id)),
        }
    }

    pub fn binding(&self, name: &str) -> Option<&Value> {
        match self.bindings.get(name) {
            Some(value) => Some(value),
            None => self.parent.as_ref().and_then(|p| p.binding(name)),
        }
    }

    /// Outputs written in this scope only, by step id.
    pub fn into_outputs(self) -> BTreeMap<String, StepOutput> {
        self.outputs
            .into_iter()
            .map(|(id, output)| {
                let output = Arc::try_unwrap(output).unwrap_or_else(|shared| (*shared).clone());
                (id, output)
            })
            .collect()
    }

    pub fn own_output(&self, step_id: &str) -> Option<&StepOutput> {
        self.outputs.get(step_id).map(|o| o.as_ref())
    }

    /// Every step id and binding name visible from this scope, ids first.
    pub fn visible_names(&self) -> Vec<String> {
        let mut ids = BTreeSet::new();
        let mut bindings = BTreeSet::new();
        let mut scope = Some(self);
        while let Some(ctx) = scope {
            ids.extend(ctx.outputs.keys().cloned());
            bindings.extend(ctx.bindings.keys().cloned());
            scope = ctx.parent.as_deref();
        }
        ids.into_iter().chain(bindings).collect()
    }

    pub fn record_failure(&self, failure: ProviderFailure) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.push(failure);
    }

    pub fn provider_failures(&self) -> Vec<ProviderFailure> {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Resolve a parsed reference.
    ///
    /// A step id yields the serialized `StepOutput`; a binding yields its
    /// value. Each segment is an object key or an array index; an index
    /// applied to an object is looked up as a key.
    pub fn resolve(&self, reference: &Reference) -> EngineResult<Value> {
        if let Some(value) = self.bindings.get(&reference.root) {
            return walk(reference, value, 0).cloned();
        }

        if let Some(output) = self.outputs.get(&reference.root) {
            // Skip serializing the whole output for the common `.data` path.
            if matches!(reference.path.first(), Some(Segment::Key(k)) if k == "data") {
                return walk(reference, &output.data, 1).cloned();
            }
            let whole = serde_json::to_value(output.as_ref())
                .map_err(|e| ExecutionError::InvalidReference(e.to_string()))?;
            return walk(reference, &whole, 0).cloned();
        }

        match &self.parent {
            Some(parent) => parent.resolve(reference).map_err(|e| match e {
                ExecutionError::UnresolvedReference { reference, .. } => {
                    ExecutionError::UnresolvedReference {
                        reference,
                        available: self.visible_names(),
                    }
                }
                other => other,
            }),
            None => Err(ExecutionError::UnresolvedReference {
                reference: reference.to_string(),
                available: self.visible_names(),
            }),
        }
    }

    /// Resolve a bare path such as `step2.data.items`.
    pub fn resolve_path(&self, path: &str) -> EngineResult<Value> {
        let reference =
            Reference::parse(path).map_err(|e| ExecutionError::InvalidReference(e.to_string()))?;
        self.resolve(&reference)
    }

    /// Like `resolve`, but a missing field yields `null`.
    pub fn resolve_lenient(&self, reference: &Reference) -> EngineResult<Value> {
        match self.resolve(reference) {
            Err(ExecutionError::MissingField { .. }) => Ok(Value::Null),
            other => other,
        }
    }

    /// Everything visible, as a template rendering context. Inner scopes
    /// shadow outer ones.
    pub fn template_context(&self) -> serde_json::Map<String, Value> {
        let mut map = match &self.parent {
            Some(parent) => parent.template_context(),
            None => serde_json::Map::new(),
        };
        for (id, output) in &self.outputs {
            if let Ok(value) = serde_json::to_value(output.as_ref()) {
                map.insert(id.clone(), value);
            }
        }
        for (name, value) in &self.bindings {
            map.insert(name.clone(), value.clone());
        }
        map
    }
}

fn available_fields(value: &Value) -> Vec<String> {
    match value {
        Value::Object(map) => map.keys().cloned().collect(),
        Value::Array(items) if !items.is_empty() => vec![format!("0..{}", items.len() - 1)],
        _ => Vec::new(),
    }
}

fn walk<'v>(reference: &Reference, root: &'v Value, skip: usize) -> EngineResult<&'v Value> {
    let mut current = root;
    for segment in reference.path.iter().skip(skip) {
        let next = match (current, segment) {
            (Value::Array(items), Segment::Index(i)) => items.get(*i),
            (Value::Object(map), segment) => map.get(&segment.as_key()),
            _ => None,
        };
        current = next.ok_or_else(|| ExecutionError::MissingField {
            reference: reference.to_string(),
            segment: segment.as_key(),
            available: available_fields(current),
        })?;
    }
    Ok(current)
}

impl FieldSource for ExecutionContext {
    fn field(&self, path: &str) -> Option<Value> {
        self.resolve_path(path).ok()
    }
}
