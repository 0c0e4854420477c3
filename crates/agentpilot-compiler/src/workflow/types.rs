//! Compiled workflow step model.
//!
//! Steps form a closed grammar: every step is one of the `StepKind`
//! variants, tagged on the wire by `type`. Nested bodies (scatter, loop,
//! conditional branches, parallel groups) are plain step lists with their
//! own dependency scope.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::condition::Condition;
use super::reference::{self, Reference};

/// A single step of a compiled workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Globally unique id (`step1`, `step2`, ...).
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Ids this step waits for. Only earlier ids of the same scope, or of
    /// an enclosing scope, are allowed.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub dependencies: BTreeSet<String>,

    #[serde(flatten)]
    pub kind: StepKind,
}

/// Type-specific payload of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Action(ActionStep),
    Transform(TransformStep),
    Conditional(ConditionalStep),
    ScatterGather(ScatterGatherStep),
    Loop(LoopStep),
    ParallelGroup(ParallelGroupStep),
}

impl StepKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            StepKind::Action(_) => "action",
            StepKind::Transform(_) => "transform",
            StepKind::Conditional(_) => "conditional",
            StepKind::ScatterGather(_) => "scatter_gather",
            StepKind::Loop(_) => "loop",
            StepKind::ParallelGroup(_) => "parallel_group",
        }
    }
}

/// Invocation of one capability operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStep {
    pub plugin_key: String,
    pub operation_type: String,

    /// Literal values or `{{...}}` references, never transform configuration.
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,

    /// Abort the run on provider error instead of recording it in the output.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fail_fast: bool,
}

/// Transform operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformOperation {
    Filter,
    Map,
    Sort,
    Group,
    Aggregate,
    Flatten,
    Deduplicate,
    Reduce,
    Join,
    Pivot,
    Split,
    Expand,
    Set,
}

impl TransformOperation {
    /// Operations that fail when their input is not an array.
    pub fn requires_array(&self) -> bool {
        matches!(
            self,
            TransformOperation::Filter
                | TransformOperation::Map
                | TransformOperation::Reduce
                | TransformOperation::Sort
                | TransformOperation::Deduplicate
                | TransformOperation::Flatten
                | TransformOperation::Group
                | TransformOperation::Aggregate
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransformOperation::Filter => "filter",
            TransformOperation::Map => "map",
            TransformOperation::Sort => "sort",
            TransformOperation::Group => "group",
            TransformOperation::Aggregate => "aggregate",
            TransformOperation::Flatten => "flatten",
            TransformOperation::Deduplicate => "deduplicate",
            TransformOperation::Reduce => "reduce",
            TransformOperation::Join => "join",
            TransformOperation::Pivot => "pivot",
            TransformOperation::Split => "split",
            TransformOperation::Expand => "expand",
            TransformOperation::Set => "set",
        }
    }

    /// Parse an operation name, as found in embedded transform configs.
    pub fn from_name(name: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(name.to_string())).ok()
    }
}

impl std::fmt::Display for TransformOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Pure in-memory data transformation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformStep {
    pub operation: TransformOperation,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,

    #[serde(default = "empty_object")]
    pub config: serde_json::Value,
}

/// Branch on a condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalStep {
    /// Fields are paths rooted at a step id or binding.
    pub condition: Condition,

    #[serde(default)]
    pub then: Vec<WorkflowStep>,

    #[serde(rename = "else", default)]
    pub otherwise: Vec<WorkflowStep>,
}

/// What happens to the remaining items when one scatter child fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemErrorPolicy {
    #[default]
    FailFast,
    Continue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScatterSpec {
    pub input: String,
    pub item_variable: String,
    pub steps: Vec<WorkflowStep>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,

    #[serde(default)]
    pub on_item_error: ItemErrorPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatherOperation {
    Collect,
    Merge,
    Reduce,
}

/// Associative combiner for `reduce` gathers. `acc` and `item` are bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Combiner {
    pub expression: String,
    #[serde(default)]
    pub initial: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatherSpec {
    pub operation: GatherOperation,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_variable: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combiner: Option<Combiner>,
}

/// Run a sub-workflow once per input item and combine the results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScatterGatherStep {
    pub scatter: ScatterSpec,
    pub gather: GatherSpec,
}

/// Sequential iteration over an array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopStep {
    pub input: String,
    pub item_variable: String,
    pub steps: Vec<WorkflowStep>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_variable: Option<String>,
}

/// Independent steps run concurrently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelGroupStep {
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            dependencies: BTreeSet::new(),
            kind,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    /// Nested step bodies, each a separate scope.
    pub fn bodies(&self) -> Vec<&[WorkflowStep]> {
        match &self.kind {
            StepKind::Conditional(c) => vec![&c.then[..], &c.otherwise[..]],
            StepKind::ScatterGather(s) => vec![&s.scatter.steps[..]],
            StepKind::Loop(l) => vec![&l.steps[..]],
            StepKind::ParallelGroup(p) => vec![&p.steps[..]],
            StepKind::Action(_) | StepKind::Transform(_) => Vec::new(),
        }
    }

    pub fn bodies_mut(&mut self) -> Vec<&mut Vec<WorkflowStep>> {
        match &mut self.kind {
            StepKind::Conditional(c) => vec![&mut c.then, &mut c.otherwise],
            StepKind::ScatterGather(s) => vec![&mut s.scatter.steps],
            StepKind::Loop(l) => vec![&mut l.steps],
            StepKind::ParallelGroup(p) => vec![&mut p.steps],
            StepKind::Action(_) | StepKind::Transform(_) => Vec::new(),
        }
    }

    /// Binding introduced for the nested body, if any.
    pub fn item_variable(&self) -> Option<&str> {
        match &self.kind {
            StepKind::ScatterGather(s) => Some(s.scatter.item_variable.as_str()),
            StepKind::Loop(l) => Some(l.item_variable.as_str()),
            _ => None,
        }
    }

    /// Template strings that this step resolves itself, excluding nested bodies.
    ///
    /// `template` and `expression` entries of a transform config are
    /// evaluated against the transform input, not the context, and are
    /// therefore skipped.
    pub fn own_references(&self) -> Vec<&str> {
        let mut out = Vec::new();
        match &self.kind {
            StepKind::Action(a) => {
                for value in a.params.values() {
                    reference::collect_template_strings(value, &mut out);
                }
            }
            StepKind::Transform(t) => {
                if let Some(input) = &t.input {
                    out.push(input.as_str());
                }
                if let Some(config) = t.config.as_object() {
                    for (key, value) in config {
                        if matches!(key.as_str(), "template" | "expression" | "condition") {
                            continue;
                        }
                        reference::collect_template_strings(value, &mut out);
                    }
                }
            }
            StepKind::ScatterGather(s) => out.push(s.scatter.input.as_str()),
            StepKind::Loop(l) => out.push(l.input.as_str()),
            StepKind::Conditional(_) | StepKind::ParallelGroup(_) => {}
        }
        out
    }

    /// Roots referenced by this step itself: `{{...}}` roots plus the roots
    /// of conditional field paths.
    pub fn referenced_roots(&self) -> BTreeSet<String> {
        let mut roots: BTreeSet<String> = self
            .own_references()
            .iter()
            .flat_map(|s| reference::extract_roots(s))
            .collect();

        if let StepKind::Conditional(c) = &self.kind {
            for field in c.condition.fields() {
                if let Ok(r) = Reference::parse(field) {
                    roots.insert(r.root);
                }
            }
        }
        roots
    }

    /// Roots referenced anywhere in this step, including nested bodies.
    pub fn deep_referenced_roots(&self) -> BTreeSet<String> {
        let mut roots = self.referenced_roots();
        for body in self.bodies() {
            for child in body {
                roots.extend(child.deep_referenced_roots());
            }
        }
        roots
    }

    /// Ids of this step and every nested step, depth-first.
    pub fn ids(&self) -> Vec<&str> {
        let mut out = vec![self.id.as_str()];
        for body in self.bodies() {
            for child in body {
                out.extend(child.ids());
            }
        }
        out
    }
}

/// Which compiler produced a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompilerKind {
    #[default]
    #[serde(rename = "deterministic")]
    Deterministic,
    #[serde(rename = "fallback-llm")]
    FallbackLlm,
}

/// Compilation pattern chosen for an IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    #[default]
    Linear,
    Filtered,
    Deduplicated,
    Grouped,
    PerItem,
    MultiDestination,
}

impl std::fmt::Display for PatternType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PatternType::Linear => "linear",
            PatternType::Filtered => "filtered",
            PatternType::Deduplicated => "deduplicated",
            PatternType::Grouped => "grouped",
            PatternType::PerItem => "per_item",
            PatternType::MultiDestination => "multi_destination",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    pub compiler: CompilerKind,
    #[serde(rename = "patternType", alias = "pattern_type")]
    pub pattern_type: PatternType,
}

/// A compiled, executable step graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub metadata: WorkflowMetadata,
}

impl Workflow {
    pub fn new(steps: Vec<WorkflowStep>, metadata: WorkflowMetadata) -> Self {
        Self { steps, metadata }
    }

    /// Every step id, depth-first.
    pub fn step_ids(&self) -> Vec<&str> {
        self.steps.iter().flat_map(|s| s.ids()).collect()
    }

    /// Find a step anywhere in the graph.
    pub fn find(&self, id: &str) -> Option<&WorkflowStep> {
        fn search<'a>(steps: &'a [WorkflowStep], id: &str) -> Option<&'a WorkflowStep> {
            for step in steps {
                if step.id == id {
                    return Some(step);
                }
                for body in step.bodies() {
                    if let Some(found) = search(body, id) {
                        return Some(found);
                    }
                }
            }
            None
        }
        search(&self.steps, id)
    }

    /// Total number of steps including nested ones.
    pub fn len(&self) -> usize {
        self.step_ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Compiler output: the workflow plus compile-time facts that must not
/// influence its bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledWorkflow {
    pub workflow: Workflow,
    pub compile_time_ms: u64,
    #[serde(default)]
    pub warnings: Vec<String>,
}
