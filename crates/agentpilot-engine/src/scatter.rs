//! Scatter/gather scheduler.
//!
//! A scatter step runs its body once per input item, each run in its own
//! child scope with the item bound under `itemVariable`. At most
//! `maxConcurrency` children are in flight; the bound is a semaphore permit
//! taken inside each child task. Results are gathered in item order,
//! whatever order the children finish in.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use agentpilot_compiler::workflow::{
    GatherOperation, GatherSpec, ItemErrorPolicy, ScatterSpec, WorkflowStep,
};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::context::ExecutionContext;
use crate::error::{EngineResult, ExecutionError};
use crate::executor::extract::array_input;
use crate::output::StepOutput;
use crate::runner::WorkflowRunner;

/// Lifecycle of one scatter step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScatterState {
    Pending,
    Running,
    Gathering,
    Done,
    Failed,
}

/// Children in flight across every scatter of a runner.
#[derive(Debug, Default)]
pub struct ScatterStats {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    started: AtomicUsize,
}

impl ScatterStats {
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of children observed running at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Children that acquired a permit and started.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    fn enter(&self) -> InFlight<'_> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlight { stats: self }
    }
}

struct InFlight<'a> {
    stats: &'a ScatterStats,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn transition(step_id: &str, state: &mut ScatterState, next: ScatterState) {
    debug!(step = step_id, from = ?state, to = ?next, "Scatter state");
    *state = next;
}

fn gather_name(operation: GatherOperation) -> &'static str {
    match operation {
        GatherOperation::Collect => "collect",
        GatherOperation::Merge => "merge",
        GatherOperation::Reduce => "reduce",
    }
}

impl WorkflowRunner {
    pub(crate) async fn run_scatter(
        &self,
        step_id: &str,
        scatter: &ScatterSpec,
        gather: &GatherSpec,
        ctx: Arc<ExecutionContext>,
    ) -> EngineResult<StepOutput> {
        let started = Instant::now();
        let mut state = ScatterState::Pending;

        let raw = self
            .inner
            .executor
            .resolve_value(&Value::String(scatter.input.clone()), &ctx)
            .map_err(|e| e.in_step(step_id))?;
        let items = array_input("scatter", raw).map_err(|e| ExecutionError::ScatterInput {
            step: step_id.to_string(),
            message: e.to_string(),
        })?;

        let bound = scatter
            .max_concurrency
            .unwrap_or(self.inner.config.default_max_concurrency)
            .max(1);
        let total = items.len();
        transition(step_id, &mut state, ScatterState::Running);
        debug!(step = step_id, items = total, max_concurrency = bound, "Scatter started");

        let semaphore = Arc::new(Semaphore::new(bound));
        let body: Arc<Vec<WorkflowStep>> = Arc::new(scatter.steps.clone());
        let mut join_set: JoinSet<(usize, EngineResult<Value>)> = JoinSet::new();

        for (index, item) in items.into_iter().enumerate() {
            let runner = self.clone();
            let semaphore = semaphore.clone();
            let body = body.clone();
            let parent = ctx.clone();
            let variable = scatter.item_variable.clone();

            join_set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return (index, Err(ExecutionError::Join(e.to_string()))),
                };
                let _in_flight = runner.inner.stats.enter();

                let child = ExecutionContext::child(&parent)
                    .with_binding(variable, item)
                    .with_item_index(index);
                (index, runner.run_item(&body, child).await)
            });
        }

        let mut results: Vec<Value> = vec![Value::Null; total];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, Ok(value))) => results[index] = value,
                Ok((index, Err(e))) => match scatter.on_item_error {
                    ItemErrorPolicy::FailFast => {
                        join_set.abort_all();
                        transition(step_id, &mut state, ScatterState::Failed);
                        return Err(ExecutionError::ItemFailed {
                            step: step_id.to_string(),
                            index,
                            source: Box::new(e),
                        });
                    }
                    ItemErrorPolicy::Continue => {
                        warn!(step = step_id, index, error = %e, "Scatter item failed, continuing");
                    }
                },
                Err(join_err) if join_err.is_cancelled() => {}
                Err(join_err) => {
                    join_set.abort_all();
                    transition(step_id, &mut state, ScatterState::Failed);
                    return Err(ExecutionError::Join(join_err.to_string()));
                }
            }
        }

        transition(step_id, &mut state, ScatterState::Gathering);
        let data = match self.gather(step_id, gather, results) {
            Ok(data) => data,
            Err(e) => {
                transition(step_id, &mut state, ScatterState::Failed);
                return Err(e);
            }
        };
        transition(step_id, &mut state, ScatterState::Done);

        Ok(StepOutput::success(
            step_id,
            "scatter_gather",
            gather_name(gather.operation),
            data,
            started.elapsed().as_millis() as u64,
        ))
    }

    /// Run the body for one item and return the last body step's data.
    /// A captured provider error inside the body fails the item.
    async fn run_item(&self, body: &[WorkflowStep], child: ExecutionContext) -> EngineResult<Value> {
        let ctx = self.run_steps(body.to_vec(), child).await?;

        for step in body {
            if let Some(output) = ctx.own_output(&step.id) {
                if !output.is_success() {
                    return Err(ExecutionError::ActionFailed {
                        step: step.id.clone(),
                        message: output.metadata.error.clone().unwrap_or_default(),
                    });
                }
            }
        }

        Ok(body
            .last()
            .and_then(|last| ctx.own_output(&last.id))
            .map(|o| o.data.clone())
            .unwrap_or(Value::Null))
    }

    fn gather(&self, step_id: &str, gather: &GatherSpec, results: Vec<Value>) -> EngineResult<Value> {
        let fail = |message: String| ExecutionError::Gather {
            step: step_id.to_string(),
            message,
        };

        match gather.operation {
            GatherOperation::Collect => Ok(Value::Array(results)),
            GatherOperation::Merge => {
                let mut merged = serde_json::Map::new();
                for (index, value) in results.into_iter().enumerate() {
                    let Value::Object(map) = value else {
                        return Err(fail(format!("item {} did not produce an object", index)));
                    };
                    for (key, v) in map {
                        if merged.contains_key(&key) {
                            return Err(fail(format!(
                                "key '{}' produced by more than one item (item {})",
                                key, index
                            )));
                        }
                        merged.insert(key, v);
                    }
                }
                Ok(Value::Object(merged))
            }
            GatherOperation::Reduce => {
                let combiner = gather
                    .combiner
                    .as_ref()
                    .ok_or_else(|| fail("reduce requires a combiner".to_string()))?;
                let expressions = self.inner.executor.expressions();
                let ast = expressions
                    .compile(&combiner.expression)
                    .map_err(|e| fail(e.to_string()))?;
                let mut acc = combiner.initial.clone();
                for item in &results {
                    acc = expressions
                        .eval(&ast, &[("acc", &acc), ("item", item)])
                        .map_err(|e| fail(e.to_string()))?;
                }
                Ok(acc)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::test_support::registry;
    use crate::output::RunStatus;
    use agentpilot_compiler::workflow::{
        ActionStep, Combiner, LoopStep, ScatterGatherStep, StepKind, TransformOperation,
        TransformStep, Workflow, WorkflowMetadata,
    };
    use agentpilot_tools::RecordingSink;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn seed(id: &str, items: Value) -> WorkflowStep {
        WorkflowStep::new(
            id,
            "Seed",
            StepKind::Transform(TransformStep {
                operation: TransformOperation::Set,
                input: Some("{{step0}}".to_string()),
                config: json!({ "value": items }),
            }),
        )
    }

    fn origin() -> WorkflowStep {
        WorkflowStep::new(
            "step0",
            "Origin",
            StepKind::Action(ActionStep {
                plugin_key: "sheets".to_string(),
                operation_type: "read".to_string(),
                params: BTreeMap::new(),
                fail_fast: false,
            }),
        )
    }

    fn deliver(id: &str) -> WorkflowStep {
        let mut params = BTreeMap::new();
        params.insert("to".to_string(), json!("{{item.to}}"));
        params.insert("body".to_string(), json!("{{item}}"));
        WorkflowStep::new(
            id,
            "Deliver",
            StepKind::Action(ActionStep {
                plugin_key: "mail".to_string(),
                operation_type: "send_email".to_string(),
                params,
                fail_fast: false,
            }),
        )
    }

    fn double(id: &str) -> WorkflowStep {
        WorkflowStep::new(
            id,
            "Double",
            StepKind::Transform(TransformStep {
                operation: TransformOperation::Map,
                input: Some("{{item}}".to_string()),
                config: json!({"expression": "item * 2"}),
            }),
        )
    }

    fn scatter(id: &str, body: Vec<WorkflowStep>, max: Option<usize>, gather: GatherSpec) -> WorkflowStep {
        WorkflowStep::new(
            id,
            "Fan out",
            StepKind::ScatterGather(ScatterGatherStep {
                scatter: ScatterSpec {
                    input: "{{step1.data}}".to_string(),
                    item_variable: "item".to_string(),
                    steps: body,
                    max_concurrency: max,
                    on_item_error: ItemErrorPolicy::FailFast,
                },
                gather,
            }),
        )
        .depends_on(["step1"])
    }

    fn collect() -> GatherSpec {
        GatherSpec {
            operation: GatherOperation::Collect,
            output_variable: Some("results".to_string()),
            combiner: None,
        }
    }

    fn workflow(steps: Vec<WorkflowStep>) -> Workflow {
        Workflow::new(steps, WorkflowMetadata::default())
    }

    fn recipients(n: usize) -> Value {
        Value::Array((0..n).map(|i| json!({"to": format!("user{}@x.com", i)})).collect())
    }

    #[tokio::test]
    async fn test_bounded_concurrency() {
        let sink = RecordingSink::email("mail").with_delay(Duration::from_millis(20));
        let runner = WorkflowRunner::new(Arc::new(registry(sink.clone())));
        let wf = workflow(vec![
            origin(),
            seed("step1", recipients(20)).depends_on(["step0"]),
            scatter("step2", vec![deliver("step3")], Some(5), collect()),
        ]);

        let result = runner.run(&wf).await;
        assert_eq!(result.status, RunStatus::Succeeded);
        assert_eq!(sink.deliveries().len(), 20);
        assert!(runner.scatter_stats().peak() <= 5);
        assert!(sink.peak_in_flight() <= 5);
        assert_eq!(runner.scatter_stats().started(), 20);
        assert_eq!(runner.scatter_stats().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_collect_preserves_item_order() {
        let runner = WorkflowRunner::new(Arc::new(registry(RecordingSink::email("mail"))));
        let wf = workflow(vec![
            origin(),
            seed("step1", json!([[1], [2], [3], [4]])).depends_on(["step0"]),
            scatter("step2", vec![double("step3")], Some(4), collect()),
        ]);

        let result = runner.run(&wf).await;
        assert_eq!(result.data("step2"), Some(&json!([[2], [4], [6], [8]])));
        assert_eq!(result.output("step2").unwrap().operation, "collect");
        // Body outputs stay in the item scopes.
        assert!(result.output("step3").is_none());
    }

    #[tokio::test]
    async fn test_item_failure_is_fail_fast() {
        let sink = RecordingSink::email("mail").failing("mailbox full");
        let runner = WorkflowRunner::new(Arc::new(registry(sink)));
        let wf = workflow(vec![
            origin(),
            seed("step1", recipients(3)).depends_on(["step0"]),
            scatter("step2", vec![deliver("step3")], Some(1), collect()),
        ]);

        let result = runner.run(&wf).await;
        assert_eq!(result.status, RunStatus::Failed);
        let error = result.error.clone().unwrap();
        assert!(error.starts_with("Scatter step2 item "), "{}", error);
        assert!(error.contains("mailbox full"), "{}", error);
        assert!(result.output("step2").is_none());
    }

    #[tokio::test]
    async fn test_continue_policy_records_null() {
        let sink = RecordingSink::email("mail").failing("mailbox full");
        let runner = WorkflowRunner::new(Arc::new(registry(sink)));
        let mut step = scatter("step2", vec![deliver("step3")], Some(2), collect());
        if let StepKind::ScatterGather(sg) = &mut step.kind {
            sg.scatter.on_item_error = ItemErrorPolicy::Continue;
        }
        let wf = workflow(vec![origin(), seed("step1", recipients(2)).depends_on(["step0"]), step]);

        let result = runner.run(&wf).await;
        assert_eq!(result.status, RunStatus::PartiallySucceeded);
        assert_eq!(result.data("step2"), Some(&json!([null, null])));
        assert_eq!(result.provider_errors.len(), 2);
        assert!(result.provider_errors.iter().all(|f| f.item_index.is_some()));
    }

    #[tokio::test]
    async fn test_non_array_input() {
        let runner = WorkflowRunner::new(Arc::new(registry(RecordingSink::email("mail"))));
        let wf = workflow(vec![
            origin(),
            seed("step1", json!(42)).depends_on(["step0"]),
            scatter("step2", vec![double("step3")], None, collect()),
        ]);

        let result = runner.run(&wf).await;
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.error.unwrap().contains("Scatter step2 input is not iterable"));
    }

    #[tokio::test]
    async fn test_merge_and_reduce_gathers() {
        let runner = WorkflowRunner::new(Arc::new(registry(RecordingSink::email("mail"))));
        let pick = |id: &str| {
            WorkflowStep::new(
                id,
                "Pivot",
                StepKind::Transform(TransformStep {
                    operation: TransformOperation::Pivot,
                    input: Some("{{item}}".to_string()),
                    config: json!({"key_field": "k", "value_field": "v"}),
                }),
            )
        };

        let merge = GatherSpec {
            operation: GatherOperation::Merge,
            output_variable: None,
            combiner: None,
        };
        let wf = workflow(vec![
            origin(),
            seed("step1", json!([[{"k": "a", "v": 1}], [{"k": "b", "v": 2}]])).depends_on(["step0"]),
            scatter("step2", vec![pick("step3")], None, merge.clone()),
        ]);
        assert_eq!(runner.run(&wf).await.data("step2"), Some(&json!({"a": 1, "b": 2})));

        let clash = workflow(vec![
            origin(),
            seed("step1", json!([[{"k": "a", "v": 1}], [{"k": "a", "v": 2}]])).depends_on(["step0"]),
            scatter("step2", vec![pick("step3")], None, merge),
        ]);
        let result = runner.run(&clash).await;
        assert!(result.error.unwrap().contains("key 'a'"));

        let sum = GatherSpec {
            operation: GatherOperation::Reduce,
            output_variable: None,
            combiner: Some(Combiner {
                expression: "acc + item.len()".to_string(),
                initial: json!(0),
            }),
        };
        let wf = workflow(vec![
            origin(),
            seed("step1", json!([[1, 2], [3]])).depends_on(["step0"]),
            scatter("step2", vec![double("step3")], None, sum),
        ]);
        assert_eq!(runner.run(&wf).await.data("step2"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_loop_is_sequential() {
        let sink = RecordingSink::email("mail").with_delay(Duration::from_millis(5));
        let runner = WorkflowRunner::new(Arc::new(registry(sink.clone())));
        let wf = workflow(vec![
            origin(),
            seed("step1", recipients(4)).depends_on(["step0"]),
            WorkflowStep::new(
                "step2",
                "Each",
                StepKind::Loop(LoopStep {
                    input: "{{step1.data}}".to_string(),
                    item_variable: "item".to_string(),
                    steps: vec![deliver("step3")],
                    output_variable: None,
                }),
            )
            .depends_on(["step1"]),
        ]);

        let result = runner.run(&wf).await;
        assert_eq!(result.status, RunStatus::Succeeded);
        assert_eq!(sink.peak_in_flight(), 1);
        let order: Vec<Value> = sink.deliveries().iter().map(|d| d.params["to"].clone()).collect();
        assert_eq!(order, recipients(4).as_array().unwrap().iter().map(|r| r["to"].clone()).collect::<Vec<_>>());
        assert_eq!(result.output("step2").unwrap().capability, "loop");
    }
}
