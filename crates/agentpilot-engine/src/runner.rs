//! Workflow runner.
//!
//! Runs a compiled workflow as a dependency graph. Within one scope (the
//! top level, a branch, a scatter body, a parallel group) every step whose
//! dependencies have completed is started; independent steps run
//! concurrently up to `max_step_concurrency`. Each finished step's outputs
//! are written once into the scope's context, and every started step sees
//! an immutable snapshot of that context.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use agentpilot_compiler::result_ext::ResultExt;
use agentpilot_compiler::workflow::{
    GatherOperation, GatherSpec, ItemErrorPolicy, ScatterSpec, StepKind, Workflow, WorkflowStep,
};
use agentpilot_compiler::Validator;
use agentpilot_tools::CapabilityExecutor;
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::error::{EngineResult, ExecutionError};
use crate::executor::StepExecutor;
use crate::output::{ExecutionResult, RunStatus, StepOutput};
use crate::scatter::ScatterStats;

pub(crate) struct RunnerInner {
    pub(crate) executor: StepExecutor,
    pub(crate) config: EngineConfig,
    pub(crate) stats: ScatterStats,
}

/// Executes compiled workflows. Cheap to clone.
#[derive(Clone)]
pub struct WorkflowRunner {
    pub(crate) inner: Arc<RunnerInner>,
}

/// Outcome of one scope: the context as far as it got, and the first error.
pub(crate) struct ScopeRun {
    pub ctx: ExecutionContext,
    pub error: Option<ExecutionError>,
}

impl ScopeRun {
    pub fn into_result(self) -> EngineResult<ExecutionContext> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.ctx),
        }
    }
}

impl WorkflowRunner {
    pub fn new(capabilities: Arc<dyn CapabilityExecutor>) -> Self {
        Self::with_config(capabilities, EngineConfig::default())
    }

    pub fn with_config(capabilities: Arc<dyn CapabilityExecutor>, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                executor: StepExecutor::new(capabilities, &config),
                config,
                stats: ScatterStats::default(),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// In-flight instrumentation of scatter children.
    pub fn scatter_stats(&self) -> &ScatterStats {
        &self.inner.stats
    }

    /// Validate and run a workflow.
    ///
    /// Never returns an error: a rejected workflow or an aborted run is
    /// reported through `status` and `error`.
    pub async fn run(&self, workflow: &Workflow) -> ExecutionResult {
        let started = Instant::now();

        let report = Validator::new().validate(workflow, false);
        if !report.valid {
            let messages: Vec<String> = report
                .issues
                .iter()
                .filter(|i| i.is_blocking())
                .map(|i| i.to_string())
                .collect();
            let err = ExecutionError::Rejected(messages);
            error!(error = %err, "Workflow rejected before execution");
            return ExecutionResult {
                steps_completed: 0,
                outputs: Default::default(),
                success: false,
                error: Some(err.to_string()),
                status: RunStatus::Failed,
                provider_errors: Vec::new(),
                duration_ms: started.elapsed().as_millis() as u64,
            };
        }

        let run_started_ms = chrono::Utc::now().timestamp_millis();
        info!(
            steps = workflow.steps.len(),
            pattern = ?workflow.metadata.pattern_type,
            "Workflow run started"
        );

        let run = self
            .run_scope(workflow.steps.clone(), ExecutionContext::new(run_started_ms))
            .await;
        let provider_errors = run.ctx.provider_failures();
        let outputs = run.ctx.into_outputs();

        let outcome: EngineResult<()> = match run.error {
            Some(e) => Err(e),
            None => Ok(()),
        };
        let error = outcome.log("workflow run").err().map(|e| e.to_string());

        let status = if error.is_some() {
            RunStatus::Failed
        } else if !provider_errors.is_empty() || outputs.values().any(|o| !o.is_success()) {
            RunStatus::PartiallySucceeded
        } else {
            RunStatus::Succeeded
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            status = %status,
            steps_completed = outputs.len(),
            provider_errors = provider_errors.len(),
            duration_ms,
            "Workflow run finished"
        );

        ExecutionResult {
            steps_completed: outputs.len(),
            outputs,
            success: status == RunStatus::Succeeded,
            error,
            status,
            provider_errors,
            duration_ms,
        }
    }

    /// Run one scope's steps to completion.
    ///
    /// After the first error no further step is started, but steps already
    /// in flight are awaited rather than cancelled.
    pub(crate) fn run_scope(
        &self,
        steps: Vec<WorkflowStep>,
        ctx: ExecutionContext,
    ) -> BoxFuture<'static, ScopeRun> {
        let runner = self.clone();
        async move {
            let deps = dependency_indices(&steps);
            let limit = runner.inner.config.max_step_concurrency.max(1);

            let mut ctx = ctx;
            let mut started = vec![false; steps.len()];
            let mut done = vec![false; steps.len()];
            let mut first_error: Option<ExecutionError> = None;
            let mut join_set: JoinSet<(usize, EngineResult<Vec<StepOutput>>)> = JoinSet::new();

            loop {
                if first_error.is_none() {
                    for (i, step) in steps.iter().enumerate() {
                        if join_set.len() >= limit {
                            break;
                        }
                        if started[i] || !deps[i].iter().all(|d| done[*d]) {
                            continue;
                        }
                        started[i] = true;
                        debug!(step = %step.id, kind = step.type_name(), "Starting step");
                        let snapshot = Arc::new(ctx.clone());
                        let task_runner = runner.clone();
                        let step = step.clone();
                        join_set.spawn(async move { (i, task_runner.run_step(step, snapshot).await) });
                    }
                }

                let Some(joined) = join_set.join_next().await else {
                    break;
                };
                match joined {
                    Ok((i, Ok(outputs))) => {
                        for output in outputs {
                            ctx.insert(output);
                        }
                        done[i] = true;
                    }
                    Ok((i, Err(e))) => {
                        error!(step = %steps[i].id, error = %e, "Step failed");
                        first_error.get_or_insert(e);
                    }
                    Err(join_err) => {
                        error!(error = %join_err, "Step task did not complete");
                        first_error.get_or_insert(ExecutionError::Join(join_err.to_string()));
                    }
                }
            }

            if first_error.is_none() {
                let stalled: Vec<String> = steps
                    .iter()
                    .zip(&done)
                    .filter(|(_, done)| !**done)
                    .map(|(s, _)| s.id.clone())
                    .collect();
                if !stalled.is_empty() {
                    first_error = Some(ExecutionError::Stalled(stalled));
                }
            }

            ScopeRun {
                ctx,
                error: first_error,
            }
        }
        .boxed()
    }

    pub(crate) fn run_steps(
        &self,
        steps: Vec<WorkflowStep>,
        ctx: ExecutionContext,
    ) -> BoxFuture<'static, EngineResult<ExecutionContext>> {
        let scope = self.run_scope(steps, ctx);
        async move { scope.await.into_result() }.boxed()
    }

    /// Run one step. Composite steps return their own output followed by
    /// the outputs they publish into the enclosing scope.
    fn run_step(
        &self,
        step: WorkflowStep,
        ctx: Arc<ExecutionContext>,
    ) -> BoxFuture<'static, EngineResult<Vec<StepOutput>>> {
        let runner = self.clone();
        async move {
            let started = Instant::now();
            let executor = &runner.inner.executor;
            let id = step.id.clone();

            match step.kind {
                StepKind::Action(action) => {
                    Ok(vec![executor.run_action(&id, &action, &ctx).await?])
                }
                StepKind::Transform(transform) => {
                    Ok(vec![executor.run_transform(&id, &transform, &ctx)?])
                }
                StepKind::Conditional(conditional) => {
                    let taken = executor.evaluate_condition(&id, &conditional.condition, &ctx)?;
                    let (branch, label) = if taken {
                        (conditional.then, "then")
                    } else {
                        (conditional.otherwise, "else")
                    };
                    let last = branch.last().map(|s| s.id.clone());
                    let child = runner
                        .run_steps(branch, ExecutionContext::child(&ctx))
                        .await?;
                    let data = last
                        .and_then(|l| child.own_output(&l).map(|o| o.data.clone()))
                        .unwrap_or(Value::Null);

                    let mut outputs = vec![StepOutput::success(
                        &id,
                        "conditional",
                        label,
                        data,
                        started.elapsed().as_millis() as u64,
                    )];
                    outputs.extend(child.into_outputs().into_values());
                    Ok(outputs)
                }
                StepKind::ScatterGather(sg) => Ok(vec![
                    runner
                        .run_scatter(&id, &sg.scatter, &sg.gather, ctx)
                        .await?,
                ]),
                StepKind::Loop(l) => {
                    let scatter = ScatterSpec {
                        input: l.input,
                        item_variable: l.item_variable,
                        steps: l.steps,
                        max_concurrency: Some(1),
                        on_item_error: ItemErrorPolicy::FailFast,
                    };
                    let gather = GatherSpec {
                        operation: GatherOperation::Collect,
                        output_variable: l.output_variable,
                        combiner: None,
                    };
                    let mut output = runner.run_scatter(&id, &scatter, &gather, ctx).await?;
                    output.capability = "loop".to_string();
                    Ok(vec![output])
                }
                StepKind::ParallelGroup(group) => {
                    let order: Vec<String> = group.steps.iter().map(|s| s.id.clone()).collect();
                    let child = runner
                        .run_steps(group.steps, ExecutionContext::child(&ctx))
                        .await?;
                    let data: Vec<Value> = order
                        .iter()
                        .map(|cid| child.own_output(cid).map(|o| o.data.clone()).unwrap_or(Value::Null))
                        .collect();

                    let mut outputs = vec![StepOutput::success(
                        &id,
                        "parallel_group",
                        "all",
                        Value::Array(data),
                        started.elapsed().as_millis() as u64,
                    )];
                    outputs.extend(child.into_outputs().into_values());
                    Ok(outputs)
                }
            }
        }
        .boxed()
    }
}

/// Sibling indices each step waits for: declared dependencies plus every
/// sibling referenced anywhere inside the step. An id nested at any depth
/// in a sibling's body waits for that sibling.
fn dependency_indices(steps: &[WorkflowStep]) -> Vec<BTreeSet<usize>> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, step) in steps.iter().enumerate() {
        for id in step.ids() {
            index.insert(id, i);
        }
    }

    steps
        .iter()
        .enumerate()
        .map(|(i, step)| {
            step.dependencies
                .iter()
                .cloned()
                .chain(step.deep_referenced_roots())
                .filter_map(|id| index.get(id.as_str()).copied())
                .filter(|d| *d != i)
                .collect()
        })
        .collect()
}

/// Run a workflow against a capability executor with default settings.
pub async fn execute(workflow: &Workflow, capabilities: Arc<dyn CapabilityExecutor>) -> ExecutionResult {
    WorkflowRunner::new(capabilities).run(workflow).await
}
