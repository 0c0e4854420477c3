//! Data stages shared by every pattern: source reads, filtering,
//! deduplication and AI operations.

use serde_json::json;
use std::collections::BTreeMap;

use agentpilot_tools::OperationSchema;

use super::context::{CompilerContext, Cursor, Lowering};
use crate::error::CompileResult;
use crate::ir::{AiOperation, DataSource, DeduplicationRule, SourceRole};
use crate::workflow::{
    reference, ActionStep, Condition, ConditionOperator, GatherOperation, GatherSpec,
    ItemErrorPolicy, ScatterGatherStep, ScatterSpec, StepKind, TransformOperation, TransformStep,
    WorkflowStep,
};

const MAX_RESULTS_PARAM: &str = "max_results";

pub(crate) fn action_step(
    id: &str,
    name: String,
    plugin_key: &str,
    operation_type: &str,
    params: BTreeMap<String, serde_json::Value>,
) -> WorkflowStep {
    WorkflowStep::new(
        id,
        name,
        StepKind::Action(ActionStep {
            plugin_key: plugin_key.to_string(),
            operation_type: operation_type.to_string(),
            params,
            fail_fast: false,
        }),
    )
}

pub(crate) fn transform_step(
    id: &str,
    name: impl Into<String>,
    operation: TransformOperation,
    input: &str,
    config: serde_json::Value,
) -> WorkflowStep {
    WorkflowStep::new(
        id,
        name,
        StepKind::Transform(TransformStep {
            operation,
            input: Some(input.to_string()),
            config,
        }),
    )
}

/// Content parameter of an operation: explicit override, else the one
/// parameter the schema flags as content.
pub(crate) fn content_param(
    explicit: Option<&str>,
    schema: &OperationSchema,
    node: &str,
    lowering: &mut Lowering,
) -> Option<String> {
    if let Some(name) = explicit {
        return Some(name.to_string());
    }
    match schema.parameters_schema.content_parameter() {
        Some(spec) => Some(spec.name.clone()),
        None => {
            lowering.warn(format!(
                "{}: {}.{} declares no single content parameter, content is not passed",
                node, schema.plugin_key, schema.operation_type
            ));
            None
        }
    }
}

/// Output of the source stage.
pub(crate) struct Sources {
    pub primary: Cursor,
    pub reference: Option<Cursor>,
}

fn read_step(
    ctx: &CompilerContext<'_>,
    lowering: &mut Lowering,
    idx: usize,
    source: &DataSource,
) -> CompileResult<(WorkflowStep, Cursor)> {
    let schema = ctx.schema(&source.plugin_key, &source.operation_type)?;
    let id = lowering.next_id();

    let mut params = source.config.clone();
    if schema.parameters_schema.get(MAX_RESULTS_PARAM).is_some()
        && !params.contains_key(MAX_RESULTS_PARAM)
    {
        lowering.warn(format!(
            "data_sources[{}]: {} not set, defaulting to {}",
            idx, MAX_RESULTS_PARAM, ctx.config.default_max_results
        ));
        params.insert(
            MAX_RESULTS_PARAM.to_string(),
            json!(ctx.config.default_max_results),
        );
    }

    let label = source
        .id
        .clone()
        .or_else(|| (!source.source_type.is_empty()).then(|| source.source_type.clone()))
        .unwrap_or_else(|| "data".to_string());
    let name = match source.role {
        SourceRole::Primary => format!("Read {} from {}", label, source.plugin_key),
        SourceRole::Reference => format!("Read reference {} from {}", label, source.plugin_key),
    };

    let cursor = Cursor::new(id.clone(), ctx.output_ref(&id, schema));
    let step = action_step(
        &id,
        name,
        &source.plugin_key,
        &source.operation_type,
        params,
    );
    Ok((step, cursor))
}

/// One read per data source, in IR order. Several primary sources are
/// merged into a single array.
pub(crate) fn lower_sources(
    ctx: &CompilerContext<'_>,
    lowering: &mut Lowering,
    steps: &mut Vec<WorkflowStep>,
) -> CompileResult<Sources> {
    let mut primaries = Vec::new();
    let mut reference_cursor = None;

    for (idx, source) in ctx.ir.data_sources.iter().enumerate() {
        let (step, cursor) = read_step(ctx, lowering, idx, source)?;
        steps.push(step);
        match source.role {
            SourceRole::Primary => primaries.push(cursor),
            SourceRole::Reference => reference_cursor = Some(cursor),
        }
    }

    let primary = if primaries.len() == 1 {
        primaries.remove(0)
    } else {
        let set_id = lowering.next_id();
        let refs: Vec<serde_json::Value> = primaries
            .iter()
            .map(|c| json!(c.reference))
            .collect();
        steps.push(
            transform_step(
                &set_id,
                "Collect primary sources",
                TransformOperation::Set,
                &primaries[0].reference,
                json!({ "value": refs }),
            )
            .depends_on(primaries.iter().map(|c| c.step_id.clone())),
        );

        let flatten_id = lowering.next_id();
        steps.push(
            transform_step(
                &flatten_id,
                "Merge primary sources",
                TransformOperation::Flatten,
                &reference::data_ref(&set_id),
                json!({}),
            )
            .depends_on([set_id]),
        );
        Cursor::data_of(&flatten_id)
    };

    Ok(Sources {
        primary,
        reference: reference_cursor,
    })
}

pub(crate) fn lower_filter(
    ctx: &CompilerContext<'_>,
    lowering: &mut Lowering,
    steps: &mut Vec<WorkflowStep>,
    cursor: Cursor,
) -> Cursor {
    let Some(filters) = &ctx.ir.filters else {
        return cursor;
    };

    let id = lowering.next_id();
    steps.push(
        transform_step(
            &id,
            "Filter records",
            TransformOperation::Filter,
            &cursor.reference,
            json!({ "condition": filters.to_condition() }),
        )
        .depends_on([cursor.step_id]),
    );
    Cursor::data_of(&id)
}

fn rhai_literal<T: serde::Serialize + ?Sized>(value: &T) -> String {
    // JSON string and array literals are valid rhai literals.
    serde_json::to_string(value).unwrap_or_else(|_| "[]".to_string())
}

/// Three-step lowering: tag each item, keep the tagged ones, untag.
fn tagged_filter(
    lowering: &mut Lowering,
    steps: &mut Vec<WorkflowStep>,
    cursor: Cursor,
    tag: (String, serde_json::Value),
    keep: bool,
    extra_deps: Vec<String>,
    label: &str,
) -> Cursor {
    let (expression, extra) = tag;

    let tag_id = lowering.next_id();
    let mut config = json!({ "expression": expression });
    if let (Some(map), serde_json::Value::Object(extra)) = (config.as_object_mut(), extra) {
        map.extend(extra);
    }
    steps.push(
        transform_step(
            &tag_id,
            format!("Tag {}", label),
            TransformOperation::Map,
            &cursor.reference,
            config,
        )
        .depends_on(std::iter::once(cursor.step_id).chain(extra_deps)),
    );

    let filter_id = lowering.next_id();
    steps.push(
        transform_step(
            &filter_id,
            format!("Keep {}", label),
            TransformOperation::Filter,
            &reference::data_ref(&tag_id),
            json!({ "condition": Condition::simple("1", ConditionOperator::Eq, json!(keep)) }),
        )
        .depends_on([tag_id]),
    );

    let untag_id = lowering.next_id();
    steps.push(
        transform_step(
            &untag_id,
            format!("Unwrap {}", label),
            TransformOperation::Map,
            &reference::data_ref(&filter_id),
            json!({ "expression": "item[0]" }),
        )
        .depends_on([filter_id]),
    );

    Cursor::data_of(&untag_id)
}

/// Key based and time window deduplication.
pub(crate) fn lower_dedup(
    ctx: &CompilerContext<'_>,
    lowering: &mut Lowering,
    steps: &mut Vec<WorkflowStep>,
    cursor: Cursor,
    reference_source: Option<&Cursor>,
) -> Cursor {
    let Some(rule) = &ctx.ir.deduplication else {
        return cursor;
    };
    let mut cursor = cursor;

    if let Some(expression) = key_expression(rule, &ctx.config.dedup_key_delimiter) {
        let (existing, extra_deps) = match reference_source {
            Some(r) => (json!(r.reference), vec![r.step_id.clone()]),
            None => {
                lowering.warn(
                    "deduplication: no reference data source, every item is treated as new"
                        .to_string(),
                );
                (serde_json::Value::Null, Vec::new())
            }
        };
        cursor = tagged_filter(
            lowering,
            steps,
            cursor,
            (
                expression,
                json!({ "bindings": { "existing": existing }, "collections": ["existing"] }),
            ),
            true,
            extra_deps,
            "new records",
        );
    }

    if let Some((hours, field)) = rule.time_window() {
        let window_ms = (hours * 3_600_000.0).round() as i64;
        let expression = format!(
            "[item, parse_ts(item[{}]) > (run_started_ms - {})]",
            rhai_literal(field),
            window_ms
        );
        cursor = tagged_filter(
            lowering,
            steps,
            cursor,
            (expression, json!({})),
            false,
            Vec::new(),
            "records outside time window",
        );
    }

    cursor
}

fn key_expression(rule: &DeduplicationRule, delimiter: &str) -> Option<String> {
    let fields = rule.key_fields()?;
    let reference_fields = rule.reference_fields()?;
    let delimiter = rhai_literal(delimiter);
    Some(format!(
        "[item, !(composite_key(item, {fields}, {delim}) in key_set(existing ?? [], {ref_fields}, {delim}))]",
        fields = rhai_literal(&fields),
        ref_fields = rhai_literal(&reference_fields),
        delim = delimiter,
    ))
}

fn ai_params(
    op: &AiOperation,
    schema: &OperationSchema,
    content: Option<(String, String)>,
) -> BTreeMap<String, serde_json::Value> {
    let mut params = op.config.clone();
    if !op.instruction.is_empty() && schema.parameters_schema.get("instruction").is_some() {
        params
            .entry("instruction".to_string())
            .or_insert_with(|| json!(op.instruction));
    }
    if let Some((param, value)) = content {
        params.insert(param, json!(value));
    }
    params
}

/// AI operations in IR order, each reading the current data.
pub(crate) fn lower_ai_operations(
    ctx: &CompilerContext<'_>,
    lowering: &mut Lowering,
    steps: &mut Vec<WorkflowStep>,
    cursor: Cursor,
) -> CompileResult<Cursor> {
    let mut cursor = cursor;

    for (idx, op) in ctx.ir.ai_operations.iter().enumerate() {
        let node = format!("ai_operations[{}]", idx);
        let schema = ctx.schema(&op.plugin_key, &op.operation_type)?;
        let param = content_param(op.content_param.as_deref(), schema, &node, lowering);

        if op.per_item {
            let max_concurrency = ctx.max_concurrency(lowering);
            let scatter_id = lowering.next_id();
            let body_id = lowering.next_id();
            let body = action_step(
                &body_id,
                format!("{} item", op.op_type),
                &op.plugin_key,
                &op.operation_type,
                ai_params(op, schema, param.map(|p| (p, reference::binding_ref("item")))),
            );

            steps.push(
                WorkflowStep::new(
                    scatter_id.clone(),
                    format!("{} each item", op.op_type),
                    StepKind::ScatterGather(ScatterGatherStep {
                        scatter: ScatterSpec {
                            input: cursor.reference.clone(),
                            item_variable: "item".to_string(),
                            steps: vec![body],
                            max_concurrency: Some(max_concurrency),
                            on_item_error: ItemErrorPolicy::FailFast,
                        },
                        gather: GatherSpec {
                            operation: GatherOperation::Collect,
                            output_variable: Some(format!("{}_results", op.op_type)),
                            combiner: None,
                        },
                    }),
                )
                .depends_on([cursor.step_id.clone()]),
            );
            cursor = Cursor::data_of(&scatter_id);
        } else {
            let id = lowering.next_id();
            steps.push(
                action_step(
                    &id,
                    op.op_type.clone(),
                    &op.plugin_key,
                    &op.operation_type,
                    ai_params(op, schema, param.map(|p| (p, cursor.reference.clone()))),
                )
                .depends_on([cursor.step_id.clone()]),
            );
            cursor = Cursor::new(id.clone(), ctx.output_ref(&id, schema));
        }
    }

    Ok(cursor)
}
