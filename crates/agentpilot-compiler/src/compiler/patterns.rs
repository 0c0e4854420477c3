//! Pattern detection and delivery topology.

use serde_json::json;

use super::context::{CompilerContext, Cursor, Lowering};
use super::render::{lower_render, RenderScope};
use super::stages::{
    action_step, content_param, lower_ai_operations, lower_dedup, lower_filter, lower_sources,
    transform_step,
};
use crate::error::{CompilationError, CompileResult};
use crate::ir::{DeclarativeIR, Destination};
use crate::workflow::{
    reference, GatherOperation, GatherSpec, ItemErrorPolicy, ParallelGroupStep, PatternType,
    ScatterGatherStep, ScatterSpec, StepKind, TransformOperation, WorkflowStep,
};

/// Pick the compilation pattern. First match wins.
pub fn detect_pattern(ir: &DeclarativeIR) -> PatternType {
    let rules = &ir.delivery_rules;
    let per_item_render = ir.rendering.as_ref().map(|r| r.per_item).unwrap_or(false);

    if !rules.multiple_destinations.is_empty() {
        PatternType::MultiDestination
    } else if ir.grouping.is_some() {
        PatternType::Grouped
    } else if rules.per_item_delivery.is_some() || per_item_render {
        PatternType::PerItem
    } else if ir.deduplication.is_some() {
        PatternType::Deduplicated
    } else if ir.filters.is_some() {
        PatternType::Filtered
    } else {
        PatternType::Linear
    }
}

/// Lower the whole IR into top-level steps.
pub(crate) fn lower(
    ctx: &CompilerContext<'_>,
    lowering: &mut Lowering,
) -> CompileResult<Vec<WorkflowStep>> {
    check_topology(ctx.ir, ctx.pattern)?;

    let mut steps = Vec::new();
    let sources = lower_sources(ctx, lowering, &mut steps)?;
    let cursor = lower_filter(ctx, lowering, &mut steps, sources.primary);
    let cursor = lower_dedup(ctx, lowering, &mut steps, cursor, sources.reference.as_ref());
    let cursor = lower_ai_operations(ctx, lowering, &mut steps, cursor)?;

    match ctx.pattern {
        PatternType::Linear | PatternType::Filtered | PatternType::Deduplicated => {
            lower_summary(ctx, lowering, &mut steps, cursor)?
        }
        PatternType::PerItem => lower_per_item(ctx, lowering, &mut steps, cursor)?,
        PatternType::Grouped => lower_grouped(ctx, lowering, &mut steps, cursor)?,
        PatternType::MultiDestination => lower_multi_destination(ctx, lowering, &mut steps, cursor)?,
    }

    Ok(steps)
}

/// Delivery shapes no deterministic lowering covers.
fn check_topology(ir: &DeclarativeIR, pattern: PatternType) -> CompileResult<()> {
    let rules = &ir.delivery_rules;
    match pattern {
        PatternType::Grouped
            if rules.per_group_delivery.is_none() && rules.summary_delivery.is_none() =>
        {
            Err(CompilationError::UnsupportedPattern(
                "grouping requires per_group_delivery or summary_delivery".to_string(),
            ))
        }
        PatternType::PerItem
            if rules.per_item_delivery.is_none() && rules.summary_delivery.is_none() =>
        {
            Err(CompilationError::UnsupportedPattern(
                "per-item rendering requires per_item_delivery or summary_delivery".to_string(),
            ))
        }
        PatternType::Linear | PatternType::Filtered | PatternType::Deduplicated
            if rules.summary_delivery.is_none() =>
        {
            Err(CompilationError::UnsupportedPattern(format!(
                "{} pattern needs summary_delivery, found only per_group_delivery without grouping",
                pattern
            )))
        }
        PatternType::MultiDestination
            if rules.per_item_delivery.is_some() || rules.per_group_delivery.is_some() =>
        {
            Err(CompilationError::UnsupportedPattern(
                "multiple_destinations cannot be combined with per-item or per-group delivery"
                    .to_string(),
            ))
        }
        _ => Ok(()),
    }
}

/// Delivery action for one destination, with `content` bound to the
/// destination's content parameter.
fn deliver(
    ctx: &CompilerContext<'_>,
    lowering: &mut Lowering,
    id: &str,
    dest: &Destination,
    node: &str,
    content: &str,
) -> CompileResult<WorkflowStep> {
    let schema = ctx.schema(&dest.plugin_key, &dest.operation_type)?;
    let mut params = dest.config.clone();

    if let Some(param) = content_param(dest.content_param.as_deref(), schema, node, lowering) {
        if params.contains_key(&param) {
            lowering.warn(format!(
                "{}: config already sets content parameter '{}', keeping configured value",
                node, param
            ));
        } else {
            params.insert(param, json!(content));
        }
    }

    Ok(action_step(
        id,
        format!("Deliver to {}", dest.label()),
        &dest.plugin_key,
        &dest.operation_type,
        params,
    ))
}

fn summary_destination<'a>(ctx: &'a CompilerContext<'_>) -> CompileResult<&'a Destination> {
    ctx.ir
        .delivery_rules
        .summary_delivery
        .as_ref()
        .ok_or_else(|| CompilationError::missing("delivery_rules", "summary_delivery"))
}

fn lower_summary(
    ctx: &CompilerContext<'_>,
    lowering: &mut Lowering,
    steps: &mut Vec<WorkflowStep>,
    cursor: Cursor,
) -> CompileResult<()> {
    let dest = summary_destination(ctx)?;
    let cursor = lower_render(ctx.ir.rendering.as_ref(), RenderScope::List, lowering, steps, cursor);

    let id = lowering.next_id();
    let step = deliver(
        ctx,
        lowering,
        &id,
        dest,
        "delivery_rules.summary_delivery",
        &cursor.reference,
    )?;
    steps.push(step.depends_on([cursor.step_id]));
    Ok(())
}

/// Scatter over `input` running `render -> deliver` per element.
#[allow(clippy::too_many_arguments)]
fn lower_fan_out(
    ctx: &CompilerContext<'_>,
    lowering: &mut Lowering,
    steps: &mut Vec<WorkflowStep>,
    upstream: Cursor,
    item_variable: &str,
    render_input: String,
    render_scope: RenderScope,
    dest: (&Destination, &str),
    name: String,
) -> CompileResult<()> {
    let max_concurrency = ctx.max_concurrency(lowering);
    let scatter_id = lowering.next_id();

    let mut body = Vec::new();
    let item_cursor = Cursor::new(String::new(), render_input);
    let rendered = lower_render(
        ctx.ir.rendering.as_ref(),
        render_scope,
        lowering,
        &mut body,
        item_cursor,
    );
    // The render step, if any, depends on nothing inside the body.
    if let Some(first) = body.first_mut() {
        first.dependencies.clear();
    }

    let (dest, node) = dest;
    let deliver_id = lowering.next_id();
    let mut step = deliver(ctx, lowering, &deliver_id, dest, node, &rendered.reference)?;
    if !rendered.step_id.is_empty() {
        step = step.depends_on([rendered.step_id]);
    }
    body.push(step);

    steps.push(
        WorkflowStep::new(
            scatter_id,
            name,
            StepKind::ScatterGather(ScatterGatherStep {
                scatter: ScatterSpec {
                    input: upstream.reference,
                    item_variable: item_variable.to_string(),
                    steps: body,
                    max_concurrency: Some(max_concurrency),
                    on_item_error: ItemErrorPolicy::FailFast,
                },
                gather: GatherSpec {
                    operation: GatherOperation::Collect,
                    output_variable: Some("deliveries".to_string()),
                    combiner: None,
                },
            }),
        )
        .depends_on([upstream.step_id]),
    );
    Ok(())
}

fn lower_per_item(
    ctx: &CompilerContext<'_>,
    lowering: &mut Lowering,
    steps: &mut Vec<WorkflowStep>,
    cursor: Cursor,
) -> CompileResult<()> {
    let rules = &ctx.ir.delivery_rules;
    let (dest, node) = match &rules.per_item_delivery {
        Some(dest) => (dest, "delivery_rules.per_item_delivery"),
        None => {
            lowering.warn(
                "per-item rendering without per_item_delivery, delivering each item to summary_delivery"
                    .to_string(),
            );
            (summary_destination(ctx)?, "delivery_rules.summary_delivery")
        }
    };

    lower_fan_out(
        ctx,
        lowering,
        steps,
        cursor,
        "item",
        reference::binding_ref("item"),
        RenderScope::Record,
        (dest, node),
        format!("Deliver each item to {}", dest.label()),
    )
}

fn lower_grouped(
    ctx: &CompilerContext<'_>,
    lowering: &mut Lowering,
    steps: &mut Vec<WorkflowStep>,
    cursor: Cursor,
) -> CompileResult<()> {
    let Some(grouping) = &ctx.ir.grouping else {
        return Err(CompilationError::missing("ir", "grouping"));
    };

    let group_id = lowering.next_id();
    steps.push(
        transform_step(
            &group_id,
            format!("Group by {}", grouping.group_by),
            TransformOperation::Group,
            &cursor.reference,
            json!({ "group_by": grouping.group_by }),
        )
        .depends_on([cursor.step_id]),
    );

    let rules = &ctx.ir.delivery_rules;
    let (dest, node) = match &rules.per_group_delivery {
        Some(dest) => (dest, "delivery_rules.per_group_delivery"),
        None => {
            lowering.warn(
                "grouping without per_group_delivery, delivering each group to summary_delivery"
                    .to_string(),
            );
            (summary_destination(ctx)?, "delivery_rules.summary_delivery")
        }
    };

    lower_fan_out(
        ctx,
        lowering,
        steps,
        Cursor::data_of(&group_id),
        "group",
        "{{group.items}}".to_string(),
        RenderScope::List,
        (dest, node),
        format!("Deliver each group to {}", dest.label()),
    )
}

fn lower_multi_destination(
    ctx: &CompilerContext<'_>,
    lowering: &mut Lowering,
    steps: &mut Vec<WorkflowStep>,
    cursor: Cursor,
) -> CompileResult<()> {
    if ctx.ir.delivery_rules.summary_delivery.is_some() {
        lowering.warn(
            "summary_delivery is ignored when multiple_destinations is set".to_string(),
        );
    }

    let cursor = lower_render(ctx.ir.rendering.as_ref(), RenderScope::List, lowering, steps, cursor);

    let group_id = lowering.next_id();
    let mut children = Vec::new();
    for (idx, dest) in ctx.ir.delivery_rules.multiple_destinations.iter().enumerate() {
        let node = format!("delivery_rules.multiple_destinations[{}]", idx);
        let id = lowering.next_id();
        children.push(deliver(ctx, lowering, &id, dest, &node, &cursor.reference)?);
    }

    steps.push(
        WorkflowStep::new(
            group_id,
            format!("Deliver to {} destinations", children.len()),
            StepKind::ParallelGroup(ParallelGroupStep { steps: children }),
        )
        .depends_on([cursor.step_id]),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse_ir;

    fn ir(extra: &str, delivery: &str) -> DeclarativeIR {
        parse_ir(&format!(
            r#"{{"data_sources": [{{"plugin_key": "s", "operation_type": "r"}}],
                {} "delivery_rules": {}}}"#,
            extra, delivery
        ))
        .unwrap()
    }

    const SUMMARY: &str = r#"{"summary_delivery": {"plugin_key": "m", "operation_type": "send"}}"#;

    #[test]
    fn test_detect_linear_and_filtered() {
        assert_eq!(detect_pattern(&ir("", SUMMARY)), PatternType::Linear);
        assert_eq!(
            detect_pattern(&ir(r#""filters": {"keywords": ["a"], "field": "f"},"#, SUMMARY)),
            PatternType::Filtered
        );
    }

    #[test]
    fn test_detect_priority() {
        // Dedup + filter: dedup wins.
        let both = ir(
            r#""filters": {"keywords": ["a"], "field": "f"}, "deduplication": {"identifier_field": "id"},"#,
            SUMMARY,
        );
        assert_eq!(detect_pattern(&both), PatternType::Deduplicated);

        // Grouping beats per-item.
        let grouped = ir(
            r#""grouping": {"group_by": "owner"},"#,
            r#"{"per_item_delivery": {"plugin_key": "m", "operation_type": "send"},
                "per_group_delivery": {"plugin_key": "m", "operation_type": "send"}}"#,
        );
        assert_eq!(detect_pattern(&grouped), PatternType::Grouped);

        // Multiple destinations beat everything.
        let multi = ir(
            r#""grouping": {"group_by": "owner"},"#,
            r#"{"multiple_destinations": [{"plugin_key": "m", "operation_type": "send"}]}"#,
        );
        assert_eq!(detect_pattern(&multi), PatternType::MultiDestination);
    }

    #[test]
    fn test_per_group_without_grouping_is_unsupported() {
        let ir = ir(
            "",
            r#"{"per_group_delivery": {"plugin_key": "m", "operation_type": "send"}}"#,
        );
        let err = check_topology(&ir, detect_pattern(&ir)).unwrap_err();
        assert!(matches!(err, CompilationError::UnsupportedPattern(_)));
    }
}
