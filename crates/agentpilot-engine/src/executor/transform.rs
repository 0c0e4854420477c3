//! Transform steps: pure in-memory data operations.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

use agentpilot_compiler::workflow::{reference, Condition, Reference, TransformOperation, TransformStep};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use super::extract::{array_input, transform_input};
use super::StepExecutor;
use crate::condition::{self, as_text, FieldSource};
use crate::context::ExecutionContext;
use crate::error::{EngineResult, ExecutionError, TransformError};
use crate::output::StepOutput;

/// Capability name recorded on transform outputs.
const TRANSFORM: &str = "transform";

type TransformResult<T> = Result<T, TransformError>;

#[derive(Debug, Default, Deserialize)]
struct FilterConfig {
    condition: Option<Condition>,
    expression: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MapConfig {
    expression: Option<String>,
    template: Option<String>,
    fields: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Deserialize)]
struct SortConfig {
    field: String,
    #[serde(default)]
    order: SortOrder,
}

#[derive(Debug, Deserialize)]
struct GroupConfig {
    group_by: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum AggregateOp {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Deserialize)]
struct AggregateConfig {
    operation: AggregateOp,
    field: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FieldConfig {
    field: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DeduplicateConfig {
    field: Option<String>,
    fields: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ReduceConfig {
    expression: String,
    #[serde(default)]
    initial: Value,
}

#[derive(Debug, Default, Deserialize)]
struct JoinConfig {
    separator: Option<String>,
    field: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PivotConfig {
    key_field: String,
    value_field: String,
}

#[derive(Debug, Default, Deserialize)]
struct SplitConfig {
    separator: Option<String>,
    size: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ExpandConfig {
    field: String,
}

#[derive(Debug, Default, Deserialize)]
struct SetConfig {
    value: Option<Value>,
    template: Option<String>,
}

fn parse_config<T: DeserializeOwned>(operation: &str, config: &Value) -> TransformResult<T> {
    let config = if config.is_null() { json!({}) } else { config.clone() };
    serde_json::from_value(config).map_err(|e| TransformError::config(operation, e.to_string()))
}

/// Values bound for expressions: named bindings plus the run clock.
struct Scope {
    vars: Vec<(String, Value)>,
}

impl Scope {
    fn new(bindings: BTreeMap<String, Value>, ctx: &ExecutionContext) -> Self {
        let mut vars: Vec<(String, Value)> = bindings
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        vars.push(("bindings".to_string(), json!(bindings)));
        vars.push(("run_started_ms".to_string(), json!(ctx.run_started_ms())));
        Self { vars }
    }

    fn with<'a>(&'a self, extra: &[(&'a str, &'a Value)]) -> Vec<(&'a str, &'a Value)> {
        self.vars
            .iter()
            .map(|(k, v)| (k.as_str(), v))
            .chain(extra.iter().copied())
            .collect()
    }
}

fn field_of(item: &Value, field: &str) -> Value {
    item.field(field).unwrap_or(Value::Null)
}

/// Text form used for keys and joins.
fn text_of(value: &Value) -> String {
    as_text(value).unwrap_or_else(|| match value {
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        json!(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Bindings listed under `config.collections` stand for arrays of records.
/// They get the same extraction as transform inputs; only null means empty.
fn collect_bindings(config: &Value, bindings: &mut BTreeMap<String, Value>) -> TransformResult<()> {
    let Some(names) = config.get("collections").and_then(Value::as_array) else {
        return Ok(());
    };
    for name in names.iter().filter_map(Value::as_str) {
        if let Some(value) = bindings.get_mut(name) {
            if !value.is_null() {
                let items = array_input(&format!("binding '{}'", name), value.take())?;
                *value = Value::Array(items);
            }
        }
    }
    Ok(())
}

/// Ordering for sort keys: numbers, then strings, missing values last.
fn compare_keys(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        _ => {}
    }
    if let (Value::Number(_), Value::Number(_)) = (a, b) {
        if let (Some(x), Some(y)) = (number(a), number(b)) {
            return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
        }
    }
    text_of(a).cmp(&text_of(b))
}

impl StepExecutor {
    /// Run a transform step against the context.
    pub fn run_transform(
        &self,
        step_id: &str,
        transform: &TransformStep,
        ctx: &ExecutionContext,
    ) -> EngineResult<StepOutput> {
        let started = Instant::now();
        let operation = transform.operation;
        let wrap = |source: TransformError| ExecutionError::Transform {
            step: step_id.to_string(),
            source,
        };

        let input = transform.input.as_deref().ok_or_else(|| wrap(TransformError::MissingInput))?;
        let raw = self
            .resolve_value(&Value::String(input.to_string()), ctx)
            .map_err(|e| e.in_step(step_id))?;
        let input = transform_input(operation, raw).map_err(wrap)?;
        let mut bindings = self
            .resolve_bindings(&transform.config, ctx)
            .map_err(|e| e.in_step(step_id))?;
        collect_bindings(&transform.config, &mut bindings).map_err(wrap)?;

        let data = self
            .apply(operation, &transform.config, input, bindings, ctx)
            .map_err(wrap)?;

        tracing::debug!(step = step_id, operation = %operation, "Transform applied");
        Ok(StepOutput::success(
            step_id,
            TRANSFORM,
            operation.as_str(),
            data,
            started.elapsed().as_millis() as u64,
        ))
    }

    /// Resolve `config.bindings`. A reference to a missing field binds null.
    fn resolve_bindings(
        &self,
        config: &Value,
        ctx: &ExecutionContext,
    ) -> EngineResult<BTreeMap<String, Value>> {
        let mut out = BTreeMap::new();
        let Some(bindings) = config.get("bindings").and_then(Value::as_object) else {
            return Ok(out);
        };
        for (name, value) in bindings {
            let resolved = match value {
                Value::String(s) => match reference::exact(s) {
                    Some(path) => {
                        let reference = Reference::parse(path)
                            .map_err(|e| ExecutionError::InvalidReference(e.to_string()))?;
                        ctx.resolve_lenient(&reference)?
                    }
                    None => self.resolve_value(value, ctx)?,
                },
                other => self.resolve_value(other, ctx)?,
            };
            out.insert(name.clone(), resolved);
        }
        Ok(out)
    }

    fn apply(
        &self,
        operation: TransformOperation,
        config: &Value,
        input: Value,
        bindings: BTreeMap<String, Value>,
        ctx: &ExecutionContext,
    ) -> TransformResult<Value> {
        let name = operation.as_str();
        let scope = Scope::new(bindings, ctx);

        match operation {
            TransformOperation::Filter => self.filter(parse_config(name, config)?, items(input), &scope),
            TransformOperation::Map => self.map(parse_config(name, config)?, items(input), &scope, ctx),
            TransformOperation::Sort => sort(parse_config(name, config)?, items(input)),
            TransformOperation::Group => group(parse_config(name, config)?, items(input)),
            TransformOperation::Aggregate => aggregate(parse_config(name, config)?, items(input)),
            TransformOperation::Flatten => flatten(parse_config(name, config)?, items(input)),
            TransformOperation::Deduplicate => deduplicate(parse_config(name, config)?, items(input)),
            TransformOperation::Reduce => self.reduce(parse_config(name, config)?, items(input), &scope),
            TransformOperation::Join => join(parse_config(name, config)?, input),
            TransformOperation::Pivot => pivot(parse_config(name, config)?, input),
            TransformOperation::Split => split(parse_config(name, config)?, input),
            TransformOperation::Expand => expand(parse_config(name, config)?, input),
            TransformOperation::Set => self.set(parse_config(name, config)?, input, ctx),
        }
    }

    fn filter(&self, config: FilterConfig, items: Vec<Value>, scope: &Scope) -> TransformResult<Value> {
        let mut kept = Vec::new();
        match (config.condition, config.expression) {
            (Some(condition), _) => {
                for item in items {
                    if condition::evaluate(&condition, &item)? {
                        kept.push(item);
                    }
                }
            }
            (None, Some(expression)) => {
                let ast = self.expressions.compile(&expression)?;
                for (index, item) in items.into_iter().enumerate() {
                    let index_value = json!(index);
                    let vars = scope.with(&[("item", &item), ("index", &index_value)]);
                    if self.expressions.eval_bool(&ast, &vars)? {
                        kept.push(item);
                    }
                }
            }
            (None, None) => {
                return Err(TransformError::config("filter", "needs a condition or an expression"))
            }
        }
        Ok(Value::Array(kept))
    }

    fn map(
        &self,
        config: MapConfig,
        items: Vec<Value>,
        scope: &Scope,
        ctx: &ExecutionContext,
    ) -> TransformResult<Value> {
        let mut out = Vec::with_capacity(items.len());
        if let Some(expression) = config.expression {
            let ast = self.expressions.compile(&expression)?;
            for (index, item) in items.iter().enumerate() {
                let index_value = json!(index);
                let vars = scope.with(&[("item", item), ("index", &index_value)]);
                out.push(self.expressions.eval(&ast, &vars)?);
            }
        } else if let Some(template) = config.template {
            let mut context = ctx.template_context();
            for (index, item) in items.into_iter().enumerate() {
                context.insert("item".to_string(), item);
                context.insert("index".to_string(), json!(index));
                let rendered = self
                    .templates
                    .render(&template, &Value::Object(context.clone()))
                    .map_err(|e| TransformError::Template(e.to_string()))?;
                out.push(Value::String(rendered));
            }
        } else if let Some(fields) = config.fields {
            for item in &items {
                let picked: serde_json::Map<String, Value> = fields
                    .iter()
                    .map(|f| (f.clone(), field_of(item, f)))
                    .collect();
                out.push(Value::Object(picked));
            }
        } else {
            return Err(TransformError::config(
                "map",
                "needs an expression, a template or fields",
            ));
        }
        Ok(Value::Array(out))
    }

    fn reduce(&self, config: ReduceConfig, items: Vec<Value>, scope: &Scope) -> TransformResult<Value> {
        let ast = self.expressions.compile(&config.expression)?;
        let mut acc = config.initial;
        for (index, item) in items.iter().enumerate() {
            let index_value = json!(index);
            let vars = scope.with(&[("acc", &acc), ("item", item), ("index", &index_value)]);
            acc = self.expressions.eval(&ast, &vars)?;
        }
        Ok(acc)
    }

    fn set(&self, config: SetConfig, input: Value, ctx: &ExecutionContext) -> TransformResult<Value> {
        match (config.value, config.template) {
            (Some(value), _) => self
                .resolve_value(&value, ctx)
                .map_err(|e| TransformError::config("set", e.to_string())),
            (None, Some(template)) => {
                let mut context = ctx.template_context();
                context.insert("input".to_string(), input);
                self.templates
                    .render(&template, &Value::Object(context))
                    .map(Value::String)
                    .map_err(|e| TransformError::Template(e.to_string()))
            }
            (None, None) => Ok(input),
        }
    }
}

fn items(input: Value) -> Vec<Value> {
    match input {
        Value::Array(items) => items,
        other => vec![other],
    }
}

fn sort(config: SortConfig, mut items: Vec<Value>) -> TransformResult<Value> {
    let descending = matches!(config.order, SortOrder::Desc);
    items.sort_by(|a, b| {
        let (ka, kb) = (field_of(a, &config.field), field_of(b, &config.field));
        match (ka.is_null(), kb.is_null(), descending) {
            (false, false, true) => compare_keys(&kb, &ka),
            _ => compare_keys(&ka, &kb),
        }
    });
    Ok(Value::Array(items))
}

/// `[{key, items, count}]`, groups in first-seen order.
fn group(config: GroupConfig, items: Vec<Value>) -> TransformResult<Value> {
    let mut order: Vec<(Value, Vec<Value>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for item in items {
        let key = field_of(&item, &config.group_by);
        let slot = *index.entry(key.to_string()).or_insert_with(|| {
            order.push((key.clone(), Vec::new()));
            order.len() - 1
        });
        order[slot].1.push(item);
    }
    Ok(Value::Array(
        order
            .into_iter()
            .map(|(key, items)| json!({"key": key, "count": items.len(), "items": items}))
            .collect(),
    ))
}

fn aggregate(config: AggregateConfig, items: Vec<Value>) -> TransformResult<Value> {
    let values: Vec<Value> = match &config.field {
        Some(field) => items.iter().map(|i| field_of(i, field)).collect(),
        None => items,
    };
    let numbers = || values.iter().filter_map(number);

    let result = match config.operation {
        AggregateOp::Count if config.field.is_some() => {
            json!(values.iter().filter(|v| !v.is_null()).count())
        }
        AggregateOp::Count => json!(values.len()),
        AggregateOp::Sum => number_value(numbers().sum()),
        AggregateOp::Avg => {
            let (sum, count) = numbers().fold((0.0, 0usize), |(s, c), n| (s + n, c + 1));
            if count == 0 {
                Value::Null
            } else {
                number_value(sum / count as f64)
            }
        }
        AggregateOp::Min => numbers().reduce(f64::min).map(number_value).unwrap_or(Value::Null),
        AggregateOp::Max => numbers().reduce(f64::max).map(number_value).unwrap_or(Value::Null),
    };
    Ok(result)
}

/// One level of flattening, of the items or of one of their fields.
fn flatten(config: FieldConfig, items: Vec<Value>) -> TransformResult<Value> {
    let mut out = Vec::new();
    for item in items {
        let value = match &config.field {
            Some(field) => field_of(&item, field),
            None => item,
        };
        match value {
            Value::Array(inner) => out.extend(inner),
            Value::Null if config.field.is_some() => {}
            other => out.push(other),
        }
    }
    Ok(Value::Array(out))
}

/// Keep the first item of every key.
fn deduplicate(config: DeduplicateConfig, items: Vec<Value>) -> TransformResult<Value> {
    let fields: Option<Vec<String>> = config.fields.or_else(|| config.field.map(|f| vec![f]));
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in items {
        let key = match &fields {
            Some(fields) => fields
                .iter()
                .map(|f| text_of(&field_of(&item, f)))
                .collect::<Vec<_>>()
                .join("|"),
            None => item.to_string(),
        };
        if seen.insert(key) {
            out.push(item);
        }
    }
    Ok(Value::Array(out))
}

fn join(config: JoinConfig, input: Value) -> TransformResult<Value> {
    let separator = config.separator.unwrap_or_else(|| ", ".to_string());
    match input {
        Value::Array(items) => {
            let parts: Vec<String> = items
                .iter()
                .map(|item| match &config.field {
                    Some(field) => text_of(&field_of(item, field)),
                    None => text_of(item),
                })
                .collect();
            Ok(Value::String(parts.join(&separator)))
        }
        other => Ok(other),
    }
}

fn pivot(config: PivotConfig, input: Value) -> TransformResult<Value> {
    match input {
        Value::Array(items) => {
            let mut out = serde_json::Map::new();
            for item in &items {
                let key = field_of(item, &config.key_field);
                if key.is_null() {
                    continue;
                }
                out.insert(text_of(&key), field_of(item, &config.value_field));
            }
            Ok(Value::Object(out))
        }
        other => Ok(other),
    }
}

fn split(config: SplitConfig, input: Value) -> TransformResult<Value> {
    match input {
        Value::String(s) => {
            let separator = config
                .separator
                .ok_or_else(|| TransformError::config("split", "strings need a separator"))?;
            Ok(Value::Array(
                s.split(separator.as_str())
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
            ))
        }
        Value::Array(items) => {
            let size = config
                .size
                .filter(|s| *s > 0)
                .ok_or_else(|| TransformError::config("split", "arrays need a positive size"))?;
            Ok(Value::Array(
                items.chunks(size).map(|c| Value::Array(c.to_vec())).collect(),
            ))
        }
        other => Ok(other),
    }
}

/// One record per element of an array field, the other fields copied.
fn expand(config: ExpandConfig, input: Value) -> TransformResult<Value> {
    fn expand_one(field: &str, item: Value, out: &mut Vec<Value>) {
        let Value::Object(record) = item else {
            out.push(item);
            return;
        };
        match record.get(field) {
            Some(Value::Array(elements)) => {
                for element in elements {
                    let mut copy = record.clone();
                    copy.insert(field.to_string(), element.clone());
                    out.push(Value::Object(copy));
                }
            }
            _ => out.push(Value::Object(record)),
        }
    }

    let mut out = Vec::new();
    match input {
        Value::Array(items) => {
            for item in items {
                expand_one(&config.field, item, &mut out);
            }
        }
        Value::Object(_) => expand_one(&config.field, input, &mut out),
        other => return Ok(other),
    }
    Ok(Value::Array(out))
}
