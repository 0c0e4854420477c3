//! Sandboxed expressions.
//!
//! Transforms that derive values (`map`, `filter`, `reduce`, tagging for
//! deduplication) evaluate rhai expressions. Only expressions are accepted,
//! not statements, every evaluation runs under an operation budget and the
//! engine registers pure helpers only.

use rhai::{Array, Dynamic, Engine, Map, Scope, AST};
use serde_json::Value;

use crate::error::ExpressionError;

/// Compiled-expression evaluator.
pub struct ExpressionEngine {
    engine: Engine,
}

impl ExpressionEngine {
    pub fn new(max_operations: u64) -> Self {
        let mut engine = Engine::new();
        engine.set_max_operations(max_operations);
        engine.set_max_expr_depths(64, 32);
        engine.set_max_string_size(1 << 20);
        engine.set_max_array_size(100_000);
        engine.set_max_map_size(100_000);

        engine.on_print(|msg| tracing::debug!(target: "rhai", "{}", msg));
        engine.on_debug(|msg, _, _| tracing::debug!(target: "rhai", "{}", msg));

        engine.register_fn("composite_key", |item: Dynamic, fields: Array, delim: &str| {
            composite_key(&item, &fields, delim)
        });
        engine.register_fn("key_set", |existing: Dynamic, fields: Array, delim: &str| {
            key_set(existing, &fields, delim)
        });
        engine.register_fn("parse_ts", |value: Dynamic| parse_ts(&dynamic_to_json(&value)));
        engine.register_fn("contains_any", |s: &str, needles: Array| -> bool {
            needles
                .into_iter()
                .filter_map(|n| n.into_string().ok())
                .any(|n| s.contains(n.as_str()))
        });
        engine.register_fn("lower", |s: &str| s.to_lowercase());

        Self { engine }
    }

    pub fn compile(&self, expression: &str) -> Result<AST, ExpressionError> {
        self.engine
            .compile_expression(expression)
            .map_err(|e| ExpressionError::Parse(e.to_string()))
    }

    /// Evaluate a compiled expression with `vars` bound as constants.
    pub fn eval(&self, ast: &AST, vars: &[(&str, &Value)]) -> Result<Value, ExpressionError> {
        let mut scope = Scope::new();
        for (name, value) in vars {
            scope.push_constant_dynamic(name.to_string(), json_to_dynamic(value));
        }
        self.engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, ast)
            .map(|d| dynamic_to_json(&d))
            .map_err(|e| ExpressionError::Eval(e.to_string()))
    }

    /// Compile and evaluate once.
    pub fn eval_str(&self, expression: &str, vars: &[(&str, &Value)]) -> Result<Value, ExpressionError> {
        let ast = self.compile(expression)?;
        self.eval(&ast, vars)
    }

    /// Evaluate an expression that must produce a boolean.
    pub fn eval_bool(&self, ast: &AST, vars: &[(&str, &Value)]) -> Result<bool, ExpressionError> {
        match self.eval(ast, vars)? {
            Value::Bool(b) => Ok(b),
            other => Err(ExpressionError::Type {
                expected: "boolean".to_string(),
                found: crate::error::type_name(&other).to_string(),
            }),
        }
    }
}

impl Default for ExpressionEngine {
    fn default() -> Self {
        Self::new(100_000)
    }
}

fn key_part(value: &Dynamic) -> String {
    if value.is_unit() {
        String::new()
    } else if let Ok(s) = value.clone().into_string() {
        s
    } else {
        match dynamic_to_json(value) {
            Value::String(s) => s,
            other => other.to_string(),
        }
    }
}

/// Join the named fields of a record into one string key. Scalars are
/// their own key.
fn composite_key(item: &Dynamic, fields: &Array, delim: &str) -> String {
    match item.read_lock::<Map>() {
        Some(map) => fields
            .iter()
            .map(|f| {
                let name = key_part(f);
                map.get(name.as_str()).map(key_part).unwrap_or_default()
            })
            .collect::<Vec<_>>()
            .join(delim),
        None => key_part(item),
    }
}

/// Set of composite keys of a reference collection, as a map for `in`.
/// A missing collection is an empty set.
fn key_set(existing: Dynamic, fields: &Array, delim: &str) -> Map {
    let mut keys = Map::new();
    if existing.is_unit() {
        return keys;
    }
    let items = if existing.is_array() {
        existing.into_array().unwrap_or_default()
    } else {
        vec![existing]
    };
    for item in &items {
        keys.insert(composite_key(item, fields, delim).into(), Dynamic::TRUE);
    }
    keys
}

/// Milliseconds since the epoch, `0` for a missing or unparsable value.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DD` (UTC) and epoch
/// numbers; values above 10^11 are taken as milliseconds.
pub fn parse_ts(value: &Value) -> i64 {
    match parse_millis(value) {
        Some(ms) => ms,
        None if value.is_null() => {
            tracing::debug!("Missing timestamp, using epoch 0");
            0
        }
        None => {
            tracing::warn!(value = %value, "Unparsable timestamp, using epoch 0");
            0
        }
    }
}

fn parse_millis(value: &Value) -> Option<i64> {
    use chrono::{DateTime, NaiveDate, NaiveDateTime};

    fn epoch(n: f64) -> i64 {
        if n.abs() > 1e11 {
            n as i64
        } else {
            (n * 1000.0) as i64
        }
    }

    match value {
        Value::Number(n) => n.as_f64().map(epoch),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.timestamp_millis());
            }
            for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
                if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
                    return Some(dt.and_utc().timestamp_millis());
                }
            }
            if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                return d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc().timestamp_millis());
            }
            s.parse::<f64>().ok().map(epoch)
        }
        _ => None,
    }
}

pub fn json_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else if let Some(f) = n.as_f64() {
                Dynamic::from(f)
            } else {
                Dynamic::UNIT
            }
        }
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(arr) => {
            let array: Array = arr.iter().map(json_to_dynamic).collect();
            Dynamic::from(array)
        }
        Value::Object(obj) => {
            let mut map = Map::new();
            for (k, v) in obj {
                map.insert(k.as_str().into(), json_to_dynamic(v));
            }
            Dynamic::from(map)
        }
    }
}

pub fn dynamic_to_json(value: &Dynamic) -> Value {
    if value.is_unit() {
        Value::Null
    } else if let Ok(b) = value.as_bool() {
        Value::Bool(b)
    } else if let Ok(i) = value.as_int() {
        Value::Number(i.into())
    } else if let Ok(f) = value.as_float() {
        serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    } else if value.is_string() {
        Value::String(value.clone().into_string().unwrap_or_default())
    } else if value.is_char() {
        Value::String(value.to_string())
    } else if let Some(array) = value.read_lock::<Array>() {
        Value::Array(array.iter().map(dynamic_to_json).collect())
    } else if let Some(map) = value.read_lock::<Map>() {
        Value::Object(
            map.iter()
                .map(|(k, v)| (k.to_string(), dynamic_to_json(v)))
                .collect(),
        )
    } else {
        Value::String(value.to_string())
    }
}
