//! Data references between steps.
//!
//! A reference is written `{{ root.segment.segment }}` where `root` is a
//! step id or an in-scope binding and each segment is an object key or a
//! numeric array index (`items.0` and `items[0]` are equivalent).

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;

static EXACT_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\{\{\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_\-]+|\[\d+\])*)\s*\}\}$")
        .expect("valid reference regex")
});

static REFERENCE_ROOT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\{\{-?\s*)([A-Za-z_][A-Za-z0-9_]*)").expect("valid reference root regex")
});

/// One path segment after the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Key(String),
    Index(usize),
}

impl Segment {
    /// Key form of the segment, used when an index is applied to an object.
    pub fn as_key(&self) -> String {
        match self {
            Segment::Key(k) => k.clone(),
            Segment::Index(i) => i.to_string(),
        }
    }
}

/// Reference parse errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReferenceError {
    #[error("Empty reference")]
    Empty,

    #[error("Invalid reference syntax: {0}")]
    Syntax(String),
}

/// A parsed reference path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    pub root: String,
    pub path: Vec<Segment>,
}

impl Reference {
    /// Parse a bare path (`step3.data.filtered`, `item[0]`).
    pub fn parse(expr: &str) -> Result<Self, ReferenceError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(ReferenceError::Empty);
        }

        let normalized = expr.replace('[', ".").replace(']', "");
        let mut parts = normalized.split('.');
        let root = parts.next().unwrap_or_default().to_string();
        if root.is_empty() {
            return Err(ReferenceError::Syntax(expr.to_string()));
        }

        let mut path = Vec::new();
        for part in parts {
            if part.is_empty() {
                return Err(ReferenceError::Syntax(expr.to_string()));
            }
            match part.parse::<usize>() {
                Ok(i) => path.push(Segment::Index(i)),
                Err(_) => path.push(Segment::Key(part.to_string())),
            }
        }

        Ok(Self { root, path })
    }

    /// Parse a string that consists of exactly one `{{ ... }}` reference.
    pub fn from_template(s: &str) -> Option<Self> {
        exact(s).and_then(|inner| Self::parse(inner).ok())
    }

    /// Reference to the `data` of a step output.
    pub fn data_of(step_id: &str) -> Self {
        Self {
            root: step_id.to_string(),
            path: vec![Segment::Key("data".to_string())],
        }
    }

    pub fn child(mut self, segment: Segment) -> Self {
        self.path.push(segment);
        self
    }

    pub fn to_template(&self) -> String {
        format!("{{{{{}}}}}", self)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root)?;
        for seg in &self.path {
            match seg {
                Segment::Key(k) => write!(f, ".{}", k)?,
                Segment::Index(i) => write!(f, ".{}", i)?,
            }
        }
        Ok(())
    }
}

/// Inner path of a string that is exactly one reference.
pub fn exact(s: &str) -> Option<&str> {
    EXACT_REFERENCE
        .captures(s.trim())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Whether a string contains any `{{ ... }}` expression.
pub fn is_template(s: &str) -> bool {
    s.contains("{{") && s.contains("}}")
}

/// Roots of every `{{ ... }}` expression in `s`, in order of appearance.
pub fn extract_roots(s: &str) -> Vec<String> {
    REFERENCE_ROOT
        .captures_iter(s)
        .filter_map(|c| c.get(2).map(|m| m.as_str().to_string()))
        .collect()
}

/// Rewrite reference roots found in `mapping`, leaving everything else intact.
pub fn rewrite_roots(s: &str, mapping: &BTreeMap<String, String>) -> String {
    REFERENCE_ROOT
        .replace_all(s, |caps: &regex::Captures| {
            let root = &caps[2];
            match mapping.get(root) {
                Some(new_root) => format!("{}{}", &caps[1], new_root),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// `{{<id>.data}}`
pub fn data_ref(step_id: &str) -> String {
    Reference::data_of(step_id).to_template()
}

/// `{{<id>.data.<field>}}`
pub fn field_ref(step_id: &str, field: &str) -> String {
    Reference::data_of(step_id)
        .child(Segment::Key(field.to_string()))
        .to_template()
}

/// `{{<binding>}}`
pub fn binding_ref(name: &str) -> String {
    format!("{{{{{}}}}}", name)
}

/// Collect every string with a `{{` inside a JSON value, depth-first.
pub fn collect_template_strings<'a>(value: &'a serde_json::Value, out: &mut Vec<&'a str>) {
    match value {
        serde_json::Value::String(s) if is_template(s) => out.push(s.as_str()),
        serde_json::Value::Array(items) => {
            for item in items {
                collect_template_strings(item, out);
            }
        }
        serde_json::Value::Object(map) => {
            for v in map.values() {
                collect_template_strings(v, out);
            }
        }
        _ => {}
    }
}

/// Apply `rewrite_roots` to every string inside a JSON value.
pub fn rewrite_value(value: &serde_json::Value, mapping: &BTreeMap<String, String>) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) if is_template(s) => {
            serde_json::Value::String(rewrite_roots(s, mapping))
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| rewrite_value(v, mapping)).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), rewrite_value(v, mapping)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_reference() {
        let r = Reference::parse("step3.data.filtered").unwrap();
        assert_eq!(r.root, "step3");
        assert_eq!(
            r.path,
            vec![
                Segment::Key("data".to_string()),
                Segment::Key("filtered".to_string())
            ]
        );

        let r = Reference::parse("item[0].name").unwrap();
        assert_eq!(r.path, vec![Segment::Index(0), Segment::Key("name".to_string())]);
        assert_eq!(r.to_string(), "item.0.name");
    }

    #[test]
    fn test_parse_invalid() {
        assert_eq!(Reference::parse("  "), Err(ReferenceError::Empty));
        assert!(Reference::parse("step1..data").is_err());
        assert!(Reference::parse(".data").is_err());
    }

    #[test]
    fn test_exact_reference() {
        assert_eq!(exact("{{step1.data}}"), Some("step1.data"));
        assert_eq!(exact(" {{ item }} "), Some("item"));
        assert_eq!(exact("Hello {{ item.name }}"), None);
        assert_eq!(exact("{{ item.name | upper }}"), None);
        assert!(Reference::from_template("{{step2.data.rows[1]}}").is_some());
    }

    #[test]
    fn test_extract_roots() {
        let roots = extract_roots("Hi {{ item.name }}, see {{step4.data.url}} and {{-step5}}");
        assert_eq!(roots, vec!["item", "step4", "step5"]);
        assert!(extract_roots("plain text").is_empty());
    }

    #[test]
    fn test_rewrite_roots() {
        let mut mapping = BTreeMap::new();
        mapping.insert("step3".to_string(), "step2".to_string());
        mapping.insert("step2".to_string(), "step3".to_string());

        let out = rewrite_roots("{{step3.data}} / {{ step2.data.x }} / {{item}}", &mapping);
        assert_eq!(out, "{{step2.data}} / {{ step3.data.x }} / {{item}}");
    }

    #[test]
    fn test_collect_and_rewrite_value() {
        let value = json!({"to": "a@x.com", "body": "{{step1.data}}", "extra": ["{{ step2 }}"]});
        let mut found = Vec::new();
        collect_template_strings(&value, &mut found);
        assert_eq!(found.len(), 2);

        let mut mapping = BTreeMap::new();
        mapping.insert("step1".to_string(), "step9".to_string());
        let rewritten = rewrite_value(&value, &mapping);
        assert_eq!(rewritten["body"], "{{step9.data}}");
        assert_eq!(rewritten["extra"][0], "{{ step2 }}");
    }

    #[test]
    fn test_ref_helpers() {
        assert_eq!(data_ref("step2"), "{{step2.data}}");
        assert_eq!(field_ref("step2", "rows"), "{{step2.data.rows}}");
        assert_eq!(binding_ref("item"), "{{item}}");
    }
}
