//! `{{stepId}}` placeholder substitution over JSON step inputs.
//!
//! A placeholder names a step and optionally a dot path into its output:
//! `{{fetch}}`, `{{fetch.items.0.name}}`. A string consisting of exactly one
//! placeholder is replaced by the referenced value itself, keeping its JSON
//! type; placeholders embedded in longer text are interpolated. Object keys
//! are never templated.
//!
//! Substitution fails closed: a placeholder whose step has no recorded
//! output is a [`TemplateError::UnresolvedReference`], never left in place.

use std::collections::HashMap;

use serde_json::Value;

use crate::TemplateError;

/// A parsed placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub step: String,
    pub path: Vec<String>,
}

impl Reference {
    pub fn parse(raw: &str) -> Self {
        let mut parts = raw.trim().split('.');
        let step = parts.next().unwrap_or_default().trim().to_owned();
        let path = parts.map(|p| p.trim().to_owned()).collect();
        Self { step, path }
    }

    /// Look the reference up in the recorded step outputs.
    ///
    /// Missing path segments resolve to `null`; a missing step is an error.
    pub fn lookup(&self, outputs: &HashMap<String, Value>) -> Result<Value, TemplateError> {
        let root = outputs
            .get(&self.step)
            .ok_or_else(|| TemplateError::UnresolvedReference {
                reference: self.to_string(),
            })?;

        let mut current = root;
        for segment in &self.path {
            let next = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            match next {
                Some(v) => current = v,
                None => return Ok(Value::Null),
            }
        }
        Ok(current.clone())
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.step)?;
        for segment in &self.path {
            write!(f, ".{segment}")?;
        }
        Ok(())
    }
}

/// A piece of a template string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Segment<'a> {
    Text(&'a str),
    Placeholder(&'a str),
}

/// Split a string into literal text and `{{...}}` placeholders. An opening
/// `{{` without a closing `}}` is kept as text.
pub(crate) fn segments(source: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut rest = source;

    while let Some(open) = rest.find("{{") {
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            break;
        };
        if open > 0 {
            out.push(Segment::Text(&rest[..open]));
        }
        out.push(Segment::Placeholder(&after_open[..close]));
        rest = &after_open[close + 2..];
    }

    if !rest.is_empty() {
        out.push(Segment::Text(rest));
    }
    out
}

/// Every placeholder in a string.
pub fn references_in_str(source: &str) -> Vec<Reference> {
    segments(source)
        .into_iter()
        .filter_map(|s| match s {
            Segment::Placeholder(raw) => Some(Reference::parse(raw)),
            Segment::Text(_) => None,
        })
        .collect()
}

/// Every placeholder in a JSON value, depth-first.
pub fn references(value: &Value) -> Vec<Reference> {
    let mut out = Vec::new();
    collect_references(value, &mut out);
    out
}

fn collect_references(value: &Value, out: &mut Vec<Reference>) {
    match value {
        Value::String(s) => out.extend(references_in_str(s)),
        Value::Array(items) => items.iter().for_each(|v| collect_references(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_references(v, out)),
        _ => {}
    }
}

/// Substitute every placeholder in `value` with recorded step outputs.
pub fn resolve(value: &Value, outputs: &HashMap<String, Value>) -> Result<Value, TemplateError> {
    match value {
        Value::String(s) => resolve_str(s, outputs),
        Value::Array(items) => items
            .iter()
            .map(|v| resolve(v, outputs))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (key, v) in map {
                resolved.insert(key.clone(), resolve(v, outputs)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_str(source: &str, outputs: &HashMap<String, Value>) -> Result<Value, TemplateError> {
    let parts = segments(source);

    if let [Segment::Placeholder(raw)] = parts.as_slice() {
        return Reference::parse(raw).lookup(outputs);
    }

    let mut rendered = String::with_capacity(source.len());
    for part in parts {
        match part {
            Segment::Text(text) => rendered.push_str(text),
            Segment::Placeholder(raw) => match Reference::parse(raw).lookup(outputs)? {
                Value::String(s) => rendered.push_str(&s),
                other => rendered.push_str(&other.to_string()),
            },
        }
    }
    Ok(Value::String(rendered))
}
