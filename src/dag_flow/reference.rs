//! Reference expressions into the artifact store.
//!
//! Grammar:
//!
//! ```text
//! reference := step_id ( "." "artifacts" )? "." field segment*
//! segment   := "." field | "[" index "]"
//! ```
//!
//! Loop bodies use the same path syntax inside `{{ }}` placeholders, rooted at
//! the loop variable instead of a step id.

use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::store::ArtifactStore;
use crate::core::errors::{DagError, Result};

const ARTIFACTS_SEGMENT: &str = "artifacts";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub step_id: String,
    pub artifact: String,
    pub path: Vec<PathSegment>,
}

impl Reference {
    pub fn parse(input: &str) -> Result<Self> {
        let (step_id, segments) = parse_path(input)?;
        let mut segments = segments.into_iter().peekable();

        let mut artifact = match segments.next() {
            Some(PathSegment::Field(field)) => field,
            Some(PathSegment::Index(_)) | None => {
                return Err(DagError::reference(
                    input,
                    "expected '.field' after the step id",
                ))
            }
        };
        if artifact == ARTIFACTS_SEGMENT {
            if let Some(PathSegment::Field(_)) = segments.peek() {
                if let Some(PathSegment::Field(field)) = segments.next() {
                    artifact = field;
                }
            }
        }

        Ok(Reference {
            step_id,
            artifact,
            path: segments.collect(),
        })
    }

    /// Look the reference up in `store`, walking any trailing path.
    pub fn resolve(&self, store: &ArtifactStore) -> Option<Value> {
        let root = store.get(&self.step_id, &self.artifact)?;
        walk_path(&root, &self.path).cloned()
    }
}

impl FromStr for Reference {
    type Err = DagError;

    fn from_str(s: &str) -> Result<Self> {
        Reference::parse(s)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.step_id, self.artifact)?;
        write_segments(f, &self.path)
    }
}

fn write_segments(f: &mut fmt::Formatter<'_>, path: &[PathSegment]) -> fmt::Result {
    for segment in path {
        match segment {
            PathSegment::Field(field) => write!(f, ".{}", field)?,
            PathSegment::Index(index) => write!(f, "[{}]", index)?,
        }
    }
    Ok(())
}

/// Parse `head ( "." field | "[" index "]" )*`.
pub fn parse_path(input: &str) -> Result<(String, Vec<PathSegment>)> {
    let input = input.trim();
    let bytes = input.as_bytes();
    let mut pos = 0;

    let head = read_ident(input, &mut pos);
    if head.is_empty() {
        return Err(DagError::reference(input, "empty identifier"));
    }

    let mut segments = Vec::new();
    while pos < bytes.len() {
        match bytes[pos] {
            b'.' => {
                pos += 1;
                let field = read_ident(input, &mut pos);
                if field.is_empty() {
                    return Err(DagError::reference(
                        input,
                        format!("empty field at offset {}", pos),
                    ));
                }
                segments.push(PathSegment::Field(field.to_string()));
            }
            b'[' => {
                pos += 1;
                let start = pos;
                while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                    pos += 1;
                }
                if start == pos || pos >= bytes.len() || bytes[pos] != b']' {
                    return Err(DagError::reference(
                        input,
                        format!("expected '[index]' at offset {}", start - 1),
                    ));
                }
                let index = input[start..pos]
                    .parse::<usize>()
                    .map_err(|e| DagError::reference(input, e.to_string()))?;
                pos += 1;
                segments.push(PathSegment::Index(index));
            }
            other => {
                return Err(DagError::reference(
                    input,
                    format!("unexpected '{}' at offset {}", other as char, pos),
                ))
            }
        }
    }

    Ok((head.to_string(), segments))
}

fn read_ident<'a>(input: &'a str, pos: &mut usize) -> &'a str {
    let start = *pos;
    for (offset, ch) in input[start..].char_indices() {
        if matches!(ch, '.' | '[' | ']') || ch.is_whitespace() {
            *pos = start + offset;
            return &input[start..*pos];
        }
    }
    *pos = input.len();
    &input[start..]
}

pub fn walk_path<'a>(value: &'a Value, path: &[PathSegment]) -> Option<&'a Value> {
    let mut current = value;
    for segment in path {
        current = match (segment, current) {
            (PathSegment::Field(field), Value::Object(map)) => map.get(field)?,
            (PathSegment::Index(index), Value::Array(items)) => items.get(*index)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Replace `{{var}}` placeholders (optionally with a path) throughout `value`.
pub fn substitute(value: &Value, var: &str, item: &Value) -> Value {
    match value {
        Value::String(s) => substitute_str(s, var, item),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, var, item)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, var, item)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// A string that is exactly one placeholder yields the typed value; embedded
/// placeholders are spliced in as text. Unknown placeholders stay verbatim.
pub fn substitute_str(s: &str, var: &str, item: &Value) -> Value {
    if let Some(inner) = s.strip_prefix("{{").and_then(|rest| rest.strip_suffix("}}")) {
        if !inner.contains("{{") && !inner.contains("}}") {
            if let Some(value) = placeholder_value(inner, var, item) {
                return value;
            }
        }
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return Value::String(out);
        };
        let inner = &after[..end];
        match placeholder_value(inner, var, item) {
            Some(value) => out.push_str(&as_text(&value)),
            None => {
                out.push_str("{{");
                out.push_str(inner);
                out.push_str("}}");
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Value::String(out)
}

fn placeholder_value(inner: &str, var: &str, item: &Value) -> Option<Value> {
    let (head, path) = parse_path(inner).ok()?;
    if head != var {
        return None;
    }
    walk_path(item, &path).cloned()
}

pub(crate) fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
