//! Parameter substitution against earlier step outputs.
//!
//! A reference is written `{{stepN.path.to.field}}` where `N` is the step
//! position and the path walks the persisted output of that step. Numeric
//! segments index arrays (`{{step2.items.0.id}}`); `{{stepN}}` alone is the
//! whole output.
//!
//! - A string that is exactly one reference is replaced by the referenced
//!   JSON value as-is, so `"{{step2.a.b}}"` against `{"a":{"b":42}}` becomes
//!   the number `42`.
//! - References embedded in longer text are stringified in place. Strings
//!   are inserted without quotes and `null` as the empty string.
//! - Objects and arrays are walked recursively; keys are never substituted.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

/// A parameter referenced something that cannot be resolved. Always fatal
/// to the execution; no action job is dispatched.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum ResolutionError {
    #[error("reference {{{{{reference}}}}} points at step {position}, which has not run")]
    StepNotExecuted { reference: String, position: u32 },
    #[error("reference {{{{{reference}}}}}: path `{path}` not found in step output")]
    PathNotFound { reference: String, path: String },
    #[error("invalid reference {{{{{reference}}}}}")]
    InvalidReference { reference: String },
}

/// Outputs of the steps that have run so far, keyed by position.
#[derive(Debug, Clone, Default)]
pub struct StepOutputs {
    outputs: BTreeMap<u32, Value>,
}

impl StepOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, position: u32, output: Value) {
        self.outputs.insert(position, output);
    }

    pub fn get(&self, position: u32) -> Option<&Value> {
        self.outputs.get(&position)
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

/// A parsed `stepN.path` reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub position: u32,
    pub path: Vec<String>,
}

impl Reference {
    /// Parse the text between `{{` and `}}`.
    pub fn parse(raw: &str) -> Result<Self, ResolutionError> {
        let invalid = || ResolutionError::InvalidReference {
            reference: raw.trim().to_string(),
        };
        let mut parts = raw.trim().split('.');
        let head = parts.next().ok_or_else(invalid)?;
        let digits = head.strip_prefix("step").ok_or_else(invalid)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let position: u32 = digits.parse().map_err(|_| invalid())?;

        let path: Vec<String> = parts.map(str::to_string).collect();
        if path.iter().any(|seg| seg.is_empty()) {
            return Err(invalid());
        }
        Ok(Self { position, path })
    }
}

/// Resolve every reference in `params` for the step at `current_position`.
///
/// Only positions strictly before `current_position` with a recorded output
/// may be referenced.
pub fn resolve_parameters(
    params: &Value,
    outputs: &StepOutputs,
    current_position: u32,
) -> Result<Value, ResolutionError> {
    match params {
        Value::String(s) => resolve_string(s, outputs, current_position),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_parameters(item, outputs, current_position))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve_parameters(v, outputs, current_position)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Every reference appearing anywhere in `params`, in document order.
pub fn references(params: &Value) -> Vec<Result<Reference, ResolutionError>> {
    let mut found = Vec::new();
    collect_references(params, &mut found);
    found
}

fn collect_references(value: &Value, found: &mut Vec<Result<Reference, ResolutionError>>) {
    match value {
        Value::String(s) => {
            for segment in split_template(s) {
                if let Segment::Reference(raw) = segment {
                    found.push(Reference::parse(raw));
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_references(v, found)),
        Value::Object(map) => map.values().for_each(|v| collect_references(v, found)),
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Template splitting
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum Segment<'a> {
    Text(&'a str),
    Reference(&'a str),
}

/// Split a string into literal text and `{{...}}` references. An opening
/// `{{` without a closing `}}` is literal text.
fn split_template(input: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut rest = input;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        if start > 0 {
            segments.push(Segment::Text(&rest[..start]));
        }
        segments.push(Segment::Reference(&rest[start + 2..start + 2 + len]));
        rest = &rest[start + 2 + len + 2..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest));
    }
    segments
}

fn resolve_string(
    input: &str,
    outputs: &StepOutputs,
    current_position: u32,
) -> Result<Value, ResolutionError> {
    let segments = split_template(input);

    if let [Segment::Reference(raw)] = segments.as_slice() {
        return lookup(raw, outputs, current_position).cloned();
    }
    if !segments.iter().any(|s| matches!(s, Segment::Reference(_))) {
        return Ok(Value::String(input.to_string()));
    }

    let mut out = String::with_capacity(input.len());
    for segment in segments {
        match segment {
            Segment::Text(text) => out.push_str(text),
            Segment::Reference(raw) => match lookup(raw, outputs, current_position)? {
                Value::String(s) => out.push_str(s),
                Value::Null => {}
                other => out.push_str(&other.to_string()),
            },
        }
    }
    Ok(Value::String(out))
}

fn lookup<'a>(
    raw: &str,
    outputs: &'a StepOutputs,
    current_position: u32,
) -> Result<&'a Value, ResolutionError> {
    let reference = Reference::parse(raw)?;
    let not_executed = || ResolutionError::StepNotExecuted {
        reference: raw.trim().to_string(),
        position: reference.position,
    };
    if reference.position >= current_position {
        return Err(not_executed());
    }
    let mut current = outputs.get(reference.position).ok_or_else(not_executed)?;

    for segment in &reference.path {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        current = next.ok_or_else(|| ResolutionError::PathNotFound {
            reference: raw.trim().to_string(),
            path: reference.path.join("."),
        })?;
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs() -> StepOutputs {
        let mut o = StepOutputs::new();
        o.insert(1, json!({"row": {"email": "a@b.com", "age": 30}}));
        o.insert(
            2,
            json!({"a": {"b": 42}, "items": [{"id": "x"}, {"id": "y"}], "none": null}),
        );
        o
    }

    #[test]
    fn whole_reference_keeps_json_type() {
        let resolved = resolve_parameters(&json!({"n": "{{step2.a.b}}"}), &outputs(), 3).unwrap();
        assert_eq!(resolved, json!({"n": 42}));
    }

    #[test]
    fn whitespace_inside_braces() {
        let resolved = resolve_parameters(&json!("{{ step1.row.email }}"), &outputs(), 2).unwrap();
        assert_eq!(resolved, json!("a@b.com"));
    }

    #[test]
    fn embedded_references_are_stringified() {
        let resolved = resolve_parameters(
            &json!("Hi {{step1.row.email}}, age {{step1.row.age}}{{step2.none}}!"),
            &outputs(),
            3,
        )
        .unwrap();
        assert_eq!(resolved, json!("Hi a@b.com, age 30!"));
    }

    #[test]
    fn array_index_segments() {
        let resolved = resolve_parameters(&json!(["{{step2.items.1.id}}"]), &outputs(), 3).unwrap();
        assert_eq!(resolved, json!(["y"]));
    }

    #[test]
    fn whole_output_reference() {
        let resolved = resolve_parameters(&json!("{{step1}}"), &outputs(), 2).unwrap();
        assert_eq!(resolved, json!({"row": {"email": "a@b.com", "age": 30}}));
    }

    #[test]
    fn later_step_is_not_executed() {
        let err = resolve_parameters(&json!("{{step2.a}}"), &outputs(), 2).unwrap_err();
        assert_eq!(
            err,
            ResolutionError::StepNotExecuted {
                reference: "step2.a".into(),
                position: 2
            }
        );
    }

    #[test]
    fn missing_output_is_not_executed() {
        let mut o = StepOutputs::new();
        o.insert(1, json!({}));
        let err = resolve_parameters(&json!("{{step2.a}}"), &o, 4).unwrap_err();
        assert!(matches!(err, ResolutionError::StepNotExecuted { position: 2, .. }));
    }

    #[test]
    fn missing_path() {
        let err = resolve_parameters(&json!("{{step2.a.c}}"), &outputs(), 3).unwrap_err();
        assert_eq!(
            err,
            ResolutionError::PathNotFound {
                reference: "step2.a.c".into(),
                path: "a.c".into()
            }
        );
        let err = resolve_parameters(&json!("{{step2.items.5}}"), &outputs(), 3).unwrap_err();
        assert!(matches!(err, ResolutionError::PathNotFound { .. }));
    }

    #[test]
    fn invalid_references() {
        for raw in ["{{foo.bar}}", "{{step}}", "{{stepx.a}}", "{{step1..a}}"] {
            let err = resolve_parameters(&json!(raw), &outputs(), 3).unwrap_err();
            assert!(
                matches!(err, ResolutionError::InvalidReference { .. }),
                "{raw}: {err:?}"
            );
        }
    }

    #[test]
    fn unterminated_braces_are_literal() {
        let resolved = resolve_parameters(&json!("price {{ 10"), &outputs(), 3).unwrap();
        assert_eq!(resolved, json!("price {{ 10"));
    }

    #[test]
    fn non_string_values_pass_through() {
        let params = json!({"n": 1, "b": true, "nested": {"x": null}});
        assert_eq!(resolve_parameters(&params, &outputs(), 3).unwrap(), params);
    }

    #[test]
    fn collects_references() {
        let refs = references(&json!({"a": "{{step1.x}} and {{step3}}", "b": ["{{bad}}"]}));
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[0].as_ref().unwrap().position, 1);
        assert_eq!(refs[1].as_ref().unwrap().position, 3);
        assert!(refs[2].is_err());
    }

    #[test]
    fn error_message_shows_braces() {
        let err = ResolutionError::InvalidReference {
            reference: "foo".into(),
        };
        assert_eq!(err.to_string(), "invalid reference {{foo}}");
    }
}
