use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::{FieldKind, FieldPath, FieldSpec};
use crate::registry::{ResourceDefinition, SYSTEM_ATTRIBUTES};

/// WriteMode
///
/// `Create` and `Replace` describe a complete editable field set, so required
/// fields are enforced. `Merge` carries only the fields being changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Create,
    Replace,
    Merge,
}

/// Parses a request body; an empty body is an empty object.
pub fn parse_body(body: &[u8]) -> Result<Map<String, Value>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ApiError::Validation("request body must be a JSON object".to_string())),
        Err(e) => Err(ApiError::Validation(format!("malformed JSON body: {e}"))),
    }
}

/// validate_input
///
/// Checks a write payload against the resource schema and returns the
/// normalized editable fields.
///
/// * unknown fields are rejected;
/// * system attributes (`id`, timestamps) and uneditable fields are dropped;
/// * values must match the declared kind (`null` clears a field);
/// * dates are normalized to UTC RFC 3339, references to hyphenated UUIDs.
pub fn validate_input(
    resource: &ResourceDefinition,
    input: Map<String, Value>,
    mode: WriteMode,
) -> Result<Map<String, Value>, ApiError> {
    let output = validate_object(resource.fields(), input, &FieldPath(Vec::new()))?;
    if mode != WriteMode::Merge {
        check_required(resource.fields(), &output, &FieldPath(Vec::new()))?;
    }
    Ok(output)
}

fn validate_object(
    fields: &[(String, FieldSpec)],
    input: Map<String, Value>,
    prefix: &FieldPath,
) -> Result<Map<String, Value>, ApiError> {
    let mut output = Map::new();
    for (key, value) in input {
        if prefix.segments().is_empty() && SYSTEM_ATTRIBUTES.contains(&key.as_str()) {
            continue;
        }
        let path = prefix.child(&key);
        let Some((_, spec)) = fields.iter().find(|(name, _)| *name == key) else {
            return Err(ApiError::Validation(format!("unknown field '{path}'")));
        };
        if !spec.editable {
            tracing::debug!(field = %path, "ignoring uneditable field");
            continue;
        }
        // A null would clear the field, so merges cannot drop required data.
        if value.is_null() && holds_required(spec) {
            return Err(ApiError::Validation(format!("field '{path}' is required")));
        }
        let normalized = normalize(&spec.kind, value, &path)?;
        output.insert(key, normalized);
    }
    Ok(output)
}

fn normalize(kind: &FieldKind, value: Value, path: &FieldPath) -> Result<Value, ApiError> {
    let mismatch = || ApiError::Validation(format!("field '{path}' expects {}", describe(kind)));
    match (kind, value) {
        (_, Value::Null) => Ok(Value::Null),
        (FieldKind::Group(inner), Value::Object(nested)) => {
            validate_object(inner, nested, path).map(Value::Object)
        }
        (FieldKind::String, value @ Value::String(_)) => Ok(value),
        (FieldKind::Number, value @ Value::Number(_)) => Ok(value),
        (FieldKind::Boolean, value @ Value::Bool(_)) => Ok(value),
        (FieldKind::Date, Value::String(raw)) => DateTime::parse_from_rfc3339(&raw)
            .map(|date| {
                Value::String(
                    date.with_timezone(&Utc)
                        .to_rfc3339_opts(SecondsFormat::Millis, true),
                )
            })
            .map_err(|_| mismatch()),
        (FieldKind::Reference(_), Value::String(raw)) => parse_reference(&raw).ok_or_else(mismatch),
        (FieldKind::ReferenceList(_), Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(raw) => parse_reference(&raw).ok_or_else(mismatch),
                _ => Err(mismatch()),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        _ => Err(mismatch()),
    }
}

/// Whether the field, or an editable field nested in its group, is required.
fn holds_required(spec: &FieldSpec) -> bool {
    match &spec.kind {
        FieldKind::Group(inner) => {
            spec.required || inner.iter().any(|(_, s)| s.editable && holds_required(s))
        }
        _ => spec.required,
    }
}

fn parse_reference(raw: &str) -> Option<Value> {
    Uuid::parse_str(raw)
        .ok()
        .map(|id| Value::String(id.to_string()))
}

fn describe(kind: &FieldKind) -> &'static str {
    match kind {
        FieldKind::String => "a string",
        FieldKind::Number => "a number",
        FieldKind::Boolean => "a boolean",
        FieldKind::Date => "an RFC 3339 date",
        FieldKind::Reference(_) => "an identifier",
        FieldKind::ReferenceList(_) => "a list of identifiers",
        FieldKind::Group(_) => "an object",
    }
}

fn check_required(
    fields: &[(String, FieldSpec)],
    output: &Map<String, Value>,
    prefix: &FieldPath,
) -> Result<(), ApiError> {
    for (name, spec) in fields {
        if !spec.editable {
            continue;
        }
        let path = prefix.child(name);
        let value = output.get(name).filter(|v| !v.is_null());
        match (&spec.kind, value) {
            (FieldKind::Group(inner), Some(Value::Object(nested))) => {
                check_required(inner, nested, &path)?
            }
            (FieldKind::Group(inner), None) => check_required(inner, &Map::new(), &path)?,
            (_, None) if spec.required => {
                return Err(ApiError::Validation(format!("field '{path}' is required")));
            }
            _ => {}
        }
    }
    Ok(())
}
