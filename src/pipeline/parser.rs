//! Model output parsing.
//!
//! Completions are supposed to be a single fenced JSON object, but local
//! models wrap them in prose often enough that we fall back to scanning
//! for the first balanced object. Field mapping is schema-driven: unknown
//! keys are ignored, nulls mean absent, and string-typed amounts are kept
//! as text for the validator to coerce.

use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::backend::InferenceError;
use crate::schema::SchemaDefinition;

use super::types::{CandidateRecord, FieldValue, Provenance};

/// Map a raw completion onto the schema's fields.
pub fn parse_record(
    raw: &str,
    schema: &SchemaDefinition,
    provenance: Provenance,
) -> Result<CandidateRecord, InferenceError> {
    let block = extract_json_block(raw).ok_or_else(|| {
        InferenceError::MalformedOutput("no JSON object found in model output".into())
    })?;

    let value: serde_json::Value = serde_json::from_str(block)
        .map_err(|e| InferenceError::MalformedOutput(format!("invalid JSON: {e}")))?;

    let object = value.as_object().ok_or_else(|| {
        InferenceError::MalformedOutput("top-level JSON value is not an object".into())
    })?;

    let mut fields = BTreeMap::new();
    for spec in &schema.fields {
        let Some(raw_value) = object.get(&spec.name) else {
            continue;
        };
        if raw_value.is_null() {
            continue;
        }
        match scalar_value(raw_value) {
            Some(field_value) => {
                fields.insert(spec.name.clone(), field_value);
            }
            None => {
                tracing::debug!(field = %spec.name, "dropping non-scalar value from model output");
            }
        }
    }

    Ok(CandidateRecord { fields, provenance })
}

/// Prefer a ```json fenced block; otherwise take the first balanced
/// top-level object in the text.
fn extract_json_block(raw: &str) -> Option<&str> {
    if let Some(start) = raw.find("```json") {
        let rest = &raw[start + "```json".len()..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim());
        }
    }
    balanced_object(raw)
}

fn balanced_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (ix, ch) in raw[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..start + ix + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn scalar_value(value: &serde_json::Value) -> Option<FieldValue> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().map(FieldValue::Number),
        serde_json::Value::String(s) => {
            match NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d") {
                Ok(date) => Some(FieldValue::Date(date)),
                Err(_) => Some(FieldValue::Text(s.clone())),
            }
        }
        _ => None,
    }
}
