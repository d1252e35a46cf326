//! JSON Schema helpers for downstream stream consumers.
//!
//! [`create_schema`] derives a draft-07 schema from one sample record, which is
//! usually enough to register a device's record type with a schema registry.

use crate::error::{MdmlError, Result};
use serde_json::{json, Map, Value};

/// `$schema` URI of generated schemas.
pub const DRAFT_07: &str = "http://json-schema.org/draft-07/schema#";

/// Infers a schema from a sample record.
///
/// Every key becomes a required property typed after its sample value.
/// Integers and floats are distinguished. Arrays are typed by their first
/// element; an empty array has untyped items.
///
/// # Errors
///
/// [`MdmlError::Shape`] if `sample` is not an object.
pub fn create_schema(sample: &Value, title: &str, description: &str) -> Result<Value> {
    let record = sample
        .as_object()
        .ok_or_else(|| MdmlError::Shape("schema sample must be a JSON object".into()))?;

    let mut properties = Map::new();
    for (key, value) in record {
        properties.insert(key.clone(), property_for(value));
    }
    let required: Vec<&String> = record.keys().collect();

    Ok(json!({
        "$schema": DRAFT_07,
        "title": title,
        "description": description,
        "type": "object",
        "properties": properties,
        "required": required,
    }))
}

fn property_for(value: &Value) -> Value {
    match value {
        Value::Array(items) => match items.first() {
            Some(first) => json!({"type": "array", "items": {"type": type_name(first)}}),
            None => json!({"type": "array", "items": {}}),
        },
        other => json!({"type": type_name(other)}),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Schema of a chunk message.
pub fn multipart_schema() -> Value {
    json!({
        "$schema": DRAFT_07,
        "title": "MultipartMessageSchema",
        "description": "Schema for data messages split into multiple chunks",
        "type": "object",
        "properties": {
            "time": {"description": "Send time of the chunk", "type": "number"},
            "chunk": {"description": "File chunk", "type": "string"},
            "part": {"description": "Chunk position as '<i>.<n>'", "type": "string"},
            "filename": {"description": "File ID shared by all chunks", "type": "string"},
            "encoding": {"description": "Encoding of the payload", "type": "string"}
        },
        "required": ["chunk", "part", "filename", "encoding"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_types_from_sample() {
        let schema = create_schema(
            &json!({"time": 1.5, "int1": 1, "label": "a", "ok": true, "trace": [0.1, 0.2]}),
            "Test schema",
            "Schema used for testing",
        )
        .unwrap();
        assert_eq!(schema["$schema"], DRAFT_07);
        assert_eq!(schema["title"], "Test schema");
        assert_eq!(schema["properties"]["time"]["type"], "number");
        assert_eq!(schema["properties"]["int1"]["type"], "integer");
        assert_eq!(schema["properties"]["label"]["type"], "string");
        assert_eq!(schema["properties"]["ok"]["type"], "boolean");
        assert_eq!(schema["properties"]["trace"]["items"]["type"], "number");
        assert_eq!(schema["required"], json!(["time", "int1", "label", "ok", "trace"]));
    }

    #[test]
    fn empty_array_has_untyped_items() {
        let schema = create_schema(&json!({"xs": []}), "t", "d").unwrap();
        assert_eq!(schema["properties"]["xs"]["items"], json!({}));
    }

    #[test]
    fn non_object_sample_is_rejected() {
        assert!(create_schema(&json!([1, 2]), "t", "d").is_err());
    }

    #[test]
    fn multipart_schema_requires_chunk_fields() {
        let schema = multipart_schema();
        assert_eq!(schema["required"], json!(["chunk", "part", "filename", "encoding"]));
    }
}
