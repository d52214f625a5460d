//! Argument validation against a tool's JSON-schema parameter spec.
//!
//! Covers the subset of JSON Schema that tool specs actually use: `type`,
//! `properties`, `required`, `enum`, and `items`. Validation failures carry
//! enough detail for the model to self-correct on the next turn.

use serde_json::Value;

/// Validate `args` against `schema`. Returns the first violation found.
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    validate_value(schema, args, "$")
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                "integer"
            } else {
                "number"
            }
        }
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn matches_type(expected: &str, v: &Value) -> bool {
    match expected {
        // Integers satisfy "number".
        "number" => matches!(v, Value::Number(_)),
        "integer" => matches!(v, Value::Number(n) if n.is_i64() || n.is_u64()),
        other => type_name(v) == other,
    }
}

fn validate_value(schema: &Value, value: &Value, path: &str) -> Result<(), String> {
    if let Some(expected) = schema.get("type").and_then(|t| t.as_str()) {
        if !matches_type(expected, value) {
            return Err(format!(
                "{path}: expected {expected}, got {}",
                type_name(value)
            ));
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(|e| e.as_array()) {
        if !allowed.contains(value) {
            return Err(format!("{path}: value {value} is not one of {allowed:?}"));
        }
    }

    if let Some(obj) = value.as_object() {
        if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
            for req in required {
                if let Some(name) = req.as_str() {
                    if !obj.contains_key(name) {
                        return Err(format!("{path}: missing required property '{name}'"));
                    }
                }
            }
        }

        if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
            for (name, prop_schema) in props {
                if let Some(prop_value) = obj.get(name) {
                    validate_value(prop_schema, prop_value, &format!("{path}.{name}"))?;
                }
            }
        }
    }

    if let Some(arr) = value.as_array() {
        if let Some(item_schema) = schema.get("items") {
            for (i, item) in arr.iter().enumerate() {
                validate_value(item_schema, item, &format!("{path}[{i}]"))?;
            }
        }
    }

    Ok(())
}
