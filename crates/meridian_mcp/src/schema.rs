//! Input-schema validation for tool arguments.
//!
//! Covers the subset of JSON Schema our tool definitions use: object root,
//! `properties` with `type` and `enum`, and `required`. Validation runs in
//! the dispatcher before the executor; a failing argument set never reaches
//! tool code.

use serde_json::Value;

/// Validate `args` against a tool's declared input schema.
pub fn validate(schema: &Value, args: &Value) -> Result<(), String> {
    let object = match args {
        Value::Object(map) => map,
        Value::Null => {
            return match schema.get("required").and_then(Value::as_array) {
                Some(required) if !required.is_empty() => {
                    Err(format!("missing required property: {}", required[0]))
                }
                _ => Ok(()),
            };
        }
        other => return Err(format!("arguments must be an object, got {}", kind_of(other))),
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            match object.get(name) {
                None | Some(Value::Null) => {
                    return Err(format!("missing required property: {name}"));
                }
                Some(_) => {}
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (name, spec) in properties {
            let Some(value) = object.get(name) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            if let Some(expected) = spec.get("type").and_then(Value::as_str) {
                if !type_matches(expected, value) {
                    return Err(format!(
                        "property {name} must be {expected}, got {}",
                        kind_of(value)
                    ));
                }
            }
            if let Some(allowed) = spec.get("enum").and_then(Value::as_array) {
                if !allowed.contains(value) {
                    return Err(format!("property {name} must be one of {allowed:?}"));
                }
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.as_i64().is_some(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "sql": { "type": "string" },
                "limit": { "type": "integer" },
                "cache": { "type": "string", "enum": ["off", "read", "read-write"] }
            },
            "required": ["sql"]
        })
    }

    #[test]
    fn test_valid_args() {
        assert!(validate(&schema(), &json!({ "sql": "SELECT 1" })).is_ok());
        assert!(validate(&schema(), &json!({ "sql": "SELECT 1", "limit": 10 })).is_ok());
        assert!(validate(&schema(), &json!({ "sql": "SELECT 1", "cache": "read" })).is_ok());
    }

    #[test]
    fn test_missing_required() {
        let err = validate(&schema(), &json!({})).unwrap_err();
        assert!(err.contains("sql"));

        let err = validate(&schema(), &Value::Null).unwrap_err();
        assert!(err.contains("sql"));
    }

    #[test]
    fn test_wrong_type_rejected() {
        let err = validate(&schema(), &json!({ "sql": 123 })).unwrap_err();
        assert!(err.contains("sql"));
        assert!(err.contains("string"));

        let err = validate(&schema(), &json!({ "sql": "SELECT 1", "limit": "ten" })).unwrap_err();
        assert!(err.contains("limit"));
    }

    #[test]
    fn test_enum_enforced() {
        let err =
            validate(&schema(), &json!({ "sql": "SELECT 1", "cache": "maybe" })).unwrap_err();
        assert!(err.contains("cache"));
    }

    #[test]
    fn test_unknown_properties_pass() {
        assert!(validate(&schema(), &json!({ "sql": "SELECT 1", "extra": true })).is_ok());
    }

    #[test]
    fn test_non_object_args() {
        assert!(validate(&schema(), &json!([1, 2])).is_err());
    }
}
