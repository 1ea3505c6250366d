//! Schema-driven argument validation run before any tool executes

use crate::error::ToolError;
use serde_json::{Map, Value};

/// Check `arguments` against a tool's JSON parameter schema.
///
/// Covers what the built-in schemas use: an object with typed `properties`
/// and a `required` list. Properties the schema does not mention are
/// ignored. A null property counts as absent.
pub fn validate_arguments(schema: &Value, arguments: &Value) -> Result<(), ToolError> {
    let empty = Map::new();
    let args = match arguments {
        Value::Object(map) => map,
        Value::Null => &empty,
        Value::String(raw) => {
            return Err(ToolError::Validation {
                message: format!("arguments are not a JSON object: {}", raw),
            })
        }
        other => {
            return Err(ToolError::Validation {
                message: format!("arguments must be a JSON object, got {}", json_type(other)),
            })
        }
    };

    let properties = schema.get("properties").and_then(Value::as_object);

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        let missing: Vec<&str> = required
            .iter()
            .filter_map(Value::as_str)
            .filter(|key| args.get(*key).map_or(true, Value::is_null))
            .collect();
        if !missing.is_empty() {
            return Err(ToolError::Validation {
                message: format!("missing required parameter(s): {}", missing.join(", ")),
            });
        }
    }

    let Some(properties) = properties else {
        return Ok(());
    };

    for (key, value) in args {
        if value.is_null() {
            continue;
        }
        let Some(expected) = properties
            .get(key)
            .and_then(|prop| prop.get("type"))
            .and_then(Value::as_str)
        else {
            continue;
        };
        if !matches_type(expected, value) {
            return Err(ToolError::Validation {
                message: format!(
                    "parameter '{}' must be of type {}, got {}",
                    key,
                    expected,
                    json_type(value)
                ),
            });
        }
    }

    Ok(())
}

/// Rewrite whole-number floats of `integer` properties as integers.
///
/// Run after [`validate_arguments`] so tools can read such values as `i64`.
pub fn normalize_integers(schema: &Value, arguments: &mut Value) {
    let (Some(properties), Value::Object(args)) = (
        schema.get("properties").and_then(Value::as_object),
        arguments,
    ) else {
        return;
    };

    for (key, value) in args.iter_mut() {
        let is_integer = properties
            .get(key)
            .and_then(|prop| prop.get("type"))
            .and_then(Value::as_str)
            == Some("integer");
        if !is_integer || !value.is_f64() {
            continue;
        }
        if let Some(f) = value.as_f64().filter(|f| f.fract() == 0.0) {
            *value = Value::from(f as i64);
        }
    }
}

fn matches_type(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "number" => value.is_number(),
        // Some models send 5.0 for integers
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
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
                "file_path": {"type": "string"},
                "start_line": {"type": "integer"},
                "create_dirs": {"type": "boolean"}
            },
            "required": ["file_path"]
        })
    }

    #[test]
    fn test_accepts_valid_arguments() {
        assert!(validate_arguments(&schema(), &json!({"file_path": "a", "start_line": 2})).is_ok());
        assert!(validate_arguments(&schema(), &json!({"file_path": "a", "start_line": 2.0})).is_ok());
        assert!(validate_arguments(&schema(), &json!({"file_path": "a", "extra": [1]})).is_ok());
    }

    #[test]
    fn test_rejects_missing_required() {
        let err = validate_arguments(&schema(), &json!({"start_line": 1})).unwrap_err();
        assert!(err.to_string().contains("missing required parameter(s): file_path"));

        let err = validate_arguments(&schema(), &json!({"file_path": null})).unwrap_err();
        assert!(matches!(err, ToolError::Validation { .. }));
    }

    #[test]
    fn test_rejects_wrong_types() {
        let err =
            validate_arguments(&schema(), &json!({"file_path": "a", "start_line": "3"})).unwrap_err();
        assert!(err
            .to_string()
            .contains("parameter 'start_line' must be of type integer, got string"));

        let err = validate_arguments(&schema(), &json!({"file_path": "a", "start_line": 1.5}))
            .unwrap_err();
        assert!(err.to_string().contains("got number"));

        let err =
            validate_arguments(&schema(), &json!({"file_path": "a", "create_dirs": 1})).unwrap_err();
        assert!(err.to_string().contains("boolean"));
    }

    #[test]
    fn test_rejects_non_object_arguments() {
        let err = validate_arguments(&schema(), &json!("{broken")).unwrap_err();
        assert!(err.to_string().contains("not a JSON object"));

        let err = validate_arguments(&schema(), &json!([1, 2])).unwrap_err();
        assert!(err.to_string().contains("got array"));
    }

    #[test]
    fn test_whole_floats_become_integers() {
        let mut args = json!({"file_path": "a", "start_line": 2.0, "ratio": 0.5});
        normalize_integers(&schema(), &mut args);
        assert_eq!(args["start_line"], json!(2));
        assert!(args["start_line"].is_i64());
        assert_eq!(args["ratio"], json!(0.5));
        assert_eq!(args["file_path"], "a");
    }

    #[test]
    fn test_null_arguments_behave_like_empty_object() {
        let no_required = json!({"type": "object", "properties": {"dir_path": {"type": "string"}}});
        assert!(validate_arguments(&no_required, &Value::Null).is_ok());
        assert!(validate_arguments(&schema(), &Value::Null).is_err());
    }
}
