// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use regex::Regex;
use serde_json::{Map, Value};

/// One argument-validation failure, reported as `<path>: <message>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Validate a parsed arguments object against a tool's parameter schema.
///
/// This covers the subset of JSON Schema tools actually declare: `type`,
/// `properties`, `required`, `enum`, `pattern`, `additionalProperties`,
/// and `items` for arrays. Unknown schema keywords are ignored.
pub fn validate_args(schema: &Value, args: &Map<String, Value>) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    validate_object(schema, args, "", &mut errors);
    errors
}

fn validate_object(
    schema: &Value,
    object: &Map<String, Value>,
    path: &str,
    errors: &mut Vec<ValidationError>,
) {
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(name) {
                errors.push(ValidationError {
                    path: join(path, name),
                    message: "required parameter missing".into(),
                });
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    let additional_allowed = schema
        .get("additionalProperties")
        .and_then(Value::as_bool)
        .unwrap_or(true);

    for (name, value) in object {
        let field_path = join(path, name);
        match properties.and_then(|p| p.get(name)) {
            Some(field_schema) => validate_value(field_schema, value, &field_path, errors),
            None if !additional_allowed => errors.push(ValidationError {
                path: field_path,
                message: "unknown parameter".into(),
            }),
            None => {}
        }
    }
}

fn validate_value(schema: &Value, value: &Value, path: &str, errors: &mut Vec<ValidationError>) {
    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        if !type_matches(expected, value) {
            errors.push(ValidationError {
                path: path.to_string(),
                message: format!("expected {expected}, got {}", type_name(value)),
            });
            return;
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            let options: Vec<String> = allowed.iter().map(Value::to_string).collect();
            errors.push(ValidationError {
                path: path.to_string(),
                message: format!("must be one of {}", options.join(", ")),
            });
            return;
        }
    }

    if let (Some(pattern), Some(s)) = (schema.get("pattern").and_then(Value::as_str), value.as_str())
    {
        match Regex::new(pattern) {
            Ok(re) if !re.is_match(s) => errors.push(ValidationError {
                path: path.to_string(),
                message: format!("does not match pattern {pattern}"),
            }),
            _ => {}
        }
    }

    match value {
        Value::Object(inner) => validate_object(schema, inner, path, errors),
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    validate_value(item_schema, item, &format!("{path}[{i}]"), errors);
                }
            }
        }
        _ => {}
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}.{name}")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "limit": {"type": "integer"},
                "kind": {"type": "string", "enum": ["all", "file", "directory"]},
                "name": {"type": "string", "pattern": "^[a-z]+$"}
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    #[test]
    fn valid_args_produce_no_errors() {
        let errors = validate_args(&schema(), &args(json!({"path": "/tmp", "limit": 3})));
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn missing_required_is_reported_with_path() {
        let errors = validate_args(&schema(), &args(json!({})));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].to_string(), "path: required parameter missing");
    }

    #[test]
    fn wrong_type_is_reported() {
        let errors = validate_args(&schema(), &args(json!({"path": 42})));
        assert_eq!(errors[0].to_string(), "path: expected string, got number");
    }

    #[test]
    fn integer_rejects_float() {
        let errors = validate_args(&schema(), &args(json!({"path": "/x", "limit": 1.5})));
        assert!(errors[0].message.contains("expected integer"));
    }

    #[test]
    fn enum_violation_lists_options() {
        let errors = validate_args(&schema(), &args(json!({"path": "/x", "kind": "nope"})));
        assert!(errors[0].message.contains("\"file\""));
    }

    #[test]
    fn pattern_violation() {
        let errors = validate_args(&schema(), &args(json!({"path": "/x", "name": "ABC"})));
        assert!(errors[0].message.contains("pattern"));
    }

    #[test]
    fn unknown_parameter_rejected_when_additional_false() {
        let errors = validate_args(&schema(), &args(json!({"path": "/x", "bogus": 1})));
        assert_eq!(errors[0].to_string(), "bogus: unknown parameter");
    }

    #[test]
    fn multiple_errors_accumulate() {
        let errors = validate_args(&schema(), &args(json!({"limit": "nope", "bogus": 1})));
        assert_eq!(errors.len(), 3); // missing path, wrong limit type, unknown bogus
    }
}
