//! Tool call validation against the tool's JSON schema, with a single repair pass
//!
//! Models regularly send nested objects as JSON-encoded strings. When
//! validation fails, such strings are parsed in place wherever the schema
//! expects an object or array, and validation runs once more.

use super::models::GATEWAY_FIELDS;
use jsonschema::JSONSchema;
use serde_json::Value;
use tracing::{debug, warn};

/// Outcome of validating a tool call body
#[derive(Debug, Clone, PartialEq)]
pub enum Validated {
    /// Body matched the schema as sent
    Original,
    /// Body matched after repair; contains the repaired call body bytes
    Healed(Vec<u8>),
}

/// Validate `body` against `schema`, attempting a repair when it fails.
///
/// The error string is the validation failure of the original body.
pub fn validate_and_heal(body: &[u8], schema: &Value) -> Result<Validated, String> {
    let instance: Value = serde_json::from_slice(body).map_err(|e| format!("invalid JSON: {}", e))?;

    let compiled = match JSONSchema::compile(schema) {
        Ok(compiled) => compiled,
        Err(e) => {
            warn!(error = %e, "tool schema does not compile, skipping validation");
            return Ok(Validated::Original);
        }
    };

    let original_error = match check(&compiled, &instance) {
        Ok(()) => return Ok(Validated::Original),
        Err(message) => message,
    };

    let healed = heal(&instance, schema, schema);
    if healed == instance {
        return Err(original_error);
    }

    match check(&compiled, &healed) {
        Ok(()) => {
            debug!("tool call body repaired by parsing stringified JSON");
            serde_json::to_vec(&healed)
                .map(Validated::Healed)
                .map_err(|_| original_error)
        }
        Err(_) => Err(original_error),
    }
}

fn check(compiled: &JSONSchema, instance: &Value) -> Result<(), String> {
    let stripped = strip_gateway_fields(instance);
    let result = compiled.validate(&stripped);
    match result {
        Ok(()) => Ok(()),
        Err(errors) => {
            let messages: Vec<String> = errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    if path.is_empty() {
                        e.to_string()
                    } else {
                        format!("{}: {}", path, e)
                    }
                })
                .collect();
            Err(messages.join("; "))
        }
    }
}

fn strip_gateway_fields(instance: &Value) -> Value {
    let mut stripped = instance.clone();
    if let Value::Object(map) = &mut stripped {
        for field in GATEWAY_FIELDS {
            map.remove(*field);
        }
    }
    stripped
}

fn resolve<'a>(schema: &'a Value, root: &'a Value) -> &'a Value {
    let mut current = schema;
    // Bounded to break reference cycles
    for _ in 0..16 {
        match current.get("$ref").and_then(Value::as_str) {
            Some(reference) if reference.starts_with('#') => {
                match root.pointer(&reference[1..]) {
                    Some(target) => current = target,
                    None => return current,
                }
            }
            _ => return current,
        }
    }
    current
}

fn expects(schema: &Value, kind: &str) -> bool {
    match schema.get("type") {
        Some(Value::String(t)) => t == kind,
        Some(Value::Array(types)) => types.iter().any(|t| t.as_str() == Some(kind)),
        _ => match kind {
            "object" => schema.get("properties").is_some(),
            "array" => schema.get("items").is_some(),
            _ => false,
        },
    }
}

fn branches(schema: &Value) -> impl Iterator<Item = &Value> {
    ["oneOf", "anyOf", "allOf"]
        .into_iter()
        .filter_map(move |key| schema.get(key).and_then(Value::as_array))
        .flatten()
}

/// Parse stringified objects/arrays wherever the schema asks for them
pub fn heal(value: &Value, schema: &Value, root: &Value) -> Value {
    let schema = resolve(schema, root);

    if let Value::String(text) = value {
        let wants_object = expects(schema, "object");
        let wants_array = expects(schema, "array");
        let branch_wants = branches(schema).any(|b| {
            let b = resolve(b, root);
            expects(b, "object") || expects(b, "array")
        });
        if wants_object || wants_array || branch_wants {
            if let Ok(parsed) = serde_json::from_str::<Value>(text) {
                let fits = (parsed.is_object() && (wants_object || branch_wants))
                    || (parsed.is_array() && (wants_array || branch_wants));
                if fits {
                    return heal(&parsed, schema, root);
                }
            }
        }
        return value.clone();
    }

    let mut healed = match value {
        Value::Object(map) => {
            let properties = schema.get("properties").and_then(Value::as_object);
            let additional = schema
                .get("additionalProperties")
                .filter(|a| a.is_object());
            let mut out = map.clone();
            for (key, child) in map {
                let child_schema = properties.and_then(|p| p.get(key)).or(additional);
                if let Some(child_schema) = child_schema {
                    out.insert(key.clone(), heal(child, child_schema, root));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => match schema.get("items") {
            Some(item_schema) if item_schema.is_object() => {
                Value::Array(items.iter().map(|item| heal(item, item_schema, root)).collect())
            }
            _ => value.clone(),
        },
        _ => value.clone(),
    };

    for branch in branches(schema) {
        let candidate = heal(&healed, branch, root);
        if candidate != healed {
            healed = candidate;
            break;
        }
    }

    healed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "user": {
                    "type": "object",
                    "properties": {"name": {"type": "string"}}
                }
            }
        })
    }

    #[test]
    fn test_valid_body_passes_untouched() {
        let body = br#"{"user":{"name":"Jane"},"gram-request-summary":"x"}"#;
        assert_eq!(validate_and_heal(body, &user_schema()), Ok(Validated::Original));
    }

    #[test]
    fn test_stringified_object_is_healed() {
        let body = br#"{"user":"{\"name\":\"Jane\"}"}"#;
        let healed = match validate_and_heal(body, &user_schema()).unwrap() {
            Validated::Healed(bytes) => bytes,
            other => panic!("expected healed body, got {:?}", other),
        };
        let value: Value = serde_json::from_slice(&healed).unwrap();
        assert_eq!(value, json!({"user": {"name": "Jane"}}));
    }

    #[test]
    fn test_unhealable_body_reports_original_error() {
        let body = br#"{"user":"not json"}"#;
        let err = validate_and_heal(body, &user_schema()).unwrap_err();
        assert!(err.contains("user"), "{}", err);
    }

    #[test]
    fn test_gateway_fields_are_ignored() {
        let schema = json!({
            "type": "object",
            "properties": {"body": {"type": "object"}},
            "additionalProperties": false
        });
        let body = br#"{"body":{},"environmentVariables":{"A":"b"},"gram-request-summary":"s"}"#;
        assert_eq!(validate_and_heal(body, &schema), Ok(Validated::Original));
    }

    #[test]
    fn test_heals_through_refs_arrays_and_one_of() {
        let schema = json!({
            "type": "object",
            "definitions": {"tag": {"type": "object", "properties": {"id": {"type": "integer"}}, "required": ["id"]}},
            "properties": {
                "tags": {"type": "array", "items": {"$ref": "#/definitions/tag"}},
                "choice": {"oneOf": [{"type": "object", "properties": {"a": {"type": "integer"}}, "required": ["a"]}, {"type": "integer"}]}
            }
        });
        let body = br#"{"tags":"[{\"id\":1},\"{\\\"id\\\":2}\"]","choice":"{\"a\":1}"}"#;
        let healed = match validate_and_heal(body, &schema).unwrap() {
            Validated::Healed(bytes) => serde_json::from_slice::<Value>(&bytes).unwrap(),
            other => panic!("expected healed body, got {:?}", other),
        };
        assert_eq!(healed["tags"], json!([{"id": 1}, {"id": 2}]));
        assert_eq!(healed["choice"], json!({"a": 1}));
    }
}
