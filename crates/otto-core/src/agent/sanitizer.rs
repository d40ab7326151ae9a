//! Tool-call argument repair and schema validation
//!
//! Backends mangle tool arguments in a few recurring ways: concatenated
//! duplicate payloads (`}{` boundary), double/triple JSON-encoded
//! strings, and non-object payloads. Repairs happen here; every repair
//! is recorded as a warning the model gets to see.

use serde_json::{Map, Value};

use crate::ai::types::ToolSchema;

/// Maximum re-parse passes for nested string-encoded payloads.
const MAX_DECODE_LAYERS: usize = 5;

/// Repaired arguments plus the warnings produced along the way.
#[derive(Debug, Clone)]
pub struct Sanitized {
    pub args: Map<String, Value>,
    pub warnings: Vec<String>,
}

/// Repair a raw argument payload into a plain JSON object.
pub fn sanitize(raw: &str) -> Sanitized {
    let mut warnings = Vec::new();
    let mut text = raw.trim().to_string();

    if let Some(first) = first_balanced_object(&text) {
        if first.len() < text.len() {
            warnings.push(format!(
                "tool arguments contained {} extra bytes after the first JSON object; kept only the first object",
                text.len() - first.len()
            ));
            text = first;
        }
    }

    let mut value: Value = match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(e) => {
            warnings.push(format!("tool arguments were not valid JSON ({e}); using empty object"));
            return Sanitized {
                args: Map::new(),
                warnings,
            };
        }
    };

    let mut layers = 0;
    while let Value::String(inner) = &value {
        if layers >= MAX_DECODE_LAYERS {
            break;
        }
        match serde_json::from_str::<Value>(inner) {
            Ok(decoded) => {
                layers += 1;
                value = decoded;
            }
            Err(_) => break,
        }
    }
    if layers > 0 {
        warnings.push(format!(
            "tool arguments were JSON-encoded {} extra time(s); decoded them",
            layers
        ));
    }

    let args = match value {
        Value::Object(map) => map,
        other => {
            warnings.push(format!(
                "tool arguments decoded to {} instead of an object; using empty object",
                json_type_name(&other)
            ));
            Map::new()
        }
    };

    Sanitized { args, warnings }
}

/// Validate repaired arguments against a declared schema. Returns an
/// error string (handed back to the model as the tool result) or None.
pub fn validate(tool_name: &str, args: &Map<String, Value>, schema: &ToolSchema) -> Option<String> {
    let declared: Vec<&str> = schema.parameters.properties.keys().map(|k| k.as_str()).collect();

    if declared.is_empty() && !args.is_empty() {
        return Some(format!(
            "Tool '{}' takes no parameters but received: {}",
            tool_name,
            args.keys().cloned().collect::<Vec<_>>().join(", ")
        ));
    }

    let unknown: Vec<&String> = args.keys().filter(|k| !declared.contains(&k.as_str())).collect();
    if !unknown.is_empty() {
        return Some(format!(
            "Unknown parameter(s) {} for tool '{}'. Valid parameters: {}",
            unknown.iter().map(|k| format!("'{k}'")).collect::<Vec<_>>().join(", "),
            tool_name,
            if declared.is_empty() {
                "(none)".to_string()
            } else {
                declared.join(", ")
            }
        ));
    }

    let missing: Vec<&str> = schema
        .parameters
        .required
        .iter()
        .map(|r| r.as_str())
        .filter(|r| !args.contains_key(*r))
        .collect();
    if !missing.is_empty() {
        return Some(format!(
            "Missing required parameter(s) {} for tool '{}'",
            missing.iter().map(|m| format!("'{m}'")).collect::<Vec<_>>().join(", "),
            tool_name
        ));
    }

    None
}

/// Extract the first balanced-brace JSON object from `text`, if the text
/// starts with one. String literals and escapes are respected so braces
/// inside values do not confuse the scan.
fn first_balanced_object(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    if bytes.first() != Some(&b'{') {
        return None;
    }

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[..=i].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::types::ToolParameters;
    use serde_json::json;

    fn schema(properties: Value, required: &[&str]) -> ToolSchema {
        ToolSchema {
            name: "edit".to_string(),
            description: "edit a file".to_string(),
            parameters: ToolParameters {
                schema_type: "object".to_string(),
                properties: properties.as_object().cloned().unwrap_or_default(),
                required: required.iter().map(|s| s.to_string()).collect(),
            },
        }
    }

    #[test]
    fn duplicate_payload_keeps_first_object() {
        let result = sanitize(r#"{"path":"a"}{"path":"a"}"#);
        assert_eq!(result.args.get("path"), Some(&json!("a")));
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn double_encoded_payload_is_decoded() {
        let inner = r#"{"path":"a"}"#;
        let outer = serde_json::to_string(inner).unwrap();
        let result = sanitize(&outer);
        assert_eq!(result.args.get("path"), Some(&json!("a")));
        assert!(result.warnings[0].contains("1 extra time"));
    }

    #[test]
    fn triple_encoded_payload_is_decoded() {
        let inner = r#"{"n":1}"#;
        let twice = serde_json::to_string(inner).unwrap();
        let thrice = serde_json::to_string(&twice).unwrap();
        let result = sanitize(&thrice);
        assert_eq!(result.args.get("n"), Some(&json!(1)));
    }

    #[test]
    fn non_object_payload_coerces_to_empty() {
        let result = sanitize("[1,2,3]");
        assert!(result.args.is_empty());
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn garbage_payload_coerces_to_empty() {
        let result = sanitize("not json at all");
        assert!(result.args.is_empty());
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn sanitize_is_idempotent_on_repaired_output() {
        let raw = r#"{"path":"a","mode":2}{"path":"a","mode":2}"#;
        let once = sanitize(raw);
        let again = sanitize(&Value::Object(once.args.clone()).to_string());
        assert_eq!(once.args, again.args);
        assert!(again.warnings.is_empty());
    }

    #[test]
    fn braces_inside_strings_do_not_split_payload() {
        let result = sanitize(r#"{"text":"a } b { c"}"#);
        assert_eq!(result.args.get("text"), Some(&json!("a } b { c")));
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn validate_rejects_unknown_parameters() {
        let schema = schema(json!({"path": {"type": "string"}}), &["path"]);
        let args = sanitize(r#"{"path":"a","bogus":1}"#).args;
        let error = validate("edit", &args, &schema).unwrap();
        assert!(error.contains("bogus"));
        assert!(error.contains("path"));
    }

    #[test]
    fn validate_rejects_args_for_parameterless_tool() {
        let schema = schema(json!({}), &[]);
        let args = sanitize(r#"{"anything":true}"#).args;
        assert!(validate("ping", &args, &schema).is_some());
    }

    #[test]
    fn validate_requires_required_parameters() {
        let schema = schema(json!({"path": {"type": "string"}, "limit": {"type": "number"}}), &["path"]);
        let args = sanitize(r#"{"limit":3}"#).args;
        let error = validate("edit", &args, &schema).unwrap();
        assert!(error.contains("'path'"));
    }

    #[test]
    fn validate_accepts_well_formed_args() {
        let schema = schema(json!({"path": {"type": "string"}}), &["path"]);
        let args = sanitize(r#"{"path":"a"}"#).args;
        assert!(validate("edit", &args, &schema).is_none());
    }
}
