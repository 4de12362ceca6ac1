use serde_json::Value;

use crate::error::EngineError;

/// Extracts structured JSON from free-form worker stdout.
///
/// 1. If the entire output parses as JSON, accept it.
/// 2. Otherwise scan for the last balanced `{...}` or `[...]` block and
///    try to parse that.
/// 3. On failure, return a descriptive error naming the first offending
///    offset.
///
/// Never edits the output persisted to disk — this only returns a
/// structured value for downstream use.
pub fn extract(stdout: &str) -> Result<Value, EngineError> {
    let trimmed = stdout.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    if let Some(block) = last_balanced_block(stdout) {
        if let Ok(value) = serde_json::from_str::<Value>(&block) {
            return Ok(value);
        }
    }

    let offset = first_offending_offset(stdout);
    Err(EngineError::OutputParseError(format!(
        "no parseable JSON object or array found (first suspicious character at byte offset {})",
        offset
    )))
}

/// Scans from the end of the string for the last `{`/`[` that has a
/// matching balanced close, respecting string literals and escapes so
/// braces inside quoted text don't confuse the scan.
fn last_balanced_block(stdout: &str) -> Option<String> {
    let bytes: Vec<char> = stdout.chars().collect();
    let opens: Vec<usize> = bytes
        .iter()
        .enumerate()
        .filter(|(_, c)| **c == '{' || **c == '[')
        .map(|(i, _)| i)
        .collect();

    for &start in opens.iter().rev() {
        if let Some(end) = find_matching_close(&bytes, start) {
            let candidate: String = bytes[start..=end].iter().collect();
            return Some(candidate);
        }
    }
    None
}

fn find_matching_close(chars: &[char], start: usize) -> Option<usize> {
    let open = chars[start];
    let close = match open {
        '{' => '}',
        '[' => ']',
        _ => return None,
    };
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Best-effort locate the first character that isn't whitespace, used to
/// give the caller something actionable in the parse-failure message.
fn first_offending_offset(stdout: &str) -> usize {
    stdout
        .char_indices()
        .find(|(_, c)| !c.is_whitespace())
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Schema requirement for a single field: name plus expected primitive
/// kind. Composite/array/object fields are checked for presence only —
/// deep structural validation is left to the per-pathway `requiredOutputs`
/// consumer, which knows the pathway-specific shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Bool,
    Array,
    Object,
    Any,
}

#[derive(Debug, Clone)]
pub struct RequiredField {
    pub name: &'static str,
    pub kind: FieldKind,
}

/// Validates that `value` is a JSON object with all `required` fields
/// present and primitive-typed as declared. Unknown fields are preserved
/// (the caller receives the full `Value`, not a stripped-down struct).
pub fn validate_schema(value: &Value, required: &[RequiredField]) -> Result<(), EngineError> {
    let obj = value
        .as_object()
        .ok_or_else(|| EngineError::OutputParseError("expected a JSON object".to_string()))?;

    let mut missing = Vec::new();
    let mut wrong_type = Vec::new();

    for field in required {
        match obj.get(field.name) {
            None => missing.push(field.name),
            Some(v) => {
                if !matches_kind(v, field.kind) {
                    wrong_type.push(field.name);
                }
            }
        }
    }

    if missing.is_empty() && wrong_type.is_empty() {
        return Ok(());
    }

    let mut msg = String::new();
    if !missing.is_empty() {
        msg.push_str(&format!("missing required fields: {}", missing.join(", ")));
    }
    if !wrong_type.is_empty() {
        if !msg.is_empty() {
            msg.push_str("; ");
        }
        msg.push_str(&format!("wrong type for fields: {}", wrong_type.join(", ")));
    }
    Err(EngineError::OutputParseError(msg))
}

fn matches_kind(value: &Value, kind: FieldKind) -> bool {
    match kind {
        FieldKind::String => value.is_string(),
        FieldKind::Number => value.is_number(),
        FieldKind::Bool => value.is_boolean(),
        FieldKind::Array => value.is_array(),
        FieldKind::Object => value.is_object(),
        FieldKind::Any => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_output_parses_as_json() {
        let out = r#"{"foo": "bar"}"#;
        let value = extract(out).unwrap();
        assert_eq!(value["foo"], "bar");
    }

    #[test]
    fn recovers_trailing_json_block_from_chatter() {
        let out = "Thinking about it...\nHere's my answer:\n{\"evidence_found\": true, \"source_rating\": \"A\"}\n";
        let value = extract(out).unwrap();
        assert_eq!(value["evidence_found"], true);
    }

    #[test]
    fn ignores_braces_inside_string_literals() {
        let out = "preamble { not json\nFinal: {\"note\": \"contains a { brace } in text\"}";
        let value = extract(out).unwrap();
        assert_eq!(value["note"], "contains a { brace } in text");
    }

    #[test]
    fn unparseable_output_is_a_descriptive_error() {
        let out = "completely unstructured prose with no JSON at all";
        let err = extract(out).unwrap_err();
        match err {
            EngineError::OutputParseError(msg) => assert!(msg.contains("byte offset")),
            other => panic!("expected OutputParseError, got {:?}", other),
        }
    }

    #[test]
    fn validate_schema_reports_missing_and_wrong_type_fields() {
        let value = serde_json::json!({"evidence_found": "yes"});
        let required = vec![
            RequiredField { name: "evidence_found", kind: FieldKind::Bool },
            RequiredField { name: "source_rating", kind: FieldKind::String },
        ];
        let err = validate_schema(&value, &required).unwrap_err();
        match err {
            EngineError::OutputParseError(msg) => {
                assert!(msg.contains("missing required fields: source_rating"));
                assert!(msg.contains("wrong type for fields: evidence_found"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn validate_schema_preserves_unknown_fields() {
        let value = serde_json::json!({"evidence_found": true, "extra": "kept"});
        let required = vec![RequiredField { name: "evidence_found", kind: FieldKind::Bool }];
        assert!(validate_schema(&value, &required).is_ok());
        assert_eq!(value["extra"], "kept");
    }
}
