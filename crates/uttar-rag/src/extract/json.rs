//! Salvage parsing of JSON arrays out of model responses.
//!
//! Local models wrap output in prose, think tags, or emit several arrays
//! back to back. The strategy: strip think blocks, locate the first
//! bracket-balanced array, parse it; failing that, collect top-level objects
//! individually.

use serde_json::Value;

use crate::llm::clean_response;

/// Extract a JSON array of objects from a raw model response. Returns an
/// empty vec when nothing salvageable is present; callers treat that as a
/// discarded (non-fatal) extraction for the chunk in question.
pub fn parse_json_array(response: &str) -> Vec<Value> {
    if response.trim().is_empty() {
        return Vec::new();
    }

    let cleaned = clean_response(response);

    let Some(start) = cleaned.find('[') else {
        return Vec::new();
    };

    // First bracket-balanced array, ignoring brackets inside strings.
    if let Some(end) = balanced_array_end(&cleaned[start..]) {
        let slice = &cleaned[start..start + end];
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(slice) {
            return items.into_iter().filter(|v| v.is_object()).collect();
        }
    }

    // Last resort: widest [..] span, then individual objects.
    let wide_end = cleaned.rfind(']').map(|p| p + 1).unwrap_or(cleaned.len());
    if wide_end > start {
        let slice = &cleaned[start..wide_end];
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(slice) {
            return items.into_iter().filter(|v| v.is_object()).collect();
        }
        return extract_objects(slice);
    }

    Vec::new()
}

/// Byte length of the first balanced `[...]` from the start of `s` (which
/// must begin with '['), or None if unterminated.
fn balanced_array_end(s: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in s.char_indices() {
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
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Collect `{...}` objects that parse on their own (no nested braces).
fn extract_objects(s: &str) -> Vec<Value> {
    let mut objects = Vec::new();
    let mut rest = s;
    while let Some(open) = rest.find('{') {
        let candidate = &rest[open..];
        let Some(close) = candidate.find('}') else { break };
        if let Ok(value) = serde_json::from_str::<Value>(&candidate[..close + 1]) {
            if value.is_object() {
                objects.push(value);
            }
        }
        rest = &candidate[close + 1..];
    }
    objects
}
