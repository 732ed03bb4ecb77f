//! Lenient JSON extraction from model replies

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

use super::{ParseError, ParseResult};

static THINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").unwrap());

static CODE_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```(?:json|JSON)?\s*\n?([\s\S]*?)\n?```").unwrap());

static TRAILING_COMMA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",(\s*[}\]])").unwrap());

static UNQUOTED_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\{|,)\s*([a-zA-Z_][a-zA-Z0-9_]*)\s*:").unwrap());

/// Parse a model reply into JSON, repairing common defects.
///
/// # Errors
///
/// Returns [`ParseError::EmptyInput`] for blank replies and
/// [`ParseError::InvalidFormat`] when nothing parses after repair.
pub fn parse_json(raw: &str) -> ParseResult<Value> {
    let without_thinking = THINK_RE.replace_all(raw, "");
    let trimmed = without_thinking.trim();
    if trimmed.is_empty() {
        return Err(ParseError::EmptyInput);
    }

    let input = strip_code_fences(trimmed);

    if let Ok(value) = serde_json::from_str::<Value>(input) {
        return Ok(value);
    }

    if let Some(extracted) = extract_balanced(input) {
        if let Ok(value) = serde_json::from_str::<Value>(extracted) {
            return Ok(value);
        }
        if let Ok(value) = serde_json::from_str::<Value>(&repair(extracted)) {
            return Ok(value);
        }
    }

    serde_json::from_str::<Value>(&repair(input)).map_err(|_| {
        ParseError::InvalidFormat("Failed to parse JSON after repair attempts".to_string())
    })
}

/// Parse a model reply that must be a JSON object.
///
/// # Errors
///
/// Same as [`parse_json`], plus [`ParseError::NotAnObject`] for arrays and
/// scalars.
pub fn parse_json_object(raw: &str) -> ParseResult<Map<String, Value>> {
    match parse_json(raw)? {
        Value::Object(map) => Ok(map),
        other => Err(ParseError::NotAnObject(kind(&other).to_string())),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn strip_code_fences(input: &str) -> &str {
    CODE_FENCE_RE
        .captures(input)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .unwrap_or(input)
}

/// First balanced `{...}` or `[...]` span, skipping brackets inside strings
fn extract_balanced(input: &str) -> Option<&str> {
    let start = input.find(['{', '['])?;
    let substring = &input[start..];

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in substring.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' | '[' if !in_string => depth += 1,
            '}' | ']' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&substring[..=i]);
                }
            }
            _ => {}
        }
    }

    // Unterminated: let repair close it
    Some(substring)
}

fn repair(input: &str) -> String {
    let mut result = TRAILING_COMMA_RE.replace_all(input, "$1").into_owned();
    result = fix_quotes(&result);
    result = UNQUOTED_KEY_RE
        .replace_all(&result, r#"$1"$2":"#)
        .into_owned();

    let open_braces = result.matches('{').count();
    let close_braces = result.matches('}').count();
    let open_brackets = result.matches('[').count();
    let close_brackets = result.matches(']').count();

    for _ in close_brackets..open_brackets {
        result.push(']');
    }
    for _ in close_braces..open_braces {
        result.push('}');
    }

    result
}

/// Single-quoted strings become double-quoted; apostrophes inside double quotes stay
fn fix_quotes(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut in_double = false;
    let mut in_single = false;
    let mut escape_next = false;

    for c in input.chars() {
        if escape_next {
            result.push(c);
            escape_next = false;
            continue;
        }

        match c {
            '\\' => {
                result.push(c);
                escape_next = true;
            }
            '"' if in_single => result.push_str("\\\""),
            '"' => {
                in_double = !in_double;
                result.push(c);
            }
            '\'' if !in_double => {
                in_single = !in_single;
                result.push('"');
            }
            _ => result.push(c),
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_json() {
        let value = parse_json(r#"{"request": "hello"}"#).unwrap();
        assert_eq!(value["request"], "hello");
    }

    #[test]
    fn parses_fenced_json_with_prose() {
        let raw = "Sure, here you go:\n```json\n{\"similarity\": 0.8}\n```\nAnything else?";
        let value = parse_json(raw).unwrap();
        assert_eq!(value["similarity"], 0.8);
    }

    #[test]
    fn extracts_object_from_surrounding_text() {
        let raw = r#"Comparison result: {"answered": true, "note": "uses {braces}"} done"#;
        let value = parse_json(raw).unwrap();
        assert_eq!(value["answered"], true);
        assert_eq!(value["note"], "uses {braces}");
    }

    #[test]
    fn repairs_single_quotes_and_trailing_commas() {
        let value = parse_json("{'score': 0.5, 'reason': 'fine',}").unwrap();
        assert_eq!(value["score"], 0.5);
        assert_eq!(value["reason"], "fine");
    }

    #[test]
    fn repairs_unquoted_keys_and_missing_brace() {
        let value = parse_json(r#"{request: "next step""#).unwrap();
        assert_eq!(value["request"], "next step");
    }

    #[test]
    fn ignores_thinking_blocks() {
        let raw = "<think>maybe {not this}</think>{\"request\": \"x\"}";
        assert_eq!(parse_json(raw).unwrap()["request"], "x");
    }

    #[test]
    fn rejects_empty_and_non_objects() {
        assert_eq!(parse_json("   "), Err(ParseError::EmptyInput));
        assert!(matches!(
            parse_json_object("[1, 2]"),
            Err(ParseError::NotAnObject(_))
        ));
        assert!(parse_json("no json here").is_err());
    }
}
