//! Output-field selection and reference stripping

use serde_json::{Map, Value};

#[derive(Debug, PartialEq)]
enum Step<'a> {
    Key(&'a str),
    Index(usize),
}

/// Split `a.b[0][1].c` into keys and indices; `None` for malformed indices
fn parse_path(path: &str) -> Option<Vec<Step<'_>>> {
    let mut steps = Vec::new();
    for segment in path.split('.') {
        let (key, mut rest) = match segment.find('[') {
            Some(pos) => (&segment[..pos], &segment[pos..]),
            None => (segment, ""),
        };
        if !key.is_empty() {
            steps.push(Step::Key(key));
        }
        while let Some(stripped) = rest.strip_prefix('[') {
            let close = stripped.find(']')?;
            let index = stripped[..close].trim().parse().ok()?;
            steps.push(Step::Index(index));
            rest = &stripped[close + 1..];
        }
        if !rest.is_empty() {
            return None;
        }
    }
    Some(steps)
}

fn lookup<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    parse_path(path)?
        .into_iter()
        .try_fold(value, |current, step| match step {
            Step::Key(key) => current.as_object()?.get(key),
            Step::Index(index) => current.as_array()?.get(index),
        })
}

fn split_paths(paths: &str) -> impl Iterator<Item = &str> {
    paths.split(',').map(str::trim).filter(|p| !p.is_empty())
}

/// Select values by comma-separated paths.
///
/// Returns the input unchanged when `paths` is empty; otherwise an object
/// mapping each path that resolved to its value. Paths that do not resolve
/// are left out.
pub fn filter_json(value: &Value, paths: Option<&str>) -> Value {
    let Some(paths) = paths.filter(|p| !p.trim().is_empty()) else {
        return value.clone();
    };

    let selected: Map<String, Value> = split_paths(paths)
        .filter_map(|path| lookup(value, path).map(|v| (path.to_string(), v.clone())))
        .collect();

    Value::Object(selected)
}

/// Text form of a JSON value: strings verbatim, everything else serialized
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Answer text to evaluate from a target response.
///
/// With no paths the whole response is used. A single path yields that value
/// as text; several paths yield the selected object serialized. `None` when
/// nothing resolved or the answer is empty.
pub fn output_text(value: &Value, paths: Option<&str>) -> Option<String> {
    let text = match paths.filter(|p| !p.trim().is_empty()) {
        None => value_to_text(value),
        Some(paths) => {
            let selected: Vec<&str> = split_paths(paths).collect();
            match selected.as_slice() {
                [single] => value_to_text(lookup(value, single)?),
                _ => {
                    let filtered = filter_json(value, Some(paths));
                    if filtered.as_object().is_some_and(Map::is_empty) {
                        return None;
                    }
                    filtered.to_string()
                }
            }
        }
    };

    match value {
        Value::Null if paths.is_none() => None,
        _ if text.trim().is_empty() => None,
        _ => Some(text),
    }
}

/// Remove bracketed citation markers such as `[3]` or `[source 2]`.
///
/// An unmatched `[` and everything after it is kept.
pub fn strip_references(statement: &str) -> String {
    let mut out = String::with_capacity(statement.len());
    let mut rest = statement;

    while let Some(open) = rest.find('[') {
        match rest[open + 1..].find(']') {
            Some(close) => {
                out.push_str(&rest[..open]);
                rest = &rest[open + 1 + close + 1..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out
}
