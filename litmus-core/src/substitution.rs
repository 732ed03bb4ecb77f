//! Placeholder expansion for request payload templates
//!
//! Two passes over every JSON string value (object keys are never touched):
//! 1. [`expand`] replaces `{name}` with the bound value for that name
//! 2. [`resolve_files`] replaces `[FILE: name]` with content from a
//!    [`FileResolver`]; failures keep the literal token and yield a
//!    [`ResolutionWarning`]

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::files::FileResolver;
use crate::model::{ResolutionWarning, Unit};

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

static FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[FILE:\s*([^\]]*?)\s*\]").unwrap());

/// Values available to `{name}` placeholders.
///
/// Unset optional fields are unbound, so their placeholders stay literal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bindings {
    pub query: String,
    pub response: String,
    pub filter: Option<String>,
    pub source: Option<String>,
    pub block: bool,
    pub category: Option<String>,
    pub auth_token: Option<String>,
}

impl Bindings {
    /// Bindings for one unit of a run
    pub fn for_unit(unit: &Unit, auth_token: Option<&str>) -> Self {
        Self {
            query: unit.query.clone(),
            response: unit.response.clone(),
            filter: unit.filter.clone(),
            source: unit.source.clone(),
            block: unit.block,
            category: unit.category.clone(),
            auth_token: auth_token.map(str::to_string),
        }
    }

    /// Same bindings with `{query}` replaced, used for mission turns
    pub fn with_query(&self, query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..self.clone()
        }
    }

    fn lookup(&self, name: &str) -> Option<String> {
        match name {
            "query" => Some(self.query.clone()),
            "response" => Some(self.response.clone()),
            "filter" => self.filter.clone(),
            "source" => self.source.clone(),
            "block" => Some(self.block.to_string()),
            "category" => self.category.clone(),
            "auth_token" => self.auth_token.clone(),
            _ => None,
        }
    }
}

/// Apply `f` to every string value, recursing through arrays and objects
fn map_strings(value: &Value, f: &mut impl FnMut(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(f(s)),
        Value::Array(items) => Value::Array(items.iter().map(|v| map_strings(v, f)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), map_strings(v, f)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn visit_strings<'v>(value: &'v Value, f: &mut impl FnMut(&'v str)) {
    match value {
        Value::String(s) => f(s),
        Value::Array(items) => items.iter().for_each(|v| visit_strings(v, f)),
        Value::Object(map) => map.values().for_each(|v| visit_strings(v, f)),
        _ => {}
    }
}

/// Expand `{name}` placeholders in a payload template.
///
/// Bound values are inserted as raw text into the string they appear in, in
/// a single pass, so values containing braces are never re-expanded.
pub fn expand(template: &Value, bindings: &Bindings) -> Value {
    map_strings(template, &mut |s: &str| {
        PLACEHOLDER_RE
            .replace_all(s, |caps: &Captures| {
                bindings
                    .lookup(&caps[1])
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    })
}

/// Names referenced by `[FILE: name]` tokens, deduplicated
pub fn file_references(payload: &Value) -> Vec<String> {
    let mut names = Vec::new();
    visit_strings(payload, &mut |s| {
        for caps in FILE_RE.captures_iter(s) {
            let name = caps[1].to_string();
            if !names.contains(&name) {
                names.push(name);
            }
        }
    });
    names
}

/// Replace `[FILE: name]` tokens with resolved content.
///
/// Every name is resolved once. Unresolved tokens stay literal and produce
/// one warning per name.
pub async fn resolve_files(
    payload: &Value,
    resolver: &dyn FileResolver,
) -> (Value, Vec<ResolutionWarning>) {
    let names = file_references(payload);
    if names.is_empty() {
        return (payload.clone(), Vec::new());
    }

    let mut resolved = BTreeMap::new();
    let mut warnings = Vec::new();
    for name in names {
        match resolver.resolve(&name).await {
            Ok(content) => {
                resolved.insert(name, content);
            }
            Err(e) => {
                tracing::warn!(file = %name, error = %e, "Unresolved file reference");
                warnings.push(ResolutionWarning {
                    reason: e.to_string(),
                    name,
                });
            }
        }
    }

    let expanded = map_strings(payload, &mut |s: &str| {
        FILE_RE
            .replace_all(s, |caps: &Captures| {
                resolved
                    .get(&caps[1])
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    });

    (expanded, warnings)
}
