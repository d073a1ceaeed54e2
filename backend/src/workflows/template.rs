// Template rendering - `{{a.b}}` dotted lookups into a JSON environment

use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::LazyLock;
use thiserror::Error;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}").expect("placeholder pattern is valid")
});

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Legacy placeholder syntax '{{{{{0}}}}}': drop the leading dot")]
    LegacySyntax(String),
}

fn lookup<'a>(env: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .map(str::trim)
        .try_fold(env, |current, part| current.get(part))
}

fn to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// Replaces every placeholder with the value at its path. Unknown paths
/// render empty.
pub fn render(template: &str, env: &Value) -> Result<String, TemplateError> {
    if let Some(legacy) = PLACEHOLDER
        .captures_iter(template)
        .map(|cap| cap[1].to_string())
        .find(|path| path.starts_with('.'))
    {
        return Err(TemplateError::LegacySyntax(legacy));
    }

    let rendered = PLACEHOLDER.replace_all(template, |cap: &Captures| {
        let path = &cap[1];
        if path.is_empty() {
            return String::new();
        }
        lookup(env, path).map(to_text).unwrap_or_default()
    });

    Ok(rendered.into_owned())
}
