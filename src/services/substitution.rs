//! `{{variable}}` substitution over serialized templates and arguments.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

// Constant pattern; compiled by `test_tag_pattern_compiles`
static TAG_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{([^{}]+)\}\}").expect("tag pattern is valid"));

/// Variable name to value
pub type Scope = HashMap<String, String>;

#[derive(Debug, Error)]
pub enum SubstitutionError {
    #[error("failed to resolve {{{{{0}}}}}")]
    Unresolved(String),

    #[error("failed to re-encode substituted value: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Trimmed contents of every `{{...}}` tag in `s`
pub fn tags(s: &str) -> impl Iterator<Item = &str> {
    TAG_PATTERN
        .captures_iter(s)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().trim()))
}

/// Replace the tags in `s`. Unknown tags are left in place unless `strict`.
pub fn substitute_str(s: &str, scope: &Scope, strict: bool) -> Result<String, SubstitutionError> {
    let mut unresolved = None;
    let replaced = TAG_PATTERN.replace_all(s, |caps: &Captures<'_>| {
        let tag = caps[1].trim();
        match scope.get(tag) {
            Some(value) => value.clone(),
            None => {
                if unresolved.is_none() {
                    unresolved = Some(tag.to_string());
                }
                caps[0].to_string()
            }
        }
    });
    match unresolved {
        Some(tag) if strict => Err(SubstitutionError::Unresolved(tag)),
        _ => Ok(replaced.into_owned()),
    }
}

/// Substitute every string inside `value`, keys included.
pub fn substitute<T>(value: &T, scope: &Scope, strict: bool) -> Result<T, SubstitutionError>
where
    T: Serialize + DeserializeOwned,
{
    let tree = substitute_value(serde_json::to_value(value)?, scope, strict)?;
    Ok(serde_json::from_value(tree)?)
}

fn substitute_value(value: Value, scope: &Scope, strict: bool) -> Result<Value, SubstitutionError> {
    Ok(match value {
        Value::String(s) => Value::String(substitute_str(&s, scope, strict)?),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| substitute_value(item, scope, strict))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    Ok((
                        substitute_str(&k, scope, strict)?,
                        substitute_value(v, scope, strict)?,
                    ))
                })
                .collect::<Result<_, SubstitutionError>>()?,
        ),
        other => other,
    })
}
