use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::domain::ValidationError;

// Constant pattern; compiled by `test_patterns_compile`
static NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9][-a-zA-Z0-9]*$").expect("name pattern is valid")
});

const MAX_NAME_LEN: usize = 128;

/// Why `name` is not usable as a template, step, task, or input name
pub(super) fn name_problem(name: &str) -> Option<String> {
    if name.len() > MAX_NAME_LEN {
        return Some(format!("must be no more than {MAX_NAME_LEN} characters"));
    }
    if !NAME_PATTERN.is_match(name) {
        return Some(
            "must consist of alpha-numeric characters or '-', and must start with an alpha-numeric character"
                .to_string(),
        );
    }
    None
}

/// Names in a list must be present, well formed, and unique.
pub(super) fn validate_field_names<'a>(
    prefix: &str,
    names: impl IntoIterator<Item = &'a str>,
) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for (i, name) in names.into_iter().enumerate() {
        if name.is_empty() {
            return Err(ValidationError::invalid(format!(
                "{prefix}[{i}].name is required"
            )));
        }
        if let Some(problem) = name_problem(name) {
            return Err(ValidationError::invalid(format!(
                "{prefix}[{i}].name: '{name}' is invalid: {problem}"
            )));
        }
        if !seen.insert(name) {
            return Err(ValidationError::invalid(format!(
                "{prefix}[{i}].name '{name}' is not unique"
            )));
        }
    }
    Ok(())
}
