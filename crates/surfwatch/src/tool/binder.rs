//! `{{name}}` placeholder substitution for tool command templates.
//!
//! Binding is purely textual. Values are inserted exactly as given, so
//! callers that build shell command lines quote them first (see
//! [`crate::sanitize::shell_quote`]) and screen them with [`check_value`].

use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::error::ConfigError;

static RE_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").unwrap());

/// Replaces every placeholder that has a value. Unknown placeholders are
/// left verbatim.
pub fn bind(template: &str, values: &BTreeMap<String, String>) -> String {
    RE_PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| match values.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Distinct placeholder names in order of first appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    RE_PLACEHOLDER
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// Fails with every placeholder of `template` that `values` does not bind.
pub fn validate_binding(
    template: &str,
    values: &BTreeMap<String, String>,
) -> Result<(), ConfigError> {
    let missing: Vec<String> = placeholders(template)
        .into_iter()
        .filter(|name| !values.contains_key(name))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::MissingBinding { names: missing })
    }
}

/// Rejects a value that a tool would parse as a flag. Quoting does not
/// help here since the shell strips the quotes before the tool sees it.
pub fn check_value(name: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim_start().starts_with('-') {
        return Err(ConfigError::OptionLikeValue {
            name: name.to_string(),
            value: value.to_string(),
        });
    }
    Ok(())
}
