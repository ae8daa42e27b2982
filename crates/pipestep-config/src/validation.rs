//! Declarative parameter constraints.

use pipestep_types::{Parameter, Validation};
use regex::Regex;
use serde_json::Value;

use crate::{ConfigError, Result};

/// Check one resolved value against the parameter's constraints.
pub fn validate(param: &Parameter, value: &Value) -> Result<()> {
    let Some(rules) = &param.validation else {
        return Ok(());
    };
    let fail = |message: String| ConfigError::Validation {
        param: param.name.clone(),
        message,
    };

    if let Some(measure) = measure(value) {
        let what = if value.is_i64() { "value" } else { "length" };
        if let Some(min) = rules.min.filter(|min| measure < *min) {
            return Err(fail(format!("{} {} is below the minimum {}", what, measure, min)));
        }
        if let Some(max) = rules.max.filter(|max| measure > *max) {
            return Err(fail(format!("{} {} exceeds the maximum {}", what, measure, max)));
        }
    }

    for text in texts(value) {
        check_text(rules, text).map_err(fail)?;
    }
    Ok(())
}

fn check_text(rules: &Validation, text: &str) -> std::result::Result<(), String> {
    if !rules.possible_values.is_empty() && !rules.possible_values.iter().any(|v| v == text) {
        return Err(format!(
            "'{}' is not one of [{}]",
            text,
            rules.possible_values.join(", ")
        ));
    }
    if let Some(pattern) = &rules.pattern {
        // Metadata load already rejects patterns that do not compile.
        let re = Regex::new(pattern).map_err(|e| format!("invalid pattern: {}", e))?;
        if !re.is_match(text) {
            return Err(format!("'{}' does not match '{}'", text, pattern));
        }
    }
    Ok(())
}

fn measure(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => Some(s.chars().count() as i64),
        Value::Array(items) => Some(items.len() as i64),
        _ => None,
    }
}

fn texts(value: &Value) -> Vec<&str> {
    match value {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}
