//! Coercion of raw layer values into declared parameter types.

use pipestep_types::{ParamType, Parameter};
use serde_json::{Map, Value};

use crate::{ConfigError, Result};

/// Convert `value` to the type declared by `param`.
///
/// Text from the environment and flags is parsed: booleans from
/// `true|false|1|0`, integers from decimal, lists from comma-separated text,
/// maps from `key=value` pairs. Values that already have the right shape pass
/// through.
pub fn coerce(param: &Parameter, value: Value) -> Result<Value> {
    let invalid = |value: &Value| ConfigError::InvalidValue {
        param: param.name.clone(),
        expected: param.param_type.to_string(),
        value: display(value),
    };

    match (param.param_type, value) {
        (ParamType::String, Value::String(s)) => Ok(Value::String(s)),
        (ParamType::String, v @ (Value::Number(_) | Value::Bool(_))) => Ok(Value::String(v.to_string())),

        (ParamType::Bool, Value::Bool(b)) => Ok(Value::Bool(b)),
        (ParamType::Bool, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(Value::Bool(true)),
            "false" | "0" => Ok(Value::Bool(false)),
            _ => Err(invalid(&Value::String(s))),
        },
        (ParamType::Bool, Value::Number(n)) if n.as_i64() == Some(0) || n.as_i64() == Some(1) => {
            Ok(Value::Bool(n.as_i64() == Some(1)))
        }

        (ParamType::Int, Value::Number(n)) if n.is_i64() => Ok(Value::Number(n)),
        (ParamType::Int, Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| invalid(&Value::String(s))),

        (ParamType::StringList, Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(Value::String(s)),
                v @ (Value::Number(_) | Value::Bool(_)) => Ok(Value::String(v.to_string())),
                other => Err(invalid(&other)),
            })
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        (ParamType::StringList, Value::String(s)) => Ok(Value::Array(
            s.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(|item| Value::String(item.to_string()))
                .collect(),
        )),

        (ParamType::Map, Value::Object(map)) => Ok(Value::Object(map)),
        (ParamType::Map, Value::String(s)) => parse_pairs(&s)
            .map(Value::Object)
            .ok_or_else(|| invalid(&Value::String(s))),

        (_, other) => Err(invalid(&other)),
    }
}

fn parse_pairs(text: &str) -> Option<Map<String, Value>> {
    let mut map = Map::new();
    for pair in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=')?;
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        map.insert(key.to_string(), Value::String(value.trim().to_string()));
    }
    Some(map)
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Whether a value counts as unset for mandatory checks.
pub fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}
