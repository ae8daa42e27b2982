//! The on-disk pipeline environment.

use std::path::{Component, Path, PathBuf};

use pipestep_types::ParamType;
use serde_json::Value;

use crate::{ReportError, Result};

/// Key/value tree rooted at the environment root.
///
/// Values are stored as UTF-8 text, one file per `<category>/<name>` key:
/// strings and other scalars as-is, string sequences newline-delimited
/// (JSON when an item is empty or multi-line), maps as JSON. Absent files read as unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineEnvironment {
    root: PathBuf,
}

impl PipelineEnvironment {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File backing `<category>/<name>`.
    pub fn path_for(&self, category: &str, name: &str) -> Result<PathBuf> {
        let key = key(category, name);
        if name.is_empty() || !is_relative_and_contained(Path::new(&key)) {
            return Err(ReportError::InvalidKey(key));
        }
        Ok(self.root.join(key))
    }

    /// Write a value; parent directories are created as needed.
    pub fn write(&self, category: &str, name: &str, value: &Value) -> Result<()> {
        let path = self.path_for(category, name)?;
        let text = encode(value)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ReportError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(&path, text).map_err(|source| ReportError::Write { path, source })
    }

    /// Raw text of a key, `None` when the file does not exist.
    pub fn read_raw(&self, category: &str, name: &str) -> Result<Option<String>> {
        let path = self.path_for(category, name)?;
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ReportError::Read { path, source }),
        }
    }

    /// Read and decode a key as `param_type`.
    pub fn read(&self, category: &str, name: &str, param_type: ParamType) -> Result<Option<Value>> {
        let Some(text) = self.read_raw(category, name)? else {
            return Ok(None);
        };
        decode(&text, param_type)
            .map(Some)
            .map_err(|message| ReportError::Decode {
                key: key(category, name),
                expected: param_type.to_string(),
                message,
            })
    }

    /// Read a `<category>/<name>` path as written in resource references.
    pub fn read_key(&self, key: &str, param_type: ParamType) -> Result<Option<Value>> {
        match key.rsplit_once('/') {
            Some((category, name)) => self.read(category, name, param_type),
            None => self.read("", key, param_type),
        }
    }

    /// Whether anything has been written below the root.
    pub fn is_empty(&self) -> bool {
        std::fs::read_dir(&self.root)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }
}

fn key(category: &str, name: &str) -> String {
    if category.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", category, name)
    }
}

fn is_relative_and_contained(path: &Path) -> bool {
    path.components().all(|c| matches!(c, Component::Normal(_)))
}

/// Textual encoding of a value.
pub fn encode(value: &Value) -> Result<String> {
    Ok(match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        Value::Array(items) if is_line_list(items) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Array(_) | Value::Object(_) => serde_json::to_string(value)?,
    })
}

/// A string list is stored one item per line unless an item is empty,
/// spans lines, or the first one could be read back as a JSON array.
fn is_line_list(items: &[Value]) -> bool {
    let lines_ok = items
        .iter()
        .all(|item| item.as_str().is_some_and(|s| !s.is_empty() && !s.contains(['\n', '\r'])));
    let first_ok = items
        .first()
        .and_then(Value::as_str)
        .is_none_or(|s| !s.starts_with('['));
    lines_ok && first_ok
}

fn decode(text: &str, param_type: ParamType) -> std::result::Result<Value, String> {
    match param_type {
        ParamType::String => Ok(Value::String(text.to_string())),
        ParamType::Int => text
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|e| e.to_string()),
        ParamType::Bool => match text.trim() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            other => Err(format!("'{}' is not a boolean", other)),
        },
        ParamType::StringList if text.starts_with('[') => {
            let items: Vec<String> = serde_json::from_str(text).map_err(|e| e.to_string())?;
            Ok(Value::from(items))
        }
        ParamType::StringList => Ok(Value::Array(
            text.lines()
                .filter(|l| !l.is_empty())
                .map(|l| Value::String(l.to_string()))
                .collect(),
        )),
        ParamType::Map => {
            if text.trim().is_empty() {
                return Ok(Value::Object(Default::default()));
            }
            let value: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
            if value.is_object() {
                Ok(value)
            } else {
                Err("not a JSON object".to_string())
            }
        }
    }
}
