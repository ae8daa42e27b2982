//! Built-in steps.

use std::fmt::Write;

use anyhow::Result;
use pipestep_lifecycle::{StepEntry, StepRegistry};
use serde_json::Value;

mod demo;
mod github_issue;
mod shell_execute;

/// Registry holding every built-in step.
pub fn registry() -> Result<StepRegistry> {
    let mut registry = StepRegistry::new();
    registry.register(demo::entry()?)?;
    registry.register(shell_execute::entry()?)?;
    registry.register(github_issue::entry()?)?;
    Ok(registry)
}

/// Root usage text listing the registered steps.
pub fn usage(registry: &StepRegistry) -> String {
    let mut out = String::from("Usage: pipestep [OPTIONS] <STEP> [--<param> <value>...]\n\nSteps:\n");
    let width = registry.names().iter().map(|n| n.len()).max().unwrap_or(0);
    for entry in registry.entries() {
        let _ = writeln!(
            out,
            "  {:<width$}  {}",
            entry.name(),
            entry.metadata.description,
            width = width
        );
    }
    out.push_str("\nRun 'pipestep <STEP> --help' for the flags of a step.");
    out
}

/// Flags of one step.
pub fn step_usage(entry: &StepEntry) -> String {
    let metadata = &entry.metadata;
    let mut out = format!("Usage: pipestep [OPTIONS] {} [FLAGS]\n", metadata.name);
    if !metadata.description.is_empty() {
        let _ = writeln!(out, "\n{}", metadata.description);
    }
    out.push_str("\nFlags:\n");
    for param in &metadata.parameters {
        let _ = write!(out, "  --{} <{}>", param.name, param.param_type);
        if !param.description.is_empty() {
            let _ = write!(out, "  {}", param.description);
        }
        match &param.default {
            Some(Value::String(s)) if !s.is_empty() => {
                let _ = write!(out, " [default: {}]", s);
            }
            Some(Value::String(_)) | None => {}
            Some(other) => {
                let _ = write!(out, " [default: {}]", other);
            }
        }
        if param.mandatory {
            out.push_str(" [mandatory]");
        }
        out.push('\n');
    }
    out.push_str("\nA value starting with '--' must be given as --<param>=<value>.\n");
    out
}
