//! Step flags: the `--<param> <value>` pairs after the step name.

use anyhow::{Result, bail};
use pipestep_config::types::Section;
use pipestep_types::{ParamType, Parameter, StepMetadata};
use serde_json::Value;

/// Parse step flags into a flag layer.
///
/// Flags accept `--name value` and `--name=value`; a value starting with
/// `--` needs the second form. A bool flag without a
/// value is `true`. Repeating a list flag appends. Parameter aliases are
/// kept as given; the resolver rewrites them.
pub fn parse(args: &[String], metadata: &StepMetadata) -> Result<Section> {
    let mut flags = Section::new();
    let mut iter = args.iter().peekable();

    while let Some(arg) = iter.next() {
        let Some(flag) = arg.strip_prefix("--") else {
            bail!("unexpected argument '{}'", arg);
        };
        let (name, inline) = match flag.split_once('=') {
            Some((name, value)) => (name, Some(value.to_string())),
            None => (flag, None),
        };
        let Some(param) = lookup(metadata, name) else {
            bail!("unknown flag '--{}' for step '{}'", name, metadata.name);
        };

        let value = match inline {
            Some(value) => Value::String(value),
            None => match iter.next_if(|next| !next.starts_with("--")) {
                Some(value) => Value::String(value.clone()),
                None if param.param_type == ParamType::Bool => Value::Bool(true),
                None => bail!("flag '--{}' needs a value", name),
            },
        };

        if param.param_type == ParamType::StringList {
            let items = flags
                .entry(name.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(items) = items {
                items.push(value);
            }
        } else {
            flags.insert(name.to_string(), value);
        }
    }
    Ok(flags)
}

fn lookup<'a>(metadata: &'a StepMetadata, name: &str) -> Option<&'a Parameter> {
    metadata
        .parameters
        .iter()
        .find(|p| p.name == name || p.aliases.iter().any(|a| a.name == name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const META: &str = r#"
name: sample
parameters:
  - name: name
    type: string
    aliases:
      - name: who
  - name: dryRun
    type: bool
  - name: sources
    type: "[]string"
  - name: retries
    type: int
"#;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn parse_ok(items: &[&str]) -> Section {
        let metadata = StepMetadata::from_yaml(META).unwrap();
        parse(&args(items), &metadata).unwrap()
    }

    #[test]
    fn test_values_and_inline_values() {
        let flags = parse_ok(&["--name", "world", "--retries=3"]);
        assert_eq!(flags.get("name"), Some(&json!("world")));
        assert_eq!(flags.get("retries"), Some(&json!("3")));

        let flags = parse_ok(&["--name=--dashed"]);
        assert_eq!(flags.get("name"), Some(&json!("--dashed")));
    }

    #[test]
    fn test_bool_without_value() {
        let flags = parse_ok(&["--dryRun", "--name", "x"]);
        assert_eq!(flags.get("dryRun"), Some(&json!(true)));

        let flags = parse_ok(&["--dryRun", "false"]);
        assert_eq!(flags.get("dryRun"), Some(&json!("false")));
    }

    #[test]
    fn test_repeated_list_flag_appends() {
        let flags = parse_ok(&["--sources", "a.sh", "--sources=b.sh"]);
        assert_eq!(flags.get("sources"), Some(&json!(["a.sh", "b.sh"])));
    }

    #[test]
    fn test_alias_is_accepted_as_given() {
        let flags = parse_ok(&["--who", "me"]);
        assert_eq!(flags.get("who"), Some(&json!("me")));
    }

    #[test]
    fn test_rejects_bad_input() {
        let metadata = StepMetadata::from_yaml(META).unwrap();
        let err = parse(&args(&["--nope", "1"]), &metadata).unwrap_err();
        assert!(err.to_string().contains("unknown flag '--nope'"));

        let err = parse(&args(&["stray"]), &metadata).unwrap_err();
        assert!(err.to_string().contains("unexpected argument"));

        let err = parse(&args(&["--name"]), &metadata).unwrap_err();
        assert!(err.to_string().contains("needs a value"));
    }
}
