//! Step metadata: the declarative description of a step.
//!
//! Metadata is written as YAML next to each step and embedded into the binary.
//! It drives configuration resolution (parameters, aliases, scopes, resource
//! references), secret handling and output permissions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use crate::{ErrorCategory, MetadataError};

/// Immutable description of a single step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepMetadata {
    /// Stable identifier used for routing, logging and config lookup.
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Deprecated alternate names for the step.
    #[serde(default)]
    pub aliases: Vec<Alias>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub secrets: Vec<SecretDecl>,
    /// Companion containers; consumed by the outer pipeline only.
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default)]
    pub outputs: Outputs,
    /// Known failure signatures in step output.
    #[serde(default)]
    pub errors: Vec<ErrorPattern>,
}

impl StepMetadata {
    /// Parse and check metadata from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, MetadataError> {
        let metadata: StepMetadata = serde_yaml::from_str(yaml)?;
        metadata.validate()?;
        Ok(metadata)
    }

    /// Check the metadata invariants.
    pub fn validate(&self) -> Result<(), MetadataError> {
        let mut seen = HashSet::new();
        let secrets: HashSet<&str> = self.secrets.iter().map(|s| s.name.as_str()).collect();

        for param in &self.parameters {
            if !seen.insert(param.name.as_str()) {
                return Err(MetadataError::DuplicateParameter {
                    step: self.name.clone(),
                    param: param.name.clone(),
                });
            }

            for reference in &param.resource_refs {
                if reference.kind.needs_secret_decl() && !secrets.contains(reference.name.as_str()) {
                    return Err(MetadataError::UnknownSecret {
                        step: self.name.clone(),
                        param: param.name.clone(),
                        secret: reference.name.clone(),
                    });
                }
            }

            if let Some(default) = &param.default
                && !param.param_type.accepts(default)
            {
                return Err(MetadataError::DefaultType {
                    step: self.name.clone(),
                    param: param.name.clone(),
                    expected: param.param_type.to_string(),
                });
            }

            if let Some(pattern) = param.validation.as_ref().and_then(|v| v.pattern.as_deref())
                && let Err(e) = regex::Regex::new(pattern)
            {
                return Err(MetadataError::InvalidPattern {
                    step: self.name.clone(),
                    param: param.name.clone(),
                    message: e.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Look up a parameter by canonical name.
    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Whether the step may write `<category>/<name>` to the pipeline environment.
    pub fn permits_env_output(&self, category: &str, name: &str) -> bool {
        self.outputs.environment.iter().any(|o| o.matches(category, name))
    }

    /// Whether the step may record the given influx measurement.
    pub fn permits_measurement(&self, measurement: &str) -> bool {
        self.outputs.influx.iter().any(|m| m == measurement)
    }
}

/// An alternate name for a step or parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alias {
    pub name: String,
    #[serde(default)]
    pub deprecated: bool,
}

/// Configuration file section a parameter may appear in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Scope {
    General,
    Stages,
    Steps,
    Parameters,
}

impl Scope {
    pub fn all() -> Vec<Scope> {
        vec![Scope::General, Scope::Stages, Scope::Steps, Scope::Parameters]
    }
}

/// Declared type of a parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamType {
    #[serde(rename = "string")]
    String,
    #[serde(rename = "int")]
    Int,
    #[serde(rename = "bool")]
    Bool,
    #[serde(rename = "[]string", alias = "stringList")]
    StringList,
    #[serde(rename = "map")]
    Map,
}

impl ParamType {
    /// Whether a JSON value already has this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Int => value.is_i64() || value.is_u64(),
            ParamType::Bool => value.is_boolean(),
            ParamType::StringList => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
            ParamType::Map => value.is_object(),
        }
    }
}

impl std::fmt::Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamType::String => write!(f, "string"),
            ParamType::Int => write!(f, "int"),
            ParamType::Bool => write!(f, "bool"),
            ParamType::StringList => write!(f, "[]string"),
            ParamType::Map => write!(f, "map"),
        }
    }
}

/// A single step parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub mandatory: bool,
    /// Resolved values are masked in logs even when supplied textually.
    #[serde(default)]
    pub secret: bool,
    #[serde(default)]
    pub aliases: Vec<Alias>,
    #[serde(default = "Scope::all")]
    pub scopes: Vec<Scope>,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default, rename = "resourceRef")]
    pub resource_refs: Vec<ResourceRef>,
    #[serde(default)]
    pub validation: Option<Validation>,
}

impl Parameter {
    pub fn in_scope(&self, scope: Scope) -> bool {
        self.scopes.contains(&scope)
    }

    /// Whether any reference is resolved by the secret provider.
    pub fn has_secret_refs(&self) -> bool {
        self.resource_refs.iter().any(|r| r.kind.is_secret())
    }
}

/// Where a resource reference sources its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    /// A credential held by the pipeline runner.
    PipelineCredential,
    /// A value in the remote key/value store.
    RemoteStore,
    /// A remote store value materialized into a file; the parameter gets the path.
    RemoteStoreFile,
    /// A process environment variable.
    Environment,
    /// The reference's embedded default.
    Literal,
    /// A value persisted by an earlier step.
    PipelineEnvironment,
}

impl ResourceKind {
    /// Resolved by the secret provider (as opposed to the textual layers).
    pub fn is_secret(&self) -> bool {
        !matches!(self, ResourceKind::PipelineEnvironment)
    }

    fn needs_secret_decl(&self) -> bool {
        matches!(
            self,
            ResourceKind::PipelineCredential
                | ResourceKind::RemoteStore
                | ResourceKind::RemoteStoreFile
        )
    }
}

/// Declarative pointer to where a parameter value may come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    #[serde(rename = "type")]
    pub kind: ResourceKind,
    /// Secret declaration name, env var name, depending on kind.
    #[serde(default)]
    pub name: String,
    /// Sub-field: credential field, store key, or `<category>/<name>`.
    #[serde(default)]
    pub param: String,
    #[serde(default)]
    pub default: Option<String>,
    /// Remote store path templates, tried in order.
    #[serde(default)]
    pub paths: Vec<String>,
}

/// Provider kind of a declared secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecretKind {
    PipelineCredential,
    RemoteStore,
    File,
}

/// A named secret the step consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretDecl {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub kind: SecretKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub env: std::collections::BTreeMap<String, String>,
}

/// What the step is allowed to produce.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Outputs {
    #[serde(default)]
    pub environment: Vec<EnvOutput>,
    #[serde(default)]
    pub reports: Vec<ReportOutput>,
    #[serde(default)]
    pub influx: Vec<String>,
}

/// A permitted pipeline-environment key; `name: "*"` allows the whole category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvOutput {
    pub category: String,
    pub name: String,
}

impl EnvOutput {
    pub fn matches(&self, category: &str, name: &str) -> bool {
        self.category == category && (self.name == "*" || self.name == name)
    }
}

/// Report files the step produces, published by the report uploader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportOutput {
    pub file_pattern: String,
    /// Output resource type, e.g. `sbom`, `e2e`, `sast`.
    #[serde(rename = "type")]
    pub report_type: String,
    #[serde(default)]
    pub sub_folder: String,
}

/// Declarative constraints checked after resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Validation {
    /// Lower bound: numeric for ints, length for strings and lists.
    #[serde(default)]
    pub min: Option<i64>,
    #[serde(default)]
    pub max: Option<i64>,
    #[serde(default, rename = "enum")]
    pub possible_values: Vec<String>,
    #[serde(default)]
    pub pattern: Option<String>,
}

/// Known error signature in step output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub pattern: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub category: Option<ErrorCategory>,
}
