//! Layered parameter resolution.
//!
//! Layers, lowest precedence first. A later layer overwrites earlier ones:
//!
//! | Layer                 | Source                                        |
//! |-----------------------|-----------------------------------------------|
//! | `Default`             | metadata defaults                             |
//! | `DefaultsFile`        | `--default-config` documents, in order        |
//! | `PipelineEnvironment` | values persisted by earlier steps             |
//! | `Environment`         | `<PREFIX>_<parameterName>` variables          |
//! | `General`             | `general` section of the project file         |
//! | `Stage`               | `stages.<stage>` section                      |
//! | `Step`                | `steps.<step>` section                        |
//! | `Flag`                | command-line flags                            |
//! | `Secret`              | secret provider, for parameters with references |
//!
//! Aliases are rewritten to canonical names within each layer before the
//! layer is applied. Keys that name no parameter are kept as extras; they
//! feed remote store path templates and framework switches such as
//! `collectTelemetryData`.

use std::collections::BTreeMap;
use std::sync::Arc;

use pipestep_report::PipelineEnvironment;
use pipestep_types::{Parameter, ResourceKind, Scope, StepMetadata};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::coerce::{coerce, is_empty};
use crate::secrets::{SecretProvider, SecretSource};
use crate::types::Section;
use crate::validation::validate;
use crate::{ConfigError, DEFAULT_PREFIX, EnvSnapshot, LoadedConfig, ProjectConfig, Result};

/// Extra key holding the telemetry opt-out.
pub const COLLECT_TELEMETRY_KEY: &str = "collectTelemetryData";
/// Extra key keeping textual values over remote store ones.
pub const DISABLE_OVERWRITE_KEY: &str = "vaultDisableOverwrite";

/// Where a resolved value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Layer {
    Default,
    DefaultsFile,
    PipelineEnvironment,
    Environment,
    General,
    Stage,
    Step,
    Flag,
    Secret,
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Layer::Default => "metadata default",
            Layer::DefaultsFile => "default configuration",
            Layer::PipelineEnvironment => "pipeline environment",
            Layer::Environment => "environment",
            Layer::General => "general section",
            Layer::Stage => "stage section",
            Layer::Step => "step section",
            Layer::Flag => "command line",
            Layer::Secret => "secret",
        };
        write!(f, "{}", name)
    }
}

/// Collects resolution inputs for one step.
///
/// # Example
///
/// ```no_run
/// # async fn example(metadata: &pipestep_types::StepMetadata, provider: &pipestep_config::SecretProvider)
/// # -> pipestep_config::Result<()> {
/// use pipestep_config::{ConfigBuilder, EnvSnapshot};
///
/// let config = ConfigBuilder::new(metadata)
///     .env(EnvSnapshot::from_process())
///     .stage(Some("Build".to_string()))
///     .flag("name", "team")
///     .resolve(provider)
///     .await?;
/// let name = config.get_str("name");
/// # Ok(())
/// # }
/// ```
pub struct ConfigBuilder<'a> {
    metadata: &'a StepMetadata,
    prefix: String,
    env: EnvSnapshot,
    loaded: LoadedConfig,
    stage: Option<String>,
    flags: Section,
    pipeline_env: Option<PipelineEnvironment>,
}

impl<'a> ConfigBuilder<'a> {
    pub fn new(metadata: &'a StepMetadata) -> Self {
        Self {
            metadata,
            prefix: DEFAULT_PREFIX.to_string(),
            env: EnvSnapshot::new(),
            loaded: LoadedConfig::default(),
            stage: None,
            flags: Section::new(),
            pipeline_env: None,
        }
    }

    /// Prefix of per-parameter environment variables.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn env(mut self, env: EnvSnapshot) -> Self {
        self.env = env;
        self
    }

    pub fn loaded(mut self, loaded: LoadedConfig) -> Self {
        self.loaded = loaded;
        self
    }

    pub fn project(mut self, project: ProjectConfig) -> Self {
        self.loaded.project = project;
        self
    }

    pub fn defaults(mut self, defaults: Vec<ProjectConfig>) -> Self {
        self.loaded.defaults = defaults;
        self
    }

    pub fn stage(mut self, stage: Option<String>) -> Self {
        self.stage = stage;
        self
    }

    /// Flag values as given on the command line, keyed by parameter or alias name.
    pub fn flags(mut self, flags: Section) -> Self {
        self.flags = flags;
        self
    }

    pub fn flag(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.flags.insert(name.into(), value.into());
        self
    }

    pub fn pipeline_environment(mut self, env: PipelineEnvironment) -> Self {
        self.pipeline_env = Some(env);
        self
    }

    /// Merge every layer, inject secrets, validate and freeze.
    pub async fn resolve(self, secrets: &SecretProvider) -> Result<ResolvedConfig> {
        let mut merge = self.merge_textual()?;
        self.apply_secrets(&mut merge, secrets).await?;
        self.register_secret_params(&merge, secrets);
        self.check(&merge)?;

        tracing::debug!(
            step = %self.metadata.name,
            parameters = merge.values.len(),
            "Configuration resolved"
        );
        Ok(ResolvedConfig {
            inner: Arc::new(Inner {
                step: self.metadata.name.clone(),
                values: merge.values,
                sources: merge.sources,
                extras: merge.extras,
                secret_sources: merge.secret_sources,
            }),
        })
    }

    /// Layers 1 through 8.
    fn merge_textual(&self) -> Result<Merge> {
        let mut merge = Merge::default();

        for param in &self.metadata.parameters {
            if let Some(default) = param.default.clone().filter(|v| !v.is_null()) {
                merge.set(param, default, Layer::Default)?;
            }
        }

        for doc in &self.loaded.defaults {
            self.apply_document(&mut merge, doc, [Layer::DefaultsFile; 3])?;
        }

        if let Some(env) = &self.pipeline_env {
            self.apply_pipeline_environment(&mut merge, env)?;
        }

        for param in &self.metadata.parameters {
            if let Some(value) = self.env_value(param) {
                merge.set(param, Value::String(value.to_string()), Layer::Environment)?;
            }
        }

        self.apply_document(
            &mut merge,
            &self.loaded.project,
            [Layer::General, Layer::Stage, Layer::Step],
        )?;

        let (flags, _) = flatten(self.metadata, &self.flags, Scope::Parameters);
        merge.apply(self.metadata, flags, Layer::Flag)?;

        Ok(merge)
    }

    /// `<prefix>_<name>` for the parameter, else for its first set alias.
    fn env_value(&self, param: &Parameter) -> Option<&str> {
        let canonical = self.env.prefixed(&self.prefix, &param.name);
        let aliased = param
            .aliases
            .iter()
            .filter(|a| !a.name.contains('/'))
            .find_map(|a| self.env.prefixed(&self.prefix, &a.name).map(|v| (a, v)));

        match (canonical, aliased) {
            (Some(value), Some((alias, _))) => {
                tracing::warn!(
                    param = %param.name,
                    alias = %alias.name,
                    "Both parameter and alias are set in the environment; using the parameter"
                );
                Some(value)
            }
            (Some(value), None) => Some(value),
            (None, Some((_, value))) => Some(value),
            (None, None) => None,
        }
    }

    fn apply_document(&self, merge: &mut Merge, doc: &ProjectConfig, layers: [Layer; 3]) -> Result<()> {
        let [general_layer, stage_layer, step_layer] = layers;

        let (values, extras) = flatten(self.metadata, &doc.general, Scope::General);
        merge.apply(self.metadata, values, general_layer)?;
        merge.extras.extend(extras);

        if let Some(section) = self.stage.as_deref().and_then(|s| doc.stage(s)) {
            let (values, extras) = flatten(self.metadata, section, Scope::Stages);
            merge.apply(self.metadata, values, stage_layer)?;
            merge.extras.extend(extras);
        }

        if let Some(section) = self.step_section(doc) {
            let (values, extras) = flatten(self.metadata, section, Scope::Steps);
            merge.apply(self.metadata, values, step_layer)?;
            merge.extras.extend(extras);
        }
        Ok(())
    }

    /// The step's section, also found under a step alias.
    fn step_section<'d>(&self, doc: &'d ProjectConfig) -> Option<&'d Section> {
        if let Some(section) = doc.step(&self.metadata.name) {
            return Some(section);
        }
        self.metadata.aliases.iter().find_map(|alias| {
            let section = doc.step(&alias.name)?;
            if alias.deprecated {
                tracing::warn!(
                    alias = %alias.name,
                    step = %self.metadata.name,
                    "Configuration uses deprecated step name"
                );
            }
            Some(section)
        })
    }

    fn apply_pipeline_environment(&self, merge: &mut Merge, env: &PipelineEnvironment) -> Result<()> {
        for param in &self.metadata.parameters {
            let reference = param
                .resource_refs
                .iter()
                .find(|r| r.kind == ResourceKind::PipelineEnvironment);
            let Some(reference) = reference else {
                continue;
            };
            let key = if reference.param.is_empty() {
                &reference.name
            } else {
                &reference.param
            };
            if let Some(value) = env.read_key(key, param.param_type)? {
                merge.set(param, value, Layer::PipelineEnvironment)?;
            }
        }
        Ok(())
    }

    /// Layer 9.
    async fn apply_secrets(&self, merge: &mut Merge, secrets: &SecretProvider) -> Result<()> {
        let disable_overwrite = merge
            .extras
            .get(DISABLE_OVERWRITE_KEY)
            .is_some_and(is_true);

        for param in self.metadata.parameters.iter().filter(|p| p.has_secret_refs()) {
            let textual = merge
                .values
                .get(&param.name)
                .filter(|v| !is_empty(v))
                .is_some_and(|_| merge.sources.get(&param.name) != Some(&Layer::Default));
            if disable_overwrite && textual {
                tracing::debug!(param = %param.name, "Keeping textual value over secret");
                continue;
            }

            let mut lookup = merge.extras.clone();
            lookup.extend(merge.values.clone());
            if let Some(secret) = secrets.resolve(param, &lookup).await? {
                merge.set(param, Value::String(secret.value), Layer::Secret)?;
                merge.secret_sources.insert(param.name.clone(), secret.source);
            }
        }
        Ok(())
    }

    /// Parameters flagged secret are masked however they were supplied.
    fn register_secret_params(&self, merge: &Merge, secrets: &SecretProvider) {
        for param in self.metadata.parameters.iter().filter(|p| p.secret) {
            match merge.values.get(&param.name) {
                Some(Value::String(s)) => secrets.mask().register(s),
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .for_each(|s| secrets.mask().register(s)),
                _ => {}
            }
        }
    }

    /// Mandatory parameters and declarative constraints.
    fn check(&self, merge: &Merge) -> Result<()> {
        for param in &self.metadata.parameters {
            let value = merge.values.get(&param.name).filter(|v| !is_empty(v));
            match value {
                None if param.mandatory && param.has_secret_refs() => {
                    return Err(ConfigError::MissingSecret(param.name.clone()));
                }
                None if param.mandatory => {
                    return Err(ConfigError::MissingParameter(param.name.clone()));
                }
                None => {}
                Some(value) => validate(param, value)?,
            }
        }
        Ok(())
    }
}

/// Working state of a resolution.
#[derive(Debug, Default)]
struct Merge {
    values: Section,
    sources: BTreeMap<String, Layer>,
    extras: Section,
    secret_sources: BTreeMap<String, SecretSource>,
}

impl Merge {
    fn set(&mut self, param: &Parameter, value: Value, layer: Layer) -> Result<()> {
        let value = coerce(param, value)?;
        self.values.insert(param.name.clone(), value);
        self.sources.insert(param.name.clone(), layer);
        Ok(())
    }

    fn apply(&mut self, metadata: &StepMetadata, values: Section, layer: Layer) -> Result<()> {
        for (name, value) in values {
            if let Some(param) = metadata.parameter(&name) {
                self.set(param, value, layer)?;
            }
        }
        Ok(())
    }
}

/// Rewrite aliases to canonical names for parameters in `scope`.
///
/// Returns the canonical values and the keys that belong to no parameter.
fn flatten(metadata: &StepMetadata, section: &Section, scope: Scope) -> (Section, Section) {
    let mut values = Section::new();

    for param in &metadata.parameters {
        let canonical = section.get(&param.name).filter(|v| !v.is_null());
        let aliased = param.aliases.iter().find_map(|alias| {
            lookup_path(section, &alias.name)
                .filter(|v| !v.is_null())
                .map(|v| (alias, v))
        });

        let value = match (canonical, aliased) {
            (Some(value), Some((alias, _))) => {
                tracing::warn!(
                    param = %param.name,
                    alias = %alias.name,
                    "Both parameter and alias are set; using the parameter"
                );
                value
            }
            (Some(value), None) => value,
            (None, Some((alias, value))) => {
                if alias.deprecated {
                    tracing::warn!(
                        alias = %alias.name,
                        param = %param.name,
                        "Deprecated parameter name used; rename it to the parameter"
                    );
                }
                value
            }
            (None, None) => continue,
        };

        if param.in_scope(scope) {
            values.insert(param.name.clone(), value.clone());
        } else {
            tracing::debug!(param = %param.name, scope = ?scope, "Ignoring parameter outside its scopes");
        }
    }

    let extras = section
        .iter()
        .filter(|(key, _)| !is_parameter_key(metadata, key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    (values, extras)
}

fn is_parameter_key(metadata: &StepMetadata, key: &str) -> bool {
    metadata.parameters.iter().any(|p| {
        p.name == key
            || p.aliases
                .iter()
                .any(|a| a.name == key || a.name.split('/').next() == Some(key))
    })
}

/// Follow a `/`-separated path through nested maps.
fn lookup_path<'s>(section: &'s Section, path: &str) -> Option<&'s Value> {
    let mut parts = path.split('/');
    let mut current = section.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn is_true(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true") || s == "1",
        _ => false,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Frozen configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Inner {
    step: String,
    values: Section,
    sources: BTreeMap<String, Layer>,
    extras: Section,
    secret_sources: BTreeMap<String, SecretSource>,
}

/// Immutable result of resolution, shared by reference.
#[derive(Clone, Default)]
pub struct ResolvedConfig {
    inner: Arc<Inner>,
}

impl ResolvedConfig {
    /// Freeze an explicit set of values, every one attributed to `Flag`.
    pub fn from_values(step: impl Into<String>, values: Map<String, Value>) -> Self {
        let sources = values.keys().map(|k| (k.clone(), Layer::Flag)).collect();
        Self {
            inner: Arc::new(Inner {
                step: step.into(),
                values,
                sources,
                ..Default::default()
            }),
        }
    }

    pub fn step(&self) -> &str {
        &self.inner.step
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.inner.values.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.inner.values
    }

    /// Layer that supplied the final value of `name`.
    pub fn source(&self, name: &str) -> Option<Layer> {
        self.inner.sources.get(name).copied()
    }

    pub fn secret_source(&self, name: &str) -> Option<&SecretSource> {
        self.inner.secret_sources.get(name)
    }

    /// Configuration keys that are not parameters of the step.
    pub fn extra(&self, key: &str) -> Option<&Value> {
        self.inner.extras.get(key)
    }

    /// `false` only when `collectTelemetryData` is explicitly disabled.
    pub fn telemetry_enabled(&self) -> bool {
        match self.extra(COLLECT_TELEMETRY_KEY) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => !s.eq_ignore_ascii_case("false"),
            _ => true,
        }
    }

    /// Deserialize the values into the step's typed record.
    pub fn typed<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.inner.values.clone()))
            .map_err(|e| ConfigError::Typed(e.to_string()))
    }
}

impl std::fmt::Debug for ResolvedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedConfig")
            .field("step", &self.inner.step)
            .field("sources", &self.inner.sources)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipestep_log::SecretMask;
    use serde_json::json;

    use crate::secrets::StaticCredentialStore;

    const META: &str = r#"
name: cloudFoundryDeploy
aliases:
  - name: cfDeploy
    deprecated: true
parameters:
  - name: apiEndpoint
    type: string
    aliases:
      - name: cloudFoundry/apiEndpoint
      - name: cfApiEndpoint
        deprecated: true
  - name: retries
    type: int
    default: 3
  - name: verbose
    type: bool
    scopes: [PARAMETERS]
  - name: tags
    type: "[]string"
"#;

    fn metadata() -> StepMetadata {
        StepMetadata::from_yaml(META).unwrap()
    }

    fn provider() -> SecretProvider {
        SecretProvider::new(Arc::new(StaticCredentialStore::new()), EnvSnapshot::new(), SecretMask::new())
    }

    #[tokio::test]
    async fn test_deep_alias_from_config() {
        let metadata = metadata();
        let project = ProjectConfig::from_yaml(
            "general:\n  cloudFoundry:\n    apiEndpoint: https://api.cf\n    org: team\n",
        )
        .unwrap();
        let config = ConfigBuilder::new(&metadata)
            .project(project)
            .resolve(&provider())
            .await
            .unwrap();
        assert_eq!(config.get_str("apiEndpoint"), Some("https://api.cf"));
        assert_eq!(config.source("apiEndpoint"), Some(Layer::General));
        assert_eq!(config.get_i64("retries"), Some(3));
        assert_eq!(config.source("retries"), Some(Layer::Default));
    }

    #[tokio::test]
    async fn test_canonical_wins_over_alias_in_same_layer() {
        let metadata = metadata();
        let project = ProjectConfig::from_yaml(
            "steps:\n  cloudFoundryDeploy:\n    apiEndpoint: canonical\n    cfApiEndpoint: alias\n",
        )
        .unwrap();
        let config = ConfigBuilder::new(&metadata)
            .project(project)
            .resolve(&provider())
            .await
            .unwrap();
        assert_eq!(config.get_str("apiEndpoint"), Some("canonical"));
    }

    #[tokio::test]
    async fn test_step_alias_section() {
        let metadata = metadata();
        let project = ProjectConfig::from_yaml("steps:\n  cfDeploy:\n    retries: 9\n").unwrap();
        let config = ConfigBuilder::new(&metadata)
            .project(project)
            .resolve(&provider())
            .await
            .unwrap();
        assert_eq!(config.get_i64("retries"), Some(9));
        assert_eq!(config.source("retries"), Some(Layer::Step));
    }

    #[tokio::test]
    async fn test_scope_restricts_config_sections() {
        let metadata = metadata();
        let project = ProjectConfig::from_yaml("general:\n  verbose: true\n").unwrap();
        let config = ConfigBuilder::new(&metadata)
            .project(project.clone())
            .resolve(&provider())
            .await
            .unwrap();
        assert_eq!(config.get("verbose"), None);

        let config = ConfigBuilder::new(&metadata)
            .project(project)
            .flag("verbose", "true")
            .resolve(&provider())
            .await
            .unwrap();
        assert_eq!(config.get_bool("verbose"), Some(true));
    }

    #[tokio::test]
    async fn test_env_alias_and_coercion() {
        let metadata = metadata();
        let env = EnvSnapshot::new()
            .with("PFX_cfApiEndpoint", "https://env")
            .with("PFX_tags", "a,b");
        let config = ConfigBuilder::new(&metadata)
            .prefix("PFX")
            .env(env)
            .resolve(&provider())
            .await
            .unwrap();
        assert_eq!(config.get_str("apiEndpoint"), Some("https://env"));
        assert_eq!(config.get("tags"), Some(&json!(["a", "b"])));
        assert_eq!(config.source("tags"), Some(Layer::Environment));
    }

    #[tokio::test]
    async fn test_env_canonical_wins_over_alias_with_warning() {
        let buffer = pipestep_log::SharedBuffer::new();
        let log = pipestep_log::LogSink::with_writer(buffer.clone());
        let _guard = log.set_default();

        let metadata = metadata();
        let env = EnvSnapshot::new()
            .with("PFX_apiEndpoint", "https://canonical")
            .with("PFX_cfApiEndpoint", "https://alias");
        let config = ConfigBuilder::new(&metadata)
            .prefix("PFX")
            .env(env)
            .resolve(&provider())
            .await
            .unwrap();

        assert_eq!(config.get_str("apiEndpoint"), Some("https://canonical"));
        let out = buffer.contents();
        assert!(out.contains("Both parameter and alias are set in the environment"), "{}", out);
        assert!(out.contains("alias=cfApiEndpoint"), "{}", out);
    }

    #[tokio::test]
    async fn test_malformed_value_is_configuration_error() {
        let metadata = metadata();
        let err = ConfigBuilder::new(&metadata)
            .flag("retries", "many")
            .resolve(&provider())
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert_eq!(err.category(), pipestep_types::ErrorCategory::Configuration);
    }

    #[tokio::test]
    async fn test_extras_and_telemetry_switch() {
        let metadata = metadata();
        let project = ProjectConfig::from_yaml(
            "general:\n  collectTelemetryData: false\n  vaultBasePath: team\n",
        )
        .unwrap();
        let config = ConfigBuilder::new(&metadata)
            .project(project)
            .resolve(&provider())
            .await
            .unwrap();
        assert!(!config.telemetry_enabled());
        assert_eq!(config.extra("vaultBasePath"), Some(&json!("team")));
        assert_eq!(config.get("vaultBasePath"), None);
    }

    #[test]
    fn test_typed_record() {
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Options {
            api_endpoint: String,
            #[serde(default)]
            retries: i64,
        }
        let config = ResolvedConfig::from_values(
            "s",
            json!({"apiEndpoint": "x", "retries": 2}).as_object().unwrap().clone(),
        );
        let options: Options = config.typed().unwrap();
        assert_eq!(options.api_endpoint, "x");
        assert_eq!(options.retries, 2);

        let config = ResolvedConfig::from_values("s", Map::new());
        assert!(matches!(config.typed::<Options>(), Err(ConfigError::Typed(_))));
    }
}
