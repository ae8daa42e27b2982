//! Secret resolution for parameters with resource references.
//!
//! References are tried in declared order and the first non-empty value
//! wins:
//! 1. `pipeline-credential`: credential store of the pipeline runner
//! 2. `remote-store` / `remote-store-file`: remote key/value store
//! 3. `environment`: a named environment variable
//! 4. `literal`: the reference default
//!
//! Every resolved value is registered for masking before it is returned.
//! File paths are not secret and stay visible.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use pipestep_log::SecretMask;
use pipestep_types::{Parameter, ResourceKind, ResourceRef};
use serde_json::{Map, Value};
use tokio::sync::OnceCell;

use crate::vault::{RemoteStore, VaultClient, VaultSettings};
use crate::{ConfigError, EnvSnapshot, Result};

/// Result of secret resolution with provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSecret {
    /// The secret value, or a file path for file references.
    pub value: String,
    /// Where the secret was found.
    pub source: SecretSource,
}

/// Where a secret was resolved from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretSource {
    /// Pipeline credential id.
    PipelineCredential(String),
    /// Remote store path.
    RemoteStore(String),
    /// Remote store path, materialized into a file.
    RemoteStoreFile(String),
    /// Environment variable.
    EnvVar(String),
    /// Reference default.
    Literal,
}

impl std::fmt::Display for SecretSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecretSource::PipelineCredential(id) => write!(f, "pipeline credential {}", id),
            SecretSource::RemoteStore(path) => write!(f, "remote store {}", path),
            SecretSource::RemoteStoreFile(path) => write!(f, "remote store {} (file)", path),
            SecretSource::EnvVar(var) => write!(f, "env var {}", var),
            SecretSource::Literal => write!(f, "literal default"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline credentials
// ─────────────────────────────────────────────────────────────────────────────

/// Part of a pipeline credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CredentialField {
    Username,
    Password,
    Token,
    /// Path of a file credential.
    File,
}

impl CredentialField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Username => "username",
            Self::Password => "password",
            Self::Token => "token",
            Self::File => "file",
        }
    }
}

impl std::str::FromStr for CredentialField {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "username" | "user" => Ok(Self::Username),
            "password" | "" => Ok(Self::Password),
            "token" => Ok(Self::Token),
            "file" => Ok(Self::File),
            other => Err(ConfigError::Secret(format!("unknown credential field '{}'", other))),
        }
    }
}

/// Credentials handed to the step by the pipeline runner.
pub trait CredentialStore: Send + Sync {
    fn lookup(&self, id: &str, field: CredentialField) -> Option<String>;
}

/// Credentials injected as `<prefix>_CREDENTIAL_<ID>_<FIELD>` variables.
///
/// The id is upper-cased with `-` and `.` replaced by `_`.
#[derive(Debug, Clone)]
pub struct EnvCredentialStore {
    env: EnvSnapshot,
    prefix: String,
}

impl EnvCredentialStore {
    pub fn new(env: EnvSnapshot, prefix: impl Into<String>) -> Self {
        Self {
            env,
            prefix: prefix.into(),
        }
    }

    pub fn variable(&self, id: &str, field: CredentialField) -> String {
        let id: String = id
            .chars()
            .map(|c| match c {
                '-' | '.' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();
        format!(
            "{}_CREDENTIAL_{}_{}",
            self.prefix,
            id,
            field.as_str().to_ascii_uppercase()
        )
    }
}

impl CredentialStore for EnvCredentialStore {
    fn lookup(&self, id: &str, field: CredentialField) -> Option<String> {
        self.env.get(&self.variable(id, field)).map(str::to_string)
    }
}

/// In-memory credential store.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentialStore {
    entries: BTreeMap<(String, CredentialField), String>,
}

impl StaticCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: impl Into<String>, field: CredentialField, value: impl Into<String>) -> Self {
        self.entries.insert((id.into(), field), value.into());
        self
    }
}

impl CredentialStore for StaticCredentialStore {
    fn lookup(&self, id: &str, field: CredentialField) -> Option<String> {
        self.entries.get(&(id.to_string(), field)).cloned()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Secret files
// ─────────────────────────────────────────────────────────────────────────────

/// Files holding materialized secrets, in a directory unique to the process.
#[derive(Debug)]
pub struct SecretFiles {
    dir: PathBuf,
    written: Mutex<Vec<PathBuf>>,
}

impl SecretFiles {
    pub fn new() -> Self {
        Self::in_dir(std::env::temp_dir().join(format!("pipestep-secrets-{}", uuid::Uuid::new_v4())))
    }

    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            written: Mutex::new(Vec::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `contents` to a new owner-only file and return its path.
    pub fn write(&self, name: &str, contents: &str) -> Result<PathBuf> {
        let io_err = |e: std::io::Error| ConfigError::Secret(format!("cannot write secret file: {}", e));
        std::fs::create_dir_all(&self.dir).map_err(io_err)?;

        let file_name: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let path = self.dir.join(file_name);

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&path).map_err(io_err)?;
        std::io::Write::write_all(&mut file, contents.as_bytes()).map_err(io_err)?;

        self.written.lock().push(path.clone());
        Ok(path)
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.written.lock().clone()
    }

    /// Unlink every file written so far and the directory. Returns the
    /// number of files removed; failures are logged.
    pub fn remove_all(&self) -> usize {
        let paths = std::mem::take(&mut *self.written.lock());
        let mut removed = 0;
        for path in paths {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove secret file"),
            }
        }
        if self.dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.dir) {
                tracing::warn!(path = %self.dir.display(), error = %e, "Failed to remove secret directory");
            }
        }
        removed
    }
}

impl Default for SecretFiles {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Remote store
// ─────────────────────────────────────────────────────────────────────────────

/// Lazily connected remote store client.
///
/// Nothing is contacted until the first remote reference is resolved.
pub struct RemoteStoreSlot {
    settings: Option<VaultSettings>,
    cell: OnceCell<Arc<dyn RemoteStore>>,
}

impl RemoteStoreSlot {
    /// No remote store configured.
    pub fn disabled() -> Self {
        Self {
            settings: None,
            cell: OnceCell::new(),
        }
    }

    pub fn from_settings(settings: Option<VaultSettings>) -> Self {
        Self {
            settings,
            cell: OnceCell::new(),
        }
    }

    /// A slot holding an already connected store.
    pub fn ready(store: Arc<dyn RemoteStore>) -> Self {
        Self {
            settings: None,
            cell: OnceCell::new_with(Some(store)),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.settings.is_some() || self.cell.initialized()
    }

    pub fn is_connected(&self) -> bool {
        self.cell.initialized()
    }

    /// The client, connecting on first use. `None` when not configured.
    pub async fn get(&self, mask: &SecretMask) -> Result<Option<Arc<dyn RemoteStore>>> {
        if let Some(store) = self.cell.get() {
            return Ok(Some(store.clone()));
        }
        let Some(settings) = &self.settings else {
            return Ok(None);
        };
        let store = self
            .cell
            .get_or_try_init(|| async {
                let client = VaultClient::connect(settings.clone(), mask).await?;
                Ok::<Arc<dyn RemoteStore>, ConfigError>(Arc::new(client))
            })
            .await?;
        Ok(Some(store.clone()))
    }

    /// Revoke the token of a connected client. Returns whether there was one.
    pub async fn revoke(&self) -> Result<bool> {
        match self.cell.get() {
            Some(store) => store.revoke().await.map(|()| true),
            None => Ok(false),
        }
    }
}

impl std::fmt::Debug for RemoteStoreSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStoreSlot")
            .field("configured", &self.is_configured())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Remote store paths tried when a reference lists none.
pub const DEFAULT_REMOTE_PATHS: &[&str] = &[
    "$(vaultPath)/$(secretName)",
    "$(vaultBasePath)/$(vaultPipelineName)/$(secretName)",
    "$(vaultBasePath)/GROUP-SECRETS/$(secretName)",
];

/// Substitute `$(key)` placeholders; `None` when one has no value.
pub fn expand_path(template: &str, secret_name: &str, config: &Map<String, Value>) -> Option<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("$(") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find(')')?;
        let key = &after[..end];
        let value = if key == "secretName" {
            Some(secret_name.to_string())
        } else {
            config.get(key).and_then(text_of)
        };
        out.push_str(&value?);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Some(out)
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Provider
// ─────────────────────────────────────────────────────────────────────────────

/// Resolves resource references into concrete values.
#[derive(Clone)]
pub struct SecretProvider {
    credentials: Arc<dyn CredentialStore>,
    remote: Arc<RemoteStoreSlot>,
    files: Arc<SecretFiles>,
    env: EnvSnapshot,
    mask: SecretMask,
}

impl SecretProvider {
    pub fn new(credentials: Arc<dyn CredentialStore>, env: EnvSnapshot, mask: SecretMask) -> Self {
        Self {
            credentials,
            remote: Arc::new(RemoteStoreSlot::disabled()),
            files: Arc::new(SecretFiles::new()),
            env,
            mask,
        }
    }

    pub fn with_remote(mut self, remote: Arc<RemoteStoreSlot>) -> Self {
        self.remote = remote;
        self
    }

    pub fn with_files(mut self, files: Arc<SecretFiles>) -> Self {
        self.files = files;
        self
    }

    pub fn remote(&self) -> &Arc<RemoteStoreSlot> {
        &self.remote
    }

    pub fn files(&self) -> &Arc<SecretFiles> {
        &self.files
    }

    pub fn mask(&self) -> &SecretMask {
        &self.mask
    }

    /// First non-empty value among the parameter's secret references.
    ///
    /// `config` holds the textual configuration, used for remote store
    /// path templates and secret names.
    pub async fn resolve(&self, param: &Parameter, config: &Map<String, Value>) -> Result<Option<ResolvedSecret>> {
        for reference in param.resource_refs.iter().filter(|r| r.kind.is_secret()) {
            if let Some(secret) = self.resolve_ref(param, reference, config).await? {
                tracing::debug!(param = %param.name, source = %secret.source, "Resolved secret");
                return Ok(Some(secret));
            }
        }
        Ok(None)
    }

    async fn resolve_ref(
        &self,
        param: &Parameter,
        reference: &ResourceRef,
        config: &Map<String, Value>,
    ) -> Result<Option<ResolvedSecret>> {
        let found = match reference.kind {
            ResourceKind::PipelineCredential => {
                let field: CredentialField = reference.param.parse()?;
                self.credentials
                    .lookup(&reference.name, field)
                    .filter(|v| !v.is_empty())
                    .map(|value| {
                        if field != CredentialField::File {
                            self.mask.register(&value);
                        }
                        ResolvedSecret {
                            value,
                            source: SecretSource::PipelineCredential(reference.name.clone()),
                        }
                    })
            }
            ResourceKind::RemoteStore | ResourceKind::RemoteStoreFile => {
                self.resolve_remote(param, reference, config).await?
            }
            ResourceKind::Environment => self.env.get(&reference.name).map(|value| {
                self.mask.register(value);
                ResolvedSecret {
                    value: value.to_string(),
                    source: SecretSource::EnvVar(reference.name.clone()),
                }
            }),
            ResourceKind::Literal => reference
                .default
                .clone()
                .filter(|v| !v.is_empty())
                .map(|value| {
                    self.mask.register(&value);
                    ResolvedSecret {
                        value,
                        source: SecretSource::Literal,
                    }
                }),
            ResourceKind::PipelineEnvironment => None,
        };
        Ok(found)
    }

    async fn resolve_remote(
        &self,
        param: &Parameter,
        reference: &ResourceRef,
        config: &Map<String, Value>,
    ) -> Result<Option<ResolvedSecret>> {
        let store = match self.remote.get(&self.mask).await {
            Ok(Some(store)) => store,
            Ok(None) => {
                tracing::debug!(param = %param.name, "No remote secret store configured");
                return Ok(None);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Remote secret store unavailable");
                return Ok(None);
            }
        };

        let secret_name = config
            .get(&reference.name)
            .and_then(text_of)
            .or_else(|| reference.default.clone())
            .unwrap_or_else(|| param.name.clone());
        let key = if reference.param.is_empty() {
            param.name.as_str()
        } else {
            reference.param.as_str()
        };

        let templates: Vec<&str> = if reference.paths.is_empty() {
            DEFAULT_REMOTE_PATHS.to_vec()
        } else {
            reference.paths.iter().map(String::as_str).collect()
        };

        for template in templates {
            let Some(path) = expand_path(template, &secret_name, config) else {
                continue;
            };
            let data = match store.read(&path).await {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "Failed to read remote secret");
                    continue;
                }
            };
            let Some(value) = data.and_then(|mut d| d.remove(key)).filter(|v| !v.is_empty()) else {
                tracing::debug!(path = %path, key = key, "Remote secret not found");
                continue;
            };
            self.mask.register(&value);

            if reference.kind == ResourceKind::RemoteStoreFile {
                let file = self.files.write(&param.name, &value)?;
                return Ok(Some(ResolvedSecret {
                    value: file.display().to_string(),
                    source: SecretSource::RemoteStoreFile(path),
                }));
            }
            return Ok(Some(ResolvedSecret {
                value,
                source: SecretSource::RemoteStore(path),
            }));
        }
        Ok(None)
    }
}

impl std::fmt::Debug for SecretProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretProvider")
            .field("remote", &self.remote)
            .field("files", &self.files.dir())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::TempDir;

    struct MapStore(BTreeMap<String, BTreeMap<String, String>>);

    #[async_trait]
    impl RemoteStore for MapStore {
        async fn read(&self, path: &str) -> Result<Option<BTreeMap<String, String>>> {
            Ok(self.0.get(path).cloned())
        }

        async fn revoke(&self) -> Result<()> {
            Ok(())
        }
    }

    fn param(yaml: &str) -> Parameter {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn provider(credentials: StaticCredentialStore) -> SecretProvider {
        SecretProvider::new(Arc::new(credentials), EnvSnapshot::new(), SecretMask::new())
    }

    #[test]
    fn test_env_credential_variable() {
        let store = EnvCredentialStore::new(
            EnvSnapshot::new().with("PFX_CREDENTIAL_GITHUB_TOKEN_ID_TOKEN", "t"),
            "PFX",
        );
        assert_eq!(
            store.variable("github-token.id", CredentialField::Token),
            "PFX_CREDENTIAL_GITHUB_TOKEN_ID_TOKEN"
        );
        assert_eq!(store.lookup("github-token.id", CredentialField::Token).as_deref(), Some("t"));
        assert_eq!(store.lookup("github-token.id", CredentialField::Username), None);
    }

    #[tokio::test]
    async fn test_credential_is_masked() {
        let p = param(
            "name: token\ntype: string\nresourceRef:\n  - type: pipeline-credential\n    name: ghToken\n    param: token\n",
        );
        let provider = provider(StaticCredentialStore::new().with("ghToken", CredentialField::Token, "s3cr3t"));
        let secret = provider.resolve(&p, &Map::new()).await.unwrap().unwrap();
        assert_eq!(secret.value, "s3cr3t");
        assert_eq!(secret.source, SecretSource::PipelineCredential("ghToken".into()));
        assert!(provider.mask().contains("s3cr3t"));
    }

    #[tokio::test]
    async fn test_file_credential_path_not_masked() {
        let p = param(
            "name: kubeconfig\ntype: string\nresourceRef:\n  - type: pipeline-credential\n    name: kube\n    param: file\n",
        );
        let provider = provider(StaticCredentialStore::new().with("kube", CredentialField::File, "/tmp/kube"));
        let secret = provider.resolve(&p, &Map::new()).await.unwrap().unwrap();
        assert_eq!(secret.value, "/tmp/kube");
        assert!(provider.mask().is_empty());
    }

    #[tokio::test]
    async fn test_first_non_empty_reference_wins() {
        let p = param(
            r#"
name: token
type: string
resourceRef:
  - type: pipeline-credential
    name: missing
  - type: environment
    name: TOKEN_VAR
  - type: literal
    default: fallback
"#,
        );
        let provider = SecretProvider::new(
            Arc::new(StaticCredentialStore::new()),
            EnvSnapshot::new().with("TOKEN_VAR", ""),
            SecretMask::new(),
        );
        let secret = provider.resolve(&p, &Map::new()).await.unwrap().unwrap();
        assert_eq!(secret.value, "fallback");
        assert_eq!(secret.source, SecretSource::Literal);
    }

    #[tokio::test]
    async fn test_remote_paths_fall_through() {
        let p = param(
            r#"
name: password
type: string
resourceRef:
  - type: remote-store
    name: appSecretName
    default: app
"#,
        );
        let store = MapStore(BTreeMap::from([(
            "team/GROUP-SECRETS/custom".to_string(),
            BTreeMap::from([("password".to_string(), "pw!".to_string())]),
        )]));
        let provider = provider(StaticCredentialStore::new())
            .with_remote(Arc::new(RemoteStoreSlot::ready(Arc::new(store))));

        let config = json!({"vaultBasePath": "team", "vaultPipelineName": "pipe", "appSecretName": "custom"});
        let config = config.as_object().unwrap();
        let secret = provider.resolve(&p, config).await.unwrap().unwrap();

        assert_eq!(secret.value, "pw!");
        assert_eq!(secret.source, SecretSource::RemoteStore("team/GROUP-SECRETS/custom".into()));
        assert!(provider.mask().contains("pw!"));
    }

    #[tokio::test]
    async fn test_remote_file_reference() {
        let dir = TempDir::new().unwrap();
        let p = param(
            r#"
name: serviceKey
type: string
resourceRef:
  - type: remote-store-file
    name: keySecret
    param: json
    paths: ["$(vaultPath)/gcp"]
"#,
        );
        let store = MapStore(BTreeMap::from([(
            "pipelines/x/gcp".to_string(),
            BTreeMap::from([("json".to_string(), "{\"key\":1}".to_string())]),
        )]));
        let files = Arc::new(SecretFiles::in_dir(dir.path().join("secrets")));
        let provider = provider(StaticCredentialStore::new())
            .with_remote(Arc::new(RemoteStoreSlot::ready(Arc::new(store))))
            .with_files(files.clone());

        let config = json!({"vaultPath": "pipelines/x"});
        let secret = provider.resolve(&p, config.as_object().unwrap()).await.unwrap().unwrap();

        let path = PathBuf::from(&secret.value);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"key\":1}");
        assert!(!provider.mask().contains(&secret.value));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        assert_eq!(files.remove_all(), 1);
        assert!(!path.exists());
        assert!(!files.dir().exists());
    }

    #[tokio::test]
    async fn test_unconfigured_remote_store_yields_nothing() {
        let p = param("name: pw\ntype: string\nresourceRef:\n  - type: remote-store\n    name: s\n");
        let provider = provider(StaticCredentialStore::new());
        assert!(provider.resolve(&p, &Map::new()).await.unwrap().is_none());
        assert!(!provider.remote().revoke().await.unwrap());
    }

    #[test]
    fn test_expand_path() {
        let config = json!({"vaultBasePath": "base", "n": 3});
        let config = config.as_object().unwrap();
        assert_eq!(
            expand_path("$(vaultBasePath)/$(n)/$(secretName)", "s", config).as_deref(),
            Some("base/3/s")
        );
        assert_eq!(expand_path("$(vaultPath)/$(secretName)", "s", config), None);
    }
}
