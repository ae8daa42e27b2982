//! Configuration resolution for pipeline steps.
//!
//! Provides:
//! - Project file loading (`general`, `stages`, `steps`, `hooks` sections)
//! - Layered parameter resolution with aliases, scopes and type coercion
//! - Secret injection from pipeline credentials, a remote key/value store,
//!   environment variables and literals, with masking of every value
//! - Declarative validation and a frozen, typed result
//!
//! See [`resolver`] for the layer order.

pub mod coerce;
pub mod discovery;
pub mod env;
pub mod error;
pub mod resolver;
pub mod secrets;
pub mod types;
pub mod validation;
pub mod vault;

pub use discovery::{DEFAULT_PROJECT_CONFIG, LoadedConfig, load_config, load_config_file};
pub use env::{DEFAULT_PREFIX, EnvSnapshot};
pub use error::{ConfigError, Result};
pub use resolver::{ConfigBuilder, Layer, ResolvedConfig};
pub use secrets::{
    CredentialField, CredentialStore, EnvCredentialStore, RemoteStoreSlot, ResolvedSecret,
    SecretFiles, SecretProvider, SecretSource, StaticCredentialStore,
};
pub use types::{
    BucketHook, HookConfig, ProjectConfig, PubSubHook, SentryHook, SplunkHook, TelemetryHook,
    VaultHook,
};
pub use vault::{RemoteStore, VaultAuth, VaultClient, VaultSettings};
