//! Locating and loading configuration files.
//!
//! Layering (later overrides earlier):
//! 1. Default files given with `--default-config`, in order
//! 2. The project file (`.pipeline/config.yml` unless overridden)
//!
//! A missing project file is not an error; a missing default file is.

use std::path::{Path, PathBuf};

use crate::{ConfigError, ProjectConfig, Result};

/// Default location of the project configuration file.
pub const DEFAULT_PROJECT_CONFIG: &str = ".pipeline/config.yml";

/// Project file plus default files, as read from disk.
#[derive(Debug, Clone, Default)]
pub struct LoadedConfig {
    pub project: ProjectConfig,
    /// Default documents in the order they were given.
    pub defaults: Vec<ProjectConfig>,
    /// Files that were actually read.
    pub sources: Vec<PathBuf>,
}

/// Load the project file (if present) and every default file.
pub fn load_config(project_path: &Path, default_paths: &[PathBuf]) -> Result<LoadedConfig> {
    let mut loaded = LoadedConfig::default();

    for path in default_paths {
        loaded.defaults.push(load_config_file(path)?);
        loaded.sources.push(path.clone());
    }

    if project_path.exists() {
        loaded.project = load_config_file(project_path)?;
        loaded.sources.push(project_path.to_path_buf());
    } else {
        tracing::debug!(path = %project_path.display(), "No project configuration file");
    }

    Ok(loaded)
}

/// Load one YAML configuration file.
pub fn load_config_file(path: &Path) -> Result<ProjectConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    ProjectConfig::from_yaml_at(&contents, &path.display().to_string())
}
