//! Process environment snapshot.

use std::collections::BTreeMap;

/// Default prefix of framework environment variables.
pub const DEFAULT_PREFIX: &str = "PIPESTEP";

/// Immutable copy of environment variables taken at startup.
///
/// Resolution reads variables only through a snapshot so tests can supply
/// their own without touching the process environment. Empty values read
/// as unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_process() -> Self {
        std::env::vars().collect()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    /// `<prefix>_<name>`.
    pub fn prefixed(&self, prefix: &str, name: &str) -> Option<&str> {
        self.get(&format!("{}_{}", prefix, name))
    }

    /// Whether a variable holds a truthy value (`true`, `1`, `yes`).
    pub fn is_truthy(&self, key: &str) -> bool {
        self.get(key)
            .is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
    }
}

impl FromIterator<(String, String)> for EnvSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_empty_reads_as_unset() {
        let env = EnvSnapshot::new().with("A", "").with("B", "x");
        assert_eq!(env.get("A"), None);
        assert_eq!(env.get("B"), Some("x"));
        assert_eq!(env.prefixed("PFX", "level"), None);
    }

    #[test]
    fn test_truthy() {
        let env = EnvSnapshot::new().with("V", "TRUE").with("W", "0");
        assert!(env.is_truthy("V"));
        assert!(!env.is_truthy("W"));
        assert!(!env.is_truthy("missing"));
    }

    #[test]
    #[serial]
    fn test_from_process() {
        // SAFETY: serialized with every other test touching the environment.
        unsafe { std::env::set_var("PIPESTEP_SNAPSHOT_TEST", "yes") };
        let env = EnvSnapshot::from_process();
        unsafe { std::env::remove_var("PIPESTEP_SNAPSHOT_TEST") };
        assert_eq!(env.prefixed("PIPESTEP", "SNAPSHOT_TEST"), Some("yes"));
    }
}
