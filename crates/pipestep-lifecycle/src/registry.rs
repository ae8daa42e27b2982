//! Step bodies and the flat step registry.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use pipestep_types::{StepMetadata, StepResult};
use serde::de::DeserializeOwned;

use crate::context::StepContext;
use crate::error::{LifecycleError, Result};

/// The business logic of a step.
///
/// Bodies should check [`StepContext::is_cancelled`] in polling loops and
/// return early; the process and HTTP handles on the context already stop
/// on cancellation.
#[async_trait]
pub trait StepBody: Send + Sync {
    async fn run(&self, ctx: StepContext) -> StepResult<()>;
}

/// A body built from an async function taking the typed step options.
pub struct TypedBody<T, F> {
    func: F,
    _options: PhantomData<fn() -> T>,
}

/// Wrap `func` so it receives the resolved configuration as `T`.
pub fn typed<T, F, Fut>(func: F) -> TypedBody<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T, StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = StepResult<()>> + Send,
{
    TypedBody {
        func,
        _options: PhantomData,
    }
}

#[async_trait]
impl<T, F, Fut> StepBody for TypedBody<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T, StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = StepResult<()>> + Send,
{
    async fn run(&self, ctx: StepContext) -> StepResult<()> {
        let options: T = ctx.options()?;
        (self.func)(options, ctx).await
    }
}

/// Metadata plus the body that implements it.
#[derive(Clone)]
pub struct StepEntry {
    pub metadata: Arc<StepMetadata>,
    pub body: Arc<dyn StepBody>,
}

impl StepEntry {
    pub fn new(metadata: StepMetadata, body: impl StepBody + 'static) -> Self {
        Self {
            metadata: Arc::new(metadata),
            body: Arc::new(body),
        }
    }

    /// Parse and validate a metadata document, then attach `body`.
    pub fn from_yaml(yaml: &str, body: impl StepBody + 'static) -> Result<Self> {
        Ok(Self::new(StepMetadata::from_yaml(yaml)?, body))
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

impl std::fmt::Debug for StepEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepEntry")
            .field("name", &self.metadata.name)
            .finish_non_exhaustive()
    }
}

/// Flat lookup of steps by name or step alias.
#[derive(Debug, Default, Clone)]
pub struct StepRegistry {
    steps: HashMap<String, StepEntry>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step. Names and aliases must not collide.
    pub fn register(&mut self, entry: StepEntry) -> Result<()> {
        let mut keys = vec![entry.metadata.name.clone()];
        keys.extend(entry.metadata.aliases.iter().map(|a| a.name.clone()));
        if let Some(taken) = keys.iter().find(|k| self.resolve(k).is_some()) {
            return Err(LifecycleError::DuplicateStep(taken.clone()));
        }
        self.steps.insert(entry.metadata.name.clone(), entry);
        Ok(())
    }

    /// Look up a step by name or alias.
    pub fn get(&self, name: &str) -> Option<StepEntry> {
        let entry = self.resolve(name)?;
        if entry.metadata.name != name {
            let deprecated = entry
                .metadata
                .aliases
                .iter()
                .any(|a| a.name == name && a.deprecated);
            if deprecated {
                tracing::warn!(
                    alias = name,
                    step = %entry.metadata.name,
                    "Step alias is deprecated; use the step name instead"
                );
            }
        }
        Some(entry.clone())
    }

    /// Like [`get`](Self::get) but unknown names are an error.
    pub fn require(&self, name: &str) -> Result<StepEntry> {
        self.get(name)
            .ok_or_else(|| LifecycleError::UnknownStep(name.to_string()))
    }

    fn resolve(&self, name: &str) -> Option<&StepEntry> {
        self.steps.get(name).or_else(|| {
            self.steps
                .values()
                .find(|e| e.metadata.aliases.iter().any(|a| a.name == name))
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    /// Registered step names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.steps.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Registered entries, sorted by name.
    pub fn entries(&self) -> Vec<&StepEntry> {
        let mut entries: Vec<&StepEntry> = self.steps.values().collect();
        entries.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        entries
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
