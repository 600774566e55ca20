// src/exec/registry.rs

//! Explicit registry of backend factories plus capability-based selection.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::errors::{DagwaveError, Result};
use crate::exec::backend::{BackendCapabilities, TaskBackend};
use crate::exec::process::{ProcessBackend, ProcessBackendConfig};
use crate::exec::shared_context::{SharedContextBackend, SharedContextConfig};
use crate::exec::worktree::{WorktreeBackend, WorktreeBackendConfig};
use crate::types::BackendKind;

pub type BackendFactory = Box<dyn Fn() -> Arc<dyn TaskBackend> + Send + Sync>;

const ISOLATION_WEIGHT: u32 = 30;
const PARALLEL_WEIGHT: u32 = 20;
const MINIMIZE_TOKENS_WEIGHT: u32 = 25;
const SHARED_CONTEXT_WEIGHT: u32 = 20;
const STREAMING_WEIGHT: u32 = 10;

/// Per-backend settings used by [`BackendRegistry::with_builtins`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendSettings {
    pub process: ProcessBackendConfig,
    pub worktree: WorktreeBackendConfig,
    pub shared_context: SharedContextConfig,
}

/// What a caller wants from a backend. Unset fields do not score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendRequirements {
    pub needs_isolation: bool,
    /// Number of tasks the caller wants to run side by side.
    pub parallel_tasks: Option<usize>,
    pub minimize_tokens: bool,
    pub needs_shared_context: bool,
    pub needs_streaming: bool,
}

impl BackendRequirements {
    /// Weighted match of `caps` against these requirements.
    pub fn score(&self, caps: &BackendCapabilities) -> u32 {
        let mut score = 0;
        if self.needs_isolation && caps.true_isolation {
            score += ISOLATION_WEIGHT;
        }
        if let Some(n) = self.parallel_tasks {
            if caps.max_parallelism == 0 || caps.max_parallelism >= n {
                score += PARALLEL_WEIGHT;
            }
        }
        if self.minimize_tokens && caps.token_overhead_per_task == 0 {
            score += MINIMIZE_TOKENS_WEIGHT;
        }
        if self.needs_shared_context && caps.shared_context {
            score += SHARED_CONTEXT_WEIGHT;
        }
        if self.needs_streaming && caps.supports_streaming {
            score += STREAMING_WEIGHT;
        }
        score
    }
}

/// One row of the capability comparison table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendComparison {
    pub kind: BackendKind,
    pub name: String,
    pub capabilities: BackendCapabilities,
    pub available: bool,
}

/// Factories in registration order. Nothing is registered implicitly.
#[derive(Default)]
pub struct BackendRegistry {
    entries: Vec<(BackendKind, BackendFactory)>,
    default: Option<BackendKind>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the three built-in backends, in the order
    /// process, worktree, shared-context.
    pub fn with_builtins(settings: BackendSettings) -> Self {
        let BackendSettings {
            process,
            worktree,
            shared_context,
        } = settings;

        let mut registry = Self::new();
        registry.register(BackendKind::Process, move || {
            Arc::new(ProcessBackend::new(process.clone())) as Arc<dyn TaskBackend>
        });
        registry.register(BackendKind::Worktree, move || {
            Arc::new(WorktreeBackend::new(worktree.clone())) as Arc<dyn TaskBackend>
        });
        registry.register(BackendKind::SharedContext, move || {
            Arc::new(SharedContextBackend::new(shared_context.clone())) as Arc<dyn TaskBackend>
        });
        registry
    }

    /// Register a factory. Re-registering a kind replaces its factory but
    /// keeps its original position.
    pub fn register<F>(&mut self, kind: BackendKind, factory: F) -> &mut Self
    where
        F: Fn() -> Arc<dyn TaskBackend> + Send + Sync + 'static,
    {
        let factory: BackendFactory = Box::new(factory);
        match self.entries.iter_mut().find(|(k, _)| *k == kind) {
            Some(entry) => entry.1 = factory,
            None => self.entries.push((kind, factory)),
        }
        debug!(backend = %kind, "registered backend");
        self
    }

    pub fn kinds(&self) -> Vec<BackendKind> {
        self.entries.iter().map(|(k, _)| *k).collect()
    }

    pub fn is_registered(&self, kind: BackendKind) -> bool {
        self.entries.iter().any(|(k, _)| *k == kind)
    }

    pub fn create(&self, kind: BackendKind) -> Result<Arc<dyn TaskBackend>> {
        self.entries
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, factory)| factory())
            .ok_or_else(|| DagwaveError::BackendUnavailable(format!("'{kind}' is not registered")))
    }

    pub fn set_default(&mut self, kind: BackendKind) -> Result<()> {
        if !self.is_registered(kind) {
            return Err(DagwaveError::BackendUnavailable(format!(
                "cannot make unregistered '{kind}' the default"
            )));
        }
        self.default = Some(kind);
        Ok(())
    }

    /// The explicit default, or the first registered kind.
    pub fn default_kind(&self) -> Option<BackendKind> {
        self.default.or_else(|| self.entries.first().map(|(k, _)| *k))
    }

    pub fn default_backend(&self) -> Result<Arc<dyn TaskBackend>> {
        let kind = self
            .default_kind()
            .ok_or_else(|| DagwaveError::BackendUnavailable("no backends registered".into()))?;
        self.create(kind)
    }

    /// Kinds whose backend reports itself available, in registration order.
    pub async fn available_kinds(&self) -> Vec<BackendKind> {
        let mut available = Vec::new();
        for (kind, factory) in &self.entries {
            if factory().is_available().await {
                available.push(*kind);
            }
        }
        available
    }

    /// Highest-scoring available backend. Ties go to the earliest registered.
    pub async fn select_best(
        &self,
        requirements: &BackendRequirements,
    ) -> Result<Arc<dyn TaskBackend>> {
        let mut best: Option<(u32, Arc<dyn TaskBackend>)> = None;

        for (kind, factory) in &self.entries {
            let backend = factory();
            if !backend.is_available().await {
                debug!(backend = %kind, "skipping unavailable backend");
                continue;
            }
            let score = requirements.score(&backend.capabilities());
            debug!(backend = %kind, score, "scored backend");
            if best.as_ref().is_none_or(|(top, _)| score > *top) {
                best = Some((score, backend));
            }
        }

        match best {
            Some((score, backend)) => {
                info!(backend = backend.name(), score, "selected backend");
                Ok(backend)
            }
            None => Err(DagwaveError::BackendUnavailable(
                "no registered backend is available".into(),
            )),
        }
    }

    /// Capability table of every registered backend.
    pub async fn compare(&self) -> Vec<BackendComparison> {
        let mut rows = Vec::with_capacity(self.entries.len());
        for (kind, factory) in &self.entries {
            let backend = factory();
            rows.push(BackendComparison {
                kind: *kind,
                name: backend.name().to_string(),
                capabilities: backend.capabilities(),
                available: backend.is_available().await,
            });
        }
        rows
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("kinds", &self.kinds())
            .field("default", &self.default)
            .finish()
    }
}
