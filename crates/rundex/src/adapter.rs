//! Source adapter contract, registry, and lifecycle.
//!
//! Every documentation backend (filesystem, Confluence, GitHub, ...) is one
//! [`SourceAdapter`] instance owning a [`SourceConfig`]. The engine never
//! talks to a backend directly: adapter calls cross the circuit-breaker
//! layer, their inventories feed the indexer, and the matcher fans out
//! across them.
//!
//! Concrete backends live outside this crate; they implement the trait and
//! register a factory under their type name.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::SourceConfig;
use crate::document::{Document, Severity};
use crate::error::{EngineError, Result};

/// Adapter lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterState {
    Uninitialized,
    Initializing,
    Ready,
    /// Set by the health monitor after breaker trips; still queried, with
    /// results tagged.
    Degraded,
    Failed,
    ShuttingDown,
}

impl std::fmt::Display for AdapterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AdapterState::Uninitialized => "uninitialized",
            AdapterState::Initializing => "initializing",
            AdapterState::Ready => "ready",
            AdapterState::Degraded => "degraded",
            AdapterState::Failed => "failed",
            AdapterState::ShuttingDown => "shutting_down",
        };
        f.write_str(s)
    }
}

/// Filters accepted by [`SourceAdapter::search`] and the knowledge-base
/// tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Restrict to one content type (wire name, e.g. "runbook").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_type: Option<String>,
    /// Restrict to one source adapter by name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_confidence: Option<f64>,
}

/// A runbook query as seen by an adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunbookQuery {
    pub alert_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affected_systems: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

/// A document scored by its adapter's own relevance measure.
///
/// Scores are normalized to `[0, 1]`; the matcher layers its confidence
/// components on top.
#[derive(Debug, Clone)]
pub struct ScoredHit {
    pub document: Document,
    pub score: f64,
}

/// Result of an adapter health probe. `health_check` must not fail: probe
/// errors become `healthy: false` with a detail string.
#[derive(Debug, Clone)]
pub struct AdapterProbe {
    pub healthy: bool,
    pub detail: Option<String>,
}

impl AdapterProbe {
    pub fn ok() -> Self {
        Self {
            healthy: true,
            detail: None,
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            detail: Some(detail.into()),
        }
    }
}

/// Live adapter metadata for `list_sources`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterMetadata {
    pub name: String,
    #[serde(rename = "type")]
    pub adapter_type: String,
    pub document_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    pub status: AdapterState,
}

/// Uniform contract all documentation sources implement.
///
/// Failure classification matters: transient failures
/// ([`EngineError::Transient`]) are retried by the engine, permanent ones
/// surface into the degraded envelope.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Connect and validate configuration. Called once by the engine after
    /// construction; the adapter is not queried before this succeeds.
    async fn initialize(&self) -> Result<()>;

    /// Free-text search over this source's documents.
    async fn search(&self, query: &str, filters: &SearchFilters) -> Result<Vec<ScoredHit>>;

    /// Fetch a single document by id.
    ///
    /// # Errors
    ///
    /// `NotFound` when the id is unknown to this source.
    async fn get_document(&self, id: &str) -> Result<Document>;

    /// Runbook-targeted search. Returned hits must carry runbook payloads
    /// whose alert types intersect the query's alert type (or its aliases,
    /// when the adapter supports fuzzy matching).
    async fn search_runbooks(&self, query: &RunbookQuery) -> Result<Vec<ScoredHit>>;

    /// Probe backend liveness. Must return promptly and must not fail;
    /// the monitor additionally bounds it to 2s and treats a timeout as
    /// unhealthy.
    async fn health_check(&self) -> AdapterProbe;

    /// Live metadata snapshot.
    async fn get_metadata(&self) -> AdapterMetadata;

    /// Enumerate the source's full document inventory for an indexing
    /// pass. The sequence is restartable: no state may leak between
    /// passes. `force` requests a full re-enumeration even when the
    /// adapter tracks its own incremental cursor.
    async fn enumerate(&self, force: bool) -> Result<Vec<Document>>;

    /// Release all owned resources. Idempotent; invoked on shutdown and on
    /// adapter replacement, on every exit path.
    async fn cleanup(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn SourceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn SourceAdapter").finish_non_exhaustive()
    }
}

/// Factory constructing an adapter from its source entry.
pub type AdapterFactory =
    Arc<dyn Fn(&SourceConfig) -> Result<Arc<dyn SourceAdapter>> + Send + Sync>;

/// Process-wide mapping from adapter-type name to factory.
///
/// Factories are registered during startup; [`AdapterRegistry::freeze`]
/// then locks the registry and later registrations fail.
pub struct AdapterRegistry {
    factories: RwLock<HashMap<String, AdapterFactory>>,
    frozen: RwLock<bool>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            frozen: RwLock::new(false),
        }
    }

    /// Register a factory for `adapter_type`. Before the freeze this
    /// replaces any prior registration; afterwards it is an error.
    pub fn register<F>(&self, adapter_type: &str, factory: F) -> Result<()>
    where
        F: Fn(&SourceConfig) -> Result<Arc<dyn SourceAdapter>> + Send + Sync + 'static,
    {
        if *self.frozen.read() {
            return Err(EngineError::Configuration(format!(
                "adapter registry is frozen; cannot register type {adapter_type}"
            )));
        }
        let replaced = self
            .factories
            .write()
            .insert(adapter_type.to_string(), Arc::new(factory))
            .is_some();
        if replaced {
            tracing::warn!(adapter_type = %adapter_type, "replaced adapter factory during startup");
        }
        Ok(())
    }

    /// Construct an adapter for a source entry.
    pub fn create(&self, config: &SourceConfig) -> Result<Arc<dyn SourceAdapter>> {
        let factories = self.factories.read();
        let factory = factories.get(&config.adapter_type).ok_or_else(|| {
            EngineError::Configuration(format!(
                "source {} references unregistered adapter type {}",
                config.name, config.adapter_type
            ))
        })?;
        factory(config)
    }

    /// Lock the registry against further registration.
    pub fn freeze(&self) {
        *self.frozen.write() = true;
    }

    /// Registered type names.
    pub fn registered_types(&self) -> Vec<String> {
        self.factories.read().keys().cloned().collect()
    }
}

/// An adapter bound to its configuration and lifecycle state.
pub struct AdapterHandle {
    pub name: String,
    pub adapter: Arc<dyn SourceAdapter>,
    pub config: SourceConfig,
    state: RwLock<AdapterState>,
}

impl AdapterHandle {
    pub fn new(adapter: Arc<dyn SourceAdapter>, config: SourceConfig) -> Self {
        Self {
            name: config.name.clone(),
            adapter,
            config,
            state: RwLock::new(AdapterState::Uninitialized),
        }
    }

    pub fn state(&self) -> AdapterState {
        *self.state.read()
    }

    pub fn set_state(&self, to: AdapterState) {
        let mut state = self.state.write();
        if *state != to {
            tracing::info!(adapter = %self.name, from = %*state, to = %to, "adapter state change");
            *state = to;
        }
    }

    /// Ranking priority (lower = preferred).
    pub fn priority(&self) -> u32 {
        self.config.priority
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct NullAdapter;

    #[async_trait]
    impl SourceAdapter for NullAdapter {
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }
        async fn search(&self, _query: &str, _filters: &SearchFilters) -> Result<Vec<ScoredHit>> {
            Ok(vec![])
        }
        async fn get_document(&self, id: &str) -> Result<Document> {
            Err(EngineError::not_found("document", id))
        }
        async fn search_runbooks(&self, _query: &RunbookQuery) -> Result<Vec<ScoredHit>> {
            Ok(vec![])
        }
        async fn health_check(&self) -> AdapterProbe {
            AdapterProbe::ok()
        }
        async fn get_metadata(&self) -> AdapterMetadata {
            AdapterMetadata {
                name: "null".to_string(),
                adapter_type: "null".to_string(),
                document_count: 0,
                last_updated: None,
                status: AdapterState::Ready,
            }
        }
        async fn enumerate(&self, _force: bool) -> Result<Vec<Document>> {
            Ok(vec![])
        }
        async fn cleanup(&self) -> Result<()> {
            Ok(())
        }
    }

    fn source(name: &str, adapter_type: &str) -> SourceConfig {
        let yaml = format!("name: \"{name}\"\ntype: \"{adapter_type}\"\n");
        serde_yml::from_str(&yaml).unwrap()
    }

    #[test]
    fn test_registry_dispatch() {
        let registry = AdapterRegistry::new();
        registry
            .register("null", |_config| Ok(Arc::new(NullAdapter) as _))
            .unwrap();

        assert!(registry.create(&source("a", "null")).is_ok());
        let err = registry.create(&source("b", "ghost")).unwrap_err();
        assert!(err.to_string().contains("unregistered adapter type"));
    }

    #[test]
    fn test_registry_freeze() {
        let registry = AdapterRegistry::new();
        registry
            .register("null", |_config| Ok(Arc::new(NullAdapter) as _))
            .unwrap();
        // Replacement is allowed before the freeze.
        registry
            .register("null", |_config| Ok(Arc::new(NullAdapter) as _))
            .unwrap();

        registry.freeze();
        let err = registry
            .register("late", |_config| Ok(Arc::new(NullAdapter) as _))
            .unwrap_err();
        assert_eq!(err.code(), "configuration");
        // Creation still works after the freeze.
        assert!(registry.create(&source("a", "null")).is_ok());
    }

    #[test]
    fn test_handle_state_transitions() {
        let handle = AdapterHandle::new(Arc::new(NullAdapter), source("a", "null"));
        assert_eq!(handle.state(), AdapterState::Uninitialized);
        handle.set_state(AdapterState::Initializing);
        handle.set_state(AdapterState::Ready);
        assert_eq!(handle.state(), AdapterState::Ready);
    }

    #[tokio::test]
    async fn test_null_adapter_contract() {
        let adapter = NullAdapter;
        adapter.initialize().await.unwrap();
        assert!(adapter.health_check().await.healthy);
        assert!(adapter.enumerate(false).await.unwrap().is_empty());
        let err = adapter.get_document("x").await.unwrap_err();
        assert_eq!(err.code(), "not_found");
        let meta = adapter.get_metadata().await;
        assert_eq!(meta.document_count, 0);
    }
}
