//! Rundex: incident runbook retrieval engine.
//!
//! Given structured operational-alert queries, rundex returns matched
//! incident-response runbooks, decision trees, procedures, and escalation
//! paths with confidence scores. Wire protocols (tool-call RPC, HTTP/JSON)
//! are thin translators onto the typed tool surface in [`tools`]; this
//! crate is the engine they share.
//!
//! # Architecture
//!
//! 1. **Source adapters** ([`adapter`]): every documentation backend is one
//!    adapter instance behind a uniform async contract, constructed by
//!    registered factories and managed through a lifecycle.
//! 2. **Hybrid cache** ([`cache`]): a mandatory in-process tier plus an
//!    optional Redis tier, keyed over (tool, normalized args, corpus
//!    epoch) so indexing changes invalidate by keying alone.
//! 3. **Circuit breakers & retry** ([`breaker`], [`retry`]): every outbound
//!    call is breaker-gated; transient failures retry with jittered
//!    backoff under the caller's deadline.
//! 4. **Indexer** ([`index`]): per-adapter refresh passes fingerprint
//!    documents, detect changes, and swap an immutable corpus snapshot.
//! 5. **Matcher** ([`matcher`]): parallel adapter fan-out, additive
//!    confidence scoring with match reasons, dedup, deterministic ranking.
//! 6. **Engine** ([`engine`]): lifecycle and the seven tool operations.
//!
//! # Example
//!
//! ```rust,ignore
//! use rundex::{AdapterRegistry, Engine, EngineConfig, SearchRunbooksArgs};
//!
//! let registry = AdapterRegistry::new();
//! registry.register("filesystem", |config| Ok(FilesystemAdapter::from_config(config)?))?;
//!
//! let config = EngineConfig::from_path("rundex.yaml")?;
//! let engine = Engine::start(config, &registry).await?;
//!
//! let response = engine
//!     .search_runbooks(SearchRunbooksArgs {
//!         alert_type: "disk_space_critical".into(),
//!         severity: Some(Severity::Critical),
//!         ..Default::default()
//!     }, None)
//!     .await?;
//!
//! for runbook in &response.data {
//!     println!("{}: {:.2}", runbook.document.title, runbook.confidence);
//! }
//! ```

pub mod adapter;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod feedback;
pub mod health;
pub mod index;
pub mod matcher;
pub mod metrics;
pub mod retry;
pub mod tools;

// Re-exports for convenience
pub use adapter::{
    AdapterHandle, AdapterMetadata, AdapterProbe, AdapterRegistry, AdapterState, RunbookQuery,
    ScoredHit, SearchFilters, SourceAdapter,
};
pub use breaker::{BreakerRegistry, CircuitState};
pub use cache::{CacheStats, CacheStore, CacheTier, HybridCache, MemoryCache};
pub use config::{
    BreakerSettings, CacheStrategy, DeletionPolicy, EngineConfig, PerformanceConfig, SecretRef,
    SourceConfig,
};
pub use document::{
    ContentType, DecisionBranch, DecisionNode, DecisionTree, Document, DocumentKey,
    EscalationPath, EscalationStep, Feedback, Fingerprint, Procedure, ProcedureStep, Runbook,
    Severity,
};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use health::{EngineHealth, HealthSnapshot, HealthStatus};
pub use index::{ChangeSet, CorpusSnapshot, Indexer, RunbookDetector};
pub use matcher::{MatchReason, PartialFailure, RunbookMatch, SearchResult};
pub use metrics::EngineMetrics;
pub use retry::RetryPolicy;
pub use tools::{
    FeedbackOutcome, GetDecisionTreeArgs, GetEscalationPathArgs, GetProcedureArgs,
    ListSourcesArgs, ProcedureView, RecordFeedbackArgs, ResponseEnvelope,
    SearchKnowledgeBaseArgs, SearchRunbooksArgs, SourceSummary, ToolName,
};
