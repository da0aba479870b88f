//! The engine: lifecycle, background tasks, and the seven tool operations.
//!
//! [`Engine::start`] validates configuration, constructs adapters through
//! the registry's factories, seeds the index, spawns the refresh and health
//! loops, runs cache warmup, and freezes the registry. Every tool call
//! flows: validate -> cache lookup -> adapter fan-out (breaker-gated,
//! deadline-bounded) -> rank -> cache fill -> enveloped response.
//!
//! [`Engine::shutdown`] stops the background tasks and runs every
//! adapter's `cleanup()`, on every exit path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::{watch, Mutex, Semaphore};

use crate::adapter::{AdapterHandle, AdapterRegistry, AdapterState, RunbookQuery};
use crate::breaker::{Admission, BreakerRegistry, CircuitState};
use crate::cache::{cache_key, CacheTier, HybridCache, MemoryCache, REMOTE_CACHE_UPSTREAM};
use crate::config::{CacheStrategy, EngineConfig};
use crate::document::{ContentType, DecisionTree, EscalationPath, EscalationStep};
use crate::error::{EngineError, Result};
use crate::feedback::FeedbackStore;
use crate::health::{EngineHealth, HealthMonitor};
use crate::index::{ChangeSet, Indexer, RunbookDetector};
use crate::matcher::{
    FanOut, FanOutOutcome, FanOutRequest, FanOutTarget, MatchReason, Matcher, PartialFailure,
    RunbookMatch, SearchResult,
};
use crate::metrics::EngineMetrics;
use crate::retry::RetryPolicy;
use crate::tools::{
    GetDecisionTreeArgs, GetEscalationPathArgs, GetProcedureArgs, ListSourcesArgs, ProcedureView,
    RecordFeedbackArgs, ResponseEnvelope, SearchKnowledgeBaseArgs, SearchRunbooksArgs,
    SourceSummary, ToolName,
};

/// The rundex runtime engine.
pub struct Engine {
    config: EngineConfig,
    handles: Vec<Arc<AdapterHandle>>,
    breakers: Arc<BreakerRegistry>,
    cache: Arc<HybridCache>,
    indexer: Arc<Indexer>,
    matcher: Matcher,
    fan_out: FanOut,
    monitor: Arc<HealthMonitor>,
    metrics: EngineMetrics,
    feedback: FeedbackStore,
    default_deadline: Duration,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Engine {
    /// Validate configuration, construct and initialize adapters, seed the
    /// index, spawn background tasks, and run warmup.
    ///
    /// # Errors
    ///
    /// `Configuration` when the config is invalid, a source references an
    /// unregistered adapter type, or every configured adapter fails to
    /// initialize.
    pub async fn start(config: EngineConfig, registry: &AdapterRegistry) -> Result<Arc<Self>> {
        config.validate()?;

        let breakers = Arc::new(BreakerRegistry::new());
        if let Some(remote) = &config.cache.remote {
            breakers.register(REMOTE_CACHE_UPSTREAM, &remote.breaker);
        }

        let cache = Arc::new(Self::build_cache(&config, breakers.clone()).await);

        // Construct every enabled adapter through its factory; the registry
        // freezes afterwards.
        let mut handles = Vec::new();
        for source in config.sources.iter().filter(|s| s.enabled) {
            let adapter = registry.create(source)?;
            breakers.register(&source.name, &source.breaker);
            handles.push(Arc::new(AdapterHandle::new(adapter, source.clone())));
        }
        registry.freeze();

        let mut ready = 0usize;
        for handle in &handles {
            handle.set_state(AdapterState::Initializing);
            match handle.adapter.initialize().await {
                Ok(()) => {
                    handle.set_state(AdapterState::Ready);
                    ready += 1;
                }
                Err(err) => {
                    tracing::error!(adapter = %handle.name, error = %err, "adapter initialization failed");
                    handle.set_state(AdapterState::Failed);
                }
            }
        }
        if !handles.is_empty() && ready == 0 {
            return Err(EngineError::Configuration(
                "no adapter initialized successfully".to_string(),
            ));
        }

        let perf = &config.performance;
        let detector = RunbookDetector::new(perf.runbook_markers.clone());
        let indexer = Arc::new(Indexer::new(
            detector,
            perf.checkpoint_dir.as_ref().map(std::path::PathBuf::from),
        ));
        for handle in &handles {
            if let Err(err) = indexer.load_checkpoint(&handle.name) {
                tracing::warn!(adapter = %handle.name, error = %err, "checkpoint load failed");
            }
        }

        let monitor = Arc::new(HealthMonitor::new(
            Duration::from_secs(perf.health_window_seconds),
            breakers.clone(),
        ));
        let metrics = EngineMetrics::new()?;
        let fan_out = FanOut::new(
            breakers.clone(),
            Arc::new(Semaphore::new(perf.global_concurrency)),
            perf.per_call_concurrency,
            RetryPolicy::exponential(perf.retry_max_attempts),
        );

        let (shutdown_tx, _) = watch::channel(false);
        let engine = Arc::new(Self {
            matcher: Matcher::from_config(perf),
            default_deadline: Duration::from_secs(perf.default_timeout_seconds),
            config,
            handles,
            breakers,
            cache,
            indexer,
            fan_out,
            monitor,
            metrics,
            feedback: FeedbackStore::new(),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });

        // First index pass before serving, so startup queries see a corpus.
        engine.refresh_all(false).await;
        engine.spawn_background_tasks().await;
        engine.warmup().await;

        tracing::info!(
            adapters = engine.handles.len(),
            corpus_size = engine.indexer.document_count(),
            corpus_epoch = engine.indexer.epoch(),
            "engine started"
        );
        Ok(engine)
    }

    async fn build_cache(config: &EngineConfig, breakers: Arc<BreakerRegistry>) -> HybridCache {
        let memory = Arc::new(MemoryCache::new(config.cache.memory.max_entries));
        let want_remote = config.cache.strategy == CacheStrategy::Hybrid
            && config.cache.remote.is_some();
        if !want_remote {
            return HybridCache::new(memory, None, breakers);
        }

        #[cfg(feature = "redis")]
        if let Some(remote_cfg) = &config.cache.remote {
            match crate::cache::RedisCache::connect(&remote_cfg.url, &remote_cfg.prefix).await {
                Ok(remote) => {
                    tracing::info!(url = %remote_cfg.url, "remote cache tier connected");
                    return HybridCache::new(memory, Some(Arc::new(remote)), breakers);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "remote cache unavailable; running memory-only");
                }
            }
        }
        #[cfg(not(feature = "redis"))]
        tracing::warn!("remote cache configured but the redis feature is disabled; running memory-only");

        HybridCache::new(memory, None, breakers)
    }

    async fn spawn_background_tasks(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;

        for handle in &self.handles {
            if handle.state() == AdapterState::Failed {
                continue;
            }
            let engine = self.clone();
            let name = handle.name.clone();
            let interval = Duration::from_secs(handle.config.refresh_interval_seconds.max(1));
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let _ = engine.refresh_adapter(&name, false).await;
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        let engine = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let health_interval =
            Duration::from_secs(self.config.performance.health_interval_seconds.max(1));
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(health_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for handle in &engine.handles {
                            if handle.state() != AdapterState::Failed {
                                engine.monitor.probe(handle).await;
                            }
                        }
                        engine.refresh_gauges().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    async fn refresh_gauges(&self) {
        self.metrics
            .corpus_documents
            .set(self.indexer.document_count() as i64);
        self.metrics.corpus_epoch.set(self.indexer.epoch() as i64);
        let stats = self.cache.memory_stats().await;
        self.metrics.cache_memory_entries.set(stats.entries as i64);
        for handle in &self.handles {
            let state = match self.breakers.state(&handle.name) {
                CircuitState::Closed => 0,
                CircuitState::HalfOpen => 1,
                CircuitState::Open => 2,
            };
            self.metrics
                .breaker_state
                .with_label_values(&[&handle.name])
                .set(state);
        }
        // Memory pressure response: trim hard when the tier sits at
        // capacity.
        if stats.entries as usize >= self.config.cache.memory.max_entries {
            self.cache.trim_memory().await;
        }
    }

    /// Proactively populate the cache for configured high-priority content.
    /// Bounded by the warmup deadline; failures degrade startup but never
    /// block readiness.
    async fn warmup(self: &Arc<Self>) {
        let targets = self.config.warmup_targets();
        if targets.is_empty() {
            return;
        }
        let deadline = Duration::from_secs(self.config.performance.warmup_deadline_seconds);
        let engine = self.clone();
        let run = async move {
            for (content_type, alert_types) in targets {
                for alert_type in alert_types {
                    let args = SearchRunbooksArgs {
                        alert_type: alert_type.clone(),
                        severity: None,
                        affected_systems: vec![],
                        context: HashMap::new(),
                        max_results: None,
                        min_confidence: None,
                    };
                    if let Err(err) = engine.search_runbooks(args, None).await {
                        tracing::warn!(
                            content_type = content_type.as_str(),
                            alert_type = %alert_type,
                            error = %err,
                            "warmup query failed"
                        );
                    }
                }
            }
        };
        if tokio::time::timeout(deadline, run).await.is_err() {
            tracing::warn!(
                deadline_secs = deadline.as_secs(),
                "warmup deadline elapsed; continuing with partial cache"
            );
        }
    }

    /// Stop background tasks and release every adapter's resources.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }

        for handle in &self.handles {
            handle.set_state(AdapterState::ShuttingDown);
            if let Err(err) = handle.adapter.cleanup().await {
                tracing::warn!(adapter = %handle.name, error = %err, "adapter cleanup failed");
            }
        }
        tracing::info!("engine shut down");
    }

    // ========================================================================
    // Indexing
    // ========================================================================

    /// Run one refresh pass for a single adapter. Returns the change set,
    /// or `None` when a pass is already in flight.
    pub async fn refresh_adapter(&self, name: &str, force: bool) -> Option<ChangeSet> {
        let handle = self.handles.iter().find(|h| h.name == name)?.clone();
        let _guard = self.indexer.try_begin_pass(name)?;

        let admission = self.breakers.admit(name);
        if admission == Admission::Rejected {
            self.indexer.record_pass_failure(name);
            self.metrics
                .refresh_passes_total
                .with_label_values(&[name, "breaker_open"])
                .inc();
            return None;
        }
        let was_probe = admission == Admission::Probe;

        let timeout = self.breakers.call_timeout(name);
        let started = Instant::now();
        let result = tokio::time::timeout(timeout, handle.adapter.enumerate(force)).await;
        let latency = started.elapsed();

        match result {
            Ok(Ok(inventory)) => {
                self.breakers.record(name, was_probe, true);
                self.monitor.record_call(name, true, latency);
                let change_set = self
                    .indexer
                    .apply_inventory(
                        name,
                        inventory,
                        handle.config.deletion_policy,
                        chrono::Duration::seconds(handle.config.deletion_grace_seconds as i64),
                    )
                    .await;
                self.metrics
                    .refresh_passes_total
                    .with_label_values(&[name, "ok"])
                    .inc();
                self.metrics.corpus_epoch.set(self.indexer.epoch() as i64);
                self.metrics
                    .corpus_documents
                    .set(self.indexer.document_count() as i64);
                Some(change_set)
            }
            Ok(Err(err)) => {
                tracing::warn!(adapter = %name, error = %err, "enumeration failed");
                self.breakers.record(name, was_probe, false);
                self.monitor.record_call(name, false, latency);
                self.indexer.record_pass_failure(name);
                self.metrics
                    .refresh_passes_total
                    .with_label_values(&[name, "error"])
                    .inc();
                None
            }
            Err(_) => {
                tracing::warn!(adapter = %name, timeout_ms = timeout.as_millis() as u64, "enumeration timed out");
                self.breakers.record(name, was_probe, false);
                self.monitor.record_call(name, false, latency);
                self.indexer.record_pass_failure(name);
                self.metrics
                    .refresh_passes_total
                    .with_label_values(&[name, "timeout"])
                    .inc();
                None
            }
        }
    }

    /// Refresh every non-failed adapter (engine-wide manual trigger).
    pub async fn refresh_all(&self, force: bool) {
        for handle in &self.handles {
            if handle.state() != AdapterState::Failed {
                self.refresh_adapter(&handle.name, force).await;
            }
        }
    }

    // ========================================================================
    // Tool operations
    // ========================================================================

    /// `search_runbooks`: ranked runbooks for a structured alert query.
    pub async fn search_runbooks(
        &self,
        args: SearchRunbooksArgs,
        deadline: Option<Duration>,
    ) -> Result<ResponseEnvelope<Vec<RunbookMatch>>> {
        args.validate()?;
        let started = Instant::now();
        let epoch = self.indexer.epoch();
        let key = cache_key(ToolName::SearchRunbooks.as_str(), &args.normalized(), epoch);

        if let Some(envelope) = self
            .cached::<Vec<RunbookMatch>>(ToolName::SearchRunbooks, &key, epoch, started, &args.normalized())
            .await
        {
            return Ok(envelope);
        }

        let query = RunbookQuery {
            alert_type: args.alert_type.clone(),
            severity: args.severity,
            affected_systems: args.affected_systems.clone(),
            context: args.context.clone(),
        };
        self.matcher.classify(&query)?;

        let overall_deadline = Instant::now() + deadline.unwrap_or(self.default_deadline);
        let (targets, mut failures) = self.eligible_targets();
        let no_sources = targets.is_empty();
        let outcome = self
            .fan_out
            .run(targets, FanOutRequest::Runbooks(query.clone()), overall_deadline)
            .await;
        self.absorb_outcome(&outcome, &mut failures);

        let results = self.matcher.rank_runbooks(
            &query,
            &outcome,
            args.max_results,
            args.min_confidence,
        );

        let confidence_scores: Vec<f64> = results.iter().map(|r| r.confidence).collect();
        let mut envelope = ResponseEnvelope::new(results, epoch);
        envelope.confidence_scores = confidence_scores;
        envelope.degraded = !failures.is_empty();
        envelope.deadline_exceeded = failures.iter().any(|f| f.reason == "partial_timeout");
        if envelope.data.is_empty()
            && outcome.batches.is_empty()
            && (no_sources || !failures.is_empty())
        {
            envelope.match_reasons.push(MatchReason::NoSourcesAvailable);
        }
        envelope.partial_failures = failures;
        envelope.retrieval_time_ms = started.elapsed().as_millis() as u64;

        self.fill_cache(ToolName::SearchRunbooks, &key, &envelope, ContentType::Runbook)
            .await;
        self.log_and_count(ToolName::SearchRunbooks, &args.normalized(), &envelope, started);
        Ok(envelope)
    }

    /// `get_decision_tree`: best decision tree for a scenario tag.
    pub async fn get_decision_tree(
        &self,
        args: GetDecisionTreeArgs,
        _deadline: Option<Duration>,
    ) -> Result<ResponseEnvelope<DecisionTree>> {
        args.validate()?;
        let started = Instant::now();
        let epoch = self.indexer.epoch();
        let key = cache_key(ToolName::GetDecisionTree.as_str(), &args.normalized(), epoch);

        if let Some(envelope) = self
            .cached::<DecisionTree>(ToolName::GetDecisionTree, &key, epoch, started, &args.normalized())
            .await
        {
            return Ok(envelope);
        }

        let snapshot = self.indexer.snapshot();
        let scenario = args.scenario.to_lowercase();
        let keys = snapshot
            .scenarios
            .get(&scenario)
            .ok_or_else(|| EngineError::not_found("decision_tree", &args.scenario))?;

        // Single best match: highest success rate, then adapter priority,
        // then id.
        let mut best: Option<(f64, u32, &crate::document::DocumentKey, DecisionTree)> = None;
        for doc_key in keys {
            let Some(doc) = snapshot.documents.get(doc_key) else {
                continue;
            };
            let Some(runbook) = &doc.runbook else { continue };
            let Some(tree) = &runbook.decision_tree else {
                continue;
            };
            let confidence = runbook.success_rate.unwrap_or(0.9)
                * tree.root.confidence.unwrap_or(0.8);
            let priority = self.priority_of(&doc_key.adapter_name);
            let better = match &best {
                None => true,
                Some((best_conf, best_priority, best_key, _)) => {
                    confidence > *best_conf
                        || (confidence == *best_conf
                            && (priority, &doc_key.id) < (*best_priority, &best_key.id))
                }
            };
            if better {
                best = Some((confidence, priority, doc_key, tree.clone()));
            }
        }

        let (confidence, _, _, tree) =
            best.ok_or_else(|| EngineError::not_found("decision_tree", &args.scenario))?;

        let mut envelope = ResponseEnvelope::new(tree, epoch);
        envelope.confidence_scores = vec![confidence.clamp(0.0, 1.0)];
        envelope.retrieval_time_ms = started.elapsed().as_millis() as u64;

        self.fill_cache(ToolName::GetDecisionTree, &key, &envelope, ContentType::DecisionTree)
            .await;
        self.log_and_count(ToolName::GetDecisionTree, &args.normalized(), &envelope, started);
        Ok(envelope)
    }

    /// `get_procedure`: a procedure by id, or one of its steps.
    pub async fn get_procedure(
        &self,
        args: GetProcedureArgs,
        _deadline: Option<Duration>,
    ) -> Result<ResponseEnvelope<ProcedureView>> {
        args.validate()?;
        let started = Instant::now();
        let epoch = self.indexer.epoch();
        let key = cache_key(ToolName::GetProcedure.as_str(), &args.normalized(), epoch);

        if let Some(envelope) = self
            .cached::<ProcedureView>(ToolName::GetProcedure, &key, epoch, started, &args.normalized())
            .await
        {
            return Ok(envelope);
        }

        let snapshot = self.indexer.snapshot();
        let (_, procedure) = snapshot
            .procedures
            .get(&args.procedure_id)
            .ok_or_else(|| EngineError::not_found("procedure", &args.procedure_id))?;

        let view = match args.step {
            None => ProcedureView::Full(procedure.clone()),
            Some(step) => {
                let found = procedure
                    .steps
                    .iter()
                    .find(|s| s.index == step)
                    .or_else(|| procedure.steps.get(step as usize - 1));
                match found {
                    Some(found) => ProcedureView::Step(found.clone()),
                    None => {
                        return Err(EngineError::not_found(
                            "procedure_step",
                            format!("{}#{step}", args.procedure_id),
                        ))
                    }
                }
            }
        };

        let mut envelope = ResponseEnvelope::new(view, epoch);
        envelope.retrieval_time_ms = started.elapsed().as_millis() as u64;
        self.fill_cache(ToolName::GetProcedure, &key, &envelope, ContentType::Procedure)
            .await;
        self.log_and_count(ToolName::GetProcedure, &args.normalized(), &envelope, started);
        Ok(envelope)
    }

    /// `get_escalation_path`: merged escalation steps for a severity,
    /// honoring the business-hours tri-state.
    pub async fn get_escalation_path(
        &self,
        args: GetEscalationPathArgs,
        _deadline: Option<Duration>,
    ) -> Result<ResponseEnvelope<EscalationPath>> {
        let started = Instant::now();
        let epoch = self.indexer.epoch();
        let key = cache_key(ToolName::GetEscalationPath.as_str(), &args.normalized(), epoch);

        if let Some(envelope) = self
            .cached::<EscalationPath>(ToolName::GetEscalationPath, &key, epoch, started, &args.normalized())
            .await
        {
            return Ok(envelope);
        }

        let snapshot = self.indexer.snapshot();
        let mut candidates: Vec<(u32, &EscalationStep)> = snapshot
            .escalation_steps
            .iter()
            .filter(|(_, step)| step.severity == args.severity)
            .filter(|(_, step)| match (args.business_hours, step.business_hours) {
                // An unconstrained query takes every variant; a constrained
                // one takes matching and variant-free steps.
                (None, _) => true,
                (Some(_), None) => true,
                (Some(requested), Some(step_hours)) => requested == step_hours,
            })
            .map(|(key, step)| (self.priority_of(&key.adapter_name), step))
            .collect();

        if candidates.is_empty() {
            return Err(EngineError::not_found(
                "escalation_path",
                args.severity.as_str(),
            ));
        }

        // Merge across adapters: engagement order by delay, preferring
        // higher-priority adapters; first occurrence of a role wins.
        candidates.sort_by(|(pa, a), (pb, b)| {
            a.delay_minutes
                .unwrap_or(0)
                .cmp(&b.delay_minutes.unwrap_or(0))
                .then(pa.cmp(pb))
                .then_with(|| a.role.cmp(&b.role))
        });
        let mut seen_roles = std::collections::HashSet::new();
        let steps: Vec<EscalationStep> = candidates
            .into_iter()
            .filter(|(_, step)| seen_roles.insert(step.role.to_lowercase()))
            .map(|(_, step)| step.clone())
            .collect();

        let path = EscalationPath {
            severity: args.severity,
            business_hours: args.business_hours,
            steps,
        };

        let mut envelope = ResponseEnvelope::new(path, epoch);
        envelope.retrieval_time_ms = started.elapsed().as_millis() as u64;
        self.fill_cache(ToolName::GetEscalationPath, &key, &envelope, ContentType::Procedure)
            .await;
        self.log_and_count(ToolName::GetEscalationPath, &args.normalized(), &envelope, started);
        Ok(envelope)
    }

    /// `list_sources`: live view of every enabled source. Never cached.
    pub async fn list_sources(
        &self,
        args: ListSourcesArgs,
    ) -> Result<ResponseEnvelope<Vec<SourceSummary>>> {
        let started = Instant::now();
        let include_health = args.include_health.unwrap_or(false);

        let snapshot = self.indexer.snapshot();
        let mut summaries = Vec::with_capacity(self.handles.len());
        for handle in &self.handles {
            let last_updated = self.indexer.last_pass_at(&handle.name);
            // A source whose first refresh has not completed reports as
            // initializing with an empty corpus.
            let status = if last_updated.is_none() && handle.state() == AdapterState::Ready {
                "initializing".to_string()
            } else {
                handle.state().to_string()
            };
            summaries.push(SourceSummary {
                name: handle.name.clone(),
                adapter_type: handle.config.adapter_type.clone(),
                document_count: snapshot.count_for_adapter(&handle.name),
                last_updated,
                status,
                health: include_health
                    .then(|| self.monitor.adapter_snapshot(&handle.name)),
            });
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name));

        let mut envelope = ResponseEnvelope::new(summaries, self.indexer.epoch());
        envelope.retrieval_time_ms = started.elapsed().as_millis() as u64;
        self.log_and_count(
            ToolName::ListSources,
            &serde_json::json!({"include_health": include_health}),
            &envelope,
            started,
        );
        Ok(envelope)
    }

    /// `search_knowledge_base`: free-text search across adapters.
    pub async fn search_knowledge_base(
        &self,
        args: SearchKnowledgeBaseArgs,
        deadline: Option<Duration>,
    ) -> Result<ResponseEnvelope<Vec<SearchResult>>> {
        args.validate()?;
        let started = Instant::now();
        let epoch = self.indexer.epoch();
        let key = cache_key(
            ToolName::SearchKnowledgeBase.as_str(),
            &args.normalized(),
            epoch,
        );

        if let Some(envelope) = self
            .cached::<Vec<SearchResult>>(ToolName::SearchKnowledgeBase, &key, epoch, started, &args.normalized())
            .await
        {
            return Ok(envelope);
        }

        let filters = args.filters.clone().unwrap_or_default();
        let overall_deadline = Instant::now() + deadline.unwrap_or(self.default_deadline);
        let (mut targets, mut failures) = self.eligible_targets();
        if let Some(source) = &filters.source {
            targets.retain(|t| &t.handle.name == source);
            failures.retain(|f| &f.adapter_name == source);
        }
        let no_sources = targets.is_empty();
        let outcome = self
            .fan_out
            .run(
                targets,
                FanOutRequest::Knowledge {
                    query: args.query.clone(),
                    filters: filters.clone(),
                },
                overall_deadline,
            )
            .await;
        self.absorb_outcome(&outcome, &mut failures);

        let mut results = self.matcher.rank_knowledge(
            &args.query,
            &outcome,
            filters.max_results,
            filters.min_confidence,
        );
        if let Some(document_type) = &filters.document_type {
            let wanted = document_type.to_lowercase();
            results.retain(|r| r.document.content_type.as_str() == wanted);
        }

        let confidence_scores: Vec<f64> = results.iter().map(|r| r.confidence).collect();
        let mut envelope = ResponseEnvelope::new(results, epoch);
        envelope.confidence_scores = confidence_scores;
        envelope.degraded = !failures.is_empty();
        envelope.deadline_exceeded = failures.iter().any(|f| f.reason == "partial_timeout");
        if envelope.data.is_empty()
            && outcome.batches.is_empty()
            && (no_sources || !failures.is_empty())
        {
            envelope.match_reasons.push(MatchReason::NoSourcesAvailable);
        }
        envelope.partial_failures = failures;
        envelope.retrieval_time_ms = started.elapsed().as_millis() as u64;

        self.fill_cache(
            ToolName::SearchKnowledgeBase,
            &key,
            &envelope,
            ContentType::KnowledgeBase,
        )
        .await;
        self.log_and_count(ToolName::SearchKnowledgeBase, &args.normalized(), &envelope, started);
        Ok(envelope)
    }

    /// `record_resolution_feedback`: append-only. Never cached.
    pub async fn record_resolution_feedback(
        &self,
        args: RecordFeedbackArgs,
    ) -> Result<ResponseEnvelope<crate::feedback::RecordedFeedback>> {
        args.validate()?;
        let started = Instant::now();

        let recorded = self
            .feedback
            .record(
                &args.incident_id,
                args.outcome.resolution_seconds,
                args.outcome.success,
                args.outcome.method.clone(),
                args.feedback.clone(),
            )
            .await;

        let mut envelope = ResponseEnvelope::new(recorded, self.indexer.epoch());
        envelope.retrieval_time_ms = started.elapsed().as_millis() as u64;
        self.log_and_count(
            ToolName::RecordResolutionFeedback,
            &serde_json::json!({"incident_id": args.incident_id}),
            &envelope,
            started,
        );
        Ok(envelope)
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Engine-level health with per-adapter summaries. Served from cached
    /// monitor snapshots; never probes.
    pub fn health(&self) -> EngineHealth {
        let names: Vec<String> = self.handles.iter().map(|h| h.name.clone()).collect();
        self.monitor
            .engine_health(&names, self.cache.remote_operable())
    }

    /// Prometheus text exposition of all engine metrics.
    pub fn metrics_text(&self) -> Result<String> {
        self.metrics.gather()
    }

    /// Explicitly reset metrics counters.
    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    /// Current corpus epoch.
    pub fn corpus_epoch(&self) -> u64 {
        self.indexer.epoch()
    }

    /// Feedback history for one incident, in record order.
    pub async fn feedback_history(
        &self,
        incident_id: &str,
    ) -> Vec<crate::document::Feedback> {
        self.feedback.history(incident_id).await
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn priority_of(&self, adapter_name: &str) -> u32 {
        self.handles
            .iter()
            .find(|h| h.name == adapter_name)
            .map(|h| h.priority())
            .unwrap_or(u32::MAX)
    }

    /// Fan-out targets: unhealthy and failed adapters are excluded (and
    /// reported), degraded adapters are queried with tagging.
    fn eligible_targets(&self) -> (Vec<FanOutTarget>, Vec<PartialFailure>) {
        let mut targets = Vec::new();
        let mut failures = Vec::new();
        for handle in &self.handles {
            match handle.state() {
                AdapterState::Ready => targets.push(FanOutTarget {
                    handle: handle.clone(),
                    degraded: false,
                }),
                AdapterState::Degraded => {
                    let snapshot = self.monitor.adapter_snapshot(&handle.name);
                    if snapshot.status == crate::health::HealthStatus::Unhealthy {
                        failures.push(PartialFailure {
                            adapter_name: handle.name.clone(),
                            reason: "unhealthy".to_string(),
                        });
                    } else {
                        targets.push(FanOutTarget {
                            handle: handle.clone(),
                            degraded: true,
                        });
                    }
                }
                AdapterState::Failed => failures.push(PartialFailure {
                    adapter_name: handle.name.clone(),
                    reason: "failed".to_string(),
                }),
                _ => failures.push(PartialFailure {
                    adapter_name: handle.name.clone(),
                    reason: "unavailable".to_string(),
                }),
            }
        }
        (targets, failures)
    }

    /// Feed fan-out call outcomes into health and metrics, and collect its
    /// failures.
    fn absorb_outcome(&self, outcome: &FanOutOutcome, failures: &mut Vec<PartialFailure>) {
        for (adapter, ok, latency) in &outcome.calls {
            self.monitor.record_call(adapter, *ok, *latency);
            self.metrics
                .adapter_calls_total
                .with_label_values(&[adapter, if *ok { "ok" } else { "error" }])
                .inc();
            self.metrics
                .adapter_duration_seconds
                .with_label_values(&[adapter])
                .observe(latency.as_secs_f64());
        }
        failures.extend(outcome.failures.iter().cloned());
    }

    /// Cache read path shared by the cacheable tools.
    async fn cached<T: serde::de::DeserializeOwned>(
        &self,
        tool: ToolName,
        key: &str,
        epoch: u64,
        started: Instant,
        args_digest: &serde_json::Value,
    ) -> Option<ResponseEnvelope<T>> {
        let (bytes, tier) = self.cache.get(key).await?;
        let cached: CachedPayloadOwned<T> = match serde_json::from_slice(&bytes) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(tool = %tool, error = %err, "cache payload decode failed; treating as miss");
                return None;
            }
        };

        self.metrics
            .cache_hits_total
            .with_label_values(&[match tier {
                CacheTier::Memory => "memory",
                CacheTier::Remote => "remote",
            }])
            .inc();

        let mut envelope = ResponseEnvelope::new(cached.data, epoch);
        envelope.confidence_scores = cached.confidence_scores;
        envelope.cache_hit = true;
        envelope.retrieval_time_ms = started.elapsed().as_millis() as u64;
        self.log_and_count(tool, args_digest, &envelope, started);
        Some(envelope)
    }

    /// Cache fill path: complete (non-degraded) responses only.
    async fn fill_cache<T: serde::Serialize>(
        &self,
        tool: ToolName,
        key: &str,
        envelope: &ResponseEnvelope<T>,
        content_type: ContentType,
    ) {
        self.metrics.cache_misses_total.inc();
        if envelope.degraded {
            return;
        }
        let payload = CachedPayload {
            data: &envelope.data,
            confidence_scores: envelope.confidence_scores.clone(),
        };
        match serde_json::to_vec(&payload) {
            Ok(bytes) => {
                self.cache
                    .put(key, bytes, self.config.ttl_for(content_type))
                    .await;
            }
            Err(err) => {
                tracing::warn!(tool = %tool, error = %err, "cache payload encode failed");
            }
        }
    }

    /// Per-call structured log line and tool metrics. Argument values are
    /// digested, never logged raw.
    fn log_and_count<T>(
        &self,
        tool: ToolName,
        normalized_args: &serde_json::Value,
        envelope: &ResponseEnvelope<T>,
        started: Instant,
    ) {
        let mut hasher = Sha256::new();
        hasher.update(normalized_args.to_string().as_bytes());
        let digest = hex::encode(&hasher.finalize()[..8]);

        let status = if envelope.degraded { "degraded" } else { "ok" };
        self.metrics
            .tool_requests_total
            .with_label_values(&[tool.as_str(), status])
            .inc();
        self.metrics
            .tool_duration_seconds
            .with_label_values(&[tool.as_str()])
            .observe(started.elapsed().as_secs_f64());

        tracing::info!(
            correlation_id = %envelope.correlation_id,
            tool = %tool,
            args_digest = %digest,
            duration_ms = envelope.retrieval_time_ms,
            status = %status,
            cache_hit = envelope.cache_hit,
            adapters_failed = envelope.partial_failures.len(),
            corpus_epoch = envelope.corpus_epoch,
            "tool call"
        );
    }
}

/// Cacheable portion of a response; the envelope itself is rebuilt per
/// call so correlation ids and timings stay fresh.
#[derive(serde::Serialize)]
struct CachedPayload<'a, T: serde::Serialize> {
    data: &'a T,
    confidence_scores: Vec<f64>,
}

#[derive(serde::Deserialize)]
struct CachedPayloadOwned<T> {
    data: T,
    confidence_scores: Vec<f64>,
}
