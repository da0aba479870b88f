//! Mock source adapter for testing the engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use rundex::adapter::{
    AdapterMetadata, AdapterProbe, AdapterState, RunbookQuery, ScoredHit, SearchFilters,
    SourceAdapter,
};
use rundex::document::{ContentType, Document, Runbook, Severity};
use rundex::error::{EngineError, Result};

/// A configurable mock source adapter.
///
/// # Example
///
/// ```rust,ignore
/// use rundex_testing::MockAdapter;
///
/// let adapter = MockAdapter::builder("wiki")
///     .with_runbook("rb-disk", "Disk cleanup", &["disk_space_critical"], &[Severity::Critical], 0.92)
///     .with_relevance(0.6)
///     .build();
///
/// adapter.fail_next("connection reset");
/// ```
pub struct MockAdapter {
    name: String,
    /// Documents returned by search/enumeration, in insertion order.
    documents: Mutex<Vec<Document>>,
    /// Scripted inventories, one per enumeration pass. When exhausted, the
    /// adapter falls back to `documents`.
    scripted_passes: Mutex<Vec<Vec<Document>>>,
    /// Base relevance score attached to every hit.
    relevance: Mutex<f64>,
    /// Artificial latency applied to every call.
    latency: Mutex<Duration>,
    /// Pending failures: each call consumes one.
    pending_failures: Mutex<Vec<EngineError>>,
    /// Whether health checks report healthy.
    healthy: Mutex<bool>,
    /// Calls by operation name.
    call_counts: Mutex<HashMap<&'static str, usize>>,
    /// Whether initialize should fail.
    fail_initialize: Mutex<bool>,
    cleaned_up: Mutex<bool>,
}

impl MockAdapter {
    /// Start building a mock adapter with the given source name.
    pub fn builder(name: impl Into<String>) -> MockAdapterBuilder {
        MockAdapterBuilder {
            name: name.into(),
            documents: Vec::new(),
            relevance: 0.6,
            latency: Duration::ZERO,
        }
    }

    /// Queue a transient failure for the next adapter call.
    pub fn fail_next(&self, message: impl Into<String>) {
        self.pending_failures
            .lock()
            .push(EngineError::Transient(message.into()));
    }

    /// Queue `n` transient failures.
    pub fn fail_times(&self, n: usize, message: impl Into<String>) {
        let message = message.into();
        let mut failures = self.pending_failures.lock();
        for _ in 0..n {
            failures.push(EngineError::Transient(message.clone()));
        }
    }

    /// Queue a permanent failure for the next adapter call.
    pub fn fail_next_permanent(&self, message: impl Into<String>) {
        self.pending_failures
            .lock()
            .push(EngineError::Permanent(message.into()));
    }

    /// Set health probe outcome.
    pub fn set_healthy(&self, healthy: bool) {
        *self.healthy.lock() = healthy;
    }

    /// Make initialize fail.
    pub fn set_fail_initialize(&self, fail: bool) {
        *self.fail_initialize.lock() = fail;
    }

    /// Artificial per-call latency.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Replace the document corpus.
    pub fn set_documents(&self, documents: Vec<Document>) {
        *self.documents.lock() = documents;
    }

    /// Script the inventories returned by the next enumeration passes, in
    /// order. After the script runs out, enumeration returns the standing
    /// corpus again.
    pub fn script_passes(&self, passes: Vec<Vec<Document>>) {
        *self.scripted_passes.lock() = passes;
    }

    /// Number of calls made to one operation (`search`, `enumerate`, ...).
    pub fn call_count(&self, operation: &str) -> usize {
        self.call_counts.lock().get(operation).copied().unwrap_or(0)
    }

    /// Whether cleanup has run.
    pub fn cleaned_up(&self) -> bool {
        *self.cleaned_up.lock()
    }

    /// Convenience: a runbook-bearing document.
    pub fn runbook_document(
        id: &str,
        title: &str,
        alert_types: &[&str],
        severities: &[Severity],
        success_rate: f64,
    ) -> Document {
        Document {
            id: id.to_string(),
            adapter_name: String::new(),
            title: title.to_string(),
            body: format!("Runbook body for {title}"),
            content_type: ContentType::Runbook,
            metadata: HashMap::new(),
            runbook: Some(Runbook {
                alert_types: alert_types.iter().map(|s| s.to_string()).collect(),
                severities: severities.to_vec(),
                affected_systems: vec![],
                decision_tree: None,
                procedures: vec![],
                escalation: vec![],
                success_rate: Some(success_rate),
                avg_resolution_seconds: None,
            }),
            last_seen_at: Utc::now(),
        }
    }

    async fn before_call(&self, operation: &'static str) -> Result<()> {
        *self.call_counts.lock().entry(operation).or_insert(0) += 1;
        let latency = *self.latency.lock();
        if latency > Duration::ZERO {
            tokio::time::sleep(latency).await;
        }
        let failure = self.pending_failures.lock().pop();
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SourceAdapter for MockAdapter {
    async fn initialize(&self) -> Result<()> {
        if *self.fail_initialize.lock() {
            return Err(EngineError::Permanent("mock initialize failure".into()));
        }
        Ok(())
    }

    async fn search(&self, query: &str, filters: &SearchFilters) -> Result<Vec<ScoredHit>> {
        self.before_call("search").await?;
        let relevance = *self.relevance.lock();
        let query = query.to_lowercase();
        let tokens: Vec<&str> = query.split_whitespace().collect();
        let max = filters.max_results.unwrap_or(usize::MAX);
        Ok(self
            .documents
            .lock()
            .iter()
            .filter(|doc| {
                let text = format!("{} {}", doc.title, doc.body).to_lowercase();
                tokens.iter().any(|t| text.contains(t))
            })
            .take(max)
            .map(|doc| ScoredHit {
                document: doc.clone(),
                score: relevance,
            })
            .collect())
    }

    async fn get_document(&self, id: &str) -> Result<Document> {
        self.before_call("get_document").await?;
        self.documents
            .lock()
            .iter()
            .find(|doc| doc.id == id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("document", id))
    }

    async fn search_runbooks(&self, query: &RunbookQuery) -> Result<Vec<ScoredHit>> {
        self.before_call("search_runbooks").await?;
        let relevance = *self.relevance.lock();
        let alert = query.alert_type.to_lowercase();
        Ok(self
            .documents
            .lock()
            .iter()
            .filter(|doc| {
                doc.runbook.as_ref().is_some_and(|rb| {
                    rb.alert_types.iter().any(|a| a.to_lowercase() == alert)
                })
            })
            .map(|doc| ScoredHit {
                document: doc.clone(),
                score: relevance,
            })
            .collect())
    }

    async fn health_check(&self) -> AdapterProbe {
        *self.call_counts.lock().entry("health_check").or_insert(0) += 1;
        let latency = *self.latency.lock();
        if latency > Duration::ZERO {
            tokio::time::sleep(latency).await;
        }
        if *self.healthy.lock() {
            AdapterProbe::ok()
        } else {
            AdapterProbe::failed("mock unhealthy")
        }
    }

    async fn get_metadata(&self) -> AdapterMetadata {
        AdapterMetadata {
            name: self.name.clone(),
            adapter_type: "mock".to_string(),
            document_count: self.documents.lock().len(),
            last_updated: Some(Utc::now()),
            status: AdapterState::Ready,
        }
    }

    async fn enumerate(&self, _force: bool) -> Result<Vec<Document>> {
        self.before_call("enumerate").await?;
        let scripted = {
            let mut passes = self.scripted_passes.lock();
            if passes.is_empty() {
                None
            } else {
                Some(passes.remove(0))
            }
        };
        Ok(scripted.unwrap_or_else(|| self.documents.lock().clone()))
    }

    async fn cleanup(&self) -> Result<()> {
        *self.cleaned_up.lock() = true;
        Ok(())
    }
}

/// Builder for [`MockAdapter`].
pub struct MockAdapterBuilder {
    name: String,
    documents: Vec<Document>,
    relevance: f64,
    latency: Duration,
}

impl MockAdapterBuilder {
    /// Add a runbook-bearing document.
    pub fn with_runbook(
        mut self,
        id: &str,
        title: &str,
        alert_types: &[&str],
        severities: &[Severity],
        success_rate: f64,
    ) -> Self {
        self.documents.push(MockAdapter::runbook_document(
            id,
            title,
            alert_types,
            severities,
            success_rate,
        ));
        self
    }

    /// Add an arbitrary document.
    pub fn with_document(mut self, document: Document) -> Self {
        self.documents.push(document);
        self
    }

    /// Base relevance score for every hit (default 0.6).
    pub fn with_relevance(mut self, relevance: f64) -> Self {
        self.relevance = relevance;
        self
    }

    /// Artificial per-call latency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Finish building.
    pub fn build(self) -> Arc<MockAdapter> {
        Arc::new(MockAdapter {
            name: self.name,
            documents: Mutex::new(self.documents),
            scripted_passes: Mutex::new(Vec::new()),
            relevance: Mutex::new(self.relevance),
            latency: Mutex::new(self.latency),
            pending_failures: Mutex::new(Vec::new()),
            healthy: Mutex::new(true),
            call_counts: Mutex::new(HashMap::new()),
            fail_initialize: Mutex::new(false),
            cleaned_up: Mutex::new(false),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_runbook_search_filters_by_alert_type() {
        let adapter = MockAdapter::builder("m")
            .with_runbook(
                "rb1",
                "Disk cleanup",
                &["disk_space_critical"],
                &[Severity::Critical],
                0.9,
            )
            .with_runbook("rb2", "OOM triage", &["memory_pressure"], &[Severity::High], 0.8)
            .build();

        let hits = adapter
            .search_runbooks(&RunbookQuery {
                alert_type: "disk_space_critical".to_string(),
                severity: None,
                affected_systems: vec![],
                context: HashMap::new(),
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document.id, "rb1");
        assert_eq!(adapter.call_count("search_runbooks"), 1);
    }

    #[tokio::test]
    async fn test_fail_next_consumed_once() {
        let adapter = MockAdapter::builder("m").build();
        adapter.fail_next("boom");

        assert!(adapter.enumerate(false).await.is_err());
        assert!(adapter.enumerate(false).await.is_ok());
    }

    #[tokio::test]
    async fn test_scripted_passes_in_order() {
        let adapter = MockAdapter::builder("m")
            .with_runbook("rb1", "Disk", &["disk_space_critical"], &[Severity::High], 0.9)
            .build();
        adapter.script_passes(vec![vec![], vec![]]);

        assert!(adapter.enumerate(false).await.unwrap().is_empty());
        assert!(adapter.enumerate(false).await.unwrap().is_empty());
        // Script exhausted: back to the standing corpus.
        assert_eq!(adapter.enumerate(false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_health_toggle() {
        let adapter = MockAdapter::builder("m").build();
        assert!(adapter.health_check().await.healthy);
        adapter.set_healthy(false);
        assert!(!adapter.health_check().await.healthy);
    }
}
