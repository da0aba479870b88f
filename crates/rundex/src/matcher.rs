//! Query-to-runbook matching.
//!
//! The pipeline: intent check and context enhancement, bounded parallel
//! fan-out across enabled adapters (gated by circuit breakers, bounded by
//! deadlines), per-candidate confidence scoring with explicit match
//! reasons, dedup/merge of the same logical runbook across adapters,
//! deterministic ranking, and cutoff.
//!
//! Confidence is a pure function of the query and the candidate for a
//! given corpus snapshot: identical queries at the same corpus epoch
//! produce identical orderings.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::adapter::{AdapterHandle, RunbookQuery, ScoredHit, SearchFilters};
use crate::breaker::{Admission, BreakerRegistry};
use crate::config::PerformanceConfig;
use crate::document::Document;
use crate::error::EngineError;
use crate::retry::{with_retry, RetryPolicy};

/// Slack reserved at the end of the overall deadline for merging results.
const MERGE_RESERVE: Duration = Duration::from_millis(50);

// ============================================================================
// Match Reasons & Results
// ============================================================================

/// Why a candidate matched (or how it was qualified).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    ExactAlertTypeMatch,
    AliasAlertTypeMatch,
    SeverityMatch,
    SeverityDistance { distance: u8 },
    AffectedSystemMatch { system: String },
    ContextMatch { key: String },
    KeywordMatch { keyword: String },
    TagMatch { tag: String },
    DegradedSource,
    BelowThresholdBestEffort,
    NoSourcesAvailable,
}

/// A ranked runbook match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunbookMatch {
    pub document: Document,
    /// Final confidence in `[0, 1]`.
    pub confidence: f64,
    pub match_reasons: Vec<MatchReason>,
    pub source_adapter: String,
    /// Adapters that returned the same logical runbook at lower confidence.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternate_sources: Vec<String>,
}

/// A ranked knowledge-base result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub document: Document,
    pub confidence: f64,
    pub match_reasons: Vec<MatchReason>,
    pub source_adapter: String,
}

/// One adapter that failed or was excluded during fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialFailure {
    pub adapter_name: String,
    /// Short reason tag: `breaker_open`, `timeout`, `partial_timeout`,
    /// `auth`, `error`, `unhealthy`.
    pub reason: String,
}

// ============================================================================
// Fan-Out
// ============================================================================

/// One adapter targeted by a fan-out.
pub struct FanOutTarget {
    pub handle: Arc<AdapterHandle>,
    /// Results from degraded adapters carry a `degraded_source` tag.
    pub degraded: bool,
}

/// Collected fan-out output before scoring.
#[derive(Debug, Default)]
pub struct FanOutOutcome {
    /// (adapter name, priority, degraded, hits)
    pub batches: Vec<(String, u32, bool, Vec<ScoredHit>)>,
    pub failures: Vec<PartialFailure>,
    /// (adapter name, ok, call latency) for every adapter actually called.
    pub calls: Vec<(String, bool, Duration)>,
}

impl FanOutOutcome {
    pub fn degraded(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Bounded, breaker-gated parallel adapter fan-out.
pub struct FanOut {
    breakers: Arc<BreakerRegistry>,
    global: Arc<Semaphore>,
    per_call: usize,
    retry: RetryPolicy,
}

/// What a fan-out asks each adapter for.
#[derive(Clone)]
pub enum FanOutRequest {
    Runbooks(RunbookQuery),
    Knowledge { query: String, filters: SearchFilters },
}

impl FanOut {
    pub fn new(
        breakers: Arc<BreakerRegistry>,
        global: Arc<Semaphore>,
        per_call: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            breakers,
            global,
            per_call,
            retry,
        }
    }

    /// Query every target in parallel, collecting hits and failures.
    ///
    /// Each adapter call is bounded by the smaller of its breaker timeout
    /// and the remaining overall deadline minus the merge reserve. Late
    /// adapters are cancelled and recorded as `partial_timeout`; the
    /// overall response still returns.
    pub async fn run(
        &self,
        targets: Vec<FanOutTarget>,
        request: FanOutRequest,
        deadline: Instant,
    ) -> FanOutOutcome {
        let per_call = Arc::new(Semaphore::new(self.per_call));
        let mut tasks = Vec::with_capacity(targets.len());

        for target in targets {
            let name = target.handle.name.clone();
            let priority = target.handle.priority();
            let degraded = target.degraded;

            let admission = self.breakers.admit(&name);
            if admission == Admission::Rejected {
                tasks.push(FanOutTask::Rejected(PartialFailure {
                    adapter_name: name,
                    reason: "breaker_open".to_string(),
                }));
                continue;
            }
            let was_probe = admission == Admission::Probe;

            let budget = deadline
                .saturating_duration_since(Instant::now())
                .saturating_sub(MERGE_RESERVE)
                .min(self.breakers.call_timeout(&name));
            if budget.is_zero() {
                if was_probe {
                    self.breakers.release_probe(&name);
                }
                tasks.push(FanOutTask::Rejected(PartialFailure {
                    adapter_name: name,
                    reason: "partial_timeout".to_string(),
                }));
                continue;
            }

            let handle = target.handle.clone();
            let request = request.clone();
            let retry = self.retry.clone();
            let breakers = self.breakers.clone();
            let global = self.global.clone();
            let per_call = per_call.clone();

            let join = tokio::spawn(async move {
                let _global_permit = global.acquire_owned().await;
                let _call_permit = per_call.acquire_owned().await;

                let started = Instant::now();
                let call_deadline = Instant::now() + budget;
                let result = tokio::time::timeout(
                    budget,
                    with_retry(&retry, Some(call_deadline), || {
                        let request = request.clone();
                        let adapter = handle.adapter.clone();
                        async move {
                            match request {
                                FanOutRequest::Runbooks(query) => {
                                    adapter.search_runbooks(&query).await
                                }
                                FanOutRequest::Knowledge { query, filters } => {
                                    adapter.search(&query, &filters).await
                                }
                            }
                        }
                    }),
                )
                .await;

                let latency = started.elapsed();
                match result {
                    Ok(Ok(hits)) => {
                        breakers.record(&handle.name, was_probe, true);
                        (Ok(hits), latency)
                    }
                    Ok(Err(err)) => {
                        breakers.record(&handle.name, was_probe, false);
                        (Err(failure_reason(&err)), latency)
                    }
                    Err(_) => {
                        breakers.record(&handle.name, was_probe, false);
                        (Err("partial_timeout".to_string()), latency)
                    }
                }
            });

            tasks.push(FanOutTask::Running {
                name,
                priority,
                degraded,
                join,
            });
        }

        let mut outcome = FanOutOutcome::default();
        let mut running = Vec::new();
        for task in tasks {
            match task {
                FanOutTask::Rejected(failure) => outcome.failures.push(failure),
                FanOutTask::Running {
                    name,
                    priority,
                    degraded,
                    join,
                } => running.push((name, priority, degraded, join)),
            }
        }

        let joined = futures::future::join_all(
            running.iter_mut().map(|(_, _, _, join)| join),
        )
        .await;
        for ((name, priority, degraded, _), result) in running.into_iter().zip(joined) {
            match result {
                Ok((Ok(hits), latency)) => {
                    outcome.calls.push((name.clone(), true, latency));
                    outcome.batches.push((name, priority, degraded, hits));
                }
                Ok((Err(reason), latency)) => {
                    outcome.calls.push((name.clone(), false, latency));
                    outcome.failures.push(PartialFailure {
                        adapter_name: name,
                        reason,
                    });
                }
                Err(_) => outcome.failures.push(PartialFailure {
                    adapter_name: name,
                    reason: "error".to_string(),
                }),
            }
        }
        outcome
    }
}

type FanOutCallResult = (std::result::Result<Vec<ScoredHit>, String>, Duration);

enum FanOutTask {
    Rejected(PartialFailure),
    Running {
        name: String,
        priority: u32,
        degraded: bool,
        join: tokio::task::JoinHandle<FanOutCallResult>,
    },
}

fn failure_reason(err: &EngineError) -> String {
    match err {
        EngineError::Timeout { .. } => "timeout".to_string(),
        EngineError::CircuitOpen { .. } => "breaker_open".to_string(),
        EngineError::Permanent(msg) if msg.contains("auth") => "auth".to_string(),
        _ => "error".to_string(),
    }
}

// ============================================================================
// Matcher
// ============================================================================

/// Confidence scoring and ranking.
pub struct Matcher {
    pub min_confidence: f64,
    pub max_results: usize,
    system_aliases: HashMap<String, Vec<String>>,
    alert_aliases: HashMap<String, Vec<String>>,
    /// Token-Jaccard threshold above which two titles are the same logical
    /// runbook.
    pub title_similarity: f64,
    quality_bias: bool,
}

impl Matcher {
    pub fn from_config(perf: &PerformanceConfig) -> Self {
        Self {
            min_confidence: perf.min_confidence,
            max_results: perf.max_results,
            system_aliases: lowercase_alias_map(&perf.system_aliases),
            alert_aliases: lowercase_alias_map(&perf.alert_aliases),
            title_similarity: 0.85,
            quality_bias: perf.quality_bias,
        }
    }

    /// Rule-based intent check. Rejects queries that cannot describe an
    /// operational alert.
    pub fn classify(&self, query: &RunbookQuery) -> crate::error::Result<()> {
        let alert = query.alert_type.trim();
        if alert.is_empty() {
            return Err(EngineError::validation("alert_type", "must not be empty"));
        }
        if alert.chars().any(|c| c.is_control()) {
            return Err(EngineError::validation(
                "alert_type",
                "contains control characters",
            ));
        }
        Ok(())
    }

    /// Alert terms to match: the normalized alert type plus its aliases.
    /// The first entry is always the exact term.
    pub fn alert_terms(&self, alert_type: &str) -> Vec<String> {
        let exact = alert_type.to_lowercase();
        let mut terms = vec![exact.clone()];
        if let Some(aliases) = self.alert_aliases.get(&exact) {
            terms.extend(aliases.iter().cloned());
        }
        terms
    }

    /// Affected systems expanded with configured aliases.
    pub fn expand_systems(&self, systems: &[String]) -> Vec<String> {
        let mut expanded: Vec<String> = Vec::new();
        for system in systems {
            let lower = system.to_lowercase();
            if !expanded.contains(&lower) {
                expanded.push(lower.clone());
            }
            if let Some(aliases) = self.system_aliases.get(&lower) {
                for alias in aliases {
                    if !expanded.contains(alias) {
                        expanded.push(alias.clone());
                    }
                }
            }
        }
        expanded
    }

    /// Score one runbook candidate. Returns `None` when the candidate's
    /// alert types are disjoint from the query (and its aliases).
    pub fn score_runbook(
        &self,
        query: &RunbookQuery,
        hit: &ScoredHit,
    ) -> Option<(f64, Vec<MatchReason>)> {
        let runbook = hit.document.runbook.as_ref()?;
        let mut reasons = Vec::new();

        let candidate_alerts: HashSet<String> = runbook
            .alert_types
            .iter()
            .map(|a| a.to_lowercase())
            .collect();
        let terms = self.alert_terms(&query.alert_type);
        let exact = candidate_alerts.contains(&terms[0]);
        let via_alias = !exact && terms[1..].iter().any(|t| candidate_alerts.contains(t));
        if !exact && !via_alias {
            return None;
        }

        let mut score = hit.score.clamp(0.0, 1.0);
        if exact {
            score += 0.35;
            reasons.push(MatchReason::ExactAlertTypeMatch);
        } else {
            score += 0.20;
            reasons.push(MatchReason::AliasAlertTypeMatch);
        }

        if let Some(severity) = query.severity {
            if runbook.severities.contains(&severity) {
                score += 0.20;
                reasons.push(MatchReason::SeverityMatch);
            } else if let Some(distance) = runbook
                .severities
                .iter()
                .map(|s| s.distance(severity))
                .min()
            {
                score -= 0.05 * f64::from(distance);
                reasons.push(MatchReason::SeverityDistance { distance });
            }
        }

        let systems = self.expand_systems(&query.affected_systems);
        let candidate_systems: HashSet<String> = runbook
            .affected_systems
            .iter()
            .map(|s| s.to_lowercase())
            .collect();
        let mut system_bonus = 0.0;
        for system in &systems {
            if candidate_systems.contains(system) && system_bonus < 0.25 {
                system_bonus = (system_bonus + 0.10_f64).min(0.25);
                reasons.push(MatchReason::AffectedSystemMatch {
                    system: system.clone(),
                });
            }
        }
        score += system_bonus;

        let mut context_bonus = 0.0;
        for (key, value) in &query.context {
            if hit.document.metadata.get(key) == Some(value) && context_bonus < 0.10 {
                context_bonus = (context_bonus + 0.05_f64).min(0.10);
                reasons.push(MatchReason::ContextMatch { key: key.clone() });
            }
        }
        score += context_bonus;

        score *= runbook.success_rate.unwrap_or(0.9);

        if self.quality_bias {
            if let Some(quality) = hit
                .document
                .metadata
                .get("quality_score")
                .and_then(|v| v.as_u64())
            {
                score *= 0.9 + 0.01 * quality as f64;
            }
        }

        Some((score.clamp(0.0, 1.0), reasons))
    }

    /// Score, dedup, rank, and cut a fan-out's runbook batches.
    pub fn rank_runbooks(
        &self,
        query: &RunbookQuery,
        outcome: &FanOutOutcome,
        max_results: Option<usize>,
        min_confidence: Option<f64>,
    ) -> Vec<RunbookMatch> {
        let mut candidates: Vec<(u32, RunbookMatch)> = Vec::new();

        for (adapter, priority, degraded, hits) in &outcome.batches {
            for hit in hits {
                let Some((confidence, mut reasons)) = self.score_runbook(query, hit) else {
                    continue;
                };
                if *degraded {
                    reasons.push(MatchReason::DegradedSource);
                }
                candidates.push((
                    *priority,
                    RunbookMatch {
                        document: hit.document.clone(),
                        confidence,
                        match_reasons: reasons,
                        source_adapter: adapter.clone(),
                        alternate_sources: Vec::new(),
                    },
                ));
            }
        }

        let mut merged = self.dedup(candidates);

        merged.sort_by(|(pa, a), (pb, b)| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(pa.cmp(pb))
                .then_with(|| {
                    let ra = avg_resolution(&a.document);
                    let rb = avg_resolution(&b.document);
                    ra.cmp(&rb)
                })
                .then_with(|| a.document.id.cmp(&b.document.id))
        });

        let mut results: Vec<RunbookMatch> = merged.into_iter().map(|(_, m)| m).collect();

        let threshold = min_confidence.unwrap_or(self.min_confidence);
        let passing: Vec<RunbookMatch> = results
            .iter()
            .filter(|m| m.confidence >= threshold)
            .cloned()
            .collect();

        // Best-effort inclusion: nothing passed, but exactly one candidate
        // sits above half the threshold.
        if passing.is_empty() {
            let mut near: Vec<RunbookMatch> = results
                .drain(..)
                .filter(|m| m.confidence >= threshold / 2.0)
                .collect();
            if near.len() == 1 {
                let mut only = near.remove(0);
                only.match_reasons.push(MatchReason::BelowThresholdBestEffort);
                return vec![only];
            }
            return Vec::new();
        }
        results = passing;

        let cap = max_results.unwrap_or(self.max_results);
        if results.len() > cap {
            if cap == 0 {
                return Vec::new();
            }
            // Keep boundary ties rather than dropping arbitrarily.
            let boundary = results[cap - 1].confidence;
            let keep = results
                .iter()
                .take_while(|m| {
                    m.confidence > boundary || (m.confidence - boundary).abs() < f64::EPSILON
                })
                .count()
                .max(cap);
            results.truncate(keep);
        }
        results
    }

    /// Merge duplicate logical runbooks across adapters, keeping the
    /// highest-confidence instance and recording the rest as alternates.
    fn dedup(&self, candidates: Vec<(u32, RunbookMatch)>) -> Vec<(u32, RunbookMatch)> {
        let mut merged: Vec<(u32, RunbookMatch)> = Vec::new();

        for (priority, candidate) in candidates {
            let mut absorbed = false;
            for (kept_priority, kept) in merged.iter_mut() {
                if !self.same_logical_runbook(&kept.document, &candidate.document) {
                    continue;
                }
                if candidate.confidence > kept.confidence {
                    let mut alternates = kept.alternate_sources.clone();
                    if !alternates.contains(&kept.source_adapter) {
                        alternates.push(kept.source_adapter.clone());
                    }
                    let mut replacement = candidate.clone();
                    replacement.alternate_sources = alternates;
                    *kept = replacement;
                    *kept_priority = priority;
                } else if !kept.alternate_sources.contains(&candidate.source_adapter)
                    && kept.source_adapter != candidate.source_adapter
                {
                    kept.alternate_sources.push(candidate.source_adapter.clone());
                }
                absorbed = true;
                break;
            }
            if !absorbed {
                merged.push((priority, candidate));
            }
        }
        merged
    }

    fn same_logical_runbook(&self, a: &Document, b: &Document) -> bool {
        let (Some(ra), Some(rb)) = (&a.runbook, &b.runbook) else {
            return false;
        };
        let alerts_a: HashSet<String> = ra.alert_types.iter().map(|s| s.to_lowercase()).collect();
        let alerts_b: HashSet<String> = rb.alert_types.iter().map(|s| s.to_lowercase()).collect();
        if alerts_a.is_disjoint(&alerts_b) {
            return false;
        }
        title_jaccard(&a.title, &b.title) >= self.title_similarity
    }

    /// Score knowledge-base candidates: tokenized substring match over
    /// title and body, plus tag matches in metadata.
    pub fn rank_knowledge(
        &self,
        query: &str,
        outcome: &FanOutOutcome,
        max_results: Option<usize>,
        min_confidence: Option<f64>,
    ) -> Vec<SearchResult> {
        let tokens: Vec<String> = tokenize(query);
        let mut results: Vec<(u32, SearchResult)> = Vec::new();

        for (adapter, priority, degraded, hits) in &outcome.batches {
            for hit in hits {
                let mut reasons = Vec::new();
                let title = hit.document.title.to_lowercase();
                let body = hit.document.body.to_lowercase();

                let mut matched = 0usize;
                for token in &tokens {
                    if title.contains(token) || body.contains(token) {
                        matched += 1;
                        reasons.push(MatchReason::KeywordMatch {
                            keyword: token.clone(),
                        });
                    }
                }
                for token in &tokens {
                    if let Some(tags) = hit
                        .document
                        .metadata
                        .get("tags")
                        .and_then(|v| v.as_array())
                    {
                        if tags
                            .iter()
                            .any(|t| t.as_str().is_some_and(|s| s.to_lowercase() == *token))
                        {
                            reasons.push(MatchReason::TagMatch { tag: token.clone() });
                        }
                    }
                }
                if reasons.is_empty() {
                    continue;
                }

                let text_score = if tokens.is_empty() {
                    0.0
                } else {
                    matched as f64 / tokens.len() as f64
                };
                let tag_bonus = if reasons
                    .iter()
                    .any(|r| matches!(r, MatchReason::TagMatch { .. }))
                {
                    0.2
                } else {
                    0.0
                };
                let confidence =
                    ((hit.score.clamp(0.0, 1.0) + text_score) / 2.0 + tag_bonus).clamp(0.0, 1.0);

                if *degraded {
                    reasons.push(MatchReason::DegradedSource);
                }

                results.push((
                    *priority,
                    SearchResult {
                        document: hit.document.clone(),
                        confidence,
                        match_reasons: reasons,
                        source_adapter: adapter.clone(),
                    },
                ));
            }
        }

        results.sort_by(|(pa, a), (pb, b)| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(pa.cmp(pb))
                .then_with(|| a.document.id.cmp(&b.document.id))
        });

        let threshold = min_confidence.unwrap_or(self.min_confidence);
        let cap = max_results.unwrap_or(self.max_results);
        results
            .into_iter()
            .map(|(_, r)| r)
            .filter(|r| r.confidence >= threshold)
            .take(cap)
            .collect()
    }
}

fn avg_resolution(doc: &Document) -> u64 {
    doc.runbook
        .as_ref()
        .and_then(|r| r.avg_resolution_seconds)
        .unwrap_or(u64::MAX)
}

fn lowercase_alias_map(map: &HashMap<String, Vec<String>>) -> HashMap<String, Vec<String>> {
    map.iter()
        .map(|(k, v)| {
            (
                k.to_lowercase(),
                v.iter().map(|s| s.to_lowercase()).collect(),
            )
        })
        .collect()
}

fn tokenize(query: &str) -> Vec<String> {
    let mut tokens: Vec<String> = query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() > 1)
        .map(String::from)
        .collect();
    tokens.dedup();
    tokens
}

fn title_jaccard(a: &str, b: &str) -> f64 {
    let ta: HashSet<String> = tokenize(a).into_iter().collect();
    let tb: HashSet<String> = tokenize(b).into_iter().collect();
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    let intersection = ta.intersection(&tb).count() as f64;
    let union = ta.union(&tb).count() as f64;
    intersection / union
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::document::{ContentType, Runbook, Severity};
    use chrono::Utc;

    fn runbook_doc(id: &str, title: &str, alerts: &[&str], severities: &[Severity]) -> Document {
        Document {
            id: id.to_string(),
            adapter_name: "a".to_string(),
            title: title.to_string(),
            body: "body".to_string(),
            content_type: ContentType::Runbook,
            metadata: HashMap::new(),
            runbook: Some(Runbook {
                alert_types: alerts.iter().map(|s| s.to_string()).collect(),
                severities: severities.to_vec(),
                affected_systems: vec![],
                decision_tree: None,
                procedures: vec![],
                escalation: vec![],
                success_rate: Some(0.92),
                avg_resolution_seconds: None,
            }),
            last_seen_at: Utc::now(),
        }
    }

    fn matcher() -> Matcher {
        Matcher::from_config(&PerformanceConfig::default())
    }

    fn query(alert: &str, severity: Option<Severity>) -> RunbookQuery {
        RunbookQuery {
            alert_type: alert.to_string(),
            severity,
            affected_systems: vec![],
            context: HashMap::new(),
        }
    }

    #[test]
    fn test_exact_match_scoring() {
        let m = matcher();
        let doc = runbook_doc(
            "rb1",
            "Disk space critical",
            &["disk_space_critical"],
            &[Severity::Critical],
        );
        let hit = ScoredHit {
            document: doc,
            score: 0.6,
        };
        let (confidence, reasons) = m
            .score_runbook(&query("disk_space_critical", Some(Severity::Critical)), &hit)
            .unwrap();

        // (0.6 + 0.35 + 0.20) * 0.92 = 1.058, clamped to 1.0.
        assert!((confidence - 1.0).abs() < f64::EPSILON);
        assert!(reasons.contains(&MatchReason::ExactAlertTypeMatch));
        assert!(reasons.contains(&MatchReason::SeverityMatch));
    }

    #[test]
    fn test_disjoint_alert_types_rejected() {
        let m = matcher();
        let doc = runbook_doc("rb1", "Memory leak", &["memory_leak"], &[Severity::High]);
        let hit = ScoredHit {
            document: doc,
            score: 0.9,
        };
        assert!(m.score_runbook(&query("disk_space_critical", None), &hit).is_none());
    }

    #[test]
    fn test_alias_match_scoring() {
        let mut perf = PerformanceConfig::default();
        perf.alert_aliases.insert(
            "disk_full".to_string(),
            vec!["disk_space_critical".to_string()],
        );
        let m = Matcher::from_config(&perf);

        let doc = runbook_doc(
            "rb1",
            "Disk space critical",
            &["disk_space_critical"],
            &[Severity::Critical],
        );
        let hit = ScoredHit {
            document: doc,
            score: 0.5,
        };
        let (confidence, reasons) = m.score_runbook(&query("disk_full", None), &hit).unwrap();
        assert!(reasons.contains(&MatchReason::AliasAlertTypeMatch));
        // (0.5 + 0.20) * 0.92
        assert!((confidence - 0.644).abs() < 1e-9);
    }

    #[test]
    fn test_severity_distance_penalty() {
        let m = matcher();
        let doc = runbook_doc("rb1", "Disk", &["disk_space_critical"], &[Severity::Low]);
        let hit = ScoredHit {
            document: doc,
            score: 0.5,
        };
        let (confidence, reasons) = m
            .score_runbook(&query("disk_space_critical", Some(Severity::Critical)), &hit)
            .unwrap();
        assert!(reasons.contains(&MatchReason::SeverityDistance { distance: 3 }));
        // (0.5 + 0.35 - 0.15) * 0.92
        assert!((confidence - 0.644).abs() < 1e-9);
    }

    #[test]
    fn test_system_overlap_capped() {
        let m = matcher();
        let mut doc = runbook_doc("rb1", "Disk", &["disk_space_critical"], &[Severity::High]);
        doc.runbook.as_mut().unwrap().affected_systems = vec![
            "db1".to_string(),
            "db2".to_string(),
            "db3".to_string(),
            "db4".to_string(),
        ];
        let hit = ScoredHit {
            document: doc,
            score: 0.0,
        };
        let q = RunbookQuery {
            alert_type: "disk_space_critical".to_string(),
            severity: None,
            affected_systems: vec![
                "db1".to_string(),
                "db2".to_string(),
                "db3".to_string(),
                "db4".to_string(),
            ],
            context: HashMap::new(),
        };
        let (confidence, reasons) = m.score_runbook(&q, &hit).unwrap();
        let overlaps = reasons
            .iter()
            .filter(|r| matches!(r, MatchReason::AffectedSystemMatch { .. }))
            .count();
        // The +0.10-per-system bonus caps at +0.25 (three reasons fire
        // before the cap).
        assert_eq!(overlaps, 3);
        // (0.35 + 0.25) * 0.92
        assert!((confidence - 0.552).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_always_clamped() {
        let m = matcher();
        let mut doc = runbook_doc(
            "rb1",
            "Disk",
            &["disk_space_critical"],
            &[Severity::Critical],
        );
        doc.runbook.as_mut().unwrap().success_rate = Some(1.0);
        let hit = ScoredHit {
            document: doc,
            score: 1.0,
        };
        let (confidence, _) = m
            .score_runbook(&query("disk_space_critical", Some(Severity::Critical)), &hit)
            .unwrap();
        assert!((confidence - 1.0).abs() < f64::EPSILON);
    }

    fn outcome_with(batches: Vec<(&str, u32, bool, Vec<ScoredHit>)>) -> FanOutOutcome {
        FanOutOutcome {
            batches: batches
                .into_iter()
                .map(|(n, p, d, h)| (n.to_string(), p, d, h))
                .collect(),
            failures: vec![],
            calls: vec![],
        }
    }

    #[test]
    fn test_dedup_keeps_highest_confidence() {
        let m = matcher();
        let doc_a = runbook_doc(
            "rb1",
            "Disk space critical response",
            &["disk_space_critical"],
            &[Severity::Critical],
        );
        let mut doc_b = doc_a.clone();
        doc_b.adapter_name = "b".to_string();
        doc_b.id = "rb1-mirror".to_string();

        let outcome = outcome_with(vec![
            (
                "a",
                10,
                false,
                vec![ScoredHit {
                    document: doc_a,
                    score: 0.3,
                }],
            ),
            (
                "b",
                20,
                false,
                vec![ScoredHit {
                    document: doc_b,
                    score: 0.9,
                }],
            ),
        ]);

        let results = m.rank_runbooks(
            &query("disk_space_critical", Some(Severity::Critical)),
            &outcome,
            None,
            None,
        );
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source_adapter, "b");
        assert_eq!(results[0].alternate_sources, vec!["a".to_string()]);
    }

    #[test]
    fn test_ranking_tiebreak_by_priority() {
        let m = matcher();
        let doc_a = runbook_doc("rb-a", "Disk alpha", &["disk_space_critical"], &[Severity::High]);
        let doc_b = runbook_doc("rb-b", "Disk beta", &["disk_space_critical"], &[Severity::High]);

        let outcome = outcome_with(vec![
            (
                "low-priority",
                50,
                false,
                vec![ScoredHit {
                    document: doc_a,
                    score: 0.5,
                }],
            ),
            (
                "high-priority",
                1,
                false,
                vec![ScoredHit {
                    document: doc_b,
                    score: 0.5,
                }],
            ),
        ]);

        let results = m.rank_runbooks(&query("disk_space_critical", None), &outcome, None, None);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].source_adapter, "high-priority");
    }

    #[test]
    fn test_boundary_ties_kept() {
        let m = matcher();
        let titles = [
            "Alpha volume cleanup",
            "Bravo node restart",
            "Charlie partition purge",
            "Delta cache flush",
        ];
        let mut hits = Vec::new();
        for (i, title) in titles.iter().enumerate() {
            hits.push(ScoredHit {
                document: runbook_doc(
                    &format!("rb{i}"),
                    title,
                    &["disk_space_critical"],
                    &[Severity::High],
                ),
                score: 0.5,
            });
        }
        let outcome = outcome_with(vec![("a", 10, false, hits)]);
        // All four tie; a cap of 2 keeps all four rather than dropping
        // arbitrarily.
        let results = m.rank_runbooks(&query("disk_space_critical", None), &outcome, Some(2), None);
        assert_eq!(results.len(), 4);
    }

    #[test]
    fn test_max_results_zero() {
        let m = matcher();
        let outcome = outcome_with(vec![(
            "a",
            10,
            false,
            vec![ScoredHit {
                document: runbook_doc("rb1", "Disk", &["disk_space_critical"], &[Severity::High]),
                score: 0.5,
            }],
        )]);
        let results = m.rank_runbooks(&query("disk_space_critical", None), &outcome, Some(0), None);
        assert!(results.is_empty());
    }

    #[test]
    fn test_below_threshold_best_effort() {
        let m = matcher();
        let doc = runbook_doc("rb1", "Disk", &["disk_space_critical"], &[Severity::High]);
        let outcome = outcome_with(vec![(
            "a",
            10,
            false,
            vec![ScoredHit {
                document: doc,
                score: 0.0,
            }],
        )]);
        // Confidence = 0.35 * 0.92 = 0.322; threshold 0.6 filters it, but
        // it sits above 0.3 and is the only near miss.
        let results = m.rank_runbooks(&query("disk_space_critical", None), &outcome, None, Some(0.6));
        assert_eq!(results.len(), 1);
        assert!(results[0]
            .match_reasons
            .contains(&MatchReason::BelowThresholdBestEffort));
    }

    #[test]
    fn test_min_confidence_one_filters_everything_below() {
        let m = matcher();
        let doc = runbook_doc("rb1", "Disk", &["disk_space_critical"], &[Severity::High]);
        let outcome = outcome_with(vec![(
            "a",
            10,
            false,
            vec![ScoredHit {
                document: doc,
                score: 0.5,
            }],
        )]);
        let results = m.rank_runbooks(&query("disk_space_critical", None), &outcome, None, Some(1.0));
        assert!(results.is_empty());
    }

    #[test]
    fn test_degraded_source_tagging() {
        let m = matcher();
        let doc = runbook_doc("rb1", "Disk", &["disk_space_critical"], &[Severity::High]);
        let outcome = outcome_with(vec![(
            "a",
            10,
            true,
            vec![ScoredHit {
                document: doc,
                score: 0.5,
            }],
        )]);
        let results = m.rank_runbooks(&query("disk_space_critical", None), &outcome, None, None);
        assert!(results[0].match_reasons.contains(&MatchReason::DegradedSource));
    }

    #[test]
    fn test_knowledge_ranking() {
        let m = matcher();
        let mut doc = runbook_doc("kb1", "Postgres vacuum guide", &[], &[]);
        doc.runbook = None;
        doc.body = "How to run vacuum on postgres safely".to_string();
        doc.metadata
            .insert("tags".to_string(), serde_json::json!(["postgres"]));

        let outcome = outcome_with(vec![(
            "a",
            10,
            false,
            vec![ScoredHit {
                document: doc,
                score: 0.8,
            }],
        )]);
        let results = m.rank_knowledge("postgres vacuum", &outcome, None, None);
        assert_eq!(results.len(), 1);
        assert!(results[0]
            .match_reasons
            .iter()
            .any(|r| matches!(r, MatchReason::TagMatch { .. })));
        assert!(results[0].confidence > 0.5);

        let none = m.rank_knowledge("kafka rebalance", &outcome, None, None);
        assert!(none.is_empty());
    }

    #[test]
    fn test_identical_queries_deterministic() {
        let m = matcher();
        let mk_outcome = || {
            outcome_with(vec![(
                "a",
                10,
                false,
                vec![
                    ScoredHit {
                        document: runbook_doc(
                            "rb2",
                            "Second disk runbook variant two",
                            &["disk_space_critical"],
                            &[Severity::High],
                        ),
                        score: 0.4,
                    },
                    ScoredHit {
                        document: runbook_doc(
                            "rb1",
                            "First disk runbook variant one",
                            &["disk_space_critical"],
                            &[Severity::High],
                        ),
                        score: 0.4,
                    },
                ],
            )])
        };
        let q = query("disk_space_critical", None);
        let r1 = m.rank_runbooks(&q, &mk_outcome(), None, None);
        let r2 = m.rank_runbooks(&q, &mk_outcome(), None, None);
        let ids1: Vec<&str> = r1.iter().map(|m| m.document.id.as_str()).collect();
        let ids2: Vec<&str> = r2.iter().map(|m| m.document.id.as_str()).collect();
        assert_eq!(ids1, ids2);
        assert_eq!(ids1, vec!["rb1", "rb2"]);
    }
}
