//! Incremental indexing and change detection.
//!
//! Each refresh pass pulls one adapter's inventory, fingerprints every
//! document, and diffs against the adapter's prior fingerprint map to
//! produce a [`ChangeSet`]. Nonempty change sets are integrated into a new
//! immutable [`CorpusSnapshot`], the snapshot pointer is swapped
//! atomically, and the corpus epoch is bumped, which invalidates dependent
//! cache entries by keying (see [`crate::cache`]).
//!
//! Deletions are confirmed conservatively: a document missing from one pass
//! is only a candidate; it is deleted when still absent on the next pass
//! (or, under the time-based policy, after a configured grace window).

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::DeletionPolicy;
use crate::document::{
    ChangedPart, Document, DocumentKey, EscalationStep, Fingerprint, Procedure,
};
use crate::error::Result;

// ============================================================================
// Change Sets
// ============================================================================

/// One document update within a change set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentUpdate {
    pub key: DocumentKey,
    pub old_fingerprint: Fingerprint,
    pub new_fingerprint: Fingerprint,
    pub changed: Vec<ChangedPart>,
}

/// Per-pass statistics for one adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PassStats {
    pub enumerated: usize,
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    pub deletion_candidates: usize,
}

/// Output of one refresh pass for one adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeSet {
    pub adapter_name: String,
    pub additions: Vec<DocumentKey>,
    pub updates: Vec<DocumentUpdate>,
    pub deletions: Vec<DocumentKey>,
    pub computed_at: DateTime<Utc>,
    pub stats: PassStats,
}

impl ChangeSet {
    /// Whether applying this change set alters the corpus.
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.updates.is_empty() && self.deletions.is_empty()
    }
}

// ============================================================================
// Corpus Snapshot
// ============================================================================

/// Immutable view of the indexed corpus.
///
/// Readers capture one `Arc<CorpusSnapshot>` at tool-call start and hold it
/// for the call's duration; writers build a replacement and swap the
/// pointer. A reader never observes a half-applied pass.
#[derive(Debug, Default)]
pub struct CorpusSnapshot {
    /// Epoch at which this snapshot became current.
    pub epoch: u64,
    /// All documents by `(adapter_name, id)`.
    pub documents: HashMap<DocumentKey, Arc<Document>>,
    /// Runbook-bearing documents bucketed by alert type.
    pub runbooks_by_alert: HashMap<String, Vec<DocumentKey>>,
    /// Procedures by procedure id.
    pub procedures: HashMap<String, (DocumentKey, Procedure)>,
    /// Decision-tree scenarios to owning documents.
    pub scenarios: HashMap<String, Vec<DocumentKey>>,
    /// All escalation steps in the corpus, with their owning documents.
    pub escalation_steps: Vec<(DocumentKey, EscalationStep)>,
}

impl CorpusSnapshot {
    fn build(
        epoch: u64,
        documents: HashMap<DocumentKey, Arc<Document>>,
        detector: &RunbookDetector,
    ) -> Self {
        let mut runbooks_by_alert: HashMap<String, Vec<DocumentKey>> = HashMap::new();
        let mut procedures = HashMap::new();
        let mut scenarios: HashMap<String, Vec<DocumentKey>> = HashMap::new();
        let mut escalation_steps = Vec::new();

        for (key, doc) in &documents {
            if !detector.matches_structure(doc) {
                continue;
            }
            let Some(runbook) = &doc.runbook else {
                continue;
            };
            for alert in &runbook.alert_types {
                runbooks_by_alert
                    .entry(alert.to_lowercase())
                    .or_default()
                    .push(key.clone());
            }
            for procedure in &runbook.procedures {
                procedures.insert(procedure.id.clone(), (key.clone(), procedure.clone()));
            }
            if let Some(tree) = &runbook.decision_tree {
                scenarios
                    .entry(tree.scenario.to_lowercase())
                    .or_default()
                    .push(key.clone());
            }
            for step in &runbook.escalation {
                escalation_steps.push((key.clone(), step.clone()));
            }
        }

        // Deterministic bucket order for deterministic tool output.
        for keys in runbooks_by_alert.values_mut() {
            keys.sort();
        }
        for keys in scenarios.values_mut() {
            keys.sort();
        }
        escalation_steps.sort_by(|(a, _), (b, _)| a.cmp(b));

        Self {
            epoch,
            documents,
            runbooks_by_alert,
            procedures,
            scenarios,
            escalation_steps,
        }
    }

    /// Documents carrying runbooks for an alert type (exact, lowercased).
    pub fn runbooks_for(&self, alert_type: &str) -> Vec<Arc<Document>> {
        self.runbooks_by_alert
            .get(&alert_type.to_lowercase())
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| self.documents.get(k).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Count of documents owned by one adapter.
    pub fn count_for_adapter(&self, adapter_name: &str) -> usize {
        self.documents
            .keys()
            .filter(|k| k.adapter_name == adapter_name)
            .count()
    }
}

// ============================================================================
// Runbook Detection
// ============================================================================

/// Configurable "is this document a runbook?" heuristic.
///
/// Combines a structural signal (a runbook payload with alert types) and a
/// keyword signal (markers in the title or metadata). Either signal can be
/// disabled; by default both run and either suffices to tag the document's
/// quality metadata, while only the structural signal admits a document
/// into the runbook indexes.
#[derive(Debug, Clone)]
pub struct RunbookDetector {
    pub markers: Vec<String>,
    pub structural: bool,
    pub keyword: bool,
}

impl Default for RunbookDetector {
    fn default() -> Self {
        Self {
            markers: vec!["runbook".to_string(), "incident".to_string()],
            structural: true,
            keyword: true,
        }
    }
}

impl RunbookDetector {
    pub fn new(markers: Vec<String>) -> Self {
        Self {
            markers,
            ..Self::default()
        }
    }

    /// Structural signal: a usable runbook payload is attached.
    pub fn matches_structure(&self, doc: &Document) -> bool {
        self.structural
            && doc
                .runbook
                .as_ref()
                .is_some_and(|rb| !rb.alert_types.is_empty())
    }

    /// Keyword signal: a marker appears in the title or metadata values.
    pub fn matches_keywords(&self, doc: &Document) -> bool {
        if !self.keyword {
            return false;
        }
        let title = doc.title.to_lowercase();
        self.markers.iter().any(|m| {
            let marker = m.to_lowercase();
            title.contains(&marker)
                || doc.metadata.values().any(|v| {
                    v.as_str()
                        .is_some_and(|s| s.to_lowercase().contains(&marker))
                })
        })
    }

    pub fn is_runbook(&self, doc: &Document) -> bool {
        self.matches_structure(doc) || self.matches_keywords(doc)
    }
}

// ============================================================================
// Indexer
// ============================================================================

/// Persisted per-adapter checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Checkpoint {
    fingerprints: HashMap<String, Fingerprint>,
    last_pass_at: Option<DateTime<Utc>>,
}

/// Mutable per-adapter indexing state.
#[derive(Debug, Default)]
struct AdapterIndexState {
    fingerprints: HashMap<String, Fingerprint>,
    /// Ids absent from exactly one pass (two-pass deletion).
    missing_once: HashSet<String>,
    /// First-absence timestamps (time-based deletion).
    missing_since: HashMap<String, DateTime<Utc>>,
    last_pass_at: Option<DateTime<Utc>>,
    consecutive_failures: u32,
}

/// The indexer: owns the document corpus between refresh passes.
pub struct Indexer {
    snapshot: ArcSwap<CorpusSnapshot>,
    epoch: AtomicU64,
    /// Master document map the snapshots are built from.
    documents: DashMap<DocumentKey, Arc<Document>>,
    states: DashMap<String, AdapterIndexState>,
    in_flight: DashMap<String, Arc<AtomicBool>>,
    /// Serializes snapshot integration across adapters.
    integrate_lock: Mutex<()>,
    detector: RunbookDetector,
    checkpoint_dir: Option<PathBuf>,
}

impl Indexer {
    pub fn new(detector: RunbookDetector, checkpoint_dir: Option<PathBuf>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(CorpusSnapshot::default()),
            epoch: AtomicU64::new(0),
            documents: DashMap::new(),
            states: DashMap::new(),
            in_flight: DashMap::new(),
            integrate_lock: Mutex::new(()),
            detector,
            checkpoint_dir,
        }
    }

    /// Current corpus snapshot. Hold the returned `Arc` for the duration of
    /// a single tool call.
    pub fn snapshot(&self) -> Arc<CorpusSnapshot> {
        self.snapshot.load_full()
    }

    /// Current corpus epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Total indexed documents.
    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    /// Last successful pass time for an adapter.
    pub fn last_pass_at(&self, adapter_name: &str) -> Option<DateTime<Utc>> {
        self.states.get(adapter_name).and_then(|s| s.last_pass_at)
    }

    /// Consecutive enumeration failures for an adapter.
    pub fn consecutive_failures(&self, adapter_name: &str) -> u32 {
        self.states
            .get(adapter_name)
            .map(|s| s.consecutive_failures)
            .unwrap_or(0)
    }

    /// Record an enumeration failure; the prior snapshot is retained.
    pub fn record_pass_failure(&self, adapter_name: &str) {
        let mut state = self.states.entry(adapter_name.to_string()).or_default();
        state.consecutive_failures += 1;
        tracing::warn!(
            adapter = %adapter_name,
            consecutive_failures = state.consecutive_failures,
            "index refresh failed; retaining prior snapshot"
        );
    }

    /// Try to claim the single in-flight refresh slot for an adapter.
    /// Returns a guard-like flag, or `None` when a pass is already running.
    pub fn try_begin_pass(&self, adapter_name: &str) -> Option<PassGuard> {
        let flag = self
            .in_flight
            .entry(adapter_name.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone();
        if flag.swap(true, Ordering::AcqRel) {
            tracing::warn!(adapter = %adapter_name, "refresh tick skipped: prior pass still running");
            return None;
        }
        Some(PassGuard { flag })
    }

    /// Diff an adapter's enumerated inventory against its prior state and
    /// integrate the resulting change set. Returns the change set; the
    /// epoch is bumped only when it is nonempty.
    pub async fn apply_inventory(
        &self,
        adapter_name: &str,
        inventory: Vec<Document>,
        policy: DeletionPolicy,
        grace: chrono::Duration,
    ) -> ChangeSet {
        let now = Utc::now();
        let mut additions = Vec::new();
        let mut updates = Vec::new();
        let mut deletions = Vec::new();
        let mut incoming: HashMap<String, (Document, Fingerprint)> = HashMap::new();

        for mut doc in inventory {
            doc.adapter_name = adapter_name.to_string();
            doc.last_seen_at = now;
            doc.metadata.insert(
                "quality_score".to_string(),
                serde_json::json!(doc.quality_score()),
            );
            if doc.runbook.is_none() && self.detector.matches_keywords(&doc) {
                doc.metadata
                    .insert("runbook_candidate".to_string(), serde_json::json!(true));
            }
            let fp = Fingerprint::of(&doc);
            incoming.insert(doc.id.clone(), (doc, fp));
        }
        let enumerated = incoming.len();

        let mut deletion_candidates = 0;
        {
            let mut state = self.states.entry(adapter_name.to_string()).or_default();

            for (id, (_, fp)) in &incoming {
                match state.fingerprints.get(id) {
                    None => additions.push(DocumentKey {
                        adapter_name: adapter_name.to_string(),
                        id: id.clone(),
                    }),
                    Some(old) if old != fp => updates.push(DocumentUpdate {
                        key: DocumentKey {
                            adapter_name: adapter_name.to_string(),
                            id: id.clone(),
                        },
                        old_fingerprint: old.clone(),
                        new_fingerprint: fp.clone(),
                        changed: old.diff(fp),
                    }),
                    Some(_) => {}
                }
                // A reappearing document clears its deletion candidacy.
                state.missing_once.remove(id);
                state.missing_since.remove(id);
            }

            let absent: Vec<String> = state
                .fingerprints
                .keys()
                .filter(|id| !incoming.contains_key(*id))
                .cloned()
                .collect();

            for id in absent {
                let confirmed = match policy {
                    DeletionPolicy::TwoPass => {
                        if state.missing_once.contains(&id) {
                            true
                        } else {
                            state.missing_once.insert(id.clone());
                            false
                        }
                    }
                    DeletionPolicy::TimeBased => {
                        let first_absent =
                            *state.missing_since.entry(id.clone()).or_insert(now);
                        now.signed_duration_since(first_absent) >= grace
                    }
                };
                if confirmed {
                    state.fingerprints.remove(&id);
                    state.missing_once.remove(&id);
                    state.missing_since.remove(&id);
                    deletions.push(DocumentKey {
                        adapter_name: adapter_name.to_string(),
                        id,
                    });
                } else {
                    deletion_candidates += 1;
                }
            }

            for (id, (_, fp)) in &incoming {
                state.fingerprints.insert(id.clone(), fp.clone());
            }
            state.last_pass_at = Some(now);
            state.consecutive_failures = 0;
        }

        let change_set = ChangeSet {
            adapter_name: adapter_name.to_string(),
            stats: PassStats {
                enumerated,
                added: additions.len(),
                updated: updates.len(),
                deleted: deletions.len(),
                deletion_candidates,
            },
            additions,
            updates,
            deletions,
            computed_at: now,
        };

        if !change_set.is_empty() {
            self.integrate(adapter_name, &change_set, incoming).await;
        }

        if let Err(err) = self.write_checkpoint(adapter_name) {
            tracing::warn!(adapter = %adapter_name, error = %err, "checkpoint write failed");
        }

        tracing::info!(
            adapter = %adapter_name,
            enumerated = change_set.stats.enumerated,
            added = change_set.stats.added,
            updated = change_set.stats.updated,
            deleted = change_set.stats.deleted,
            epoch = self.epoch(),
            "index refresh pass complete"
        );

        change_set
    }

    /// Apply a nonzero change set to the master map and publish a new
    /// snapshot under the integration lock.
    async fn integrate(
        &self,
        adapter_name: &str,
        change_set: &ChangeSet,
        mut incoming: HashMap<String, (Document, Fingerprint)>,
    ) {
        let _guard = self.integrate_lock.lock().await;

        for key in &change_set.additions {
            if let Some((doc, _)) = incoming.remove(&key.id) {
                self.documents.insert(key.clone(), Arc::new(doc));
            }
        }
        for update in &change_set.updates {
            if let Some((doc, _)) = incoming.remove(&update.key.id) {
                self.documents.insert(update.key.clone(), Arc::new(doc));
            }
        }
        for key in &change_set.deletions {
            self.documents.remove(key);
        }

        let new_epoch = self.epoch.load(Ordering::Acquire) + 1;
        let documents: HashMap<DocumentKey, Arc<Document>> = self
            .documents
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let snapshot = CorpusSnapshot::build(new_epoch, documents, &self.detector);
        self.snapshot.store(Arc::new(snapshot));
        self.epoch.store(new_epoch, Ordering::Release);

        tracing::debug!(
            adapter = %adapter_name,
            epoch = new_epoch,
            corpus_size = self.documents.len(),
            "corpus snapshot swapped"
        );
    }

    /// Runbook detector in use.
    pub fn detector(&self) -> &RunbookDetector {
        &self.detector
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    fn checkpoint_path(&self, adapter_name: &str) -> Option<PathBuf> {
        self.checkpoint_dir
            .as_ref()
            .map(|dir| dir.join(format!("{adapter_name}.checkpoint.json")))
    }

    fn write_checkpoint(&self, adapter_name: &str) -> Result<()> {
        let Some(path) = self.checkpoint_path(adapter_name) else {
            return Ok(());
        };
        let Some(state) = self.states.get(adapter_name) else {
            return Ok(());
        };
        let checkpoint = Checkpoint {
            fingerprints: state.fingerprints.clone(),
            last_pass_at: state.last_pass_at,
        };
        drop(state);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec(&checkpoint)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Load a persisted checkpoint, seeding the adapter's fingerprint map.
    /// Absence is not an error.
    pub fn load_checkpoint(&self, adapter_name: &str) -> Result<bool> {
        let Some(path) = self.checkpoint_path(adapter_name) else {
            return Ok(false);
        };
        if !path.exists() {
            return Ok(false);
        }
        let bytes = std::fs::read(path)?;
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)?;
        let mut state = self.states.entry(adapter_name.to_string()).or_default();
        state.fingerprints = checkpoint.fingerprints;
        state.last_pass_at = checkpoint.last_pass_at;
        Ok(true)
    }
}

/// Releases an adapter's in-flight refresh slot on drop.
pub struct PassGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for PassGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::document::{ContentType, Runbook, Severity};

    fn doc(id: &str, body: &str) -> Document {
        Document {
            id: id.to_string(),
            adapter_name: "test".to_string(),
            title: format!("Runbook {id}"),
            body: body.to_string(),
            content_type: ContentType::Runbook,
            metadata: HashMap::new(),
            runbook: Some(Runbook {
                alert_types: vec!["disk_space_critical".to_string()],
                severities: vec![Severity::Critical],
                affected_systems: vec![],
                decision_tree: None,
                procedures: vec![],
                escalation: vec![],
                success_rate: None,
                avg_resolution_seconds: None,
            }),
            last_seen_at: Utc::now(),
        }
    }

    fn indexer() -> Indexer {
        Indexer::new(RunbookDetector::default(), None)
    }

    async fn pass(ix: &Indexer, docs: Vec<Document>) -> ChangeSet {
        ix.apply_inventory("test", docs, DeletionPolicy::TwoPass, chrono::Duration::zero())
            .await
    }

    #[tokio::test]
    async fn test_additions_bump_epoch() {
        let ix = indexer();
        assert_eq!(ix.epoch(), 0);

        let cs = pass(&ix, vec![doc("d1", "body")]).await;
        assert_eq!(cs.stats.added, 1);
        assert_eq!(ix.epoch(), 1);
        assert_eq!(ix.document_count(), 1);

        let snapshot = ix.snapshot();
        assert_eq!(snapshot.epoch, 1);
        assert_eq!(snapshot.runbooks_for("disk_space_critical").len(), 1);
        assert_eq!(snapshot.runbooks_for("DISK_SPACE_CRITICAL").len(), 1);
    }

    #[tokio::test]
    async fn test_unchanged_pass_keeps_epoch() {
        let ix = indexer();
        pass(&ix, vec![doc("d1", "body")]).await;
        let before = ix.epoch();

        let cs = pass(&ix, vec![doc("d1", "body")]).await;
        assert!(cs.is_empty());
        assert_eq!(ix.epoch(), before);
    }

    #[tokio::test]
    async fn test_content_change_detected() {
        let ix = indexer();
        pass(&ix, vec![doc("d1", "before")]).await;

        let cs = pass(&ix, vec![doc("d1", "after")]).await;
        assert_eq!(cs.stats.updated, 1);
        assert_eq!(cs.updates[0].changed, vec![ChangedPart::Content]);
        assert_eq!(ix.epoch(), 2);
    }

    #[tokio::test]
    async fn test_two_pass_deletion_grace() {
        let ix = indexer();
        pass(&ix, vec![doc("d1", "body")]).await;

        // Pass 2: d1 absent (transient) - candidate only.
        let cs = pass(&ix, vec![]).await;
        assert!(cs.deletions.is_empty());
        assert_eq!(cs.stats.deletion_candidates, 1);
        assert_eq!(ix.document_count(), 1);

        // Pass 3: d1 back - never deleted.
        let cs = pass(&ix, vec![doc("d1", "body")]).await;
        assert!(cs.deletions.is_empty());

        // Passes 4 and 5: absent twice - deleted.
        pass(&ix, vec![]).await;
        let cs = pass(&ix, vec![]).await;
        assert_eq!(cs.deletions.len(), 1);
        assert_eq!(ix.document_count(), 0);
        assert!(ix.snapshot().runbooks_for("disk_space_critical").is_empty());
    }

    #[tokio::test]
    async fn test_time_based_deletion() {
        let ix = indexer();
        ix.apply_inventory(
            "test",
            vec![doc("d1", "body")],
            DeletionPolicy::TimeBased,
            chrono::Duration::zero(),
        )
        .await;

        // Grace of zero confirms the deletion on the first absent pass.
        let cs = ix
            .apply_inventory("test", vec![], DeletionPolicy::TimeBased, chrono::Duration::zero())
            .await;
        assert_eq!(cs.deletions.len(), 1);
    }

    #[tokio::test]
    async fn test_in_flight_pass_exclusive() {
        let ix = indexer();
        let guard = ix.try_begin_pass("test");
        assert!(guard.is_some());
        assert!(ix.try_begin_pass("test").is_none());
        drop(guard);
        assert!(ix.try_begin_pass("test").is_some());
    }

    #[tokio::test]
    async fn test_checkpoint_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let ix = Indexer::new(RunbookDetector::default(), Some(dir.path().to_path_buf()));
        ix.apply_inventory(
            "test",
            vec![doc("d1", "body")],
            DeletionPolicy::TwoPass,
            chrono::Duration::zero(),
        )
        .await;

        // A fresh indexer seeded from the checkpoint sees no changes for
        // the same inventory.
        let ix2 = Indexer::new(RunbookDetector::default(), Some(dir.path().to_path_buf()));
        assert!(ix2.load_checkpoint("test").unwrap());
        let cs = ix2
            .apply_inventory(
                "test",
                vec![doc("d1", "body")],
                DeletionPolicy::TwoPass,
                chrono::Duration::zero(),
            )
            .await;
        assert!(cs.is_empty());
    }

    #[test]
    fn test_runbook_detector_signals() {
        let detector = RunbookDetector::default();
        let with_structure = doc("d1", "body");
        assert!(detector.matches_structure(&with_structure));
        assert!(detector.is_runbook(&with_structure));

        let mut plain = doc("d2", "body");
        plain.runbook = None;
        plain.title = "Capacity planning notes".to_string();
        assert!(!detector.is_runbook(&plain));

        plain.title = "Incident response for API outages".to_string();
        assert!(detector.is_runbook(&plain));

        let disabled = RunbookDetector {
            markers: vec![],
            structural: false,
            keyword: false,
        };
        assert!(!disabled.is_runbook(&with_structure));
    }
}
