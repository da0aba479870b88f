//! Core data model: documents, runbooks, procedures, escalation paths.
//!
//! A [`Document`] is the unit of indexing; a [`Runbook`] is a document that
//! additionally carries the operational tags (alert types, severities,
//! affected systems) and structures (decision tree, procedures, escalation)
//! that drive matching. The pair `(adapter_name, id)` identifies a document
//! globally.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Operational alert severity, ordered from most to least urgent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    /// Rank distance between two severities (adjacent severities are 1 apart).
    pub fn distance(self, other: Severity) -> u8 {
        (self.rank() as i8 - other.rank() as i8).unsigned_abs()
    }

    fn rank(self) -> u8 {
        match self {
            Severity::Critical => 0,
            Severity::High => 1,
            Severity::Medium => 2,
            Severity::Low => 3,
        }
    }

    /// Wire name (lowercase).
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" => Ok(Severity::Critical),
            "high" => Ok(Severity::High),
            "medium" => Ok(Severity::Medium),
            "low" => Ok(Severity::Low),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// Content categories used for cache TTL selection and search filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Runbook,
    DecisionTree,
    Procedure,
    KnowledgeBase,
    ListSources,
    Health,
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Runbook => "runbook",
            ContentType::DecisionTree => "decision_tree",
            ContentType::Procedure => "procedure",
            ContentType::KnowledgeBase => "knowledge_base",
            ContentType::ListSources => "list_sources",
            ContentType::Health => "health",
        }
    }
}

/// Composite document fingerprint: independent hashes over content,
/// metadata, and structure. Change classification compares the parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    /// SHA-256 over the document body.
    pub content: String,
    /// SHA-256 over the canonicalized metadata map.
    pub metadata: String,
    /// SHA-256 over the stable serialization of attached structures
    /// (decision tree, procedures, escalation).
    pub structure: String,
}

impl Fingerprint {
    /// Compute the fingerprint of a document.
    ///
    /// Metadata is canonicalized through a `BTreeMap` so key order never
    /// affects the digest.
    pub fn of(doc: &Document) -> Self {
        let content = sha256_hex(doc.body.as_bytes());

        let canonical_meta: BTreeMap<&String, &serde_json::Value> = doc.metadata.iter().collect();
        let meta_bytes = serde_json::to_vec(&canonical_meta).unwrap_or_default();
        let metadata = sha256_hex(&meta_bytes);

        let structure_bytes = doc
            .runbook
            .as_ref()
            .map(|rb| serde_json::to_vec(rb).unwrap_or_default())
            .unwrap_or_default();
        let structure = sha256_hex(&structure_bytes);

        Self {
            content,
            metadata,
            structure,
        }
    }

    /// Which parts differ between two fingerprints.
    pub fn diff(&self, other: &Fingerprint) -> Vec<ChangedPart> {
        let mut parts = Vec::new();
        if self.content != other.content {
            parts.push(ChangedPart::Content);
        }
        if self.metadata != other.metadata {
            parts.push(ChangedPart::Metadata);
        }
        if self.structure != other.structure {
            parts.push(ChangedPart::Structure);
        }
        parts
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Fingerprint component that changed between two indexing passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangedPart {
    Content,
    Metadata,
    Structure,
}

/// A document as produced by a source adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Stable id within the owning adapter.
    pub id: String,
    /// Name of the adapter that owns this document.
    pub adapter_name: String,
    /// Title.
    pub title: String,
    /// Full body text.
    pub body: String,
    /// Content category.
    pub content_type: ContentType,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Runbook payload, present when the document is a runbook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runbook: Option<Runbook>,
    /// When the owning adapter last reported this document.
    pub last_seen_at: DateTime<Utc>,
}

impl Document {
    /// Globally unique key `(adapter_name, id)`.
    pub fn key(&self) -> DocumentKey {
        DocumentKey {
            adapter_name: self.adapter_name.clone(),
            id: self.id.clone(),
        }
    }

    /// Quality score in `[0, 10]`: metadata completeness (0-4), content
    /// length (0-3), structure presence (0-3). Exposed via metadata; only
    /// used in matching when explicitly configured.
    pub fn quality_score(&self) -> u8 {
        let metadata_score = (self.metadata.len() as u8).min(4);
        let content_score = match self.body.len() {
            0 => 0,
            1..=199 => 1,
            200..=999 => 2,
            _ => 3,
        };
        let structure_score = match &self.runbook {
            None => 0,
            Some(rb) => {
                let mut s = 1;
                if rb.decision_tree.is_some() {
                    s += 1;
                }
                if !rb.procedures.is_empty() {
                    s += 1;
                }
                s
            }
        };
        metadata_score + content_score + structure_score
    }
}

/// Globally unique document identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentKey {
    pub adapter_name: String,
    pub id: String,
}

impl std::fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.adapter_name, self.id)
    }
}

/// Runbook payload carried by a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runbook {
    /// Alert type identifiers this runbook answers.
    pub alert_types: Vec<String>,
    /// Severities this runbook covers.
    pub severities: Vec<Severity>,
    /// Systems this runbook applies to.
    #[serde(default)]
    pub affected_systems: Vec<String>,
    /// Branching diagnostic structure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_tree: Option<DecisionTree>,
    /// Remediation procedures, in execution order.
    #[serde(default)]
    pub procedures: Vec<Procedure>,
    /// Escalation steps, in order of engagement.
    #[serde(default)]
    pub escalation: Vec<EscalationStep>,
    /// Historical success rate in `[0, 1]`, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
    /// Mean time to resolution in seconds, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_resolution_seconds: Option<u64>,
}

/// Branching diagnostic structure attached to a runbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTree {
    /// Scenario tag this tree resolves (e.g. "disk_full_triage").
    pub scenario: String,
    /// Root node.
    pub root: DecisionNode,
}

/// One node of a decision tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionNode {
    /// Condition evaluated at this node.
    pub condition: String,
    /// Action to take when this node terminates the walk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Confidence in this node's action, `[0, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Child branches, keyed by condition outcome.
    #[serde(default)]
    pub branches: Vec<DecisionBranch>,
}

/// A labeled edge from a decision node to a child node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionBranch {
    /// Outcome label (e.g. "yes", "above_90_percent").
    pub outcome: String,
    /// Child node.
    pub node: DecisionNode,
}

/// An ordered remediation procedure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Procedure {
    /// Procedure id, unique within the corpus.
    pub id: String,
    /// Title.
    pub title: String,
    /// Ordered steps.
    pub steps: Vec<ProcedureStep>,
    /// Prerequisites that must hold before running.
    #[serde(default)]
    pub prerequisites: Vec<String>,
    /// Id of the rollback procedure, if one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<String>,
}

/// One step of a procedure. `index` is 1-based.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureStep {
    pub index: u32,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
    /// Rough time estimate in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_estimate_seconds: Option<u64>,
}

/// One step of an escalation path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationStep {
    /// Role to engage (e.g. "on-call SRE", "database team lead").
    pub role: String,
    /// Contact reference (channel, rotation name). Never a resolved secret.
    pub contact: String,
    /// Severity this step applies to.
    pub severity: Severity,
    /// Whether this step applies during business hours. `None` means both.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_hours: Option<bool>,
    /// Minutes to wait before engaging the next step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_minutes: Option<u32>,
}

/// A merged escalation path returned by the tool API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationPath {
    pub severity: Severity,
    /// Whether this path is the business-hours variant. `None` when the
    /// caller did not constrain it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_hours: Option<bool>,
    /// Steps in engagement order, deduplicated by role.
    pub steps: Vec<EscalationStep>,
}

/// A recorded incident-resolution feedback entry. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    /// Server-assigned id.
    pub feedback_id: String,
    /// Incident the feedback refers to.
    pub incident_id: String,
    /// Time to resolution in seconds.
    pub resolution_seconds: u64,
    /// Whether the runbook guidance led to resolution.
    pub success: bool,
    /// Resolution method tag, when supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Free-form notes.
    #[serde(default)]
    pub notes: HashMap<String, serde_json::Value>,
    /// When the entry was recorded.
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn doc(body: &str) -> Document {
        Document {
            id: "d1".to_string(),
            adapter_name: "fs".to_string(),
            title: "Disk space runbook".to_string(),
            body: body.to_string(),
            content_type: ContentType::Runbook,
            metadata: HashMap::new(),
            runbook: None,
            last_seen_at: Utc::now(),
        }
    }

    #[test]
    fn test_severity_distance() {
        assert_eq!(Severity::Critical.distance(Severity::Critical), 0);
        assert_eq!(Severity::Critical.distance(Severity::High), 1);
        assert_eq!(Severity::Critical.distance(Severity::Low), 3);
        assert_eq!(Severity::Low.distance(Severity::High), 2);
    }

    #[test]
    fn test_severity_parse_roundtrip() {
        for s in [
            Severity::Critical,
            Severity::High,
            Severity::Medium,
            Severity::Low,
        ] {
            assert_eq!(s.as_str().parse::<Severity>().unwrap(), s);
        }
        assert!("catastrophic".parse::<Severity>().is_err());
    }

    #[test]
    fn test_fingerprint_stable_under_metadata_order() {
        let mut a = doc("body");
        a.metadata.insert("team".into(), serde_json::json!("sre"));
        a.metadata.insert("zone".into(), serde_json::json!("eu"));

        let mut b = doc("body");
        b.metadata.insert("zone".into(), serde_json::json!("eu"));
        b.metadata.insert("team".into(), serde_json::json!("sre"));

        assert_eq!(Fingerprint::of(&a), Fingerprint::of(&b));
    }

    #[test]
    fn test_fingerprint_diff_classifies_parts() {
        let a = doc("before");
        let mut b = doc("after");
        b.metadata.insert("team".into(), serde_json::json!("sre"));

        let parts = Fingerprint::of(&a).diff(&Fingerprint::of(&b));
        assert!(parts.contains(&ChangedPart::Content));
        assert!(parts.contains(&ChangedPart::Metadata));
        assert!(!parts.contains(&ChangedPart::Structure));
    }

    #[test]
    fn test_quality_score_bounds() {
        let empty = doc("");
        assert_eq!(empty.quality_score(), 0);

        let mut rich = doc(&"x".repeat(2000));
        for i in 0..6 {
            rich.metadata
                .insert(format!("k{i}"), serde_json::json!(i));
        }
        rich.runbook = Some(Runbook {
            alert_types: vec!["disk_space_critical".into()],
            severities: vec![Severity::Critical],
            affected_systems: vec![],
            decision_tree: Some(DecisionTree {
                scenario: "disk_full".into(),
                root: DecisionNode {
                    condition: "usage > 90%".into(),
                    action: Some("run cleanup".into()),
                    confidence: Some(0.9),
                    branches: vec![],
                },
            }),
            procedures: vec![Procedure {
                id: "p1".into(),
                title: "cleanup".into(),
                steps: vec![],
                prerequisites: vec![],
                rollback: None,
            }],
            escalation: vec![],
            success_rate: Some(0.9),
            avg_resolution_seconds: None,
        });
        assert_eq!(rich.quality_score(), 10);
    }
}
