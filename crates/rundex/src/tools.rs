//! The engine's typed tool surface.
//!
//! Seven operations, each with its own argument and response types. The
//! wire layers (tool-call RPC, HTTP/JSON) translate requests onto these
//! types 1:1; inside the engine there is no stringly-typed dispatch.
//!
//! Every response is wrapped in a [`ResponseEnvelope`] carrying timing,
//! degradation flags, partial failures, the corpus epoch, and a
//! correlation id.
//!
//! Argument structs double as the cache-key normalization: serialization
//! omits defaulted fields, collections are sorted, and enums are lowercase,
//! so equivalent calls hash to the same key.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::adapter::SearchFilters;
use crate::document::{Procedure, ProcedureStep, Severity};
use crate::error::{EngineError, Result};
use crate::health::HealthSnapshot;
use crate::matcher::PartialFailure;

/// The seven tool operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    SearchRunbooks,
    GetDecisionTree,
    GetProcedure,
    GetEscalationPath,
    ListSources,
    SearchKnowledgeBase,
    RecordResolutionFeedback,
}

impl ToolName {
    /// Stable wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            ToolName::SearchRunbooks => "search_runbooks",
            ToolName::GetDecisionTree => "get_decision_tree",
            ToolName::GetProcedure => "get_procedure",
            ToolName::GetEscalationPath => "get_escalation_path",
            ToolName::ListSources => "list_sources",
            ToolName::SearchKnowledgeBase => "search_knowledge_base",
            ToolName::RecordResolutionFeedback => "record_resolution_feedback",
        }
    }

    /// All tools, in wire order.
    pub fn all() -> [ToolName; 7] {
        [
            ToolName::SearchRunbooks,
            ToolName::GetDecisionTree,
            ToolName::GetProcedure,
            ToolName::GetEscalationPath,
            ToolName::ListSources,
            ToolName::SearchKnowledgeBase,
            ToolName::RecordResolutionFeedback,
        ]
    }
}

impl std::str::FromStr for ToolName {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        ToolName::all()
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EngineError::validation("tool", format!("unknown tool: {s}")))
    }
}

impl std::fmt::Display for ToolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Response Envelope
// ============================================================================

/// Uniform response wrapper for every tool operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope<T> {
    pub data: T,
    pub retrieval_time_ms: u64,
    /// Confidence per result, where applicable.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub confidence_scores: Vec<f64>,
    /// Partial response: some adapters failed or were excluded.
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partial_failures: Vec<PartialFailure>,
    /// Envelope-level annotations for empty results (e.g.
    /// `no_sources_available`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_reasons: Vec<crate::matcher::MatchReason>,
    /// The caller's deadline elapsed; collected partial results returned.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deadline_exceeded: bool,
    pub corpus_epoch: u64,
    /// Served from cache.
    pub cache_hit: bool,
    pub correlation_id: String,
}

impl<T> ResponseEnvelope<T> {
    /// A fresh envelope with a new correlation id.
    pub fn new(data: T, corpus_epoch: u64) -> Self {
        Self {
            data,
            retrieval_time_ms: 0,
            confidence_scores: Vec::new(),
            degraded: false,
            partial_failures: Vec::new(),
            match_reasons: Vec::new(),
            deadline_exceeded: false,
            corpus_epoch,
            cache_hit: false,
            correlation_id: Uuid::new_v4().to_string(),
        }
    }
}

// ============================================================================
// Arguments
// ============================================================================

/// Arguments for `search_runbooks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRunbooksArgs {
    pub alert_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affected_systems: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_confidence: Option<f64>,
}

impl SearchRunbooksArgs {
    pub fn validate(&self) -> Result<()> {
        if self.alert_type.trim().is_empty() {
            return Err(EngineError::validation("alert_type", "must not be empty"));
        }
        if let Some(min) = self.min_confidence {
            if !(0.0..=1.0).contains(&min) {
                return Err(EngineError::validation(
                    "min_confidence",
                    "must be within [0, 1]",
                ));
            }
        }
        Ok(())
    }

    /// Deterministic serialization for cache keying.
    pub fn normalized(&self) -> serde_json::Value {
        let mut systems: Vec<String> = self
            .affected_systems
            .iter()
            .map(|s| s.to_lowercase())
            .collect();
        systems.sort();
        let context: BTreeMap<&String, &serde_json::Value> = self.context.iter().collect();

        let mut map = serde_json::Map::new();
        map.insert(
            "alert_type".into(),
            serde_json::json!(self.alert_type.to_lowercase()),
        );
        if let Some(severity) = self.severity {
            map.insert("severity".into(), serde_json::json!(severity.as_str()));
        }
        if !systems.is_empty() {
            map.insert("affected_systems".into(), serde_json::json!(systems));
        }
        if !context.is_empty() {
            map.insert("context".into(), serde_json::json!(context));
        }
        if let Some(max) = self.max_results {
            map.insert("max_results".into(), serde_json::json!(max));
        }
        if let Some(min) = self.min_confidence {
            map.insert("min_confidence".into(), serde_json::json!(min));
        }
        serde_json::Value::Object(map)
    }
}

/// Arguments for `get_decision_tree`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetDecisionTreeArgs {
    pub scenario: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

impl GetDecisionTreeArgs {
    pub fn validate(&self) -> Result<()> {
        if self.scenario.trim().is_empty() {
            return Err(EngineError::validation("scenario", "must not be empty"));
        }
        Ok(())
    }

    pub fn normalized(&self) -> serde_json::Value {
        let context: BTreeMap<&String, &serde_json::Value> = self.context.iter().collect();
        let mut value = serde_json::json!({
            "scenario": self.scenario.to_lowercase(),
        });
        if !context.is_empty() {
            if let Some(map) = value.as_object_mut() {
                map.insert("context".into(), serde_json::json!(context));
            }
        }
        value
    }
}

/// Arguments for `get_procedure`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetProcedureArgs {
    pub procedure_id: String,
    /// 1-based step index; omitted returns the full procedure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
}

impl GetProcedureArgs {
    pub fn validate(&self) -> Result<()> {
        if self.procedure_id.trim().is_empty() {
            return Err(EngineError::validation("procedure_id", "must not be empty"));
        }
        if self.step == Some(0) {
            return Err(EngineError::validation("step", "steps are numbered from 1"));
        }
        Ok(())
    }

    pub fn normalized(&self) -> serde_json::Value {
        match self.step {
            Some(step) => serde_json::json!({"procedure_id": self.procedure_id, "step": step}),
            None => serde_json::json!({"procedure_id": self.procedure_id}),
        }
    }
}

/// Arguments for `get_escalation_path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetEscalationPathArgs {
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_hours: Option<bool>,
}

impl GetEscalationPathArgs {
    pub fn normalized(&self) -> serde_json::Value {
        let mut value = serde_json::json!({
            "severity": self.severity.as_str(),
        });
        if let Some(map) = value.as_object_mut() {
            if let Some(hours) = self.business_hours {
                map.insert("business_hours".into(), serde_json::json!(hours));
            }
            let context: BTreeMap<&String, &serde_json::Value> = self.context.iter().collect();
            if !context.is_empty() {
                map.insert("context".into(), serde_json::json!(context));
            }
        }
        value
    }
}

/// Arguments for `list_sources`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListSourcesArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_health: Option<bool>,
}

/// Arguments for `search_knowledge_base`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchKnowledgeBaseArgs {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<SearchFilters>,
}

impl SearchKnowledgeBaseArgs {
    pub fn validate(&self) -> Result<()> {
        if self.query.trim().is_empty() {
            return Err(EngineError::validation("query", "must not be empty"));
        }
        if let Some(min) = self.filters.as_ref().and_then(|f| f.min_confidence) {
            if !(0.0..=1.0).contains(&min) {
                return Err(EngineError::validation(
                    "filters.min_confidence",
                    "must be within [0, 1]",
                ));
            }
        }
        Ok(())
    }

    pub fn normalized(&self) -> serde_json::Value {
        let mut value = serde_json::json!({
            "query": self.query.to_lowercase(),
        });
        if let (Some(map), Some(filters)) = (value.as_object_mut(), &self.filters) {
            let encoded = serde_json::to_value(filters).unwrap_or(serde_json::Value::Null);
            if encoded.as_object().is_some_and(|o| !o.is_empty()) {
                map.insert("filters".into(), encoded);
            }
        }
        value
    }
}

/// The outcome block of `record_resolution_feedback`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackOutcome {
    pub resolution_seconds: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

/// Arguments for `record_resolution_feedback`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordFeedbackArgs {
    pub incident_id: String,
    pub outcome: FeedbackOutcome,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub feedback: HashMap<String, serde_json::Value>,
}

impl RecordFeedbackArgs {
    pub fn validate(&self) -> Result<()> {
        if self.incident_id.trim().is_empty() {
            return Err(EngineError::validation("incident_id", "must not be empty"));
        }
        Ok(())
    }
}

// ============================================================================
// Responses
// ============================================================================

/// One entry of `list_sources`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub adapter_type: String,
    pub document_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<chrono::DateTime<chrono::Utc>>,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthSnapshot>,
}

/// `get_procedure` returns the whole procedure or a single step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProcedureView {
    Full(Procedure),
    Step(ProcedureStep),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_names_roundtrip() {
        for tool in ToolName::all() {
            let parsed: ToolName = tool.as_str().parse().unwrap();
            assert_eq!(parsed, tool);
        }
        assert!("fetch_runbooks".parse::<ToolName>().is_err());
    }

    #[test]
    fn test_normalization_sorts_and_lowercases() {
        let a = SearchRunbooksArgs {
            alert_type: "Disk_Space_Critical".to_string(),
            severity: Some(Severity::Critical),
            affected_systems: vec!["Web-01".to_string(), "db-01".to_string()],
            context: HashMap::new(),
            max_results: None,
            min_confidence: None,
        };
        let b = SearchRunbooksArgs {
            alert_type: "disk_space_critical".to_string(),
            severity: Some(Severity::Critical),
            affected_systems: vec!["db-01".to_string(), "web-01".to_string()],
            context: HashMap::new(),
            max_results: None,
            min_confidence: None,
        };
        assert_eq!(a.normalized(), b.normalized());
    }

    #[test]
    fn test_normalization_omits_defaults() {
        let minimal = SearchRunbooksArgs {
            alert_type: "disk_space_critical".to_string(),
            severity: None,
            affected_systems: vec![],
            context: HashMap::new(),
            max_results: None,
            min_confidence: None,
        };
        let value = minimal.normalized();
        let map = value.as_object().unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("alert_type"));
    }

    #[test]
    fn test_validation() {
        let args = SearchRunbooksArgs {
            alert_type: "  ".to_string(),
            severity: None,
            affected_systems: vec![],
            context: HashMap::new(),
            max_results: None,
            min_confidence: None,
        };
        assert_eq!(args.validate().unwrap_err().code(), "validation");

        let args = GetProcedureArgs {
            procedure_id: "p".to_string(),
            step: Some(0),
        };
        assert_eq!(args.validate().unwrap_err().code(), "validation");

        let args = SearchKnowledgeBaseArgs {
            query: "q".to_string(),
            filters: Some(SearchFilters {
                min_confidence: Some(1.5),
                ..Default::default()
            }),
        };
        assert_eq!(args.validate().unwrap_err().code(), "validation");
    }

    #[test]
    fn test_envelope_serialization_omits_clean_flags() {
        let envelope = ResponseEnvelope::new(vec![1, 2, 3], 7);
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["corpus_epoch"], serde_json::json!(7));
        assert!(json.get("partial_failures").is_none());
        assert!(json.get("deadline_exceeded").is_none());
    }
}
