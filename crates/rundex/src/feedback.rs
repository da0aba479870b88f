//! Append-only resolution feedback.
//!
//! Feedback entries record how an incident was resolved and whether the
//! retrieved guidance worked. The store is append-only: nothing is ever
//! rewritten or deleted, and writes for one incident are serialized so the
//! recorded sequence for any incident is a stable prefix of later reads.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::document::Feedback;

/// Outcome payload of `record_resolution_feedback`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RecordedFeedback {
    pub recorded: bool,
    pub feedback_id: String,
}

/// In-memory append-only feedback store.
#[derive(Default)]
pub struct FeedbackStore {
    entries: DashMap<String, Arc<Mutex<Vec<Feedback>>>>,
}

impl FeedbackStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one feedback entry for an incident.
    pub async fn record(
        &self,
        incident_id: &str,
        resolution_seconds: u64,
        success: bool,
        method: Option<String>,
        notes: HashMap<String, serde_json::Value>,
    ) -> RecordedFeedback {
        let entry = Feedback {
            feedback_id: Uuid::new_v4().to_string(),
            incident_id: incident_id.to_string(),
            resolution_seconds,
            success,
            method,
            notes,
            recorded_at: Utc::now(),
        };
        let feedback_id = entry.feedback_id.clone();

        let log = self
            .entries
            .entry(incident_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone();
        // The per-incident mutex serializes appends; readers see a prefix.
        log.lock().await.push(entry);

        tracing::info!(
            incident_id = %incident_id,
            feedback_id = %feedback_id,
            success,
            "resolution feedback recorded"
        );

        RecordedFeedback {
            recorded: true,
            feedback_id,
        }
    }

    /// Full history for an incident, in record order.
    pub async fn history(&self, incident_id: &str) -> Vec<Feedback> {
        // Clone the Arc out before awaiting; map guards must not be held
        // across suspension points.
        let log = self.entries.get(incident_id).map(|e| e.value().clone());
        match log {
            Some(log) => log.lock().await.clone(),
            None => Vec::new(),
        }
    }

    /// Total recorded entries across incidents.
    pub async fn len(&self) -> usize {
        let logs: Vec<Arc<Mutex<Vec<Feedback>>>> = self
            .entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut total = 0;
        for log in logs {
            total += log.lock().await.len();
        }
        total
    }

    /// Whether the store holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
