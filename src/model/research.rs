//! The persisted outcome of a successful research session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::plan::DecompositionSummary;

/// One source that contributed to the answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub url: String,
    pub title: String,
    pub relevance: f64,
}

/// Wall-clock time spent in one phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseTiming {
    pub phase: String,
    pub execution_time: u64,
}

/// Execution metadata attached to a research result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetadata {
    pub total_execution_time: u64,
    #[serde(default)]
    pub phases: Vec<PhaseTiming>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decomposition: Option<DecompositionSummary>,
    /// Evaluation summaries surfaced when `failAction = warn` or for audit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<Value>,
}

/// The final answer for a session, written at most once on success.
///
/// The embedding column is owned by the knowledge store and never travels
/// with the serialized result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchResult {
    pub id: Uuid,
    pub log_id: Uuid,
    pub plan_id: Uuid,
    pub query: String,
    pub answer: String,
    pub sources: Vec<Source>,
    pub metadata: ResultMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl ResearchResult {
    pub fn new(log_id: Uuid, plan_id: Uuid, query: &str, answer: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            log_id,
            plan_id,
            query: query.to_string(),
            answer: answer.to_string(),
            sources: Vec::new(),
            metadata: ResultMetadata::default(),
            confidence: None,
            created_at: Utc::now(),
        }
    }
}
