//! The `knowledge_search` executor: looks up prior research before going
//! out to the web.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use uuid::Uuid;

use super::{ToolError, ToolExecutor, ToolOutput, config_str};
use crate::knowledge::{HybridWeights, KnowledgeStore};
use crate::model::Step;

const DEFAULT_MAX_RESULTS: usize = 5;

pub struct KnowledgeSearchExecutor {
    store: Arc<KnowledgeStore>,
    /// When false, falls back to lexical-only lookup.
    hybrid: bool,
}

impl KnowledgeSearchExecutor {
    pub fn new(store: Arc<KnowledgeStore>) -> Self {
        Self {
            store,
            hybrid: true,
        }
    }

    pub fn lexical_only(store: Arc<KnowledgeStore>) -> Self {
        Self {
            store,
            hybrid: false,
        }
    }
}

#[async_trait]
impl ToolExecutor for KnowledgeSearchExecutor {
    async fn execute(&self, step: &Step, _log_id: Uuid) -> Result<ToolOutput, ToolError> {
        let query = config_str(step, "query")?;
        let max_results = step
            .config
            .get("maxResults")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_RESULTS);

        let matches = if self.hybrid {
            self.store
                .search_hybrid(query, max_results, HybridWeights::default())
                .await?
        } else {
            self.store.search_prior_research(query, max_results)?
        };

        let items: Vec<Value> = matches
            .iter()
            .map(|m| {
                json!({
                    "id": m.id,
                    "query": m.query,
                    "content": m.answer,
                    "score": m.score,
                })
            })
            .collect();

        Ok(ToolOutput::new(Value::Array(items))
            .with_metadata(json!({"channel": if self.hybrid { "hybrid" } else { "lexical" }})))
    }
}
