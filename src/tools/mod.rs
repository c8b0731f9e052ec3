//! Tool registry and the uniform executor contract.
//!
//! Concrete search/fetch providers live outside the core; they plug in by
//! implementing [`ToolExecutor`] and registering before startup. The crate
//! ships two executors of its own: `synthesize` (LLM synthesis) and
//! `knowledge_search` (prior-research lookup).

pub mod knowledge;
pub mod synthesize;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::llm::LlmError;
use crate::model::Step;

/// Errors surfaced by tool executors. These become failed step results,
/// never exceptions escaping to the phase driver.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("invalid step config: {0}")]
    InvalidConfig(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Store(#[from] crate::errors::StoreError),
}

/// What an executor hands back on success.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub output: Value,
    pub tokens_used: Option<u32>,
    pub metadata: Option<Value>,
}

impl ToolOutput {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            tokens_used: None,
            metadata: None,
        }
    }

    pub fn with_tokens(mut self, tokens_used: u32) -> Self {
        self.tokens_used = Some(tokens_used);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// The uniform tool contract. Implementations must be safe to call
/// concurrently.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, step: &Step, log_id: Uuid) -> Result<ToolOutput, ToolError>;
}

/// Name-to-executor resolution. Registration is process-wide and static
/// after startup.
#[derive(Default)]
pub struct ToolRegistry {
    executors: HashMap<String, Arc<dyn ToolExecutor>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, executor: Arc<dyn ToolExecutor>) {
        self.executors.insert(name.to_string(), executor);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ToolExecutor>, ToolError> {
        self.executors
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }
}

/// Read a required string field out of a step config.
pub(crate) fn config_str<'a>(step: &'a Step, key: &str) -> Result<&'a str, ToolError> {
    step.config
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ToolError::InvalidConfig(format!("missing '{key}'")))
}
