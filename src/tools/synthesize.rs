//! The `synthesize` executor: turns accumulated research context into a
//! final answer via the language model.
//!
//! Step configs arrive already enriched (query, context, prompts) by the
//! step-configuration layer; this executor only assembles the user prompt
//! and calls the model.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use super::{ToolError, ToolExecutor, ToolOutput, config_str};
use crate::llm::{ChatModel, ChatRequest};
use crate::model::Step;

pub struct SynthesizeExecutor {
    model: Arc<dyn ChatModel>,
}

impl SynthesizeExecutor {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl ToolExecutor for SynthesizeExecutor {
    async fn execute(&self, step: &Step, _log_id: Uuid) -> Result<ToolOutput, ToolError> {
        let query = config_str(step, "query")?;
        let system_prompt = config_str(step, "systemPrompt")?;
        let prompt = config_str(step, "prompt")?;
        let context = step
            .config
            .get("context")
            .and_then(|v| v.as_str())
            .unwrap_or("");

        let user_prompt = if context.is_empty() {
            format!("{prompt}\n\nQuestion: {query}")
        } else {
            format!("{prompt}\n\nQuestion: {query}\n\n{context}")
        };

        let response = self
            .model
            .chat(ChatRequest::new(&user_prompt).with_system(system_prompt))
            .await?;

        let mut output = ToolOutput::new(json!({"answer": response.content}));
        if let Some(tokens) = response.tokens_used {
            output = output.with_tokens(tokens);
        }
        Ok(output)
    }
}
