//! Confidence scoring for synthesized answers.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::llm::{ChatModel, ChatRequest, parse_json_response};

const CONFIDENCE_SYSTEM_PROMPT: &str = "You assess how well a research answer is supported \
    by its sources. Respond with JSON only: {\"confidence\": <number between 0.0 and 1.0>}";

#[derive(Debug, Deserialize)]
struct ConfidenceResponse {
    confidence: f64,
}

pub struct ConfidenceScorer {
    model: Arc<dyn ChatModel>,
}

impl ConfidenceScorer {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    /// Score an answer's confidence in [0,1].
    pub async fn score(&self, query: &str, answer: &str) -> Result<f64> {
        let prompt = format!("Question: {query}\n\nAnswer:\n{answer}");
        let response = self
            .model
            .chat(ChatRequest::new(&prompt).with_system(CONFIDENCE_SYSTEM_PROMPT))
            .await
            .context("confidence scoring LLM call failed")?;

        let parsed: ConfidenceResponse = parse_json_response(&response.content)
            .context("confidence response was not valid JSON")?;
        Ok(parsed.confidence.clamp(0.0, 1.0))
    }
}
