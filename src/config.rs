//! Runtime configuration, env-driven with code defaults.
//!
//! Everything is resolved once at startup and passed into constructors
//! explicitly; no component reads the environment at call time.

use std::path::PathBuf;

use crate::evaluation::{EvaluationConfig, FailAction};
use crate::planner::PlannerConfig;

/// Model host settings.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// OpenAI-compatible base URL, e.g. a local Ollama instance.
    pub base_url: String,
    pub primary_model: String,
    /// Larger model for evaluation escalation; unset disables escalation.
    pub escalation_model: Option<String>,
    pub embedding_model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            primary_model: "llama3.1".to_string(),
            escalation_model: None,
            embedding_model: "nomic-embed-text".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub port: u16,
    pub llm: LlmConfig,
    pub planner: PlannerConfig,
    pub evaluation: EvaluationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".scout/scout.db"),
            port: 8090,
            llm: LlmConfig::default(),
            planner: PlannerConfig::default(),
            evaluation: EvaluationConfig::default(),
        }
    }
}

impl Config {
    /// Build the config from `SCOUT_*` environment variables, falling back
    /// to the defaults above for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Some(path) = env_var("SCOUT_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(port) = env_var("SCOUT_PORT").and_then(|v| v.parse().ok()) {
            config.port = port;
        }

        if let Some(url) = env_var("SCOUT_LLM_BASE_URL") {
            config.llm.base_url = url;
        }
        if let Some(model) = env_var("SCOUT_MODEL_PRIMARY") {
            config.llm.primary_model = model;
        }
        if let Some(model) = env_var("SCOUT_MODEL_LARGE") {
            config.llm.escalation_model = Some(model);
        }
        if let Some(model) = env_var("SCOUT_MODEL_EMBEDDING") {
            config.llm.embedding_model = model;
        }

        if let Some(enabled) = env_var("SCOUT_DECOMPOSITION").map(|v| parse_bool(&v)) {
            config.planner.decomposition_enabled = enabled;
        }
        if let Some(max) = env_var("SCOUT_MAX_PLANNING_ITERATIONS").and_then(|v| v.parse().ok()) {
            config.planner.max_planning_iterations = max;
        }

        if let Some(enabled) = env_var("SCOUT_EVALUATION").map(|v| parse_bool(&v))
            && !enabled
        {
            config.evaluation = EvaluationConfig::disabled();
        }
        if let Some(action) = env_var("SCOUT_FAIL_ACTION") {
            config.evaluation.fail_action = match action.as_str() {
                "warn" => FailAction::Warn,
                "block" => FailAction::Block,
                _ => FailAction::Continue,
            };
        }
        config.evaluation.escalation_model = config.llm.escalation_model.clone();

        config
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes")
}
