//! Typed error hierarchy for the research orchestrator.
//!
//! Four top-level enums cover the subsystems:
//! - `OrchestratorError` - session-level failures
//! - `StoreError` - persistence failures (events and research results)
//! - `DecompositionError` - query decomposition failures
//! - `EvaluationError` - rubric evaluation failures

use thiserror::Error;

use crate::llm::LlmError;

/// Session-level errors raised by the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("query must not be empty")]
    EmptyQuery,

    #[error("planning failed: {0}")]
    Planning(String),

    #[error("evaluation blocked the session: {0}")]
    EvaluationBlocked(String),

    #[error("phase '{name}' failed: {error}")]
    PhaseFailed { name: String, error: String },

    #[error("failed to persist research result: {0}")]
    ResultPersistence(#[source] StoreError),

    #[error("unknown session {0}")]
    UnknownSession(uuid::Uuid),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("failed to serialize row payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("embedding generation failed: {0}")]
    Embedding(#[source] LlmError),

    #[error("research result {0} not found")]
    ResultNotFound(uuid::Uuid),
}

/// Errors from query decomposition. None are recovered inside the
/// decomposer; callers decide whether to degrade.
#[derive(Debug, Error)]
pub enum DecompositionError {
    #[error("decomposition LLM call failed: {0}")]
    Llm(#[source] LlmError),

    #[error("decomposition response invalid: {0}")]
    Parse(String),

    #[error("circular dependency among sub-queries")]
    CircularDependency,
}

/// Errors from the evaluation coordinator. Per-role failures degrade to
/// zero scores instead of raising; these are the hard failures.
#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("evaluation disabled for rubric '{0}'")]
    Disabled(String),

    #[error("artifact refinement failed: {0}")]
    Refine(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orchestrator_empty_query_is_matchable() {
        let err = OrchestratorError::EmptyQuery;
        assert!(matches!(err, OrchestratorError::EmptyQuery));
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn phase_failed_carries_name_and_error() {
        let err = OrchestratorError::PhaseFailed {
            name: "Initial Search".to_string(),
            error: "provider unreachable".to_string(),
        };
        assert!(err.to_string().contains("Initial Search"));
        assert!(err.to_string().contains("provider unreachable"));
    }

    #[test]
    fn store_error_converts_from_rusqlite() {
        let inner = rusqlite::Error::InvalidQuery;
        let err: StoreError = inner.into();
        assert!(matches!(err, StoreError::Database(_)));
    }

    #[test]
    fn decomposition_parse_error_formats() {
        let err = DecompositionError::Parse("missing isComplex".to_string());
        assert!(err.to_string().contains("missing isComplex"));
    }

    #[test]
    fn all_error_types_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&OrchestratorError::EmptyQuery);
        assert_std_error(&StoreError::LockPoisoned);
        assert_std_error(&DecompositionError::CircularDependency);
        assert_std_error(&EvaluationError::Disabled("plan".to_string()));
    }
}
