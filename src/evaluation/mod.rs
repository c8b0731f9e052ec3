//! Evaluation Coordinator: bounded iterative improvement over the plan,
//! retrieval and answer rubrics.
//!
//! Each rubric run asks one or more evaluator roles to score their
//! dimension subsets in [0,1]; per-dimension aggregation takes the last
//! emitted value, so role order decides ownership. A failed attempt with
//! iteration budget left asks the caller-supplied refiner for an improved
//! artifact; the final failing attempt re-runs on the escalation model when
//! one is configured. Role errors and timeouts degrade to zero scores
//! instead of raising.

pub mod config;
pub mod confidence;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::warn;
use uuid::Uuid;

use crate::errors::EvaluationError;
use crate::events::EventCoordinator;
use crate::llm::{ChatModel, ChatRequest, parse_json_response};
use crate::model::{EvaluationPhase, EventKind};

pub use config::{EvaluationConfig, EvaluatorRole, FailAction, RubricConfig};
pub use confidence::ConfidenceScorer;

/// Terminal status of a rubric run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    InProgress,
    Passed,
    Failed,
    Skipped,
}

/// Outcome of one rubric run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub phase: EvaluationPhase,
    pub status: EvaluationStatus,
    pub scores: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub total_iterations: u32,
    pub escalated_to_large_model: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl EvaluationResult {
    pub fn passed(&self) -> bool {
        self.status == EvaluationStatus::Passed
    }

    pub fn skipped(&self) -> bool {
        self.status == EvaluationStatus::Skipped
    }
}

/// Feedback handed to a refiner after a failed attempt.
#[derive(Debug, Clone)]
pub struct RefineFeedback {
    pub phase: EvaluationPhase,
    /// The artifact that failed the rubric.
    pub artifact: String,
    pub scores: BTreeMap<String, f64>,
    pub failing_dimensions: Vec<String>,
}

/// Produces an improved artifact after a failed evaluation attempt.
/// Returning `Ok(None)` means no improvement is possible; the loop stops.
#[async_trait]
pub trait ArtifactRefiner: Send + Sync {
    async fn refine(&self, feedback: &RefineFeedback) -> anyhow::Result<Option<String>>;
}

#[derive(Debug, Deserialize)]
struct RoleScores {
    scores: BTreeMap<String, f64>,
}

pub struct EvaluationCoordinator {
    model: Arc<dyn ChatModel>,
    events: Arc<EventCoordinator>,
    config: EvaluationConfig,
}

impl EvaluationCoordinator {
    pub fn new(
        model: Arc<dyn ChatModel>,
        events: Arc<EventCoordinator>,
        config: EvaluationConfig,
    ) -> Self {
        Self {
            model,
            events,
            config,
        }
    }

    pub fn fail_action(&self) -> FailAction {
        self.config.fail_action
    }

    pub async fn evaluate_plan(
        &self,
        log_id: Uuid,
        query: &str,
        plan_json: String,
        refiner: Option<&dyn ArtifactRefiner>,
    ) -> Result<EvaluationResult, EvaluationError> {
        self.evaluate(
            log_id,
            EvaluationPhase::Plan,
            &self.config.plan,
            query,
            plan_json,
            refiner,
        )
        .await
    }

    pub async fn evaluate_retrieval(
        &self,
        log_id: Uuid,
        query: &str,
        retrieved: String,
    ) -> Result<EvaluationResult, EvaluationError> {
        self.evaluate(
            log_id,
            EvaluationPhase::Retrieval,
            &self.config.retrieval,
            query,
            retrieved,
            None,
        )
        .await
    }

    pub async fn evaluate_answer(
        &self,
        log_id: Uuid,
        query: &str,
        answer: String,
        refiner: Option<&dyn ArtifactRefiner>,
    ) -> Result<EvaluationResult, EvaluationError> {
        self.evaluate(
            log_id,
            EvaluationPhase::Answer,
            &self.config.answer,
            query,
            answer,
            refiner,
        )
        .await
    }

    async fn evaluate(
        &self,
        log_id: Uuid,
        phase: EvaluationPhase,
        rubric: &RubricConfig,
        query: &str,
        mut artifact: String,
        refiner: Option<&dyn ArtifactRefiner>,
    ) -> Result<EvaluationResult, EvaluationError> {
        if !rubric.enabled {
            let result = EvaluationResult {
                phase,
                status: EvaluationStatus::Skipped,
                scores: BTreeMap::new(),
                confidence: None,
                total_iterations: 0,
                escalated_to_large_model: false,
                skip_reason: Some("rubric disabled".to_string()),
            };
            self.emit_completed(log_id, &result);
            return Ok(result);
        }

        self.events.emit(
            log_id,
            EventKind::EvaluationStarted {
                phase,
                query: Some(query.to_string()),
            },
        );

        let mut scores: BTreeMap<String, f64> = BTreeMap::new();
        let mut passed = false;
        let mut escalated = false;
        let mut iterations = 0;

        for attempt in 1..=rubric.max_attempts {
            iterations = attempt;
            scores = self.run_roles(rubric, query, &artifact, None).await;
            passed = rubric_passes(rubric, &scores);
            if passed {
                break;
            }

            let last_attempt = attempt == rubric.max_attempts;
            if last_attempt {
                if let Some(model) = &self.config.escalation_model {
                    scores = self
                        .run_roles(rubric, query, &artifact, Some(model.as_str()))
                        .await;
                    escalated = true;
                    passed = rubric_passes(rubric, &scores);
                }
                break;
            }

            if !self.config.iteration_enabled {
                break;
            }
            let Some(refiner) = refiner else {
                break;
            };

            let feedback = RefineFeedback {
                phase,
                artifact: artifact.clone(),
                scores: scores.clone(),
                failing_dimensions: failing_dimensions(rubric, &scores),
            };
            match refiner.refine(&feedback).await {
                Ok(Some(improved)) => artifact = improved,
                Ok(None) => break,
                Err(err) => {
                    self.events.emit(
                        log_id,
                        EventKind::EvaluationFailed {
                            phase,
                            error: err.to_string(),
                        },
                    );
                    return Err(EvaluationError::Refine(err));
                }
            }
        }

        let confidence = mean_score(&scores);
        let result = EvaluationResult {
            phase,
            status: if passed {
                EvaluationStatus::Passed
            } else {
                EvaluationStatus::Failed
            },
            scores,
            confidence,
            total_iterations: iterations,
            escalated_to_large_model: escalated,
            skip_reason: None,
        };
        self.emit_completed(log_id, &result);
        Ok(result)
    }

    /// Run every role and aggregate per-dimension scores, last writer wins.
    /// A role that errors, times out or returns malformed JSON scores its
    /// dimensions 0.
    async fn run_roles(
        &self,
        rubric: &RubricConfig,
        query: &str,
        artifact: &str,
        model_override: Option<&str>,
    ) -> BTreeMap<String, f64> {
        let mut aggregate = BTreeMap::new();
        for role in &rubric.roles {
            let role_scores = self
                .run_role(role, query, artifact, model_override, rubric)
                .await;
            match role_scores {
                Some(scores) => {
                    for dim in &role.dimensions {
                        let value = scores.get(dim).copied().unwrap_or(0.0);
                        aggregate.insert(dim.clone(), value.clamp(0.0, 1.0));
                    }
                }
                None => {
                    for dim in &role.dimensions {
                        aggregate.insert(dim.clone(), 0.0);
                    }
                }
            }
        }
        aggregate
    }

    async fn run_role(
        &self,
        role: &EvaluatorRole,
        query: &str,
        artifact: &str,
        model_override: Option<&str>,
        rubric: &RubricConfig,
    ) -> Option<BTreeMap<String, f64>> {
        let system = format!(
            "You are the '{}' evaluator. Score the artifact on these dimensions, each in \
             [0.0, 1.0]: {}. Respond with JSON only: {{\"scores\": {{\"<dimension>\": <score>}}}}",
            role.name,
            role.dimensions.join(", "),
        );
        let prompt = format!("Research question: {query}\n\nArtifact to evaluate:\n{artifact}");

        let mut request = ChatRequest::new(&prompt).with_system(&system);
        if let Some(model) = model_override.or(role.model.as_deref()) {
            request = request.with_model(model);
        }

        let response = match timeout(rubric.role_timeout, self.model.chat(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                warn!(role = %role.name, error = %err, "evaluator role failed");
                return None;
            }
            Err(_) => {
                warn!(role = %role.name, "evaluator role timed out");
                return None;
            }
        };

        match parse_json_response::<RoleScores>(&response.content) {
            Ok(parsed) => Some(parsed.scores),
            Err(err) => {
                warn!(role = %role.name, error = %err, "evaluator returned malformed scores");
                None
            }
        }
    }

    fn emit_completed(&self, log_id: Uuid, result: &EvaluationResult) {
        self.events.emit(
            log_id,
            EventKind::EvaluationCompleted {
                phase: result.phase,
                passed: result.passed(),
                scores: result.scores.clone(),
                confidence: result.confidence,
                total_iterations: result.total_iterations,
                escalated_to_large_model: result.escalated_to_large_model,
                evaluation_skipped: result.skipped(),
                skip_reason: result.skip_reason.clone(),
            },
        );
    }
}

fn rubric_passes(rubric: &RubricConfig, scores: &BTreeMap<String, f64>) -> bool {
    if scores.is_empty() {
        return false;
    }
    for (dim, threshold) in &rubric.dimension_thresholds {
        if scores.get(dim).copied().unwrap_or(0.0) < *threshold {
            return false;
        }
    }
    if let Some(severe) = rubric.severe_threshold
        && scores.values().any(|s| *s < severe)
    {
        return false;
    }
    mean_score(scores).unwrap_or(0.0) >= rubric.pass_threshold
}

fn failing_dimensions(rubric: &RubricConfig, scores: &BTreeMap<String, f64>) -> Vec<String> {
    rubric
        .dimension_thresholds
        .iter()
        .filter(|(dim, threshold)| scores.get(*dim).copied().unwrap_or(0.0) < **threshold)
        .map(|(dim, _)| dim.clone())
        .collect()
}

fn mean_score(scores: &BTreeMap<String, f64>) -> Option<f64> {
    if scores.is_empty() {
        None
    } else {
        Some(scores.values().sum::<f64>() / scores.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbHandle;
    use crate::llm::{ChatResponse, LlmError};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scores low on the first call, high afterwards.
    struct ImprovingModel {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ChatModel for ImprovingModel {
        async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, LlmError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let content = if call == 0 {
                r#"{"scores": {"completeness": 0.4, "relevance": 0.5, "efficiency": 0.4}}"#
            } else {
                r#"{"scores": {"completeness": 0.9, "relevance": 0.9, "efficiency": 0.8}}"#
            };
            Ok(ChatResponse {
                content: content.to_string(),
                tokens_used: None,
            })
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, LlmError> {
            Ok(vec![])
        }
    }

    struct StaticRefiner;

    #[async_trait]
    impl ArtifactRefiner for StaticRefiner {
        async fn refine(&self, feedback: &RefineFeedback) -> anyhow::Result<Option<String>> {
            assert!(!feedback.failing_dimensions.is_empty());
            Ok(Some("improved artifact".to_string()))
        }
    }

    fn coordinator(model: Arc<dyn ChatModel>, config: EvaluationConfig) -> EvaluationCoordinator {
        let events = Arc::new(EventCoordinator::new(DbHandle::in_memory().unwrap()));
        EvaluationCoordinator::new(model, events, config)
    }

    #[tokio::test]
    async fn passes_on_second_iteration_after_refinement() {
        let model = Arc::new(ImprovingModel {
            calls: AtomicU32::new(0),
        });
        let coordinator = coordinator(model, EvaluationConfig::default());
        let log_id = Uuid::new_v4();

        let result = coordinator
            .evaluate_plan(log_id, "q", "{}".to_string(), Some(&StaticRefiner))
            .await
            .unwrap();

        assert!(result.passed());
        assert_eq!(result.total_iterations, 2);
        assert!(!result.escalated_to_large_model);

        let events = coordinator.events.events_for_log(log_id).unwrap();
        assert_eq!(events[0].event_type, "evaluation_started");
        let completed = events.last().unwrap();
        assert_eq!(completed.event_type, "evaluation_completed");
        assert_eq!(completed.data["passed"], true);
        assert_eq!(completed.data["totalIterations"], 2);
    }

    #[tokio::test]
    async fn fails_without_refiner_after_first_attempt() {
        struct AlwaysLow;
        #[async_trait]
        impl ChatModel for AlwaysLow {
            async fn chat(&self, _r: ChatRequest) -> Result<ChatResponse, LlmError> {
                Ok(ChatResponse {
                    content: r#"{"scores": {"completeness": 0.2, "relevance": 0.2, "efficiency": 0.2}}"#.to_string(),
                    tokens_used: None,
                })
            }
            async fn embed(&self, _t: &str) -> Result<Vec<f32>, LlmError> {
                Ok(vec![])
            }
        }

        let coordinator = coordinator(Arc::new(AlwaysLow), EvaluationConfig::default());
        let result = coordinator
            .evaluate_plan(Uuid::new_v4(), "q", "{}".to_string(), None)
            .await
            .unwrap();

        assert!(!result.passed());
        assert_eq!(result.total_iterations, 1);
    }

    #[tokio::test]
    async fn escalates_on_final_attempt_when_configured() {
        /// Low scores on the primary model, high on the escalation model.
        struct EscalationModel;
        #[async_trait]
        impl ChatModel for EscalationModel {
            async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
                let content = if request.model.as_deref() == Some("large") {
                    r#"{"scores": {"completeness": 0.9, "relevance": 0.9, "efficiency": 0.9}}"#
                } else {
                    r#"{"scores": {"completeness": 0.3, "relevance": 0.3, "efficiency": 0.3}}"#
                };
                Ok(ChatResponse {
                    content: content.to_string(),
                    tokens_used: None,
                })
            }
            async fn embed(&self, _t: &str) -> Result<Vec<f32>, LlmError> {
                Ok(vec![])
            }
        }

        let mut config = EvaluationConfig::default();
        config.escalation_model = Some("large".to_string());
        config.plan.max_attempts = 1;

        let coordinator = coordinator(Arc::new(EscalationModel), config);
        let result = coordinator
            .evaluate_plan(Uuid::new_v4(), "q", "{}".to_string(), None)
            .await
            .unwrap();

        assert!(result.escalated_to_large_model);
        assert!(result.passed());
    }

    #[tokio::test]
    async fn role_error_scores_zero_and_fails() {
        struct BrokenModel;
        #[async_trait]
        impl ChatModel for BrokenModel {
            async fn chat(&self, _r: ChatRequest) -> Result<ChatResponse, LlmError> {
                Err(LlmError::EmptyResponse)
            }
            async fn embed(&self, _t: &str) -> Result<Vec<f32>, LlmError> {
                Ok(vec![])
            }
        }

        let coordinator = coordinator(Arc::new(BrokenModel), EvaluationConfig::default());
        let result = coordinator
            .evaluate_retrieval(Uuid::new_v4(), "q", "artifact".to_string())
            .await
            .unwrap();

        assert!(!result.passed());
        assert!(result.scores.values().all(|s| *s == 0.0));
    }

    #[tokio::test]
    async fn disabled_rubric_reports_skipped() {
        let model = Arc::new(ImprovingModel {
            calls: AtomicU32::new(0),
        });
        let coordinator = coordinator(model, EvaluationConfig::disabled());
        let log_id = Uuid::new_v4();

        let result = coordinator
            .evaluate_plan(log_id, "q", "{}".to_string(), None)
            .await
            .unwrap();

        assert!(result.skipped());
        assert_eq!(result.total_iterations, 0);

        let events = coordinator.events.events_for_log(log_id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "evaluation_completed");
        assert_eq!(events[0].data["evaluationSkipped"], true);
    }

    #[test]
    fn rubric_pass_requires_dimension_and_mean_thresholds() {
        let config = EvaluationConfig::default();
        let mut scores = BTreeMap::from([
            ("completeness".to_string(), 0.9),
            ("relevance".to_string(), 0.9),
            ("efficiency".to_string(), 0.9),
        ]);
        assert!(rubric_passes(&config.plan, &scores));

        // One dimension under its threshold fails even with a high mean.
        scores.insert("relevance".to_string(), 0.5);
        assert!(!rubric_passes(&config.plan, &scores));

        assert!(!rubric_passes(&config.plan, &BTreeMap::new()));
    }

    #[test]
    fn severe_threshold_fails_any_low_dimension() {
        let config = EvaluationConfig::default();
        let scores = BTreeMap::from([
            ("relevance".to_string(), 0.9),
            ("coverage".to_string(), 0.9),
            ("credibility".to_string(), 0.4),
        ]);
        assert!(!rubric_passes(&config.retrieval, &scores));
    }
}
