//! Session Controller: drives the whole research lifecycle and owns
//! runtime session state.
//!
//! One spawned task per session walks planning, plan evaluation, phase
//! execution, answer evaluation and result persistence. Any unrecovered
//! error emits `session_failed` and marks the session failed; a failed
//! final save also fails the session, because the result is not
//! recoverable. Sessions are never tied to subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::OrchestratorError;
use crate::evaluation::{
    ArtifactRefiner, EvaluationCoordinator, EvaluationResult, FailAction, RefineFeedback,
};
use crate::events::EventCoordinator;
use crate::executor::registry::{PhaseExecutorRegistry, extract_answer, extract_sources};
use crate::executor::ExecutionContext;
use crate::knowledge::KnowledgeStore;
use crate::llm::{ChatModel, ChatRequest};
use crate::model::{
    EventKind, EvaluationPhase, PhaseStatus, PhaseTiming, Plan, ResearchResult, ResultMetadata,
    SynthesisSummary,
};
use crate::planner::Planner;

/// Runtime status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Planning,
    Executing,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Runtime state for one research run. Lives until the process exits; the
/// events and final result persist.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub log_id: Uuid,
    pub query: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<Uuid>,
}

pub struct SessionController {
    events: Arc<EventCoordinator>,
    planner: Arc<Planner>,
    registry: Arc<PhaseExecutorRegistry>,
    evaluation: Arc<EvaluationCoordinator>,
    knowledge: Arc<KnowledgeStore>,
    model: Arc<dyn ChatModel>,
    sessions: Mutex<HashMap<Uuid, Session>>,
}

impl SessionController {
    pub fn new(
        events: Arc<EventCoordinator>,
        planner: Arc<Planner>,
        registry: Arc<PhaseExecutorRegistry>,
        evaluation: Arc<EvaluationCoordinator>,
        knowledge: Arc<KnowledgeStore>,
        model: Arc<dyn ChatModel>,
    ) -> Self {
        Self {
            events,
            planner,
            registry,
            evaluation,
            knowledge,
            model,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Validate the query, create the session and spawn its run. Returns
    /// immediately with the session's logId.
    pub fn start_session(self: &Arc<Self>, query: &str) -> Result<Uuid, OrchestratorError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(OrchestratorError::EmptyQuery);
        }

        let log_id = Uuid::new_v4();
        self.insert_session(Session {
            log_id,
            query: query.to_string(),
            status: SessionStatus::Planning,
            started_at: Utc::now(),
            finished_at: None,
            plan_id: None,
        });

        let controller = Arc::clone(self);
        let query = query.to_string();
        tokio::spawn(async move {
            controller.run_session(log_id, query).await;
        });
        Ok(log_id)
    }

    /// Drive a session to its terminal state. Used directly by the one-shot
    /// CLI path; HTTP submissions go through [`Self::start_session`].
    pub async fn run_session(&self, log_id: Uuid, query: String) {
        match self.drive(log_id, &query).await {
            Ok(()) => {
                self.finish_session(log_id, SessionStatus::Completed);
                info!(log_id = %log_id, "session completed");
            }
            Err(err) => {
                self.events.emit(
                    log_id,
                    EventKind::SessionFailed {
                        error: err.to_string(),
                    },
                );
                self.finish_session(log_id, SessionStatus::Failed);
                warn!(log_id = %log_id, error = %err, "session failed");
            }
        }
    }

    async fn drive(&self, log_id: Uuid, query: &str) -> Result<(), OrchestratorError> {
        let session_start = Instant::now();
        self.events.emit(
            log_id,
            EventKind::SessionStarted {
                query: query.to_string(),
            },
        );

        let mut plan = self.planner.create_plan(query, log_id).await;
        self.update_session(log_id, |s| s.plan_id = Some(plan.id));

        let plan_evaluation = self.evaluate_plan(log_id, query, &mut plan).await?;

        self.update_session(log_id, |s| s.status = SessionStatus::Executing);
        plan.status = PhaseStatus::Running;

        let mut ctx = ExecutionContext::new(log_id);
        let mut timings: Vec<PhaseTiming> = Vec::new();
        let mut synthesis: Option<SynthesisSummary> = None;

        // Phases move out of the plan for the loop so each can be mutated
        // while the executors read the plan-level fields.
        let mut phases = std::mem::take(&mut plan.phases);
        for phase in phases.iter_mut() {
            let Some(executor) = self.registry.get(phase) else {
                warn!(phase = %phase.name, "no executor matched; skipping phase");
                phase.status = PhaseStatus::Skipped;
                continue;
            };

            let phase_start = Instant::now();
            let outcome = executor.execute(phase, &plan, &ctx).await;
            timings.push(PhaseTiming {
                phase: phase.name.clone(),
                execution_time: phase_start.elapsed().as_millis() as u64,
            });

            ctx.previous_results.extend(outcome.step_results.clone());
            if let Some(summary) = outcome.synthesis.clone() {
                synthesis = Some(summary);
            }

            if !outcome.is_success() {
                return Err(OrchestratorError::PhaseFailed {
                    name: phase.name.clone(),
                    error: outcome
                        .error
                        .unwrap_or_else(|| "phase failed".to_string()),
                });
            }
        }
        plan.phases = phases;
        plan.status = PhaseStatus::Completed;

        let mut answer = match &synthesis {
            Some(summary) => summary.answer.clone(),
            None => extract_answer(&ctx.previous_results)
                .ok_or_else(|| anyhow!("no synthesized answer produced"))?,
        };

        let answer_evaluation = self
            .evaluate_answer(log_id, query, &mut answer)
            .await?;

        let sources = match &synthesis {
            Some(summary) if !summary.sources.is_empty() => summary.sources.clone(),
            _ => extract_sources(&ctx.previous_results),
        };

        let mut result = ResearchResult::new(log_id, plan.id, query, &answer);
        result.sources = sources;
        result.confidence = synthesis
            .as_ref()
            .and_then(|s| s.confidence)
            .map(|c| json!({"score": c}));
        result.metadata = ResultMetadata {
            total_execution_time: session_start.elapsed().as_millis() as u64,
            phases: timings,
            decomposition: plan.decomposition,
            evaluation: evaluation_metadata(
                self.evaluation.fail_action(),
                &plan_evaluation,
                &answer_evaluation,
            ),
        };

        self.knowledge
            .save(&result)
            .await
            .map_err(OrchestratorError::ResultPersistence)?;

        self.events.emit(log_id, EventKind::SessionCompleted {});
        Ok(())
    }

    /// Run the plan rubric, honoring failAction and adopting a refined plan
    /// when iteration produced one.
    async fn evaluate_plan(
        &self,
        log_id: Uuid,
        query: &str,
        plan: &mut Plan,
    ) -> Result<Option<EvaluationResult>, OrchestratorError> {
        let artifact = match serde_json::to_string_pretty(plan) {
            Ok(json) => json,
            Err(err) => {
                warn!(error = %err, "could not serialize plan for evaluation");
                return Ok(None);
            }
        };

        let refiner = PlanRefiner {
            planner: self.planner.clone(),
            query: query.to_string(),
            candidate: Mutex::new(None),
        };
        let result = self
            .evaluation
            .evaluate_plan(log_id, query, artifact, Some(&refiner))
            .await;

        let result = match result {
            Ok(result) => result,
            Err(err) => {
                warn!(error = %err, "plan evaluation errored; continuing with current plan");
                return Ok(None);
            }
        };

        if let Some(revised) = refiner.take_candidate() {
            *plan = revised;
            self.update_session(log_id, |s| s.plan_id = Some(plan.id));
        }

        if !result.passed()
            && !result.skipped()
            && self.evaluation.fail_action() == FailAction::Block
        {
            return Err(OrchestratorError::EvaluationBlocked(
                "plan evaluation failed".to_string(),
            ));
        }
        Ok(Some(result))
    }

    /// Run the answer rubric, honoring failAction and adopting a
    /// regenerated answer when iteration produced one.
    async fn evaluate_answer(
        &self,
        log_id: Uuid,
        query: &str,
        answer: &mut String,
    ) -> Result<Option<EvaluationResult>, OrchestratorError> {
        let refiner = AnswerRefiner {
            model: self.model.clone(),
            query: query.to_string(),
            candidate: Mutex::new(None),
        };
        let result = self
            .evaluation
            .evaluate_answer(log_id, query, answer.clone(), Some(&refiner))
            .await;

        let result = match result {
            Ok(result) => result,
            Err(err) => {
                warn!(error = %err, "answer evaluation errored; keeping current answer");
                return Ok(None);
            }
        };

        if let Some(regenerated) = refiner.take_candidate() {
            *answer = regenerated;
        }

        if !result.passed()
            && !result.skipped()
            && self.evaluation.fail_action() == FailAction::Block
        {
            return Err(OrchestratorError::EvaluationBlocked(
                "answer evaluation failed".to_string(),
            ));
        }
        Ok(Some(result))
    }

    // ── Session map ──────────────────────────────────────────────────

    pub fn session(&self, log_id: Uuid) -> Option<Session> {
        self.lock_sessions().get(&log_id).cloned()
    }

    pub fn session_status(&self, log_id: Uuid) -> Option<SessionStatus> {
        self.lock_sessions().get(&log_id).map(|s| s.status)
    }

    fn insert_session(&self, session: Session) {
        self.lock_sessions().insert(session.log_id, session);
    }

    fn update_session(&self, log_id: Uuid, f: impl FnOnce(&mut Session)) {
        if let Some(session) = self.lock_sessions().get_mut(&log_id) {
            f(session);
        }
    }

    fn finish_session(&self, log_id: Uuid, status: SessionStatus) {
        self.update_session(log_id, |s| {
            s.status = status;
            s.finished_at = Some(Utc::now());
        });
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Builds the evaluation portion of the result metadata. Failures surface
/// as warnings when failAction is `warn`.
fn evaluation_metadata(
    fail_action: FailAction,
    plan: &Option<EvaluationResult>,
    answer: &Option<EvaluationResult>,
) -> Option<Value> {
    if plan.is_none() && answer.is_none() {
        return None;
    }
    let mut body = serde_json::Map::new();
    let mut warnings: Vec<String> = Vec::new();

    for (name, result) in [("plan", plan), ("answer", answer)] {
        if let Some(result) = result {
            if let Ok(value) = serde_json::to_value(result) {
                body.insert(name.to_string(), value);
            }
            if fail_action == FailAction::Warn && !result.passed() && !result.skipped() {
                warnings.push(format!("{name} evaluation failed"));
            }
        }
    }
    if !warnings.is_empty() {
        body.insert("warnings".to_string(), json!(warnings));
    }
    Some(Value::Object(body))
}

/// Re-plans through the Planner when the plan rubric fails.
struct PlanRefiner {
    planner: Arc<Planner>,
    query: String,
    candidate: Mutex<Option<Plan>>,
}

impl PlanRefiner {
    fn take_candidate(&self) -> Option<Plan> {
        self.candidate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

#[async_trait]
impl ArtifactRefiner for PlanRefiner {
    async fn refine(&self, feedback: &RefineFeedback) -> anyhow::Result<Option<String>> {
        match self
            .planner
            .revise_plan(&self.query, &feedback.failing_dimensions)
            .await
        {
            Ok(plan) => {
                let serialized = serde_json::to_string_pretty(&plan)?;
                *self
                    .candidate
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(plan);
                Ok(Some(serialized))
            }
            Err(err) => {
                warn!(error = %err, "plan revision failed; stopping iteration");
                Ok(None)
            }
        }
    }
}

/// Regenerates the answer when the answer rubric fails.
struct AnswerRefiner {
    model: Arc<dyn ChatModel>,
    query: String,
    candidate: Mutex<Option<String>>,
}

impl AnswerRefiner {
    fn take_candidate(&self) -> Option<String> {
        self.candidate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

#[async_trait]
impl ArtifactRefiner for AnswerRefiner {
    async fn refine(&self, feedback: &RefineFeedback) -> anyhow::Result<Option<String>> {
        debug_assert_eq!(feedback.phase, EvaluationPhase::Answer);
        let prompt = format!(
            "The following answer scored poorly on: {}.\n\nQuestion: {}\n\nAnswer:\n{}\n\n\
             Rewrite the answer to fix those weaknesses. Respond with the improved answer only.",
            feedback.failing_dimensions.join(", "),
            self.query,
            feedback.artifact,
        );
        match self.model.chat(ChatRequest::new(&prompt)).await {
            Ok(response) => {
                *self
                    .candidate
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) =
                    Some(response.content.clone());
                Ok(Some(response.content))
            }
            Err(err) => {
                warn!(error = %err, "answer regeneration failed; stopping iteration");
                Ok(None)
            }
        }
    }
}
