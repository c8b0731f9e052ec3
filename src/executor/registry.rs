//! Specialized phase executors and their dispatch registry.
//!
//! Dispatch is by case-insensitive substring on the phase name; the first
//! matching executor wins and the generic executor catches the rest.
//! Post-hooks (retrieval evaluation, answer extraction, confidence scoring)
//! are best-effort: they log their own failures and never change the
//! phase's outcome status.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use super::{ExecutionContext, PhaseRunner};
use crate::evaluation::{ConfidenceScorer, EvaluationCoordinator};
use crate::events::EventCoordinator;
use crate::model::{
    EventKind, Phase, PhaseOutcome, Plan, Source, StepResult, SynthesisSummary,
};

const SEARCH_NEEDLES: &[&str] = &["search", "query", "initial"];
const FETCH_NEEDLES: &[&str] = &["fetch", "gather", "content"];
const SYNTHESIS_NEEDLES: &[&str] = &["synth", "answer", "generat"];

fn name_matches(name: &str, needles: &[&str]) -> bool {
    let lower = name.to_lowercase();
    needles.iter().any(|n| lower.contains(n))
}

/// A phase executor: matching rule plus execution with optional hooks.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    fn can_handle(&self, phase: &Phase) -> bool;

    async fn execute(
        &self,
        phase: &mut Phase,
        plan: &Plan,
        ctx: &ExecutionContext,
    ) -> PhaseOutcome;
}

/// Search and fetch phases share the retrieval-evaluation post-hook; only
/// the matching rule differs.
pub struct RetrievalPhaseExecutor {
    needles: &'static [&'static str],
    runner: Arc<PhaseRunner>,
    evaluation: Arc<EvaluationCoordinator>,
}

impl RetrievalPhaseExecutor {
    pub fn search(runner: Arc<PhaseRunner>, evaluation: Arc<EvaluationCoordinator>) -> Self {
        Self {
            needles: SEARCH_NEEDLES,
            runner,
            evaluation,
        }
    }

    pub fn fetch(runner: Arc<PhaseRunner>, evaluation: Arc<EvaluationCoordinator>) -> Self {
        Self {
            needles: FETCH_NEEDLES,
            runner,
            evaluation,
        }
    }
}

#[async_trait]
impl PhaseExecutor for RetrievalPhaseExecutor {
    fn can_handle(&self, phase: &Phase) -> bool {
        name_matches(&phase.name, self.needles)
    }

    async fn execute(
        &self,
        phase: &mut Phase,
        plan: &Plan,
        ctx: &ExecutionContext,
    ) -> PhaseOutcome {
        let outcome = self.runner.execute(phase, plan, ctx).await;
        if outcome.is_success() && has_retrieved_content(&outcome.step_results) {
            let artifact = render_retrieved(&outcome.step_results);
            if let Err(err) = self
                .evaluation
                .evaluate_retrieval(ctx.log_id, &plan.query, artifact)
                .await
            {
                warn!(phase = %phase.name, error = %err, "retrieval evaluation failed; continuing");
            }
        }
        outcome
    }
}

fn has_retrieved_content(results: &[StepResult]) -> bool {
    results.iter().any(|r| {
        matches!(&r.output, Some(Value::Array(items)) if !items.is_empty())
    })
}

fn render_retrieved(results: &[StepResult]) -> String {
    let items: Vec<&Value> = results
        .iter()
        .filter_map(|r| r.output.as_ref())
        .filter(|o| o.is_array())
        .collect();
    serde_json::to_string(&items).unwrap_or_default()
}

/// Synthesis phases extract the answer and sources, then score confidence.
pub struct SynthesisPhaseExecutor {
    runner: Arc<PhaseRunner>,
    scorer: ConfidenceScorer,
    events: Arc<EventCoordinator>,
}

impl SynthesisPhaseExecutor {
    pub fn new(
        runner: Arc<PhaseRunner>,
        scorer: ConfidenceScorer,
        events: Arc<EventCoordinator>,
    ) -> Self {
        Self {
            runner,
            scorer,
            events,
        }
    }
}

#[async_trait]
impl PhaseExecutor for SynthesisPhaseExecutor {
    fn can_handle(&self, phase: &Phase) -> bool {
        name_matches(&phase.name, SYNTHESIS_NEEDLES)
    }

    async fn execute(
        &self,
        phase: &mut Phase,
        plan: &Plan,
        ctx: &ExecutionContext,
    ) -> PhaseOutcome {
        let mut outcome = self.runner.execute(phase, plan, ctx).await;
        if !outcome.is_success() {
            return outcome;
        }

        let sub_query_count = phase.sub_query_count.unwrap_or(0);
        self.events.emit_scoped(
            ctx.log_id,
            EventKind::FinalSynthesisStarted {
                phase_id: phase.id,
                sub_query_count,
            },
            Some(plan.id),
            Some(phase.id),
            None,
        );

        let Some(answer) = extract_answer(&outcome.step_results) else {
            warn!(phase = %phase.name, "no synthesize output found; skipping post-hooks");
            return outcome;
        };

        let mut sources = extract_sources(&ctx.previous_results);
        sources.extend(extract_sources(&outcome.step_results));

        self.events.emit_scoped(
            ctx.log_id,
            EventKind::FinalSynthesisCompleted {
                phase_id: phase.id,
                answer_length: answer.len() as u32,
                sub_query_count,
            },
            Some(plan.id),
            Some(phase.id),
            None,
        );

        self.events.emit_scoped(
            ctx.log_id,
            EventKind::ConfidenceScoringStarted {
                phase_name: phase.name.clone(),
                phase_id: phase.id,
            },
            Some(plan.id),
            Some(phase.id),
            None,
        );
        let confidence = match self.scorer.score(&plan.query, &answer).await {
            Ok(confidence) => {
                self.events.emit_scoped(
                    ctx.log_id,
                    EventKind::ConfidenceScoringCompleted {
                        phase_name: phase.name.clone(),
                        phase_id: phase.id,
                        confidence,
                    },
                    Some(plan.id),
                    Some(phase.id),
                    None,
                );
                Some(confidence)
            }
            Err(err) => {
                self.events.emit_scoped(
                    ctx.log_id,
                    EventKind::ConfidenceScoringFailed {
                        phase_name: phase.name.clone(),
                        phase_id: phase.id,
                        error: err.to_string(),
                    },
                    Some(plan.id),
                    Some(phase.id),
                    None,
                );
                None
            }
        };

        outcome.synthesis = Some(SynthesisSummary {
            answer,
            sources,
            confidence,
        });
        outcome
    }
}

/// Everything the specialized executors don't claim.
pub struct GenericPhaseExecutor {
    runner: Arc<PhaseRunner>,
}

impl GenericPhaseExecutor {
    pub fn new(runner: Arc<PhaseRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl PhaseExecutor for GenericPhaseExecutor {
    fn can_handle(&self, _phase: &Phase) -> bool {
        true
    }

    async fn execute(
        &self,
        phase: &mut Phase,
        plan: &Plan,
        ctx: &ExecutionContext,
    ) -> PhaseOutcome {
        self.runner.execute(phase, plan, ctx).await
    }
}

/// Ordered executor list; `get` returns the first match.
pub struct PhaseExecutorRegistry {
    executors: Vec<Arc<dyn PhaseExecutor>>,
}

impl PhaseExecutorRegistry {
    /// The standard ordering: search, fetch, synthesis, then generic.
    pub fn standard(
        runner: Arc<PhaseRunner>,
        evaluation: Arc<EvaluationCoordinator>,
        scorer: ConfidenceScorer,
        events: Arc<EventCoordinator>,
    ) -> Self {
        Self {
            executors: vec![
                Arc::new(RetrievalPhaseExecutor::search(
                    runner.clone(),
                    evaluation.clone(),
                )),
                Arc::new(RetrievalPhaseExecutor::fetch(runner.clone(), evaluation)),
                Arc::new(SynthesisPhaseExecutor::new(runner.clone(), scorer, events)),
                Arc::new(GenericPhaseExecutor::new(runner)),
            ],
        }
    }

    pub fn from_executors(executors: Vec<Arc<dyn PhaseExecutor>>) -> Self {
        Self { executors }
    }

    pub fn get(&self, phase: &Phase) -> Option<Arc<dyn PhaseExecutor>> {
        self.executors.iter().find(|e| e.can_handle(phase)).cloned()
    }
}

/// The answer text lives in the unique completed `synthesize` step: either
/// a string output or an object's `answer`/`text`/`content` field.
pub fn extract_answer(results: &[StepResult]) -> Option<String> {
    let result = results
        .iter()
        .filter(|r| r.tool_name == "synthesize" && r.is_success())
        .next_back()?;
    match result.output.as_ref()? {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => ["answer", "text", "content"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(|v| v.as_str()))
            .map(|s| s.to_string()),
        _ => None,
    }
}

/// Sources come from earlier results: array items carrying non-empty `url`
/// and `content`, or single objects with both.
pub fn extract_sources(results: &[StepResult]) -> Vec<Source> {
    let mut sources = Vec::new();
    for result in results {
        match &result.output {
            Some(Value::Array(items)) => {
                for item in items {
                    if let Some(source) = source_from_item(item) {
                        sources.push(source);
                    }
                }
            }
            Some(Value::Object(_)) => {
                if let Some(source) = result.output.as_ref().and_then(source_from_item) {
                    sources.push(source);
                }
            }
            _ => {}
        }
    }
    sources
}

fn source_from_item(item: &Value) -> Option<Source> {
    let url = item.get("url")?.as_str().filter(|u| !u.is_empty())?;
    item.get("content")?.as_str().filter(|c| !c.is_empty())?;
    let title = item
        .get("title")
        .and_then(|t| t.as_str())
        .filter(|t| !t.is_empty())
        .unwrap_or(url);
    let relevance = item
        .get("relevance")
        .and_then(|r| r.as_f64())
        .unwrap_or(1.0);
    Some(Source {
        url: url.to_string(),
        title: title.to_string(),
        relevance,
    })
}
