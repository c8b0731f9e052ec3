//! Phase Executor: drives a single phase's steps as a dependency-layered
//! sequence of concurrent batches.
//!
//! Step errors never escape as exceptions; each becomes a failed
//! `StepResult`. A failed batch stops the phase before the next batch
//! starts, and remaining steps are marked skipped.

pub mod registry;

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dag;
use crate::events::EventCoordinator;
use crate::milestones::MilestoneEmitter;
use crate::model::{
    EventKind, Phase, PhaseOutcome, PhaseStatus, Plan, Step, StepErrorInfo, StepResult,
    StepStatus,
};
use crate::steps;
use crate::tools::{ToolError, ToolRegistry};

/// Session-wide execution state handed down to each phase.
pub struct ExecutionContext {
    pub log_id: Uuid,
    /// Results from all previous phases, in phase order.
    pub previous_results: Vec<StepResult>,
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(log_id: Uuid) -> Self {
        Self {
            log_id,
            previous_results: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }
}

pub struct PhaseRunner {
    tools: Arc<ToolRegistry>,
    events: Arc<EventCoordinator>,
    milestones: MilestoneEmitter,
}

impl PhaseRunner {
    pub fn new(tools: Arc<ToolRegistry>, events: Arc<EventCoordinator>) -> Self {
        let milestones = MilestoneEmitter::new(events.clone());
        Self {
            tools,
            events,
            milestones,
        }
    }

    /// Run one phase to a terminal state.
    pub async fn execute(
        &self,
        phase: &mut Phase,
        plan: &Plan,
        ctx: &ExecutionContext,
    ) -> PhaseOutcome {
        phase.status = PhaseStatus::Running;
        self.events.emit_phase_started(ctx.log_id, phase);
        self.milestones.emit_for_phase(phase, ctx.log_id, &plan.query);

        let layering = dag::layer(&phase.steps);
        let mut results: Vec<StepResult> = Vec::new();
        let mut any_failed = false;

        for batch in &layering.layers {
            // What synthesis enrichment and config defaults observe: all
            // previous phases plus earlier batches of this phase.
            let accumulated: Vec<StepResult> = ctx
                .previous_results
                .iter()
                .chain(results.iter())
                .cloned()
                .collect();

            let mut batch_steps: Vec<Step> = Vec::with_capacity(batch.len());
            for &idx in batch {
                let step = &mut phase.steps[idx];
                if step.tool_name == "synthesize" {
                    steps::enrich_synthesize_step(step, plan, &accumulated);
                }
                if step.config.is_empty() {
                    step.config = steps::default_config(&step.tool_name, Some(plan), &accumulated);
                }
                step.status = StepStatus::Running;
                batch_steps.push(step.clone());
            }

            let futures = batch_steps.into_iter().map(|step| self.run_step(step, ctx));
            let batch_results = join_all(futures).await;

            for (result, &idx) in batch_results.into_iter().zip(batch.iter()) {
                phase.steps[idx].status = if result.is_success() {
                    StepStatus::Completed
                } else {
                    any_failed = true;
                    StepStatus::Failed
                };
                results.push(result);
            }

            if any_failed {
                break;
            }
        }

        // Results hand off in step declaration order, not batch or
        // completion order.
        let order_of = |step_id: Uuid| {
            phase
                .steps
                .iter()
                .position(|s| s.id == step_id)
                .unwrap_or(usize::MAX)
        };
        results.sort_by_key(|r| order_of(r.step_id));

        if any_failed {
            for step in phase.steps.iter_mut() {
                if !step.status.is_terminal() {
                    step.status = StepStatus::Skipped;
                }
            }
            phase.status = PhaseStatus::Failed;

            let (step_id, error) = results
                .iter()
                .find(|r| !r.is_success())
                .map(|r| {
                    (
                        Some(r.step_id),
                        r.error.clone().unwrap_or_else(|| "step failed".to_string()),
                    )
                })
                .unwrap_or((None, "step failed".to_string()));
            self.events
                .emit_phase_failed(ctx.log_id, phase, step_id, &error);
            return PhaseOutcome::failed(results, error);
        }

        phase.status = PhaseStatus::Completed;
        self.events
            .emit_phase_completed(ctx.log_id, phase, results.len() as u32);
        self.milestones
            .emit_phase_completion(phase, ctx.log_id, &plan.query);
        PhaseOutcome::completed(results)
    }

    /// Run a single step: emit lifecycle events and fold any error into a
    /// failed result.
    async fn run_step(&self, step: Step, ctx: &ExecutionContext) -> StepResult {
        let started = Instant::now();
        let input = Value::Object(step.config.clone());

        self.events.emit_scoped(
            ctx.log_id,
            EventKind::StepStarted {
                step_id: step.id,
                tool_name: step.tool_name.clone(),
                step_type: step.step_type,
                config: input.clone(),
            },
            None,
            Some(step.phase_id),
            Some(step.id),
        );

        let outcome = match self.tools.get(&step.tool_name) {
            Ok(executor) => {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => Err(ToolError::Cancelled),
                    result = executor.execute(&step, ctx.log_id) => result,
                }
            }
            Err(err) => Err(err),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) => {
                self.events.emit_scoped(
                    ctx.log_id,
                    EventKind::StepCompleted {
                        step_id: step.id,
                        tool_name: step.tool_name.clone(),
                        input: input.clone(),
                        output: output.output.clone(),
                        tokens_used: output.tokens_used,
                        duration_ms,
                        metadata: output.metadata.clone(),
                    },
                    None,
                    Some(step.phase_id),
                    Some(step.id),
                );
                StepResult::completed(
                    &step,
                    input,
                    output.output,
                    output.tokens_used,
                    duration_ms,
                    output.metadata,
                )
            }
            Err(err) => {
                let message = err.to_string();
                self.events.emit_scoped(
                    ctx.log_id,
                    EventKind::StepFailed {
                        step_id: step.id,
                        tool_name: step.tool_name.clone(),
                        input: input.clone(),
                        error: StepErrorInfo::message(&message),
                        duration_ms,
                    },
                    None,
                    Some(step.phase_id),
                    Some(step.id),
                );
                StepResult::failed(&step, input, &message, duration_ms)
            }
        }
    }
}
