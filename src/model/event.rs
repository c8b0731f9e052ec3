//! The closed set of session events and the persisted event envelope.
//!
//! Every event type has a fixed payload shape; producers construct variants
//! and consumers destructure them statically. The envelope stores the type
//! name and payload separately so the append-only log can index on type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::plan::StepType;
use super::subquery::{SubQueryPriority, SubQueryType};

/// Which rubric an evaluation event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationPhase {
    Plan,
    Retrieval,
    Answer,
}

impl EvaluationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Retrieval => "retrieval",
            Self::Answer => "answer",
        }
    }
}

/// Error payload carried by `step_failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepErrorInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl StepErrorInfo {
    pub fn message(message: &str) -> Self {
        Self {
            message: message.to_string(),
            stack: None,
        }
    }
}

/// Shared payload for the three milestone event types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestonePayload {
    pub milestone_id: Uuid,
    pub template_id: String,
    pub stage: u8,
    pub description: String,
    pub template: String,
    pub template_data: Value,
    pub progress: u8,
    pub status: String,
}

/// Every event the orchestrator can emit, with its payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum EventKind {
    // ── Session lifecycle ────────────────────────────────────────────
    SessionStarted {
        query: String,
    },
    SessionCompleted {},
    SessionFailed {
        error: String,
    },

    // ── Planning ─────────────────────────────────────────────────────
    PlanningStarted {},
    PlanningIteration {
        iteration: u32,
        max_iterations: u32,
    },
    PlanCreated {
        plan_id: Uuid,
        query: String,
        total_phases: u32,
        phases: Value,
    },
    PhaseAdded {
        phase_id: Uuid,
        name: String,
    },
    StepAdded {
        step_id: Uuid,
        tool_name: String,
    },

    // ── Decomposition ────────────────────────────────────────────────
    DecompositionStarted {
        query: String,
    },
    SubQueryIdentified {
        sub_query_id: Uuid,
        text: String,
        #[serde(rename = "type")]
        query_type: SubQueryType,
        priority: SubQueryPriority,
        complexity: u8,
    },
    DecompositionCompleted {
        is_complex: bool,
        sub_query_count: u32,
        execution_phases: u32,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // ── Execution ────────────────────────────────────────────────────
    PhaseStarted {
        phase_id: Uuid,
        phase_name: String,
        step_count: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sub_query_count: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_decomposed: Option<bool>,
    },
    PhaseCompleted {
        phase_id: Uuid,
        steps_completed: u32,
    },
    PhaseFailed {
        phase_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_id: Option<Uuid>,
        error: String,
    },
    StepStarted {
        step_id: Uuid,
        tool_name: String,
        #[serde(rename = "type")]
        step_type: StepType,
        config: Value,
    },
    StepCompleted {
        step_id: Uuid,
        tool_name: String,
        input: Value,
        output: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tokens_used: Option<u32>,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    StepFailed {
        step_id: Uuid,
        tool_name: String,
        input: Value,
        error: StepErrorInfo,
        duration_ms: u64,
    },

    // ── Milestones ───────────────────────────────────────────────────
    MilestoneStarted {
        #[serde(flatten)]
        milestone: MilestonePayload,
    },
    MilestoneProgress {
        #[serde(flatten)]
        milestone: MilestonePayload,
    },
    MilestoneCompleted {
        #[serde(flatten)]
        milestone: MilestonePayload,
    },

    // ── Evaluation ───────────────────────────────────────────────────
    EvaluationStarted {
        phase: EvaluationPhase,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        query: Option<String>,
    },
    EvaluationCompleted {
        phase: EvaluationPhase,
        passed: bool,
        scores: BTreeMap<String, f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confidence: Option<f64>,
        total_iterations: u32,
        escalated_to_large_model: bool,
        evaluation_skipped: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        skip_reason: Option<String>,
    },
    EvaluationFailed {
        phase: EvaluationPhase,
        error: String,
    },

    // ── Synthesis & confidence ───────────────────────────────────────
    FinalSynthesisStarted {
        phase_id: Uuid,
        sub_query_count: u32,
    },
    FinalSynthesisCompleted {
        phase_id: Uuid,
        answer_length: u32,
        sub_query_count: u32,
    },
    ConfidenceScoringStarted {
        phase_name: String,
        phase_id: Uuid,
    },
    ConfidenceScoringCompleted {
        phase_name: String,
        phase_id: Uuid,
        confidence: f64,
    },
    ConfidenceScoringFailed {
        phase_name: String,
        phase_id: Uuid,
        error: String,
    },

    // ── Stream marker ────────────────────────────────────────────────
    /// Synthesized per-subscriber when the fan-out buffer overflowed.
    /// Never persisted.
    EventsDropped {
        count: u64,
    },
}

impl EventKind {
    /// The wire name of this event type.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session_started",
            Self::SessionCompleted {} => "session_completed",
            Self::SessionFailed { .. } => "session_failed",
            Self::PlanningStarted {} => "planning_started",
            Self::PlanningIteration { .. } => "planning_iteration",
            Self::PlanCreated { .. } => "plan_created",
            Self::PhaseAdded { .. } => "phase_added",
            Self::StepAdded { .. } => "step_added",
            Self::DecompositionStarted { .. } => "decomposition_started",
            Self::SubQueryIdentified { .. } => "sub_query_identified",
            Self::DecompositionCompleted { .. } => "decomposition_completed",
            Self::PhaseStarted { .. } => "phase_started",
            Self::PhaseCompleted { .. } => "phase_completed",
            Self::PhaseFailed { .. } => "phase_failed",
            Self::StepStarted { .. } => "step_started",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::MilestoneStarted { .. } => "milestone_started",
            Self::MilestoneProgress { .. } => "milestone_progress",
            Self::MilestoneCompleted { .. } => "milestone_completed",
            Self::EvaluationStarted { .. } => "evaluation_started",
            Self::EvaluationCompleted { .. } => "evaluation_completed",
            Self::EvaluationFailed { .. } => "evaluation_failed",
            Self::FinalSynthesisStarted { .. } => "final_synthesis_started",
            Self::FinalSynthesisCompleted { .. } => "final_synthesis_completed",
            Self::ConfidenceScoringStarted { .. } => "confidence_scoring_started",
            Self::ConfidenceScoringCompleted { .. } => "confidence_scoring_completed",
            Self::ConfidenceScoringFailed { .. } => "confidence_scoring_failed",
            Self::EventsDropped { .. } => "events_dropped",
        }
    }

    /// The payload portion, as it appears in the `data` column and on the wire.
    pub fn payload(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut obj)) => obj.remove("data").unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    /// Whether this event ends a session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::SessionCompleted {} | Self::SessionFailed { .. })
    }
}

/// A persisted event row: append-only, ordered by (logId, timestamp,
/// insertion order), never mutated after the append.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: Uuid,
    pub log_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<Uuid>,
    pub data: Value,
}

impl Event {
    pub fn from_kind(log_id: Uuid, timestamp: DateTime<Utc>, kind: &EventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            log_id,
            timestamp,
            event_type: kind.name().to_string(),
            plan_id: None,
            phase_id: None,
            step_id: None,
            data: kind.payload(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.event_type.as_str(),
            "session_completed" | "session_failed"
        )
    }
}
