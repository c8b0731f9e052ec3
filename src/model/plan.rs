//! Plan, phase and step types plus the result values produced when they run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Status of a phase in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// Phase is waiting to run.
    #[default]
    Pending,
    /// Phase is currently running.
    Running,
    /// Phase completed successfully.
    Completed,
    /// Phase failed.
    Failed,
    /// Phase was skipped.
    Skipped,
}

impl PhaseStatus {
    /// Check if the phase is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Check if the phase completed successfully.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Status of a step. Same lattice as [`PhaseStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Kind of work a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// Invokes a registered tool executor.
    ToolCall,
    /// Invokes the language model directly (synthesis and friends).
    LlmCall,
}

/// The smallest executable unit: one tool or LLM invocation with a config
/// and intra-phase dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: Uuid,
    pub phase_id: Uuid,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub tool_name: String,
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Ids of steps in the same phase that must complete first.
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    #[serde(default)]
    pub status: StepStatus,
    pub order: u32,
}

impl Step {
    /// Create a pending step bound to a phase.
    pub fn new(phase_id: Uuid, step_type: StepType, tool_name: &str, order: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            phase_id,
            step_type,
            tool_name: tool_name.to_string(),
            config: Map::new(),
            dependencies: Vec::new(),
            status: StepStatus::Pending,
            order,
        }
    }

    pub fn with_config(mut self, config: Map<String, Value>) -> Self {
        self.config = config;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<Uuid>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

/// A named, ordered group of steps; the scheduling unit of a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Phase {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub status: PhaseStatus,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub replan_checkpoint: bool,
    pub order: u32,
    /// Number of sub-queries this phase was derived from, when the plan came
    /// out of query decomposition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_query_count: Option<u32>,
}

impl Phase {
    pub fn new(plan_id: Uuid, name: &str, order: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            plan_id,
            name: name.to_string(),
            description: None,
            status: PhaseStatus::Pending,
            steps: Vec::new(),
            replan_checkpoint: false,
            order,
            sub_query_count: None,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn is_decomposed(&self) -> bool {
        self.sub_query_count.is_some()
    }
}

/// Summary of the decomposition a plan was built from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecompositionSummary {
    pub sub_query_count: u32,
    pub execution_phases: u32,
}

/// An ordered set of phases produced by the planner for one session.
///
/// Phase `order` is a dense, strictly increasing sequence starting at 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: Uuid,
    pub query: String,
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub status: PhaseStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decomposition: Option<DecompositionSummary>,
}

impl Plan {
    pub fn new(query: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            query: query.to_string(),
            phases: Vec::new(),
            status: PhaseStatus::Pending,
            created_at: Utc::now(),
            decomposition: None,
        }
    }
}

/// Terminal status of one step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepResultStatus {
    Completed,
    Failed,
    Skipped,
}

/// Immutable record of one step execution; created exactly once per step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: Uuid,
    pub tool_name: String,
    pub status: StepResultStatus,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u32>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl StepResult {
    pub fn completed(
        step: &Step,
        input: Value,
        output: Value,
        tokens_used: Option<u32>,
        duration_ms: u64,
        metadata: Option<Value>,
    ) -> Self {
        Self {
            step_id: step.id,
            tool_name: step.tool_name.clone(),
            status: StepResultStatus::Completed,
            input,
            output: Some(output),
            error: None,
            tokens_used,
            duration_ms,
            metadata,
        }
    }

    pub fn failed(step: &Step, input: Value, error: &str, duration_ms: u64) -> Self {
        Self {
            step_id: step.id,
            tool_name: step.tool_name.clone(),
            status: StepResultStatus::Failed,
            input,
            output: None,
            error: Some(error.to_string()),
            tokens_used: None,
            duration_ms,
            metadata: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StepResultStatus::Completed
    }
}

/// What the synthesis post-hook extracted from a completed synthesis phase.
#[derive(Debug, Clone, Default)]
pub struct SynthesisSummary {
    pub answer: String,
    pub sources: Vec<crate::model::research::Source>,
    pub confidence: Option<f64>,
}

/// Result of driving one phase to a terminal state.
#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    pub status: PhaseStatus,
    pub step_results: Vec<StepResult>,
    pub error: Option<String>,
    /// Present only when a synthesis executor ran its post-hook.
    pub synthesis: Option<SynthesisSummary>,
}

impl PhaseOutcome {
    pub fn completed(step_results: Vec<StepResult>) -> Self {
        Self {
            status: PhaseStatus::Completed,
            step_results,
            error: None,
            synthesis: None,
        }
    }

    pub fn failed(step_results: Vec<StepResult>, error: String) -> Self {
        Self {
            status: PhaseStatus::Failed,
            step_results,
            error: Some(error),
            synthesis: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}
