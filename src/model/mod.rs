//! Domain types shared across the orchestrator.
//!
//! Everything that crosses a component boundary lives here: plans and their
//! phases/steps, step results, sub-queries, persisted research results, and
//! the closed set of session events.

pub mod event;
pub mod plan;
pub mod research;
pub mod subquery;

pub use event::{Event, EventKind, EvaluationPhase, MilestonePayload, StepErrorInfo};
pub use plan::{
    DecompositionSummary, PhaseOutcome, PhaseStatus, Plan, Phase, Step, StepResult,
    StepResultStatus, StepStatus, StepType, SynthesisSummary,
};
pub use research::{PhaseTiming, ResearchResult, ResultMetadata, Source};
pub use subquery::{Decomposition, SubQuery, SubQueryPriority, SubQueryType};
