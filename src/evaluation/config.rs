//! Evaluation configuration: rubrics, roles, thresholds.
//!
//! Constructed explicitly and passed into the coordinator; nothing here is
//! read from globals at call time. `Default` carries the seed values.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What the orchestrator does when an evaluation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailAction {
    /// Proceed unchanged.
    #[default]
    Continue,
    /// Proceed but surface the failure in the final metadata.
    Warn,
    /// Mark the session failed.
    Block,
}

/// One evaluator: a prompt/model pair owning a dimension subset.
#[derive(Debug, Clone)]
pub struct EvaluatorRole {
    pub name: String,
    pub dimensions: Vec<String>,
    /// Overrides the client's default model for this role.
    pub model: Option<String>,
}

impl EvaluatorRole {
    pub fn new(name: &str, dimensions: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            dimensions: dimensions.iter().map(|d| d.to_string()).collect(),
            model: None,
        }
    }
}

/// Configuration for one rubric (plan, retrieval or answer).
#[derive(Debug, Clone)]
pub struct RubricConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    /// The mean score must reach this for the rubric to pass.
    pub pass_threshold: f64,
    /// Per-dimension minimums; an unscored dimension counts as 0.
    pub dimension_thresholds: BTreeMap<String, f64>,
    pub roles: Vec<EvaluatorRole>,
    pub role_timeout: Duration,
    /// Any dimension under this fails the rubric regardless of the mean.
    pub severe_threshold: Option<f64>,
}

impl RubricConfig {
    fn with_thresholds(
        roles: Vec<EvaluatorRole>,
        thresholds: &[(&str, f64)],
        max_attempts: u32,
    ) -> Self {
        Self {
            enabled: true,
            max_attempts,
            pass_threshold: 0.7,
            dimension_thresholds: thresholds
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            roles,
            role_timeout: Duration::from_secs(45),
            severe_threshold: None,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Full evaluation configuration with the seed defaults.
#[derive(Debug, Clone)]
pub struct EvaluationConfig {
    pub plan: RubricConfig,
    pub retrieval: RubricConfig,
    pub answer: RubricConfig,
    pub iteration_enabled: bool,
    pub fail_action: FailAction,
    /// Larger model used when the primary persistently fails the rubric.
    pub escalation_model: Option<String>,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        let plan = RubricConfig::with_thresholds(
            vec![EvaluatorRole::new(
                "plan-reviewer",
                &["completeness", "relevance", "efficiency"],
            )],
            &[("completeness", 0.6), ("relevance", 0.7), ("efficiency", 0.5)],
            3,
        );

        let mut retrieval = RubricConfig::with_thresholds(
            vec![EvaluatorRole::new(
                "retrieval-reviewer",
                &["relevance", "coverage", "credibility"],
            )],
            &[("relevance", 0.6), ("coverage", 0.5), ("credibility", 0.5)],
            1,
        );
        retrieval.severe_threshold = Some(0.5);

        let mut answer = RubricConfig::with_thresholds(
            vec![EvaluatorRole::new(
                "answer-reviewer",
                &["accuracy", "completeness", "clarity"],
            )],
            &[("accuracy", 0.7), ("completeness", 0.6), ("clarity", 0.5)],
            2,
        );
        answer.severe_threshold = Some(0.5);

        Self {
            plan,
            retrieval,
            answer,
            iteration_enabled: true,
            fail_action: FailAction::Continue,
            escalation_model: None,
        }
    }
}

impl EvaluationConfig {
    /// A configuration with every rubric disabled (rubrics report skipped).
    pub fn disabled() -> Self {
        let base = Self::default();
        Self {
            plan: base.plan.disabled(),
            retrieval: base.retrieval.disabled(),
            answer: base.answer.disabled(),
            ..base
        }
    }
}
