//! Planner: turns a query into an ordered plan of phases and steps.
//!
//! Planning asks the model for a structurally valid plan, retrying up to
//! the configured ceiling. When decomposition is enabled the query is split
//! first and sub-query layers map directly to search phases, with a final
//! synthesis phase appended. If every model attempt fails to parse, a
//! built-in search/fetch/synthesis plan stands in so the session can still
//! run.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::warn;
use uuid::Uuid;

use crate::decomposer::QueryDecomposer;
use crate::events::EventCoordinator;
use crate::llm::{ChatModel, ChatRequest, parse_json_response};
use crate::model::{
    Decomposition, DecompositionSummary, EventKind, Phase, Plan, Step, StepType,
};

const PLANNER_SYSTEM_PROMPT: &str = r#"You are a research planner. Produce an executable research plan for the user's query.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "phases": [
    {
      "name": "Initial Search",
      "description": "What this phase accomplishes",
      "steps": [
        {
          "type": "tool_call" | "llm_call",
          "toolName": "web_search" | "web_fetch" | "knowledge_search" | "synthesize",
          "config": {},
          "dependsOn": []
        }
      ]
    }
  ]
}

Rules:
- Phases run in order; steps inside a phase run in dependency order.
- dependsOn uses 0-based indices into the same phase's steps array.
- The last phase must contain a "synthesize" llm_call step that writes the answer.
- Keep plans small: 2 to 4 phases, each with 1 to 4 steps."#;

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub max_planning_iterations: u32,
    pub decomposition_enabled: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_planning_iterations: 3,
            decomposition_enabled: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPlan {
    phases: Vec<RawPhase>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPhase {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    replan_checkpoint: bool,
    steps: Vec<RawStep>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStep {
    #[serde(rename = "type")]
    step_type: String,
    tool_name: String,
    #[serde(default)]
    config: Map<String, Value>,
    #[serde(default)]
    depends_on: Vec<usize>,
}

impl RawPlan {
    fn validate(&self) -> Result<()> {
        if self.phases.is_empty() {
            bail!("plan has no phases");
        }
        for (p, phase) in self.phases.iter().enumerate() {
            if phase.name.trim().is_empty() {
                bail!("phase {p} has no name");
            }
            if phase.steps.is_empty() {
                bail!("phase '{}' has no steps", phase.name);
            }
            for (s, step) in phase.steps.iter().enumerate() {
                if !matches!(step.step_type.as_str(), "tool_call" | "llm_call") {
                    bail!(
                        "step {s} in phase '{}' has invalid type '{}'",
                        phase.name,
                        step.step_type
                    );
                }
                if step.tool_name.trim().is_empty() {
                    bail!("step {s} in phase '{}' has no toolName", phase.name);
                }
                for &dep in &step.depends_on {
                    if dep >= phase.steps.len() {
                        bail!(
                            "step {s} in phase '{}' depends on out-of-range index {dep}",
                            phase.name
                        );
                    }
                    if dep == s {
                        bail!("step {s} in phase '{}' depends on itself", phase.name);
                    }
                }
            }
        }
        Ok(())
    }
}

pub struct Planner {
    model: Arc<dyn ChatModel>,
    decomposer: Arc<QueryDecomposer>,
    events: Arc<EventCoordinator>,
    config: PlannerConfig,
}

impl Planner {
    pub fn new(
        model: Arc<dyn ChatModel>,
        decomposer: Arc<QueryDecomposer>,
        events: Arc<EventCoordinator>,
        config: PlannerConfig,
    ) -> Self {
        Self {
            model,
            decomposer,
            events,
            config,
        }
    }

    /// Produce the initial plan for a query and emit the planning events.
    pub async fn create_plan(&self, query: &str, log_id: Uuid) -> Plan {
        self.events.emit(log_id, EventKind::PlanningStarted {});

        if self.config.decomposition_enabled {
            match self.decomposer.decompose(query, Some(log_id)).await {
                Ok(decomposition) if decomposition.is_complex => {
                    let plan = plan_from_decomposition(query, &decomposition);
                    self.emit_plan_events(log_id, &plan);
                    return plan;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "decomposition failed; planning without it");
                }
            }
        }

        let max = self.config.max_planning_iterations;
        for iteration in 1..=max {
            self.events.emit(
                log_id,
                EventKind::PlanningIteration {
                    iteration,
                    max_iterations: max,
                },
            );
            match self.request_plan(query, query).await {
                Ok(plan) => {
                    self.emit_plan_events(log_id, &plan);
                    return plan;
                }
                Err(err) => {
                    warn!(iteration, error = %err, "planning iteration produced no valid plan");
                }
            }
        }

        let plan = fallback_plan(query);
        self.emit_plan_events(log_id, &plan);
        plan
    }

    /// One revision attempt after a failed plan evaluation. Unlike initial
    /// planning there is no retry loop and no fallback; the caller keeps
    /// the old plan on failure.
    pub async fn revise_plan(&self, query: &str, failing_dimensions: &[String]) -> Result<Plan> {
        let prompt = format!(
            "{query}\n\nA previous plan for this query scored poorly on: {}. \
             Produce an improved plan that addresses those weaknesses.",
            failing_dimensions.join(", "),
        );
        self.request_plan(&prompt, query).await
    }

    async fn request_plan(&self, prompt: &str, query: &str) -> Result<Plan> {
        let response = self
            .model
            .chat(
                ChatRequest::new(prompt)
                    .with_system(PLANNER_SYSTEM_PROMPT)
                    .with_temperature(0.0),
            )
            .await
            .context("planner LLM call failed")?;

        let raw: RawPlan = parse_json_response(&response.content)
            .context("planner response was not a valid plan")?;
        raw.validate()?;
        Ok(build_plan(query, raw))
    }

    fn emit_plan_events(&self, log_id: Uuid, plan: &Plan) {
        let phases: Vec<Value> = plan
            .phases
            .iter()
            .map(|phase| {
                json!({
                    "phaseId": phase.id,
                    "name": phase.name,
                    "order": phase.order,
                    "steps": phase.steps.iter().map(|s| json!({
                        "stepId": s.id,
                        "toolName": s.tool_name,
                        "type": s.step_type,
                    })).collect::<Vec<_>>(),
                })
            })
            .collect();

        self.events.emit_scoped(
            log_id,
            EventKind::PlanCreated {
                plan_id: plan.id,
                query: plan.query.clone(),
                total_phases: plan.phases.len() as u32,
                phases: Value::Array(phases),
            },
            Some(plan.id),
            None,
            None,
        );

        for phase in &plan.phases {
            self.events.emit_scoped(
                log_id,
                EventKind::PhaseAdded {
                    phase_id: phase.id,
                    name: phase.name.clone(),
                },
                Some(plan.id),
                Some(phase.id),
                None,
            );
            for step in &phase.steps {
                self.events.emit_scoped(
                    log_id,
                    EventKind::StepAdded {
                        step_id: step.id,
                        tool_name: step.tool_name.clone(),
                    },
                    Some(plan.id),
                    Some(phase.id),
                    Some(step.id),
                );
            }
        }
    }
}

fn build_plan(query: &str, raw: RawPlan) -> Plan {
    let mut plan = Plan::new(query);
    for (p, raw_phase) in raw.phases.into_iter().enumerate() {
        let mut phase = Phase::new(plan.id, &raw_phase.name, p as u32 + 1);
        phase.description = raw_phase.description;
        phase.replan_checkpoint = raw_phase.replan_checkpoint;

        let step_ids: Vec<Uuid> = raw_phase.steps.iter().map(|_| Uuid::new_v4()).collect();
        for (s, raw_step) in raw_phase.steps.into_iter().enumerate() {
            let step_type = match raw_step.step_type.as_str() {
                "llm_call" => StepType::LlmCall,
                _ => StepType::ToolCall,
            };
            let mut step = Step::new(phase.id, step_type, &raw_step.tool_name, s as u32 + 1);
            step.id = step_ids[s];
            step.config = raw_step.config;
            step.dependencies = raw_step.depends_on.iter().map(|&d| step_ids[d]).collect();
            phase.steps.push(step);
        }
        plan.phases.push(phase);
    }
    plan
}

/// Map sub-query layers onto search phases and append the terminal
/// synthesis phase.
fn plan_from_decomposition(query: &str, decomposition: &Decomposition) -> Plan {
    let mut plan = Plan::new(query);
    let total = decomposition.sub_queries.len() as u32;

    for (layer_index, layer) in decomposition.execution_plan.iter().enumerate() {
        let order = layer_index as u32 + 1;
        let mut phase = Phase::new(plan.id, &format!("Sub-query Search {order}"), order);
        phase.sub_query_count = Some(layer.len() as u32);

        for (s, sub_query_id) in layer.iter().enumerate() {
            let Some(sub_query) = decomposition.sub_query(*sub_query_id) else {
                continue;
            };
            let mut step =
                Step::new(phase.id, StepType::ToolCall, "web_search", s as u32 + 1);
            step.config
                .insert("query".to_string(), Value::String(sub_query.text.clone()));
            step.config.insert("maxResults".to_string(), json!(5));
            phase.steps.push(step);
        }
        plan.phases.push(phase);
    }

    let order = plan.phases.len() as u32 + 1;
    let mut synthesis = Phase::new(plan.id, "Final Synthesis", order);
    synthesis.sub_query_count = Some(total);
    synthesis
        .steps
        .push(Step::new(synthesis.id, StepType::LlmCall, "synthesize", 1));
    plan.phases.push(synthesis);

    plan.decomposition = Some(DecompositionSummary {
        sub_query_count: total,
        execution_phases: decomposition.execution_plan.len() as u32,
    });
    plan
}

/// The built-in plan used when no model attempt produced a valid one.
fn fallback_plan(query: &str) -> Plan {
    let mut plan = Plan::new(query);

    let mut search = Phase::new(plan.id, "Initial Search", 1);
    let mut search_step = Step::new(search.id, StepType::ToolCall, "web_search", 1);
    search_step
        .config
        .insert("query".to_string(), Value::String(query.to_string()));
    search_step.config.insert("maxResults".to_string(), json!(5));
    search.steps.push(search_step);
    plan.phases.push(search);

    let mut fetch = Phase::new(plan.id, "Content Fetch", 2);
    fetch
        .steps
        .push(Step::new(fetch.id, StepType::ToolCall, "web_fetch", 1));
    plan.phases.push(fetch);

    let mut synthesis = Phase::new(plan.id, "Synthesis", 3);
    synthesis
        .steps
        .push(Step::new(synthesis.id, StepType::LlmCall, "synthesize", 1));
    plan.phases.push(synthesis);

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbHandle;
    use crate::llm::{ChatResponse, LlmError};
    use async_trait::async_trait;

    /// Routes by prompt: the decomposition system prompt gets the first
    /// response, everything else the second.
    struct RoutingModel {
        decomposition: String,
        planning: String,
    }

    #[async_trait]
    impl ChatModel for RoutingModel {
        async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
            let is_decomposition = request
                .system
                .as_deref()
                .is_some_and(|s| s.contains("query analyst"));
            Ok(ChatResponse {
                content: if is_decomposition {
                    self.decomposition.clone()
                } else {
                    self.planning.clone()
                },
                tokens_used: None,
            })
        }
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, LlmError> {
            Ok(vec![])
        }
    }

    const SIMPLE_DECOMPOSITION: &str = r#"{"isComplex": false, "subQueries": []}"#;

    const VALID_PLAN: &str = r#"{
        "phases": [
            {"name": "Initial Search", "steps": [
                {"type": "tool_call", "toolName": "web_search", "config": {"query": "q"}}
            ]},
            {"name": "Content Fetch", "steps": [
                {"type": "tool_call", "toolName": "web_fetch"}
            ]},
            {"name": "Synthesis", "steps": [
                {"type": "llm_call", "toolName": "synthesize"}
            ]}
        ]
    }"#;

    fn planner(decomposition: &str, planning: &str, config: PlannerConfig) -> Planner {
        let model = Arc::new(RoutingModel {
            decomposition: decomposition.to_string(),
            planning: planning.to_string(),
        });
        let events = Arc::new(EventCoordinator::new(DbHandle::in_memory().unwrap()));
        let decomposer = Arc::new(QueryDecomposer::new(model.clone(), events.clone()));
        Planner::new(model, decomposer, events, config)
    }

    #[tokio::test]
    async fn simple_query_plans_from_llm_response() {
        let p = planner(SIMPLE_DECOMPOSITION, VALID_PLAN, PlannerConfig::default());
        let log_id = Uuid::new_v4();
        let plan = p.create_plan("What is quantum computing?", log_id).await;

        assert_eq!(plan.phases.len(), 3);
        assert_eq!(plan.phases[0].order, 1);
        assert_eq!(plan.phases[2].order, 3);
        assert_eq!(plan.phases[2].steps[0].tool_name, "synthesize");
        assert!(plan.decomposition.is_none());

        let events = p.events.events_for_log(log_id).unwrap();
        assert_eq!(events[0].event_type, "planning_started");
        let created = events
            .iter()
            .find(|e| e.event_type == "plan_created")
            .unwrap();
        assert_eq!(created.data["totalPhases"], 3);
        let phase_added = events
            .iter()
            .filter(|e| e.event_type == "phase_added")
            .count();
        let step_added = events
            .iter()
            .filter(|e| e.event_type == "step_added")
            .count();
        assert_eq!(phase_added, 3);
        assert_eq!(step_added, 3);
    }

    #[tokio::test]
    async fn invalid_responses_exhaust_iterations_then_fall_back() {
        let p = planner(
            SIMPLE_DECOMPOSITION,
            "this is not a plan",
            PlannerConfig::default(),
        );
        let log_id = Uuid::new_v4();
        let plan = p.create_plan("q", log_id).await;

        // Fallback shape: search, fetch, synthesis.
        assert_eq!(plan.phases.len(), 3);
        assert_eq!(plan.phases[0].name, "Initial Search");
        assert_eq!(plan.phases[1].steps[0].tool_name, "web_fetch");
        assert_eq!(plan.phases[2].steps[0].tool_name, "synthesize");

        let events = p.events.events_for_log(log_id).unwrap();
        let iterations: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == "planning_iteration")
            .collect();
        assert_eq!(iterations.len(), 3);
        assert_eq!(iterations[0].data["iteration"], 1);
        assert_eq!(iterations[2].data["maxIterations"], 3);
    }

    #[tokio::test]
    async fn complex_query_maps_layers_to_phases() {
        let decomposition = r#"{
            "isComplex": true,
            "subQueries": [
                {"text": "AI impacts", "order": 1, "type": "analytical",
                 "priority": "high", "estimatedComplexity": 3},
                {"text": "Blockchain impacts", "order": 2, "type": "analytical",
                 "priority": "high", "estimatedComplexity": 3},
                {"text": "Compare both", "order": 3, "dependencies": [1, 2],
                 "type": "comparative", "priority": "medium", "estimatedComplexity": 4}
            ]
        }"#;
        let p = planner(decomposition, VALID_PLAN, PlannerConfig::default());
        let plan = p.create_plan("Compare AI and blockchain", Uuid::new_v4()).await;

        // Two sub-query layers plus the final synthesis phase.
        assert_eq!(plan.phases.len(), 3);
        assert_eq!(plan.phases[0].steps.len(), 2);
        assert_eq!(plan.phases[0].sub_query_count, Some(2));
        assert_eq!(plan.phases[1].steps.len(), 1);
        assert_eq!(plan.phases[2].name, "Final Synthesis");
        assert_eq!(plan.phases[2].sub_query_count, Some(3));

        let summary = plan.decomposition.unwrap();
        assert_eq!(summary.sub_query_count, 3);
        assert_eq!(summary.execution_phases, 2);

        // Sub-query text drives the search config.
        assert_eq!(plan.phases[0].steps[0].config["query"], "AI impacts");
    }

    #[tokio::test]
    async fn decomposition_failure_degrades_to_plain_planning() {
        let p = planner("garbage", VALID_PLAN, PlannerConfig::default());
        let plan = p.create_plan("q", Uuid::new_v4()).await;
        assert_eq!(plan.phases.len(), 3);
        assert!(plan.decomposition.is_none());
    }

    #[tokio::test]
    async fn decomposition_can_be_disabled() {
        let config = PlannerConfig {
            decomposition_enabled: false,
            ..Default::default()
        };
        let p = planner("unused", VALID_PLAN, config);
        let log_id = Uuid::new_v4();
        let plan = p.create_plan("q", log_id).await;
        assert!(plan.decomposition.is_none());

        let events = p.events.events_for_log(log_id).unwrap();
        assert!(
            events
                .iter()
                .all(|e| e.event_type != "decomposition_started")
        );
    }

    #[test]
    fn raw_plan_validation_rejects_bad_shapes() {
        let no_phases: RawPlan = serde_json::from_str(r#"{"phases": []}"#).unwrap();
        assert!(no_phases.validate().is_err());

        let bad_type: RawPlan = serde_json::from_str(
            r#"{"phases": [{"name": "P", "steps": [{"type": "magic", "toolName": "t"}]}]}"#,
        )
        .unwrap();
        assert!(bad_type.validate().is_err());

        let bad_dep: RawPlan = serde_json::from_str(
            r#"{"phases": [{"name": "P", "steps": [
                {"type": "tool_call", "toolName": "t", "dependsOn": [5]}
            ]}]}"#,
        )
        .unwrap();
        assert!(bad_dep.validate().is_err());

        let self_dep: RawPlan = serde_json::from_str(
            r#"{"phases": [{"name": "P", "steps": [
                {"type": "tool_call", "toolName": "t", "dependsOn": [0]}
            ]}]}"#,
        )
        .unwrap();
        assert!(self_dep.validate().is_err());
    }

    #[test]
    fn build_plan_maps_dependency_indices_to_ids() {
        let raw: RawPlan = serde_json::from_str(
            r#"{"phases": [{"name": "P", "steps": [
                {"type": "tool_call", "toolName": "a"},
                {"type": "tool_call", "toolName": "b", "dependsOn": [0]}
            ]}]}"#,
        )
        .unwrap();
        let plan = build_plan("q", raw);
        let steps = &plan.phases[0].steps;
        assert_eq!(steps[1].dependencies, vec![steps[0].id]);
        assert_eq!(steps[0].order, 1);
        assert_eq!(steps[1].order, 2);
    }
}
