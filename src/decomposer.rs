//! Query Decomposer: asks the model to split a complex query into ordered,
//! dependency-typed sub-queries and layers them into an execution plan.
//!
//! The model may reference dependencies either by order number or by its own
//! ad-hoc ids; both are normalized to locally minted ids during parsing,
//! before layering. Nothing is recovered here: LLM, parse and cycle failures
//! all propagate to the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::dag;
use crate::errors::DecompositionError;
use crate::events::EventCoordinator;
use crate::llm::{ChatModel, ChatRequest, strip_code_fences};
use crate::model::{
    Decomposition, EventKind, SubQuery, SubQueryPriority, SubQueryType,
};

const DECOMPOSITION_SYSTEM_PROMPT: &str = r#"You are a research query analyst. Decide whether the user's query needs to be split into sub-queries before researching.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "isComplex": true | false,
  "subQueries": [
    {
      "text": "An atomic research question",
      "order": 1,
      "dependencies": [],
      "type": "factual" | "analytical" | "comparative" | "temporal",
      "priority": "high" | "medium" | "low",
      "estimatedComplexity": 1
    }
  ]
}

Rules:
- A query is complex when answering it requires combining several independent findings.
- When complex, produce 2 to 5 sub-queries; when simple, set isComplex to false and subQueries to [].
- dependencies reference earlier sub-queries by their order number.
- estimatedComplexity is an integer from 1 (trivial) to 5 (hard)."#;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDecomposition {
    is_complex: Option<bool>,
    #[serde(default)]
    sub_queries: Vec<RawSubQuery>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSubQuery {
    #[serde(default)]
    id: Option<Value>,
    text: Option<String>,
    #[serde(default)]
    order: Option<u32>,
    #[serde(default)]
    dependencies: Vec<Value>,
    #[serde(rename = "type")]
    query_type: Option<String>,
    priority: Option<String>,
    estimated_complexity: Option<i64>,
}

pub struct QueryDecomposer {
    model: Arc<dyn ChatModel>,
    events: Arc<EventCoordinator>,
}

impl QueryDecomposer {
    pub fn new(model: Arc<dyn ChatModel>, events: Arc<EventCoordinator>) -> Self {
        Self { model, events }
    }

    /// Classify a query and, when complex, split it into layered sub-queries.
    pub async fn decompose(
        &self,
        query: &str,
        log_id: Option<Uuid>,
    ) -> Result<Decomposition, DecompositionError> {
        let started = Instant::now();
        if let Some(log_id) = log_id {
            self.events.emit(
                log_id,
                EventKind::DecompositionStarted {
                    query: query.to_string(),
                },
            );
        }

        let result = self.decompose_inner(query, started).await;
        match &result {
            Ok(decomposition) => {
                if let Some(log_id) = log_id {
                    for sq in &decomposition.sub_queries {
                        self.events.emit(
                            log_id,
                            EventKind::SubQueryIdentified {
                                sub_query_id: sq.id,
                                text: sq.text.clone(),
                                query_type: sq.query_type,
                                priority: sq.priority,
                                complexity: sq.estimated_complexity,
                            },
                        );
                    }
                    self.events.emit(
                        log_id,
                        EventKind::DecompositionCompleted {
                            is_complex: decomposition.is_complex,
                            sub_query_count: decomposition.sub_queries.len() as u32,
                            execution_phases: decomposition.execution_plan.len() as u32,
                            duration_ms: decomposition.duration_ms,
                            error: None,
                        },
                    );
                }
            }
            Err(err) => {
                if let Some(log_id) = log_id {
                    self.events.emit(
                        log_id,
                        EventKind::DecompositionCompleted {
                            is_complex: false,
                            sub_query_count: 0,
                            execution_phases: 0,
                            duration_ms: started.elapsed().as_millis() as u64,
                            error: Some(err.to_string()),
                        },
                    );
                }
            }
        }
        result
    }

    async fn decompose_inner(
        &self,
        query: &str,
        started: Instant,
    ) -> Result<Decomposition, DecompositionError> {
        let request = ChatRequest::new(query)
            .with_system(DECOMPOSITION_SYSTEM_PROMPT)
            .with_temperature(0.0);
        let response = self
            .model
            .chat(request)
            .await
            .map_err(DecompositionError::Llm)?;

        let raw = parse_decomposition(&response.content)?;
        let duration_ms = started.elapsed().as_millis() as u64;

        let Some(true) = raw.is_complex else {
            return Ok(Decomposition::simple(duration_ms));
        };

        let sub_queries = normalize_sub_queries(raw.sub_queries)?;
        let layers = dag::layer_strict(&sub_queries)
            .map_err(|_| DecompositionError::CircularDependency)?;
        let execution_plan = layers
            .into_iter()
            .map(|layer| layer.into_iter().map(|i| sub_queries[i].id).collect())
            .collect();

        Ok(Decomposition {
            is_complex: true,
            sub_queries,
            execution_plan,
            duration_ms,
        })
    }
}

/// Strict JSON parse of the model response: fences are stripped but
/// anything else malformed is a parse error.
fn parse_decomposition(content: &str) -> Result<RawDecomposition, DecompositionError> {
    let cleaned = strip_code_fences(content);
    let raw: RawDecomposition = serde_json::from_str(cleaned.trim())
        .map_err(|e| DecompositionError::Parse(e.to_string()))?;

    if raw.is_complex.is_none() {
        return Err(DecompositionError::Parse(
            "missing or invalid isComplex".to_string(),
        ));
    }
    if raw.is_complex == Some(true) && raw.sub_queries.is_empty() {
        return Err(DecompositionError::Parse(
            "complex query with empty subQueries".to_string(),
        ));
    }
    Ok(raw)
}

/// Mint local ids and rewrite order-number / model-id dependencies onto
/// them. Model-provided ids are never trusted past this point.
fn normalize_sub_queries(raw: Vec<RawSubQuery>) -> Result<Vec<SubQuery>, DecompositionError> {
    let mut by_order: HashMap<u32, Uuid> = HashMap::new();
    let mut by_raw_id: HashMap<String, Uuid> = HashMap::new();
    let mut minted: Vec<(Uuid, u32)> = Vec::new();

    for (index, sq) in raw.iter().enumerate() {
        let id = Uuid::new_v4();
        let order = sq.order.unwrap_or(index as u32 + 1);
        if by_order.insert(order, id).is_some() {
            return Err(DecompositionError::Parse(format!(
                "duplicate sub-query order {order}"
            )));
        }
        if let Some(raw_id) = &sq.id {
            by_raw_id.insert(raw_value_key(raw_id), id);
        }
        minted.push((id, order));
    }

    let mut sub_queries = Vec::with_capacity(raw.len());
    for (index, sq) in raw.into_iter().enumerate() {
        let (id, order) = minted[index];

        let text = sq
            .text
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| DecompositionError::Parse(format!("sub-query {order} has no text")))?;

        let query_type = match sq.query_type.as_deref() {
            Some("factual") => SubQueryType::Factual,
            Some("analytical") => SubQueryType::Analytical,
            Some("comparative") => SubQueryType::Comparative,
            Some("temporal") => SubQueryType::Temporal,
            other => {
                return Err(DecompositionError::Parse(format!(
                    "unknown sub-query type {other:?}"
                )));
            }
        };

        let priority = match sq.priority.as_deref() {
            Some("high") => SubQueryPriority::High,
            Some("medium") => SubQueryPriority::Medium,
            Some("low") => SubQueryPriority::Low,
            other => {
                return Err(DecompositionError::Parse(format!(
                    "unknown sub-query priority {other:?}"
                )));
            }
        };

        let estimated_complexity = match sq.estimated_complexity {
            Some(c @ 1..=5) => c as u8,
            other => {
                return Err(DecompositionError::Parse(format!(
                    "estimatedComplexity {other:?} outside 1..5"
                )));
            }
        };

        let mut dependencies = Vec::with_capacity(sq.dependencies.len());
        for dep in &sq.dependencies {
            let resolved = resolve_dependency(dep, &by_order, &by_raw_id).ok_or_else(|| {
                DecompositionError::Parse(format!("unknown dependency reference {dep}"))
            })?;
            if resolved == id {
                return Err(DecompositionError::Parse(format!(
                    "sub-query {order} depends on itself"
                )));
            }
            dependencies.push(resolved);
        }

        sub_queries.push(SubQuery {
            id,
            text,
            order,
            dependencies,
            query_type,
            priority,
            estimated_complexity,
        });
    }
    Ok(sub_queries)
}

fn raw_value_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn resolve_dependency(
    dep: &Value,
    by_order: &HashMap<u32, Uuid>,
    by_raw_id: &HashMap<String, Uuid>,
) -> Option<Uuid> {
    match dep {
        Value::Number(n) => n.as_u64().and_then(|o| by_order.get(&(o as u32)).copied()),
        Value::String(s) => by_raw_id.get(s).copied().or_else(|| {
            s.parse::<u32>()
                .ok()
                .and_then(|o| by_order.get(&o).copied())
        }),
        _ => None,
    }
}
