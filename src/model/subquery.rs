//! Sub-query types produced by query decomposition.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Classification of what a sub-query is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubQueryType {
    Factual,
    Analytical,
    Comparative,
    Temporal,
}

/// Relative importance of a sub-query within the decomposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubQueryPriority {
    High,
    Medium,
    Low,
}

/// An atomic question derived from decomposing a complex query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubQuery {
    pub id: Uuid,
    pub text: String,
    pub order: u32,
    /// Local ids of sub-queries that must be answered first.
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    #[serde(rename = "type")]
    pub query_type: SubQueryType,
    pub priority: SubQueryPriority,
    /// 1 (trivial) through 5 (hard).
    pub estimated_complexity: u8,
}

/// Outcome of decomposing a query: either "simple" (empty sub-query set) or
/// a set of sub-queries layered into independently executable groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decomposition {
    pub is_complex: bool,
    pub sub_queries: Vec<SubQuery>,
    /// Ordered layers; every sub-query in a layer has all dependencies in
    /// earlier layers.
    pub execution_plan: Vec<Vec<Uuid>>,
    pub duration_ms: u64,
}

impl Decomposition {
    /// A decomposition for a query that needs no splitting.
    pub fn simple(duration_ms: u64) -> Self {
        Self {
            is_complex: false,
            sub_queries: Vec::new(),
            execution_plan: Vec::new(),
            duration_ms,
        }
    }

    pub fn sub_query(&self, id: Uuid) -> Option<&SubQuery> {
        self.sub_queries.iter().find(|sq| sq.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_query_type_serialization() {
        assert_eq!(
            serde_json::to_string(&SubQueryType::Comparative).unwrap(),
            "\"comparative\""
        );
        let parsed: SubQueryType = serde_json::from_str("\"temporal\"").unwrap();
        assert_eq!(parsed, SubQueryType::Temporal);
    }

    #[test]
    fn sub_query_serializes_type_field_name() {
        let sq = SubQuery {
            id: Uuid::new_v4(),
            text: "economic impact of AI".to_string(),
            order: 1,
            dependencies: vec![],
            query_type: SubQueryType::Analytical,
            priority: SubQueryPriority::High,
            estimated_complexity: 3,
        };
        let json = serde_json::to_value(&sq).unwrap();
        assert_eq!(json["type"], "analytical");
        assert_eq!(json["priority"], "high");
        assert_eq!(json["estimatedComplexity"], 3);
    }

    #[test]
    fn simple_decomposition_is_empty() {
        let d = Decomposition::simple(15);
        assert!(!d.is_complex);
        assert!(d.sub_queries.is_empty());
        assert!(d.execution_plan.is_empty());
        assert_eq!(d.duration_ms, 15);
    }
}
