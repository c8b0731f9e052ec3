//! Step configuration: tool defaults and synthesis enrichment.
//!
//! Synthesis steps receive the accumulated research context right before
//! they execute, so a plan produced by the LLM never needs to carry the
//! context itself.

use serde_json::{Map, Value, json};

use crate::model::{Plan, Step, StepResult};

/// Separator between successive fetched documents in the synthesis context.
pub const FETCHED_CONTENT_SEPARATOR: &str = "\n\n---\n\n";

const DEFAULT_SEARCH_QUERY: &str = "research query";
const DEFAULT_MAX_RESULTS: u64 = 5;

const DEFAULT_SYNTHESIS_SYSTEM_PROMPT: &str = "You are a research assistant. Synthesize the \
    provided search results and fetched content into a clear, accurate answer. Cite the \
    sources you rely on and say so explicitly when the evidence is thin.";

const DEFAULT_SYNTHESIS_PROMPT: &str = "Write a comprehensive answer to the question using \
    only the research context below.";

/// Default config for a tool when the plan did not supply one.
///
/// - `web_search` gets the plan query and a result cap.
/// - `web_fetch` gets the first URL found in earlier array outputs.
/// - Everything else gets an empty map.
pub fn default_config(
    tool_name: &str,
    plan: Option<&Plan>,
    phase_results: &[StepResult],
) -> Map<String, Value> {
    let mut config = Map::new();
    match tool_name {
        "web_search" => {
            let query = plan
                .map(|p| p.query.as_str())
                .unwrap_or(DEFAULT_SEARCH_QUERY);
            config.insert("query".to_string(), Value::String(query.to_string()));
            config.insert("maxResults".to_string(), json!(DEFAULT_MAX_RESULTS));
        }
        "web_fetch" => {
            if let Some(url) = first_result_url(phase_results) {
                config.insert("url".to_string(), Value::String(url));
            }
        }
        _ => {}
    }
    config
}

/// Walk results in order and pull the first `url` out of an array-typed
/// output.
fn first_result_url(phase_results: &[StepResult]) -> Option<String> {
    for result in phase_results {
        let Some(Value::Array(items)) = &result.output else {
            continue;
        };
        for item in items {
            if let Some(url) = item.get("url").and_then(|v| v.as_str())
                && !url.is_empty()
            {
                return Some(url.to_string());
            }
        }
    }
    None
}

/// Enrich a synthesis step in place. Pre-existing config keys win;
/// afterwards the config always carries `query`, `context`, and non-empty
/// `systemPrompt` / `prompt` values.
pub fn enrich_synthesize_step(step: &mut Step, plan: &Plan, accumulated: &[StepResult]) {
    let config = &mut step.config;

    config
        .entry("query".to_string())
        .or_insert_with(|| Value::String(plan.query.clone()));

    config.insert(
        "context".to_string(),
        Value::String(build_synthesis_context(accumulated)),
    );

    ensure_non_empty(config, "systemPrompt", DEFAULT_SYNTHESIS_SYSTEM_PROMPT);
    ensure_non_empty(config, "prompt", DEFAULT_SYNTHESIS_PROMPT);
}

fn ensure_non_empty(config: &mut Map<String, Value>, key: &str, default: &str) {
    let blank = config
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().is_empty())
        .unwrap_or(true);
    if blank {
        config.insert(key.to_string(), Value::String(default.to_string()));
    }
}

/// Assemble the synthesis context from accumulated results.
///
/// Completed sequence outputs land in a "Search Results" section, completed
/// string outputs in a "Fetched Content" section, in that order. Empty
/// sections are omitted; the context is empty when no sources exist.
pub fn build_synthesis_context(accumulated: &[StepResult]) -> String {
    let mut search_items: Vec<String> = Vec::new();
    let mut fetched: Vec<&str> = Vec::new();

    for result in accumulated {
        if !result.is_success() {
            continue;
        }
        match &result.output {
            Some(Value::Array(items)) => {
                for item in items {
                    search_items.push(render_search_item(item));
                }
            }
            Some(Value::String(text)) => fetched.push(text),
            _ => {}
        }
    }

    let mut sections: Vec<String> = Vec::new();
    if !search_items.is_empty() {
        sections.push(format!("## Search Results\n\n{}", search_items.join("\n")));
    }
    if !fetched.is_empty() {
        sections.push(format!(
            "## Fetched Content\n\n{}",
            fetched.join(FETCHED_CONTENT_SEPARATOR)
        ));
    }
    sections.join("\n\n")
}

fn render_search_item(item: &Value) -> String {
    match item {
        Value::Object(obj) => {
            let title = obj.get("title").and_then(|v| v.as_str()).unwrap_or("");
            let url = obj.get("url").and_then(|v| v.as_str()).unwrap_or("");
            let snippet = obj
                .get("content")
                .or_else(|| obj.get("snippet"))
                .and_then(|v| v.as_str())
                .unwrap_or("");
            format!("- {title} ({url}): {snippet}")
        }
        other => format!("- {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{StepResultStatus, StepType};
    use uuid::Uuid;

    fn completed_result(output: Value) -> StepResult {
        StepResult {
            step_id: Uuid::new_v4(),
            tool_name: "web_search".to_string(),
            status: StepResultStatus::Completed,
            input: Value::Null,
            output: Some(output),
            error: None,
            tokens_used: None,
            duration_ms: 1,
            metadata: None,
        }
    }

    fn failed_result(output: Value) -> StepResult {
        let mut r = completed_result(output);
        r.status = StepResultStatus::Failed;
        r
    }

    #[test]
    fn web_search_default_uses_plan_query() {
        let plan = Plan::new("what is quantum computing?");
        let config = default_config("web_search", Some(&plan), &[]);
        assert_eq!(config["query"], "what is quantum computing?");
        assert_eq!(config["maxResults"], 5);
    }

    #[test]
    fn web_search_default_without_plan_is_neutral() {
        let config = default_config("web_search", None, &[]);
        assert_eq!(config["query"], DEFAULT_SEARCH_QUERY);
    }

    #[test]
    fn web_fetch_default_takes_first_url_in_order() {
        let results = vec![
            completed_result(Value::String("not an array".to_string())),
            completed_result(json!([{"title": "no url here"}, {"url": "https://a.example"}])),
            completed_result(json!([{"url": "https://b.example"}])),
        ];
        let config = default_config("web_fetch", None, &results);
        assert_eq!(config["url"], "https://a.example");
    }

    #[test]
    fn web_fetch_default_empty_without_urls() {
        let config = default_config("web_fetch", None, &[]);
        assert!(config.is_empty());
    }

    #[test]
    fn unknown_tool_default_is_empty() {
        let plan = Plan::new("q");
        assert!(default_config("screenshot", Some(&plan), &[]).is_empty());
    }

    #[test]
    fn context_sections_appear_in_order() {
        let results = vec![
            completed_result(Value::String("fetched doc one".to_string())),
            completed_result(json!([{"title": "T", "url": "https://x", "content": "snippet"}])),
            completed_result(Value::String("fetched doc two".to_string())),
        ];
        let context = build_synthesis_context(&results);
        let search_pos = context.find("## Search Results").unwrap();
        let fetched_pos = context.find("## Fetched Content").unwrap();
        assert!(search_pos < fetched_pos);
        assert!(context.contains("- T (https://x): snippet"));
        assert!(context.contains(FETCHED_CONTENT_SEPARATOR));
    }

    #[test]
    fn context_skips_failed_results_and_empty_sections() {
        let results = vec![failed_result(json!([{"url": "https://x"}]))];
        assert_eq!(build_synthesis_context(&results), "");
        assert_eq!(build_synthesis_context(&[]), "");
    }

    #[test]
    fn context_is_deterministic() {
        let results = vec![
            completed_result(json!([{"title": "A", "url": "u", "content": "c"}])),
            completed_result(Value::String("doc".to_string())),
        ];
        assert_eq!(
            build_synthesis_context(&results),
            build_synthesis_context(&results)
        );
    }

    #[test]
    fn enrichment_fills_required_keys() {
        let plan = Plan::new("why is the sky blue?");
        let mut step = Step::new(Uuid::new_v4(), StepType::LlmCall, "synthesize", 1);
        enrich_synthesize_step(&mut step, &plan, &[]);

        assert_eq!(step.config["query"], "why is the sky blue?");
        assert_eq!(step.config["context"], "");
        assert!(!step.config["systemPrompt"].as_str().unwrap().is_empty());
        assert!(!step.config["prompt"].as_str().unwrap().is_empty());
    }

    #[test]
    fn enrichment_preserves_existing_keys() {
        let plan = Plan::new("plan query");
        let mut step = Step::new(Uuid::new_v4(), StepType::LlmCall, "synthesize", 1);
        step.config
            .insert("query".to_string(), Value::String("custom query".into()));
        step.config
            .insert("prompt".to_string(), Value::String("custom prompt".into()));

        enrich_synthesize_step(&mut step, &plan, &[]);
        assert_eq!(step.config["query"], "custom query");
        assert_eq!(step.config["prompt"], "custom prompt");
    }

    #[test]
    fn enrichment_replaces_blank_prompts() {
        let plan = Plan::new("q");
        let mut step = Step::new(Uuid::new_v4(), StepType::LlmCall, "synthesize", 1);
        step.config
            .insert("systemPrompt".to_string(), Value::String("  ".into()));

        enrich_synthesize_step(&mut step, &plan, &[]);
        assert_eq!(
            step.config["systemPrompt"],
            DEFAULT_SYNTHESIS_SYSTEM_PROMPT
        );
    }
}
