//! Milestone Emitter: human-readable progress markers derived from phase
//! names.
//!
//! Each research stage has a fixed template sequence. All but the last
//! template are emitted when the phase starts; the last is reserved for
//! phase completion. Templates interpolate `{key}` placeholders from a
//! small data map built out of the phase and query.

use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::events::EventCoordinator;
use crate::model::{EventKind, MilestonePayload, Phase};
use std::sync::Arc;

/// Research stage inferred from a phase name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Search = 1,
    Fetch = 2,
    Synthesis = 3,
}

impl Stage {
    pub fn number(&self) -> u8 {
        *self as u8
    }
}

struct Template {
    id: &'static str,
    text: &'static str,
    progress: u8,
}

const SEARCH_TEMPLATES: &[Template] = &[
    Template {
        id: "search_prepare",
        text: "Preparing search for {queryTerms}",
        progress: 5,
    },
    Template {
        id: "search_scan",
        text: "Scanning sources across {stepCount} searches",
        progress: 20,
    },
    Template {
        id: "search_collect",
        text: "Collecting candidate results for {queryTerms}",
        progress: 30,
    },
    Template {
        id: "search_done",
        text: "Search phase {phaseName} finished",
        progress: 35,
    },
];

const FETCH_TEMPLATES: &[Template] = &[
    Template {
        id: "fetch_prepare",
        text: "Selecting pages to read for {queryTerms}",
        progress: 40,
    },
    Template {
        id: "fetch_read",
        text: "Reading {stepCount} sources",
        progress: 55,
    },
    Template {
        id: "fetch_done",
        text: "Content gathering for {phaseName} finished",
        progress: 65,
    },
];

const SYNTHESIS_TEMPLATES: &[Template] = &[
    Template {
        id: "synthesis_prepare",
        text: "Organizing findings for {queryTerms}",
        progress: 70,
    },
    Template {
        id: "synthesis_write",
        text: "Writing the answer",
        progress: 85,
    },
    Template {
        id: "synthesis_done",
        text: "Answer for {queryTerms} ready",
        progress: 100,
    },
];

/// Infer the stage from a phase name; unmatched names count as search.
pub fn stage_for_phase(name: &str) -> Stage {
    let lower = name.to_lowercase();
    let matches = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
    if matches(&["synth", "answer", "generat"]) {
        Stage::Synthesis
    } else if matches(&["fetch", "gather", "content"]) {
        Stage::Fetch
    } else if matches(&["search", "query", "initial"]) {
        Stage::Search
    } else {
        Stage::Search
    }
}

fn templates_for(stage: Stage) -> &'static [Template] {
    match stage {
        Stage::Search => SEARCH_TEMPLATES,
        Stage::Fetch => FETCH_TEMPLATES,
        Stage::Synthesis => SYNTHESIS_TEMPLATES,
    }
}

/// Substitute `{key}` placeholders with string-rendered map values.
/// Unknown keys render as the bare placeholder.
pub fn interpolate(template: &str, data: &Map<String, Value>) -> String {
    let mut out = template.to_string();
    for (key, value) in data {
        let rendered = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        out = out.replace(&format!("{{{key}}}"), &rendered);
    }
    out
}

fn template_data(phase: &Phase, query: &str) -> Map<String, Value> {
    let terms: Vec<&str> = query.split_whitespace().take(6).collect();
    let mut data = Map::new();
    data.insert("queryTerms".to_string(), Value::String(terms.join(" ")));
    data.insert("stepCount".to_string(), json!(phase.steps.len()));
    data.insert("phaseName".to_string(), Value::String(phase.name.clone()));
    data
}

pub struct MilestoneEmitter {
    events: Arc<EventCoordinator>,
}

impl MilestoneEmitter {
    pub fn new(events: Arc<EventCoordinator>) -> Self {
        Self { events }
    }

    /// Emit the preparatory milestones for a phase (everything but the
    /// final, completion-reserved template).
    pub fn emit_for_phase(&self, phase: &Phase, log_id: Uuid, query: &str) {
        let stage = stage_for_phase(&phase.name);
        let templates = templates_for(stage);
        let data = template_data(phase, query);

        for template in &templates[..templates.len() - 1] {
            self.emit_milestone(log_id, phase, stage, template, &data, "started", false);
        }
    }

    /// Emit the completion milestone for a phase.
    pub fn emit_phase_completion(&self, phase: &Phase, log_id: Uuid, query: &str) {
        let stage = stage_for_phase(&phase.name);
        let templates = templates_for(stage);
        let data = template_data(phase, query);
        if let Some(last) = templates.last() {
            self.emit_milestone(log_id, phase, stage, last, &data, "completed", true);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_milestone(
        &self,
        log_id: Uuid,
        phase: &Phase,
        stage: Stage,
        template: &Template,
        data: &Map<String, Value>,
        status: &str,
        completed: bool,
    ) {
        let payload = MilestonePayload {
            milestone_id: Uuid::new_v4(),
            template_id: template.id.to_string(),
            stage: stage.number(),
            description: interpolate(template.text, data),
            template: template.text.to_string(),
            template_data: Value::Object(data.clone()),
            progress: template.progress,
            status: status.to_string(),
        };
        let kind = if completed {
            EventKind::MilestoneCompleted { milestone: payload }
        } else {
            EventKind::MilestoneStarted { milestone: payload }
        };
        self.events
            .emit_scoped(log_id, kind, Some(phase.plan_id), Some(phase.id), None);
    }
}
