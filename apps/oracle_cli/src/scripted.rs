//! Offline pipeline that plays the scout, strategist and auditor stages locally.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use oracle_client::{LocalAgentBinding, RunHandler};
use serde_json::{json, Map, Value};
use shared::{
    domain::{ReasoningStep, ScoutData, Stage, StrategyDraft, ToolInvocation},
    protocol::ReasoningState,
};
use tracing::debug;

const BASE_RISK: f64 = 0.3;

pub struct ScriptedPipeline {
    step_delay: Duration,
}

impl ScriptedPipeline {
    pub fn new(step_delay: Duration) -> Self {
        Self { step_delay }
    }

    async fn publish(&self, binding: &LocalAgentBinding, state: &ReasoningState) {
        debug!(
            stage = %state.active_node,
            steps = state.reasoning_trace.len(),
            "scripted snapshot"
        );
        binding.publish(state.clone());
        tokio::time::sleep(self.step_delay).await;
    }
}

#[async_trait]
impl RunHandler for ScriptedPipeline {
    async fn run(&self, binding: LocalAgentBinding, query: String) -> Result<()> {
        binding.set_running(true);
        let mut state = ReasoningState::for_query(query);

        state.active_node = Stage::Scout;
        record(
            &mut state,
            "Gathering racecourse conditions",
            Some("Initializing Scout node"),
            None,
        );
        self.publish(&binding, &state).await;

        let args = json!({ "query": state.query });
        invoke_tool(&mut state, "search_racecourse_conditions", args);
        state.scout_data = Some(scout_report(&state.query));
        record(
            &mut state,
            "Completed scouting",
            Some("Scout phase complete - handing off to Strategist"),
            Some("Good track, clear weather, 2 sources"),
        );
        self.publish(&binding, &state).await;

        loop {
            state.active_node = Stage::Strategist;
            let draft = draft_strategy(state.backtrack_count);
            record(
                &mut state,
                &format!(
                    "Proposing {} at {:.0}% confidence",
                    draft.recommended_horse,
                    draft.confidence_score * 100.0
                ),
                Some("Drafting strategy"),
                None,
            );
            state.strategy_draft = Some(draft);
            self.publish(&binding, &state).await;

            state.active_node = Stage::Auditor;
            let risk = state.strategy_draft.as_ref().map(assess_risk).unwrap_or(1.0);
            state.risk_score = risk;

            if state.exceeds_risk_threshold() && !state.backtrack_limit_reached() {
                state.requires_backtrack = true;
                state.backtrack_reason = Some(format!(
                    "Risk score {:.0}% exceeds acceptable threshold",
                    risk * 100.0
                ));
                state.backtrack_count += 1;
                record(
                    &mut state,
                    "Requesting strategy revision",
                    Some("Backtrack to Strategist"),
                    None,
                );
                self.publish(&binding, &state).await;
                continue;
            }

            state.requires_backtrack = false;
            state.backtrack_reason = None;
            record(
                &mut state,
                &format!("Strategy approved with risk score {:.0}%", risk * 100.0),
                Some("Audit complete"),
                None,
            );
            self.publish(&binding, &state).await;
            break;
        }

        state.final_recommendation = state.strategy_draft.as_ref().map(|draft| {
            format!(
                "Back {} (stake {:.0}% of bankroll) after {} revision(s).",
                draft.recommended_horse,
                draft.kelly_fraction.unwrap_or_default() * 100.0,
                state.backtrack_count
            )
        });
        state.active_node = Stage::Idle;
        binding.publish(state);
        binding.set_running(false);
        Ok(())
    }
}

fn record(
    state: &mut ReasoningState,
    thought: &str,
    action: Option<&str>,
    observation: Option<&str>,
) {
    state.reasoning_trace.push(ReasoningStep {
        timestamp: Utc::now().to_rfc3339(),
        node: state.active_node,
        thought: thought.to_string(),
        action: action.map(str::to_string),
        observation: observation.map(str::to_string),
    });
}

fn invoke_tool(state: &mut ReasoningState, tool: &str, args: Value) {
    let args = match args {
        Value::Object(args) => args,
        _ => Map::new(),
    };
    state.tool_calls.push(ToolInvocation {
        timestamp: Utc::now().to_rfc3339(),
        tool: tool.to_string(),
        args,
        node: state.active_node.to_string(),
    });
}

fn scout_report(query: &str) -> ScoutData {
    let racecourse = ["Tokyo", "Nakayama", "Kyoto", "Hanshin", "Chukyo", "Sapporo"]
        .into_iter()
        .find(|name| query.to_ascii_lowercase().contains(&name.to_ascii_lowercase()))
        .map(|name| format!("{name} Racecourse"))
        .unwrap_or_else(|| "Unknown".to_string());

    ScoutData {
        racecourse,
        track_condition: "Good".into(),
        weather: "Clear".into(),
        horse_data: Vec::new(),
        sources: vec!["jra.go.jp".into(), "netkeiba.com".into()],
    }
}

/// Each revision trims the stake.
fn draft_strategy(revision: u32) -> StrategyDraft {
    let kelly = 0.3 / f64::from(revision + 1).powi(2);
    StrategyDraft {
        recommended_horse: "Equinox".into(),
        confidence_score: 0.62,
        reasoning_summary: "Consistent closer on a good track".into(),
        kelly_fraction: Some(kelly),
    }
}

fn assess_risk(draft: &StrategyDraft) -> f64 {
    let mut risk = BASE_RISK;
    if draft.kelly_fraction.unwrap_or_default() > 0.25 {
        risk += 0.3;
    }
    if draft.confidence_score < 0.7 {
        risk += 0.2;
    }
    shared::domain::clamp_unit(risk)
}

#[cfg(test)]
#[path = "tests/scripted_tests.rs"]
mod tests;
