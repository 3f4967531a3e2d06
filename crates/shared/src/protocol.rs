use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{
    domain::{
        clamp_unit, ReasoningStep, ScoutData, Stage, StrategyDraft, ToolInvocation,
        MAX_BACKTRACKS, RISK_THRESHOLD,
    },
    error::ProtocolError,
};

const STAGE_KEY: &str = "active_node";
const LEGACY_STAGE_KEY: &str = "active_stage";

/// Full snapshot of the remote reasoning pipeline.
///
/// Snapshots are always replaced wholesale. Decoding is lenient: a field that
/// is missing or has the wrong shape takes its value from the canonical
/// snapshot ([`ReasoningState::default`]) instead of failing the whole payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReasoningState {
    #[serde(default, deserialize_with = "lenient")]
    pub active_node: Stage,
    #[serde(default, deserialize_with = "lenient_seq")]
    pub reasoning_trace: Vec<ReasoningStep>,
    #[serde(default, deserialize_with = "lenient_seq")]
    pub tool_calls: Vec<ToolInvocation>,
    #[serde(default, deserialize_with = "lenient")]
    pub scout_data: Option<ScoutData>,
    #[serde(default, deserialize_with = "lenient")]
    pub strategy_draft: Option<StrategyDraft>,
    #[serde(default, deserialize_with = "lenient_risk")]
    pub risk_score: f64,
    #[serde(default, deserialize_with = "lenient")]
    pub requires_backtrack: bool,
    #[serde(default, deserialize_with = "lenient")]
    pub backtrack_reason: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub backtrack_count: u32,
    #[serde(default, deserialize_with = "lenient")]
    pub query: String,
    #[serde(default, deserialize_with = "lenient")]
    pub final_recommendation: Option<String>,
}

impl ReasoningState {
    /// Canonical snapshot carrying only `query`.
    pub fn for_query(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    /// Decodes a pushed snapshot. Never fails; a non-object yields the canonical snapshot.
    ///
    /// `active_stage` is accepted as a legacy name for `active_node`; when both
    /// are present `active_node` wins.
    pub fn from_value(value: Value) -> Self {
        let Value::Object(mut fields) = value else {
            return Self::default();
        };
        if let Some(legacy) = fields.remove(LEGACY_STAGE_KEY) {
            fields.entry(STAGE_KEY).or_insert(legacy);
        }
        serde_json::from_value(Value::Object(fields)).unwrap_or_default()
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(raw)?;
        Ok(Self::from_value(value))
    }

    pub fn exceeds_risk_threshold(&self) -> bool {
        self.risk_score > RISK_THRESHOLD
    }

    pub fn backtrack_limit_reached(&self) -> bool {
        self.backtrack_count >= MAX_BACKTRACKS
    }

    /// Reason text, only while a backtrack is actually requested.
    pub fn active_backtrack_reason(&self) -> Option<&str> {
        if self.requires_backtrack {
            self.backtrack_reason.as_deref()
        } else {
            None
        }
    }
}

/// One message of the inbound snapshot stream.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StateUpdate {
    /// `None` until the remote side has produced its first snapshot.
    #[serde(default)]
    pub snapshot: Option<ReasoningState>,
    #[serde(default)]
    pub running: bool,
}

impl StateUpdate {
    pub fn new(snapshot: ReasoningState, running: bool) -> Self {
        Self {
            snapshot: Some(snapshot),
            running,
        }
    }

    pub fn from_value(value: Value) -> Self {
        let Value::Object(mut fields) = value else {
            return Self::default();
        };
        let running = fields
            .get("running")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let snapshot = match fields.remove("snapshot").or_else(|| fields.remove("state")) {
            None | Some(Value::Null) => None,
            Some(raw) => Some(ReasoningState::from_value(raw)),
        };
        Self { snapshot, running }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(raw)?;
        Ok(Self::from_value(value))
    }
}

fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

fn lenient_seq<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let Value::Array(items) = Value::deserialize(deserializer)? else {
        return Ok(Vec::new());
    };
    Ok(items
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect())
}

fn lenient_risk<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value.as_f64().map(clamp_unit).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn missing_fields_fall_back_to_canonical_snapshot() {
        let state = ReasoningState::from_value(json!({ "query": "Tokyo turf" }));
        assert_eq!(state, ReasoningState::for_query("Tokyo turf"));
    }

    #[test]
    fn non_object_payload_yields_canonical_snapshot() {
        assert_eq!(ReasoningState::from_value(json!([1, 2, 3])), ReasoningState::default());
        assert_eq!(ReasoningState::from_value(Value::Null), ReasoningState::default());
    }

    #[test]
    fn unknown_stage_collapses_to_idle() {
        let state = ReasoningState::from_value(json!({ "active_node": "verifier" }));
        assert_eq!(state.active_node, Stage::Idle);

        let state = ReasoningState::from_value(json!({ "active_node": 42 }));
        assert_eq!(state.active_node, Stage::Idle);

        let state = ReasoningState::from_value(json!({ "active_stage": "Auditor" }));
        assert_eq!(state.active_node, Stage::Auditor);
    }

    #[test]
    fn both_stage_keys_keep_the_rest_of_the_snapshot() {
        let state = ReasoningState::from_value(json!({
            "active_node": "scout",
            "active_stage": "auditor",
            "query": "Tokyo",
            "risk_score": 0.4,
        }));

        assert_eq!(state.active_node, Stage::Scout);
        assert_eq!(state.query, "Tokyo");
        assert_eq!(state.risk_score, 0.4);
    }

    #[test]
    fn tool_call_node_keeps_free_form_labels() {
        let state = ReasoningState::from_value(json!({
            "tool_calls": [
                { "timestamp": "2024-01-01T00:00:00Z", "tool": "search_odds",
                  "args": { "race": 11 }, "node": "odds_fetcher" },
                { "timestamp": "2024-01-01T00:00:01Z", "tool": "search_racecourse_conditions",
                  "node": "scout" }
            ]
        }));

        assert_eq!(state.tool_calls.len(), 2);
        assert_eq!(state.tool_calls[0].node, "odds_fetcher");
        assert_eq!(state.tool_calls[0].stage(), Stage::Idle);
        assert_eq!(state.tool_calls[1].stage(), Stage::Scout);
    }

    #[test]
    fn malformed_fields_fall_back_individually() {
        let state = ReasoningState::from_value(json!({
            "active_node": "strategist",
            "risk_score": "high",
            "backtrack_count": -2,
            "requires_backtrack": "yes",
            "scout_data": { "racecourse": "Kyoto Racecourse" },
            "query": "Kyoto",
        }));

        assert_eq!(state.active_node, Stage::Strategist);
        assert_eq!(state.risk_score, 0.0);
        assert_eq!(state.backtrack_count, 0);
        assert!(!state.requires_backtrack);
        assert!(state.scout_data.is_none());
        assert_eq!(state.query, "Kyoto");
    }

    #[test]
    fn risk_score_is_clamped_into_unit_interval() {
        let state = ReasoningState::from_value(json!({ "risk_score": 1.7 }));
        assert_eq!(state.risk_score, 1.0);
        let state = ReasoningState::from_value(json!({ "risk_score": -0.3 }));
        assert_eq!(state.risk_score, 0.0);
    }

    #[test]
    fn malformed_trace_entries_are_dropped_and_order_is_kept() {
        let state = ReasoningState::from_value(json!({
            "reasoning_trace": [
                { "timestamp": "2024-01-01T00:00:00Z", "node": "scout", "thought": "first" },
                { "timestamp": "2024-01-01T00:00:01Z", "node": "scout" },
                { "timestamp": "2024-01-01T00:00:02Z", "node": "strategist", "thought": "third",
                  "action": "rank horses" }
            ],
            "tool_calls": "not a list"
        }));

        let thoughts: Vec<_> = state
            .reasoning_trace
            .iter()
            .map(|step| step.thought.as_str())
            .collect();
        assert_eq!(thoughts, vec!["first", "third"]);
        assert_eq!(state.reasoning_trace[1].action.as_deref(), Some("rank horses"));
        assert!(state.tool_calls.is_empty());
        assert!(state.reasoning_trace[0].timestamp_utc().is_some());
    }

    #[test]
    fn strategy_confidence_is_clamped() {
        let state = ReasoningState::from_value(json!({
            "strategy_draft": {
                "recommended_horse": "Equinox",
                "confidence_score": 1.4,
                "reasoning_summary": "strong closer",
                "kelly_fraction": 0.12
            }
        }));
        let draft = state.strategy_draft.expect("draft");
        assert_eq!(draft.confidence_score, 1.0);
        assert_eq!(draft.kelly_fraction, Some(0.12));
    }

    #[test]
    fn backtrack_reason_only_reported_while_flag_is_set() {
        let mut state = ReasoningState {
            backtrack_reason: Some("risk too high".into()),
            ..ReasoningState::default()
        };
        assert_eq!(state.active_backtrack_reason(), None);
        state.requires_backtrack = true;
        assert_eq!(state.active_backtrack_reason(), Some("risk too high"));
    }

    #[test]
    fn risk_policy_helpers_follow_pipeline_limits() {
        let state = ReasoningState {
            risk_score: 0.8,
            backtrack_count: 3,
            ..ReasoningState::default()
        };
        assert!(state.exceeds_risk_threshold());
        assert!(state.backtrack_limit_reached());
        assert!(!ReasoningState::default().exceeds_risk_threshold());
    }

    #[test]
    fn state_update_without_snapshot_means_not_yet_produced() {
        let update = StateUpdate::from_json_str(r#"{ "running": true }"#).expect("json");
        assert_eq!(update.snapshot, None);
        assert!(update.running);

        let update = StateUpdate::from_json_str(r#"{ "state": { "active_node": "scout" } }"#)
            .expect("json");
        assert_eq!(
            update.snapshot.map(|snapshot| snapshot.active_node),
            Some(Stage::Scout)
        );
        assert!(!update.running);
    }

    #[test]
    fn invalid_json_is_a_protocol_error() {
        assert!(matches!(
            ReasoningState::from_json_str("{ nope"),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn stage_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(Stage::Strategist).expect("serialize"),
            json!("strategist")
        );
        assert_eq!(Stage::parse("  SCOUT "), Stage::Scout);
        assert_eq!(Stage::parse(""), Stage::Idle);
    }
}
