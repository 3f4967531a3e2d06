use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Risk above this value makes the auditor request a strategy revision.
pub const RISK_THRESHOLD: f64 = 0.7;
/// The auditor accepts the current strategy once this many revisions happened.
pub const MAX_BACKTRACKS: u32 = 3;

/// Stage the remote reasoning pipeline is currently executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum Stage {
    #[default]
    Idle,
    Scout,
    Strategist,
    Auditor,
}

impl Stage {
    /// Working stages in pipeline order.
    pub const PIPELINE: [Stage; 3] = [Stage::Scout, Stage::Strategist, Stage::Auditor];

    /// Unknown or empty names collapse to [`Stage::Idle`].
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "scout" => Stage::Scout,
            "strategist" => Stage::Strategist,
            "auditor" => Stage::Auditor,
            _ => Stage::Idle,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Scout => "scout",
            Stage::Strategist => "strategist",
            Stage::Auditor => "auditor",
        }
    }

    pub fn is_active(self) -> bool {
        self != Stage::Idle
    }
}

impl From<String> for Stage {
    fn from(value: String) -> Self {
        Stage::parse(&value)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub timestamp: String,
    pub node: Stage,
    pub thought: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<String>,
}

impl ReasoningStep {
    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.timestamp)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub timestamp: String,
    pub tool: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    /// Label of the caller as reported by the agent; not limited to stage names.
    pub node: String,
}

impl ToolInvocation {
    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.timestamp)
    }

    /// Caller label read as a stage; labels that name no stage give idle.
    pub fn stage(&self) -> Stage {
        Stage::parse(&self.node)
    }
}

/// Conditions gathered by the scout stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoutData {
    pub racecourse: String,
    pub track_condition: String,
    pub weather: String,
    #[serde(default)]
    pub horse_data: Vec<Map<String, Value>>,
    #[serde(default)]
    pub sources: Vec<String>,
}

/// Strategy proposed by the strategist stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDraft {
    pub recommended_horse: String,
    #[serde(deserialize_with = "unit_interval")]
    pub confidence_score: f64,
    pub reasoning_summary: String,
    #[serde(
        default,
        deserialize_with = "optional_unit_interval",
        skip_serializing_if = "Option::is_none"
    )]
    pub kelly_fraction: Option<f64>,
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

/// Clamps into `[0.0, 1.0]`; NaN becomes `0.0`.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn unit_interval<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    f64::deserialize(deserializer).map(clamp_unit)
}

fn optional_unit_interval<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.map(clamp_unit))
}
