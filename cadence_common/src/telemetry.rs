//! Scheduler snapshot message.
//!
//! Wire shape consumed by dashboards: camelCase keys, `parentId` only on
//! nested commands, `requirements` only when non-empty. Running commands are
//! listed ancestors-first.

use serde::{Deserialize, Serialize};

/// Mechanism reference inside a command entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementMessage {
    pub name: String,
}

/// A command waiting on deck.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedCommandMessage {
    pub priority: i32,
    pub id: u32,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<RequirementMessage>,
}

/// A mounted command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningCommandMessage {
    /// Duration of the most recent slice [ms].
    pub last_time_ms: f64,
    /// Sum of all slice durations since mounting [ms].
    pub total_time_ms: f64,
    pub priority: i32,
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<u32>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<RequirementMessage>,
}

/// Whole-scheduler snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerMessage {
    /// Duration of the most recent tick [ms], `-1` before the first tick.
    pub last_time_ms: f64,
    #[serde(default)]
    pub queued_commands: Vec<QueuedCommandMessage>,
    #[serde(default)]
    pub running_commands: Vec<RunningCommandMessage>,
}

impl SchedulerMessage {
    /// Pretty-printed JSON document.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Single-line JSON document.
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
