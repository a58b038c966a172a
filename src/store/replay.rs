//! Timeline → replay-entry transform.
//!
//! The emitter stores tool arguments and tool output as the strings that went
//! over the wire. Replay clients want structured values, so each string is
//! parsed as JSON and falls back to a plain string when it is not JSON.

use appforge_common::{TimelineItem, TimelineKind};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplayEntry {
    #[serde(rename_all = "camelCase")]
    Message {
        id: String,
        role: String,
        content: String,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        id: String,
        name: String,
        parameters: Value,
        reason: String,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        id: String,
        tool_name: String,
        result: Value,
        is_error: bool,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    Stage {
        id: String,
        capability: String,
        status: String,
        timestamp: i64,
    },
}

impl ReplayEntry {
    pub fn id(&self) -> &str {
        match self {
            Self::Message { id, .. }
            | Self::ToolCall { id, .. }
            | Self::ToolResult { id, .. }
            | Self::Stage { id, .. } => id,
        }
    }
}

pub fn replay_entries(timeline: &[TimelineItem]) -> Vec<ReplayEntry> {
    timeline.iter().map(replay_entry).collect()
}

fn replay_entry(item: &TimelineItem) -> ReplayEntry {
    let p = &item.payload;
    let id = item.item_id.clone();
    let timestamp = item.timestamp;
    match item.kind {
        TimelineKind::Message => ReplayEntry::Message {
            id,
            role: str_field(p, "role"),
            content: str_field(p, "content"),
            timestamp,
        },
        TimelineKind::ToolCall => ReplayEntry::ToolCall {
            id,
            name: str_field(p, "name"),
            parameters: parse_json_or_raw(p.get("args")),
            reason: str_field(p, "reason"),
            timestamp,
        },
        TimelineKind::ToolResult => ReplayEntry::ToolResult {
            id,
            tool_name: str_field(p, "toolName"),
            result: parse_json_or_raw(p.get("result")),
            is_error: p.get("isError").and_then(Value::as_bool).unwrap_or(false),
            timestamp,
        },
        TimelineKind::Stage => ReplayEntry::Stage {
            id,
            capability: str_field(p, "capability"),
            status: str_field(p, "status"),
            timestamp,
        },
    }
}

fn str_field(payload: &Value, key: &str) -> String {
    payload
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Stored strings are parsed; values that are already structured pass through.
fn parse_json_or_raw(value: Option<&Value>) -> Value {
    match value {
        Some(Value::String(s)) => {
            serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone()))
        }
        Some(other) => other.clone(),
        None => Value::Null,
    }
}
