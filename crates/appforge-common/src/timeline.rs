use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TimelineKind {
    Message,
    ToolCall,
    ToolResult,
    Stage,
}

impl TimelineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::Stage => "stage",
        }
    }
}

impl FromStr for TimelineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(Self::Message),
            "tool_call" => Ok(Self::ToolCall),
            "tool_result" => Ok(Self::ToolResult),
            "stage" => Ok(Self::Stage),
            _ => Err(format!("Invalid timeline kind: {}", s)),
        }
    }
}

/// One append-only entry in a session's audit log.
///
/// `item_id` is the identifier the entry had on the wire (message id or
/// tool-call id). `payload` holds the kind-specific body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimelineItem {
    pub id: i64,
    pub session_id: Uuid,
    pub kind: TimelineKind,
    pub item_id: String,
    pub payload: Value,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings() {
        for kind in [
            TimelineKind::Message,
            TimelineKind::ToolCall,
            TimelineKind::ToolResult,
            TimelineKind::Stage,
        ] {
            assert_eq!(kind.as_str().parse::<TimelineKind>().unwrap(), kind);
        }
        assert_eq!(serde_json::to_string(&TimelineKind::ToolCall).unwrap(), "\"tool_call\"");
    }
}
