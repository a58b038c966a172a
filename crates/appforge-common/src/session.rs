use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::CapabilityConfig;
use crate::metrics::GenerationMetrics;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Generating,
    Completed,
    Failed,
    /// Aborted on request. Terminal, and reported separately from `Failed`.
    Stopped,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generating => "generating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Generating)
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generating" => Ok(Self::Generating),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

/// One generation request and its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    pub prompt: String,
    pub config: CapabilityConfig,
    pub model: String,
    pub status: SessionStatus,
    pub error: Option<String>,
    pub metrics: Option<GenerationMetrics>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(id: Uuid, prompt: &str, config: CapabilityConfig, model: &str) -> Self {
        let now = Utc::now();
        Self {
            id,
            prompt: prompt.to_string(),
            config,
            model: model.to_string(),
            status: SessionStatus::Generating,
            error: None,
            metrics: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Age of the session relative to `now`, in whole milliseconds.
    pub fn age_millis(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_milliseconds()
    }

    /// A session is stuck when it still reports `generating` and is strictly
    /// older than `threshold_ms`. A session exactly at the threshold is not stuck.
    pub fn is_stuck(&self, now: DateTime<Utc>, threshold_ms: i64) -> bool {
        self.status == SessionStatus::Generating && self.age_millis(now) > threshold_ms
    }
}
