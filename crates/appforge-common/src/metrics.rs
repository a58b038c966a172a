use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Token, cost and tool-call counters. Only ever added to.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub tool_calls: u64,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Add another usage record. Negative or NaN costs are clamped to zero so
    /// the running totals never decrease.
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        if other.cost.is_finite() && other.cost > 0.0 {
            self.cost += other.cost;
        }
        self.tool_calls += other.tool_calls;
    }
}

/// Outcome of the validation / error-fixing loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompilerCheckMetrics {
    pub max_iterations: u8,
    pub iterations_used: u8,
    pub initial_error_count: usize,
    pub final_error_count: usize,
    pub has_remaining_errors: bool,
}

/// Summary of one orchestrator run, returned to the caller and persisted on
/// the session row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationMetrics {
    pub session_id: Uuid,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
    pub tool_calls: u64,
    pub duration_ms: u64,
    pub steps: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiler_checks: Option<CompilerCheckMetrics>,
}

impl GenerationMetrics {
    pub fn from_usage(session_id: Uuid, usage: &TokenUsage, duration_ms: u64, steps: u32) -> Self {
        Self {
            session_id,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens: usage.total_tokens(),
            cost: usage.cost,
            tool_calls: usage.tool_calls,
            duration_ms,
            steps,
            compiler_checks: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulate_is_monotonic() {
        let mut total = TokenUsage::default();
        total.accumulate(&TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
            cost: 0.25,
            tool_calls: 2,
        });
        total.accumulate(&TokenUsage {
            input_tokens: 1,
            output_tokens: 1,
            cost: -3.0,
            tool_calls: 0,
        });
        total.accumulate(&TokenUsage {
            cost: f64::NAN,
            ..Default::default()
        });
        assert_eq!(total.input_tokens, 11);
        assert_eq!(total.output_tokens, 6);
        assert_eq!(total.total_tokens(), 17);
        assert_eq!(total.cost, 0.25);
        assert_eq!(total.tool_calls, 2);
    }

    #[test]
    fn test_metrics_omit_compiler_checks_when_absent() {
        let metrics = GenerationMetrics::from_usage(Uuid::nil(), &TokenUsage::default(), 10, 1);
        let json = serde_json::to_value(&metrics).unwrap();
        assert!(json.get("compilerChecks").is_none());
        assert_eq!(json["durationMs"], 10);
    }
}
