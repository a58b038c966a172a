//! A `LanguageModel` that replays scripted turns. Used by tests and by
//! pipeline scenarios that must run without network access.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::message::{ModelEvent, ModelRequest, StopReason, ToolCall, Usage};
use super::{LanguageModel, ModelStream};
use crate::errors::ModelError;

/// Usage reported for every scripted turn unless overridden.
pub const SCRIPTED_USAGE: Usage = Usage {
    input_tokens: 100,
    output_tokens: 50,
};

#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    /// Stream these events, then a `Finish`.
    Events(Vec<ModelEvent>),
    /// Fail the call before streaming.
    Fail(String),
    /// Never produce anything; ends only when cancelled.
    Hang,
}

impl ScriptedTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Events(vec![ModelEvent::TextDelta(text.into())])
    }

    pub fn tool(name: &str, input: Value) -> Self {
        Self::tools(vec![(name, input)])
    }

    pub fn tools(calls: Vec<(&str, Value)>) -> Self {
        Self::Events(
            calls
                .into_iter()
                .map(|(name, input)| {
                    ModelEvent::ToolCall(ToolCall {
                        id: format!("toolu_{}", &Uuid::new_v4().simple().to_string()[..12]),
                        name: name.to_string(),
                        input,
                    })
                })
                .collect(),
        )
    }
}

pub struct ScriptedModel {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<ModelRequest>>,
    usage: Usage,
}

impl ScriptedModel {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
            usage: SCRIPTED_USAGE,
        }
    }

    pub fn text_only(text: &str) -> Self {
        Self::new(vec![ScriptedTurn::text(text)])
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    pub fn push_turn(&self, turn: ScriptedTurn) {
        self.turns.lock().unwrap_or_else(|e| e.into_inner()).push_back(turn);
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn remaining_turns(&self) -> usize {
        self.turns.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn provider(&self) -> &'static str {
        "scripted"
    }

    async fn stream(
        &self,
        request: ModelRequest,
        cancel: CancellationToken,
    ) -> Result<ModelStream, ModelError> {
        if cancel.is_cancelled() {
            return Err(ModelError::Cancelled);
        }
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);

        // An exhausted script answers with a plain closing turn.
        let turn = self
            .turns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| ScriptedTurn::text("Done."));

        match turn {
            ScriptedTurn::Fail(message) => Err(ModelError::Other(message)),
            ScriptedTurn::Hang => Ok(Box::pin(stream::once(async move {
                cancel.cancelled().await;
                Err(ModelError::Cancelled)
            }))),
            ScriptedTurn::Events(mut events) => {
                let has_tools = events.iter().any(|e| matches!(e, ModelEvent::ToolCall(_)));
                if !events.iter().any(|e| matches!(e, ModelEvent::Finish { .. })) {
                    events.push(ModelEvent::Finish {
                        usage: self.usage,
                        stop_reason: if has_tools {
                            StopReason::ToolUse
                        } else {
                            StopReason::EndTurn
                        },
                    });
                }
                Ok(Box::pin(stream::iter(events.into_iter().map(Ok))))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_replays_turns_in_order_then_closes() {
        let model = ScriptedModel::new(vec![
            ScriptedTurn::tool("list_files", json!({})),
            ScriptedTurn::text("All done"),
        ]);
        let cancel = CancellationToken::new();

        let first = model.complete(ModelRequest::new("m", "s"), cancel.clone()).await.unwrap();
        assert_eq!(first.tool_calls.len(), 1);
        assert_eq!(first.stop_reason, StopReason::ToolUse);
        assert_eq!(first.usage, SCRIPTED_USAGE);

        let second = model.complete(ModelRequest::new("m", "s"), cancel.clone()).await.unwrap();
        assert_eq!(second.text, "All done");

        let third = model.complete(ModelRequest::new("m", "s"), cancel).await.unwrap();
        assert_eq!(third.text, "Done.");
        assert_eq!(model.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_hang_ends_on_cancel() {
        let model = ScriptedModel::new(vec![ScriptedTurn::Hang]);
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            c.cancel();
        });
        let err = model.complete(ModelRequest::new("m", "s"), cancel).await.unwrap_err();
        assert!(matches!(err, ModelError::Cancelled));
    }
}
