//! Multi-turn tool loop: stream a model turn, run the tools it called, feed
//! the results back, repeat.

use appforge_common::TokenUsage;
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::message::{ChatMessage, ContentBlock, ModelEvent, ModelRequest, ToolCall};
use super::pricing;
use super::tools::{ToolExecutor, WrittenFile, describe_tool_call};
use super::LanguageModel;
use crate::errors::{CapabilityError, ModelError};

/// Safety net on model turns, independent of the tool-call budget.
const MAX_TURNS: u32 = 200;

/// Progress reported while the loop runs.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Text(String),
    ToolCall {
        id: String,
        name: String,
        args: Value,
        reason: String,
    },
    ToolResult {
        id: String,
        name: String,
        result: String,
        is_error: bool,
    },
    FileWritten(WrittenFile),
    /// Pipeline-stage transition, reported by the orchestrator.
    Stage {
        capability: &'static str,
        status: StageStatus,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Started,
    Completed,
    Skipped,
    Failed,
    Aborted,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

/// Receives agent progress as it happens.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: AgentEvent);
}

/// Sink that drops everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: AgentEvent) {}
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolLoopOutcome {
    pub usage: TokenUsage,
    pub text: String,
    pub turns: u32,
    pub budget_exhausted: bool,
}

/// A tool loop that ended early. Carries the usage spent before it stopped.
#[derive(Debug)]
pub struct ToolLoopError {
    pub error: CapabilityError,
    pub usage: TokenUsage,
}

/// Run the tool loop until the model stops calling tools, `max_tool_calls`
/// is spent, or `cancel` fires. Tool failures are fed back to the model as
/// error results; only model failures and cancellation end the loop early.
pub async fn run_tool_loop(
    model: &dyn LanguageModel,
    request: ModelRequest,
    tools: &dyn ToolExecutor,
    sink: &dyn EventSink,
    max_tool_calls: u32,
    cancel: &CancellationToken,
) -> Result<ToolLoopOutcome, ToolLoopError> {
    let mut outcome = ToolLoopOutcome::default();
    match drive(model, request, tools, sink, max_tool_calls, cancel, &mut outcome).await {
        Ok(()) => Ok(outcome),
        Err(error) => Err(ToolLoopError {
            error,
            usage: outcome.usage,
        }),
    }
}

async fn drive(
    model: &dyn LanguageModel,
    mut request: ModelRequest,
    tools: &dyn ToolExecutor,
    sink: &dyn EventSink,
    max_tool_calls: u32,
    cancel: &CancellationToken,
    outcome: &mut ToolLoopOutcome,
) -> Result<(), CapabilityError> {
    while outcome.turns < MAX_TURNS {
        if cancel.is_cancelled() {
            return Err(CapabilityError::Aborted);
        }
        outcome.turns += 1;

        let mut stream = model.stream(request.clone(), cancel.clone()).await?;
        let mut text = String::new();
        let mut calls: Vec<ToolCall> = Vec::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CapabilityError::Aborted),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(ModelEvent::TextDelta(delta))) => {
                    sink.emit(AgentEvent::Text(delta.clone()));
                    text.push_str(&delta);
                }
                Some(Ok(ModelEvent::ToolCall(call))) => calls.push(call),
                Some(Ok(ModelEvent::Finish { usage, .. })) => {
                    outcome.usage.accumulate(&TokenUsage {
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                        cost: pricing::cost(&request.model, &usage),
                        tool_calls: 0,
                    });
                }
                Some(Err(ModelError::Cancelled)) => return Err(CapabilityError::Aborted),
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }

        if !text.is_empty() {
            outcome.text.push_str(&text);
        }
        request.messages.push(ChatMessage::assistant(&text, &calls));
        if calls.is_empty() {
            debug!(turns = outcome.turns, "model finished without further tool calls");
            return Ok(());
        }

        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            if outcome.usage.tool_calls >= u64::from(max_tool_calls) {
                outcome.budget_exhausted = true;
                results.push(ContentBlock::ToolResult {
                    tool_use_id: call.id,
                    content: "Tool-call budget exhausted; not executed.".to_string(),
                    is_error: true,
                });
                continue;
            }

            sink.emit(AgentEvent::ToolCall {
                id: call.id.clone(),
                name: call.name.clone(),
                args: call.input.clone(),
                reason: describe_tool_call(&call.name, &call.input),
            });
            let result = tools.execute(&call, cancel).await;
            outcome.usage.tool_calls += 1;
            sink.emit(AgentEvent::ToolResult {
                id: call.id.clone(),
                name: call.name.clone(),
                result: result.output.clone(),
                is_error: result.is_error,
            });
            if let Some(written) = result.written {
                sink.emit(AgentEvent::FileWritten(written));
            }
            results.push(ContentBlock::ToolResult {
                tool_use_id: call.id,
                content: result.output,
                is_error: result.is_error,
            });
        }
        request.messages.push(ChatMessage::tool_results(results));

        if cancel.is_cancelled() {
            return Err(CapabilityError::Aborted);
        }
        if outcome.budget_exhausted {
            warn!(max_tool_calls, "tool-call budget exhausted, ending generation turn loop");
            return Ok(());
        }
    }

    warn!(turns = outcome.turns, "tool loop hit the turn limit");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::llm::scripted::{ScriptedModel, ScriptedTurn};
    use crate::llm::tools::{SandboxTools, ToolSet};
    use crate::sandbox::{LocalExecutor, SandboxFs};
    use serde_json::json;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<AgentEvent>>);

    impl EventSink for Recorder {
        fn emit(&self, event: AgentEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    impl Recorder {
        fn events(&self) -> Vec<AgentEvent> {
            self.0.lock().unwrap().clone()
        }
    }

    fn sandbox_tools(dir: &std::path::Path) -> SandboxTools {
        SandboxTools::new(
            SandboxFs::new(dir),
            Arc::new(LocalExecutor::new(dir)),
            ToolSet::Generation,
        )
    }

    #[tokio::test]
    async fn test_runs_tools_and_feeds_results_back() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::new(vec![
            ScriptedTurn::Events(vec![
                ModelEvent::TextDelta("Writing ".into()),
                ModelEvent::TextDelta("the app".into()),
                ModelEvent::ToolCall(ToolCall {
                    id: "c1".into(),
                    name: "write_file".into(),
                    input: json!({"path": "src/App.tsx", "content": "x"}),
                }),
            ]),
            ScriptedTurn::text("Finished"),
        ]);
        let sink = Recorder::default();
        let out = run_tool_loop(
            &model,
            ModelRequest::new("claude-sonnet-4-5", "sys").with_user("todo app"),
            &sandbox_tools(dir.path()),
            &sink,
            10,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(out.turns, 2);
        assert_eq!(out.usage.tool_calls, 1);
        assert_eq!(out.usage.input_tokens, 200);
        assert!(out.usage.cost > 0.0);
        assert_eq!(out.text, "Writing the appFinished");
        assert!(dir.path().join("src/App.tsx").exists());

        let events = sink.events();
        assert!(matches!(&events[2], AgentEvent::ToolCall { reason, .. } if reason == "Creating: src/App.tsx"));
        assert!(matches!(&events[3], AgentEvent::ToolResult { is_error: false, .. }));
        assert!(matches!(&events[4], AgentEvent::FileWritten(f) if f.path == "src/App.tsx"));

        // The second request carries the tool result for c1.
        let second = &model.requests()[1];
        let last = second.messages.last().unwrap();
        assert!(matches!(
            &last.content[0],
            ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "c1"
        ));
    }

    #[tokio::test]
    async fn test_tool_errors_do_not_stop_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::new(vec![
            ScriptedTurn::tool("read_file", json!({"path": "missing.ts"})),
            ScriptedTurn::text("ok"),
        ]);
        let sink = Recorder::default();
        let out = run_tool_loop(
            &model,
            ModelRequest::new("m", "s"),
            &sandbox_tools(dir.path()),
            &sink,
            10,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(out.turns, 2);
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, AgentEvent::ToolResult { is_error: true, .. })));
    }

    #[tokio::test]
    async fn test_budget_stops_execution() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::new(vec![ScriptedTurn::tools(vec![
            ("list_files", json!({})),
            ("list_files", json!({})),
            ("list_files", json!({})),
        ])]);
        let out = run_tool_loop(
            &model,
            ModelRequest::new("m", "s"),
            &sandbox_tools(dir.path()),
            &NullSink,
            2,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(out.usage.tool_calls, 2);
        assert!(out.budget_exhausted);
        assert_eq!(model.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_is_aborted_not_failure() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::new(vec![ScriptedTurn::Hang]);
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            c.cancel();
        });
        let err = run_tool_loop(
            &model,
            ModelRequest::new("m", "s"),
            &sandbox_tools(dir.path()),
            &NullSink,
            5,
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(err.error.is_aborted());
        assert_eq!(err.usage, TokenUsage::default());
    }

    #[tokio::test]
    async fn test_model_failure_is_llm_failure() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::new(vec![ScriptedTurn::Fail("rate limited".into())]);
        let err = run_tool_loop(
            &model,
            ModelRequest::new("m", "s"),
            &sandbox_tools(dir.path()),
            &NullSink,
            5,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.error.kind(), "llmFailure");
    }

    #[tokio::test]
    async fn test_abort_keeps_usage_of_finished_turns() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::new(vec![
            ScriptedTurn::tool("write_file", json!({"path": "a.ts", "content": "a"})),
            ScriptedTurn::tool("write_file", json!({"path": "b.ts", "content": "b"})),
            ScriptedTurn::Hang,
        ]);
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            c.cancel();
        });
        let err = run_tool_loop(
            &model,
            ModelRequest::new("claude-sonnet-4-5", "s"),
            &sandbox_tools(dir.path()),
            &NullSink,
            10,
            &cancel,
        )
        .await
        .unwrap_err();

        assert!(err.error.is_aborted());
        assert_eq!(model.requests().len(), 3);
        assert_eq!(err.usage.tool_calls, 2);
        assert_eq!(err.usage.input_tokens, 200);
        assert_eq!(err.usage.output_tokens, 100);
        assert!(err.usage.cost > 0.0);
    }

    #[tokio::test]
    async fn test_model_failure_after_a_turn_keeps_usage() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::new(vec![
            ScriptedTurn::tool("list_files", json!({})),
            ScriptedTurn::Fail("overloaded".into()),
        ]);
        let err = run_tool_loop(
            &model,
            ModelRequest::new("m", "s"),
            &sandbox_tools(dir.path()),
            &NullSink,
            5,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.error.kind(), "llmFailure");
        assert_eq!(err.usage.tool_calls, 1);
        assert_eq!(err.usage.input_tokens, 100);
    }
}
