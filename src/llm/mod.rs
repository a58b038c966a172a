//! Language-model seam.
//!
//! A [`LanguageModel`] turns a [`ModelRequest`] into a push stream of
//! [`ModelEvent`]s. Providers (Anthropic, OpenAI) speak SSE over reqwest;
//! [`ModelRouter`] picks one by model name. [`agent::run_tool_loop`] drives
//! multi-turn tool use on top of any model.

pub mod agent;
pub mod anthropic;
mod http;
pub mod message;
pub mod openai;
pub mod pricing;
pub mod router;
pub mod scripted;
pub mod sse;
pub mod tools;

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::errors::ModelError;

pub use agent::{AgentEvent, EventSink, NullSink, StageStatus, ToolLoopError, ToolLoopOutcome, run_tool_loop};
pub use message::{ChatMessage, ContentBlock, ModelEvent, ModelRequest, ModelResponse, Role, StopReason, ToolCall, ToolChoice, ToolSpec, Usage};
pub use router::{ModelRouter, Provider};
pub use scripted::ScriptedModel;
pub use tools::{SandboxTools, ToolExecutor, ToolOutcome, ToolSet, WrittenFile, describe_tool_call};

pub type ModelStream = Pin<Box<dyn Stream<Item = Result<ModelEvent, ModelError>> + Send>>;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn provider(&self) -> &'static str;

    /// Start a streaming call. The stream ends after a `Finish` event, or
    /// with `ModelError::Cancelled` once `cancel` fires.
    async fn stream(
        &self,
        request: ModelRequest,
        cancel: CancellationToken,
    ) -> Result<ModelStream, ModelError>;

    /// One call, drained into a single response.
    async fn complete(
        &self,
        request: ModelRequest,
        cancel: CancellationToken,
    ) -> Result<ModelResponse, ModelError> {
        let stream = self.stream(request, cancel.clone()).await?;
        collect_response(stream, &cancel).await
    }
}

/// Drain a model stream. Cancellation wins over any pending event.
pub async fn collect_response(
    mut stream: ModelStream,
    cancel: &CancellationToken,
) -> Result<ModelResponse, ModelError> {
    let mut response = ModelResponse::default();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ModelError::Cancelled),
            next = stream.next() => next,
        };
        match next {
            Some(Ok(ModelEvent::TextDelta(text))) => response.text.push_str(&text),
            Some(Ok(ModelEvent::ToolCall(call))) => response.tool_calls.push(call),
            Some(Ok(ModelEvent::Finish { usage, stop_reason })) => {
                response.usage = usage;
                response.stop_reason = stop_reason;
            }
            Some(Err(e)) => return Err(e),
            None => return Ok(response),
        }
    }
}
