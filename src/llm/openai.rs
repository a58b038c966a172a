//! OpenAI Chat Completions client with SSE streaming and function calling.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::http::post_json;
use super::message::{ContentBlock, ModelEvent, ModelRequest, Role, StopReason, ToolCall, ToolChoice, Usage};
use super::sse::{SseEvent, SseParser, into_model_stream};
use super::{LanguageModel, ModelStream};
use crate::errors::ModelError;

const API_URL: &str = "https://api.openai.com/v1/chat/completions";

pub struct OpenAiModel {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiModel {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn headers(&self) -> Result<HeaderMap, ModelError> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|_| ModelError::Other("API key is not a valid header value".into()))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }
}

/// Request body for Chat Completions. Tool results become `tool` role
/// messages; tool uses become `tool_calls` on the assistant message.
pub fn request_body(request: &ModelRequest) -> Value {
    let mut messages = vec![json!({"role": "system", "content": request.system})];
    for message in &request.messages {
        match message.role {
            Role::Assistant => {
                let calls: Vec<Value> = message
                    .content
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::ToolUse { id, name, input } => Some(json!({
                            "id": id,
                            "type": "function",
                            "function": {"name": name, "arguments": input.to_string()},
                        })),
                        _ => None,
                    })
                    .collect();
                let text = message.text();
                let mut m = json!({
                    "role": "assistant",
                    "content": if text.is_empty() { Value::Null } else { Value::String(text) },
                });
                if !calls.is_empty() {
                    m["tool_calls"] = Value::Array(calls);
                }
                messages.push(m);
            }
            Role::User => {
                let text = message.text();
                if !text.is_empty() {
                    messages.push(json!({"role": "user", "content": text}));
                }
                for block in &message.content {
                    if let ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } = block
                    {
                        let content = if *is_error {
                            format!("Error: {}", content)
                        } else {
                            content.clone()
                        };
                        messages.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_use_id,
                            "content": content,
                        }));
                    }
                }
            }
        }
    }

    let mut body = json!({
        "model": request.model,
        "messages": messages,
        "max_completion_tokens": request.max_tokens,
        "stream": true,
        "stream_options": {"include_usage": true},
    });
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    },
                })
            })
            .collect();
        body["tools"] = Value::Array(tools);
        body["tool_choice"] = match &request.tool_choice {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::Tool(name) => json!({"type": "function", "function": {"name": name}}),
        };
    }
    body
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    fn provider(&self) -> &'static str {
        "openai"
    }

    async fn stream(
        &self,
        request: ModelRequest,
        cancel: CancellationToken,
    ) -> Result<ModelStream, ModelError> {
        let body = request_body(&request);
        let response = post_json(&self.client, &self.base_url, self.headers()?, &body, &cancel).await?;
        Ok(into_model_stream(response, OpenAiParser::default(), cancel))
    }
}

#[derive(Debug, Deserialize)]
struct Chunk {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ChunkUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Debug, Default)]
struct OpenAiParser {
    calls: BTreeMap<usize, PendingCall>,
    usage: Usage,
    stop_reason: Option<StopReason>,
    finished: bool,
}

impl OpenAiParser {
    fn flush_calls(&mut self) -> Result<Vec<ModelEvent>, ModelError> {
        let calls = std::mem::take(&mut self.calls);
        calls
            .into_values()
            .map(|c| {
                let input = if c.arguments.trim().is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&c.arguments).map_err(|e| {
                        ModelError::Decode(format!("tool '{}' arguments: {}", c.name, e))
                    })?
                };
                Ok(ModelEvent::ToolCall(ToolCall {
                    id: c.id,
                    name: c.name,
                    input,
                }))
            })
            .collect()
    }

    fn finish_event(&mut self) -> Result<Vec<ModelEvent>, ModelError> {
        let mut out = self.flush_calls()?;
        self.finished = true;
        out.push(ModelEvent::Finish {
            usage: self.usage,
            stop_reason: self.stop_reason.clone().unwrap_or_default(),
        });
        Ok(out)
    }
}

impl SseParser for OpenAiParser {
    fn on_event(&mut self, event: &SseEvent) -> Result<Vec<ModelEvent>, ModelError> {
        if self.finished {
            return Ok(Vec::new());
        }
        if event.data.trim() == "[DONE]" {
            return self.finish_event();
        }

        let chunk: Chunk = serde_json::from_str(&event.data)
            .map_err(|e| ModelError::Decode(format!("{}: {}", e, crate::util::truncate_str(&event.data, 200))))?;
        if let Some(u) = chunk.usage {
            self.usage = Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            };
        }

        let mut out = Vec::new();
        for choice in chunk.choices {
            if let Some(text) = choice.delta.content
                && !text.is_empty()
            {
                out.push(ModelEvent::TextDelta(text));
            }
            for delta in choice.delta.tool_calls {
                let call = self.calls.entry(delta.index).or_default();
                if let Some(id) = delta.id {
                    call.id = id;
                }
                if let Some(function) = delta.function {
                    if let Some(name) = function.name {
                        call.name.push_str(&name);
                    }
                    if let Some(args) = function.arguments {
                        call.arguments.push_str(&args);
                    }
                }
            }
            if let Some(reason) = choice.finish_reason {
                self.stop_reason = Some(StopReason::from_provider(&reason));
                out.extend(self.flush_calls()?);
            }
        }
        Ok(out)
    }

    fn finish(&mut self) -> Result<Vec<ModelEvent>, ModelError> {
        if self.finished {
            return Ok(Vec::new());
        }
        if self.stop_reason.is_none() {
            return Err(ModelError::Decode("stream ended without a finish reason".into()));
        }
        self.finish_event()
    }
}
