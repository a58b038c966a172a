//! Anthropic Messages API client with SSE streaming and tool use.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::http::post_json;
use super::message::{ContentBlock, ModelEvent, ModelRequest, StopReason, ToolCall, ToolChoice, Usage};
use super::sse::{SseEvent, SseParser, into_model_stream};
use super::{LanguageModel, ModelStream};
use crate::errors::ModelError;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicModel {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicModel {
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
        let key = HeaderValue::from_str(&self.api_key)
            .map_err(|_| ModelError::Other("API key is not a valid header value".into()))?;
        headers.insert("x-api-key", key);
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }
}

/// Request body for the Messages API.
pub fn request_body(request: &ModelRequest) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|m| {
            let content: Vec<Value> = m
                .content
                .iter()
                .map(|block| match block {
                    ContentBlock::Text { text } => json!({"type": "text", "text": text}),
                    ContentBlock::ToolUse { id, name, input } => {
                        json!({"type": "tool_use", "id": id, "name": name, "input": input})
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => json!({
                        "type": "tool_result",
                        "tool_use_id": tool_use_id,
                        "content": content,
                        "is_error": is_error,
                    }),
                })
                .collect();
            json!({"role": m.role.as_str(), "content": content})
        })
        .collect();

    let mut body = json!({
        "model": request.model,
        "max_tokens": request.max_tokens,
        "system": request.system,
        "messages": messages,
        "stream": true,
    });
    if !request.tools.is_empty() {
        body["tools"] = json!(request.tools);
        body["tool_choice"] = match &request.tool_choice {
            ToolChoice::Auto => json!({"type": "auto"}),
            ToolChoice::Tool(name) => json!({"type": "tool", "name": name}),
        };
    }
    body
}

#[async_trait]
impl LanguageModel for AnthropicModel {
    fn provider(&self) -> &'static str {
        "anthropic"
    }

    async fn stream(
        &self,
        request: ModelRequest,
        cancel: CancellationToken,
    ) -> Result<ModelStream, ModelError> {
        let body = request_body(&request);
        let response = post_json(&self.client, &self.base_url, self.headers()?, &body, &cancel).await?;
        Ok(into_model_stream(response, AnthropicParser::default(), cancel))
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: MessageStart,
    },
    ContentBlockStart {
        index: usize,
        content_block: BlockStart,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<DeltaUsage>,
    },
    MessageStop,
    Error {
        error: ErrorBody,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    #[serde(default)]
    usage: Option<StartUsage>,
}

#[derive(Debug, Deserialize)]
struct StartUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockStart {
    Text,
    ToolUse { id: String, name: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeltaUsage {
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug)]
struct PendingTool {
    id: String,
    name: String,
    json: String,
}

#[derive(Debug, Default)]
struct AnthropicParser {
    tools: BTreeMap<usize, PendingTool>,
    usage: Usage,
    stop_reason: Option<StopReason>,
    finished: bool,
}

impl AnthropicParser {
    fn finish_event(&mut self) -> ModelEvent {
        self.finished = true;
        ModelEvent::Finish {
            usage: self.usage,
            stop_reason: self.stop_reason.clone().unwrap_or_default(),
        }
    }
}

impl SseParser for AnthropicParser {
    fn on_event(&mut self, event: &SseEvent) -> Result<Vec<ModelEvent>, ModelError> {
        let parsed: StreamEvent = serde_json::from_str(&event.data)
            .map_err(|e| ModelError::Decode(format!("{}: {}", e, crate::util::truncate_str(&event.data, 200))))?;

        let out = match parsed {
            StreamEvent::MessageStart { message } => {
                if let Some(u) = message.usage {
                    self.usage.input_tokens = u.input_tokens;
                    self.usage.output_tokens = u.output_tokens;
                }
                Vec::new()
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block: BlockStart::ToolUse { id, name },
            } => {
                self.tools.insert(
                    index,
                    PendingTool {
                        id,
                        name,
                        json: String::new(),
                    },
                );
                Vec::new()
            }
            StreamEvent::ContentBlockStart { .. } => Vec::new(),
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } if !text.is_empty() => vec![ModelEvent::TextDelta(text)],
                BlockDelta::InputJsonDelta { partial_json } => {
                    if let Some(tool) = self.tools.get_mut(&index) {
                        tool.json.push_str(&partial_json);
                    }
                    Vec::new()
                }
                _ => Vec::new(),
            },
            StreamEvent::ContentBlockStop { index } => match self.tools.remove(&index) {
                Some(tool) => {
                    let input = if tool.json.trim().is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&tool.json).map_err(|e| {
                            ModelError::Decode(format!("tool '{}' arguments: {}", tool.name, e))
                        })?
                    };
                    vec![ModelEvent::ToolCall(ToolCall {
                        id: tool.id,
                        name: tool.name,
                        input,
                    })]
                }
                None => Vec::new(),
            },
            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason {
                    self.stop_reason = Some(StopReason::from_provider(&reason));
                }
                if let Some(u) = usage {
                    self.usage.output_tokens = u.output_tokens;
                }
                Vec::new()
            }
            StreamEvent::MessageStop => vec![self.finish_event()],
            StreamEvent::Error { error } => {
                let status = if error.kind == "overloaded_error" { 529 } else { 500 };
                return Err(ModelError::Api {
                    status,
                    body: format!("{}: {}", error.kind, error.message),
                });
            }
            StreamEvent::Other => Vec::new(),
        };
        Ok(out)
    }

    fn finish(&mut self) -> Result<Vec<ModelEvent>, ModelError> {
        if self.finished {
            return Ok(Vec::new());
        }
        Err(ModelError::Decode("stream ended before message_stop".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::message::{ChatMessage, ToolSpec};

    fn ev(data: Value) -> SseEvent {
        SseEvent {
            event: data["type"].as_str().map(String::from),
            data: data.to_string(),
        }
    }

    #[test]
    fn test_parses_text_and_tool_use_stream() {
        let mut p = AnthropicParser::default();
        let mut out = Vec::new();
        for data in [
            json!({"type": "message_start", "message": {"usage": {"input_tokens": 120, "output_tokens": 1}}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Creating files"}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "write_file", "input": {}}}),
            json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"path\": \"src/"}}),
            json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "App.tsx\"}"}}),
            json!({"type": "content_block_stop", "index": 1}),
            json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 45}}),
            json!({"type": "message_stop"}),
        ] {
            out.extend(p.on_event(&ev(data)).unwrap());
        }
        assert!(p.finish().unwrap().is_empty());

        assert_eq!(out[0], ModelEvent::TextDelta("Creating files".into()));
        assert_eq!(
            out[1],
            ModelEvent::ToolCall(ToolCall {
                id: "toolu_1".into(),
                name: "write_file".into(),
                input: json!({"path": "src/App.tsx"}),
            })
        );
        assert_eq!(
            out[2],
            ModelEvent::Finish {
                usage: Usage {
                    input_tokens: 120,
                    output_tokens: 45
                },
                stop_reason: StopReason::ToolUse,
            }
        );
    }

    #[test]
    fn test_tool_without_arguments_gets_empty_object() {
        let mut p = AnthropicParser::default();
        p.on_event(&ev(json!({"type": "content_block_start", "index": 0, "content_block": {"type": "tool_use", "id": "t", "name": "list_files"}})))
            .unwrap();
        let out = p.on_event(&ev(json!({"type": "content_block_stop", "index": 0}))).unwrap();
        assert!(matches!(&out[0], ModelEvent::ToolCall(c) if c.input == json!({})));
    }

    #[test]
    fn test_error_event_and_truncated_stream() {
        let mut p = AnthropicParser::default();
        let err = p
            .on_event(&ev(json!({"type": "error", "error": {"type": "overloaded_error", "message": "busy"}})))
            .unwrap_err();
        assert!(err.is_retryable());

        let mut p = AnthropicParser::default();
        p.on_event(&ev(json!({"type": "ping"}))).unwrap();
        assert!(matches!(p.finish(), Err(ModelError::Decode(_))));
    }

    #[test]
    fn test_request_body_shape() {
        let request = ModelRequest::new("claude-sonnet-4-5", "be helpful")
            .with_user("make a todo app")
            .with_tools(vec![ToolSpec {
                name: "create_plan".into(),
                description: "plan".into(),
                input_schema: json!({"type": "object"}),
            }])
            .with_tool_choice(ToolChoice::Tool("create_plan".into()));
        let mut request = request;
        request.messages.push(ChatMessage::tool_results(vec![ContentBlock::ToolResult {
            tool_use_id: "t1".into(),
            content: "done".into(),
            is_error: false,
        }]));

        let body = request_body(&request);
        assert_eq!(body["stream"], true);
        assert_eq!(body["system"], "be helpful");
        assert_eq!(body["tool_choice"], json!({"type": "tool", "name": "create_plan"}));
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
        assert_eq!(body["messages"][0]["content"][0]["text"], "make a todo app");
        assert_eq!(body["messages"][1]["content"][0]["type"], "tool_result");
    }
}
