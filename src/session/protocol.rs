use appforge_common::{AppStatus, CapabilityConfig, GenerationMetrics};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

// ── Client → server ──────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    StartGeneration {
        prompt: String,
        #[serde(default)]
        config: CapabilityConfig,
        #[serde(default)]
        model: Option<String>,
    },
    StopGeneration,
    #[serde(rename_all = "camelCase")]
    SubscribeToSession { session_id: Uuid },
    #[serde(rename_all = "camelCase")]
    SaveFile {
        session_id: Uuid,
        path: String,
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    StartApp { session_id: Uuid },
    #[serde(rename_all = "camelCase")]
    StopApp { session_id: Uuid },
    #[serde(rename_all = "camelCase")]
    RestartApp { session_id: Uuid },
}

// ── Server → client ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    SessionStarted { session_id: Uuid },
    /// A streamed chunk. Consecutive chunks of one message share `id`.
    LlmMessage {
        id: String,
        role: String,
        content: String,
        timestamp: i64,
    },
    ToolCall {
        id: String,
        name: String,
        args: Value,
        reason: String,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        id: String,
        tool_name: String,
        result: String,
        timestamp: i64,
        is_error: bool,
    },
    #[serde(rename_all = "camelCase")]
    Stage {
        session_id: Uuid,
        capability: String,
        status: String,
    },
    #[serde(rename_all = "camelCase")]
    GenerationComplete {
        session_id: Uuid,
        metrics: GenerationMetrics,
    },
    AppStatus(AppStatus),
    #[serde(rename_all = "camelCase")]
    FileSaved { session_id: Uuid, path: String },
    Info { message: String },
    /// Always sanitized before it is built.
    Error { message: String },
}

/// Serialize and broadcast an event. Returns silently when nobody listens.
pub fn broadcast_event(tx: &broadcast::Sender<String>, event: &ServerEvent) {
    match serde_json::to_string(event) {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => warn!(error = %e, "failed to serialize server event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appforge_common::InputMode;

    #[test]
    fn test_start_generation_parses_with_config() {
        let raw = r#"{"type":"start_generation","data":{"prompt":"Create a simple todo app","config":{"inputMode":"template","planning":true,"compilerChecks":true,"maxIterations":2},"model":"gpt-4o"}}"#;
        let event: ClientEvent = serde_json::from_str(raw).unwrap();
        let ClientEvent::StartGeneration { prompt, config, model } = event else {
            panic!("expected start_generation");
        };
        assert_eq!(prompt, "Create a simple todo app");
        assert_eq!(config.input_mode, InputMode::Template);
        assert_eq!(config.max_iterations, 2);
        assert_eq!(model.as_deref(), Some("gpt-4o"));
    }

    #[test]
    fn test_stop_generation_needs_no_data() {
        let event: ClientEvent = serde_json::from_str(r#"{"type":"stop_generation"}"#).unwrap();
        assert!(matches!(event, ClientEvent::StopGeneration));
    }

    #[test]
    fn test_save_file_uses_camel_case() {
        let id = Uuid::new_v4();
        let raw = format!(
            r#"{{"type":"save_file","data":{{"sessionId":"{}","path":"src/App.tsx","content":"x"}}}}"#,
            id
        );
        let event: ClientEvent = serde_json::from_str(&raw).unwrap();
        assert!(matches!(event, ClientEvent::SaveFile { session_id, .. } if session_id == id));
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        assert!(serde_json::from_str::<ClientEvent>(r#"{"type":"format_disk"}"#).is_err());
    }

    #[test]
    fn test_server_event_shapes() {
        let json = serde_json::to_value(ServerEvent::ToolResult {
            id: "toolu_1".into(),
            tool_name: "write_file".into(),
            result: "ok".into(),
            timestamp: 3,
            is_error: false,
        })
        .unwrap();
        assert_eq!(json["type"], "tool_result");
        assert_eq!(json["data"]["toolName"], "write_file");
        assert_eq!(json["data"]["isError"], false);

        let json = serde_json::to_value(ServerEvent::SessionStarted { session_id: Uuid::nil() }).unwrap();
        assert_eq!(json["type"], "session_started");
        assert!(json["data"]["sessionId"].is_string());
    }

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscribers() {
        let (tx, _) = broadcast::channel::<String>(16);
        let mut rx = tx.subscribe();
        broadcast_event(&tx, &ServerEvent::Info { message: "hi".into() });
        let received = rx.recv().await.unwrap();
        assert!(received.contains("\"type\":\"info\""));
    }

    #[test]
    fn test_broadcast_without_receivers_is_silent() {
        let (tx, _) = broadcast::channel::<String>(16);
        broadcast_event(&tx, &ServerEvent::Info { message: "nobody".into() });
    }
}
