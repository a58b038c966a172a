use std::sync::{Arc, Mutex};

use appforge_common::{TimelineKind, now_millis};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use super::protocol::ServerEvent;
use super::rooms::Rooms;
use crate::llm::{AgentEvent, EventSink};
use crate::store::DbHandle;

/// Something to persist, in the order it was emitted.
enum Record {
    /// One streamed chunk of an assistant message. Chunks sharing an id are
    /// stored as a single timeline message.
    Text {
        id: String,
        delta: String,
        timestamp: i64,
    },
    Timeline {
        kind: TimelineKind,
        item_id: String,
        payload: Value,
        timestamp: i64,
    },
    File {
        path: String,
        content: String,
    },
}

/// Event sink for one session: publishes every event to the session's room
/// and persists it to the timeline through a single ordered writer task.
pub struct SessionEmitter {
    session_id: Uuid,
    rooms: Arc<Rooms>,
    records: mpsc::UnboundedSender<Record>,
    message_id: Mutex<Option<String>>,
}

impl SessionEmitter {
    /// Create the emitter and its writer. The writer finishes once every
    /// clone of the emitter is dropped and all records are stored.
    pub fn spawn(session_id: Uuid, rooms: Arc<Rooms>, db: DbHandle) -> (Arc<Self>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_records(session_id, db, rx));
        let emitter = Arc::new(Self {
            session_id,
            rooms,
            records: tx,
            message_id: Mutex::new(None),
        });
        (emitter, writer)
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Record the user's prompt as the first message of the conversation.
    pub fn user_message(&self, content: &str) {
        self.reset_message();
        let id = new_message_id();
        let timestamp = now_millis();
        self.rooms.publish(
            self.session_id,
            &ServerEvent::LlmMessage {
                id: id.clone(),
                role: "user".into(),
                content: content.to_string(),
                timestamp,
            },
        );
        self.record(Record::Timeline {
            kind: TimelineKind::Message,
            item_id: id,
            payload: json!({"role": "user", "content": content}),
            timestamp,
        });
    }

    /// Id of the assistant message currently streaming, starting a new one
    /// when none is open.
    fn assistant_message_id(&self) -> String {
        let mut current = self.message_id.lock().unwrap_or_else(|e| e.into_inner());
        current.get_or_insert_with(new_message_id).clone()
    }

    fn reset_message(&self) {
        *self.message_id.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn record(&self, record: Record) {
        if self.records.send(record).is_err() {
            warn!(session_id = %self.session_id, "timeline writer closed, dropping record");
        }
    }
}

impl EventSink for SessionEmitter {
    fn emit(&self, event: AgentEvent) {
        let timestamp = now_millis();
        match event {
            AgentEvent::Text(delta) => {
                let id = self.assistant_message_id();
                self.rooms.publish(
                    self.session_id,
                    &ServerEvent::LlmMessage {
                        id: id.clone(),
                        role: "assistant".into(),
                        content: delta.clone(),
                        timestamp,
                    },
                );
                self.record(Record::Text { id, delta, timestamp });
            }
            AgentEvent::ToolCall { id, name, args, reason } => {
                self.reset_message();
                self.record(Record::Timeline {
                    kind: TimelineKind::ToolCall,
                    item_id: id.clone(),
                    payload: json!({"name": name, "args": args.to_string(), "reason": reason}),
                    timestamp,
                });
                self.rooms.publish(
                    self.session_id,
                    &ServerEvent::ToolCall {
                        id,
                        name,
                        args,
                        reason,
                        timestamp,
                    },
                );
            }
            AgentEvent::ToolResult { id, name, result, is_error } => {
                self.record(Record::Timeline {
                    kind: TimelineKind::ToolResult,
                    item_id: id.clone(),
                    payload: json!({"toolName": name, "result": result, "isError": is_error}),
                    timestamp,
                });
                self.rooms.publish(
                    self.session_id,
                    &ServerEvent::ToolResult {
                        id,
                        tool_name: name,
                        result,
                        timestamp,
                        is_error,
                    },
                );
            }
            AgentEvent::FileWritten(file) => {
                self.record(Record::File {
                    path: file.path,
                    content: file.content,
                });
            }
            AgentEvent::Stage { capability, status } => {
                self.reset_message();
                self.record(Record::Timeline {
                    kind: TimelineKind::Stage,
                    item_id: format!("stage_{}", Uuid::new_v4().simple()),
                    payload: json!({"capability": capability, "status": status.as_str()}),
                    timestamp,
                });
                self.rooms.publish(
                    self.session_id,
                    &ServerEvent::Stage {
                        session_id: self.session_id,
                        capability: capability.to_string(),
                        status: status.as_str().to_string(),
                    },
                );
            }
        }
    }
}

fn new_message_id() -> String {
    format!("msg_{}", Uuid::new_v4().simple())
}

async fn write_records(session_id: Uuid, db: DbHandle, mut rx: mpsc::UnboundedReceiver<Record>) {
    let mut pending: Option<(String, String, i64)> = None;
    while let Some(record) = rx.recv().await {
        match record {
            Record::Text { id, delta, timestamp } => match pending.as_mut() {
                Some((open_id, content, _)) if *open_id == id => content.push_str(&delta),
                _ => {
                    flush_message(session_id, &db, pending.take()).await;
                    pending = Some((id, delta, timestamp));
                }
            },
            other => {
                flush_message(session_id, &db, pending.take()).await;
                store(session_id, &db, other).await;
            }
        }
    }
    flush_message(session_id, &db, pending.take()).await;
}

async fn flush_message(session_id: Uuid, db: &DbHandle, pending: Option<(String, String, i64)>) {
    let Some((id, content, timestamp)) = pending else {
        return;
    };
    store(
        session_id,
        db,
        Record::Timeline {
            kind: TimelineKind::Message,
            item_id: id,
            payload: json!({"role": "assistant", "content": content}),
            timestamp,
        },
    )
    .await;
}

async fn store(session_id: Uuid, db: &DbHandle, record: Record) {
    let result = match record {
        Record::Timeline { kind, item_id, payload, timestamp } => db
            .call(move |db| {
                db.append_timeline(session_id, kind, &item_id, &payload, timestamp)
                    .map(|_| ())
            })
            .await,
        Record::File { path, content } => db
            .call(move |db| db.upsert_file(session_id, &path, &content))
            .await,
        Record::Text { .. } => Ok(()),
    };
    if let Err(e) = result {
        warn!(session_id = %session_id, error = %format!("{:#}", e), "failed to persist session event");
    }
}

#[cfg(test)]
mod tests {
    use appforge_common::{CapabilityConfig, Session};

    use super::*;
    use crate::llm::{StageStatus, WrittenFile};
    use crate::store::SessionDb;

    async fn setup() -> (DbHandle, Arc<Rooms>, Uuid) {
        let db = DbHandle::new(SessionDb::new_in_memory().unwrap());
        let session = Session::new(Uuid::new_v4(), "Create a simple todo app", CapabilityConfig::default(), "m");
        let id = session.id;
        db.call(move |db| db.create_session(&session)).await.unwrap();
        (db, Arc::new(Rooms::new()), id)
    }

    fn parse(frame: &str) -> Value {
        serde_json::from_str(frame).unwrap()
    }

    #[tokio::test]
    async fn test_chunks_share_id_until_reset() {
        let (db, rooms, id) = setup().await;
        let mut rx = rooms.subscribe(id);
        let (emitter, writer) = SessionEmitter::spawn(id, rooms.clone(), db.clone());

        emitter.emit(AgentEvent::Text("Hello ".into()));
        emitter.emit(AgentEvent::Text("world".into()));
        emitter.emit(AgentEvent::Stage {
            capability: "codeGeneration",
            status: StageStatus::Completed,
        });
        emitter.emit(AgentEvent::Text("Next".into()));

        let first = parse(&rx.recv().await.unwrap());
        let second = parse(&rx.recv().await.unwrap());
        let stage = parse(&rx.recv().await.unwrap());
        let third = parse(&rx.recv().await.unwrap());
        assert_eq!(first["type"], "llm_message");
        assert_eq!(first["data"]["id"], second["data"]["id"]);
        assert_eq!(stage["type"], "stage");
        assert_eq!(stage["data"]["status"], "completed");
        assert_ne!(first["data"]["id"], third["data"]["id"]);

        drop(emitter);
        writer.await.unwrap();
        let timeline = db.call(move |db| db.get_timeline(id)).await.unwrap();
        let kinds: Vec<TimelineKind> = timeline.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![TimelineKind::Message, TimelineKind::Stage, TimelineKind::Message]
        );
        assert_eq!(timeline[0].payload["content"], "Hello world");
    }

    #[tokio::test]
    async fn test_tool_events_are_persisted_with_call_id() {
        let (db, rooms, id) = setup().await;
        let (emitter, writer) = SessionEmitter::spawn(id, rooms, db.clone());

        emitter.emit(AgentEvent::ToolCall {
            id: "toolu_9".into(),
            name: "write_file".into(),
            args: json!({"path": "a.ts", "content": "x"}),
            reason: "Creating: a.ts".into(),
        });
        emitter.emit(AgentEvent::ToolResult {
            id: "toolu_9".into(),
            name: "write_file".into(),
            result: "Wrote a.ts".into(),
            is_error: false,
        });
        emitter.emit(AgentEvent::FileWritten(WrittenFile {
            path: "a.ts".into(),
            content: "x".into(),
        }));
        drop(emitter);
        writer.await.unwrap();

        let timeline = db.call(move |db| db.get_timeline(id)).await.unwrap();
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[0].item_id, "toolu_9");
        let args: Value = serde_json::from_str(timeline[0].payload["args"].as_str().unwrap()).unwrap();
        assert_eq!(args, json!({"path": "a.ts", "content": "x"}));
        assert_eq!(timeline[1].payload["toolName"], "write_file");
        let files = db.call(move |db| db.list_files(id)).await.unwrap();
        assert_eq!(files[0].path, "a.ts");
    }

    #[tokio::test]
    async fn test_user_message_closes_open_assistant_message() {
        let (db, rooms, id) = setup().await;
        let (emitter, writer) = SessionEmitter::spawn(id, rooms, db.clone());
        emitter.user_message("Create a simple todo app");
        emitter.emit(AgentEvent::Text("On it".into()));
        drop(emitter);
        writer.await.unwrap();

        let timeline = db.call(move |db| db.get_timeline(id)).await.unwrap();
        assert_eq!(timeline[0].payload["role"], "user");
        assert_eq!(timeline[1].payload["role"], "assistant");
        assert_ne!(timeline[0].item_id, timeline[1].item_id);
    }
}
