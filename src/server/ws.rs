use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::api::SharedState;
use crate::errors::SessionError;
use crate::session::{BurstLimiter, ClientEvent, GenerationRequest, ServerEvent, StopOutcome};
use crate::util::sanitize_client_message;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

const NO_ACTIVE_SESSION: &str = "No active session";

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let (sender, receiver) = socket.split();
    let connection = Connection::new(state);
    run_socket_loop(sender, receiver, connection).await;
}

/// Per-connection protocol state: the session this connection follows and
/// its `save_file` allowance.
pub struct Connection {
    state: SharedState,
    session: Option<Uuid>,
    room: Option<broadcast::Receiver<String>>,
    save_limiter: BurstLimiter,
}

impl Connection {
    pub fn new(state: SharedState) -> Self {
        let save_limiter = BurstLimiter::new(state.save_file_burst, state.save_file_refill);
        Self {
            state,
            session: None,
            room: None,
            save_limiter,
        }
    }

    pub fn session(&self) -> Option<Uuid> {
        self.session
    }

    fn follow(&mut self, session_id: Uuid) {
        self.room = Some(self.state.manager.rooms().subscribe(session_id));
        self.session = Some(session_id);
    }

    fn unfollow(&mut self) {
        self.room = None;
        if let Some(id) = self.session.take() {
            self.state.manager.rooms().close_if_idle(id);
        }
    }

    /// Next event from the followed session's room. Pending while the
    /// connection follows no session.
    async fn next_room_event(&mut self) -> Result<String, broadcast::error::RecvError> {
        match self.room.as_mut() {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Handle one text frame. Returns the replies meant for this connection
    /// only; session-wide events arrive through the room.
    pub async fn handle_text(&mut self, text: &str) -> Vec<ServerEvent> {
        match serde_json::from_str::<ClientEvent>(text) {
            Ok(event) => self.handle_event(event).await,
            Err(e) => {
                debug!(error = %e, "unparseable client message");
                vec![error_event("Invalid message")]
            }
        }
    }

    pub async fn handle_event(&mut self, event: ClientEvent) -> Vec<ServerEvent> {
        let manager = self.state.manager.clone();
        match event {
            ClientEvent::StartGeneration { prompt, config, model } => {
                let session_id = Uuid::new_v4();
                // Follow the room first so `session_started` is not missed.
                self.unfollow();
                self.follow(session_id);
                let request = GenerationRequest {
                    session_id,
                    prompt,
                    config,
                    model,
                };
                match manager.start_generation(request).await {
                    Ok(_) => vec![],
                    Err(e) => {
                        self.unfollow();
                        vec![session_error(&e)]
                    }
                }
            }
            ClientEvent::StopGeneration => {
                let outcome = match self.session {
                    Some(id) => manager.stop_generation(id),
                    None => StopOutcome::NotActive,
                };
                match outcome {
                    StopOutcome::Stopping => vec![],
                    StopOutcome::NotActive => vec![ServerEvent::Info {
                        message: NO_ACTIVE_SESSION.into(),
                    }],
                }
            }
            ClientEvent::SubscribeToSession { session_id } => {
                if self.session != Some(session_id) {
                    self.unfollow();
                    self.follow(session_id);
                }
                match manager.app_status(session_id).await {
                    Some(status) => vec![ServerEvent::AppStatus(status)],
                    None => vec![],
                }
            }
            ClientEvent::SaveFile { session_id, path, content } => {
                if !self.save_limiter.try_acquire() {
                    return vec![error_event("Too many file saves, slow down")];
                }
                match manager.save_file(session_id, &path, &content).await {
                    Ok(()) if self.session == Some(session_id) => vec![],
                    Ok(()) => vec![ServerEvent::FileSaved { session_id, path }],
                    Err(e) => vec![session_error(&e)],
                }
            }
            ClientEvent::StartApp { session_id } => app_reply(manager.start_app(session_id).await),
            ClientEvent::StopApp { session_id } => app_reply(manager.stop_app(session_id).await),
            ClientEvent::RestartApp { session_id } => app_reply(manager.restart_app(session_id).await),
        }
    }
}

fn error_event(message: &str) -> ServerEvent {
    ServerEvent::Error {
        message: sanitize_client_message(message),
    }
}

fn session_error(e: &SessionError) -> ServerEvent {
    warn!(error = %e, "client request rejected");
    error_event(&e.to_string())
}

fn app_reply(result: Result<appforge_common::AppStatus, SessionError>) -> Vec<ServerEvent> {
    match result {
        Ok(status) => vec![ServerEvent::AppStatus(status)],
        Err(e) => vec![session_error(&e)],
    }
}

async fn send_event(sender: &mut SplitSink<WebSocket, Message>, event: &ServerEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "failed to serialize server event");
            true
        }
    }
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Combines room forwarding, client message handling, and periodic
/// ping/pong health checking into a single select loop. If no Pong is
/// received within [`PONG_TIMEOUT`] after a Ping is sent, the connection
/// is considered dead and the loop exits. Generations keep running when
/// their connection goes away.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: futures_util::stream::SplitStream<WebSocket>,
    mut connection: Connection,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    'socket: loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    info!("websocket pong timeout, closing");
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Room forwarding ─────────────────────────────────────
            result = connection.next_room_event() => {
                match result {
                    Ok(msg) => {
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => connection.unfollow(),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "websocket client lagging behind room");
                        continue;
                    }
                }
            }

            // ── Client messages ─────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        for reply in connection.handle_text(text.as_str()).await {
                            if !send_event(&mut sender, &reply).await {
                                break 'socket;
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    connection.unfollow();
    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}
