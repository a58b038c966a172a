use std::sync::Arc;
use std::time::Duration;

use appforge_common::{Session, SessionStatus};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use tracing::{error, warn};
use uuid::Uuid;

use crate::session::SessionManager;
use crate::store::{ReplayEntry, SessionDetail, replay_entries};
use crate::util::sanitize_client_message;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub manager: Arc<SessionManager>,
    /// Per-connection `save_file` allowance.
    pub save_file_burst: u32,
    pub save_file_refill: Duration,
}

pub type SharedState = Arc<AppState>;

// ── Response payload types ────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayData {
    pub session: Session,
    pub timeline: Vec<ReplayEntry>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        error!(error = %format!("{:#}", e), "request failed");
        ApiError::Internal(sanitize_client_message(&e.to_string()))
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{id}", get(get_session).delete(delete_session))
        .route("/api/sessions/{id}/replay-data", get(get_replay_data))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_sessions(State(state): State<SharedState>) -> Result<Json<Vec<Session>>, ApiError> {
    let sessions = state.manager.db().call(|db| db.list_sessions()).await?;
    Ok(Json(sessions))
}

async fn get_session(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionDetail>, ApiError> {
    let detail = state.manager.db().call(move |db| db.get_session_detail(id)).await?;
    detail
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Session {} not found", id)))
}

async fn get_replay_data(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ReplayData>, ApiError> {
    let detail = state
        .manager
        .db()
        .call(move |db| db.get_session_detail(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Session {} not found", id)))?;
    if detail.session.status == SessionStatus::Generating {
        return Err(ApiError::Conflict(
            "Session is still generating; replay is available once it finishes".into(),
        ));
    }
    Ok(Json(ReplayData {
        timeline: replay_entries(&detail.timeline),
        session: detail.session,
    }))
}

async fn delete_session(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if state.manager.is_active(id) {
        return Err(ApiError::Conflict("Stop the generation before deleting the session".into()));
    }
    let deleted = state.manager.db().call(move |db| db.delete_session(id)).await?;
    if !deleted {
        return Err(ApiError::NotFound(format!("Session {} not found", id)));
    }
    if let Err(e) = state.manager.discard_sandbox(id).await {
        warn!(session_id = %id, error = %e, "failed to clean up session sandbox");
    }
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedModel;
    use crate::session::ManagerSettings;
    use crate::store::{DbHandle, SessionDb};
    use appforge_common::{CapabilityConfig, TimelineKind};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    fn test_state(dir: &std::path::Path) -> SharedState {
        let settings = ManagerSettings {
            max_sessions: 2,
            generation_timeout: Duration::from_secs(30),
            stuck_threshold: Duration::from_secs(60),
            stuck_sweep_interval: Duration::from_secs(60),
            sandbox_root: dir.join("sandboxes"),
            templates_dir: dir.join("templates"),
            default_model: "claude-sonnet-4-5".into(),
        };
        let db = DbHandle::new(SessionDb::new_in_memory().unwrap());
        Arc::new(AppState {
            manager: Arc::new(SessionManager::new(db, Arc::new(ScriptedModel::new(vec![])), settings)),
            save_file_burst: 10,
            save_file_refill: Duration::from_secs(1),
        })
    }

    fn test_app(state: &SharedState) -> Router {
        api_router().with_state(state.clone())
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap()
    }

    fn insert_session(state: &SharedState, status: SessionStatus) -> Uuid {
        let mut session = Session::new(Uuid::new_v4(), "Create a simple todo app", CapabilityConfig::default(), "m");
        session.status = status;
        let id = session.id;
        let db = state.manager.db().lock_sync().unwrap();
        db.create_session(&session).unwrap();
        db.append_timeline(
            id,
            TimelineKind::ToolCall,
            "toolu_1",
            &json!({"name": "write_file", "args": "{\"path\":\"a.ts\"}", "reason": "Creating: a.ts"}),
            1,
        )
        .unwrap();
        db.upsert_file(id, "a.ts", "export {}").unwrap();
        id
    }

    #[tokio::test]
    async fn test_health_check() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&test_state(dir.path()));
        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_list_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let response = test_app(&state).oneshot(get("/api/sessions")).await.unwrap();
        let sessions: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert!(sessions.is_empty());

        insert_session(&state, SessionStatus::Completed);
        let response = test_app(&state).oneshot(get("/api/sessions")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let sessions: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0]["status"], "completed");
    }

    #[tokio::test]
    async fn test_get_session_detail() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let id = insert_session(&state, SessionStatus::Completed);

        let response = test_app(&state)
            .oneshot(get(&format!("/api/sessions/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let detail: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(detail["session"]["id"], id.to_string());
        assert_eq!(detail["timeline"].as_array().unwrap().len(), 1);
        assert_eq!(detail["files"][0]["path"], "a.ts");
    }

    #[tokio::test]
    async fn test_get_missing_session_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let response = test_app(&state)
            .oneshot(get(&format!("/api/sessions/{}", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_replay_data_parses_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let id = insert_session(&state, SessionStatus::Completed);

        let response = test_app(&state)
            .oneshot(get(&format!("/api/sessions/{}/replay-data", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let data: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(data["timeline"][0]["type"], "tool_call");
        assert_eq!(data["timeline"][0]["id"], "toolu_1");
        assert_eq!(data["timeline"][0]["parameters"]["path"], "a.ts");
    }

    #[tokio::test]
    async fn test_replay_rejects_generating_session() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let id = insert_session(&state, SessionStatus::Generating);
        let response = test_app(&state)
            .oneshot(get(&format!("/api/sessions/{}/replay-data", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_delete_session_cascades() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let id = insert_session(&state, SessionStatus::Failed);

        let request = Request::builder()
            .method("DELETE")
            .uri(format!("/api/sessions/{}", id))
            .body(Body::empty())
            .unwrap();
        let response = test_app(&state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let db = state.manager.db().lock_sync().unwrap();
        assert!(db.get_session(id).unwrap().is_none());
        assert!(db.get_timeline(id).unwrap().is_empty());
        assert!(db.list_files(id).unwrap().is_empty());
        drop(db);

        let request = Request::builder()
            .method("DELETE")
            .uri(format!("/api/sessions/{}", id))
            .body(Body::empty())
            .unwrap();
        let response = test_app(&state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
