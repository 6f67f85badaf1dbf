//! HTTP server implementation using Axum.

use crate::error::LabError;
use crate::events::{EventKind, LabEvent};
use crate::exercise::{CatalogStatus, Exercise, ExerciseProgress, ProgressSummary};
use crate::sandbox::AuditEntry;
use crate::session::{
    snapshot_key, Panel, SessionController, SessionInfo, SessionOptions, SessionSnapshot,
    SharedSession,
};
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

type ApiError = (StatusCode, String);
type ApiResult<T> = Result<Json<T>, ApiError>;

// Request/Response types
#[derive(Deserialize)]
struct CreateSessionRequest {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default = "default_student")]
    student_id: String,
    #[serde(default)]
    course_id: String,
    #[serde(default)]
    course_title: String,
    #[serde(default = "default_language")]
    language: String,
    #[serde(default)]
    sandboxed: Option<bool>,
    /// Restore the stored snapshot for `session_id` if one exists.
    #[serde(default)]
    restore: bool,
}

fn default_student() -> String { "student".to_string() }
fn default_language() -> String { "python".to_string() }

#[derive(Serialize)]
struct CreateSessionResponse {
    session_id: String,
    restored: bool,
}

#[derive(Deserialize)]
struct CommandRequest {
    command: String,
}

#[derive(Serialize)]
struct CommandResponse {
    output: String,
    clear_screen: bool,
    cwd: String,
}

#[derive(Serialize)]
struct RecallResponse {
    line: String,
}

#[derive(Deserialize, Default, Clone, Copy)]
#[serde(rename_all = "lowercase")]
enum PanelAction {
    #[default]
    Toggle,
    Show,
    Hide,
}

#[derive(Deserialize, Default)]
struct PanelRequest {
    #[serde(default)]
    action: PanelAction,
}

#[derive(Serialize)]
struct PanelResponse {
    panel: Panel,
    visible: bool,
}

#[derive(Deserialize)]
struct FileQuery {
    path: String,
}

#[derive(Deserialize, Serialize)]
struct FileBody {
    path: String,
    content: String,
}

#[derive(Serialize)]
struct ExercisesResponse {
    status: CatalogStatus,
    current: Option<String>,
    exercises: Vec<Exercise>,
}

#[derive(Deserialize)]
struct CodeRequest {
    code: String,
}

#[derive(Serialize)]
struct SubmitResponse {
    completed: bool,
    summary: ProgressSummary,
}

#[derive(Serialize)]
struct ProgressResponse {
    summary: ProgressSummary,
    exercises: BTreeMap<String, ExerciseProgress>,
}

#[derive(Serialize)]
struct SaveResponse {
    key: String,
    snapshot: SessionSnapshot,
}

#[derive(Deserialize, Default)]
struct LoadRequest {
    #[serde(default)]
    session_id: Option<String>,
}

fn lab_error(err: LabError) -> ApiError {
    let status = match &err {
        LabError::NotFound(_) => StatusCode::NOT_FOUND,
        LabError::Denied(_) => StatusCode::FORBIDDEN,
        LabError::Malformed(_) => StatusCode::BAD_REQUEST,
        LabError::SnapshotCorrupt(_) => StatusCode::UNPROCESSABLE_ENTITY,
        LabError::CollaboratorUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        LabError::InvalidState(_) => StatusCode::CONFLICT,
        LabError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

async fn lookup(state: &AppState, id: &str) -> Result<SharedSession, ApiError> {
    state
        .get(id)
        .await
        .ok_or((StatusCode::NOT_FOUND, "Session not found".to_string()))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Session management
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        // Terminal
        .route("/sessions/:id/command", post(run_command))
        .route("/sessions/:id/history/:direction", post(recall_history))
        .route("/sessions/:id/audit", get(audit_log))
        // Workspace
        .route("/sessions/:id/panels/:panel", post(set_panel))
        .route("/sessions/:id/files", get(read_file).put(write_file))
        // Exercises
        .route("/sessions/:id/exercises", get(list_exercises))
        .route("/sessions/:id/exercises/:eid/select", post(select_exercise))
        .route("/sessions/:id/exercises/:eid/run", post(run_code))
        .route("/sessions/:id/exercises/:eid/submit", post(submit_code))
        .route("/sessions/:id/progress", get(progress))
        // Persistence
        .route("/sessions/:id/save", post(save_session))
        .route("/sessions/:id/load", post(load_session))
        .route("/sessions/:id/events", get(event_stream))
        // Health check
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP server on the given port with the provided state.
pub async fn run_server(port: u16, state: AppState) -> std::io::Result<()> {
    // Spawn cleanup task
    let sweep_state = state.clone();
    tokio::spawn(async move {
        let mut interval = interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            cleanup_expired_sessions(&sweep_state).await;
            sweep_state.store.flush().await;
        }
    });

    let app = router(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await
}

async fn shutdown_signal(state: AppState) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        return;
    }
    info!("Shutting down, saving sessions");
    save_all_sessions(&state).await;
}

async fn health() -> &'static str {
    "OK"
}

async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<CreateSessionResponse> {
    if let Some(id) = &req.session_id {
        if state.sessions.read().await.contains_key(id) {
            return Err((StatusCode::CONFLICT, format!("Session {} already exists", id)));
        }
    }

    let options = SessionOptions {
        session_id: req.session_id,
        student_id: req.student_id,
        course_id: req.course_id,
        course_title: req.course_title,
        language: req.language,
        sandboxed: req.sandboxed.unwrap_or(state.config.sandboxed),
    };
    let mut session = state.new_session(options).map_err(lab_error)?;

    let restored = if req.restore {
        match session.load_state(None).await {
            Ok(()) => true,
            Err(LabError::NotFound(_)) => false,
            Err(e) => return Err(lab_error(e)),
        }
    } else {
        false
    };

    let session_id = session.session_id().to_string();
    let shared = session.into_shared();
    // Checked again under the write lock; a concurrent create may have won.
    match state.sessions.write().await.entry(session_id.clone()) {
        Entry::Occupied(_) => {
            return Err((
                StatusCode::CONFLICT,
                format!("Session {} already exists", session_id),
            ))
        }
        Entry::Vacant(slot) => {
            slot.insert(shared.clone());
        }
    }
    SessionController::start_autosave(&shared, state.config.autosave_interval).await;

    // The catalog arrives in the background; commands work meanwhile.
    tokio::spawn(async move {
        if let Err(e) = SessionController::load_exercises(&shared).await {
            debug!(error = %e, "Exercise load abandoned");
        }
    });

    info!(session_id = %session_id, restored, "Created session");
    Ok(Json(CreateSessionResponse {
        session_id,
        restored,
    }))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    let sessions: Vec<SharedSession> = state.sessions.read().await.values().cloned().collect();
    let mut list = Vec::with_capacity(sessions.len());
    for session in sessions {
        list.push(session.lock().await.info());
    }
    Json(list)
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SessionInfo> {
    let session = lookup(&state, &id).await?;
    let info = session.lock().await.info();
    Ok(Json(info))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let session = state
        .sessions
        .write()
        .await
        .remove(&id)
        .ok_or((StatusCode::NOT_FOUND, "Session not found".to_string()))?;
    session.lock().await.destroy().await.map_err(lab_error)?;
    info!(session_id = %id, "Deleted session");
    Ok(StatusCode::NO_CONTENT)
}

async fn run_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CommandRequest>,
) -> ApiResult<CommandResponse> {
    let session = lookup(&state, &id).await?;
    let mut session = session.lock().await;
    let output = session.execute_command(&req.command).map_err(lab_error)?;
    Ok(Json(CommandResponse {
        output: output.text,
        clear_screen: output.clear_screen,
        cwd: session.terminal().current_directory().to_string(),
    }))
}

async fn recall_history(
    State(state): State<AppState>,
    Path((id, direction)): Path<(String, String)>,
) -> ApiResult<RecallResponse> {
    let session = lookup(&state, &id).await?;
    let mut session = session.lock().await;
    let line = match direction.as_str() {
        "previous" => session.recall_previous(),
        "next" => session.recall_next(),
        other => {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("unknown history direction: {}", other),
            ))
        }
    }
    .map_err(lab_error)?;
    Ok(Json(RecallResponse { line }))
}

async fn audit_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<AuditEntry>> {
    let session = lookup(&state, &id).await?;
    let session = session.lock().await;
    let entries = session.policy().audit_log().entries().cloned().collect();
    Ok(Json(entries))
}

async fn set_panel(
    State(state): State<AppState>,
    Path((id, panel)): Path<(String, String)>,
    body: Option<Json<PanelRequest>>,
) -> ApiResult<PanelResponse> {
    let panel: Panel = panel.parse().map_err(lab_error)?;
    let action = body.map(|Json(b)| b.action).unwrap_or_default();
    let session = lookup(&state, &id).await?;
    let mut session = session.lock().await;
    let visible = match action {
        PanelAction::Toggle => session.toggle_panel(panel),
        PanelAction::Show => session.show_panel(panel).map(|()| true),
        PanelAction::Hide => session.hide_panel(panel).map(|()| false),
    }
    .map_err(lab_error)?;
    Ok(Json(PanelResponse { panel, visible }))
}

async fn read_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<FileQuery>,
) -> ApiResult<FileBody> {
    let session = lookup(&state, &id).await?;
    let content = session
        .lock()
        .await
        .read_file(&query.path)
        .map_err(lab_error)?;
    Ok(Json(FileBody {
        path: query.path,
        content,
    }))
}

async fn write_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<FileBody>,
) -> Result<StatusCode, ApiError> {
    let session = lookup(&state, &id).await?;
    session
        .lock()
        .await
        .write_file(&body.path, &body.content)
        .map_err(lab_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_exercises(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ExercisesResponse> {
    let session = lookup(&state, &id).await?;
    let session = session.lock().await;
    let exercises = session.exercises();
    Ok(Json(ExercisesResponse {
        status: exercises.status().clone(),
        current: exercises.current_exercise().map(str::to_string),
        exercises: exercises.catalog().to_vec(),
    }))
}

async fn select_exercise(
    State(state): State<AppState>,
    Path((id, eid)): Path<(String, String)>,
) -> ApiResult<Exercise> {
    let session = lookup(&state, &id).await?;
    let exercise = session
        .lock()
        .await
        .select_exercise(&eid)
        .map_err(lab_error)?;
    Ok(Json(exercise))
}

async fn run_code(
    State(state): State<AppState>,
    Path((id, eid)): Path<(String, String)>,
    Json(req): Json<CodeRequest>,
) -> ApiResult<ExerciseProgress> {
    let session = lookup(&state, &id).await?;
    let progress = session
        .lock()
        .await
        .run_code(&eid, &req.code)
        .map_err(lab_error)?;
    Ok(Json(progress))
}

async fn submit_code(
    State(state): State<AppState>,
    Path((id, eid)): Path<(String, String)>,
    Json(req): Json<CodeRequest>,
) -> ApiResult<SubmitResponse> {
    let session = lookup(&state, &id).await?;
    let mut session = session.lock().await;
    let completed = session.submit_code(&eid, &req.code).map_err(lab_error)?;
    Ok(Json(SubmitResponse {
        completed,
        summary: session.progress_summary(),
    }))
}

async fn progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ProgressResponse> {
    let session = lookup(&state, &id).await?;
    let session = session.lock().await;
    Ok(Json(ProgressResponse {
        summary: session.progress_summary(),
        exercises: session.exercises().all_progress().clone(),
    }))
}

async fn save_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SaveResponse> {
    let session = lookup(&state, &id).await?;
    let snapshot = SessionController::save_shared(&session)
        .await
        .map_err(lab_error)?;
    Ok(Json(SaveResponse {
        key: snapshot_key(&id),
        snapshot,
    }))
}

async fn load_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<LoadRequest>>,
) -> ApiResult<SessionInfo> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let session = lookup(&state, &id).await?;
    SessionController::load_shared(&session, req.session_id.as_deref())
        .await
        .map_err(lab_error)?;
    let info = session.lock().await.info();
    Ok(Json(info))
}

async fn event_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let session = lookup(&state, &id).await?;
    Ok(ws.on_upgrade(move |socket| forward_events(socket, session)))
}

/// Forward bus events to the socket until either side goes away. Destroying
/// the session clears the bus, which drops the sender and ends the stream.
async fn forward_events(socket: WebSocket, session: SharedSession) {
    let (tx, mut rx) = mpsc::unbounded_channel::<LabEvent>();
    let subscription = session.lock().await.on_any(move |event| {
        let _ = tx.send(event.clone());
    });
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode event");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    // Subscriptions to every kind match any kind on removal.
    session.lock().await.off(EventKind::TerminalCommand, subscription);
}

async fn save_all_sessions(state: &AppState) {
    let sessions: Vec<(String, SharedSession)> = state
        .sessions
        .read()
        .await
        .iter()
        .map(|(id, s)| (id.clone(), s.clone()))
        .collect();
    for (id, session) in sessions {
        if let Err(e) = SessionController::save_shared(&session).await {
            warn!(session_id = %id, error = %e, "Save on shutdown failed");
        }
    }
}

async fn cleanup_expired_sessions(state: &AppState) {
    let ttl = state.config.session_ttl;
    let sessions: Vec<(String, SharedSession)> = state
        .sessions
        .read()
        .await
        .iter()
        .map(|(id, s)| (id.clone(), s.clone()))
        .collect();

    for (id, session) in sessions {
        if session.lock().await.idle_for() <= ttl {
            continue;
        }
        if state.sessions.write().await.remove(&id).is_none() {
            continue;
        }
        info!("Cleaning up expired session: {}", id);
        if let Err(e) = session.lock().await.destroy().await {
            warn!(session_id = %id, error = %e, "Failed to destroy expired session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LabConfig;

    fn create_request(id: &str) -> CreateSessionRequest {
        CreateSessionRequest {
            session_id: Some(id.to_string()),
            student_id: default_student(),
            course_id: String::new(),
            course_title: String::new(),
            language: default_language(),
            sandboxed: None,
            restore: false,
        }
    }

    #[tokio::test]
    async fn concurrent_creates_with_one_id_admit_one_session() {
        let state = AppState::new(LabConfig::default()).unwrap();
        let (a, b) = tokio::join!(
            create_session(State(state.clone()), Json(create_request("lab-dup"))),
            create_session(State(state.clone()), Json(create_request("lab-dup"))),
        );

        let conflicts = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Err((code, _)) if *code == StatusCode::CONFLICT))
            .count();
        assert_eq!(conflicts, 1);
        assert!(a.is_ok() || b.is_ok());
        assert_eq!(state.sessions.read().await.len(), 1);
    }

    #[tokio::test]
    async fn save_and_load_routes_round_trip_through_the_store() {
        let state = AppState::new(LabConfig::default()).unwrap();
        assert!(create_session(State(state.clone()), Json(create_request("lab-http")))
            .await
            .is_ok());
        let session = state.get("lab-http").await.unwrap();

        let Json(saved) = save_session(State(state.clone()), Path("lab-http".into()))
            .await
            .unwrap();
        assert_eq!(saved.key, "lab_state_lab-http");

        session.lock().await.execute_command("mkdir scratch").unwrap();
        load_session(State(state.clone()), Path("lab-http".into()), None)
            .await
            .unwrap();
        assert!(!session.lock().await.vfs().exists("/home/student/scratch"));
    }
}
