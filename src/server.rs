//! HTTP chat server.
//!
//! Each session id owns one [`Session`]; its id doubles as the cache
//! namespace, so two sessions uploading `policy.txt` never share a cache
//! directory. Sessions live in memory for the lifetime of the process.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health` | Health check (returns version) |
//! | `GET`    | `/sessions/{id}` | Session state and loaded filename |
//! | `PUT`    | `/sessions/{id}/document/{filename}` | Upload raw file bytes and load them |
//! | `DELETE` | `/sessions/{id}/document` | Forget the document and transcript |
//! | `POST`   | `/sessions/{id}/messages` | Ask a question; answer streams as SSE |
//! | `GET`    | `/sessions/{id}/messages` | Transcript so far |
//!
//! # Streaming
//!
//! `POST /sessions/{id}/messages` with `{"message": "..."}` answers with
//! `text/event-stream`: one `token` event per fragment (`{"text": "..."}`),
//! then either `done` (`{"message": <full answer>}`) or `error`
//! (`{"code", "message"}`). A session answers one question at a time; a
//! second request waits for the first stream to finish. If the client
//! disconnects mid-answer, the partial answer is still recorded.
//!
//! `GET /sessions/{id}` never waits: while another request holds the
//! session it reports `loading` (an upload is being processed) or
//! `generating` (an answer is streaming).
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "no_document", "message": "no document loaded; upload a document first" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unsupported_file_type` (415),
//! `not_found` (404), `no_document` (409), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! chat front ends.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, put},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{mpsc, oneshot, Mutex};
use tower_http::cors::{Any, CorsLayer};

use crate::cache;
use crate::config::Config;
use crate::extract::ExtractError;
use crate::models::{TranscriptEntry, UploadedFile};
use crate::pipeline::{LoadStats, Pipeline};
use crate::progress::NoProgress;
use crate::session::{Session, SessionError, SessionState};

/// Largest accepted upload.
const MAX_UPLOAD_BYTES: usize = 200 * 1024 * 1024;

type SessionMap = HashMap<String, Arc<Mutex<Session>>>;
/// Ids of sessions whose lock is currently held by a document upload.
type LoadingSet = Arc<StdMutex<HashSet<String>>>;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
    sessions: Arc<Mutex<SessionMap>>,
    loading: LoadingSet,
}

impl AppState {
    async fn session(&self, id: &str) -> Result<Arc<Mutex<Session>>, AppError> {
        self.sessions
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| not_found(format!("no session with id: {}", id)))
    }

    async fn session_or_create(&self, id: &str) -> Arc<Mutex<Session>> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(id.to_string())
            .or_insert_with(|| {
                tracing::info!(session = id, "session created");
                Arc::new(Mutex::new(Session::new(id, id, self.pipeline.clone())))
            })
            .clone()
    }
}

/// Keeps a session id in the [`LoadingSet`] until dropped, so a cancelled
/// upload does not leave it marked.
struct LoadingMark {
    loading: LoadingSet,
    id: String,
}

impl LoadingMark {
    fn new(loading: &LoadingSet, id: &str) -> Self {
        lock_set(loading).insert(id.to_string());
        Self {
            loading: loading.clone(),
            id: id.to_string(),
        }
    }
}

impl Drop for LoadingMark {
    fn drop(&mut self) {
        lock_set(&self.loading).remove(&self.id);
    }
}

fn lock_set(loading: &LoadingSet) -> std::sync::MutexGuard<'_, HashSet<String>> {
    loading.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State to report for a session whose lock is held elsewhere.
fn busy_state(loading: &LoadingSet, id: &str) -> SessionState {
    if lock_set(loading).contains(id) {
        SessionState::Loading
    } else {
        SessionState::Generating
    }
}

/// Starts the HTTP server on `[server].bind`.
///
/// Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let pipeline = Arc::new(Pipeline::from_config(config.clone())?);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    println!("DocGPT server listening on http://{}", bind_addr);
    serve(listener, pipeline).await
}

/// Serve on an already-bound listener.
pub async fn serve(listener: tokio::net::TcpListener, pipeline: Arc<Pipeline>) -> anyhow::Result<()> {
    axum::serve(listener, router(pipeline)).await?;
    Ok(())
}

/// Build the application router.
pub fn router(pipeline: Arc<Pipeline>) -> Router {
    let state = AppState {
        pipeline,
        sessions: Arc::new(Mutex::new(HashMap::new())),
        loading: LoadingSet::default(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/sessions/{id}", get(handle_get_session))
        .route(
            "/sessions/{id}/document/{filename}",
            put(handle_put_document),
        )
        .route(
            "/sessions/{id}/document",
            delete(handle_delete_document),
        )
        .route(
            "/sessions/{id}/messages",
            get(handle_get_messages).post(handle_post_message),
        )
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

/// Machine-readable code plus human-readable message.
#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn app_error(status: StatusCode, code: &str, message: impl Into<String>) -> AppError {
    AppError {
        status,
        code: code.to_string(),
        message: message.into(),
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    app_error(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    app_error(StatusCode::NOT_FOUND, "not_found", message)
}

fn internal(message: impl Into<String>) -> AppError {
    app_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

/// Map a pipeline or session error to the most specific HTTP error.
fn classify_error(err: anyhow::Error) -> AppError {
    if let Some(e) = err.downcast_ref::<SessionError>() {
        return match e {
            SessionError::NoDocument => app_error(StatusCode::CONFLICT, "no_document", e.to_string()),
            SessionError::EmptyQuestion => bad_request(e.to_string()),
        };
    }
    if let Some(e) = err.downcast_ref::<ExtractError>() {
        return match e {
            ExtractError::UnsupportedFileType(_) => app_error(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "unsupported_file_type",
                e.to_string(),
            ),
            ExtractError::Pdf(_) | ExtractError::Docx(_) => bad_request(e.to_string()),
        };
    }

    let msg = format!("{:#}", err);
    if msg.starts_with("invalid filename") || msg.starts_with("invalid namespace") {
        bad_request(msg)
    } else {
        tracing::error!(error = %msg, "request failed");
        internal(msg)
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /sessions/{id} ============

#[derive(Serialize)]
struct SessionResponse {
    id: String,
    state: SessionState,
    filename: Option<String>,
}

/// Reports `loading` or `generating` while another request holds the session.
async fn handle_get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, AppError> {
    let session = state.session(&id).await?;
    let response = match session.try_lock() {
        Ok(guard) => SessionResponse {
            id: guard.id().to_string(),
            state: guard.state(),
            filename: guard.document().map(|d| d.stats.filename.clone()),
        },
        Err(_) => SessionResponse {
            state: busy_state(&state.loading, &id),
            id,
            filename: None,
        },
    };
    Ok(Json(response))
}

// ============ PUT /sessions/{id}/document/{filename} ============

async fn handle_put_document(
    State(state): State<AppState>,
    Path((id, filename)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<LoadStats>, AppError> {
    cache::validate_namespace(&id).map_err(|e| bad_request(e.to_string()))?;
    let session = state.session_or_create(&id).await;
    let mut guard = session.lock().await;
    let mark = LoadingMark::new(&state.loading, &id);

    let file = UploadedFile::new(filename, body.to_vec());
    let loaded = guard.load_document(&file, &NoProgress).await.map(|stats| stats.clone());
    // Unlock before unmarking so a concurrent GET never sees a held lock
    // without the mark.
    drop(guard);
    drop(mark);
    Ok(Json(loaded.map_err(classify_error)?))
}

// ============ DELETE /sessions/{id}/document ============

async fn handle_delete_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let session = state.session(&id).await?;
    session.lock().await.clear_document();
    Ok(StatusCode::NO_CONTENT)
}

// ============ GET /sessions/{id}/messages ============

#[derive(Serialize)]
struct MessagesResponse {
    messages: Vec<TranscriptEntry>,
}

async fn handle_get_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MessagesResponse>, AppError> {
    let session = state.session(&id).await?;
    let messages = session.lock().await.transcript().to_vec();
    Ok(Json(MessagesResponse { messages }))
}

// ============ POST /sessions/{id}/messages ============

#[derive(Deserialize)]
struct MessageRequest {
    message: String,
}

/// Answer a question as a server-sent event stream.
///
/// Errors raised before the first fragment (no document, empty question,
/// retrieval failure) are returned as a normal JSON error response.
async fn handle_post_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<MessageRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let session = state.session(&id).await?;
    let (ready_tx, ready_rx) = oneshot::channel::<Result<(), AppError>>();
    let (tx, rx) = mpsc::channel::<Event>(32);

    tokio::spawn(async move {
        let mut guard = session.lock_owned().await;
        let mut answer = match guard.ask(&req.message).await {
            Ok(answer) => {
                let _ = ready_tx.send(Ok(()));
                answer
            }
            Err(e) => {
                let _ = ready_tx.send(Err(classify_error(e)));
                return;
            }
        };

        while let Some(item) = answer.next().await {
            let event = match item {
                Ok(token) => json_event("token", serde_json::json!({ "text": token })),
                Err(e) => {
                    let message = format!("{:#}", e);
                    let _ = tx
                        .send(json_event(
                            "error",
                            serde_json::json!({ "code": "internal", "message": message }),
                        ))
                        .await;
                    return;
                }
            };
            if tx.send(event).await.is_err() {
                tracing::debug!("client disconnected mid-answer");
                return;
            }
        }
        let full = answer.text_so_far().to_string();
        let _ = tx
            .send(json_event("done", serde_json::json!({ "message": full })))
            .await;
    });

    ready_rx
        .await
        .map_err(|_| internal("answer task ended unexpectedly"))??;

    let events = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok::<_, Infallible>(event), rx))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn json_event(name: &str, data: serde_json::Value) -> Event {
    Event::default().event(name).data(data.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_session_reports_loading_only_while_marked() {
        let loading = LoadingSet::default();
        assert_eq!(busy_state(&loading, "alice"), SessionState::Generating);

        let mark = LoadingMark::new(&loading, "alice");
        assert_eq!(busy_state(&loading, "alice"), SessionState::Loading);
        assert_eq!(busy_state(&loading, "bob"), SessionState::Generating);

        drop(mark);
        assert_eq!(busy_state(&loading, "alice"), SessionState::Generating);
    }

    #[test]
    fn session_errors_map_to_codes() {
        let e = classify_error(SessionError::NoDocument.into());
        assert_eq!(e.status, StatusCode::CONFLICT);
        assert_eq!(e.code, "no_document");

        let e = classify_error(SessionError::EmptyQuestion.into());
        assert_eq!(e.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn unsupported_file_maps_to_415() {
        let e = classify_error(ExtractError::UnsupportedFileType("png".to_string()).into());
        assert_eq!(e.status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(e.code, "unsupported_file_type");
    }

    #[test]
    fn invalid_filename_is_bad_request() {
        let e = classify_error(cache::sanitize_filename("..").unwrap_err());
        assert_eq!(e.code, "bad_request");
    }

    #[test]
    fn other_errors_are_internal() {
        let e = classify_error(anyhow::anyhow!("disk full"));
        assert_eq!(e.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(e.message, "disk full");
    }

    #[test]
    fn json_event_data_is_single_line() {
        let data = serde_json::json!({ "text": "line one\nline two" }).to_string();
        assert!(!data.contains('\n'));
    }
}
