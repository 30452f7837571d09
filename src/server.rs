//! HTTP API.
//!
//! A thin JSON layer over the orchestrator, the retrieval manager and the
//! history tables.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/chat` | One turn; files may be attached as base64 |
//! | `POST` | `/chat/stream` | One turn streamed as server-sent events |
//! | `POST` | `/upload` | Multipart file upload; decoded and indexed |
//! | `GET`  | `/history/{session_id}` | Stored turns of a session |
//! | `DELETE` | `/sessions/{session_id}` | Drop a session and its history |
//! | `GET`  | `/sessions` | Live sessions in the cache |
//! | `POST` | `/retrieval/search` | Local (or remote) similarity search |
//! | `GET`  | `/retrieval/stats` | Merged retrieval statistics |
//! | `GET`  | `/reminders` | Reminders grouped by date (`?completed=true` for done ones) |
//! | `POST` | `/reminders` | Create a reminder |
//! | `GET`  | `/reminders/all` | Every reminder in due order |
//! | `GET`  | `/reminders/upcoming` | Open reminders due in the next `?days=7` |
//! | `GET`  | `/reminders/search` | Title or description match for `?q=` |
//! | `GET` `PUT` `DELETE` | `/reminders/{id}` | Read, update or delete one reminder |
//! | `PUT`  | `/reminders/{id}/complete` | Mark a reminder done |
//! | `GET`  | `/health` | Version and capability flags |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404),
//! `payload_too_large` (413), `remote_unavailable` (503), `internal` (500).
//! Conversational failures are not errors: `/chat` always answers 200 with
//! a reply whose `status` says what happened.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, KeepAliveStream, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post, put},
    Json, Router,
};
use base64::Engine;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::OwnedMutexGuard;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use llm_relay_core::models::Role;

use crate::config::Config;
use crate::db;
use crate::error::StoreError;
use crate::extract::{decode_file, detect_kind, FileKind, MAX_FILE_BYTES};
use crate::health::{check_capabilities, Capabilities};
use crate::history::{self, NewUpload};
use crate::reminders::{self, NewReminder, Reminder, ReminderError, ReminderUpdate, RemindersByDate};
use crate::orchestrator::{Orchestrator, StreamingTurn, TurnReply, TurnRequest, UploadedFile};
use crate::retrieval::{Backend, RetrievalManager};
use crate::router::{CredentialSource, EnvCredentials};
use crate::sessions::{SessionCache, Shared};
use crate::tools::{ToolContext, ToolRegistry};

const DEFAULT_SESSION: &str = "default";

/// Request bodies may carry a base64 file, which is a third larger than
/// the file itself.
const BODY_LIMIT: usize = MAX_FILE_BYTES * 3 / 2;

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    sessions: Arc<SessionCache<Orchestrator>>,
    retrieval: Arc<RetrievalManager>,
    pool: SqlitePool,
    credentials: Arc<dyn CredentialSource>,
    capabilities: Arc<Capabilities>,
    tools: Arc<ToolRegistry>,
}

impl AppState {
    /// Open the database, run the capability check and build the retrieval
    /// manager.
    pub async fn new(config: &Config, credentials: Arc<dyn CredentialSource>) -> anyhow::Result<Self> {
        let pool = db::open(config).await?;
        let capabilities = check_capabilities(config, credentials.as_ref());
        for note in &capabilities.notes {
            warn!("{}", note);
        }
        let retrieval = Arc::new(RetrievalManager::from_config(config, credentials.as_ref()).await?);
        let tools = ToolRegistry::builtin(ToolContext {
            pool: Some(pool.clone()),
            retrieval: Some(retrieval.clone()),
        });

        Ok(Self {
            config: Arc::new(config.clone()),
            sessions: Arc::new(SessionCache::new(config.sessions.max_sessions)),
            retrieval,
            pool,
            credentials,
            capabilities: Arc::new(capabilities),
            tools: Arc::new(tools),
        })
    }

    /// The orchestrator for `session_id`, created on first use. `model`
    /// only applies when the session is created.
    fn session(&self, session_id: &str, model: Option<&str>) -> Shared<Orchestrator> {
        self.sessions.get_or_create(session_id, || {
            let orch = Orchestrator::new(
                session_id,
                &self.config,
                self.credentials.clone(),
                &self.capabilities,
                Some(self.retrieval.clone()),
            )
            .with_tools(self.tools.clone());
            match model {
                Some(m) if !m.trim().is_empty() => orch.with_model(m.trim()),
                _ => orch,
            }
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/chat", post(handle_chat))
        .route("/chat/stream", post(handle_chat_stream))
        .route("/upload", post(handle_upload))
        .route("/history/{session_id}", get(handle_history))
        .route("/sessions", get(handle_sessions))
        .route("/sessions/{session_id}", delete(handle_delete_session))
        .route("/retrieval/search", post(handle_search))
        .route("/retrieval/stats", get(handle_retrieval_stats))
        .route("/health", get(handle_health))
        .route("/reminders", get(handle_reminders).post(handle_create_reminder))
        .route("/reminders/all", get(handle_all_reminders))
        .route("/reminders/upcoming", get(handle_upcoming_reminders))
        .route("/reminders/search", get(handle_search_reminders))
        .route(
            "/reminders/{id}",
            get(handle_get_reminder)
                .put(handle_update_reminder)
                .delete(handle_delete_reminder),
        )
        .route("/reminders/{id}/complete", put(handle_complete_reminder))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(cors)
        .with_state(state)
}

/// Serve the API on `[server].bind` until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let state = AppState::new(config, Arc::new(EnvCredentials)).await?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "relay listening");
    println!("Relay listening on http://{}", config.server.bind);

    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn too_large(size: usize) -> AppError {
    AppError {
        status: StatusCode::PAYLOAD_TOO_LARGE,
        code: "payload_too_large",
        message: format!(
            "file is {} bytes; the maximum is {} bytes",
            size, MAX_FILE_BYTES
        ),
    }
}

fn internal(err: impl std::fmt::Display) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: err.to_string(),
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(_) => AppError {
                status: StatusCode::SERVICE_UNAVAILABLE,
                code: "remote_unavailable",
                message: err.to_string(),
            },
            other => internal(other),
        }
    }
}

impl From<ReminderError> for AppError {
    fn from(err: ReminderError) -> Self {
        match err {
            ReminderError::Invalid(message) => bad_request(message),
            ReminderError::NotFound(_) => not_found(err.to_string()),
            ReminderError::Database(_) => internal(err),
        }
    }
}

// ============ POST /chat ============

#[derive(Deserialize)]
struct ChatRequest {
    #[serde(default)]
    message: String,
    session_id: Option<String>,
    model: Option<String>,
    #[serde(default)]
    files: Vec<FilePayload>,
}

/// A file inlined in a JSON request body.
#[derive(Deserialize)]
struct FilePayload {
    filename: String,
    content_type: Option<String>,
    /// Base64 (standard alphabet) file bytes.
    data: String,
}

impl ChatRequest {
    fn session_id(&self) -> String {
        self.session_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SESSION)
            .to_string()
    }

    fn into_turn(self) -> Result<TurnRequest, AppError> {
        let mut files = Vec::with_capacity(self.files.len());
        for f in self.files {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(f.data.trim())
                .map_err(|e| bad_request(format!("file {}: invalid base64: {}", f.filename, e)))?;
            if bytes.len() > MAX_FILE_BYTES {
                return Err(too_large(bytes.len()));
            }
            files.push(UploadedFile {
                filename: f.filename,
                content_type: f.content_type,
                bytes,
            });
        }
        Ok(TurnRequest {
            message: self.message,
            files,
        })
    }
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<TurnReply>, AppError> {
    let session_id = req.session_id();
    let handle = state.session(&session_id, req.model.as_deref());
    let turn = req.into_turn()?;
    let message = turn.message.clone();

    let reply = {
        let mut orch = handle.lock().await;
        orch.handle_turn(turn).await
    };

    if reply.succeeded() {
        record_exchange(&state.pool, &session_id, &message, &reply.response, reply.model.as_deref())
            .await;
    }
    Ok(Json(reply))
}

async fn record_exchange(
    pool: &SqlitePool,
    session_id: &str,
    user: &str,
    assistant: &str,
    model: Option<&str>,
) {
    let recorded = async {
        history::record_turn(pool, session_id, Role::User, user, None).await?;
        history::record_turn(pool, session_id, Role::Assistant, assistant, model).await
    };
    if let Err(e) = recorded.await {
        warn!(session = %session_id, error = %e, "failed to record chat history");
    }
}

// ============ POST /chat/stream ============

type EventStream = BoxStream<'static, Result<Event, Infallible>>;

#[derive(Serialize)]
struct StreamFrame<'a> {
    content: &'a str,
    complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

impl<'a> StreamFrame<'a> {
    fn delta(content: &'a str) -> Self {
        Self {
            content,
            complete: false,
            response: None,
            session_id: None,
            success: None,
            error: None,
        }
    }

    fn event(&self) -> Event {
        Event::default().data(serde_json::to_string(self).unwrap_or_default())
    }
}

fn final_frame(response: &str, session_id: &str, error: Option<&str>) -> Event {
    StreamFrame {
        content: "",
        complete: true,
        response: Some(response),
        session_id: Some(session_id),
        success: Some(error.is_none()),
        error,
    }
    .event()
}

fn done() -> Event {
    Event::default().data("[DONE]")
}

enum Phase {
    Streaming,
    Sentinel,
    Closed,
}

struct StreamState {
    orch: OwnedMutexGuard<Orchestrator>,
    turn: StreamingTurn,
    pool: SqlitePool,
    session_id: String,
    message: String,
    collected: String,
    error: Option<String>,
    phase: Phase,
}

async fn handle_chat_stream(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<KeepAliveStream<EventStream>>, AppError> {
    let session_id = req.session_id();
    let handle = state.session(&session_id, req.model.as_deref());
    let turn = req.into_turn()?;
    let message = turn.message.clone();

    // The session stays locked until the stream ends.
    let mut orch = handle.lock_owned().await;
    let started = orch.begin_stream(turn).await;
    let stream: EventStream = match started {
        Err(reply) => {
            let err = reply.error.as_ref().map(|e| e.message.as_str());
            let frames = vec![
                Ok(final_frame(&reply.response, &session_id, err.or(Some("failed")))),
                Ok(done()),
            ];
            stream::iter(frames).boxed()
        }
        Ok(streaming) => {
            let st = StreamState {
                orch,
                turn: streaming,
                pool: state.pool.clone(),
                session_id,
                message,
                collected: String::new(),
                error: None,
                phase: Phase::Streaming,
            };
            stream::unfold(st, next_frame).boxed()
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn next_frame(mut st: StreamState) -> Option<(Result<Event, Infallible>, StreamState)> {
    match st.phase {
        Phase::Streaming => match st.turn.receiver.recv().await {
            Some(Ok(delta)) => {
                st.collected.push_str(&delta);
                let event = StreamFrame::delta(&delta).event();
                Some((Ok(event), st))
            }
            Some(Err(e)) => {
                warn!(session = %st.session_id, error = %e, "stream failed");
                st.error = Some(e.user_message());
                let event = StreamFrame {
                    error: st.error.as_deref(),
                    ..StreamFrame::delta("")
                }
                .event();
                Some((Ok(event), st))
            }
            None => {
                let failed = st.error.is_some() || st.collected.trim().is_empty();
                st.orch.finish_stream(&st.turn, &st.collected, failed);
                if !failed {
                    let model = st.turn.binding.resolved_model.clone();
                    record_exchange(&st.pool, &st.session_id, &st.message, st.collected.trim(), Some(&model))
                        .await;
                }
                let error = match (&st.error, failed) {
                    (Some(e), _) => Some(e.as_str()),
                    (None, true) => Some("empty response"),
                    (None, false) => None,
                };
                let event = final_frame(st.collected.trim(), &st.session_id, error);
                st.phase = Phase::Sentinel;
                Some((Ok(event), st))
            }
        },
        Phase::Sentinel => {
            st.phase = Phase::Closed;
            Some((Ok(done()), st))
        }
        Phase::Closed => None,
    }
}

// ============ POST /upload ============

#[derive(Serialize)]
struct UploadResponse {
    upload_id: String,
    filename: String,
    file_type: String,
    size: usize,
    text_length: usize,
    preview: String,
    summary: String,
    embedded: bool,
    backend: Option<Backend>,
    chunks: usize,
}

async fn handle_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let mut upload: Option<UploadedFile> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| bad_request("file field has no filename"))?;
        let content_type = field.content_type().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| bad_request(format!("could not read upload: {}", e)))?;
        upload = Some(UploadedFile {
            filename,
            content_type,
            bytes: bytes.to_vec(),
        });
        break;
    }
    let file = upload.ok_or_else(|| bad_request("missing multipart field: file"))?;

    if file.bytes.len() > MAX_FILE_BYTES {
        return Err(too_large(file.bytes.len()));
    }
    if file.bytes.is_empty() {
        return Err(bad_request("Empty file uploaded."));
    }
    if detect_kind(&file.filename, file.content_type.as_deref()) == FileKind::Unknown {
        return Err(bad_request("Unsupported file type."));
    }

    let decoded = decode_file(&file.filename, file.content_type.as_deref(), &file.bytes)
        .map_err(|e| bad_request(format!("Error parsing file: {}", e)))?;
    let file_type = decoded.kind.as_str().to_string();

    let outcome = state
        .retrieval
        .embed_and_store(
            &decoded.text,
            &file.filename,
            serde_json::json!({ "file_type": file_type }),
        )
        .await;

    let record = history::record_upload(
        &state.pool,
        NewUpload {
            filename: &file.filename,
            content_type: file.content_type.as_deref(),
            bytes: &file.bytes,
            preview: Some(&decoded.preview),
            stored_in: outcome.backend.map(|b| match b {
                Backend::Remote => "remote",
                Backend::Local => "local",
            }),
        },
    )
    .await
    .map_err(internal)?;

    let mut summary = format!("Successfully parsed {}. {}", file.filename, decoded.preview);
    if outcome.embedded() {
        summary.push_str(" Content has been embedded for enhanced search.");
    }
    info!(file = %file.filename, kind = %file_type, chunks = outcome.chunks, "upload processed");

    Ok(Json(UploadResponse {
        upload_id: record.id,
        filename: file.filename,
        file_type,
        size: file.bytes.len(),
        text_length: decoded.text.len(),
        preview: decoded.preview,
        summary,
        embedded: outcome.embedded(),
        backend: outcome.backend,
        chunks: outcome.chunks,
    }))
}

// ============ GET /history/{session_id} ============

#[derive(Deserialize)]
struct HistoryParams {
    limit: Option<i64>,
}

#[derive(Serialize)]
struct HistoryResponse {
    session_id: String,
    count: usize,
    turns: Vec<history::HistoryEntry>,
}

async fn handle_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, AppError> {
    if params.limit.is_some_and(|l| l <= 0) {
        return Err(bad_request("limit must be > 0"));
    }
    let turns = history::session_history(&state.pool, &session_id, params.limit)
        .await
        .map_err(internal)?;
    Ok(Json(HistoryResponse {
        session_id,
        count: turns.len(),
        turns,
    }))
}

// ============ /sessions ============

#[derive(Serialize)]
struct SessionInfo {
    session_id: String,
    /// `None` while a turn is in flight.
    memory_length: Option<usize>,
    model: Option<String>,
    degraded: Option<bool>,
}

#[derive(Serialize)]
struct SessionsResponse {
    sessions: Vec<SessionInfo>,
    total: usize,
    capacity: usize,
}

async fn handle_sessions(State(state): State<AppState>) -> Json<SessionsResponse> {
    let sessions: Vec<SessionInfo> = state
        .sessions
        .session_ids()
        .into_iter()
        .filter_map(|id| {
            let handle = state.sessions.get(&id)?;
            let info = match handle.try_lock() {
                Ok(orch) => SessionInfo {
                    session_id: id,
                    memory_length: Some(orch.memory().len()),
                    model: Some(orch.text_model().to_string()),
                    degraded: Some(orch.is_degraded()),
                },
                Err(_) => SessionInfo {
                    session_id: id,
                    memory_length: None,
                    model: None,
                    degraded: None,
                },
            };
            Some(info)
        })
        .collect();

    Json(SessionsResponse {
        total: sessions.len(),
        capacity: state.sessions.capacity(),
        sessions,
    })
}

#[derive(Serialize)]
struct DeleteSessionResponse {
    session_id: String,
    evicted: bool,
    deleted_messages: u64,
}

async fn handle_delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<DeleteSessionResponse>, AppError> {
    let evicted = state.sessions.evict(&session_id);
    let deleted_messages = history::clear_history(&state.pool, &session_id)
        .await
        .map_err(internal)?;
    if !evicted && deleted_messages == 0 {
        return Err(not_found(format!("no such session: {}", session_id)));
    }
    info!(session = %session_id, evicted, deleted_messages, "session cleared");
    Ok(Json(DeleteSessionResponse {
        session_id,
        evicted,
        deleted_messages,
    }))
}

// ============ /retrieval ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    limit: Option<usize>,
    /// Search the remote store instead of the local index.
    #[serde(default)]
    remote: bool,
    threshold: Option<f32>,
}

#[derive(Serialize)]
struct SearchHit {
    source: String,
    chunk_index: i64,
    content: String,
    score: f32,
}

#[derive(Serialize)]
struct SearchResponse {
    backend: Backend,
    results: Vec<SearchHit>,
}

async fn handle_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let limit = req.limit.unwrap_or(5);
    if limit == 0 {
        return Err(bad_request("limit must be > 0"));
    }

    if req.remote {
        let matches = state
            .retrieval
            .search_remote(&req.query, limit, req.threshold)
            .await?;
        let results = matches
            .into_iter()
            .map(|m| SearchHit {
                source: m.document_id.unwrap_or_default(),
                chunk_index: m.chunk_index.unwrap_or(0),
                content: m.content,
                score: m.similarity,
            })
            .collect();
        return Ok(Json(SearchResponse {
            backend: Backend::Remote,
            results,
        }));
    }

    let results = state
        .retrieval
        .search(&req.query, limit)
        .await
        .map_err(internal)?
        .into_iter()
        .filter(|r| req.threshold.map_or(true, |t| r.score >= t))
        .map(|r| SearchHit {
            source: r.chunk.source,
            chunk_index: r.chunk.chunk_index,
            content: r.chunk.content,
            score: r.score,
        })
        .collect();
    Ok(Json(SearchResponse {
        backend: Backend::Local,
        results,
    }))
}

async fn handle_retrieval_stats(
    State(state): State<AppState>,
) -> Json<crate::retrieval::RetrievalStats> {
    Json(state.retrieval.stats().await)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    /// `ok`, or `degraded` when an optional capability is missing.
    status: &'static str,
    version: &'static str,
    capabilities: Capabilities,
    sessions: usize,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: if state.capabilities.is_degraded() {
            "degraded"
        } else {
            "ok"
        },
        version: env!("CARGO_PKG_VERSION"),
        capabilities: (*state.capabilities).clone(),
        sessions: state.sessions.len(),
    })
}

// ============ /reminders ============

#[derive(Deserialize)]
struct GroupedParams {
    #[serde(default)]
    completed: bool,
}

#[derive(Serialize)]
struct GroupedResponse {
    groups: Vec<RemindersByDate>,
    total: usize,
}

async fn handle_reminders(
    State(state): State<AppState>,
    Query(params): Query<GroupedParams>,
) -> Result<Json<GroupedResponse>, AppError> {
    let groups = reminders::grouped(&state.pool, params.completed).await?;
    let total = groups.iter().map(|g| g.reminders.len()).sum();
    Ok(Json(GroupedResponse { groups, total }))
}

#[derive(Serialize)]
struct ReminderList {
    reminders: Vec<Reminder>,
    count: usize,
}

impl From<Vec<Reminder>> for ReminderList {
    fn from(reminders: Vec<Reminder>) -> Self {
        Self {
            count: reminders.len(),
            reminders,
        }
    }
}

async fn handle_all_reminders(State(state): State<AppState>) -> Result<Json<ReminderList>, AppError> {
    Ok(Json(reminders::list_all(&state.pool).await?.into()))
}

#[derive(Deserialize)]
struct UpcomingParams {
    #[serde(default = "default_upcoming_days")]
    days: u32,
}

fn default_upcoming_days() -> u32 {
    7
}

async fn handle_upcoming_reminders(
    State(state): State<AppState>,
    Query(params): Query<UpcomingParams>,
) -> Result<Json<ReminderList>, AppError> {
    let today = chrono::Local::now().date_naive();
    Ok(Json(reminders::upcoming(&state.pool, today, params.days).await?.into()))
}

#[derive(Deserialize)]
struct ReminderSearchParams {
    #[serde(default)]
    q: String,
}

async fn handle_search_reminders(
    State(state): State<AppState>,
    Query(params): Query<ReminderSearchParams>,
) -> Result<Json<ReminderList>, AppError> {
    if params.q.trim().is_empty() {
        return Err(bad_request("q must not be empty"));
    }
    Ok(Json(reminders::search(&state.pool, &params.q).await?.into()))
}

async fn handle_create_reminder(
    State(state): State<AppState>,
    Json(new): Json<NewReminder>,
) -> Result<(StatusCode, Json<Reminder>), AppError> {
    let reminder = reminders::create(&state.pool, new).await?;
    info!(id = reminder.id, date = %reminder.date, "reminder created");
    Ok((StatusCode::CREATED, Json(reminder)))
}

async fn handle_get_reminder(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Reminder>, AppError> {
    Ok(Json(reminders::get(&state.pool, id).await?))
}

async fn handle_update_reminder(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(changes): Json<ReminderUpdate>,
) -> Result<Json<Reminder>, AppError> {
    Ok(Json(reminders::update(&state.pool, id, changes).await?))
}

#[derive(Serialize)]
struct ReminderStatus {
    status: &'static str,
    message: String,
    reminder_id: i64,
}

async fn handle_complete_reminder(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ReminderStatus>, AppError> {
    let reminder = reminders::complete(&state.pool, id).await?;
    Ok(Json(ReminderStatus {
        status: "success",
        message: format!("Reminder '{}' marked as completed", reminder.title),
        reminder_id: id,
    }))
}

async fn handle_delete_reminder(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ReminderStatus>, AppError> {
    let reminder = reminders::delete(&state.pool, id).await?;
    info!(id, "reminder deleted");
    Ok(Json(ReminderStatus {
        status: "success",
        message: format!("Reminder '{}' deleted successfully", reminder.title),
        reminder_id: id,
    }))
}
