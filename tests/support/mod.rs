//! In-process fakes for the chat gateways and the remote vector store.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};

use sha2::{Digest, Sha256};

use llm_relay::config::{Config, RemoteStoreConfig};
use llm_relay_core::embedding::{cosine_similarity, normalize};

pub const PRIMARY_PATH: &str = "/v1/chat/completions";
pub const SECONDARY_PATH: &str = "/secondary/v1/chat/completions";
pub const EMBED_PATH: &str = "/api/embed";

/// Embedding model served by the fake gateway. Its vectors are
/// [`hash_embedding`] with `EMBED_DIMS` buckets.
pub const EMBED_MODEL: &str = "feature-hash";
pub const EMBED_DIMS: usize = 64;

pub fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// A URL nothing listens on.
pub fn dead_url(path: &str) -> String {
    format!("http://127.0.0.1:{}{}", find_free_port(), path)
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{}", addr)
}

/// Deterministic bag-of-words vector: each lowercase token adds ±1 to one
/// of `dims` buckets, then the vector is L2-normalised.
pub fn hash_embedding(text: &str, dims: usize) -> Vec<f32> {
    let mut vec = vec![0.0f32; dims];
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let digest = Sha256::digest(token.to_lowercase().as_bytes());
        let mut bucket_bytes = [0u8; 8];
        bucket_bytes.copy_from_slice(&digest[..8]);
        let bucket = (u64::from_le_bytes(bucket_bytes) % dims as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vec[bucket] += sign;
    }
    normalize(&mut vec);
    vec
}

// ─── Chat gateway ───────────────────────────────────────────────────

/// What the gateway answers with for one request.
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    /// Text plus tool-call names in `choices[0].message.tool_calls`.
    Tools(String, Vec<String>),
    /// No text, one call to the named tool with these JSON arguments.
    Call(String, Value),
    Status(u16),
    /// 200 with a body that has no `choices`.
    Malformed,
    /// Server-sent events, one delta per item, then `[DONE]`.
    Stream(Vec<String>),
}

impl Reply {
    pub fn text(s: &str) -> Self {
        Reply::Text(s.to_string())
    }

    pub fn call(name: &str, arguments: Value) -> Self {
        Reply::Call(name.to_string(), arguments)
    }
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub path: String,
    pub authorization: Option<String>,
    pub title: Option<String>,
    pub body: Value,
}

impl Recorded {
    pub fn model(&self) -> &str {
        self.body["model"].as_str().unwrap_or_default()
    }

    pub fn last_user_message(&self) -> String {
        self.body["messages"]
            .as_array()
            .and_then(|m| m.last())
            .and_then(|m| m["content"].as_str())
            .unwrap_or_default()
            .to_string()
    }
}

#[derive(Clone, Default)]
struct GatewayState {
    script: Arc<Mutex<VecDeque<Reply>>>,
    default: Arc<Mutex<Option<Reply>>>,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

/// Serves both gateway paths; replies are taken from a queue, then from
/// the default.
pub struct FakeGateway {
    pub base: String,
    state: GatewayState,
}

impl FakeGateway {
    pub async fn start(default: Reply) -> Self {
        let state = GatewayState::default();
        *state.default.lock().unwrap() = Some(default);

        let app = Router::new()
            .route(PRIMARY_PATH, post(primary_completion))
            .route(SECONDARY_PATH, post(secondary_completion))
            .route(EMBED_PATH, post(embed))
            .with_state(state.clone());
        let base = serve(app).await;
        Self { base, state }
    }

    pub fn primary_url(&self) -> String {
        format!("{}{}", self.base, PRIMARY_PATH)
    }

    pub fn secondary_url(&self) -> String {
        format!("{}{}", self.base, SECONDARY_PATH)
    }

    /// Queue `reply` for the next request.
    pub fn push(&self, reply: Reply) {
        self.state.script.lock().unwrap().push_back(reply);
    }

    /// Only the chat-completion requests; embedding calls are not recorded.
    pub fn requests(&self) -> Vec<Recorded> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.requests.lock().unwrap().len()
    }
}

async fn primary_completion(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    complete(state, PRIMARY_PATH, headers, body)
}

async fn secondary_completion(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    complete(state, SECONDARY_PATH, headers, body)
}

/// Ollama-shaped `POST /api/embed`.
async fn embed(Json(body): Json<Value>) -> Response {
    let inputs: Vec<String> = match &body["input"] {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => return (StatusCode::BAD_REQUEST, "missing input").into_response(),
    };
    let embeddings: Vec<Vec<f32>> = inputs
        .iter()
        .map(|t| hash_embedding(t, EMBED_DIMS))
        .collect();
    Json(json!({"model": body["model"], "embeddings": embeddings})).into_response()
}

fn complete(state: GatewayState, path: &str, headers: HeaderMap, body: Value) -> Response {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    state.requests.lock().unwrap().push(Recorded {
        path: path.to_string(),
        authorization: header("authorization"),
        title: header("x-title"),
        body: body.clone(),
    });

    let reply = state
        .script
        .lock()
        .unwrap()
        .pop_front()
        .or_else(|| state.default.lock().unwrap().clone())
        .unwrap_or(Reply::Status(500));
    let model = body["model"].as_str().unwrap_or_default().to_string();

    match reply {
        Reply::Text(text) => Json(completion(&model, &text, &[])).into_response(),
        Reply::Tools(text, tools) => Json(completion(&model, &text, &tools)).into_response(),
        Reply::Call(name, arguments) => {
            let mut body = completion(&model, "", &[name]);
            body["choices"][0]["message"]["content"] = Value::Null;
            body["choices"][0]["message"]["tool_calls"][0]["function"]["arguments"] =
                Value::String(arguments.to_string());
            body["choices"][0]["finish_reason"] = json!("tool_calls");
            Json(body).into_response()
        }
        Reply::Status(code) => (
            StatusCode::from_u16(code).unwrap(),
            Json(json!({"error": {"message": "scripted failure"}})),
        )
            .into_response(),
        Reply::Malformed => Json(json!({"id": "cmpl-x", "object": "chat.completion"})).into_response(),
        Reply::Stream(deltas) => {
            let mut out = String::new();
            out.push_str(": keep-alive\n\n");
            for d in deltas {
                let chunk = json!({"choices": [{"delta": {"content": d}}]});
                out.push_str(&format!("data: {}\n\n", chunk));
            }
            out.push_str("data: not json\n\n");
            out.push_str("data: [DONE]\n\n");
            ([(header::CONTENT_TYPE, "text/event-stream")], out).into_response()
        }
    }
}

fn completion(model: &str, text: &str, tools: &[String]) -> Value {
    let mut message = json!({"role": "assistant", "content": text});
    if !tools.is_empty() {
        message["tool_calls"] = tools
            .iter()
            .enumerate()
            .map(|(i, name)| {
                json!({
                    "id": format!("call_{}", i),
                    "type": "function",
                    "function": {"name": name, "arguments": "{}"}
                })
            })
            .collect();
    }
    json!({
        "id": "cmpl-test",
        "object": "chat.completion",
        "model": model,
        "choices": [{"index": 0, "message": message, "finish_reason": "stop"}]
    })
}

// ─── Remote vector store ────────────────────────────────────────────

#[derive(Clone)]
struct StoreState {
    rows: Arc<Mutex<Vec<Value>>>,
    next_id: Arc<Mutex<u64>>,
    with_rpc: bool,
    fail_inserts: Arc<Mutex<bool>>,
}

/// PostgREST-shaped table plus an optional `match_documents` function.
pub struct FakeStore {
    pub url: String,
    state: StoreState,
}

pub const TABLE: &str = "document_embeddings";

impl FakeStore {
    /// `with_rpc` controls whether the server-side match function exists.
    pub async fn start(with_rpc: bool) -> Self {
        let state = StoreState {
            rows: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(Mutex::new(1)),
            with_rpc,
            fail_inserts: Arc::new(Mutex::new(false)),
        };
        let app = Router::new()
            .route(
                &format!("/rest/v1/{}", TABLE),
                post(insert_row).get(select_rows).delete(delete_rows),
            )
            .route("/rest/v1/rpc/match_documents", post(match_rows))
            .with_state(state.clone());
        let url = serve(app).await;
        Self { url, state }
    }

    pub fn config(&self, dims: usize) -> RemoteStoreConfig {
        RemoteStoreConfig {
            url: self.url.clone(),
            api_key_env: "TEST_STORE_KEY".to_string(),
            table: TABLE.to_string(),
            match_function: "match_documents".to_string(),
            dims,
            similarity_threshold: 0.0,
            timeout_secs: 5,
        }
    }

    /// Insert a row directly, bypassing the client.
    pub fn seed(&self, document_id: &str, chunk_index: i64, content: &str, embedding: &[f32]) {
        let mut id = self.state.next_id.lock().unwrap();
        self.state.rows.lock().unwrap().push(json!({
            "id": *id,
            "content": content,
            "embedding": embedding,
            "metadata": {"filename": document_id, "file_type": "text"},
            "document_id": document_id,
            "chunk_index": chunk_index,
        }));
        *id += 1;
    }

    pub fn fail_inserts(&self, fail: bool) {
        *self.state.fail_inserts.lock().unwrap() = fail;
    }

    pub fn rows(&self) -> Vec<Value> {
        self.state.rows.lock().unwrap().clone()
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    headers.contains_key("apikey") && headers.contains_key("authorization")
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"message": "no key"}))).into_response()
}

fn embedding_of(row: &Value) -> Vec<f32> {
    row["embedding"]
        .as_array()
        .map(|a| a.iter().filter_map(Value::as_f64).map(|f| f as f32).collect())
        .unwrap_or_default()
}

/// Render rows the way PostgREST returns pgvector columns: as text.
fn as_wire(row: &Value) -> Value {
    let mut out = row.clone();
    let text = format!(
        "[{}]",
        embedding_of(row)
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(",")
    );
    out["embedding"] = Value::String(text);
    out
}

fn matches_filter(row: &Value, params: &HashMap<String, String>) -> bool {
    match params.get("document_id").and_then(|f| f.strip_prefix("eq.")) {
        Some(doc) => row["document_id"].as_str() == Some(doc),
        None => true,
    }
}

async fn insert_row(
    State(state): State<StoreState>,
    headers: HeaderMap,
    Json(mut body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    if *state.fail_inserts.lock().unwrap() {
        return (StatusCode::SERVICE_UNAVAILABLE, "insert disabled").into_response();
    }
    let mut id = state.next_id.lock().unwrap();
    body["id"] = json!(*id);
    *id += 1;
    state.rows.lock().unwrap().push(body.clone());
    (StatusCode::CREATED, Json(json!([body]))).into_response()
}

async fn select_rows(
    State(state): State<StoreState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let mut rows: Vec<Value> = state
        .rows
        .lock()
        .unwrap()
        .iter()
        .filter(|r| matches_filter(r, &params))
        .map(as_wire)
        .collect();
    match params.get("order").map(String::as_str) {
        Some("chunk_index.asc") => rows.sort_by_key(|r| r["chunk_index"].as_i64().unwrap_or(0)),
        Some("chunk_index.desc") => {
            rows.sort_by_key(|r| std::cmp::Reverse(r["chunk_index"].as_i64().unwrap_or(0)))
        }
        _ => {}
    }
    if let Some(limit) = params.get("limit").and_then(|l| l.parse::<usize>().ok()) {
        rows.truncate(limit);
    }
    Json(Value::Array(rows)).into_response()
}

async fn delete_rows(
    State(state): State<StoreState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let mut rows = state.rows.lock().unwrap();
    let (removed, kept): (Vec<Value>, Vec<Value>) =
        rows.drain(..).partition(|r| matches_filter(r, &params));
    *rows = kept;
    Json(Value::Array(removed)).into_response()
}

async fn match_rows(
    State(state): State<StoreState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !state.with_rpc {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"message": "Could not find the function"})),
        )
            .into_response();
    }
    if !authorized(&headers) {
        return unauthorized();
    }
    let query: Vec<f32> = body["query_embedding"]
        .as_array()
        .map(|a| a.iter().filter_map(Value::as_f64).map(|f| f as f32).collect())
        .unwrap_or_default();
    let threshold = body["match_threshold"].as_f64().unwrap_or(0.0) as f32;
    let count = body["match_count"].as_u64().unwrap_or(5) as usize;

    let mut scored: Vec<Value> = state
        .rows
        .lock()
        .unwrap()
        .iter()
        .filter_map(|row| {
            let similarity = cosine_similarity(&query, &embedding_of(row));
            if similarity < threshold {
                return None;
            }
            let mut out = row.clone();
            out.as_object_mut()?.remove("embedding");
            out["similarity"] = json!(similarity);
            Some(out)
        })
        .collect();
    scored.sort_by(|a, b| {
        let sa = a["similarity"].as_f64().unwrap_or(0.0);
        let sb = b["similarity"].as_f64().unwrap_or(0.0);
        sb.total_cmp(&sa)
    });
    scored.truncate(count);
    Json(Value::Array(scored)).into_response()
}

// ─── Config ─────────────────────────────────────────────────────────

/// Offline config: temp database, both gateways and the embedder on the
/// fake.
pub fn test_config(dir: &Path, gateway: &FakeGateway) -> Config {
    let mut cfg = Config::minimal();
    cfg.db.path = dir.join("data").join("relay.sqlite");
    cfg.providers.primary.base_url = gateway.primary_url();
    cfg.providers.secondary.base_url = gateway.secondary_url();
    cfg.embedding.provider = "ollama".to_string();
    cfg.embedding.model = Some(EMBED_MODEL.to_string());
    cfg.embedding.dims = Some(EMBED_DIMS);
    cfg.embedding.url = Some(gateway.base.clone());
    cfg.embedding.max_retries = 0;
    cfg.chunking.chunk_size = 200;
    cfg.chunking.chunk_overlap = 20;
    cfg.retrieval.index_dir = Some(dir.join("index"));
    cfg.generation.timeout_secs = 5;
    cfg
}
