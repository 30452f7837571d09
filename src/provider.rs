//! Chat-completion client for the two gateway kinds.
//!
//! [`Provider`] is a tagged union with one variant per gateway. Every
//! variant offers the same capability set over one request shape
//! ([`CompletionRequest`]):
//!
//! | Method | Transport |
//! |--------|-----------|
//! | [`Provider::call`] | async `reqwest` |
//! | [`Provider::call_blocking`] | `reqwest::blocking` on a blocking thread |
//! | [`Provider::call_streaming`] | async `reqwest` byte stream, SSE lines |
//!
//! # Wire format
//!
//! ```json
//! { "model": "...", "messages": [{"role": "user", "content": "..."}],
//!   "temperature": 0.3, "max_tokens": 1500, "stop": ["..."],
//!   "attachments": [{"name": "a.pdf", "content": "<base64>", "mime_type": "application/pdf"}],
//!   "plugins": [{"id": "file-parser", "pdf": {"engine": "pdf-text"}}],
//!   "tools": [{"type": "function", "function": {"name": "...", "description": "...", "parameters": {}}}],
//!   "stream": true }
//! ```
//!
//! `tools` is only sent on non-streaming calls. The response text is read
//! from `choices[0].message.content` and tool calls from
//! `choices[0].message.tool_calls`; streamed
//! deltas from `choices[0].delta.content` on `data: ` lines, ending at
//! `data: [DONE]`.
//!
//! # File attachments
//!
//! Only the primary gateway accepts attachments. A request carrying them
//! uses the longer file timeout, and if the first attempt returns a
//! non-success status it is retried exactly once with the configured
//! fallback file model.

use std::time::Duration;

use base64::Engine;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use llm_relay_core::models::{ChatMessage, ToolCall};

use crate::config::{Config, GenerationConfig};
use crate::error::ProviderError;
use crate::tools::ToolDefinition;

/// Which gateway a binding targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderId {
    PrimaryGateway,
    SecondaryGateway,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::PrimaryGateway => "PRIMARY_GATEWAY",
            ProviderId::SecondaryGateway => "SECONDARY_GATEWAY",
        }
    }
}

/// Sampling and timeout settings for one call.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub file_timeout: Duration,
    pub stop: Vec<String>,
}

impl GenerationParams {
    pub fn from_config(cfg: &GenerationConfig) -> Self {
        Self {
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
            timeout: Duration::from_secs(cfg.timeout_secs),
            file_timeout: Duration::from_secs(cfg.file_timeout_secs()),
            stop: cfg.stop.clone(),
        }
    }
}

/// A raw file sent alongside the messages.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub params: GenerationParams,
    pub attachments: Vec<Attachment>,
    /// Tools the model may call. Empty means none are offered.
    pub tools: Vec<ToolDefinition>,
}

/// A successful completion.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Trimmed `choices[0].message.content`.
    pub text: String,
    /// The model that produced the answer (differs from the request after
    /// a file fallback).
    pub model: String,
    /// Names of tools invoked by the model, in order.
    pub tools_used: Vec<String>,
    /// The calls themselves, with ids and arguments.
    pub tool_calls: Vec<ToolCall>,
    /// Full response payload, for diagnostics.
    pub raw: Value,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attachments: Option<Vec<WireAttachment<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    plugins: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: &'a ToolDefinition,
}

#[derive(Serialize)]
struct WireAttachment<'a> {
    name: &'a str,
    content: String,
    mime_type: &'a str,
}

/// Connection settings for one gateway endpoint.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    endpoint: String,
    api_key: Option<String>,
    headers: Vec<(String, String)>,
    fallback_file_model: Option<String>,
    http: reqwest::Client,
}

impl GatewayClient {
    /// Build the primary gateway client. Fails only on an unusable
    /// endpoint or if the HTTP client cannot be constructed.
    pub fn primary(config: &Config, api_key: Option<String>) -> Result<Self, ProviderError> {
        let primary = &config.providers.primary;
        check_endpoint(&primary.base_url)?;
        Ok(Self {
            endpoint: primary.base_url.clone(),
            api_key,
            headers: vec![
                ("HTTP-Referer".to_string(), primary.referer.clone()),
                ("X-Title".to_string(), primary.title.clone()),
            ],
            fallback_file_model: config.models.fallback_file.clone(),
            http: build_http()?,
        })
    }

    /// Build a secondary gateway client for `model`.
    pub fn secondary(config: &Config, api_key: String, model: &str) -> Result<Self, ProviderError> {
        let secondary = &config.providers.secondary;
        let lower = model.to_lowercase();
        if secondary
            .unsupported_models
            .iter()
            .any(|m| m.to_lowercase() == lower)
        {
            return Err(ProviderError::Construction(format!(
                "model '{}' requires request options the secondary client does not support",
                model
            )));
        }
        check_endpoint(&secondary.base_url)?;
        Ok(Self {
            endpoint: secondary.base_url.clone(),
            api_key: Some(api_key),
            headers: Vec::new(),
            fallback_file_model: None,
            http: build_http()?,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn body(&self, req: &CompletionRequest, model: &str, stream: bool) -> Result<Value, ProviderError> {
        let attachments = if req.attachments.is_empty() {
            None
        } else {
            Some(
                req.attachments
                    .iter()
                    .map(|a| WireAttachment {
                        name: &a.filename,
                        content: base64::engine::general_purpose::STANDARD.encode(&a.bytes),
                        mime_type: &a.mime_type,
                    })
                    .collect(),
            )
        };
        let plugins = attachments
            .as_ref()
            .map(|_| serde_json::json!([{"id": "file-parser", "pdf": {"engine": "pdf-text"}}]));

        let tools = (!stream && !req.tools.is_empty()).then(|| {
            req.tools
                .iter()
                .map(|function| WireTool {
                    kind: "function",
                    function,
                })
                .collect()
        });

        let wire = WireRequest {
            model,
            messages: &req.messages,
            temperature: req.params.temperature,
            max_tokens: req.params.max_tokens,
            stop: if req.params.stop.is_empty() {
                None
            } else {
                Some(&req.params.stop)
            },
            attachments,
            plugins,
            tools,
            stream: stream.then_some(true),
        };
        serde_json::to_value(&wire).map_err(|e| ProviderError::Invalid(e.to_string()))
    }

    /// Models to try, in order, plus the timeout to use.
    fn plan(&self, req: &CompletionRequest) -> (Vec<String>, Duration) {
        if req.attachments.is_empty() {
            return (vec![req.model.clone()], req.params.timeout);
        }
        let mut models = vec![req.model.clone()];
        if let Some(fallback) = &self.fallback_file_model {
            if fallback != &req.model {
                models.push(fallback.clone());
            }
        }
        (models, req.params.file_timeout)
    }

    fn request(&self, body: &Value, timeout: Duration) -> reqwest::RequestBuilder {
        let mut builder = self.http.post(&self.endpoint).timeout(timeout).json(body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }

    async fn send(&self, body: &Value, timeout: Duration) -> Result<Value, ProviderError> {
        let resp = self.request(body, timeout).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let text = resp.text().await?;
        serde_json::from_str(&text).map_err(|e| ProviderError::Malformed(e.to_string()))
    }

    async fn send_blocking(&self, body: Value, timeout: Duration) -> Result<Value, ProviderError> {
        let endpoint = self.endpoint.clone();
        let api_key = self.api_key.clone();
        let headers = self.headers.clone();

        tokio::task::spawn_blocking(move || {
            let client = reqwest::blocking::Client::builder().build()?;
            let mut builder = client.post(&endpoint).timeout(timeout).json(&body);
            if let Some(key) = &api_key {
                builder = builder.bearer_auth(key);
            }
            for (name, value) in &headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            let resp = builder.send()?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().unwrap_or_default();
                return Err(ProviderError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            let text = resp.text()?;
            serde_json::from_str(&text).map_err(|e| ProviderError::Malformed(e.to_string()))
        })
        .await
        .map_err(|e| ProviderError::Transport(format!("blocking call aborted: {}", e)))?
    }
}

fn check_endpoint(url: &str) -> Result<(), ProviderError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| ProviderError::Construction(format!("invalid endpoint '{}': {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ProviderError::Construction(format!(
            "unsupported endpoint scheme '{}' in '{}'",
            other, url
        ))),
    }
}

fn build_http() -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .build()
        .map_err(|e| ProviderError::Construction(e.to_string()))
}

/// A gateway bound for execution.
#[derive(Debug, Clone)]
pub enum Provider {
    Primary(GatewayClient),
    Secondary(GatewayClient),
}

impl Provider {
    pub fn id(&self) -> ProviderId {
        match self {
            Provider::Primary(_) => ProviderId::PrimaryGateway,
            Provider::Secondary(_) => ProviderId::SecondaryGateway,
        }
    }

    pub fn supports_files(&self) -> bool {
        matches!(self, Provider::Primary(_))
    }

    fn gateway(&self, req: &CompletionRequest) -> Result<&GatewayClient, ProviderError> {
        match self {
            Provider::Primary(g) => Ok(g),
            Provider::Secondary(_) if !req.attachments.is_empty() => Err(ProviderError::Invalid(
                "file attachments require the primary gateway".to_string(),
            )),
            Provider::Secondary(g) => Ok(g),
        }
    }

    /// Execute one completion asynchronously.
    pub async fn call(&self, req: &CompletionRequest) -> Result<Completion, ProviderError> {
        let gateway = self.gateway(req)?;
        let (models, timeout) = gateway.plan(req);
        let last = models.len() - 1;

        for (attempt, model) in models.iter().enumerate() {
            let body = gateway.body(req, model, false)?;
            match gateway.send(&body, timeout).await {
                Ok(raw) => return parse_completion(raw, model),
                Err(err @ ProviderError::Status { .. }) if attempt < last => {
                    warn!(model = %model, error = %err, "file call failed, retrying with fallback model");
                }
                Err(err) => return Err(err),
            }
        }
        Err(ProviderError::Invalid("no model to call".to_string()))
    }

    /// Execute one completion with the blocking client.
    pub async fn call_blocking(&self, req: &CompletionRequest) -> Result<Completion, ProviderError> {
        let gateway = self.gateway(req)?;
        let (models, timeout) = gateway.plan(req);
        let last = models.len() - 1;

        for (attempt, model) in models.iter().enumerate() {
            let body = gateway.body(req, model, false)?;
            match gateway.send_blocking(body, timeout).await {
                Ok(raw) => return parse_completion(raw, model),
                Err(err @ ProviderError::Status { .. }) if attempt < last => {
                    warn!(model = %model, error = %err, "file call failed, retrying with fallback model");
                }
                Err(err) => return Err(err),
            }
        }
        Err(ProviderError::Invalid("no model to call".to_string()))
    }

    /// Convenience wrapper for [`Provider::call`] with raw attachments.
    pub async fn call_with_files(
        &self,
        req: &CompletionRequest,
        attachments: Vec<Attachment>,
    ) -> Result<Completion, ProviderError> {
        let mut req = req.clone();
        req.attachments = attachments;
        self.call(&req).await
    }

    /// Stream text increments. Malformed chunks are skipped; the channel
    /// closes after `[DONE]` or when the body ends.
    pub async fn call_streaming(
        &self,
        req: &CompletionRequest,
    ) -> Result<mpsc::Receiver<Result<String, ProviderError>>, ProviderError> {
        if !req.attachments.is_empty() {
            return Err(ProviderError::Invalid(
                "streaming does not accept file attachments".to_string(),
            ));
        }
        let gateway = self.gateway(req)?;
        let body = gateway.body(req, &req.model, true)?;
        let resp = gateway.request(&body, req.params.timeout).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let (tx, rx) = mpsc::channel(100);

        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();

            'outer: while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        buffer.extend_from_slice(&bytes);
                        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                            let line_bytes: Vec<u8> = buffer.drain(..=pos).collect();
                            let line = String::from_utf8_lossy(&line_bytes);
                            match parse_sse_line(&line) {
                                SseEvent::Delta(text) => {
                                    if tx.send(Ok(text)).await.is_err() {
                                        break 'outer;
                                    }
                                }
                                SseEvent::Done => {
                                    debug!("stream finished");
                                    break 'outer;
                                }
                                SseEvent::Skip => {}
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "stream transport error");
                        let _ = tx.send(Err(ProviderError::from(e))).await;
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// One parsed server-sent-event line.
#[derive(Debug, PartialEq)]
pub enum SseEvent {
    Delta(String),
    Done,
    Skip,
}

/// Parse one line of a streamed completion.
pub fn parse_sse_line(line: &str) -> SseEvent {
    let Some(payload) = line.trim().strip_prefix("data:") else {
        return SseEvent::Skip;
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        return SseEvent::Done;
    }
    match serde_json::from_str::<Value>(payload) {
        Ok(json) => json
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(|s| SseEvent::Delta(s.to_string()))
            .unwrap_or(SseEvent::Skip),
        Err(e) => {
            debug!(error = %e, "skipping malformed stream chunk");
            SseEvent::Skip
        }
    }
}

/// Extract text and tool calls from a completion payload.
pub fn parse_completion(raw: Value, model: &str) -> Result<Completion, ProviderError> {
    let message = raw
        .pointer("/choices/0/message")
        .ok_or_else(|| ProviderError::Malformed("missing choices[0].message".to_string()))?;

    let text = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();

    let tool_calls: Vec<ToolCall> = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .filter_map(|(i, c)| parse_tool_call(i, c))
                .collect()
        })
        .unwrap_or_default();
    let tools_used: Vec<String> = tool_calls.iter().map(|c| c.function.name.clone()).collect();

    if text.is_empty() && tools_used.is_empty() {
        return Err(ProviderError::Malformed(
            "choices[0].message has no content".to_string(),
        ));
    }

    Ok(Completion {
        text,
        model: model.to_string(),
        tools_used,
        tool_calls,
        raw,
    })
}

/// Gateways differ on the details: ids may be missing and arguments may
/// arrive as an object instead of a JSON string.
fn parse_tool_call(index: usize, call: &Value) -> Option<ToolCall> {
    let name = call.pointer("/function/name").and_then(Value::as_str)?;
    let id = call
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("call_{}", index));
    let arguments = match call.pointer("/function/arguments") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    Some(ToolCall::new(id, name, arguments))
}
