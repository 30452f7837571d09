//! Per-session conversation orchestrator.
//!
//! One [`Orchestrator`] owns one session's [`ConversationMemory`] and turns
//! a user message into one model invocation:
//!
//! ```text
//! RECEIVED → CONTEXT_ENRICHED → MODEL_BOUND → EXECUTING → SUCCEEDED | FAILED
//!     └──────────────── (router failed at init) ──────────→ DEGRADED
//! ```
//!
//! - **Context.** Attached files are decoded and inlined; file content always
//!   wins. Without files, a retrieval context block is prepended when the
//!   local index is non-empty.
//! - **Binding.** Intent is `File` when files are attached. The text model
//!   serves text turns; `models.file` serves file turns.
//! - **Execution.** The async client runs first; a retryable failure gets
//!   exactly one blocking retry with identical parameters.
//! - **Tools.** With a [`ToolRegistry`] attached, its definitions go out
//!   with the request. Tool calls in the reply are executed and answered
//!   with `tool` messages, for at most `tools.max_rounds` rounds; the last
//!   round offers no tools so the model has to answer in text.
//! - **Memory.** Only successful turns are remembered. The stored user turn
//!   is the original message, not the enriched prompt.
//!
//! If the router cannot be built, the orchestrator is degraded for its
//! whole lifetime: every turn returns [`DEGRADED_RESPONSE`] without network
//! I/O.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use llm_relay_core::models::ChatMessage;

use crate::config::Config;
use crate::error::ProviderError;
use crate::extract::{decode_file, failure_line};
use crate::health::Capabilities;
use crate::provider::{Attachment, Completion, CompletionRequest, GenerationParams, Provider};
use crate::retrieval::RetrievalManager;
use crate::router::{CredentialSource, Intent, ModelRouter, ModelSpec, ProviderBinding};
use crate::tools::ToolRegistry;

pub const FAILURE_RESPONSE: &str = "I encountered an error while processing your request. \
The AI service may be temporarily unavailable. Please try again in a moment.";

pub const DEGRADED_RESPONSE: &str = "I'm sorry, the assistant is not available right now \
because no model provider could be initialised. Please try again later.";

/// Ordered turns of one session. Unbounded.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversationMemory {
    session_id: String,
    turns: Vec<ChatMessage>,
}

impl ConversationMemory {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            turns: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn turns(&self) -> &[ChatMessage] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    fn push_exchange(&mut self, user: &str, assistant: &str) {
        self.turns.push(ChatMessage::user(user));
        self.turns.push(ChatMessage::assistant(assistant));
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

/// A file attached to a turn.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub message: String,
    pub files: Vec<UploadedFile>,
}

impl TurnRequest {
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            files: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnStatus {
    Succeeded,
    Degraded,
    Failed,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TurnError {
    /// Machine-readable cause (`transport`, `status`, `malformed`,
    /// `validation`, `degraded`, ...).
    pub kind: String,
    pub message: String,
}

/// How one attached file was handled.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedFile {
    pub filename: String,
    pub file_type: Option<String>,
    pub preview: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnReply {
    pub status: TurnStatus,
    pub response: String,
    pub tools_used: Vec<String>,
    pub tool_count: usize,
    pub intent: Intent,
    pub binding: Option<ProviderBinding>,
    /// Model that produced the answer, when one did.
    pub model: Option<String>,
    pub session_id: String,
    pub memory_length: usize,
    pub processed_files: Vec<ProcessedFile>,
    pub error: Option<TurnError>,
}

impl TurnReply {
    pub fn succeeded(&self) -> bool {
        self.status == TurnStatus::Succeeded
    }
}

/// A turn whose answer arrives incrementally. Call
/// [`Orchestrator::finish_stream`] with the collected text once the
/// receiver closes.
pub struct StreamingTurn {
    pub binding: ProviderBinding,
    pub intent: Intent,
    pub receiver: mpsc::Receiver<Result<String, ProviderError>>,
    user_message: String,
}

struct Prepared {
    intent: Intent,
    prompt: String,
    attachments: Vec<Attachment>,
    processed: Vec<ProcessedFile>,
}

pub struct Orchestrator {
    memory: ConversationMemory,
    config: Config,
    text_model: String,
    router: Result<ModelRouter, ProviderError>,
    retrieval: Option<Arc<RetrievalManager>>,
    tools: Option<Arc<ToolRegistry>>,
}

impl Orchestrator {
    /// Build an orchestrator for `session_id`. Never fails; a router that
    /// cannot be constructed leaves the orchestrator degraded.
    pub fn new(
        session_id: impl Into<String>,
        config: &Config,
        credentials: Arc<dyn CredentialSource>,
        capabilities: &Capabilities,
        retrieval: Option<Arc<RetrievalManager>>,
    ) -> Self {
        let session_id = session_id.into();
        let router = ModelRouter::new(config, credentials, capabilities.secondary_provider);
        if let Err(e) = &router {
            error!(session = %session_id, error = %e, "router construction failed, session degraded");
        }

        Self {
            memory: ConversationMemory::new(session_id),
            config: config.clone(),
            text_model: config.models.default.clone(),
            router,
            retrieval,
            tools: None,
        }
    }

    /// Offer the tools of `registry` on non-streaming turns.
    pub fn with_tools(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.tools = Some(registry);
        self
    }

    /// Use `model` for text turns instead of `models.default`.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.text_model = model.into();
        self
    }

    pub fn session_id(&self) -> &str {
        self.memory.session_id()
    }

    pub fn text_model(&self) -> &str {
        &self.text_model
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    pub fn reset_memory(&mut self) {
        self.memory.clear();
    }

    pub fn is_degraded(&self) -> bool {
        self.router.is_err()
    }

    /// Process one turn to completion.
    pub async fn handle_turn(&mut self, req: TurnRequest) -> TurnReply {
        let intent = intent_of(&req);

        let router = match &self.router {
            Ok(r) => r,
            Err(e) => {
                let err = TurnError {
                    kind: "degraded".to_string(),
                    message: e.user_message(),
                };
                return self.reply(TurnStatus::Degraded, DEGRADED_RESPONSE.to_string(), intent, None, Some(err));
            }
        };

        if let Err(e) = validate(&req) {
            return self.reply(
                TurnStatus::Failed,
                e.user_message(),
                intent,
                None,
                Some(TurnError {
                    kind: e.kind().to_string(),
                    message: e.user_message(),
                }),
            );
        }

        let prepared = self.prepare(&req).await;
        let spec = self.spec_for(prepared.intent);
        let (binding, provider) = router.bind(&spec);
        info!(
            session = %self.memory.session_id(),
            intent = ?prepared.intent,
            provider = binding.provider_id.as_str(),
            model = %binding.resolved_model,
            reason = binding.reason.as_str(),
            "model bound"
        );

        let request = self.request_for(&binding, &provider, &prepared);
        let outcome = self.run(&provider, request).await;

        let mut reply = match outcome {
            Ok(completion) => {
                self.memory.push_exchange(&req.message, &completion.text);
                self.success(completion, prepared.intent, binding)
            }
            Err(e) => {
                error!(session = %self.memory.session_id(), error = %e, "turn failed");
                self.reply(
                    TurnStatus::Failed,
                    FAILURE_RESPONSE.to_string(),
                    prepared.intent,
                    Some(binding),
                    Some(TurnError {
                        kind: e.kind().to_string(),
                        message: format!("Agent execution failed: {}", e),
                    }),
                )
            }
        };
        reply.processed_files = prepared.processed;
        reply
    }

    /// Start a streamed turn. Streaming carries decoded file text but never
    /// raw attachments.
    ///
    /// # Errors
    ///
    /// Returns a finished [`TurnReply`] when the turn cannot stream at all
    /// (degraded, invalid input, or the stream could not be opened).
    pub async fn begin_stream(&mut self, req: TurnRequest) -> Result<StreamingTurn, TurnReply> {
        let intent = intent_of(&req);
        let router = match &self.router {
            Ok(r) => r,
            Err(e) => {
                let err = TurnError {
                    kind: "degraded".to_string(),
                    message: e.user_message(),
                };
                return Err(self.reply(TurnStatus::Degraded, DEGRADED_RESPONSE.to_string(), intent, None, Some(err)));
            }
        };
        if let Err(e) = validate(&req) {
            let err = TurnError {
                kind: e.kind().to_string(),
                message: e.user_message(),
            };
            return Err(self.reply(TurnStatus::Failed, e.user_message(), intent, None, Some(err)));
        }

        let mut prepared = self.prepare(&req).await;
        prepared.attachments.clear();
        let (binding, provider) = router.bind(&self.spec_for(prepared.intent));
        let request = self.request_for(&binding, &provider, &prepared);

        match provider.call_streaming(&request).await {
            Ok(receiver) => Ok(StreamingTurn {
                binding,
                intent: prepared.intent,
                receiver,
                user_message: req.message,
            }),
            Err(e) => {
                warn!(error = %e, "could not open stream");
                let err = TurnError {
                    kind: e.kind().to_string(),
                    message: format!("Agent execution failed: {}", e),
                };
                Err(self.reply(
                    TurnStatus::Failed,
                    FAILURE_RESPONSE.to_string(),
                    prepared.intent,
                    Some(binding),
                    Some(err),
                ))
            }
        }
    }

    /// Record a completed stream. Streams that produced no text or ended in
    /// an error are not remembered.
    pub fn finish_stream(&mut self, turn: &StreamingTurn, text: &str, failed: bool) -> usize {
        let text = text.trim();
        if !failed && !text.is_empty() {
            self.memory.push_exchange(&turn.user_message, text);
        }
        self.memory.len()
    }

    /// Execute `request`, answering tool calls until the model replies in
    /// text. `tools_used` on the result lists the executed tools.
    async fn run(&self, provider: &Provider, mut request: CompletionRequest) -> Result<Completion, ProviderError> {
        let registry = match &self.tools {
            Some(registry) if self.config.tools.enabled => registry,
            _ => return execute(provider, &request).await,
        };
        request.tools = registry.definitions();
        if request.tools.is_empty() {
            return execute(provider, &request).await;
        }

        let max_rounds = self.config.tools.max_rounds;
        let mut executed: Vec<String> = Vec::new();
        let mut round = 0;
        loop {
            let mut completion = execute(provider, &request).await?;
            if completion.tool_calls.is_empty() || round == max_rounds {
                if completion.text.is_empty() {
                    return Err(ProviderError::Malformed(
                        "no answer after tool calls".to_string(),
                    ));
                }
                completion.tools_used = executed;
                return Ok(completion);
            }

            round += 1;
            request.messages.push(ChatMessage::assistant_tool_calls(
                completion.text.clone(),
                completion.tool_calls.clone(),
            ));
            for call in &completion.tool_calls {
                let outcome = registry.invoke(call).await;
                info!(
                    session = %self.memory.session_id(),
                    tool = %outcome.name,
                    ok = outcome.ok,
                    round,
                    "tool executed"
                );
                executed.push(outcome.name);
                request.messages.push(ChatMessage::tool(call.id.clone(), outcome.output));
            }
            // File content is already in the prompt; resend it only once.
            request.attachments.clear();
            if round == max_rounds {
                request.tools.clear();
            }
        }
    }

    fn spec_for(&self, intent: Intent) -> ModelSpec {
        match intent {
            Intent::Text => ModelSpec::text(self.text_model.clone()),
            Intent::File => ModelSpec::file(self.config.models.file.clone()),
        }
    }

    fn request_for(
        &self,
        binding: &ProviderBinding,
        provider: &Provider,
        prepared: &Prepared,
    ) -> CompletionRequest {
        let mut messages = Vec::with_capacity(self.memory.len() + 2);
        if !self.config.generation.system_prompt.trim().is_empty() {
            messages.push(ChatMessage::system(self.config.generation.system_prompt.clone()));
        }
        messages.extend(self.memory.turns().iter().cloned());
        messages.push(ChatMessage::user(prepared.prompt.clone()));

        let attachments = if self.config.models.attach_files && provider.supports_files() {
            prepared.attachments.clone()
        } else {
            Vec::new()
        };

        CompletionRequest {
            model: binding.resolved_model.clone(),
            messages,
            params: GenerationParams::from_config(&self.config.generation),
            attachments,
            tools: Vec::new(),
        }
    }

    async fn prepare(&self, req: &TurnRequest) -> Prepared {
        let intent = intent_of(req);
        let mut parts: Vec<String> = Vec::new();
        let mut attachments = Vec::new();
        let mut processed = Vec::new();

        if !req.files.is_empty() {
            for file in &req.files {
                match decode_file(&file.filename, file.content_type.as_deref(), &file.bytes) {
                    Ok(decoded) => {
                        parts.push(format!(
                            "=== File: {} ({}) ===\nPreview: {}\nContent:\n{}\n{}",
                            file.filename,
                            decoded.kind.as_str().to_uppercase(),
                            decoded.preview,
                            decoded.text,
                            "=".repeat(50)
                        ));
                        attachments.push(Attachment {
                            filename: file.filename.clone(),
                            bytes: file.bytes.clone(),
                            mime_type: file
                                .content_type
                                .clone()
                                .unwrap_or_else(|| decoded.kind.mime_type().to_string()),
                        });
                        self.offer_to_retrieval(&file.filename, &decoded.text, decoded.kind.as_str())
                            .await;
                        processed.push(ProcessedFile {
                            filename: file.filename.clone(),
                            file_type: Some(decoded.kind.as_str().to_string()),
                            preview: Some(decoded.preview),
                            error: None,
                        });
                    }
                    Err(e) => {
                        warn!(file = %file.filename, error = %e, "could not decode attachment");
                        parts.push(failure_line(&file.filename, &e));
                        processed.push(ProcessedFile {
                            filename: file.filename.clone(),
                            file_type: None,
                            preview: None,
                            error: Some(e.to_string()),
                        });
                    }
                }
            }
        } else if let Some(retrieval) = &self.retrieval {
            let context = retrieval.retrieval_context(&req.message).await;
            if !context.is_empty() {
                debug!(session = %self.memory.session_id(), "added retrieval context");
                parts.push(context);
            }
        }

        let prompt = if parts.is_empty() {
            req.message.clone()
        } else {
            parts.push(format!("User message: {}", req.message));
            parts.join("\n\n")
        };

        Prepared {
            intent,
            prompt,
            attachments,
            processed,
        }
    }

    async fn offer_to_retrieval(&self, filename: &str, text: &str, kind: &str) {
        let Some(retrieval) = &self.retrieval else {
            return;
        };
        let metadata = serde_json::json!({ "file_type": kind });
        let outcome = retrieval.embed_and_store(text, filename, metadata).await;
        if outcome.embedded() {
            debug!(file = %filename, chunks = outcome.chunks, "attachment indexed");
        } else if let Some(e) = &outcome.local_error {
            error!(file = %filename, error = %e, "attachment indexing failed");
        } else {
            debug!(file = %filename, "attachment not indexed");
        }
    }

    fn success(&self, completion: Completion, intent: Intent, binding: ProviderBinding) -> TurnReply {
        let tool_count = completion.tools_used.len();
        TurnReply {
            status: TurnStatus::Succeeded,
            response: completion.text,
            tools_used: completion.tools_used,
            tool_count,
            intent,
            binding: Some(binding),
            model: Some(completion.model),
            session_id: self.memory.session_id().to_string(),
            memory_length: self.memory.len(),
            processed_files: Vec::new(),
            error: None,
        }
    }

    fn reply(
        &self,
        status: TurnStatus,
        response: String,
        intent: Intent,
        binding: Option<ProviderBinding>,
        error: Option<TurnError>,
    ) -> TurnReply {
        TurnReply {
            status,
            response,
            tools_used: Vec::new(),
            tool_count: 0,
            intent,
            binding,
            model: None,
            session_id: self.memory.session_id().to_string(),
            memory_length: self.memory.len(),
            processed_files: Vec::new(),
            error,
        }
    }
}

fn intent_of(req: &TurnRequest) -> Intent {
    if req.files.is_empty() {
        Intent::Text
    } else {
        Intent::File
    }
}

fn validate(req: &TurnRequest) -> Result<(), ProviderError> {
    if req.message.trim().is_empty() && req.files.is_empty() {
        return Err(ProviderError::Invalid(
            "message must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Async attempt, then one blocking retry for retryable failures.
async fn execute(provider: &Provider, req: &CompletionRequest) -> Result<Completion, ProviderError> {
    match provider.call(req).await {
        Ok(c) => Ok(c),
        Err(e) if !e.is_retryable() => Err(e),
        Err(e) => {
            warn!(error = %e, "async call failed, retrying once with the blocking client");
            provider.call_blocking(req).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::check_capabilities;
    use crate::router::StaticCredentials;

    fn orchestrator(config: &Config) -> Orchestrator {
        let creds: Arc<dyn CredentialSource> = Arc::new(StaticCredentials::new());
        let caps = check_capabilities(config, creds.as_ref());
        Orchestrator::new("s1", config, creds, &caps, None)
    }

    #[tokio::test]
    async fn broken_primary_endpoint_degrades_every_turn() {
        let mut cfg = Config::minimal();
        cfg.providers.primary.base_url = "not a url".to_string();
        let mut orch = orchestrator(&cfg);
        assert!(orch.is_degraded());

        for _ in 0..2 {
            let reply = orch.handle_turn(TurnRequest::text("hello")).await;
            assert_eq!(reply.status, TurnStatus::Degraded);
            assert_eq!(reply.response, DEGRADED_RESPONSE);
            assert_eq!(reply.memory_length, 0);
        }
    }

    #[tokio::test]
    async fn empty_message_fails_validation_without_memory() {
        let mut orch = orchestrator(&Config::minimal());
        let reply = orch.handle_turn(TurnRequest::text("   ")).await;
        assert_eq!(reply.status, TurnStatus::Failed);
        assert_eq!(reply.error.as_ref().map(|e| e.kind.as_str()), Some("validation"));
        assert!(reply.response.starts_with(crate::error::ERROR_PREFIX));
        assert!(orch.memory().is_empty());
    }

    #[tokio::test]
    async fn unreachable_gateway_fails_and_leaves_memory_untouched() {
        let mut cfg = Config::minimal();
        cfg.providers.primary.base_url = "http://127.0.0.1:9/v1/chat/completions".to_string();
        cfg.generation.timeout_secs = 2;
        let mut orch = orchestrator(&cfg);

        let reply = orch.handle_turn(TurnRequest::text("What is 2+2?")).await;
        assert_eq!(reply.status, TurnStatus::Failed);
        assert_eq!(reply.response, FAILURE_RESPONSE);
        let err = reply.error.unwrap();
        assert_eq!(err.kind, "transport");
        assert!(err.message.starts_with("Agent execution failed:"));
        assert_eq!(orch.memory().len(), 0);
    }

    #[test]
    fn file_turns_use_the_file_model() {
        let orch = orchestrator(&Config::minimal());
        assert_eq!(orch.spec_for(Intent::Text).name(), "google/gemini-2.5-flash");
        assert_eq!(orch.spec_for(Intent::File).name(), "google/gemma-3-27b-it");
        assert_eq!(orch.spec_for(Intent::File).intent(), Intent::File);
    }

    #[tokio::test]
    async fn undecodable_file_becomes_bracketed_line() {
        let orch = orchestrator(&Config::minimal());
        let req = TurnRequest {
            message: "summarise".to_string(),
            files: vec![UploadedFile {
                filename: "empty.txt".to_string(),
                content_type: None,
                bytes: Vec::new(),
            }],
        };
        let prepared = orch.prepare(&req).await;
        assert_eq!(prepared.intent, Intent::File);
        assert!(prepared.prompt.starts_with("[File empty.txt: Empty file]"));
        assert!(prepared.prompt.ends_with("User message: summarise"));
        assert!(prepared.attachments.is_empty());
        assert!(prepared.processed[0].error.is_some());
    }
}
