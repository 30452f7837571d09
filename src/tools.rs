//! Tools the model may call during a turn.
//!
//! Every tool implements [`Tool`]. The [`ToolRegistry`] advertises the
//! tools whose backing services are present (as the request `tools` array)
//! and dispatches the model's `tool_calls` to them.
//!
//! | Tool | Needs | Does |
//! |------|-------|------|
//! | `add_reminder` | database | Create a reminder |
//! | `list_reminders` | database | Open (or all) reminders in due order |
//! | `summarize_file` | nothing; retrieval for stored documents | Word count, key points, dates, keywords |
//!
//! A failing tool does not fail the turn: its error is returned to the
//! model as `{"error": "..."}`.

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use llm_relay_core::models::ToolCall;

use crate::reminders::{self, NewReminder};
use crate::retrieval::RetrievalManager;

/// A tool as advertised to the model.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
}

/// Services a tool may use. Either may be absent.
#[derive(Clone, Default)]
pub struct ToolContext {
    pub pool: Option<SqlitePool>,
    pub retrieval: Option<Arc<RetrievalManager>>,
}

impl ToolContext {
    fn pool(&self) -> Result<&SqlitePool> {
        self.pool
            .as_ref()
            .ok_or_else(|| anyhow!("reminder storage is not available"))
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters_schema(&self) -> Value;

    /// Whether `ctx` has what this tool needs. Unavailable tools are not
    /// advertised.
    fn available(&self, _ctx: &ToolContext) -> bool {
        true
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value>;
}

/// Result of one dispatched call.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub name: String,
    /// JSON text sent back to the model.
    pub output: String,
    pub ok: bool,
}

pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    ctx: ToolContext,
}

impl ToolRegistry {
    pub fn new(ctx: ToolContext) -> Self {
        Self {
            tools: Vec::new(),
            ctx,
        }
    }

    /// A registry with `add_reminder`, `list_reminders` and `summarize_file`.
    pub fn builtin(ctx: ToolContext) -> Self {
        let mut registry = Self::new(ctx);
        registry.register(Arc::new(AddReminderTool));
        registry.register(Arc::new(ListRemindersTool));
        registry.register(Arc::new(SummarizeFileTool));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    /// Definitions of the tools usable with this registry's context.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .filter(|t| t.available(&self.ctx))
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    /// Run one model-issued call. Never fails; errors become the output.
    pub async fn invoke(&self, call: &ToolCall) -> ToolOutcome {
        let name = call.function.name.clone();
        let result = self.dispatch(call).await;
        match result {
            Ok(value) => {
                debug!(tool = %name, "tool call succeeded");
                ToolOutcome {
                    name,
                    output: value.to_string(),
                    ok: true,
                }
            }
            Err(e) => {
                warn!(tool = %name, error = %e, "tool call failed");
                ToolOutcome {
                    name,
                    output: json!({ "error": format!("{:#}", e) }).to_string(),
                    ok: false,
                }
            }
        }
    }

    async fn dispatch(&self, call: &ToolCall) -> Result<Value> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.name() == call.function.name && t.available(&self.ctx))
            .ok_or_else(|| anyhow!("unknown tool: {}", call.function.name))?;

        let raw = call.function.arguments.trim();
        let params: Value = if raw.is_empty() {
            json!({})
        } else {
            serde_json::from_str(raw).map_err(|e| anyhow!("arguments are not valid JSON: {}", e))?
        };
        if !params.is_object() {
            bail!("arguments must be a JSON object");
        }
        tool.execute(params, &self.ctx).await
    }
}

fn str_param<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params[key].as_str().map(str::trim).filter(|s| !s.is_empty())
}

// ============ add_reminder ============

pub struct AddReminderTool;

#[async_trait]
impl Tool for AddReminderTool {
    fn name(&self) -> &str {
        "add_reminder"
    }

    fn description(&self) -> &str {
        "Create a reminder or task with a due date. Use when the user asks to be reminded, \
         to set a deadline, or to schedule something."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": { "type": "string", "description": "What to be reminded of" },
                "date": { "type": "string", "description": "Due date, YYYY-MM-DD. Defaults to today." },
                "time": { "type": "string", "description": "Due time, HH:MM (24h). Defaults to 09:00." },
                "priority": { "type": "string", "enum": ["high", "medium", "low"] },
                "description": { "type": "string" },
                "category": { "type": "string" }
            },
            "required": ["title"]
        })
    }

    fn available(&self, ctx: &ToolContext) -> bool {
        ctx.pool.is_some()
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let pool = ctx.pool()?;
        let title = str_param(&params, "title").ok_or_else(|| anyhow!("title is required"))?;
        let date = str_param(&params, "date")
            .map(str::to_string)
            .unwrap_or_else(|| chrono::Local::now().date_naive().format("%Y-%m-%d").to_string());

        let mut new = NewReminder::new(title, date);
        if let Some(time) = str_param(&params, "time") {
            new.time = time.to_string();
        }
        if let Some(priority) = str_param(&params, "priority") {
            new.priority = priority.to_lowercase();
        }
        if let Some(description) = str_param(&params, "description") {
            new.description = description.to_string();
        }
        if let Some(category) = str_param(&params, "category") {
            new.category = category.to_string();
        }

        let reminder = reminders::create(pool, new).await?;
        Ok(json!({
            "message": format!(
                "Reminder '{}' created for {} at {} (ID: {})",
                reminder.title, reminder.date, reminder.time, reminder.id
            ),
            "reminder": reminder,
        }))
    }
}

// ============ list_reminders ============

pub struct ListRemindersTool;

const DEFAULT_LIST_LIMIT: usize = 20;

#[async_trait]
impl Tool for ListRemindersTool {
    fn name(&self) -> &str {
        "list_reminders"
    }

    fn description(&self) -> &str {
        "List the user's reminders and tasks in due-date order."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "include_completed": { "type": "boolean", "default": false },
                "limit": { "type": "integer", "default": DEFAULT_LIST_LIMIT }
            },
            "required": []
        })
    }

    fn available(&self, ctx: &ToolContext) -> bool {
        ctx.pool.is_some()
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let pool = ctx.pool()?;
        let include_completed = params["include_completed"].as_bool().unwrap_or(false);
        let limit = params["limit"]
            .as_u64()
            .map(|l| l as usize)
            .unwrap_or(DEFAULT_LIST_LIMIT);

        let listed: Vec<_> = reminders::list_all(pool)
            .await?
            .into_iter()
            .filter(|r| include_completed || !r.completed)
            .take(limit)
            .collect();
        Ok(json!({ "count": listed.len(), "reminders": listed }))
    }
}

// ============ summarize_file ============

pub struct SummarizeFileTool;

const IMPORTANT_KEYWORDS: &[&str] = &["deadline", "urgent", "important", "critical", "asap", "priority"];

#[async_trait]
impl Tool for SummarizeFileTool {
    fn name(&self) -> &str {
        "summarize_file"
    }

    fn description(&self) -> &str {
        "Summarise a document: word count, key sentences, dates and important keywords. \
         Pass the name of an uploaded document as `source`, or raw text as `content`."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "source": { "type": "string", "description": "Name of a stored document" },
                "content": { "type": "string", "description": "Text to summarise" }
            },
            "required": []
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let (label, text) = match (str_param(&params, "source"), str_param(&params, "content")) {
            (Some(source), _) => (source.to_string(), stored_text(ctx, source).await?),
            (None, Some(content)) => ("content".to_string(), content.to_string()),
            (None, None) => bail!("pass either source or content"),
        };
        let summary = summarize_text(&text)?;
        Ok(json!({ "source": label, "summary": summary }))
    }
}

async fn stored_text(ctx: &ToolContext, source: &str) -> Result<String> {
    let retrieval = ctx
        .retrieval
        .as_ref()
        .ok_or_else(|| anyhow!("document storage is not available"))?;
    if let Some(text) = retrieval.local().source_text(source) {
        return Ok(text);
    }
    if let Some(remote) = retrieval.remote() {
        let chunks = remote.document_chunks(source).await?;
        if !chunks.is_empty() {
            let parts: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
            return Ok(parts.join("\n"));
        }
    }
    bail!("no stored document named '{}'", source)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TextSummary {
    pub word_count: usize,
    /// First, middle and last sentence, without repeats.
    pub key_points: Vec<String>,
    pub dates: Vec<String>,
    pub keywords: Vec<String>,
}

pub fn summarize_text(text: &str) -> Result<TextSummary> {
    if text.trim().chars().count() < 10 {
        bail!("content too short to summarise");
    }

    let sentences: Vec<&str> = text
        .split(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    let mut key_points: Vec<String> = Vec::new();
    if sentences.len() > 1 {
        for i in [0, sentences.len() / 2, sentences.len() - 1] {
            let sentence = sentences[i].to_string();
            if !key_points.contains(&sentence) {
                key_points.push(sentence);
            }
        }
    }

    let mut dates: Vec<String> = Vec::new();
    for token in text.split_whitespace() {
        let token = token.trim_matches(|c: char| !c.is_ascii_alphanumeric());
        let parsed = NaiveDate::parse_from_str(token, "%Y-%m-%d")
            .or_else(|_| NaiveDate::parse_from_str(token, "%m/%d/%Y"));
        if parsed.is_ok() && !dates.iter().any(|d| d == token) && dates.len() < 3 {
            dates.push(token.to_string());
        }
    }

    let lower = text.to_lowercase();
    let keywords = IMPORTANT_KEYWORDS
        .iter()
        .filter(|k| lower.contains(*k))
        .map(|k| k.to_string())
        .collect();

    Ok(TextSummary {
        word_count: text.split_whitespace().count(),
        key_points,
        dates,
        keywords,
    })
}
