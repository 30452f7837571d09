use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub db: DbConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub remote_store: Option<RemoteStoreConfig>,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub primary: PrimaryConfig,
    #[serde(default)]
    pub secondary: SecondaryConfig,
}

/// The always-available gateway. Has no credential precondition.
#[derive(Debug, Deserialize, Clone)]
pub struct PrimaryConfig {
    #[serde(default = "default_primary_url")]
    pub base_url: String,
    /// Inline key; takes precedence over `api_key_env`.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_primary_key_env")]
    pub api_key_env: String,
    /// Lowercase substrings that pin a model name to this gateway.
    #[serde(default = "default_markers")]
    pub markers: Vec<String>,
    #[serde(default = "default_referer")]
    pub referer: String,
    #[serde(default = "default_title")]
    pub title: String,
}

impl Default for PrimaryConfig {
    fn default() -> Self {
        Self {
            base_url: default_primary_url(),
            api_key: None,
            api_key_env: default_primary_key_env(),
            markers: default_markers(),
            referer: default_referer(),
            title: default_title(),
        }
    }
}

fn default_primary_url() -> String {
    "https://openrouter.ai/api/v1/chat/completions".to_string()
}
fn default_primary_key_env() -> String {
    "OPENROUTER_API_KEY".to_string()
}
fn default_markers() -> Vec<String> {
    vec![
        "google".to_string(),
        "mistral".to_string(),
        "openrouter".to_string(),
    ]
}
fn default_referer() -> String {
    "http://localhost".to_string()
}
fn default_title() -> String {
    "llm-relay".to_string()
}

/// The credentialed gateway. Requests fall back to the primary when it
/// is disabled, unkeyed, or cannot be constructed for a model.
#[derive(Debug, Deserialize, Clone)]
pub struct SecondaryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_secondary_url")]
    pub base_url: String,
    #[serde(default = "default_secondary_key_env")]
    pub api_key_env: String,
    /// Models this client cannot serve with the standard request options.
    #[serde(default = "default_unsupported_models")]
    pub unsupported_models: Vec<String>,
}

impl Default for SecondaryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_secondary_url(),
            api_key_env: default_secondary_key_env(),
            unsupported_models: default_unsupported_models(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_secondary_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}
fn default_secondary_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_unsupported_models() -> Vec<String> {
    vec!["o1-preview".to_string(), "o1-mini".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelsConfig {
    #[serde(default = "default_text_model")]
    pub default: String,
    /// Model used on the primary gateway when files are attached.
    #[serde(default = "default_file_model")]
    pub file: String,
    /// Second model tried once when a file-attachment call fails.
    #[serde(default = "default_fallback_file_model")]
    pub fallback_file: Option<String>,
    /// Send raw attachments with the file-parser plugin in addition to
    /// decoded text.
    #[serde(default)]
    pub attach_files: bool,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            default: default_text_model(),
            file: default_file_model(),
            fallback_file: default_fallback_file_model(),
            attach_files: false,
        }
    }
}

fn default_text_model() -> String {
    "google/gemini-2.5-flash".to_string()
}
fn default_file_model() -> String {
    "google/gemma-3-27b-it".to_string()
}
fn default_fallback_file_model() -> Option<String> {
    Some("openchat/openchat-3.5-1210".to_string())
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,
    /// Defaults to twice `timeout_secs`.
    #[serde(default)]
    pub file_timeout_secs: Option<u64>,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_generation_timeout(),
            file_timeout_secs: None,
            stop: Vec::new(),
            system_prompt: default_system_prompt(),
        }
    }
}

impl GenerationConfig {
    pub fn file_timeout_secs(&self) -> u64 {
        self.file_timeout_secs.unwrap_or(self.timeout_secs * 2)
    }
}

fn default_temperature() -> f32 {
    0.3
}
fn default_max_tokens() -> u32 {
    1500
}
fn default_generation_timeout() -> u64 {
    30
}
fn default_system_prompt() -> String {
    "You are a helpful assistant. Answer clearly and concisely. When file \
     contents or retrieved context are provided, ground your answer in them."
        .to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_embedding_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            api_key_env: default_embedding_key_env(),
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_embedding_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Directory the local index is persisted to. `None` keeps it in memory.
    #[serde(default)]
    pub index_dir: Option<PathBuf>,
    #[serde(default = "default_context_chunks")]
    pub context_chunks: usize,
    #[serde(default = "default_context_min_score")]
    pub context_min_score: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            index_dir: None,
            context_chunks: default_context_chunks(),
            context_min_score: default_context_min_score(),
        }
    }
}

fn default_context_chunks() -> usize {
    3
}
fn default_context_min_score() -> f32 {
    0.1
}

/// PostgREST-style vector store (`[remote_store]`).
#[derive(Debug, Deserialize, Clone)]
pub struct RemoteStoreConfig {
    pub url: String,
    #[serde(default = "default_remote_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_remote_table")]
    pub table: String,
    #[serde(default = "default_match_function")]
    pub match_function: String,
    #[serde(default = "default_remote_dims")]
    pub dims: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_remote_key_env() -> String {
    "SUPABASE_KEY".to_string()
}
fn default_remote_table() -> String {
    "document_embeddings".to_string()
}
fn default_match_function() -> String {
    "match_documents".to_string()
}
fn default_remote_dims() -> usize {
    1536
}
fn default_similarity_threshold() -> f32 {
    0.7
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionsConfig {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
        }
    }
}

fn default_max_sessions() -> usize {
    50
}

/// Model-callable tools (`add_reminder`, `list_reminders`, `summarize_file`).
#[derive(Debug, Deserialize, Clone)]
pub struct ToolsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Completion rounds that may answer with tool calls before the turn
    /// gives up.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_rounds: default_max_rounds(),
        }
    }
}

fn default_max_rounds() -> usize {
    3
}

impl Config {
    /// Configuration for commands that can run without a config file.
    pub fn minimal() -> Self {
        Self {
            server: ServerConfig {
                bind: "127.0.0.1:8000".to_string(),
            },
            db: DbConfig {
                path: PathBuf::from("./data/relay.sqlite"),
            },
            providers: ProvidersConfig::default(),
            models: ModelsConfig::default(),
            generation: GenerationConfig::default(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            remote_store: None,
            sessions: SessionsConfig::default(),
            tools: ToolsConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Chunking
    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.chunk_overlap must be smaller than chunking.chunk_size");
    }

    // Generation
    if !(0.0..=2.0).contains(&config.generation.temperature) {
        anyhow::bail!("generation.temperature must be in [0.0, 2.0]");
    }
    if config.generation.max_tokens == 0 {
        anyhow::bail!("generation.max_tokens must be > 0");
    }

    if config.sessions.max_sessions == 0 {
        anyhow::bail!("sessions.max_sessions must be >= 1");
    }
    if config.tools.enabled && config.tools.max_rounds == 0 {
        anyhow::bail!("tools.max_rounds must be >= 1 when tools are enabled");
    }

    // Embedding
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }
    if config.embedding.is_enabled() && config.embedding.provider != "local" {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    if let Some(remote) = &config.remote_store {
        if remote.dims == 0 {
            anyhow::bail!("remote_store.dims must be > 0");
        }
        if !(-1.0..=1.0).contains(&remote.similarity_threshold) {
            anyhow::bail!("remote_store.similarity_threshold must be in [-1.0, 1.0]");
        }
    }

    Ok(())
}
