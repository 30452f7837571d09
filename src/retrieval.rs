//! Unified retrieval over the local index and the optional remote store.
//!
//! | Operation | Backends |
//! |-----------|----------|
//! | [`RetrievalManager::embed_and_store`] | remote first, local on any remote failure |
//! | [`RetrievalManager::search`] / [`RetrievalManager::retrieval_context`] | local only |
//! | [`RetrievalManager::search_remote`] | remote only (administrative path) |
//! | [`RetrievalManager::stats`] | both, merged additively |
//!
//! Writes are not transactional across backends. A remote write that fails
//! part-way is not rolled back; the whole document is then written locally.
//! This includes an embedding dimension mismatch, which is logged as an
//! error because it means the two stores are configured inconsistently.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use llm_relay_core::chunk::SplitParams;
use llm_relay_core::embedding::Embedder;
use llm_relay_core::models::RetrievalResult;

use crate::config::{Config, RetrievalConfig};
use crate::embedding::create_embedder;
use crate::error::StoreError;
use crate::local_store::{LocalStats, LocalStore};
use crate::remote_store::{NewRecord, RemoteMatch, RemoteStats, RemoteStore, SearchMode};
use crate::router::CredentialSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Remote,
    Local,
}

/// Result of [`RetrievalManager::embed_and_store`].
#[derive(Debug, Clone, Serialize)]
pub struct StoreOutcome {
    /// Where the chunks ended up; `None` when neither backend accepted them.
    pub backend: Option<Backend>,
    pub chunks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_error: Option<String>,
}

impl StoreOutcome {
    pub fn embedded(&self) -> bool {
        self.backend.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalStats {
    pub total_chunks: usize,
    pub local_chunks: usize,
    pub remote_chunks: usize,
    /// Local sources in first-seen order, then remote-only documents.
    pub sources: Vec<String>,
    pub local: LocalStats,
    pub remote: Option<RemoteStats>,
    pub remote_mode: Option<SearchMode>,
    pub remote_error: Option<String>,
}

pub struct RetrievalManager {
    local: LocalStore,
    remote: Option<RemoteStore>,
    remote_note: Option<String>,
    index_dir: Option<PathBuf>,
    save_lock: tokio::sync::Mutex<()>,
    context_chunks: usize,
    context_min_score: f32,
}

impl RetrievalManager {
    pub fn new(local: LocalStore, remote: Option<RemoteStore>, config: &RetrievalConfig) -> Self {
        Self {
            local,
            remote,
            remote_note: None,
            index_dir: config.index_dir.clone(),
            save_lock: tokio::sync::Mutex::new(()),
            context_chunks: config.context_chunks,
            context_min_score: config.context_min_score,
        }
    }

    /// Build the embedder and both stores from configuration.
    ///
    /// A saved local index under `retrieval.index_dir` is loaded if present.
    /// A remote store that is unconfigured, unkeyed, or unreachable leaves
    /// the manager local-only; the reason is reported by [`Self::stats`].
    pub async fn from_config(config: &Config, credentials: &dyn CredentialSource) -> Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        Self::with_embedder(config, credentials, embedder).await
    }

    /// [`Self::from_config`] with an already constructed embedder.
    pub async fn with_embedder(
        config: &Config,
        credentials: &dyn CredentialSource,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        let local = LocalStore::new(
            embedder,
            SplitParams {
                chunk_size: config.chunking.chunk_size,
                chunk_overlap: config.chunking.chunk_overlap,
            },
        );
        if let Some(dir) = &config.retrieval.index_dir {
            local.load(dir);
        }

        let (remote, note) = match &config.remote_store {
            None => (None, Some("remote store not configured".to_string())),
            Some(remote_cfg) => match credentials.secret(&remote_cfg.api_key_env) {
                None => {
                    warn!(env = %remote_cfg.api_key_env, "remote store key missing, running local-only");
                    (None, Some(format!("{} is not set", remote_cfg.api_key_env)))
                }
                Some(key) => match RemoteStore::connect(remote_cfg, key).await {
                    Ok(store) => (Some(store), None),
                    Err(e) => {
                        warn!(error = %e, "remote store unavailable, running local-only");
                        (None, Some(e.to_string()))
                    }
                },
            },
        };

        let mut manager = Self::new(local, remote, &config.retrieval);
        manager.remote_note = note;
        Ok(manager)
    }

    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    pub fn remote(&self) -> Option<&RemoteStore> {
        self.remote.as_ref()
    }

    /// Split, embed, and store `text` under `source`.
    ///
    /// `metadata` is merged into each remote row's metadata next to
    /// `filename`, `chunk_index`, and `total_chunks`. Every failure is
    /// reported in the returned [`StoreOutcome`]; a failed remote write is
    /// always followed by a local attempt.
    pub async fn embed_and_store(&self, text: &str, source: &str, metadata: Value) -> StoreOutcome {
        let pieces = match self.local.embed_windows(text, source).await {
            Ok(p) => p,
            Err(e) => {
                warn!(source, error = %e, "embedding failed, nothing stored");
                return StoreOutcome {
                    backend: None,
                    chunks: 0,
                    remote_error: None,
                    local_error: Some(format!("{:#}", e)),
                };
            }
        };
        if pieces.is_empty() {
            return StoreOutcome {
                backend: None,
                chunks: 0,
                remote_error: None,
                local_error: None,
            };
        }

        let mut remote_error = None;
        if let Some(remote) = &self.remote {
            match store_remote(remote, &pieces, source, &metadata).await {
                Ok(()) => {
                    info!(source, chunks = pieces.len(), "stored in remote store");
                    return StoreOutcome {
                        backend: Some(Backend::Remote),
                        chunks: pieces.len(),
                        remote_error: None,
                        local_error: None,
                    };
                }
                Err(e @ StoreError::DimensionMismatch { .. }) => {
                    error!(source, error = %e, "remote store dimension mismatch, falling back to local index");
                    remote_error = Some(e.to_string());
                }
                Err(e) => {
                    warn!(source, error = %e, "remote store failed, falling back to local index");
                    remote_error = Some(e.to_string());
                }
            }
        }

        let chunks = self.local.append(source, pieces).len();
        let local_error = self.save_local().await.err().map(|e| format!("{:#}", e));
        info!(source, chunks, "stored in local index");
        StoreOutcome {
            backend: Some(Backend::Local),
            chunks,
            remote_error,
            local_error,
        }
    }

    /// Top-`k` local chunks for `query`.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<RetrievalResult>> {
        self.local.query(query, k).await
    }

    /// A context block of the best local chunks scoring at least
    /// `retrieval.context_min_score`. Empty when nothing qualifies; search
    /// failures are logged and also yield an empty block.
    pub async fn retrieval_context(&self, query: &str) -> String {
        if self.local.is_empty() {
            return String::new();
        }
        let results = match self.search(query, self.context_chunks).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "retrieval context unavailable");
                return String::new();
            }
        };
        format_context(&results, self.context_min_score)
    }

    /// Search the remote store directly.
    pub async fn search_remote(
        &self,
        query: &str,
        k: usize,
        threshold: Option<f32>,
    ) -> Result<Vec<RemoteMatch>, StoreError> {
        let remote = self.remote.as_ref().ok_or_else(|| {
            StoreError::Unavailable(
                self.remote_note
                    .clone()
                    .unwrap_or_else(|| "remote store not configured".to_string()),
            )
        })?;
        let vector = self
            .local
            .embedder()
            .embed_one(query)
            .await
            .map_err(|e| StoreError::Request(format!("query embedding failed: {:#}", e)))?;
        remote.similarity_search(&vector, k, threshold).await
    }

    pub async fn stats(&self) -> RetrievalStats {
        let local = self.local.stats();

        let (remote, remote_error) = match &self.remote {
            Some(store) => match store.stats().await {
                Ok(s) => (Some(s), None),
                Err(e) => {
                    warn!(error = %e, "remote stats unavailable");
                    (None, Some(e.to_string()))
                }
            },
            None => (None, self.remote_note.clone()),
        };

        let remote_chunks = remote.as_ref().map_or(0, |r| r.total_embeddings);
        let mut sources: Vec<String> = local.sources.iter().map(|s| s.source.clone()).collect();
        if let Some(r) = &remote {
            for doc in &r.documents {
                if !sources.contains(doc) {
                    sources.push(doc.clone());
                }
            }
        }

        RetrievalStats {
            total_chunks: local.total_chunks + remote_chunks,
            local_chunks: local.total_chunks,
            remote_chunks,
            sources,
            remote_mode: self.remote.as_ref().map(RemoteStore::mode),
            local,
            remote,
            remote_error,
        }
    }

    /// Save the local index to `retrieval.index_dir`, if configured.
    pub fn persist(&self) -> Result<()> {
        match &self.index_dir {
            Some(dir) => self.local.persist(dir),
            None => Ok(()),
        }
    }

    /// Save the local index off the async runtime. Saves are serialised
    /// so two ingests never write the same temporary file at once.
    async fn save_local(&self) -> Result<()> {
        let Some(dir) = self.index_dir.clone() else {
            return Ok(());
        };
        let _guard = self.save_lock.lock().await;
        let saved = self.local.snapshot();
        let result = tokio::task::spawn_blocking(move || saved.write_to(&dir)).await?;
        if let Err(e) = &result {
            warn!(error = %e, "failed to save local index");
        }
        result
    }
}

/// Write every window as a remote row. Chunk indexes continue after the
/// highest one already stored for `source`.
async fn store_remote(
    remote: &RemoteStore,
    pieces: &[(String, Vec<f32>)],
    source: &str,
    metadata: &Value,
) -> Result<(), StoreError> {
    if let Some((_, embedding)) = pieces.first() {
        remote.check_dims(embedding)?;
    }
    let start = remote.next_chunk_index(source).await?;
    let total = pieces.len();
    for (i, (content, embedding)) in pieces.iter().enumerate() {
        let chunk_index = start + i as i64;
        let mut meta = serde_json::json!({
            "filename": source,
            "chunk_index": chunk_index,
            "total_chunks": total,
        });
        if let (Some(target), Some(extra)) = (meta.as_object_mut(), metadata.as_object()) {
            for (key, value) in extra {
                target.insert(key.clone(), value.clone());
            }
        }

        let id = remote
            .store(NewRecord {
                content,
                embedding,
                metadata: meta,
                document_id: Some(source),
                chunk_index,
            })
            .await?;
        debug!(source, chunk = chunk_index, id = %id, "stored remote chunk");
    }
    Ok(())
}

/// Render retrieval results as a prompt context block.
pub fn format_context(results: &[RetrievalResult], min_score: f32) -> String {
    let kept: Vec<&RetrievalResult> = results.iter().filter(|r| r.score >= min_score).collect();
    if kept.is_empty() {
        return String::new();
    }

    let mut out = String::from("=== RELEVANT FILE CONTEXT ===\n\n");
    for (i, r) in kept.iter().enumerate() {
        out.push_str(&format!(
            "[Context {} from {} (similarity: {:.3})]\n{}\n\n",
            i + 1,
            r.chunk.source,
            r.score,
            r.chunk.content
        ));
    }
    out.push_str("=== END FILE CONTEXT ===\n");
    out
}
