//! In-process retrieval store.
//!
//! Splits text with the core splitter, embeds each window through the
//! configured [`Embedder`], and appends the results to an
//! [`InMemoryIndex`]. The index can be saved to and restored from a
//! directory:
//!
//! ```text
//! <dir>/index.json    { "model": "...", "dims": 256, "chunks": 42, "saved_at": "..." }
//! <dir>/chunks.json   [ { "content": "...", "source": "...", "chunk_index": 0, ... }, ... ]
//! ```

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use llm_relay_core::chunk::{split_text, SplitParams};
use llm_relay_core::embedding::Embedder;
use llm_relay_core::index::InMemoryIndex;
use llm_relay_core::models::{Chunk, RetrievalResult};

const INDEX_FILE: &str = "index.json";
const CHUNKS_FILE: &str = "chunks.json";

#[derive(Debug, Serialize, Deserialize)]
struct IndexMeta {
    model: String,
    dims: usize,
    chunks: usize,
    saved_at: DateTime<Utc>,
}

/// Counts reported by [`LocalStore::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct LocalStats {
    pub total_chunks: usize,
    pub sources: Vec<SourceCount>,
    pub model: String,
    pub dims: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SourceCount {
    pub source: String,
    pub chunks: usize,
}

pub struct LocalStore {
    embedder: Arc<dyn Embedder>,
    params: SplitParams,
    index: InMemoryIndex,
}

impl LocalStore {
    pub fn new(embedder: Arc<dyn Embedder>, params: SplitParams) -> Self {
        Self {
            embedder,
            params,
            index: InMemoryIndex::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Split, embed, and append `text` under `source`.
    ///
    /// Ingesting the same text twice stores it twice, with fresh
    /// `chunk_index` values.
    pub async fn ingest(&self, text: &str, source: &str) -> Result<Vec<Chunk>> {
        let pieces = self.embed_windows(text, source).await?;
        Ok(self.append(source, pieces))
    }

    /// Split `text` and embed every window without storing anything.
    pub async fn embed_windows(&self, text: &str, source: &str) -> Result<Vec<(String, Vec<f32>)>> {
        let pieces = split_text(text, &self.params);
        if pieces.is_empty() {
            debug!(source, "nothing to ingest");
            return Ok(Vec::new());
        }

        let vectors = self
            .embedder
            .embed(&pieces)
            .await
            .with_context(|| format!("Failed to embed chunks for '{}'", source))?;
        if vectors.len() != pieces.len() {
            bail!(
                "Embedder returned {} vectors for {} chunks",
                vectors.len(),
                pieces.len()
            );
        }
        Ok(pieces.into_iter().zip(vectors).collect())
    }

    /// Append already-embedded windows under `source`.
    pub fn append(&self, source: &str, pieces: Vec<(String, Vec<f32>)>) -> Vec<Chunk> {
        if pieces.is_empty() {
            return Vec::new();
        }
        let chunks = self.index.append_source(source, pieces, Utc::now());
        debug!(source, chunks = chunks.len(), "ingested into local index");
        chunks
    }

    /// Top-`k` chunks for `text`. An empty store answers without embedding.
    pub async fn query(&self, text: &str, k: usize) -> Result<Vec<RetrievalResult>> {
        if self.index.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let vector = self.embedder.embed_one(text).await?;
        Ok(self.index.query(&vector, k))
    }

    /// Stored text of `source`, its chunks joined in `chunk_index` order.
    pub fn source_text(&self, source: &str) -> Option<String> {
        let mut chunks: Vec<Chunk> = self
            .index
            .snapshot()
            .into_iter()
            .filter(|c| c.source == source)
            .collect();
        if chunks.is_empty() {
            return None;
        }
        chunks.sort_by_key(|c| c.chunk_index);
        let parts: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        Some(parts.join("\n"))
    }

    /// Write the full index to `dir`, creating it if needed.
    pub fn persist(&self, dir: &Path) -> Result<()> {
        self.snapshot().write_to(dir)
    }

    /// A copy of the index that can be written without holding the store.
    pub fn snapshot(&self) -> SavedIndex {
        let chunks = self.index.snapshot();
        let meta = IndexMeta {
            model: self.embedder.model_name().to_string(),
            dims: self.embedder.dims(),
            chunks: chunks.len(),
            saved_at: Utc::now(),
        };
        SavedIndex { meta, chunks }
    }

    /// Replace the index with the one saved in `dir`.
    ///
    /// Returns `false`, leaving the current index untouched, when the
    /// directory is missing, unreadable, or inconsistent.
    pub fn load(&self, dir: &Path) -> bool {
        match read_saved(dir, self.embedder.dims()) {
            Ok(chunks) => {
                info!(dir = %dir.display(), chunks = chunks.len(), "local index loaded");
                self.index.replace_all(chunks);
                true
            }
            Err(e) => {
                if dir.exists() {
                    warn!(dir = %dir.display(), error = %e, "could not load local index");
                } else {
                    debug!(dir = %dir.display(), "no saved local index");
                }
                false
            }
        }
    }

    pub fn stats(&self) -> LocalStats {
        LocalStats {
            total_chunks: self.index.len(),
            sources: self
                .index
                .sources()
                .into_iter()
                .map(|(source, chunks)| SourceCount { source, chunks })
                .collect(),
            model: self.embedder.model_name().to_string(),
            dims: self.embedder.dims(),
        }
    }
}

/// A point-in-time copy of a [`LocalStore`], see [`LocalStore::snapshot`].
pub struct SavedIndex {
    meta: IndexMeta,
    chunks: Vec<Chunk>,
}

impl SavedIndex {
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create index directory: {}", dir.display()))?;
        write_json(&dir.join(CHUNKS_FILE), &self.chunks)?;
        write_json(&dir.join(INDEX_FILE), &self.meta)?;
        info!(dir = %dir.display(), chunks = self.chunks.len(), "local index saved");
        Ok(())
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec(value)?;
    std::fs::write(&tmp, data)
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

fn read_saved(dir: &Path, expected_dims: usize) -> Result<Vec<Chunk>> {
    let meta: IndexMeta = serde_json::from_slice(&std::fs::read(dir.join(INDEX_FILE))?)?;
    let chunks: Vec<Chunk> = serde_json::from_slice(&std::fs::read(dir.join(CHUNKS_FILE))?)?;

    if chunks.len() != meta.chunks {
        bail!(
            "index.json lists {} chunks but chunks.json holds {}",
            meta.chunks,
            chunks.len()
        );
    }
    if expected_dims > 0 && meta.dims != expected_dims {
        bail!(
            "saved index has dimension {} but the embedder produces {}",
            meta.dims,
            expected_dims
        );
    }
    if let Some(bad) = chunks.iter().find(|c| c.embedding.len() != meta.dims) {
        bail!(
            "chunk {}#{} has dimension {}, expected {}",
            bad.source,
            bad.chunk_index,
            bad.embedding.len(),
            meta.dims
        );
    }
    Ok(chunks)
}
