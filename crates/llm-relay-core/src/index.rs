//! In-memory chunk index with brute-force cosine ranking.
//!
//! [`InMemoryIndex`] keeps chunks in insertion order behind a
//! `std::sync::RwLock`. Queries take the read lock, so they run
//! concurrently with each other and see either the state before or after
//! an append, never a partial one.
//!
//! [`rank`] is the shared ranking law: cosine similarity, optional
//! threshold, descending score, ties kept in input order, truncated to `k`.
//! The remote store's client-side fallback uses the same function so both
//! paths order results identically.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::embedding::cosine_similarity;
use crate::models::{Chunk, RetrievalResult};

/// Rank `items` against `query` by cosine similarity.
///
/// Items scoring below `threshold` (when given) are dropped. The sort is
/// stable, so equal scores keep their input order.
pub fn rank<T, F>(
    query: &[f32],
    items: impl IntoIterator<Item = T>,
    embedding_of: F,
    k: usize,
    threshold: Option<f32>,
) -> Vec<(T, f32)>
where
    F: Fn(&T) -> &[f32],
{
    let mut scored: Vec<(T, f32)> = items
        .into_iter()
        .map(|item| {
            let score = cosine_similarity(query, embedding_of(&item));
            (item, score)
        })
        .filter(|(_, score)| threshold.map_or(true, |t| *score >= t))
        .collect();

    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.truncate(k);
    scored
}

/// Append-only, thread-safe chunk index.
#[derive(Default)]
pub struct InMemoryIndex {
    chunks: RwLock<Vec<Chunk>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Chunk>> {
        self.chunks.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Chunk>> {
        self.chunks.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of stored chunks.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Next free `chunk_index` for `source` (one past the current maximum).
    pub fn next_index(&self, source: &str) -> i64 {
        self.read()
            .iter()
            .filter(|c| c.source == source)
            .map(|c| c.chunk_index + 1)
            .max()
            .unwrap_or(0)
    }

    /// Append chunks. Existing chunks are never modified.
    pub fn append(&self, chunks: Vec<Chunk>) {
        self.write().extend(chunks);
    }

    /// Append chunks built from `(content, embedding)` pairs, assigning
    /// `chunk_index` values after any already stored for `source`.
    ///
    /// Index assignment and insertion happen under one write lock, so two
    /// concurrent ingests of the same source never reuse an index.
    pub fn append_source(
        &self,
        source: &str,
        pieces: Vec<(String, Vec<f32>)>,
        created_at: chrono::DateTime<chrono::Utc>,
    ) -> Vec<Chunk> {
        let mut guard = self.write();
        let start = guard
            .iter()
            .filter(|c| c.source == source)
            .map(|c| c.chunk_index + 1)
            .max()
            .unwrap_or(0);

        let chunks: Vec<Chunk> = pieces
            .into_iter()
            .enumerate()
            .map(|(i, (content, embedding))| Chunk {
                content,
                source: source.to_string(),
                chunk_index: start + i as i64,
                embedding,
                created_at,
            })
            .collect();

        guard.extend(chunks.iter().cloned());
        chunks
    }

    /// Replace the whole index, e.g. after loading from disk.
    pub fn replace_all(&self, chunks: Vec<Chunk>) {
        *self.write() = chunks;
    }

    /// Copy of every stored chunk in insertion order.
    pub fn snapshot(&self) -> Vec<Chunk> {
        self.read().clone()
    }

    /// Distinct sources in first-seen order, with their chunk counts.
    pub fn sources(&self) -> Vec<(String, usize)> {
        let guard = self.read();
        let mut order: Vec<String> = Vec::new();
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for c in guard.iter() {
            let entry = counts.entry(c.source.as_str()).or_insert(0);
            if *entry == 0 {
                order.push(c.source.clone());
            }
            *entry += 1;
        }
        order
            .into_iter()
            .map(|s| {
                let n = counts.get(s.as_str()).copied().unwrap_or(0);
                (s, n)
            })
            .collect()
    }

    /// Top-`k` chunks by cosine similarity to `query`. Empty index → empty list.
    pub fn query(&self, query: &[f32], k: usize) -> Vec<RetrievalResult> {
        let guard = self.read();
        rank(query, guard.iter(), |c| c.embedding.as_slice(), k, None)
            .into_iter()
            .map(|(chunk, score)| RetrievalResult {
                chunk: chunk.clone(),
                score,
            })
            .collect()
    }
}
