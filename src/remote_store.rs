//! Remote vector store over a PostgREST-style API.
//!
//! Rows live in one table (`document_embeddings` by default):
//!
//! | Column | Type |
//! |--------|------|
//! | `id` | primary key |
//! | `content` | text |
//! | `embedding` | vector (JSON array or `"[..]"` string on the wire) |
//! | `metadata` | jsonb (`filename`, `file_type`, `total_chunks`, ...) |
//! | `document_id` | text, nullable |
//! | `chunk_index` | integer |
//! | `created_at` | timestamptz |
//!
//! # Search modes
//!
//! [`RemoteStore::connect`] calls the match function once. If it answers,
//! the store runs in [`SearchMode::ServerRanked`] and calls
//! `POST /rest/v1/rpc/<match_function>`; if that call later errors, the
//! query is answered client-side instead. Otherwise the store runs in
//! [`SearchMode::ClientRanked`] for its whole lifetime: it fetches every row
//! and ranks with [`llm_relay_core::index::rank`]. Both modes return results
//! thresholded, sorted by descending cosine similarity, and truncated to
//! `k`.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use llm_relay_core::index::rank;

use crate::config::RemoteStoreConfig;
use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    ServerRanked,
    ClientRanked,
}

/// A row to insert.
#[derive(Debug, Clone)]
pub struct NewRecord<'a> {
    pub content: &'a str,
    pub embedding: &'a [f32],
    pub metadata: Value,
    pub document_id: Option<&'a str>,
    pub chunk_index: i64,
}

/// A stored row, as returned by searches and document lookups.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RemoteMatch {
    pub id: String,
    pub content: String,
    pub metadata: Value,
    pub document_id: Option<String>,
    pub chunk_index: Option<i64>,
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoteStats {
    pub total_embeddings: usize,
    pub unique_documents: usize,
    /// Distinct document ids, sorted.
    pub documents: Vec<String>,
    pub file_types: BTreeMap<String, usize>,
    pub vector_dimension: usize,
    pub similarity_threshold: f32,
}

pub struct RemoteStore {
    base_url: String,
    api_key: String,
    table: String,
    match_function: String,
    dims: usize,
    similarity_threshold: f32,
    mode: SearchMode,
    http: reqwest::Client,
}

impl RemoteStore {
    /// Connect and detect the search mode.
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] when the service cannot be reached at all.
    pub async fn connect(config: &RemoteStoreConfig, api_key: String) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let mut store = Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key,
            table: config.table.clone(),
            match_function: config.match_function.clone(),
            dims: config.dims,
            similarity_threshold: config.similarity_threshold,
            mode: SearchMode::ClientRanked,
            http,
        };

        store.mode = store.detect_mode().await?;
        info!(
            url = %store.base_url,
            mode = ?store.mode,
            dims = store.dims,
            "remote store connected"
        );
        Ok(store)
    }

    pub fn mode(&self) -> SearchMode {
        self.mode
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    async fn detect_mode(&self) -> Result<SearchMode, StoreError> {
        let body = serde_json::json!({
            "query_embedding": vec![0.0f32; self.dims],
            "match_threshold": 1.0,
            "match_count": 1,
        });
        let resp = self
            .authed(self.http.post(self.rpc_url()))
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        if resp.status().is_success() {
            Ok(SearchMode::ServerRanked)
        } else {
            debug!(status = %resp.status(), "match function unavailable, ranking client-side");
            Ok(SearchMode::ClientRanked)
        }
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, self.table)
    }

    fn rpc_url(&self) -> String {
        format!("{}/rest/v1/rpc/{}", self.base_url, self.match_function)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    pub fn check_dims(&self, embedding: &[f32]) -> Result<(), StoreError> {
        if embedding.len() != self.dims {
            return Err(StoreError::DimensionMismatch {
                expected: self.dims,
                actual: embedding.len(),
            });
        }
        Ok(())
    }

    /// Insert one row and return its id.
    pub async fn store(&self, record: NewRecord<'_>) -> Result<String, StoreError> {
        self.check_dims(record.embedding)?;

        let body = serde_json::json!({
            "content": record.content,
            "embedding": record.embedding,
            "metadata": record.metadata,
            "document_id": record.document_id,
            "chunk_index": record.chunk_index,
            "created_at": chrono::Utc::now().to_rfc3339(),
        });

        let resp = self
            .authed(self.http.post(self.table_url()))
            .header("Prefer", "return=representation")
            .json(&body)
            .send()
            .await?;
        let rows = read_rows(resp).await?;

        let id = rows
            .first()
            .and_then(|row| row.get("id"))
            .map(id_string)
            .ok_or_else(|| StoreError::Malformed("insert returned no row".to_string()))?;
        debug!(id = %id, "stored remote embedding");
        Ok(id)
    }

    /// Rows most similar to `query`, best first.
    ///
    /// `threshold` defaults to the configured similarity threshold.
    pub async fn similarity_search(
        &self,
        query: &[f32],
        k: usize,
        threshold: Option<f32>,
    ) -> Result<Vec<RemoteMatch>, StoreError> {
        self.check_dims(query)?;
        let threshold = threshold.unwrap_or(self.similarity_threshold);

        if self.mode == SearchMode::ServerRanked {
            match self.server_ranked(query, k, threshold).await {
                Ok(matches) => return Ok(matches),
                Err(e) => warn!(error = %e, "match function failed, ranking client-side"),
            }
        }
        self.client_ranked(query, k, threshold).await
    }

    async fn server_ranked(
        &self,
        query: &[f32],
        k: usize,
        threshold: f32,
    ) -> Result<Vec<RemoteMatch>, StoreError> {
        let body = serde_json::json!({
            "query_embedding": query,
            "match_threshold": threshold,
            "match_count": k,
        });
        let resp = self
            .authed(self.http.post(self.rpc_url()))
            .json(&body)
            .send()
            .await?;
        let rows = read_rows(resp).await?;

        let mut matches: Vec<RemoteMatch> = rows
            .iter()
            .map(|row| {
                let similarity = row
                    .get("similarity")
                    .and_then(Value::as_f64)
                    .ok_or_else(|| StoreError::Malformed("match row without similarity".into()))?;
                Ok(to_match(row, similarity as f32))
            })
            .collect::<Result<_, StoreError>>()?;

        matches.retain(|m| m.similarity >= threshold);
        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        matches.truncate(k);
        Ok(matches)
    }

    async fn client_ranked(
        &self,
        query: &[f32],
        k: usize,
        threshold: f32,
    ) -> Result<Vec<RemoteMatch>, StoreError> {
        let rows = self.fetch(&[("select", "*".to_string())]).await?;
        let candidates: Vec<(Value, Vec<f32>)> = rows
            .into_iter()
            .filter_map(|row| {
                let embedding = row.get("embedding").and_then(parse_embedding)?;
                Some((row, embedding))
            })
            .collect();

        let ranked = rank(query, candidates, |(_, e)| e.as_slice(), k, Some(threshold));
        debug!(results = ranked.len(), "ranked remote rows client-side");
        Ok(ranked
            .into_iter()
            .map(|((row, _), score)| to_match(&row, score))
            .collect())
    }

    /// Every row stored for `document_id`, ordered by chunk index.
    pub async fn document_chunks(&self, document_id: &str) -> Result<Vec<RemoteMatch>, StoreError> {
        let rows = self
            .fetch(&[
                ("select", "*".to_string()),
                ("document_id", format!("eq.{}", document_id)),
                ("order", "chunk_index.asc".to_string()),
            ])
            .await?;
        Ok(rows.iter().map(|row| to_match(row, 0.0)).collect())
    }

    /// One past the highest `chunk_index` stored for `document_id`, or 0.
    pub async fn next_chunk_index(&self, document_id: &str) -> Result<i64, StoreError> {
        let rows = self
            .fetch(&[
                ("select", "chunk_index".to_string()),
                ("document_id", format!("eq.{}", document_id)),
                ("order", "chunk_index.desc".to_string()),
                ("limit", "1".to_string()),
            ])
            .await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("chunk_index"))
            .and_then(Value::as_i64)
            .map_or(0, |max| max + 1))
    }

    /// Delete every row for `document_id`. Returns the number removed.
    pub async fn delete_document(&self, document_id: &str) -> Result<usize, StoreError> {
        let resp = self
            .authed(self.http.delete(self.table_url()))
            .query(&[("document_id", format!("eq.{}", document_id))])
            .header("Prefer", "return=representation")
            .send()
            .await?;
        let removed = read_rows(resp).await?.len();
        info!(document_id, removed, "deleted remote document");
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<RemoteStats, StoreError> {
        let rows = self
            .fetch(&[("select", "id,document_id,metadata".to_string())])
            .await?;

        let mut documents = BTreeSet::new();
        let mut file_types: BTreeMap<String, usize> = BTreeMap::new();
        for row in &rows {
            if let Some(doc) = row.get("document_id").and_then(Value::as_str) {
                documents.insert(doc.to_string());
            }
            if let Some(kind) = row.pointer("/metadata/file_type").and_then(Value::as_str) {
                *file_types.entry(kind.to_string()).or_insert(0) += 1;
            }
        }

        Ok(RemoteStats {
            total_embeddings: rows.len(),
            unique_documents: documents.len(),
            documents: documents.into_iter().collect(),
            file_types,
            vector_dimension: self.dims,
            similarity_threshold: self.similarity_threshold,
        })
    }

    /// Whether a one-row read succeeds.
    pub async fn test_connection(&self) -> bool {
        match self
            .fetch(&[("select", "id".to_string()), ("limit", "1".to_string())])
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "remote store connection test failed");
                false
            }
        }
    }

    async fn fetch(&self, query: &[(&str, String)]) -> Result<Vec<Value>, StoreError> {
        let resp = self
            .authed(self.http.get(self.table_url()))
            .query(query)
            .send()
            .await?;
        read_rows(resp).await
    }
}

async fn read_rows(resp: reqwest::Response) -> Result<Vec<Value>, StoreError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(StoreError::Status {
            status: status.as_u16(),
            body,
        });
    }
    let json: Value = resp.json().await?;
    match json {
        Value::Array(rows) => Ok(rows),
        other => Err(StoreError::Malformed(format!(
            "expected a JSON array, got {}",
            other
        ))),
    }
}

fn to_match(row: &Value, similarity: f32) -> RemoteMatch {
    RemoteMatch {
        id: row.get("id").map(id_string).unwrap_or_default(),
        content: row
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        metadata: row.get("metadata").cloned().unwrap_or(Value::Null),
        document_id: row
            .get("document_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        chunk_index: row.get("chunk_index").and_then(Value::as_i64),
        similarity,
    }
}

fn id_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Read an embedding sent either as a JSON array or as pgvector text.
pub fn parse_embedding(value: &Value) -> Option<Vec<f32>> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_f64().map(|f| f as f32))
            .collect(),
        Value::String(text) => {
            let inner = text.trim().strip_prefix('[')?.strip_suffix(']')?;
            if inner.trim().is_empty() {
                return Some(Vec::new());
            }
            inner
                .split(',')
                .map(|part| part.trim().parse::<f32>().ok())
                .collect()
        }
        _ => None,
    }
}
