//! Chat history and upload records in SQLite.

use anyhow::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};

use llm_relay_core::models::Role;

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub id: String,
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub model: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadRecord {
    pub id: String,
    pub filename: String,
    pub content_type: Option<String>,
    pub size_bytes: i64,
    pub sha256: String,
    pub preview: Option<String>,
    /// `remote`, `local`, or `None` when the text was not indexed.
    pub stored_in: Option<String>,
    pub created_at: i64,
}

pub struct NewUpload<'a> {
    pub filename: &'a str,
    pub content_type: Option<&'a str>,
    pub bytes: &'a [u8],
    pub preview: Option<&'a str>,
    pub stored_in: Option<&'a str>,
}

pub async fn record_turn(
    pool: &SqlitePool,
    session_id: &str,
    role: Role,
    content: &str,
    model: Option<&str>,
) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO chat_history (id, session_id, role, content, model, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(session_id)
    .bind(role.as_str())
    .bind(content)
    .bind(model)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(id)
}

/// Turns of `session_id` in the order they were recorded. With `limit`,
/// only the most recent `limit` turns are returned (still oldest first).
pub async fn session_history(
    pool: &SqlitePool,
    session_id: &str,
    limit: Option<i64>,
) -> Result<Vec<HistoryEntry>> {
    let rows = sqlx::query(
        "SELECT id, session_id, role, content, model, created_at FROM (
             SELECT *, rowid AS seq FROM chat_history
             WHERE session_id = ?
             ORDER BY created_at DESC, seq DESC
             LIMIT ?
         ) ORDER BY created_at ASC, seq ASC",
    )
    .bind(session_id)
    .bind(limit.unwrap_or(-1))
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| HistoryEntry {
            id: row.get("id"),
            session_id: row.get("session_id"),
            role: row.get("role"),
            content: row.get("content"),
            model: row.get("model"),
            created_at: row.get("created_at"),
        })
        .collect())
}

/// Delete every turn of `session_id`. Returns the number of rows removed.
pub async fn clear_history(pool: &SqlitePool, session_id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM chat_history WHERE session_id = ?")
        .bind(session_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn record_upload(pool: &SqlitePool, upload: NewUpload<'_>) -> Result<UploadRecord> {
    let record = UploadRecord {
        id: uuid::Uuid::new_v4().to_string(),
        filename: upload.filename.to_string(),
        content_type: upload.content_type.map(str::to_string),
        size_bytes: upload.bytes.len() as i64,
        sha256: format!("{:x}", Sha256::digest(upload.bytes)),
        preview: upload.preview.map(str::to_string),
        stored_in: upload.stored_in.map(str::to_string),
        created_at: chrono::Utc::now().timestamp(),
    };

    sqlx::query(
        "INSERT INTO uploads (id, filename, content_type, size_bytes, sha256, preview, stored_in, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&record.id)
    .bind(&record.filename)
    .bind(&record.content_type)
    .bind(record.size_bytes)
    .bind(&record.sha256)
    .bind(&record.preview)
    .bind(&record.stored_in)
    .bind(record.created_at)
    .execute(pool)
    .await?;

    Ok(record)
}

/// Most recent uploads first.
pub async fn list_uploads(pool: &SqlitePool, limit: i64) -> Result<Vec<UploadRecord>> {
    let rows = sqlx::query(
        "SELECT id, filename, content_type, size_bytes, sha256, preview, stored_in, created_at
         FROM uploads ORDER BY created_at DESC, rowid DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| UploadRecord {
            id: row.get("id"),
            filename: row.get("filename"),
            content_type: row.get("content_type"),
            size_bytes: row.get("size_bytes"),
            sha256: row.get("sha256"),
            preview: row.get("preview"),
            stored_in: row.get("stored_in"),
            created_at: row.get("created_at"),
        })
        .collect())
}
