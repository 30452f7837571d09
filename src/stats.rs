//! `relay stats`: retrieval and history overview.
//!
//! Prints merged retrieval counts (local index plus remote store), the
//! per-source breakdown, and chat-history and upload totals from the
//! database.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::retrieval::RetrievalManager;
use crate::router::CredentialSource;

pub async fn run_stats(config: &Config, credentials: &dyn CredentialSource) -> Result<()> {
    let retrieval = RetrievalManager::from_config(config, credentials).await?;
    let stats = retrieval.stats().await;

    let pool = db::open(config).await?;
    let totals = sqlx::query(
        r#"
        SELECT
            (SELECT COUNT(*) FROM chat_history) AS turns,
            (SELECT COUNT(DISTINCT session_id) FROM chat_history) AS sessions,
            (SELECT COUNT(*) FROM uploads) AS uploads,
            (SELECT MAX(created_at) FROM uploads) AS last_upload
        "#,
    )
    .fetch_one(&pool)
    .await?;
    let turns: i64 = totals.get("turns");
    let sessions: i64 = totals.get("sessions");
    let uploads: i64 = totals.get("uploads");
    let last_upload: Option<i64> = totals.get("last_upload");

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("llm-relay stats");
    println!("===============");
    println!();
    println!("  Database:      {}", config.db.path.display());
    println!("  Size:          {}", format_bytes(db_size));
    println!("  Sessions:      {}", sessions);
    println!("  Turns:         {}", turns);
    println!(
        "  Uploads:       {} (last: {})",
        uploads,
        last_upload.map(format_ts_relative).unwrap_or_else(|| "never".to_string())
    );
    println!();
    println!(
        "  Chunks:        {} (local {}, remote {})",
        stats.total_chunks, stats.local_chunks, stats.remote_chunks
    );
    println!(
        "  Embedder:      {} ({} dims)",
        stats.local.model, stats.local.dims
    );
    match (&stats.remote, &stats.remote_error) {
        (Some(remote), _) => println!(
            "  Remote store:  {} documents, mode {:?}",
            remote.unique_documents,
            stats.remote_mode
        ),
        (None, Some(err)) => println!("  Remote store:  unavailable ({})", err),
        (None, None) => println!("  Remote store:  not configured"),
    }

    if !stats.local.sources.is_empty() {
        println!();
        println!("  Local sources:");
        println!("  {:<40} {:>8}", "SOURCE", "CHUNKS");
        println!("  {}", "-".repeat(49));
        for s in &stats.local.sources {
            println!("  {:<40} {:>8}", s.source, s.chunks);
        }
    }

    if let Some(remote) = &stats.remote {
        if !remote.file_types.is_empty() {
            println!();
            println!("  Remote file types:");
            for (kind, count) in &remote.file_types {
                println!("  {:<40} {:>8}", kind, count);
            }
        }
    }

    println!();
    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp relative to now (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    match delta {
        d if d < 0 => format_ts_iso(ts),
        d if d < 60 => "just now".to_string(),
        d if d < 3600 => plural(d / 60, "min"),
        d if d < 86_400 => plural(d / 3600, "hour"),
        d if d < 86_400 * 30 => plural(d / 86_400, "day"),
        _ => format_ts_iso(ts),
    }
}

fn plural(n: i64, unit: &str) -> String {
    format!("{} {}{} ago", n, unit, if n == 1 { "" } else { "s" })
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
