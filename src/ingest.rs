//! `relay ingest`: decode files and add them to retrieval.
//!
//! A file path ingests that file; a directory path ingests every regular
//! file directly inside it (no recursion). Each file goes through the same
//! decoder as chat attachments and is stored via
//! [`RetrievalManager::embed_and_store`], so it lands in the remote store
//! when one is reachable and in the local index otherwise.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::warn;

use crate::config::Config;
use crate::extract::decode_file;
use crate::retrieval::{Backend, RetrievalManager};
use crate::router::CredentialSource;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub files: usize,
    pub chunks: usize,
    pub remote: usize,
    pub local: usize,
    pub skipped: usize,
}

pub async fn run_ingest(
    config: &Config,
    credentials: &dyn CredentialSource,
    path: &Path,
    source: Option<&str>,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("ingest requires an embedding provider; set [embedding].provider");
    }
    let retrieval = RetrievalManager::from_config(config, credentials).await?;
    let summary = ingest_path(&retrieval, path, source).await?;

    println!("ingest {}", path.display());
    println!("  files: {}", summary.files);
    println!("  skipped: {}", summary.skipped);
    println!("  chunks written: {}", summary.chunks);
    println!("  remote documents: {}", summary.remote);
    println!("  local documents: {}", summary.local);
    if config.retrieval.index_dir.is_none() && summary.local > 0 {
        println!("  warning: [retrieval].index_dir is not set, local chunks were not saved");
    }
    println!("ok");
    Ok(())
}

/// Ingest `path` into `retrieval`. `source` overrides the document name,
/// and only applies when `path` is a single file.
pub async fn ingest_path(
    retrieval: &RetrievalManager,
    path: &Path,
    source: Option<&str>,
) -> Result<IngestSummary> {
    let files = collect_files(path)?;
    let single = files.len() == 1 && path.is_file();
    let mut summary = IngestSummary::default();

    for file in &files {
        let filename = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.display().to_string());
        let name = match source {
            Some(s) if single => s.to_string(),
            _ => filename.clone(),
        };

        let bytes = std::fs::read(file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        let decoded = match decode_file(&filename, None, &bytes) {
            Ok(d) => d,
            Err(e) => {
                eprintln!("Warning: skipping {}: {}", file.display(), e);
                summary.skipped += 1;
                continue;
            }
        };

        let outcome = retrieval
            .embed_and_store(
                &decoded.text,
                &name,
                serde_json::json!({ "file_type": decoded.kind.as_str() }),
            )
            .await;
        match outcome.backend {
            Some(Backend::Remote) => summary.remote += 1,
            Some(Backend::Local) => {
                if let Some(e) = &outcome.local_error {
                    warn!(file = %name, error = %e, "local index not saved");
                }
                summary.local += 1;
            }
            None => {
                if let Some(e) = outcome.local_error {
                    bail!("Failed to embed {}: {}", name, e);
                }
                warn!(file = %name, "file produced no chunks");
                summary.skipped += 1;
                continue;
            }
        }
        summary.files += 1;
        summary.chunks += outcome.chunks;
    }

    Ok(summary)
}

fn collect_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        bail!("No such file or directory: {}", path.display());
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(path)
        .with_context(|| format!("Failed to read directory {}", path.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    Ok(files)
}
