//! `relay search`: query the local index, or the remote store with `--remote`.

use anyhow::Result;

use crate::config::Config;
use crate::retrieval::RetrievalManager;
use crate::router::CredentialSource;

pub async fn run_search(
    config: &Config,
    credentials: &dyn CredentialSource,
    query: &str,
    limit: usize,
    remote: bool,
) -> Result<()> {
    if query.trim().is_empty() {
        anyhow::bail!("query must not be empty");
    }
    let retrieval = RetrievalManager::from_config(config, credentials).await?;

    if remote {
        let matches = retrieval.search_remote(query, limit, None).await?;
        if matches.is_empty() {
            println!("No results.");
            return Ok(());
        }
        for (i, m) in matches.iter().enumerate() {
            println!(
                "{}. [{:.3}] {} #{}",
                i + 1,
                m.similarity,
                m.document_id.as_deref().unwrap_or("(no document)"),
                m.chunk_index.unwrap_or(0)
            );
            println!("    excerpt: \"{}\"", excerpt(&m.content));
            println!("    id: {}", m.id);
            println!();
        }
        return Ok(());
    }

    let results = retrieval.search(query, limit).await?;
    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, r) in results.iter().enumerate() {
        println!(
            "{}. [{:.3}] {} #{}",
            i + 1,
            r.score,
            r.chunk.source,
            r.chunk.chunk_index
        );
        println!(
            "    stored: {}",
            r.chunk.created_at.format("%Y-%m-%d %H:%M")
        );
        println!("    excerpt: \"{}\"", excerpt(&r.chunk.content));
        println!();
    }
    Ok(())
}

fn excerpt(text: &str) -> String {
    let flat = text.replace('\n', " ");
    let flat = flat.trim();
    match flat.char_indices().nth(160) {
        Some((cut, _)) => format!("{}...", &flat[..cut]),
        None => flat.to_string(),
    }
}
