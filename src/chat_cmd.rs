//! `relay chat` and `relay route`.
//!
//! `chat` runs a single turn through a fresh [`Orchestrator`] in the
//! `cli` session, with the same tools as the server. `route` prints the binding the router would choose for a
//! model name without making a call.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;

use crate::config::Config;
use crate::db;
use crate::extract::MAX_FILE_BYTES;
use crate::health::check_capabilities;
use crate::orchestrator::{Orchestrator, TurnReply, TurnRequest, UploadedFile};
use crate::retrieval::RetrievalManager;
use crate::router::{CredentialSource, Intent, ModelRouter, ModelSpec};
use crate::tools::{ToolContext, ToolRegistry};

const CLI_SESSION: &str = "cli";

pub async fn run_chat(
    config: &Config,
    credentials: Arc<dyn CredentialSource>,
    message: &str,
    files: &[PathBuf],
    model: Option<&str>,
    stream: bool,
) -> Result<()> {
    let mut uploads = Vec::with_capacity(files.len());
    for path in files {
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        if bytes.len() > MAX_FILE_BYTES {
            anyhow::bail!(
                "{} is {} bytes; the maximum is {} bytes",
                path.display(),
                bytes.len(),
                MAX_FILE_BYTES
            );
        }
        uploads.push(UploadedFile {
            filename: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            content_type: None,
            bytes,
        });
    }

    let capabilities = check_capabilities(config, credentials.as_ref());
    let retrieval = Arc::new(RetrievalManager::from_config(config, credentials.as_ref()).await?);
    let pool = db::open(config).await?;
    let tools = ToolRegistry::builtin(ToolContext {
        pool: Some(pool),
        retrieval: Some(retrieval.clone()),
    });
    let mut orch = Orchestrator::new(
        CLI_SESSION,
        config,
        credentials,
        &capabilities,
        Some(retrieval),
    )
    .with_tools(Arc::new(tools));
    if let Some(m) = model {
        orch = orch.with_model(m);
    }

    let req = TurnRequest {
        message: message.to_string(),
        files: uploads,
    };

    if stream {
        return stream_turn(&mut orch, req).await;
    }

    let reply = orch.handle_turn(req).await;
    print_reply(&reply);
    if !reply.succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

async fn stream_turn(orch: &mut Orchestrator, req: TurnRequest) -> Result<()> {
    let mut turn = match orch.begin_stream(req).await {
        Ok(t) => t,
        Err(reply) => {
            print_reply(&reply);
            std::process::exit(1);
        }
    };

    let mut stdout = tokio::io::stdout();
    let mut collected = String::new();
    let mut failure = None;
    while let Some(item) = turn.receiver.recv().await {
        match item {
            Ok(delta) => {
                stdout.write_all(delta.as_bytes()).await?;
                stdout.flush().await?;
                collected.push_str(&delta);
            }
            Err(e) => failure = Some(e),
        }
    }
    println!();

    orch.finish_stream(&turn, &collected, failure.is_some());
    if let Some(e) = failure {
        eprintln!("{}", e.user_message());
        std::process::exit(1);
    }
    eprintln!(
        "[{} via {}]",
        turn.binding.resolved_model,
        turn.binding.provider_id.as_str()
    );
    Ok(())
}

fn print_reply(reply: &TurnReply) {
    println!("{}", reply.response);
    for f in &reply.processed_files {
        match (&f.preview, &f.error) {
            (_, Some(err)) => eprintln!("[file {}: {}]", f.filename, err),
            (Some(preview), None) => eprintln!("[file {}: {}]", f.filename, preview),
            (None, None) => {}
        }
    }
    if let Some(b) = &reply.binding {
        eprintln!(
            "[{} via {} ({})]",
            b.resolved_model,
            b.provider_id.as_str(),
            b.reason.as_str()
        );
    }
    if !reply.tools_used.is_empty() {
        eprintln!("[tools: {}]", reply.tools_used.join(", "));
    }
    if let Some(err) = &reply.error {
        eprintln!("[{}: {}]", err.kind, err.message);
    }
}

pub fn run_route(
    config: &Config,
    credentials: Arc<dyn CredentialSource>,
    name: &str,
    file_intent: bool,
) -> Result<()> {
    let capabilities = check_capabilities(config, credentials.as_ref());
    let router = ModelRouter::new(config, credentials, capabilities.secondary_provider)?;
    let intent = if file_intent { Intent::File } else { Intent::Text };
    let binding = router.route(&ModelSpec::new(name, intent));

    println!("model:    {}", binding.resolved_model);
    println!("provider: {}", binding.provider_id.as_str());
    println!("reason:   {}", binding.reason.as_str());
    Ok(())
}
