//! # llm-relay CLI (`relay`)
//!
//! ## Usage
//!
//! ```bash
//! relay --config ./config/relay.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `relay init` | Create the SQLite database and run schema migrations |
//! | `relay serve` | Start the HTTP API |
//! | `relay chat "<message>"` | Run one turn (optionally with `--file`, `--stream`) |
//! | `relay ingest <path>` | Decode files and add them to retrieval |
//! | `relay search "<query>"` | Similarity search over the local index |
//! | `relay stats` | Retrieval, history and upload statistics |
//! | `relay health` | Report optional capabilities |
//! | `relay route <model>` | Show which gateway a model name binds to |
//!
//! `init`, `health` and `route` fall back to built-in defaults when the
//! config file does not exist.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use llm_relay::router::{CredentialSource, EnvCredentials};
use llm_relay::{chat_cmd, config, health, ingest, migrate, search, server, stats};

/// llm-relay: a chat backend that routes turns across hosted LLM gateways,
/// with local and remote retrieval.
#[derive(Parser)]
#[command(name = "relay", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/relay.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Start the HTTP API on `[server].bind`.
    Serve,

    /// Send one message and print the reply.
    Chat {
        message: String,

        /// Attach a file (repeatable).
        #[arg(long = "file")]
        files: Vec<PathBuf>,

        /// Text model to use instead of `[models].default`.
        #[arg(long)]
        model: Option<String>,

        /// Print the answer as it arrives.
        #[arg(long)]
        stream: bool,
    },

    /// Decode a file, or every file in a directory, into retrieval.
    Ingest {
        path: PathBuf,

        /// Document name to store under (single files only).
        #[arg(long)]
        source: Option<String>,
    },

    /// Search retrieval for chunks similar to a query.
    Search {
        query: String,

        #[arg(long, default_value_t = 5)]
        limit: usize,

        /// Search the remote store instead of the local index.
        #[arg(long)]
        remote: bool,
    },

    /// Show retrieval, history and upload statistics.
    Stats,

    /// Report which optional capabilities are available.
    Health,

    /// Show the routing decision for a model name.
    Route {
        name: String,

        /// Route as a file-attached turn.
        #[arg(long)]
        file_intent: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("llm_relay=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let credentials: Arc<dyn CredentialSource> = Arc::new(EnvCredentials);

    // init, health and route run without a config file
    let config_optional = matches!(
        cli.command,
        Commands::Init | Commands::Health | Commands::Route { .. }
    );
    let cfg = if config_optional && !cli.config.exists() {
        config::Config::minimal()
    } else {
        config::load_config(&cli.config)?
    };

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Chat {
            message,
            files,
            model,
            stream,
        } => {
            chat_cmd::run_chat(&cfg, credentials, &message, &files, model.as_deref(), stream)
                .await?;
        }
        Commands::Ingest { path, source } => {
            ingest::run_ingest(&cfg, credentials.as_ref(), &path, source.as_deref()).await?;
        }
        Commands::Search {
            query,
            limit,
            remote,
        } => {
            search::run_search(&cfg, credentials.as_ref(), &query, limit, remote).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg, credentials.as_ref()).await?;
        }
        Commands::Health => health::run_health(&cfg, credentials.as_ref()),
        Commands::Route { name, file_intent } => {
            chat_cmd::run_route(&cfg, credentials, &name, file_intent)?;
        }
    }

    Ok(())
}
