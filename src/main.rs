//! # ragchat CLI
//!
//! The `ragchat` binary manages the service's database and knowledge base
//! and runs the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! ragchat --config ./config/ragchat.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragchat init` | Create the SQLite database and run schema migrations |
//! | `ragchat ingest <dir>` | Ingest a directory of Markdown/text files into the knowledge base |
//! | `ragchat serve` | Start the chat HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! ragchat init --config ./config/ragchat.toml
//!
//! # Load the shared knowledge base
//! ragchat ingest ./knowledge --config ./config/ragchat.toml
//!
//! # Start the server
//! ragchat serve --config ./config/ragchat.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use ragchat::{config, db, embedding, ingest, migrate, server, vector::SqliteVectorIndex};

/// ragchat — a retrieval-augmented chat service with streaming answers
/// and per-conversation document upload.
#[derive(Parser)]
#[command(
    name = "ragchat",
    about = "Retrieval-augmented chat service with streaming answers and document upload",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ragchat.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (conversations, messages, vectors, kb_documents). Idempotent.
    Init,

    /// Ingest a directory of Markdown/text files into the shared
    /// knowledge base.
    ///
    /// Files whose content hash is already recorded are skipped, so
    /// re-running after edits only processes what changed. Requires an
    /// embedding provider to be configured.
    Ingest {
        /// Directory to scan recursively for `.md` and `.txt` files.
        dir: PathBuf,
    },

    /// Start the chat HTTP server.
    ///
    /// Binds to the address configured in `[server].bind` and serves
    /// the chat, upload, search, and conversation endpoints.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ragchat=info,tower_http=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { dir } => {
            if !cfg.embedding.is_enabled() {
                anyhow::bail!(
                    "knowledge-base ingestion requires an embedding provider; \
                     set [embedding] provider in the config"
                );
            }
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            let provider: Arc<dyn embedding::EmbeddingProvider> =
                embedding::create_provider(&cfg.embedding)?.into();
            let index = SqliteVectorIndex::new(pool.clone());

            let count =
                ingest::ingest_knowledge_dir(&cfg, &pool, &index, provider, &dir).await?;
            println!("Ingested {} file(s) from {}", count, dir.display());
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
