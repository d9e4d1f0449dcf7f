//! # DocGPT CLI (`docgpt`)
//!
//! Chat with a single document. The file is chunked and embedded once
//! (embeddings are cached on disk next to the raw upload), and questions are
//! answered from its content only.
//!
//! ## Usage
//!
//! ```bash
//! docgpt --config ./config/docgpt.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docgpt embed <file>` | Load a document into the cache and print counts |
//! | `docgpt ask <file> "<question>"` | Answer one question and exit |
//! | `docgpt chat <file>` | Interactive question loop on stdin |
//! | `docgpt serve` | Start the HTTP chat server |
//!
//! ## Examples
//!
//! ```bash
//! # Pre-compute embeddings for a clinic handbook
//! docgpt embed ./handbook.pdf
//!
//! # One-shot question
//! docgpt ask ./policy.txt "When are you open?"
//!
//! # Keep a per-user cache
//! docgpt --namespace alice chat ./policy.txt
//! ```
//!
//! Set `RUST_LOG=debug` for detailed logs on stderr.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use docgpt::progress::ProgressMode;
use docgpt::{chat_cmd, config, embed_cmd, server};

/// DocGPT: ask questions about one uploaded document.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docgpt.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docgpt",
    about = "DocGPT: chat with a PDF, DOCX, or text document",
    version,
    long_about = "DocGPT splits a document into overlapping chunks, embeds them with a cache \
    on local disk, and answers questions with multi-query retrieval and a streaming chat model, \
    as the urology department's consultation assistant."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docgpt.toml")]
    config: PathBuf,

    /// Cache namespace (user identity). Two namespaces never share cached files.
    #[arg(long, global = true, default_value = "local")]
    namespace: String,

    /// Load progress on stderr. Defaults to `human` on a TTY, otherwise `off`.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a document and cache its embeddings.
    ///
    /// Chunks already embedded with the configured model are read from the
    /// cache instead of being sent to the provider again.
    Embed {
        /// PDF, DOCX, or TXT file.
        file: PathBuf,
    },

    /// Answer a single question about a document.
    Ask {
        file: PathBuf,
        question: String,
    },

    /// Interactive chat about a document.
    ///
    /// Type a question per line. `/history` prints the transcript and
    /// `/quit` exits.
    Chat { file: PathBuf },

    /// Start the HTTP chat server on `[server].bind`.
    Serve,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = config::load_config(&cli.config)?;
    let progress = cli
        .progress
        .unwrap_or_else(ProgressMode::default_for_tty)
        .reporter();

    match cli.command {
        Commands::Embed { file } => {
            embed_cmd::run_embed(&cfg, &cli.namespace, &file, progress.as_ref()).await?;
        }
        Commands::Ask { file, question } => {
            chat_cmd::run_ask(&cfg, &cli.namespace, &file, &question, progress.as_ref()).await?;
        }
        Commands::Chat { file } => {
            chat_cmd::run_chat(&cfg, &cli.namespace, &file, progress.as_ref()).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
