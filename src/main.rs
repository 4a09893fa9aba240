//! # Secure RAG CLI (`srag`)
//!
//! Answers questions over a JSON corpus with clearance-aware retrieval,
//! sensitivity-based model routing, and an encrypted semantic cache.
//!
//! ## Usage
//!
//! ```bash
//! srag --config ./config/srag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `srag check` | Validate the configuration and print the resolved settings |
//! | `srag ask "<question>"` | Answer a question against a corpus file |
//!
//! ## Examples
//!
//! ```bash
//! # Validate configuration
//! srag check --config ./config/srag.toml
//!
//! # Ask with RESTRICTED org clearance and CONFIDENTIAL clearance in department 7
//! srag ask "What are the Q3 budget targets?" \
//!     --corpus ./corpus.json --org-level 2 \
//!     --department-id 7 --department-level 3 --stream
//! ```

use clap::{Parser, Subcommand};
use secure_rag::commands::{self, parse_level, AskOptions};
use secure_rag::{config, telemetry};
use secure_rag_core::models::{Clearance, SecurityLevel};
use std::path::PathBuf;

/// Secure RAG CLI.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/srag.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "srag",
    about = "Security-aware retrieval-augmented generation",
    version,
    long_about = "Secure RAG plans questions into search queries, retrieves passages the requester \
    is cleared to see, routes generation to a model suited to the content's sensitivity, and caches \
    answers in an encrypted semantic cache scoped by clearance."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/srag.toml")]
    config: PathBuf,

    /// Enable debug logging. `RUST_LOG` takes precedence when set.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and print the resolved settings.
    ///
    /// Does not contact any provider.
    Check,

    /// Answer a question.
    ///
    /// Passages are loaded from a JSON array of `{content, metadata}`
    /// objects. Exits non-zero when no answer could be produced.
    Ask {
        /// The question.
        question: String,

        /// JSON corpus file.
        #[arg(long)]
        corpus: PathBuf,

        /// Organization-wide clearance (1-4 or level name).
        #[arg(long, value_parser = parse_level, default_value = "GENERAL")]
        org_level: SecurityLevel,

        /// Department the requester belongs to.
        #[arg(long, requires = "department_level")]
        department_id: Option<i64>,

        /// Clearance within `--department-id`.
        #[arg(long, value_parser = parse_level, requires = "department_id")]
        department_level: Option<SecurityLevel>,

        /// Conversation identifier used to look up history.
        #[arg(long)]
        conversation: Option<String>,

        /// JSON array of prior `{role, content}` messages for the conversation.
        #[arg(long)]
        history: Option<PathBuf>,

        /// Print tokens as they are generated.
        #[arg(long)]
        stream: bool,

        /// Emit the full answer as JSON.
        #[arg(long, conflicts_with = "stream")]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init_logging(cli.verbose);
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Check => {
            commands::run_check(&cfg)?;
        }
        Commands::Ask {
            question,
            corpus,
            org_level,
            department_id,
            department_level,
            conversation,
            history,
            stream,
            json,
        } => {
            let clearance = match (department_id, department_level) {
                (Some(id), Some(level)) => Clearance::new(org_level).with_department(id, level),
                _ => Clearance::new(org_level),
            };
            let ok = commands::run_ask(
                &cfg,
                AskOptions {
                    question: &question,
                    corpus: &corpus,
                    clearance,
                    conversation: conversation.as_deref(),
                    history: history.as_deref(),
                    stream,
                    json,
                },
            )
            .await?;
            if !ok {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
