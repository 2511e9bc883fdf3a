//! # garde CLI
//!
//! The `garde` binary ingests normalized sources, runs them through the
//! extraction pipeline, and searches the result.
//!
//! ## Usage
//!
//! ```bash
//! garde --config ./config/garde.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `garde init` | Create the SQLite database and run schema migrations |
//! | `garde ingest <file\|->` | Upsert JSON-lines source records |
//! | `garde backfill` | Extract pending sources |
//! | `garde process <id>` | Extract one source now |
//! | `garde store-extraction <id>` | Persist an extraction produced elsewhere |
//! | `garde extract-prompt <id>` | Print the prompt for an out-of-band extraction |
//! | `garde search "<query>"` | Full-text search |
//! | `garde status` | Archive overview |
//! | `garde rebuild-index` | Regenerate the FTS index |
//! | `garde verify-index` | Compare the FTS index with its base tables |
//! | `garde resolve list\|accept\|reject` | Work the entity review queue |
//! | `garde glossary-check` | Audit the glossary |
//! | `garde prune` | Mark sources whose files are gone as stale |
//!
//! Logs go to stderr and are filtered with `RUST_LOG`
//! (default `garde_archive=info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use garde_archive::models::SourceType;
use garde_archive::search::SearchOptions;
use garde_archive::{backfill, config, db, index, ingest, migrate, review, search, stats};

/// garde: a searchable archive of conversations and notes, digested by an
/// external model.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/garde.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "garde",
    about = "garde: extract, archive and search conversations",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/garde.toml`. Only `[db] path` is required.
    #[arg(long, global = true, default_value = "./config/garde.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the archive tables, and drops
    /// legacy FTS triggers from older databases. Safe to run repeatedly.
    Init,

    /// Ingest normalized source records.
    ///
    /// Reads one JSON record per line from a file, or from stdin with `-`.
    /// New and changed sources become `pending`.
    Ingest {
        /// JSON-lines file, or `-` for stdin.
        input: PathBuf,

        /// Parse and count records without writing.
        #[arg(long)]
        dry_run: bool,
    },

    /// Extract pending sources, one at a time.
    ///
    /// Safe to interrupt: every finished source is committed, and the next
    /// run continues with whatever is still pending.
    Backfill {
        /// Maximum sources to process. Defaults to `[batch] default_limit`.
        /// Zero processes nothing.
        #[arg(long)]
        limit: Option<usize>,

        /// Only this source type (e.g. `claude_code`, `handoff`).
        #[arg(long)]
        source_type: Option<SourceType>,

        /// Also retry sources that failed in earlier runs.
        #[arg(long)]
        retry_failed: bool,

        /// List what would be processed.
        #[arg(long)]
        dry_run: bool,
    },

    /// Extract one source now, whatever its status.
    Process {
        /// Source id, e.g. `claude_code:abc123`.
        source_id: String,
    },

    /// Persist an extraction produced outside the batch.
    ///
    /// Reads the extraction JSON from stdin (or `--file`), writes it to the
    /// staging directory and persists it with `staged:in-session`
    /// provenance.
    StoreExtraction {
        source_id: String,

        /// Read the extraction from this file instead of stdin.
        #[arg(long)]
        file: Option<PathBuf>,

        /// Only write the staged file; the next backfill persists it.
        #[arg(long)]
        stage_only: bool,
    },

    /// Print the extraction prompt for a source.
    ///
    /// For producers that already hold the session's context: answer the
    /// prompt, then pipe the JSON into `garde store-extraction <id>`.
    ExtractPrompt {
        source_id: String,
    },

    /// Search the archive.
    ///
    /// Supports FTS5 operators (`OR`, `AND`, `NOT`) and quoted phrases.
    /// Hyphenated terms are quoted automatically.
    Search {
        /// Search terms; joined with spaces.
        #[arg(required = true)]
        query: Vec<String>,

        #[arg(long)]
        source_type: Option<SourceType>,

        /// Only sources whose project path contains this string.
        #[arg(long)]
        project: Option<String>,

        /// Maximum results. Defaults to `[search] default_limit`.
        #[arg(long, short = 'n')]
        limit: Option<i64>,

        /// Boost recent results with this half-life in days.
        #[arg(long)]
        recency: Option<f64>,
    },

    /// Show counts by status, type and provenance.
    Status,

    /// Regenerate the FTS index from the base tables.
    RebuildIndex,

    /// Check the FTS index against the base tables.
    VerifyIndex,

    /// Work the entity review queue.
    Resolve {
        #[command(subcommand)]
        action: ResolveAction,
    },

    /// Audit the glossary for keys, aliases and mappings that break lookup.
    GlossaryCheck,

    /// Mark sources whose recorded path no longer exists as stale.
    ///
    /// Stale sources keep their summaries and stay searchable.
    Prune {
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum ResolveAction {
    /// List queued mentions.
    List {
        /// Include resolved and rejected entries.
        #[arg(long)]
        all: bool,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Attach a queued mention to an entity.
    Accept {
        id: i64,
        /// Entity key. Defaults to the queued suggestion.
        entity: Option<String>,
    },
    /// Dismiss a queued mention.
    Reject { id: i64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("garde_archive=info,garde=info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            std::fs::create_dir_all(&cfg.staging.dir)?;
            pool.close().await;
            println!("initialized {}", cfg.db.path.display());
        }
        Commands::Ingest { input, dry_run } => {
            ingest::run_ingest(&cfg, &input, dry_run).await?;
        }
        Commands::Backfill {
            limit,
            source_type,
            retry_failed,
            dry_run,
        } => {
            backfill::run_backfill(&cfg, limit, source_type, retry_failed, dry_run).await?;
        }
        Commands::Process { source_id } => {
            backfill::run_process(&cfg, &source_id).await?;
        }
        Commands::StoreExtraction {
            source_id,
            file,
            stage_only,
        } => {
            backfill::run_store_extraction(&cfg, &source_id, file.as_deref(), stage_only).await?;
        }
        Commands::ExtractPrompt { source_id } => {
            backfill::run_extract_prompt(&cfg, &source_id).await?;
        }
        Commands::Search {
            query,
            source_type,
            project,
            limit,
            recency,
        } => {
            let opts = SearchOptions {
                source_type,
                project,
                limit: limit.unwrap_or(cfg.search.default_limit),
                recency_half_life_days: recency,
            };
            search::run_search(&cfg, &query.join(" "), &opts).await?;
        }
        Commands::Status => {
            stats::run_status(&cfg).await?;
        }
        Commands::RebuildIndex => {
            index::run_rebuild(&cfg).await?;
        }
        Commands::VerifyIndex => {
            index::run_verify(&cfg).await?;
        }
        Commands::Resolve { action } => match action {
            ResolveAction::List { all, limit } => review::run_list(&cfg, all, limit).await?,
            ResolveAction::Accept { id, entity } => {
                review::run_accept(&cfg, id, entity.as_deref()).await?
            }
            ResolveAction::Reject { id } => review::run_reject(&cfg, id).await?,
        },
        Commands::GlossaryCheck => {
            review::run_glossary_check(&cfg)?;
        }
        Commands::Prune { dry_run } => {
            ingest::run_prune(&cfg, dry_run).await?;
        }
    }

    Ok(())
}
