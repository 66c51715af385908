//! # docqa CLI
//!
//! ```bash
//! docqa --config ./config/docqa.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docqa init` | Create the SQLite database and run schema migrations |
//! | `docqa ingest <path>...` | Ingest files or directories |
//! | `docqa query "<text>"` | Answer a question from the ingested documents |
//! | `docqa chunks` | Inspect stored chunks |
//! | `docqa delete <id>` | Delete a document and its chunks |
//! | `docqa health` | Show generator tier availability |
//! | `docqa stats` | Document, chunk, and embedding counts |
//! | `docqa embed pending` | Embed chunks stored without vectors |
//! | `docqa serve` | Start the HTTP API |
//!
//! Log verbosity is controlled with `RUST_LOG` (default `info`); logs go to
//! stderr so command output on stdout stays clean.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use docqa::{build_pipeline, config, migrate, server};
use docqa_core::models::{Answer, ChunkFilter, Document, DocumentFormat};
use docqa_core::Pipeline;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

/// Question answering over a private document collection.
#[derive(Parser)]
#[command(name = "docqa", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docqa.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Ingest files or directories.
    ///
    /// Directories are walked recursively. Files whose extension is not a
    /// supported format are skipped. Re-ingesting a path replaces the
    /// earlier version of that document.
    Ingest {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Answer a question.
    Query {
        text: String,

        /// Print the answer as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List stored chunks.
    Chunks {
        #[arg(long)]
        document: Option<String>,

        #[arg(long)]
        source: Option<String>,

        /// Case-insensitive substring of the chunk text.
        #[arg(long)]
        contains: Option<String>,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Delete a document by id.
    Delete { id: String },

    /// Probe the configured generator tiers.
    Health,

    /// Show store counts.
    Stats,

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed chunks that were stored without a vector.
    Pending {
        /// Maximum number of chunks to embed in this run.
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { paths } => {
            let pipeline = build_pipeline(&cfg).await?;
            run_ingest(&pipeline, &paths).await?;
        }
        Commands::Query { text, json } => {
            let pipeline = build_pipeline(&cfg).await?;
            let answer = pipeline.query(&text).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&answer)?);
            } else {
                print_answer(&answer);
            }
        }
        Commands::Chunks {
            document,
            source,
            contains,
            offset,
            limit,
        } => {
            let pipeline = build_pipeline(&cfg).await?;
            let filter = ChunkFilter {
                document_id: document,
                source,
                text_contains: contains,
                offset,
                limit: Some(limit),
            };
            let chunks = pipeline.search_chunks(&filter).await?;
            if chunks.is_empty() {
                println!("No chunks found.");
            }
            for chunk in chunks {
                println!(
                    "{}  [{}..{}]  {}",
                    chunk.id, chunk.char_range.start, chunk.char_range.end, chunk.metadata.source
                );
                println!("    {}", preview(&chunk.text, 120));
            }
        }
        Commands::Delete { id } => {
            let pipeline = build_pipeline(&cfg).await?;
            let removed = pipeline.delete(&id).await?;
            if removed == 0 {
                anyhow::bail!("Document not found: {}", id);
            }
            println!("Deleted document {} ({} chunks).", id, removed);
        }
        Commands::Health => {
            let pipeline = build_pipeline(&cfg).await?;
            for (tier, available) in pipeline.check_health().await {
                let status = if available { "available" } else { "unavailable" };
                println!("{:<16} {}", tier, status);
            }
        }
        Commands::Stats => {
            let pipeline = build_pipeline(&cfg).await?;
            let stats = pipeline.stats().await?;
            println!("Documents:        {}", stats.documents);
            println!("Chunks:           {}", stats.chunks);
            println!("Embedded chunks:  {}", stats.embedded_chunks);
        }
        Commands::Embed {
            action: EmbedAction::Pending { limit },
        } => {
            let pipeline = build_pipeline(&cfg).await?;
            let embedded = pipeline
                .backfill_embeddings(limit.unwrap_or(usize::MAX))
                .await?;
            println!("Embedded {} chunks.", embedded);
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}

/// Ingest every supported file under `paths`, continuing past failures.
async fn run_ingest(pipeline: &Pipeline, paths: &[PathBuf]) -> anyhow::Result<()> {
    let (mut ingested, mut skipped, mut failed) = (0usize, 0usize, 0usize);

    for file in collect_files(paths)? {
        let Some(format) = DocumentFormat::from_path(&file) else {
            skipped += 1;
            continue;
        };
        let bytes = std::fs::read(&file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        let document = Document::new(file.display().to_string(), format, bytes);

        match pipeline.ingest(document).await {
            Ok(report) => {
                ingested += 1;
                println!(
                    "ingested {} -> {} ({} chunks, {} embedded)",
                    file.display(),
                    report.document_id,
                    report.chunk_count,
                    report.embedded_count
                );
            }
            Err(e) => {
                failed += 1;
                warn!(path = %file.display(), error = %e, "ingest failed");
                println!("failed   {}: {}", file.display(), e);
            }
        }
    }

    println!(
        "Ingest complete: {} ingested, {} skipped, {} failed.",
        ingested, skipped, failed
    );
    if ingested == 0 && failed > 0 {
        anyhow::bail!("No documents were ingested");
    }
    Ok(())
}

fn collect_files(paths: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if !path.exists() {
            anyhow::bail!("Path does not exist: {}", path.display());
        }
        let walker = WalkDir::new(path)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e.path()));
        for entry in walker {
            let entry = entry?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
    }
    Ok(files)
}

fn print_answer(answer: &Answer) {
    println!("{}", answer.text);
    println!();
    println!("Generator:   {}", answer.generator_used);
    println!("Confidence:  {:.2}", answer.confidence);
    if answer.retrieval_degraded {
        println!("Retrieval:   degraded (keyword only)");
    }
    if let Some(ref fields) = answer.structured_fields {
        println!("Decision:    {}", fields.decision.as_str());
        if let Some(amount) = fields.amount {
            println!("Amount:      {}", amount);
        }
    }
    if !answer.source_chunk_ids.is_empty() {
        println!("Sources:");
        for id in &answer.source_chunk_ids {
            println!("  {}", id);
        }
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}...", cut)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}
