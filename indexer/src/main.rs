use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use issue_search_core::config::{EmbedderConfig, SearchConfig};
use issue_search_core::embedding::provider_from_config;
use issue_search_core::persist::{load_meta, load_snapshot, save_snapshot};
use issue_search_core::source::{read_json, read_jsonl, RawIssue};
use issue_search_core::{CancelHandle, IndexBuilder, SourceError};
use tracing_subscriber::{EnvFilter, fmt};
use walkdir::WalkDir;

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "indexer")]
#[command(about = "Build and inspect hybrid BM25 + HNSW issue search snapshots", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum EmbedderKind {
    Hashing,
    Openai,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a snapshot from JSON/JSONL issue exports (a file or a directory of them)
    Build {
        /// Input path (file or directory)
        #[arg(long)]
        input: String,
        /// Output snapshot directory
        #[arg(long)]
        output: String,
        /// JSON config file; flags below override it
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, value_enum)]
        embedder: Option<EmbedderKind>,
        /// Embedding vector length
        #[arg(long)]
        dimension: Option<usize>,
        /// Embedding model name (openai only)
        #[arg(long)]
        model: Option<String>,
        /// Base URL of an OpenAI-compatible API (openai only)
        #[arg(long)]
        embedding_url: Option<String>,
        /// Documents per embedding request
        #[arg(long)]
        batch_size: Option<usize>,
        /// Embedding requests in flight at once
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
        api_key: Option<String>,
    },
    /// Load and validate a snapshot, then print its statistics
    Inspect {
        #[arg(long)]
        index: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Build { input, output, config, embedder, dimension, model, embedding_url, batch_size, concurrency, api_key } => {
            let mut cfg = match config {
                Some(path) => SearchConfig::from_json_file(&path).with_context(|| format!("loading config {}", path.display()))?,
                None => SearchConfig::default(),
            };
            apply_overrides(&mut cfg, embedder, dimension, model, embedding_url, batch_size, concurrency)?;
            cfg.validate()?;
            build_index(Path::new(&input), Path::new(&output), cfg, api_key).await
        }
        Commands::Inspect { index } => inspect_index(Path::new(&index)),
    }
}

fn apply_overrides(
    cfg: &mut SearchConfig,
    kind: Option<EmbedderKind>,
    dimension: Option<usize>,
    model: Option<String>,
    embedding_url: Option<String>,
    batch_size: Option<usize>,
    concurrency: Option<usize>,
) -> Result<()> {
    match kind {
        Some(EmbedderKind::Hashing) if !matches!(cfg.embedder, EmbedderConfig::Hashing { .. }) => {
            cfg.embedder = EmbedderConfig::default();
        }
        Some(EmbedderKind::Openai) if !matches!(cfg.embedder, EmbedderConfig::OpenAi { .. }) => {
            cfg.embedder = EmbedderConfig::openai_default();
        }
        _ => {}
    }
    match &mut cfg.embedder {
        EmbedderConfig::Hashing { dimension: d } => {
            if model.is_some() || embedding_url.is_some() {
                bail!("--model and --embedding-url only apply to the openai embedder");
            }
            if let Some(v) = dimension { *d = v; }
        }
        EmbedderConfig::OpenAi { base_url, model: m, dimension: d, .. } => {
            if let Some(v) = dimension { *d = v; }
            if let Some(v) = model { *m = v; }
            if let Some(v) = embedding_url { *base_url = v; }
        }
    }
    if let Some(v) = batch_size { cfg.build.batch_size = v; }
    if let Some(v) = concurrency { cfg.build.concurrency = v; }
    Ok(())
}

fn collect_files(input: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = Vec::new();
    if input.is_dir() {
        for entry in WalkDir::new(input).sort_by_file_name().into_iter().filter_map(|e| e.ok()) {
            let p = entry.path();
            if p.is_file() {
                if let Some(ext) = p.extension().and_then(|s| s.to_str()) {
                    if matches!(ext, "json" | "jsonl") {
                        files.push(p.to_path_buf());
                    }
                }
            }
        }
    } else if input.is_file() {
        files.push(input.to_path_buf());
    } else {
        bail!("input {} does not exist", input.display());
    }
    Ok(files)
}

fn read_records(files: &[PathBuf]) -> Result<Vec<std::result::Result<RawIssue, SourceError>>> {
    let mut records = Vec::new();
    for file in files {
        let f = File::open(file).with_context(|| format!("opening {}", file.display()))?;
        let reader = BufReader::new(f);
        let before = records.len();
        if file.extension().and_then(|s| s.to_str()) == Some("jsonl") {
            records.extend(read_jsonl(reader));
        } else {
            match read_json(reader) {
                Ok(parsed) => records.extend(parsed),
                Err(e) => records.push(Err(e)),
            }
        }
        tracing::debug!(file = %file.display(), records = records.len() - before, "read source file");
    }
    Ok(records)
}

async fn build_index(input: &Path, output: &Path, cfg: SearchConfig, api_key: Option<String>) -> Result<()> {
    let files = collect_files(input)?;
    tracing::info!(files = files.len(), input = %input.display(), "reading issue exports");
    let records = read_records(&files)?;

    let embedder = provider_from_config(&cfg.embedder, api_key)?;
    let cancel = CancelHandle::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling build after the current batch");
            on_interrupt.cancel();
        }
    });

    let builder = IndexBuilder::new(embedder, cfg).with_cancel(cancel);
    let (snapshot, report) = builder.build_from_records(records).await.context("building snapshot")?;
    let meta = save_snapshot(output, &snapshot).with_context(|| format!("saving snapshot to {}", output.display()))?;

    println!("{report}");
    tracing::info!(output = %output.display(), docs = meta.num_docs, embedded = meta.num_embedded, "index build complete");
    Ok(())
}

fn inspect_index(root: &Path) -> Result<()> {
    let meta = load_meta(root).with_context(|| format!("reading {}", root.display()))?;
    let snapshot = load_snapshot(root).with_context(|| format!("validating {}", root.display()))?;
    let stats = snapshot.corpus_stats();
    let created = meta
        .created_at
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| meta.created_at.to_string());

    println!("snapshot      {}", root.display());
    println!("version       {}", meta.version);
    println!("created_at    {created}");
    println!("embedder      {} (dimension {}, {:?})", meta.embedder, meta.dimension, meta.metric);
    println!("documents     {}", stats.document_count);
    println!("embedded      {}", snapshot.dense().len());
    println!("terms         {}", stats.term_count);
    println!("avg doc len   {:.2}", stats.average_document_length);
    println!("graph layers  {:?}", snapshot.dense().layer_counts());
    println!("analyzer      {}", serde_json::to_string(&meta.analyzer)?);
    Ok(())
}
