use anyhow::{Context, Result};
use axum::Router;
use clap::{Parser, ValueEnum};
use issue_search_core::config::EmbedderConfig;
use issue_search_core::embedding::provider_from_config;
use issue_search_core::persist::load_meta;
use std::net::SocketAddr;
use tracing_subscriber::{fmt, EnvFilter};
use server::build_app;
use tokio::net::TcpListener;

#[derive(Clone, Copy, ValueEnum)]
enum EmbedderKind {
    Hashing,
    Openai,
}

#[derive(Parser)]
struct Args {
    /// Snapshot directory path
    #[arg(long, default_value = "./index")]
    index: String,
    /// Host to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    /// Port to bind
    #[arg(long, default_value_t = 8080)]
    port: u16,
    /// Query embedder; inferred from the snapshot when omitted
    #[arg(long, value_enum)]
    embedder: Option<EmbedderKind>,
    /// Base URL of an OpenAI-compatible API
    #[arg(long, default_value = "https://api.openai.com/v1")]
    embedding_url: String,
    #[arg(long, default_value_t = 30)]
    embedding_timeout_secs: u64,
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();

    // The query embedder must produce vectors comparable to the indexed ones.
    let meta = load_meta(&args.index).with_context(|| format!("reading snapshot {}", args.index))?;
    let hashing = meta.embedder.starts_with("hashing-");
    let embedder_config = match args.embedder {
        Some(EmbedderKind::Hashing) => EmbedderConfig::Hashing { dimension: meta.dimension },
        None if hashing => EmbedderConfig::Hashing { dimension: meta.dimension },
        Some(EmbedderKind::Openai) | None => EmbedderConfig::OpenAi {
            base_url: args.embedding_url.clone(),
            model: meta.embedder.clone(),
            dimension: meta.dimension,
            timeout_secs: args.embedding_timeout_secs,
        },
    };
    let embedder = provider_from_config(&embedder_config, args.api_key.clone())?;
    let app: Router = build_app(args.index.clone(), embedder)?;

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, index = %args.index, "server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
