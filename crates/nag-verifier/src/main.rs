mod cache;
mod config;
mod error;
mod index;
mod model;
mod policy;
mod postprocess;
mod prompt;
mod rate_limit;
mod retrieval;
mod search;
mod server;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use rag_common::embedding::Embedder;
use rag_common::ollama::{OllamaClient, OllamaClientConfig};
use rag_common::redis::RedisCache;
use rag_common::vectordb::VectorDb;

use cache::IndexCache;
use config::Config;
use index::IndexService;
use policy::SectionPolicy;
use rate_limit::RateLimiter;
use retrieval::{RetrievalSettings, Retriever};
use search::VectorSearch;
use server::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    info!("starting nag-verifier");

    let config = Config::from_env()?;
    info!(
        data_dir = %config.data_dir().display(),
        sources = config.sources.len(),
        lancedb_path = %config.lancedb_path,
        embedder = config.embedder.name(),
        "configuration loaded"
    );

    let redis_cache = RedisCache::new(config.redis_url.as_deref());
    if redis_cache.is_available().await {
        info!("redis connected");
    } else {
        info!("redis unavailable, existing index will be reused as-is");
    }
    let index_cache = IndexCache::new(redis_cache);

    let embedder = Arc::new(Embedder::new(config.embedder).await?);
    info!(
        model = embedder.kind().name(),
        dimensions = embedder.dimensions(),
        "embedding model loaded"
    );

    let vectordb = Arc::new(VectorDb::connect(&config.lancedb_path).await?);

    let docs = IndexService::new(
        config.sources.clone(),
        embedder.clone(),
        vectordb.clone(),
        index_cache,
    )
    .ensure_index()
    .await?;
    info!(docs, "index ready");

    let retriever = Arc::new(Retriever::new(
        Arc::new(VectorSearch::new(embedder, vectordb)),
        Arc::new(SectionPolicy::nag()),
        RetrievalSettings {
            default_k: config.default_k,
            source_bonus: config.source_bonus,
        },
    ));

    let ollama = Arc::new(OllamaClient::new(OllamaClientConfig::from_env())?);
    let ollama_config = ollama.config();
    info!(
        base_url = %ollama_config.base_url,
        model = %ollama_config.model,
        timeout_ms = ollama_config.default_timeout.as_millis(),
        max_retries = ollama_config.max_retries,
        "ollama client configured"
    );

    let limiter = config
        .rate_limit_rps
        .and_then(|rps| RateLimiter::new(rps, config.rate_limit_burst));
    if let Some(limiter) = &limiter {
        info!(rps = limiter.rps(), burst = limiter.burst(), "rate limiting /ask");
    }

    let state = AppState::new(retriever, ollama, limiter, docs, config.max_k);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP server ready");

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("HTTP server shut down");
    Ok(())
}
