use std::path::{Path, PathBuf};

use rag_common::embedding::EmbedderKind;

use crate::error::AppError;

const DEFAULT_SOURCES: [&str; 3] = ["pubmedqa.jsonl", "medqa.jsonl", "nag_all.jsonl"];

/// Application configuration loaded from environment variables.
///
/// Every setting has a default; numeric values that fail to parse fall back to it.
/// Ollama settings are read separately by `OllamaClientConfig::from_env`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the JSONL sources.
    pub data_dir: PathBuf,
    /// JSONL files the index is built from.
    pub sources: Vec<PathBuf>,
    /// Filesystem path to the LanceDB data directory.
    pub lancedb_path: String,
    pub embedder: EmbedderKind,
    pub listen_addr: String,
    /// Redis connection URL. `None` disables the index fingerprint check.
    pub redis_url: Option<String>,
    /// Results per question when the request does not say.
    pub default_k: usize,
    /// Upper bound on requested results per question.
    pub max_k: usize,
    /// Distance bonus for preferred sources in fallback re-ranking.
    pub source_bonus: f32,
    /// Sustained `/ask` admissions per second. `None` disables rate limiting.
    pub rate_limit_rps: Option<u32>,
    /// Questions admitted back to back before the sustained rate applies.
    pub rate_limit_burst: u32,
}

impl Config {
    /// Optional (defaults in parentheses):
    /// - `NAG_DATA_DIR` (`./data`)
    /// - `NAG_SOURCES` (`pubmedqa.jsonl,medqa.jsonl,nag_all.jsonl`), relative to the data dir
    /// - `LANCEDB_PATH` (`{NAG_DATA_DIR}/index_med_rag`)
    /// - `EMBEDDER_MODEL` (`all-MiniLM-L6-v2`)
    /// - `NAG_LISTEN_ADDR` (`127.0.0.1:5009`)
    /// - `REDIS_URL`
    /// - `NAG_TOP_K` (5), `NAG_MAX_TOP_K` (50), `NAG_SOURCE_BONUS` (0.15)
    /// - `RATE_LIMIT_RPS`, `RATE_LIMIT_BURST` (the rate)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let data_dir = PathBuf::from(lookup("NAG_DATA_DIR").unwrap_or_else(|| "./data".to_string()));

        let sources: Vec<PathBuf> = match lookup("NAG_SOURCES") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| data_dir.join(s))
                .collect(),
            None => DEFAULT_SOURCES.iter().map(|s| data_dir.join(s)).collect(),
        };
        if sources.is_empty() {
            return Err(AppError::Config("NAG_SOURCES lists no files".to_string()));
        }

        let lancedb_path = lookup("LANCEDB_PATH").unwrap_or_else(|| {
            data_dir.join("index_med_rag").to_string_lossy().to_string()
        });

        let embedder_name =
            lookup("EMBEDDER_MODEL").unwrap_or_else(|| EmbedderKind::AllMiniLmL6V2.name().to_string());
        let embedder = EmbedderKind::from_name(&embedder_name).ok_or_else(|| {
            AppError::Config(format!("unsupported EMBEDDER_MODEL: {embedder_name}"))
        })?;

        let default_k = lookup("NAG_TOP_K")
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|&k| k > 0)
            .unwrap_or(5);

        let max_k = lookup("NAG_MAX_TOP_K")
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|&k| k > 0)
            .unwrap_or(50)
            .max(default_k);

        let source_bonus = lookup("NAG_SOURCE_BONUS")
            .and_then(|s| s.parse::<f32>().ok())
            .filter(|b| b.is_finite() && *b >= 0.0)
            .unwrap_or(0.15);

        let rate_limit_rps = lookup("RATE_LIMIT_RPS")
            .and_then(|s| s.parse::<u32>().ok())
            .filter(|&rps| rps > 0);
        let rate_limit_burst = lookup("RATE_LIMIT_BURST")
            .and_then(|s| s.parse::<u32>().ok())
            .filter(|&burst| burst > 0)
            .or(rate_limit_rps)
            .unwrap_or(1);

        Ok(Self {
            data_dir,
            sources,
            lancedb_path,
            embedder,
            listen_addr: lookup("NAG_LISTEN_ADDR").unwrap_or_else(|| "127.0.0.1:5009".to_string()),
            redis_url: lookup("REDIS_URL").filter(|s| !s.is_empty()),
            default_k,
            max_k,
            source_bonus,
            rate_limit_rps,
            rate_limit_burst,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}
