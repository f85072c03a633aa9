/// Embedding wrapper around fastembed.
///
/// `TextEmbedding` from fastembed is synchronous and CPU-bound. All embed calls go through
/// `tokio::task::spawn_blocking`. The inner ONNX session is shared via `Arc` and accessed
/// only from blocking tasks.
///
/// Two models are supported:
/// - all-MiniLM-L6-v2 (384 dims, raw inputs) — the model the medical index is built with
/// - nomic-embed-text-v1.5 (768 dims, task-prefixed inputs:
///   "search_document: {text}" / "search_query: {text}")
use std::sync::Arc;

use crate::error::CommonError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedderKind {
    AllMiniLmL6V2,
    NomicEmbedTextV15,
}

impl EmbedderKind {
    /// Parse a model name as written in configuration (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "all-minilm-l6-v2" | "sentence-transformers/all-minilm-l6-v2" => {
                Some(Self::AllMiniLmL6V2)
            }
            "nomic-embed-text-v1.5" | "nomic-ai/nomic-embed-text-v1.5" => {
                Some(Self::NomicEmbedTextV15)
            }
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::AllMiniLmL6V2 => "all-MiniLM-L6-v2",
            Self::NomicEmbedTextV15 => "nomic-embed-text-v1.5",
        }
    }

    pub fn dimensions(self) -> usize {
        match self {
            Self::AllMiniLmL6V2 => 384,
            Self::NomicEmbedTextV15 => 768,
        }
    }

    fn document_prefix(self) -> &'static str {
        match self {
            Self::AllMiniLmL6V2 => "",
            Self::NomicEmbedTextV15 => "search_document: ",
        }
    }

    fn query_prefix(self) -> &'static str {
        match self {
            Self::AllMiniLmL6V2 => "",
            Self::NomicEmbedTextV15 => "search_query: ",
        }
    }

    fn fastembed_model(self) -> fastembed::EmbeddingModel {
        match self {
            Self::AllMiniLmL6V2 => fastembed::EmbeddingModel::AllMiniLML6V2,
            Self::NomicEmbedTextV15 => fastembed::EmbeddingModel::NomicEmbedTextV15,
        }
    }
}

/// Wraps fastembed's `TextEmbedding` model for generating vector embeddings.
pub struct Embedder {
    kind: EmbedderKind,
    model: Arc<fastembed::TextEmbedding>,
}

impl Embedder {
    /// Initialize the embedding model.
    ///
    /// This downloads the model on first run. The download happens synchronously
    /// inside a blocking task.
    pub async fn new(kind: EmbedderKind) -> Result<Self, CommonError> {
        let model = tokio::task::spawn_blocking(move || {
            let options = fastembed::InitOptions::new(kind.fastembed_model())
                .with_show_download_progress(true);
            fastembed::TextEmbedding::try_new(options)
        })
        .await
        .map_err(|e| CommonError::Embedding(format!("spawn_blocking join error: {e}")))?
        .map_err(|e| CommonError::Embedding(format!("model initialization failed: {e}")))?;

        Ok(Self {
            kind,
            model: Arc::new(model),
        })
    }

    /// Embed documents for indexing.
    ///
    /// Documents are processed in small batches to bound peak memory during ONNX inference.
    pub async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CommonError> {
        let prefix = self.kind.document_prefix();
        let prefixed: Vec<String> = texts.iter().map(|t| format!("{prefix}{t}")).collect();
        let model = Arc::clone(&self.model);
        tokio::task::spawn_blocking(move || model.embed(prefixed, Some(16)))
            .await
            .map_err(|e| CommonError::Embedding(format!("spawn_blocking join error: {e}")))?
            .map_err(|e| CommonError::Embedding(format!("document embedding failed: {e}")))
    }

    /// Embed a single query for search.
    pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>, CommonError> {
        let prefixed = vec![format!("{}{query}", self.kind.query_prefix())];
        let model = Arc::clone(&self.model);
        let mut results =
            tokio::task::spawn_blocking(move || model.embed(prefixed, None))
                .await
                .map_err(|e| CommonError::Embedding(format!("spawn_blocking join error: {e}")))?
                .map_err(|e| CommonError::Embedding(format!("query embedding failed: {e}")))?;
        results
            .pop()
            .ok_or_else(|| CommonError::Embedding("empty embedding result".to_string()))
    }

    pub fn kind(&self) -> EmbedderKind {
        self.kind
    }

    /// Returns the dimensionality of the embedding vectors.
    pub fn dimensions(&self) -> usize {
        self.kind.dimensions()
    }
}
