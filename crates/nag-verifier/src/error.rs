use rag_common::error::CommonError;
use rag_common::ollama::OllamaClientError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Common(#[from] CommonError),

    #[error("config error: {0}")]
    Config(String),

    #[error("index error: {0}")]
    Index(String),

    #[error("similarity search unavailable: {0}")]
    SearchUnavailable(#[source] CommonError),

    #[error(transparent)]
    Generation(#[from] OllamaClientError),
}
