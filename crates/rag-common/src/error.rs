/// Error types shared by the retrieval backend crates.
///
/// These errors represent failures in infrastructure components (vector DB, embeddings).
/// Application-specific errors are defined in the server crate and wrap `CommonError` via
/// `#[from]`.

#[derive(Debug, thiserror::Error)]
pub enum CommonError {
    #[error("vector db error: {0}")]
    VectorDb(String),

    #[error("embedding error: {0}")]
    Embedding(String),
}
