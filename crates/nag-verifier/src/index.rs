/// Document index build.
///
/// The LanceDB table is built from JSONL sources the first time the server starts, and
/// rebuilt when the sources or the embedding model change (detected through the stored
/// embedding width and a fingerprint kept in Redis). Once serving starts the table is
/// only read.
use std::path::PathBuf;
use std::sync::Arc;

use arrow_array::{ArrayRef, FixedSizeListArray, Float32Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::cache::IndexCache;
use crate::error::AppError;
use crate::model::SourceDocument;
use rag_common::embedding::Embedder;
use rag_common::error::CommonError;
use rag_common::vectordb::VectorDb;

pub const TABLE_NAME: &str = "med_rag";

const EMBEDDING_COLUMN: &str = "embedding";

/// Documents are embedded in chunks of this size so progress can be logged.
const EMBED_CHUNK: usize = 512;

/// What startup found about the stored table and its recorded fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexState {
    pub table_exists: bool,
    /// Width of the stored embedding column, when it could be read.
    pub table_dimensions: Option<usize>,
    pub redis_available: bool,
    pub cached_fingerprint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexAction {
    Reuse,
    Rebuild(&'static str),
}

/// Decide whether the stored table can serve requests for `fingerprint`.
///
/// A table with a different embedding width is always rebuilt. With Redis reachable, a
/// missing or different fingerprint also forces a rebuild, since the table's origin is
/// unknown. Without Redis only the width can be checked.
pub fn plan_index(state: &IndexState, fingerprint: &str, dimensions: usize) -> IndexAction {
    if !state.table_exists {
        return IndexAction::Rebuild("table missing");
    }
    if state.table_dimensions != Some(dimensions) {
        return IndexAction::Rebuild("embedding dimensions differ from the configured model");
    }
    match state.cached_fingerprint.as_deref() {
        Some(cached) if cached != fingerprint => IndexAction::Rebuild("sources or embedder changed"),
        Some(_) => IndexAction::Reuse,
        None if state.redis_available => IndexAction::Rebuild("no fingerprint recorded"),
        None => IndexAction::Reuse,
    }
}

/// Row count of a reused table; an empty table cannot serve requests.
fn require_rows(docs: usize) -> Result<usize, AppError> {
    if docs == 0 {
        return Err(AppError::Index(format!(
            "table {TABLE_NAME} is empty; delete the LanceDB directory and rebuild"
        )));
    }
    Ok(docs)
}

fn require_documents(documents: Vec<SourceDocument>) -> Result<Vec<SourceDocument>, AppError> {
    if documents.is_empty() {
        return Err(AppError::Index(
            "no documents found in sources; check the JSONL paths".to_string(),
        ));
    }
    Ok(documents)
}

pub struct IndexService {
    sources: Vec<PathBuf>,
    embedder: Arc<Embedder>,
    vectordb: Arc<VectorDb>,
    cache: IndexCache,
}

impl IndexService {
    pub fn new(
        sources: Vec<PathBuf>,
        embedder: Arc<Embedder>,
        vectordb: Arc<VectorDb>,
        cache: IndexCache,
    ) -> Self {
        Self {
            sources,
            embedder,
            vectordb,
            cache,
        }
    }

    /// Make sure the document table exists and is current. Returns the document count.
    pub async fn ensure_index(&self) -> Result<usize, AppError> {
        let kind = self.embedder.kind();
        let fingerprint = source_fingerprint(&self.sources, kind.name(), kind.dimensions());
        let state = self.inspect().await?;

        match plan_index(&state, &fingerprint, kind.dimensions()) {
            IndexAction::Reuse => {
                let docs = require_rows(self.vectordb.count_rows(TABLE_NAME).await?)?;
                info!(docs, "loaded existing index");
                Ok(docs)
            }
            IndexAction::Rebuild(reason) => {
                info!(reason, "building index from sources");
                let documents = require_documents(load_jsonl(&self.sources)?)?;
                self.build(&documents, &fingerprint).await
            }
        }
    }

    async fn inspect(&self) -> Result<IndexState, AppError> {
        let table_exists = self.vectordb.table_exists(TABLE_NAME).await?;
        let table_dimensions = if table_exists {
            self.vectordb
                .vector_dimensions(TABLE_NAME, EMBEDDING_COLUMN)
                .await?
        } else {
            None
        };
        Ok(IndexState {
            table_exists,
            table_dimensions,
            redis_available: self.cache.is_available().await,
            cached_fingerprint: self.cache.get_fingerprint(TABLE_NAME).await,
        })
    }

    async fn build(
        &self,
        documents: &[SourceDocument],
        fingerprint: &str,
    ) -> Result<usize, AppError> {
        let texts: Vec<String> = documents.iter().map(|d| d.text.clone()).collect();

        let mut embeddings = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(EMBED_CHUNK) {
            embeddings.extend(self.embedder.embed_documents(chunk).await?);
            info!(embedded = embeddings.len(), total = texts.len(), "embedding documents");
        }
        if embeddings.len() != documents.len() {
            return Err(AppError::Common(CommonError::Embedding(format!(
                "embedding count mismatch: expected {}, got {}",
                documents.len(),
                embeddings.len()
            ))));
        }

        let batch = build_record_batch(documents, &embeddings, self.embedder.dimensions())?;
        let schema = batch.schema();
        self.vectordb
            .create_or_replace_table(TABLE_NAME, schema, vec![batch])
            .await?;

        if !self.cache.set_fingerprint(TABLE_NAME, fingerprint).await {
            warn!("index fingerprint not stored, source changes will not trigger a rebuild");
        }

        info!(docs = documents.len(), dim = self.embedder.dimensions(), "built index");
        Ok(documents.len())
    }
}

/// Read every source file. Missing files are skipped with a warning.
pub fn load_jsonl(paths: &[PathBuf]) -> Result<Vec<SourceDocument>, AppError> {
    let mut documents = Vec::new();
    for path in paths {
        if !path.exists() {
            warn!(path = %path.display(), "missing source file");
            continue;
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Index(format!("failed to read {}: {e}", path.display())))?;
        let parsed = parse_jsonl(&content);
        info!(path = %path.display(), documents = parsed.len(), "loaded source file");
        documents.extend(parsed);
    }
    Ok(documents)
}

/// Parse JSONL content into documents, skipping undecodable lines and empty texts.
pub fn parse_jsonl(content: &str) -> Vec<SourceDocument> {
    content
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter_map(|obj| {
            let text = obj.get("text").and_then(Value::as_str)?.trim();
            if text.is_empty() {
                return None;
            }
            let meta = obj
                .get("meta")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            Some(SourceDocument {
                text: text.to_string(),
                meta,
            })
        })
        .collect()
}

/// sha256 over the embedding model, then each source path and its bytes. Missing files
/// hash as a marker.
pub fn source_fingerprint(paths: &[PathBuf], model: &str, dimensions: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update(b"\0");
    hasher.update(dimensions.to_le_bytes());
    hasher.update(b"\0");
    for path in paths {
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update(b"\0");
        match std::fs::read(path) {
            Ok(bytes) => hasher.update(&bytes),
            Err(_) => hasher.update(b"<missing>"),
        }
        hasher.update(b"\0");
    }
    format!("{:x}", hasher.finalize())
}

/// Build an Arrow RecordBatch from documents and their embeddings.
fn build_record_batch(
    documents: &[SourceDocument],
    embeddings: &[Vec<f32>],
    dimensions: usize,
) -> Result<RecordBatch, AppError> {
    let embedding_dim = i32::try_from(dimensions)
        .map_err(|_| AppError::Index(format!("embedding dimension too large: {dimensions}")))?;

    let ids: Vec<String> = (0..documents.len()).map(|i| i.to_string()).collect();
    let sources: Vec<&str> = documents.iter().map(SourceDocument::source).collect();
    let texts: Vec<&str> = documents.iter().map(|d| d.text.as_str()).collect();
    let metas: Vec<String> = documents
        .iter()
        .map(|d| Value::Object(d.meta.clone()).to_string())
        .collect();

    let id_array: ArrayRef = Arc::new(StringArray::from(ids));
    let source_array: ArrayRef = Arc::new(StringArray::from(sources));
    let text_array: ArrayRef = Arc::new(StringArray::from(texts));
    let meta_array: ArrayRef = Arc::new(StringArray::from(metas));

    let flat_values: Vec<f32> = embeddings.iter().flat_map(|e| e.iter().copied()).collect();
    let values_array = Float32Array::from(flat_values);
    let embedding_array: ArrayRef = Arc::new(
        FixedSizeListArray::try_new(
            Arc::new(Field::new("item", DataType::Float32, true)),
            embedding_dim,
            Arc::new(values_array),
            None,
        )
        .map_err(|e| {
            AppError::Common(CommonError::VectorDb(format!(
                "failed to build embedding array: {e}"
            )))
        })?,
    );

    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("source", DataType::Utf8, false),
        Field::new("text", DataType::Utf8, false),
        Field::new("meta", DataType::Utf8, false),
        Field::new(
            EMBEDDING_COLUMN,
            DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), embedding_dim),
            false,
        ),
    ]));

    RecordBatch::try_new(
        schema,
        vec![id_array, source_array, text_array, meta_array, embedding_array],
    )
    .map_err(|e| {
        AppError::Common(CommonError::VectorDb(format!(
            "failed to build record batch: {e}"
        )))
    })
}
