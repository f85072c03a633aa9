/// Vector search over the document index.
///
/// Embeds a query using the fastembed model and runs a nearest-neighbour search in
/// LanceDB. Results keep LanceDB's ascending-distance order.
use std::sync::Arc;

use arrow_array::{Array, Float32Array, RecordBatch, StringArray};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::AppError;
use crate::index::TABLE_NAME;
use crate::model::Candidate;
use crate::retrieval::SimilaritySearch;
use rag_common::embedding::Embedder;
use rag_common::vectordb::VectorDb;

pub struct VectorSearch {
    embedder: Arc<Embedder>,
    vectordb: Arc<VectorDb>,
}

impl VectorSearch {
    pub fn new(embedder: Arc<Embedder>, vectordb: Arc<VectorDb>) -> Self {
        Self { embedder, vectordb }
    }
}

#[async_trait]
impl SimilaritySearch for VectorSearch {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<Candidate>, AppError> {
        let query_embedding = self
            .embedder
            .embed_query(query)
            .await
            .map_err(AppError::SearchUnavailable)?;
        let batches = self
            .vectordb
            .search(TABLE_NAME, &query_embedding, k)
            .await
            .map_err(AppError::SearchUnavailable)?;

        Ok(extract_candidates(&batches))
    }
}

/// Convert LanceDB result batches into candidates ranked 1..N in result order.
///
/// Expected columns: text (Utf8), meta (Utf8 JSON), _distance (Float32).
/// Rows with empty text are dropped, and so are batches missing any of these columns.
fn extract_candidates(batches: &[RecordBatch]) -> Vec<Candidate> {
    let mut candidates = Vec::new();

    for batch in batches {
        let schema = batch.schema();
        let text_col = get_string_column(batch, &schema, "text");
        let meta_col = get_string_column(batch, &schema, "meta");
        let distance_col = get_float_column(batch, &schema, "_distance");

        let (Some(text_col), Some(meta_col), Some(distance_col)) = (text_col, meta_col, distance_col)
        else {
            warn!(rows = batch.num_rows(), "search result batch missing text, meta or _distance column");
            continue;
        };

        for row in 0..batch.num_rows() {
            let text = text_col.value(row);
            if text.is_empty() {
                continue;
            }
            candidates.push(Candidate {
                rank: candidates.len() + 1,
                distance: distance_col.value(row),
                text: text.to_string(),
                meta: parse_meta(meta_col.value(row)),
            });
        }
    }

    candidates
}

fn parse_meta(raw: &str) -> Map<String, Value> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        Ok(_) => Map::new(),
        Err(e) => {
            warn!(error = %e, "stored metadata is not valid JSON");
            Map::new()
        }
    }
}

fn get_string_column<'a>(
    batch: &'a RecordBatch,
    schema: &arrow_schema::Schema,
    name: &str,
) -> Option<&'a StringArray> {
    let idx = schema.index_of(name).ok()?;
    batch.column(idx).as_any().downcast_ref::<StringArray>()
}

fn get_float_column<'a>(
    batch: &'a RecordBatch,
    schema: &arrow_schema::Schema,
    name: &str,
) -> Option<&'a Float32Array> {
    let idx = schema.index_of(name).ok()?;
    batch.column(idx).as_any().downcast_ref::<Float32Array>()
}
