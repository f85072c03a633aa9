/// LanceDB vector database wrapper.
///
/// Provides a typed interface over LanceDB for storing and searching vector embeddings.
/// The document table schema is:
/// - id: Utf8 (not null)
/// - source: Utf8 (not null) — corpus tag such as `NAG_A`, empty when unknown
/// - text: Utf8 (not null) — the passage that was embedded
/// - meta: Utf8 (not null) — JSON-encoded metadata object
/// - embedding: FixedSizeList<Float32, dim> (not null)
use std::sync::Arc;

use arrow_array::{RecordBatch, RecordBatchIterator};
use arrow_schema::{DataType, Schema};
use lancedb::query::{ExecutableQuery, QueryBase};
use tracing::info;

use crate::error::CommonError;

pub struct VectorDb {
    db: lancedb::Connection,
}

impl VectorDb {
    /// Connect to a LanceDB database at the given filesystem path.
    pub async fn connect(path: &str) -> Result<Self, CommonError> {
        let db = lancedb::connect(path)
            .execute()
            .await
            .map_err(|e| CommonError::VectorDb(format!("connection failed: {e}")))?;
        Ok(Self { db })
    }

    /// Create or replace a table with the given schema and data.
    ///
    /// This drops the existing table (if any) and creates a fresh one.
    pub async fn create_or_replace_table(
        &self,
        table_name: &str,
        schema: Arc<Schema>,
        batches: Vec<RecordBatch>,
    ) -> Result<(), CommonError> {
        // Table may not exist yet
        let _ = self.db.drop_table(table_name).await;

        let batch_iter = RecordBatchIterator::new(batches.into_iter().map(Ok), schema);
        self.db
            .create_table(table_name, Box::new(batch_iter))
            .execute()
            .await
            .map_err(|e| CommonError::VectorDb(format!("create table failed: {e}")))?;

        info!(table = table_name, "vector table created");
        Ok(())
    }

    /// Whether a table with the given name exists in the database.
    pub async fn table_exists(&self, table_name: &str) -> Result<bool, CommonError> {
        let names = self
            .db
            .table_names()
            .execute()
            .await
            .map_err(|e| CommonError::VectorDb(format!("listing tables failed: {e}")))?;
        Ok(names.iter().any(|n| n == table_name))
    }

    /// Number of rows stored in the table.
    pub async fn count_rows(&self, table_name: &str) -> Result<usize, CommonError> {
        let table = self.open(table_name).await?;
        table
            .count_rows(None)
            .await
            .map_err(|e| CommonError::VectorDb(format!("count rows failed: {e}")))
    }

    /// Width of a `FixedSizeList` vector column in an existing table.
    ///
    /// `None` when the column is missing or is not a fixed-size list.
    pub async fn vector_dimensions(
        &self,
        table_name: &str,
        column: &str,
    ) -> Result<Option<usize>, CommonError> {
        let table = self.open(table_name).await?;
        let schema = table
            .schema()
            .await
            .map_err(|e| CommonError::VectorDb(format!("reading schema failed: {e}")))?;
        Ok(fixed_list_width(&schema, column))
    }

    /// Search for the nearest vectors to the given query embedding.
    ///
    /// Returns up to `limit` results as RecordBatches, ordered by ascending distance and
    /// including a `_distance` column added by LanceDB.
    pub async fn search(
        &self,
        table_name: &str,
        query_embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<RecordBatch>, CommonError> {
        let table = self.open(table_name).await?;

        let results = table
            .vector_search(query_embedding)
            .map_err(|e| CommonError::VectorDb(format!("vector search setup failed: {e}")))?
            .limit(limit)
            .execute()
            .await
            .map_err(|e| CommonError::VectorDb(format!("vector search failed: {e}")))?;

        futures::TryStreamExt::try_collect(results)
            .await
            .map_err(|e| CommonError::VectorDb(format!("collecting search results failed: {e}")))
    }

    async fn open(&self, table_name: &str) -> Result<lancedb::Table, CommonError> {
        self.db
            .open_table(table_name)
            .execute()
            .await
            .map_err(|e| CommonError::VectorDb(format!("open table failed: {e}")))
    }
}

fn fixed_list_width(schema: &Schema, column: &str) -> Option<usize> {
    match schema.field_with_name(column).ok()?.data_type() {
        DataType::FixedSizeList(_, width) => usize::try_from(*width).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use arrow_schema::Field;

    use super::*;

    #[test]
    fn test_fixed_list_width() {
        let schema = Schema::new(vec![
            Field::new("text", DataType::Utf8, false),
            Field::new(
                "embedding",
                DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), 384),
                false,
            ),
        ]);
        assert_eq!(fixed_list_width(&schema, "embedding"), Some(384));
        assert_eq!(fixed_list_width(&schema, "text"), None);
        assert_eq!(fixed_list_width(&schema, "vector"), None);
    }
}
