//! LanceDB-backed vector index, one table per (tenant, version).
//!
//! Collection naming follows `chatbot_{tenant}_v{version}` so that a build
//! version owns its whole collection: activation is a pointer flip in the
//! relational store, and dropping a version is dropping a table.

use std::collections::HashSet;
use std::sync::Arc;

use arrow_array::{
    Array, BooleanArray, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator,
    StringArray, UInt32Array,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use uuid::Uuid;

use super::VectorIndex;
use crate::error::{RagError, Result};
use crate::types::{collection_name, ChunkRecord, SearchHit};

pub struct LanceVectorIndex {
    db: lancedb::Connection,
    dimension: usize,
}

impl LanceVectorIndex {
    pub async fn open(path: &str, dimension: usize) -> Result<Self> {
        std::fs::create_dir_all(path).ok();
        let db = lancedb::connect(path).execute().await?;
        Ok(Self { db, dimension })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("document_id", DataType::Utf8, false),
            Field::new("chunk_index", DataType::UInt32, false),
            Field::new("page", DataType::UInt32, false),
            Field::new("section", DataType::Utf8, false),
            Field::new("filename", DataType::Utf8, false),
            Field::new("text", DataType::Utf8, false),
            Field::new("is_table", DataType::Boolean, false),
            Field::new("is_caption", DataType::Boolean, false),
            Field::new("heading_level", DataType::UInt32, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimension as i32,
                ),
                true,
            ),
        ]))
    }

    async fn table_names(&self) -> Result<Vec<String>> {
        Ok(self.db.table_names().execute().await?)
    }

    async fn open_table(&self, chatbot_id: Uuid, version: i64) -> Result<lancedb::Table> {
        let name = collection_name(chatbot_id, version);
        self.db
            .open_table(&name)
            .execute()
            .await
            .map_err(|e| RagError::Transient(format!("vector collection {name}: {e}")))
    }

    fn build_batch(&self, chunks: &[ChunkRecord]) -> Result<RecordBatch> {
        for chunk in chunks {
            if chunk.vector.len() != self.dimension {
                return Err(RagError::Validation(format!(
                    "embedding dimension mismatch: chunk has {}, collection expects {}",
                    chunk.vector.len(),
                    self.dimension
                )));
            }
        }

        let ids: Vec<String> = chunks.iter().map(|c| c.id.to_string()).collect();
        let document_ids: Vec<String> = chunks.iter().map(|c| c.document_id.to_string()).collect();
        let chunk_indexes: Vec<u32> = chunks.iter().map(|c| c.chunk_index).collect();
        let pages: Vec<u32> = chunks.iter().map(|c| c.page).collect();
        let sections: Vec<&str> = chunks.iter().map(|c| c.section.as_str()).collect();
        let filenames: Vec<&str> = chunks.iter().map(|c| c.filename.as_str()).collect();
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let is_tables: Vec<bool> = chunks.iter().map(|c| c.is_table).collect();
        let is_captions: Vec<bool> = chunks.iter().map(|c| c.is_caption).collect();
        let heading_levels: Vec<u32> = chunks.iter().map(|c| c.heading_level as u32).collect();

        let flat_vectors: Vec<f32> = chunks
            .iter()
            .flat_map(|c| c.vector.iter().copied())
            .collect();
        let values = Float32Array::from(flat_vectors);
        let vector_field = Field::new("item", DataType::Float32, true);
        let vector_array = FixedSizeListArray::new(
            Arc::new(vector_field),
            self.dimension as i32,
            Arc::new(values) as Arc<dyn Array>,
            None,
        );

        RecordBatch::try_new(
            self.schema(),
            vec![
                Arc::new(StringArray::from(ids)) as Arc<dyn Array>,
                Arc::new(StringArray::from(document_ids)),
                Arc::new(UInt32Array::from(chunk_indexes)),
                Arc::new(UInt32Array::from(pages)),
                Arc::new(StringArray::from(sections)),
                Arc::new(StringArray::from(filenames)),
                Arc::new(StringArray::from(texts)),
                Arc::new(BooleanArray::from(is_tables)),
                Arc::new(BooleanArray::from(is_captions)),
                Arc::new(UInt32Array::from(heading_levels)),
                Arc::new(vector_array) as Arc<dyn Array>,
            ],
        )
        .map_err(|e| RagError::Internal(format!("record batch: {e}")))
    }
}

#[async_trait]
impl VectorIndex for LanceVectorIndex {
    async fn ensure_collection(&self, chatbot_id: Uuid, version: i64) -> Result<()> {
        let name = collection_name(chatbot_id, version);
        if !self.table_names().await?.contains(&name) {
            let schema = self.schema();
            let empty = RecordBatch::new_empty(schema.clone());
            let batches = RecordBatchIterator::new(vec![Ok(empty)], schema);
            self.db.create_table(&name, Box::new(batches)).execute().await?;
            tracing::info!(collection = %name, "created vector collection");
        }
        Ok(())
    }

    async fn upsert_chunks(
        &self,
        chatbot_id: Uuid,
        version: i64,
        chunks: &[ChunkRecord],
    ) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        self.ensure_collection(chatbot_id, version).await?;
        let table = self.open_table(chatbot_id, version).await?;

        // Chunk ids are deterministic; delete-then-insert makes the embed
        // stage idempotent under retries.
        for ids in chunks.chunks(64) {
            let id_list: Vec<String> = ids.iter().map(|c| format!("'{}'", c.id)).collect();
            table
                .delete(&format!("id IN ({})", id_list.join(", ")))
                .await?;
        }

        let batch = self.build_batch(chunks)?;
        let schema = self.schema();
        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table.add(Box::new(reader)).execute().await?;

        tracing::debug!(
            collection = %collection_name(chatbot_id, version),
            chunks = chunks.len(),
            "upserted chunks"
        );
        Ok(())
    }

    async fn search(
        &self,
        chatbot_id: Uuid,
        version: i64,
        query: &[f32],
        top_k: usize,
        score_threshold: f32,
    ) -> Result<Vec<SearchHit>> {
        if query.len() != self.dimension {
            return Err(RagError::Validation(format!(
                "embedding dimension mismatch: query has {}, collection expects {}",
                query.len(),
                self.dimension
            )));
        }
        let name = collection_name(chatbot_id, version);
        if !self.table_names().await?.contains(&name) {
            // A tenant without an active collection retrieves nothing.
            return Ok(Vec::new());
        }
        let table = self.open_table(chatbot_id, version).await?;

        let results = table
            .query()
            .nearest_to(query)?
            .distance_type(lancedb::DistanceType::Cosine)
            .limit(top_k)
            .execute()
            .await?;
        let batches: Vec<RecordBatch> = results.try_collect().await?;

        let mut hits = extract_hits(&batches)?;
        hits.retain(|hit| hit.score >= score_threshold);
        Ok(hits)
    }

    async fn count_chunks(
        &self,
        chatbot_id: Uuid,
        version: i64,
        document_id: Option<Uuid>,
    ) -> Result<usize> {
        let name = collection_name(chatbot_id, version);
        if !self.table_names().await?.contains(&name) {
            return Ok(0);
        }
        let table = self.open_table(chatbot_id, version).await?;
        let filter = document_id.map(|id| format!("document_id = '{id}'"));
        Ok(table.count_rows(filter).await?)
    }

    async fn delete_document(
        &self,
        chatbot_id: Uuid,
        version: i64,
        document_id: Uuid,
    ) -> Result<usize> {
        let name = collection_name(chatbot_id, version);
        if !self.table_names().await?.contains(&name) {
            return Ok(0);
        }
        let table = self.open_table(chatbot_id, version).await?;
        let before = table.count_rows(None).await.unwrap_or(0);
        table
            .delete(&format!("document_id = '{document_id}'"))
            .await?;
        let after = table.count_rows(None).await.unwrap_or(0);
        Ok(before.saturating_sub(after))
    }

    async fn drop_collection(&self, chatbot_id: Uuid, version: i64) -> Result<()> {
        let name = collection_name(chatbot_id, version);
        if self.table_names().await?.contains(&name) {
            self.db.drop_table(&name).await?;
            tracing::info!(collection = %name, "dropped vector collection");
        }
        Ok(())
    }
}

fn extract_hits(batches: &[RecordBatch]) -> Result<Vec<SearchHit>> {
    let mut hits = Vec::new();
    let mut seen: HashSet<Uuid> = HashSet::new();

    for batch in batches {
        let ids = string_column(batch, "id")?;
        let document_ids = string_column(batch, "document_id")?;
        let texts = string_column(batch, "text")?;
        let sections = string_column(batch, "section")?;
        let filenames = string_column(batch, "filename")?;
        let chunk_indexes = u32_column(batch, "chunk_index")?;
        let pages = u32_column(batch, "page")?;
        let distances = batch
            .column_by_name("_distance")
            .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

        for i in 0..batch.num_rows() {
            let id = Uuid::parse_str(ids.value(i))
                .map_err(|e| RagError::Internal(format!("bad chunk id in index: {e}")))?;
            if !seen.insert(id) {
                continue;
            }
            let score = distances
                .map(|d| (1.0 - d.value(i)).max(0.0))
                .unwrap_or(0.0);
            hits.push(SearchHit {
                id,
                document_id: Uuid::parse_str(document_ids.value(i))
                    .map_err(|e| RagError::Internal(format!("bad document id in index: {e}")))?,
                chunk_index: chunk_indexes.value(i),
                page: pages.value(i),
                section: sections.value(i).to_string(),
                filename: filenames.value(i).to_string(),
                text: texts.value(i).to_string(),
                score,
            });
        }
    }
    Ok(hits)
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| RagError::Internal(format!("vector index missing column {name}")))
}

fn u32_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a UInt32Array> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
        .ok_or_else(|| RagError::Internal(format!("vector index missing column {name}")))
}
