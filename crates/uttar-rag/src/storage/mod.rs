//! Storage adapters: relational (SQLite), vector (LanceDB), graph (SQLite).
//!
//! The (tenant, version) pair is the partition key across all three stores;
//! every read and write carries it. The relational store is the single
//! source of truth for lifecycle transitions.

pub mod graph;
pub mod meta;
pub mod vector;

pub use graph::SqliteGraphStore;
pub use meta::{IngestJob, MetaStore};
pub use vector::LanceVectorIndex;

use std::collections::HashMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{ChunkRecord, GraphEdge, GraphNode, SearchHit};

/// Per-(tenant, version) vector collection operations.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create the collection for a (tenant, version) if missing.
    async fn ensure_collection(&self, chatbot_id: Uuid, version: i64) -> Result<()>;

    /// Idempotent upsert: chunks with ids already present are replaced.
    async fn upsert_chunks(&self, chatbot_id: Uuid, version: i64, chunks: &[ChunkRecord])
        -> Result<()>;

    /// Cosine top-K above `score_threshold`, with payloads.
    async fn search(
        &self,
        chatbot_id: Uuid,
        version: i64,
        query: &[f32],
        top_k: usize,
        score_threshold: f32,
    ) -> Result<Vec<SearchHit>>;

    async fn count_chunks(&self, chatbot_id: Uuid, version: i64, document_id: Option<Uuid>)
        -> Result<usize>;

    async fn delete_document(&self, chatbot_id: Uuid, version: i64, document_id: Uuid)
        -> Result<usize>;

    /// Drop the whole collection for a (tenant, version).
    async fn drop_collection(&self, chatbot_id: Uuid, version: i64) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphStats {
    pub node_count: i64,
    pub edge_count: i64,
    pub nodes_by_kind: HashMap<String, i64>,
}

/// Typed knowledge-graph operations scoped by (tenant, version).
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Upsert a node, deduplicating on (tenant, version, kind, normalized
    /// name). On merge the chunk lists union, confidence takes the max, and
    /// the longer description wins. Returns the canonical node id.
    async fn upsert_node(&self, node: &GraphNode) -> Result<Uuid>;

    /// Upsert an edge keyed by (tenant, version, source, target, kind);
    /// score takes the max on conflict.
    async fn upsert_edge(&self, edge: &GraphEdge) -> Result<()>;

    /// Nodes whose chunk lists intersect `chunk_ids`.
    async fn nodes_by_chunk_ids(
        &self,
        chatbot_id: Uuid,
        version: i64,
        chunk_ids: &[Uuid],
    ) -> Result<Vec<GraphNode>>;

    /// Nodes whose normalized name is in `names`.
    async fn nodes_by_names(
        &self,
        chatbot_id: Uuid,
        version: i64,
        names: &[String],
    ) -> Result<Vec<GraphNode>>;

    /// One-hop neighbors of `node_ids` over edges with score ≥ `min_score`,
    /// in either direction. Returns (edge, neighbor) pairs.
    async fn neighbors(
        &self,
        chatbot_id: Uuid,
        version: i64,
        node_ids: &[Uuid],
        min_score: f32,
    ) -> Result<Vec<(GraphEdge, GraphNode)>>;

    /// Edges incident to any of `node_ids` (for fused scoring).
    async fn incident_edges(
        &self,
        chatbot_id: Uuid,
        version: i64,
        node_ids: &[Uuid],
    ) -> Result<Vec<GraphEdge>>;

    async fn delete_version(&self, chatbot_id: Uuid, version: i64) -> Result<u64>;

    async fn delete_chatbot(&self, chatbot_id: Uuid) -> Result<u64>;

    async fn stats(&self, chatbot_id: Uuid, version: i64) -> Result<GraphStats>;
}

/// Check that an edge is storable; enforced by the store as a last line.
pub(crate) fn validate_edge(edge: &GraphEdge) -> Result<()> {
    if !(crate::types::MIN_EDGE_SCORE..=1.0).contains(&edge.score) {
        return Err(crate::error::RagError::Internal(format!(
            "edge score {} outside [{}, 1.0]",
            edge.score,
            crate::types::MIN_EDGE_SCORE
        )));
    }
    Ok(())
}
