//! SQLite-backed knowledge graph store.
//!
//! Nodes dedup on (tenant, version, kind, normalized name); edges dedup on
//! (tenant, version, source, target, kind). Traversal is bounded BFS in the
//! retriever over `neighbors()` calls, so no graph engine is needed here.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{validate_edge, GraphStats, GraphStore};
use crate::error::{RagError, Result};
use crate::types::{EdgeKind, GraphEdge, GraphNode, NodeKind};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS graph_nodes (
    id TEXT PRIMARY KEY,
    chatbot_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    kind TEXT NOT NULL,
    name TEXT NOT NULL,
    normalized_name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    chunk_ids TEXT NOT NULL DEFAULT '[]',
    confidence REAL NOT NULL,
    UNIQUE (chatbot_id, version, kind, normalized_name)
);
CREATE INDEX IF NOT EXISTS idx_graph_nodes_scope ON graph_nodes(chatbot_id, version);
CREATE INDEX IF NOT EXISTS idx_graph_nodes_name ON graph_nodes(chatbot_id, version, normalized_name);

CREATE TABLE IF NOT EXISTS graph_edges (
    id TEXT PRIMARY KEY,
    chatbot_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    source_id TEXT NOT NULL,
    target_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    score REAL NOT NULL,
    context TEXT,
    dependency_kind TEXT,
    UNIQUE (chatbot_id, version, source_id, target_id, kind)
);
CREATE INDEX IF NOT EXISTS idx_graph_edges_source ON graph_edges(chatbot_id, version, source_id);
CREATE INDEX IF NOT EXISTS idx_graph_edges_target ON graph_edges(chatbot_id, version, target_id);
"#;

pub struct SqliteGraphStore {
    pool: SqlitePool,
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| RagError::Internal(format!("bad uuid {raw:?}: {e}")))
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

impl SqliteGraphStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    fn row_to_node(row: &sqlx::sqlite::SqliteRow) -> Result<GraphNode> {
        let kind_raw: String = row.get("kind");
        let chunk_ids_raw: String = row.get("chunk_ids");
        let chunk_ids: Vec<String> = serde_json::from_str(&chunk_ids_raw)?;
        Ok(GraphNode {
            id: parse_id(&row.get::<String, _>("id"))?,
            chatbot_id: parse_id(&row.get::<String, _>("chatbot_id"))?,
            version: row.get("version"),
            kind: NodeKind::parse(&kind_raw)
                .ok_or_else(|| RagError::Internal(format!("bad node kind {kind_raw:?}")))?,
            name: row.get("name"),
            normalized_name: row.get("normalized_name"),
            description: row.get("description"),
            chunk_ids: chunk_ids
                .iter()
                .map(|raw| parse_id(raw))
                .collect::<Result<Vec<_>>>()?,
            confidence: row.get::<f64, _>("confidence") as f32,
        })
    }

    fn row_to_edge(row: &sqlx::sqlite::SqliteRow) -> Result<GraphEdge> {
        let kind_raw: String = row.get("kind");
        Ok(GraphEdge {
            id: parse_id(&row.get::<String, _>("id"))?,
            chatbot_id: parse_id(&row.get::<String, _>("chatbot_id"))?,
            version: row.get("version"),
            source_id: parse_id(&row.get::<String, _>("source_id"))?,
            target_id: parse_id(&row.get::<String, _>("target_id"))?,
            kind: EdgeKind::parse(&kind_raw)
                .ok_or_else(|| RagError::Internal(format!("bad edge kind {kind_raw:?}")))?,
            score: row.get::<f64, _>("score") as f32,
            context: row.get("context"),
            dependency_kind: row.get("dependency_kind"),
        })
    }

    async fn nodes_by_ids(
        &self,
        chatbot_id: Uuid,
        version: i64,
        ids: &[Uuid],
    ) -> Result<Vec<GraphNode>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT * FROM graph_nodes WHERE chatbot_id = ? AND version = ? AND id IN ({})",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql)
            .bind(chatbot_id.to_string())
            .bind(version);
        for id in ids {
            query = query.bind(id.to_string());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_node).collect()
    }
}

#[async_trait]
impl GraphStore for SqliteGraphStore {
    async fn upsert_node(&self, node: &GraphNode) -> Result<Uuid> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT * FROM graph_nodes
             WHERE chatbot_id = ? AND version = ? AND kind = ? AND normalized_name = ?",
        )
        .bind(node.chatbot_id.to_string())
        .bind(node.version)
        .bind(node.kind.as_str())
        .bind(&node.normalized_name)
        .fetch_optional(&mut *tx)
        .await?;

        let id = match existing {
            Some(row) => {
                let current = Self::row_to_node(&row)?;
                let mut chunk_ids = current.chunk_ids.clone();
                for chunk in &node.chunk_ids {
                    if !chunk_ids.contains(chunk) {
                        chunk_ids.push(*chunk);
                    }
                }
                let description = if node.description.len() > current.description.len() {
                    &node.description
                } else {
                    &current.description
                };
                let confidence = current.confidence.max(node.confidence);
                let chunk_ids_json = serde_json::to_string(
                    &chunk_ids.iter().map(Uuid::to_string).collect::<Vec<_>>(),
                )?;

                sqlx::query(
                    "UPDATE graph_nodes SET description = ?, chunk_ids = ?, confidence = ? WHERE id = ?",
                )
                .bind(description)
                .bind(chunk_ids_json)
                .bind(confidence as f64)
                .bind(current.id.to_string())
                .execute(&mut *tx)
                .await?;

                current.id
            }
            None => {
                let chunk_ids_json = serde_json::to_string(
                    &node.chunk_ids.iter().map(Uuid::to_string).collect::<Vec<_>>(),
                )?;
                sqlx::query(
                    "INSERT INTO graph_nodes (id, chatbot_id, version, kind, name, normalized_name, description, chunk_ids, confidence)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(node.id.to_string())
                .bind(node.chatbot_id.to_string())
                .bind(node.version)
                .bind(node.kind.as_str())
                .bind(&node.name)
                .bind(&node.normalized_name)
                .bind(&node.description)
                .bind(chunk_ids_json)
                .bind(node.confidence as f64)
                .execute(&mut *tx)
                .await?;
                node.id
            }
        };

        tx.commit().await?;
        Ok(id)
    }

    async fn upsert_edge(&self, edge: &GraphEdge) -> Result<()> {
        validate_edge(edge)?;
        sqlx::query(
            "INSERT INTO graph_edges (id, chatbot_id, version, source_id, target_id, kind, score, context, dependency_kind)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (chatbot_id, version, source_id, target_id, kind) DO UPDATE SET
                 score = MAX(score, excluded.score),
                 context = COALESCE(excluded.context, context),
                 dependency_kind = COALESCE(excluded.dependency_kind, dependency_kind)",
        )
        .bind(edge.id.to_string())
        .bind(edge.chatbot_id.to_string())
        .bind(edge.version)
        .bind(edge.source_id.to_string())
        .bind(edge.target_id.to_string())
        .bind(edge.kind.as_str())
        .bind(edge.score as f64)
        .bind(&edge.context)
        .bind(&edge.dependency_kind)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn nodes_by_chunk_ids(
        &self,
        chatbot_id: Uuid,
        version: i64,
        chunk_ids: &[Uuid],
    ) -> Result<Vec<GraphNode>> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }
        // chunk_ids is a JSON array of quoted uuids; substring match on the
        // quoted form is exact because uuids are fixed-format.
        let clauses = vec!["chunk_ids LIKE ?"; chunk_ids.len()].join(" OR ");
        let sql = format!(
            "SELECT * FROM graph_nodes WHERE chatbot_id = ? AND version = ? AND ({clauses})"
        );
        let mut query = sqlx::query(&sql)
            .bind(chatbot_id.to_string())
            .bind(version);
        for chunk in chunk_ids {
            query = query.bind(format!("%\"{chunk}\"%"));
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_node).collect()
    }

    async fn nodes_by_names(
        &self,
        chatbot_id: Uuid,
        version: i64,
        names: &[String],
    ) -> Result<Vec<GraphNode>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT * FROM graph_nodes WHERE chatbot_id = ? AND version = ? AND normalized_name IN ({})",
            placeholders(names.len())
        );
        let mut query = sqlx::query(&sql)
            .bind(chatbot_id.to_string())
            .bind(version);
        for name in names {
            query = query.bind(name);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_node).collect()
    }

    async fn neighbors(
        &self,
        chatbot_id: Uuid,
        version: i64,
        node_ids: &[Uuid],
        min_score: f32,
    ) -> Result<Vec<(GraphEdge, GraphNode)>> {
        if node_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = placeholders(node_ids.len());
        let sql = format!(
            "SELECT * FROM graph_edges
             WHERE chatbot_id = ? AND version = ? AND score >= ?
               AND (source_id IN ({ids}) OR target_id IN ({ids}))"
        );
        let mut query = sqlx::query(&sql)
            .bind(chatbot_id.to_string())
            .bind(version)
            .bind(min_score as f64);
        for _ in 0..2 {
            for id in node_ids {
                query = query.bind(id.to_string());
            }
        }
        let rows = query.fetch_all(&self.pool).await?;
        let edges: Vec<GraphEdge> = rows
            .iter()
            .map(Self::row_to_edge)
            .collect::<Result<Vec<_>>>()?;

        // Far endpoints relative to the seed set.
        let seed: std::collections::HashSet<Uuid> = node_ids.iter().copied().collect();
        let mut far_ids: Vec<Uuid> = Vec::new();
        for edge in &edges {
            for endpoint in [edge.source_id, edge.target_id] {
                if !seed.contains(&endpoint) && !far_ids.contains(&endpoint) {
                    far_ids.push(endpoint);
                }
            }
        }
        let far_nodes = self.nodes_by_ids(chatbot_id, version, &far_ids).await?;
        let by_id: std::collections::HashMap<Uuid, GraphNode> =
            far_nodes.into_iter().map(|n| (n.id, n)).collect();

        let mut result = Vec::new();
        for edge in edges {
            let far = if seed.contains(&edge.source_id) {
                edge.target_id
            } else {
                edge.source_id
            };
            if let Some(node) = by_id.get(&far) {
                result.push((edge, node.clone()));
            }
        }
        Ok(result)
    }

    async fn incident_edges(
        &self,
        chatbot_id: Uuid,
        version: i64,
        node_ids: &[Uuid],
    ) -> Result<Vec<GraphEdge>> {
        if node_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = placeholders(node_ids.len());
        let sql = format!(
            "SELECT * FROM graph_edges
             WHERE chatbot_id = ? AND version = ?
               AND (source_id IN ({ids}) OR target_id IN ({ids}))"
        );
        let mut query = sqlx::query(&sql)
            .bind(chatbot_id.to_string())
            .bind(version);
        for _ in 0..2 {
            for id in node_ids {
                query = query.bind(id.to_string());
            }
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_edge).collect()
    }

    async fn delete_version(&self, chatbot_id: Uuid, version: i64) -> Result<u64> {
        let edges = sqlx::query("DELETE FROM graph_edges WHERE chatbot_id = ? AND version = ?")
            .bind(chatbot_id.to_string())
            .bind(version)
            .execute(&self.pool)
            .await?
            .rows_affected();
        let nodes = sqlx::query("DELETE FROM graph_nodes WHERE chatbot_id = ? AND version = ?")
            .bind(chatbot_id.to_string())
            .bind(version)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(nodes + edges)
    }

    async fn delete_chatbot(&self, chatbot_id: Uuid) -> Result<u64> {
        let edges = sqlx::query("DELETE FROM graph_edges WHERE chatbot_id = ?")
            .bind(chatbot_id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();
        let nodes = sqlx::query("DELETE FROM graph_nodes WHERE chatbot_id = ?")
            .bind(chatbot_id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(nodes + edges)
    }

    async fn stats(&self, chatbot_id: Uuid, version: i64) -> Result<GraphStats> {
        let node_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM graph_nodes WHERE chatbot_id = ? AND version = ?",
        )
        .bind(chatbot_id.to_string())
        .bind(version)
        .fetch_one(&self.pool)
        .await?;
        let edge_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM graph_edges WHERE chatbot_id = ? AND version = ?",
        )
        .bind(chatbot_id.to_string())
        .bind(version)
        .fetch_one(&self.pool)
        .await?;
        let rows = sqlx::query(
            "SELECT kind, COUNT(*) AS n FROM graph_nodes WHERE chatbot_id = ? AND version = ? GROUP BY kind",
        )
        .bind(chatbot_id.to_string())
        .bind(version)
        .fetch_all(&self.pool)
        .await?;

        Ok(GraphStats {
            node_count,
            edge_count,
            nodes_by_kind: rows
                .iter()
                .map(|row| (row.get::<String, _>("kind"), row.get::<i64, _>("n")))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::normalize_name;

    async fn test_store() -> SqliteGraphStore {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(
                sqlx::sqlite::SqliteConnectOptions::new()
                    .filename(":memory:")
                    .foreign_keys(true),
            )
            .await
            .unwrap();
        let store = SqliteGraphStore::new(pool);
        store.migrate().await.unwrap();
        store
    }

    fn node(chatbot: Uuid, version: i64, kind: NodeKind, name: &str, chunk: Uuid) -> GraphNode {
        GraphNode {
            id: Uuid::new_v4(),
            chatbot_id: chatbot,
            version,
            kind,
            name: name.to_string(),
            normalized_name: normalize_name(name),
            description: format!("about {name}"),
            chunk_ids: vec![chunk],
            confidence: 0.9,
        }
    }

    fn edge(chatbot: Uuid, version: i64, source: Uuid, target: Uuid, score: f32) -> GraphEdge {
        GraphEdge {
            id: Uuid::new_v4(),
            chatbot_id: chatbot,
            version,
            source_id: source,
            target_id: target,
            kind: EdgeKind::RelatedTo,
            score,
            context: None,
            dependency_kind: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_dedups_and_merges_chunks() {
        let store = test_store().await;
        let chatbot = Uuid::new_v4();
        let chunk_a = Uuid::new_v4();
        let chunk_b = Uuid::new_v4();

        let first = node(chatbot, 1, NodeKind::Concept, "Photosynthesis", chunk_a);
        let id1 = store.upsert_node(&first).await.unwrap();
        let second = node(chatbot, 1, NodeKind::Concept, "photosynthesis", chunk_b);
        let id2 = store.upsert_node(&second).await.unwrap();

        assert_eq!(id1, id2);
        let stats = store.stats(chatbot, 1).await.unwrap();
        assert_eq!(stats.node_count, 1);

        let nodes = store
            .nodes_by_names(chatbot, 1, &["photosynthesis".to_string()])
            .await
            .unwrap();
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].chunk_ids.contains(&chunk_a));
        assert!(nodes[0].chunk_ids.contains(&chunk_b));
    }

    #[tokio::test]
    async fn test_versions_are_isolated() {
        let store = test_store().await;
        let chatbot = Uuid::new_v4();
        let chunk = Uuid::new_v4();

        let v1_id = store
            .upsert_node(&node(chatbot, 1, NodeKind::Concept, "Light", chunk))
            .await
            .unwrap();
        let v2_id = store
            .upsert_node(&node(chatbot, 2, NodeKind::Concept, "Light", chunk))
            .await
            .unwrap();
        assert_ne!(v1_id, v2_id);

        assert_eq!(store.stats(chatbot, 1).await.unwrap().node_count, 1);
        store.delete_version(chatbot, 1).await.unwrap();
        assert_eq!(store.stats(chatbot, 1).await.unwrap().node_count, 0);
        assert_eq!(store.stats(chatbot, 2).await.unwrap().node_count, 1);
    }

    #[tokio::test]
    async fn test_edge_score_floor_enforced() {
        let store = test_store().await;
        let chatbot = Uuid::new_v4();
        let a = store
            .upsert_node(&node(chatbot, 1, NodeKind::Concept, "A", Uuid::new_v4()))
            .await
            .unwrap();
        let b = store
            .upsert_node(&node(chatbot, 1, NodeKind::Concept, "B", Uuid::new_v4()))
            .await
            .unwrap();

        assert!(store.upsert_edge(&edge(chatbot, 1, a, b, 0.4)).await.is_err());
        store.upsert_edge(&edge(chatbot, 1, a, b, 0.8)).await.unwrap();
        // Re-upsert with a lower score keeps the max.
        store.upsert_edge(&edge(chatbot, 1, a, b, 0.6)).await.unwrap();

        let edges = store.incident_edges(chatbot, 1, &[a]).await.unwrap();
        assert_eq!(edges.len(), 1);
        assert!((edges[0].score - 0.8).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_neighbors_returns_far_endpoint() {
        let store = test_store().await;
        let chatbot = Uuid::new_v4();
        let a = store
            .upsert_node(&node(chatbot, 1, NodeKind::Concept, "A", Uuid::new_v4()))
            .await
            .unwrap();
        let b = store
            .upsert_node(&node(chatbot, 1, NodeKind::Definition, "B", Uuid::new_v4()))
            .await
            .unwrap();
        let c = store
            .upsert_node(&node(chatbot, 1, NodeKind::Process, "C", Uuid::new_v4()))
            .await
            .unwrap();

        store.upsert_edge(&edge(chatbot, 1, a, b, 0.9)).await.unwrap();
        store.upsert_edge(&edge(chatbot, 1, c, a, 0.75)).await.unwrap();
        store.upsert_edge(&edge(chatbot, 1, b, c, 0.6)).await.unwrap();

        let neighbors = store.neighbors(chatbot, 1, &[a], 0.7).await.unwrap();
        let names: Vec<&str> = neighbors.iter().map(|(_, n)| n.name.as_str()).collect();
        assert_eq!(neighbors.len(), 2);
        assert!(names.contains(&"B"));
        assert!(names.contains(&"C"));
        // The 0.6 edge is below the floor and does not surface.
        assert!(neighbors.iter().all(|(e, _)| e.score >= 0.7));
    }

    #[tokio::test]
    async fn test_nodes_by_chunk_ids() {
        let store = test_store().await;
        let chatbot = Uuid::new_v4();
        let chunk = Uuid::new_v4();
        store
            .upsert_node(&node(chatbot, 1, NodeKind::Definition, "GraphRAG", chunk))
            .await
            .unwrap();
        store
            .upsert_node(&node(chatbot, 1, NodeKind::Concept, "Other", Uuid::new_v4()))
            .await
            .unwrap();

        let found = store.nodes_by_chunk_ids(chatbot, 1, &[chunk]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "GraphRAG");

        let none = store
            .nodes_by_chunk_ids(chatbot, 1, &[Uuid::new_v4()])
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_empty_graph_queries_are_empty_not_errors() {
        let store = test_store().await;
        let chatbot = Uuid::new_v4();
        assert!(store.nodes_by_names(chatbot, 1, &["x".into()]).await.unwrap().is_empty());
        assert!(store.neighbors(chatbot, 1, &[Uuid::new_v4()], 0.7).await.unwrap().is_empty());
        assert_eq!(store.stats(chatbot, 1).await.unwrap(), GraphStats::default());
    }
}
