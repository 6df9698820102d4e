//! Writes fused extraction candidates into the graph store.

use std::collections::HashMap;

use uuid::Uuid;

use crate::error::Result;
use crate::extract::{fuse_entities, relations::filter_by_score, EntityCandidate, RelationCandidate};
use crate::storage::GraphStore;
use crate::types::{normalize_name, GraphEdge, GraphNode};

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOutcome {
    pub nodes_written: usize,
    pub edges_written: usize,
    pub edges_dropped: usize,
}

pub struct GraphBuilder<'a> {
    store: &'a dyn GraphStore,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(store: &'a dyn GraphStore) -> Self {
        Self { store }
    }

    /// Fuse, dedup, and persist entities and relations for one (tenant,
    /// version). Callers serialize invocations per tenant through the
    /// orchestrator's tenant mutex; node dedup is not safe under concurrent
    /// writers for the same tenant and version.
    pub async fn build(
        &self,
        chatbot_id: Uuid,
        version: i64,
        entities: Vec<EntityCandidate>,
        relations: Vec<RelationCandidate>,
    ) -> Result<BuildOutcome> {
        let fused = fuse_entities(entities);
        let total_relations = relations.len();
        let strong = filter_by_score(relations);
        let mut outcome = BuildOutcome {
            edges_dropped: total_relations - strong.len(),
            ..Default::default()
        };

        // Name → canonical node id, filled as upserts resolve dedup.
        let mut ids_by_name: HashMap<String, Uuid> = HashMap::new();

        for candidate in fused {
            let normalized = normalize_name(&candidate.name);
            let node = GraphNode {
                id: Uuid::new_v4(),
                chatbot_id,
                version,
                kind: candidate.kind,
                name: candidate.name,
                normalized_name: normalized.clone(),
                description: candidate.description,
                chunk_ids: candidate.chunk_ids,
                confidence: candidate.confidence.clamp(0.0, 1.0),
            };
            let canonical = self.store.upsert_node(&node).await?;
            // First kind to claim a name wins edge resolution, matching the
            // name-keyed lookup relations use.
            ids_by_name.entry(normalized).or_insert(canonical);
            outcome.nodes_written += 1;
        }

        for relation in strong {
            let source = ids_by_name.get(&normalize_name(&relation.source));
            let target = ids_by_name.get(&normalize_name(&relation.target));
            let (Some(&source_id), Some(&target_id)) = (source, target) else {
                tracing::debug!(
                    source = %relation.source,
                    target = %relation.target,
                    "edge endpoint missing from node set, skipping"
                );
                continue;
            };
            if source_id == target_id {
                continue;
            }

            let edge = GraphEdge {
                id: Uuid::new_v4(),
                chatbot_id,
                version,
                source_id,
                target_id,
                kind: relation.kind,
                score: relation.score.clamp(0.0, 1.0),
                context: relation.context,
                dependency_kind: relation.dependency_kind,
            };
            self.store.upsert_edge(&edge).await?;
            outcome.edges_written += 1;
        }

        tracing::info!(
            chatbot = %chatbot_id,
            version,
            nodes = outcome.nodes_written,
            edges = outcome.edges_written,
            dropped = outcome.edges_dropped,
            "graph build complete"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{GraphStore, SqliteGraphStore};
    use crate::types::{EdgeKind, NodeKind};

    async fn graph_store() -> SqliteGraphStore {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(sqlx::sqlite::SqliteConnectOptions::new().filename(":memory:"))
            .await
            .unwrap();
        let store = SqliteGraphStore::new(pool);
        store.migrate().await.unwrap();
        store
    }

    fn entity(name: &str, kind: NodeKind) -> EntityCandidate {
        EntityCandidate {
            name: name.to_string(),
            kind,
            description: format!("about {name}"),
            confidence: 0.9,
            chunk_ids: vec![Uuid::new_v4()],
        }
    }

    fn relation(source: &str, target: &str, score: f32) -> RelationCandidate {
        RelationCandidate {
            source: source.to_string(),
            target: target.to_string(),
            kind: EdgeKind::RelatedTo,
            score,
            context: None,
            dependency_kind: None,
        }
    }

    #[tokio::test]
    async fn test_build_writes_nodes_and_strong_edges() {
        let store = graph_store().await;
        let chatbot = Uuid::new_v4();
        let builder = GraphBuilder::new(&store);

        let outcome = builder
            .build(
                chatbot,
                1,
                vec![
                    entity("Photosynthesis", NodeKind::Definition),
                    entity("Chlorophyll", NodeKind::Concept),
                ],
                vec![
                    relation("Photosynthesis", "Chlorophyll", 0.9),
                    relation("Photosynthesis", "Chlorophyll", 0.3),
                ],
            )
            .await
            .unwrap();

        assert_eq!(outcome.nodes_written, 2);
        assert_eq!(outcome.edges_written, 1);
        assert_eq!(outcome.edges_dropped, 1);

        let stats = store.stats(chatbot, 1).await.unwrap();
        assert_eq!(stats.node_count, 2);
        assert_eq!(stats.edge_count, 1);
    }

    #[tokio::test]
    async fn test_rebuild_is_idempotent() {
        let store = graph_store().await;
        let chatbot = Uuid::new_v4();
        let builder = GraphBuilder::new(&store);

        let entities = || vec![entity("Osmosis", NodeKind::Concept), entity("Water", NodeKind::Concept)];
        let relations = || vec![relation("Osmosis", "Water", 0.8)];

        builder.build(chatbot, 1, entities(), relations()).await.unwrap();
        builder.build(chatbot, 1, entities(), relations()).await.unwrap();

        let stats = store.stats(chatbot, 1).await.unwrap();
        assert_eq!(stats.node_count, 2);
        assert_eq!(stats.edge_count, 1);
    }

    #[tokio::test]
    async fn test_edges_with_unknown_endpoints_skipped() {
        let store = graph_store().await;
        let chatbot = Uuid::new_v4();
        let builder = GraphBuilder::new(&store);

        let outcome = builder
            .build(
                chatbot,
                1,
                vec![entity("Only Node", NodeKind::Concept)],
                vec![relation("Only Node", "Ghost", 0.9)],
            )
            .await
            .unwrap();

        assert_eq!(outcome.edges_written, 0);
    }
}
