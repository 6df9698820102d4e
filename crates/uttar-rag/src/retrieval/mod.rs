//! Hybrid retrieval: vector top-K fused with bounded graph expansion.

mod context;

pub use context::{assemble, fused_score, AssembledContext, ContextItem};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use uuid::Uuid;

use crate::config::RetrievalConfig;
use crate::error::{RagError, Result};
use crate::llm::LlmGateway;
use crate::storage::{GraphStore, VectorIndex};
use crate::types::{ExpandedNode, GraphNode, SearchHit, SourceRef};

#[derive(Debug, Default)]
pub struct RetrievalOutcome {
    pub items: Vec<ContextItem>,
    pub sources: Vec<SourceRef>,
    pub vector_count: usize,
    pub graph_count: usize,
}

pub struct HybridRetriever {
    gateway: Arc<LlmGateway>,
    vector: Arc<dyn VectorIndex>,
    graph: Arc<dyn GraphStore>,
    config: RetrievalConfig,
}

impl HybridRetriever {
    pub fn new(
        gateway: Arc<LlmGateway>,
        vector: Arc<dyn VectorIndex>,
        graph: Arc<dyn GraphStore>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            gateway,
            vector,
            graph,
            config,
        }
    }

    /// Run the full hybrid pass against a tenant's active version.
    pub async fn retrieve(
        &self,
        query: &str,
        chatbot_id: Uuid,
        active_version: i64,
        include_graph: bool,
    ) -> Result<RetrievalOutcome> {
        // 1. Embed the query and search the active collection.
        let query_vector = self.gateway.embed_one(query).await?;
        let hits = timeout(
            Duration::from_secs(self.config.vector_timeout_secs),
            self.vector.search(
                chatbot_id,
                active_version,
                &query_vector,
                self.config.top_k,
                self.config.vector_score_threshold,
            ),
        )
        .await
        .map_err(|_| RagError::Transient("vector search timed out".into()))??;

        let vector_count = hits.len();
        tracing::debug!(chatbot = %chatbot_id, version = active_version, hits = vector_count, "vector pass done");

        let (nodes, edge_score_by_chunk) = if include_graph {
            timeout(
                Duration::from_secs(self.config.graph_timeout_secs),
                self.graph_pass(query, chatbot_id, active_version, &hits),
            )
            .await
            .map_err(|_| RagError::Transient("graph expansion timed out".into()))??
        } else {
            (Vec::new(), HashMap::new())
        };
        let graph_count = nodes.len();

        let assembled = assemble(
            &hits,
            &nodes,
            &edge_score_by_chunk,
            self.config.context_token_budget,
        );

        Ok(RetrievalOutcome {
            items: assembled.items,
            sources: assembled.sources,
            vector_count,
            graph_count,
        })
    }

    /// Seed from chunk membership and query keywords, then expand. Keyword
    /// seeding runs even when the vector pass returned nothing, so a
    /// graph-only corpus can still answer.
    async fn graph_pass(
        &self,
        query: &str,
        chatbot_id: Uuid,
        version: i64,
        hits: &[SearchHit],
    ) -> Result<(Vec<ExpandedNode>, HashMap<Uuid, f32>)> {
        let chunk_ids: Vec<Uuid> = hits.iter().map(|h| h.id).collect();
        let mut seeds: Vec<GraphNode> = self
            .graph
            .nodes_by_chunk_ids(chatbot_id, version, &chunk_ids)
            .await?;

        let phrases = extract_key_phrases(query);
        if !phrases.is_empty() {
            let by_name = self
                .graph
                .nodes_by_names(chatbot_id, version, &phrases)
                .await?;
            for node in by_name {
                if !seeds.iter().any(|s| s.id == node.id) {
                    seeds.push(node);
                }
            }
        }

        if seeds.is_empty() {
            return Ok((Vec::new(), HashMap::new()));
        }

        let expanded = self.expand(chatbot_id, version, seeds).await?;

        // Max incident edge score per seeding chunk, for fused chunk scores.
        let seed_ids: Vec<Uuid> = expanded
            .iter()
            .filter(|n| n.hop == 0)
            .map(|n| n.node.id)
            .collect();
        let incident = self
            .graph
            .incident_edges(chatbot_id, version, &seed_ids)
            .await?;
        let mut edge_score_by_chunk: HashMap<Uuid, f32> = HashMap::new();
        for node in expanded.iter().filter(|n| n.hop == 0) {
            let max_edge = incident
                .iter()
                .filter(|e| e.source_id == node.node.id || e.target_id == node.node.id)
                .map(|e| e.score)
                .fold(0.0f32, f32::max);
            for chunk in &node.node.chunk_ids {
                let entry = edge_score_by_chunk.entry(*chunk).or_insert(0.0);
                *entry = entry.max(max_edge);
            }
        }

        Ok((expanded, edge_score_by_chunk))
    }

    /// Bounded BFS from the seeds: at most `max_hops` hops, only edges at or
    /// above the expansion threshold, and a hard node cap.
    async fn expand(
        &self,
        chatbot_id: Uuid,
        version: i64,
        seeds: Vec<GraphNode>,
    ) -> Result<Vec<ExpandedNode>> {
        let mut visited: HashSet<Uuid> = seeds.iter().map(|n| n.id).collect();
        let mut collected: Vec<ExpandedNode> = Vec::new();
        let mut frontier: VecDeque<Uuid> = VecDeque::new();

        for node in seeds {
            frontier.push_back(node.id);
            collected.push(ExpandedNode {
                node,
                hop: 0,
                via_score: 0.0,
            });
            if collected.len() >= self.config.max_expansion_nodes {
                return Ok(collected);
            }
        }

        for hop in 1..=self.config.max_hops {
            if frontier.is_empty() || collected.len() >= self.config.max_expansion_nodes {
                break;
            }
            let current: Vec<Uuid> = frontier.drain(..).collect();
            let neighbors = self
                .graph
                .neighbors(
                    chatbot_id,
                    version,
                    &current,
                    self.config.expansion_edge_threshold,
                )
                .await?;

            for (edge, node) in neighbors {
                if collected.len() >= self.config.max_expansion_nodes {
                    break;
                }
                if !visited.insert(node.id) {
                    continue;
                }
                frontier.push_back(node.id);
                collected.push(ExpandedNode {
                    node,
                    hop,
                    via_score: edge.score,
                });
            }
        }

        Ok(collected)
    }
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "can", "could", "define", "did",
    "do", "does", "explain", "for", "from", "had", "has", "have", "how", "if", "in", "is", "it",
    "may", "might", "of", "on", "or", "please", "shall", "should", "tell", "that", "the",
    "this", "to", "was", "were", "what", "when", "where", "which", "who", "why", "will", "with",
    "would", "you",
];

/// Extract capitalized phrases from a query for graph-name seeding. Runs of
/// capitalized words group into one phrase; stopwords (including
/// sentence-initial "What"/"How" capitals) are stripped.
pub fn extract_key_phrases(query: &str) -> Vec<String> {
    let mut phrases: Vec<String> = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    let flush = |current: &mut Vec<&str>, phrases: &mut Vec<String>| {
        if current.is_empty() {
            return;
        }
        // Drop leading/trailing stopwords inside the capitalized run.
        let words: Vec<&str> = current
            .iter()
            .copied()
            .filter(|w| !STOPWORDS.contains(&w.to_lowercase().as_str()))
            .collect();
        current.clear();
        if words.is_empty() {
            return;
        }
        let phrase = crate::types::normalize_name(&words.join(" "));
        if phrase.len() >= 2 && !phrases.contains(&phrase) {
            phrases.push(phrase);
        }
    };

    for token in query.split(|c: char| !c.is_alphanumeric() && c != '-') {
        if token.is_empty() {
            continue;
        }
        if token.chars().next().is_some_and(|c| c.is_uppercase()) {
            current.push(token);
        } else {
            flush(&mut current, &mut phrases);
        }
    }
    flush(&mut current, &mut phrases);

    phrases
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::llm::{ChatMessage, LlmClient, TokenStream};
    use crate::storage::SqliteGraphStore;
    use crate::types::{normalize_name, ChunkRecord, EdgeKind, GraphEdge, NodeKind, SourceKind};

    #[test]
    fn test_key_phrases_from_question() {
        assert_eq!(extract_key_phrases("What is GraphRAG?"), vec!["graphrag"]);
        assert_eq!(
            extract_key_phrases("Tell me about Hybrid Retrieval Pipelines"),
            vec!["hybrid retrieval pipelines"]
        );
        assert!(extract_key_phrases("what is the weather").is_empty());
    }

    #[test]
    fn test_key_phrases_split_on_lowercase_gap() {
        let phrases = extract_key_phrases("Does Photosynthesis need Sunlight today");
        assert_eq!(phrases, vec!["photosynthesis", "sunlight"]);
    }

    struct StubLlm;

    #[async_trait]
    impl LlmClient for StubLlm {
        async fn chat(&self, _messages: &[ChatMessage]) -> crate::error::Result<String> {
            Ok("[]".into())
        }

        async fn chat_stream(
            &self,
            _messages: &[ChatMessage],
        ) -> crate::error::Result<TokenStream> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(TokenStream::new(rx))
        }

        async fn embed(&self, texts: &[String]) -> crate::error::Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.1, 0.2, 0.3, 0.4]).collect())
        }
    }

    /// In-memory vector index with canned hits.
    struct StubIndex {
        hits: Vec<SearchHit>,
    }

    #[async_trait]
    impl VectorIndex for StubIndex {
        async fn ensure_collection(&self, _c: Uuid, _v: i64) -> crate::error::Result<()> {
            Ok(())
        }
        async fn upsert_chunks(
            &self,
            _c: Uuid,
            _v: i64,
            _chunks: &[ChunkRecord],
        ) -> crate::error::Result<()> {
            Ok(())
        }
        async fn search(
            &self,
            _c: Uuid,
            _v: i64,
            _q: &[f32],
            top_k: usize,
            threshold: f32,
        ) -> crate::error::Result<Vec<SearchHit>> {
            Ok(self
                .hits
                .iter()
                .filter(|h| h.score >= threshold)
                .take(top_k)
                .cloned()
                .collect())
        }
        async fn count_chunks(
            &self,
            _c: Uuid,
            _v: i64,
            _d: Option<Uuid>,
        ) -> crate::error::Result<usize> {
            Ok(self.hits.len())
        }
        async fn delete_document(
            &self,
            _c: Uuid,
            _v: i64,
            _d: Uuid,
        ) -> crate::error::Result<usize> {
            Ok(0)
        }
        async fn drop_collection(&self, _c: Uuid, _v: i64) -> crate::error::Result<()> {
            Ok(())
        }
    }

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

    fn retriever(
        hits: Vec<SearchHit>,
        graph: Arc<SqliteGraphStore>,
    ) -> HybridRetriever {
        let gateway = Arc::new(LlmGateway::new(Arc::new(StubLlm), 2, 30));
        HybridRetriever::new(
            gateway,
            Arc::new(StubIndex { hits }),
            graph,
            RetrievalConfig {
                top_k: 8,
                vector_score_threshold: 0.7,
                max_hops: 2,
                expansion_edge_threshold: 0.7,
                max_expansion_nodes: 20,
                context_token_budget: 3000,
                vector_timeout_secs: 5,
                graph_timeout_secs: 10,
            },
        )
    }

    fn node(chatbot: Uuid, kind: NodeKind, name: &str, chunks: Vec<Uuid>) -> GraphNode {
        GraphNode {
            id: Uuid::new_v4(),
            chatbot_id: chatbot,
            version: 1,
            kind,
            name: name.to_string(),
            normalized_name: normalize_name(name),
            description: format!("{name} explained"),
            chunk_ids: chunks,
            confidence: 0.9,
        }
    }

    #[tokio::test]
    async fn test_graph_only_seeding_with_empty_vector_results() {
        let chatbot = Uuid::new_v4();
        let graph = Arc::new(graph_store().await);
        graph
            .upsert_node(&node(chatbot, NodeKind::Definition, "GraphRAG", vec![]))
            .await
            .unwrap();

        let retriever = retriever(Vec::new(), graph);
        let outcome = retriever
            .retrieve("What is GraphRAG?", chatbot, 1, true)
            .await
            .unwrap();

        assert_eq!(outcome.vector_count, 0);
        assert_eq!(outcome.graph_count, 1);
        assert_eq!(outcome.sources.len(), 1);
        assert_eq!(outcome.sources[0].entity.as_deref(), Some("GraphRAG"));
        assert_eq!(outcome.sources[0].kind, SourceKind::Graph);
    }

    #[tokio::test]
    async fn test_empty_everything_is_empty_not_error() {
        let chatbot = Uuid::new_v4();
        let graph = Arc::new(graph_store().await);
        let retriever = retriever(Vec::new(), graph);
        let outcome = retriever
            .retrieve("anything at all", chatbot, 1, true)
            .await
            .unwrap();
        assert!(outcome.items.is_empty());
        assert_eq!(outcome.vector_count, 0);
        assert_eq!(outcome.graph_count, 0);
    }

    #[tokio::test]
    async fn test_two_hop_expansion_respects_threshold_and_cap() {
        let chatbot = Uuid::new_v4();
        let graph = Arc::new(graph_store().await);

        let chunk = Uuid::new_v4();
        let seed = node(chatbot, NodeKind::Concept, "Seed", vec![chunk]);
        let near = node(chatbot, NodeKind::Concept, "Near", vec![]);
        let far = node(chatbot, NodeKind::Concept, "Far", vec![]);
        let weak = node(chatbot, NodeKind::Concept, "Weak", vec![]);
        let beyond = node(chatbot, NodeKind::Concept, "Beyond", vec![]);
        for n in [&seed, &near, &far, &weak, &beyond] {
            graph.upsert_node(n).await.unwrap();
        }

        let edge = |s: Uuid, t: Uuid, score: f32| GraphEdge {
            id: Uuid::new_v4(),
            chatbot_id: chatbot,
            version: 1,
            source_id: s,
            target_id: t,
            kind: EdgeKind::RelatedTo,
            score,
            context: None,
            dependency_kind: None,
        };
        graph.upsert_edge(&edge(seed.id, near.id, 0.9)).await.unwrap();
        graph.upsert_edge(&edge(near.id, far.id, 0.8)).await.unwrap();
        graph.upsert_edge(&edge(seed.id, weak.id, 0.55)).await.unwrap();
        graph.upsert_edge(&edge(far.id, beyond.id, 0.9)).await.unwrap();

        let hits = vec![SearchHit {
            id: chunk,
            document_id: Uuid::new_v4(),
            chunk_index: 0,
            page: 1,
            section: String::new(),
            filename: "doc.pdf".into(),
            text: "seed chunk".into(),
            score: 0.9,
        }];

        let retriever = retriever(hits, graph);
        let outcome = retriever.retrieve("unrelated words", chatbot, 1, true).await.unwrap();

        let names: Vec<&str> = outcome
            .sources
            .iter()
            .filter_map(|s| s.entity.as_deref())
            .collect();
        // Seed + Near (hop 1) + Far (hop 2); Weak is under the 0.7 edge
        // threshold and Beyond is 3 hops out.
        assert!(names.contains(&"Seed"));
        assert!(names.contains(&"Near"));
        assert!(names.contains(&"Far"));
        assert!(!names.contains(&"Weak"));
        assert!(!names.contains(&"Beyond"));
    }

    #[tokio::test]
    async fn test_include_graph_false_skips_expansion() {
        let chatbot = Uuid::new_v4();
        let graph = Arc::new(graph_store().await);
        graph
            .upsert_node(&node(chatbot, NodeKind::Definition, "GraphRAG", vec![]))
            .await
            .unwrap();

        let retriever = retriever(Vec::new(), graph);
        let outcome = retriever
            .retrieve("What is GraphRAG?", chatbot, 1, false)
            .await
            .unwrap();
        assert_eq!(outcome.graph_count, 0);
    }
}
