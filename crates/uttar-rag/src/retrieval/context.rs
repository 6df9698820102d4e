//! Priority-ordered context assembly from vector hits and expanded graph
//! nodes.
//!
//! Order: Definitions first, then chunks by fused score, then Concepts, then
//! Processes. Fused chunk score = 0.7·vector + 0.3·max incident edge score.
//! Ties break to the earlier chunk_index; within graph items, the lower hop
//! wins. Output is truncated to a token budget.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::token_counter::estimate_tokens;
use crate::types::{sanitize_text, ExpandedNode, NodeKind, SearchHit, SourceKind, SourceRef};

pub const VECTOR_WEIGHT: f32 = 0.7;
pub const GRAPH_WEIGHT: f32 = 0.3;

/// One item of assembled context, in final priority order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    pub text: String,
    pub kind: SourceKind,
    pub score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hop: Option<u32>,
}

#[derive(Debug, Default)]
pub struct AssembledContext {
    pub items: Vec<ContextItem>,
    pub sources: Vec<SourceRef>,
}

/// Fused chunk score; `max_edge_score` is 0 when no incident edge exists.
pub fn fused_score(vector_score: f32, max_edge_score: f32) -> f32 {
    VECTOR_WEIGHT * vector_score + GRAPH_WEIGHT * max_edge_score
}

const PREVIEW_CHARS: usize = 200;

fn preview(text: &str) -> String {
    let sanitized = sanitize_text(text);
    if sanitized.chars().count() > PREVIEW_CHARS {
        let short: String = sanitized.chars().take(PREVIEW_CHARS).collect();
        format!("{short}...")
    } else {
        sanitized
    }
}

struct Ranked {
    item: ContextItem,
    source: SourceRef,
}

fn rank_graph_nodes(nodes: &[ExpandedNode], kind: NodeKind) -> Vec<Ranked> {
    let mut selected: Vec<&ExpandedNode> =
        nodes.iter().filter(|n| n.node.kind == kind).collect();
    // Lower hop first; equal hops order by the strongest path edge.
    selected.sort_by(|a, b| {
        a.hop
            .cmp(&b.hop)
            .then(b.via_score.partial_cmp(&a.via_score).unwrap_or(std::cmp::Ordering::Equal))
            .then(a.node.name.cmp(&b.node.name))
    });

    selected
        .into_iter()
        .map(|expanded| {
            let node = &expanded.node;
            let text = match node.kind {
                NodeKind::Definition if !node.description.is_empty() => {
                    format!("{}: {}", node.name, node.description)
                }
                _ if !node.description.is_empty() => {
                    format!("{} — {}", node.name, node.description)
                }
                _ => node.name.clone(),
            };
            let score = if expanded.hop == 0 {
                node.confidence
            } else {
                expanded.via_score
            };
            Ranked {
                item: ContextItem {
                    text: sanitize_text(&text),
                    kind: SourceKind::Graph,
                    score,
                    document_id: None,
                    entity: Some(node.name.clone()),
                    chunk_index: None,
                    hop: Some(expanded.hop),
                },
                source: SourceRef {
                    kind: SourceKind::Graph,
                    score,
                    filename: None,
                    page: None,
                    document_id: None,
                    entity: Some(node.name.clone()),
                    entity_type: Some(node.kind.as_str().to_string()),
                    relationship: None,
                    chunk_text: Some(preview(&text)),
                },
            }
        })
        .collect()
}

/// Assemble the final context. `edge_score_by_chunk` carries, per chunk id,
/// the max score among edges incident to the graph nodes that chunk seeded.
pub fn assemble(
    hits: &[SearchHit],
    nodes: &[ExpandedNode],
    edge_score_by_chunk: &HashMap<Uuid, f32>,
    token_budget: usize,
) -> AssembledContext {
    let mut ranked: Vec<Ranked> = Vec::new();

    // 1. Definitions.
    ranked.extend(rank_graph_nodes(nodes, NodeKind::Definition));

    // 2. Chunks by fused score, earlier chunk_index on ties.
    let mut chunk_ranked: Vec<(&SearchHit, f32)> = hits
        .iter()
        .map(|hit| {
            let edge = edge_score_by_chunk.get(&hit.id).copied().unwrap_or(0.0);
            (hit, fused_score(hit.score, edge))
        })
        .collect();
    chunk_ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.chunk_index.cmp(&b.0.chunk_index))
    });
    ranked.extend(chunk_ranked.into_iter().map(|(hit, score)| Ranked {
        item: ContextItem {
            text: sanitize_text(&hit.text),
            kind: SourceKind::Vector,
            score,
            document_id: Some(hit.document_id),
            entity: None,
            chunk_index: Some(hit.chunk_index),
            hop: None,
        },
        source: SourceRef {
            kind: SourceKind::Vector,
            score,
            filename: Some(sanitize_text(&hit.filename)),
            page: Some(hit.page),
            document_id: Some(hit.document_id),
            entity: None,
            entity_type: None,
            relationship: None,
            chunk_text: Some(preview(&hit.text)),
        },
    }));

    // 3. Concepts, 4. Processes.
    ranked.extend(rank_graph_nodes(nodes, NodeKind::Concept));
    ranked.extend(rank_graph_nodes(nodes, NodeKind::Process));

    // Deduplicate near-identical texts (graph descriptions often repeat the
    // chunk that produced them).
    let mut seen_prefixes: std::collections::HashSet<String> = std::collections::HashSet::new();
    ranked.retain(|r| {
        let key: String = r.item.text.to_lowercase().chars().take(100).collect();
        seen_prefixes.insert(key)
    });

    // Truncate to the token budget.
    let mut assembled = AssembledContext::default();
    let mut used_tokens = 0u64;
    for ranked_item in ranked {
        let cost = estimate_tokens(&ranked_item.item.text);
        if used_tokens + cost > token_budget as u64 {
            let remaining = token_budget as u64 - used_tokens;
            // Only bother truncating when a meaningful amount fits.
            if remaining >= 50 {
                let mut item = ranked_item.item;
                item.text = truncate_to_tokens(&item.text, remaining);
                assembled.items.push(item);
                assembled.sources.push(ranked_item.source);
            }
            break;
        }
        used_tokens += cost;
        assembled.items.push(ranked_item.item);
        assembled.sources.push(ranked_item.source);
    }

    assembled
}

/// Cut text so its estimated token count fits the budget.
fn truncate_to_tokens(text: &str, budget_tokens: u64) -> String {
    let mut out = String::new();
    let mut used = 0f64;
    for c in text.chars() {
        used += if crate::token_counter::is_cjk(c) { 0.5 } else { 0.25 };
        if used as u64 >= budget_tokens {
            break;
        }
        out.push(c);
    }
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GraphNode;

    fn hit(index: u32, score: f32, text: &str) -> SearchHit {
        SearchHit {
            id: Uuid::new_v4(),
            document_id: Uuid::new_v4(),
            chunk_index: index,
            page: 1,
            section: String::new(),
            filename: "doc.pdf".into(),
            text: text.to_string(),
            score,
        }
    }

    fn expanded(kind: NodeKind, name: &str, hop: u32, via_score: f32) -> ExpandedNode {
        ExpandedNode {
            node: GraphNode {
                id: Uuid::new_v4(),
                chatbot_id: Uuid::new_v4(),
                version: 1,
                kind,
                name: name.to_string(),
                normalized_name: name.to_lowercase(),
                description: format!("description of {name}"),
                chunk_ids: Vec::new(),
                confidence: 0.9,
            },
            hop,
            via_score,
        }
    }

    #[test]
    fn test_fused_score_weights() {
        assert!((fused_score(1.0, 0.0) - 0.7).abs() < 1e-6);
        assert!((fused_score(0.0, 1.0) - 0.3).abs() < 1e-6);
        assert!((fused_score(0.8, 0.9) - (0.56 + 0.27)).abs() < 1e-6);
    }

    #[test]
    fn test_priority_order_definitions_chunks_concepts_processes() {
        let hits = vec![hit(0, 0.9, "chunk text")];
        let nodes = vec![
            expanded(NodeKind::Process, "boiling", 1, 0.8),
            expanded(NodeKind::Concept, "water", 1, 0.8),
            expanded(NodeKind::Definition, "osmosis", 1, 0.8),
        ];
        let assembled = assemble(&hits, &nodes, &HashMap::new(), 10_000);

        let kinds: Vec<String> = assembled
            .items
            .iter()
            .map(|i| match (&i.kind, &i.entity) {
                (SourceKind::Vector, _) => "chunk".to_string(),
                (SourceKind::Graph, Some(e)) => e.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(kinds, vec!["osmosis", "chunk", "water", "boiling"]);
    }

    #[test]
    fn test_chunk_tie_breaks_to_earlier_index() {
        let a = hit(5, 0.8, "later chunk");
        let b = hit(2, 0.8, "earlier chunk");
        let assembled = assemble(&[a, b], &[], &HashMap::new(), 10_000);
        assert_eq!(assembled.items[0].chunk_index, Some(2));
    }

    #[test]
    fn test_incident_edge_raises_fused_score() {
        let strong_edge = hit(1, 0.75, "edge-backed chunk");
        let plain = hit(0, 0.80, "plain chunk");
        let mut edge_scores = HashMap::new();
        edge_scores.insert(strong_edge.id, 0.95);

        let assembled = assemble(&[plain, strong_edge], &[], &edge_scores, 10_000);
        // 0.7*0.75 + 0.3*0.95 = 0.81 beats 0.7*0.80 = 0.56.
        assert_eq!(assembled.items[0].chunk_index, Some(1));
    }

    #[test]
    fn test_lower_hop_wins_within_graph() {
        let nodes = vec![
            expanded(NodeKind::Concept, "far", 2, 0.99),
            expanded(NodeKind::Concept, "near", 1, 0.7),
        ];
        let assembled = assemble(&[], &nodes, &HashMap::new(), 10_000);
        assert_eq!(assembled.items[0].entity.as_deref(), Some("near"));
    }

    #[test]
    fn test_token_budget_truncates() {
        let long = "word ".repeat(2000); // ~2500 tokens
        let hits = vec![hit(0, 0.9, &long), hit(1, 0.8, &long), hit(2, 0.7, &long)];
        let assembled = assemble(&hits, &[], &HashMap::new(), 3000);

        let total: u64 = assembled
            .items
            .iter()
            .map(|i| estimate_tokens(&i.text))
            .sum();
        assert!(total <= 3100, "total {total} should respect the budget");
        assert!(assembled.items.len() < 3);
    }

    #[test]
    fn test_sources_align_with_items() {
        let hits = vec![hit(0, 0.9, "chunk body")];
        let nodes = vec![expanded(NodeKind::Definition, "GraphRAG", 0, 0.9)];
        let assembled = assemble(&hits, &nodes, &HashMap::new(), 10_000);

        assert_eq!(assembled.items.len(), assembled.sources.len());
        assert_eq!(assembled.sources[0].entity.as_deref(), Some("GraphRAG"));
        assert_eq!(
            assembled.sources[0].entity_type.as_deref(),
            Some("Definition")
        );
        assert_eq!(assembled.sources[1].filename.as_deref(), Some("doc.pdf"));
        assert_eq!(assembled.sources[1].page, Some(1));
    }

    #[test]
    fn test_empty_inputs_yield_empty_context() {
        let assembled = assemble(&[], &[], &HashMap::new(), 3000);
        assert!(assembled.items.is_empty());
        assert!(assembled.sources.is_empty());
    }
}
