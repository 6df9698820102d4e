//! Entity and relation extraction: a fast rule-based pass unioned with a
//! structured LLM pass, fused and deduplicated before graph construction.

pub mod entities;
mod json;
pub mod relations;

pub use entities::{EntityCandidate, EntityExtractor};
pub use json::parse_json_array;
pub use relations::{RelationCandidate, RelationExtractor};

use std::collections::HashMap;

use crate::types::{normalize_name, NodeKind};

/// Union candidates from both passes; duplicates (same normalized name and
/// kind) merge with max confidence, merged chunk sets, and the longer
/// description.
pub fn fuse_entities(candidates: Vec<EntityCandidate>) -> Vec<EntityCandidate> {
    let mut merged: HashMap<(String, NodeKind), EntityCandidate> = HashMap::new();
    let mut order: Vec<(String, NodeKind)> = Vec::new();

    for candidate in candidates {
        let key = (normalize_name(&candidate.name), candidate.kind);
        if key.0.is_empty() {
            continue;
        }
        match merged.get_mut(&key) {
            Some(existing) => {
                existing.confidence = existing.confidence.max(candidate.confidence);
                if candidate.description.len() > existing.description.len() {
                    existing.description = candidate.description;
                }
                for chunk in candidate.chunk_ids {
                    if !existing.chunk_ids.contains(&chunk) {
                        existing.chunk_ids.push(chunk);
                    }
                }
            }
            None => {
                order.push(key.clone());
                merged.insert(key, candidate);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| merged.remove(&key))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn candidate(name: &str, kind: NodeKind, confidence: f32, chunk: Uuid) -> EntityCandidate {
        EntityCandidate {
            name: name.to_string(),
            kind,
            description: format!("about {name}"),
            confidence,
            chunk_ids: vec![chunk],
        }
    }

    #[test]
    fn test_fuse_merges_same_normalized_name() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let fused = fuse_entities(vec![
            candidate("Photosynthesis", NodeKind::Concept, 0.9, a),
            candidate("photosynthesis!", NodeKind::Concept, 0.6, b),
        ]);
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].confidence, 0.9);
        assert_eq!(fused[0].chunk_ids, vec![a, b]);
        // Display casing of the first occurrence is kept.
        assert_eq!(fused[0].name, "Photosynthesis");
    }

    #[test]
    fn test_fuse_keeps_distinct_kinds_apart() {
        let chunk = Uuid::new_v4();
        let fused = fuse_entities(vec![
            candidate("Osmosis", NodeKind::Concept, 0.9, chunk),
            candidate("Osmosis", NodeKind::Definition, 0.9, chunk),
        ]);
        assert_eq!(fused.len(), 2);
    }

    #[test]
    fn test_fuse_drops_unnormalizable_names() {
        let fused = fuse_entities(vec![candidate("!!!", NodeKind::Concept, 0.9, Uuid::new_v4())]);
        assert!(fused.is_empty());
    }
}
