//! Relation extraction over a closed edge-type set.

use regex::Regex;

use super::{parse_json_array, EntityCandidate};
use crate::error::Result;
use crate::llm::{ChatMessage, LlmGateway};
use crate::types::{normalize_name, EdgeKind, MIN_EDGE_SCORE};

#[derive(Debug, Clone)]
pub struct RelationCandidate {
    /// Display names as they appear in the entity list.
    pub source: String,
    pub target: String,
    pub kind: EdgeKind,
    /// Already normalized to [0, 1].
    pub score: f32,
    pub context: Option<String>,
    /// Sub-type hint for DEPENDS_ON edges (e.g. "requires", "input").
    pub dependency_kind: Option<String>,
}

const RULE_SCORE: f32 = 0.8;
const MAX_LLM_TEXT_CHARS: usize = 3000;
const MAX_PROMPT_ENTITIES: usize = 30;

const RELATION_SYSTEM_PROMPT: &str = "\
You are a relationship extraction assistant for building knowledge graphs.
Extract relationships between entities from the given text.

Relationship types (use ONLY these):
- RELATED_TO: general relationship
- DEFINES: definition relationship
- DEPENDS_ON: dependency relationship

Return format (JSON array):
[
    {\"source\": \"entity1\", \"target\": \"entity2\", \"type\": \"RELATED_TO\", \"score\": 8}
]

CRITICAL rules:
- ONLY use entity names from the \"Available entities\" list in the user message
- Source and target MUST be different entities
- score is an integer 0-10 rating how strongly the text supports the relationship
- Extract 5-20 most important relationships
- Only return a valid JSON array, no other text
- Use entity names exactly as provided; do NOT translate or renumber them";

pub struct RelationExtractor {
    defines_pattern: Regex,
    depends_pattern: Regex,
}

impl Default for RelationExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl RelationExtractor {
    pub fn new() -> Self {
        Self {
            defines_pattern: Regex::new(
                r"(?i)(?P<source>[\w -]{3,80})\s+defines?\s+(?P<target>[\w -]{3,80})",
            )
            .unwrap(),
            depends_pattern: Regex::new(
                r"(?i)(?P<source>[\w -]{3,80})\s+(?:depends\s+on|requires?)\s+(?P<target>[\w -]{3,80})",
            )
            .unwrap(),
        }
    }

    /// Rule pass. Both endpoints must already be known entities.
    pub fn extract_with_rules(
        &self,
        text: &str,
        entities: &[EntityCandidate],
    ) -> Vec<RelationCandidate> {
        let known: std::collections::HashMap<String, &str> = entities
            .iter()
            .map(|e| (normalize_name(&e.name), e.name.as_str()))
            .collect();

        let mut relations = Vec::new();
        for (pattern, kind) in [
            (&self.defines_pattern, EdgeKind::Defines),
            (&self.depends_pattern, EdgeKind::DependsOn),
        ] {
            for captures in pattern.captures_iter(text) {
                let source_raw = captures.name("source").map(|m| m.as_str().trim()).unwrap_or("");
                let target_raw = captures.name("target").map(|m| m.as_str().trim()).unwrap_or("");

                // Regex captures run wide; shrink them onto known entities.
                let Some(source) = resolve_endpoint(source_raw, &known, true) else {
                    continue;
                };
                let Some(target) = resolve_endpoint(target_raw, &known, false) else {
                    continue;
                };
                if normalize_name(source) == normalize_name(target) {
                    continue;
                }

                relations.push(RelationCandidate {
                    source: source.to_string(),
                    target: target.to_string(),
                    kind,
                    score: RULE_SCORE,
                    context: None,
                    dependency_kind: match kind {
                        EdgeKind::DependsOn => Some("requires".to_string()),
                        _ => None,
                    },
                });
            }
        }
        relations
    }

    /// LLM pass. Unparseable responses and unknown endpoints are discarded;
    /// scores arrive as 0-10 integers and are normalized to [0, 1].
    pub async fn extract_with_llm(
        &self,
        gateway: &LlmGateway,
        text: &str,
        entities: &[EntityCandidate],
    ) -> Result<Vec<RelationCandidate>> {
        if entities.is_empty() {
            return Ok(Vec::new());
        }

        let known: std::collections::HashMap<String, &str> = entities
            .iter()
            .map(|e| (normalize_name(&e.name), e.name.as_str()))
            .collect();

        let entity_list = entities
            .iter()
            .take(MAX_PROMPT_ENTITIES)
            .map(|e| e.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");

        let truncated: String = text.chars().take(MAX_LLM_TEXT_CHARS).collect();
        let messages = [
            ChatMessage::system(RELATION_SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "Available entities: {entity_list}\n\nExtract relationships from:\n\n{truncated}"
            )),
        ];

        let response = gateway.chat(&messages).await?;
        let items = parse_json_array(&response);

        let mut relations = Vec::new();
        for item in items {
            let source_raw = item["source"].as_str().unwrap_or("").trim();
            let target_raw = item["target"].as_str().unwrap_or("").trim();

            let Some(source) = resolve_endpoint(source_raw, &known, true) else {
                continue;
            };
            let Some(target) = resolve_endpoint(target_raw, &known, false) else {
                continue;
            };
            if normalize_name(source) == normalize_name(target) {
                continue;
            }

            let Some(kind) = item["type"].as_str().and_then(EdgeKind::parse) else {
                continue;
            };
            let score = normalize_score(&item["score"]);

            relations.push(RelationCandidate {
                source: source.to_string(),
                target: target.to_string(),
                kind,
                score,
                context: item["context"].as_str().map(|c| c.trim().to_string()),
                dependency_kind: item["dependency"].as_str().map(|d| d.trim().to_string()),
            });
        }

        Ok(relations)
    }
}

/// Match a captured span onto a known entity. Exact normalized match first;
/// otherwise trim words from the far end (`trim_front` for source spans,
/// which over-capture on the left; the opposite for target spans).
fn resolve_endpoint<'a>(
    raw: &str,
    known: &std::collections::HashMap<String, &'a str>,
    trim_front: bool,
) -> Option<&'a str> {
    let normalized = normalize_name(raw);
    if normalized.is_empty() {
        return None;
    }
    if let Some(name) = known.get(&normalized) {
        return Some(name);
    }
    let words: Vec<&str> = normalized.split(' ').collect();
    for keep in (1..words.len()).rev() {
        let candidate = if trim_front {
            words[words.len() - keep..].join(" ")
        } else {
            words[..keep].join(" ")
        };
        if let Some(name) = known.get(&candidate) {
            return Some(name);
        }
    }
    None
}

/// Models return score hints as 0-10 integers, sometimes already as floats
/// in [0, 1]. Normalize both forms.
fn normalize_score(value: &serde_json::Value) -> f32 {
    let raw = value.as_f64().unwrap_or(5.0) as f32;
    let normalized = if raw > 1.0 { raw / 10.0 } else { raw };
    normalized.clamp(0.0, 1.0)
}

/// Drop relations below the minimum edge score.
pub fn filter_by_score(relations: Vec<RelationCandidate>) -> Vec<RelationCandidate> {
    relations
        .into_iter()
        .filter(|r| r.score >= MIN_EDGE_SCORE)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeKind;
    use uuid::Uuid;

    fn entity(name: &str) -> EntityCandidate {
        EntityCandidate {
            name: name.to_string(),
            kind: NodeKind::Concept,
            description: String::new(),
            confidence: 0.9,
            chunk_ids: vec![Uuid::new_v4()],
        }
    }

    #[test]
    fn test_rule_pass_requires_known_entities() {
        let extractor = RelationExtractor::new();
        let entities = vec![entity("chlorophyll"), entity("light absorption")];
        let relations = extractor.extract_with_rules(
            "chlorophyll depends on light absorption for the cycle",
            &entities,
        );
        assert_eq!(relations.len(), 1);
        assert_eq!(relations[0].kind, EdgeKind::DependsOn);

        // Unknown endpoint: nothing extracted.
        let none = extractor.extract_with_rules("oxygen depends on sunlight", &entities);
        assert!(none.is_empty());
    }

    #[test]
    fn test_self_relations_rejected() {
        let extractor = RelationExtractor::new();
        let entities = vec![entity("water")];
        let relations = extractor.extract_with_rules("water requires water", &entities);
        assert!(relations.is_empty());
    }

    #[test]
    fn test_score_normalization() {
        assert_eq!(normalize_score(&serde_json::json!(8)), 0.8);
        assert_eq!(normalize_score(&serde_json::json!(0.65)), 0.65);
        assert_eq!(normalize_score(&serde_json::json!(15)), 1.0);
        assert_eq!(normalize_score(&serde_json::json!(null)), 0.5);
    }

    #[test]
    fn test_filter_drops_weak_edges() {
        let make = |score: f32| RelationCandidate {
            source: "a".into(),
            target: "b".into(),
            kind: EdgeKind::RelatedTo,
            score,
            context: None,
            dependency_kind: None,
        };
        let kept = filter_by_score(vec![make(0.3), make(0.5), make(0.9)]);
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|r| r.score >= 0.5));
    }
}
