//! Entity extraction: rule-based pass plus structured LLM pass.

use regex::Regex;
use uuid::Uuid;

use super::parse_json_array;
use crate::error::Result;
use crate::llm::{ChatMessage, LlmGateway};
use crate::processing::Chunk;
use crate::types::NodeKind;

/// Confidence assigned to rule-pass candidates.
const RULE_CONFIDENCE: f32 = 0.9;
/// Confidence assigned to LLM candidates that carry none of their own.
const LLM_DEFAULT_CONFIDENCE: f32 = 0.7;

const MAX_NAME_CHARS: usize = 100;
const MAX_DESCRIPTION_CHARS: usize = 500;
/// LLM pass truncates chunk text beyond this.
const MAX_LLM_TEXT_CHARS: usize = 3000;

#[derive(Debug, Clone)]
pub struct EntityCandidate {
    pub name: String,
    pub kind: NodeKind,
    pub description: String,
    pub confidence: f32,
    pub chunk_ids: Vec<Uuid>,
}

pub struct EntityExtractor {
    definition_patterns: Vec<Regex>,
    process_pattern: Regex,
    ordinal_pattern: Regex,
}

const ENTITY_SYSTEM_PROMPT: &str = "\
You are an entity extraction assistant for building knowledge graphs.
Extract entities from the given text and return them as a JSON array.

Entity types to extract:
- Concept: key terms, topics, or ideas
- Definition: terms with their definitions/explanations
- Process: steps, procedures, or workflows

Return format:
[
    {\"name\": \"entity name\", \"type\": \"Concept|Definition|Process\", \"description\": \"brief description\"}
]

Rules:
- Extract 5-15 most important entities
- Names should be concise (1-5 words)
- Descriptions should be brief but informative (1-2 sentences)
- Only return a valid JSON array, no other text
- Do NOT include any text before or after the JSON array";

impl Default for EntityExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityExtractor {
    pub fn new() -> Self {
        // Patterns compile from literals; a failure is a programming error
        // caught by the tests below.
        let definition_patterns = vec![
            Regex::new(r"(?im)^(?P<term>[^\n:.]{3,80})\s+is\s+defined\s+as\s+(?P<def>[^.\n]{4,400})")
                .unwrap(),
            Regex::new(r"(?m)^(?P<term>[A-Z][^\n:.]{2,79}):\s+(?P<def>[^\n]{4,400})").unwrap(),
            Regex::new(r"(?m)(?P<term>[A-Z][\w -]{2,79})\s+is\s+(?:a|an|the)\s+(?P<def>[^.\n]{4,400})\.")
                .unwrap(),
            Regex::new(r"(?im)(?P<term>[\w -]{3,80})\s+refers\s+to\s+(?P<def>[^.\n]{4,400})")
                .unwrap(),
        ];
        let process_pattern =
            Regex::new(r"(?im)^\s*(?:step|phase|stage)\s*\d+[.:)\s]+(?P<step>[^\n]{6,200})")
                .unwrap();
        let ordinal_pattern =
            Regex::new(r"(?im)\b(?:first|second|third|finally|next)[,:]\s+(?P<step>[^.\n]{6,200})")
                .unwrap();

        Self {
            definition_patterns,
            process_pattern,
            ordinal_pattern,
        }
    }

    /// Rule pass: definitions, numbered procedures, section headings.
    pub fn extract_with_rules(&self, chunk: &Chunk, chunk_id: Uuid) -> Vec<EntityCandidate> {
        let mut candidates = Vec::new();

        for pattern in &self.definition_patterns {
            for captures in pattern.captures_iter(&chunk.text) {
                let term = captures.name("term").map(|m| m.as_str().trim()).unwrap_or("");
                let definition = captures.name("def").map(|m| m.as_str().trim()).unwrap_or("");
                if term.len() > 2 && !definition.is_empty() {
                    candidates.push(EntityCandidate {
                        name: truncate(term, MAX_NAME_CHARS),
                        kind: NodeKind::Definition,
                        description: truncate(definition, MAX_DESCRIPTION_CHARS),
                        confidence: RULE_CONFIDENCE,
                        chunk_ids: vec![chunk_id],
                    });
                }
            }
        }

        for pattern in [&self.process_pattern, &self.ordinal_pattern] {
            for captures in pattern.captures_iter(&chunk.text) {
                let step = captures.name("step").map(|m| m.as_str().trim()).unwrap_or("");
                if step.len() > 5 {
                    candidates.push(EntityCandidate {
                        name: truncate(step, MAX_NAME_CHARS),
                        kind: NodeKind::Process,
                        description: truncate(step, MAX_DESCRIPTION_CHARS),
                        confidence: RULE_CONFIDENCE,
                        chunk_ids: vec![chunk_id],
                    });
                }
            }
        }

        // Section headings are concepts in their own right.
        if !chunk.section.is_empty() && chunk.section.len() > 2 {
            candidates.push(EntityCandidate {
                name: truncate(&chunk.section, MAX_NAME_CHARS),
                kind: NodeKind::Concept,
                description: String::new(),
                confidence: RULE_CONFIDENCE,
                chunk_ids: vec![chunk_id],
            });
        }

        candidates
    }

    /// LLM pass. A response that fails schema parsing yields an empty list
    /// for this chunk; that is not an ingestion failure.
    pub async fn extract_with_llm(
        &self,
        gateway: &LlmGateway,
        chunk: &Chunk,
        chunk_id: Uuid,
    ) -> Result<Vec<EntityCandidate>> {
        let text = truncate(&chunk.text, MAX_LLM_TEXT_CHARS);
        let messages = [
            ChatMessage::system(ENTITY_SYSTEM_PROMPT),
            ChatMessage::user(format!("Extract entities from:\n\n{text}")),
        ];

        let response = gateway.chat(&messages).await?;
        let items = parse_json_array(&response);
        if items.is_empty() {
            tracing::debug!(chunk = %chunk_id, "entity extraction returned no parseable entities");
        }

        let mut candidates = Vec::new();
        for item in items {
            let Some(name) = item["name"].as_str().map(str::trim).filter(|n| !n.is_empty())
            else {
                continue;
            };
            let kind = item["type"]
                .as_str()
                .and_then(NodeKind::parse)
                .unwrap_or(NodeKind::Concept);
            let description = item["description"].as_str().unwrap_or("").trim().to_string();
            let confidence = item["confidence"]
                .as_f64()
                .map(|c| (c as f32).clamp(0.0, 1.0))
                .unwrap_or(LLM_DEFAULT_CONFIDENCE);

            candidates.push(EntityCandidate {
                name: truncate(name, MAX_NAME_CHARS),
                kind,
                description: truncate(&description, MAX_DESCRIPTION_CHARS),
                confidence,
                chunk_ids: vec![chunk_id],
            });
        }

        Ok(candidates)
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str, section: &str) -> Chunk {
        Chunk {
            chunk_index: 0,
            page: 1,
            section: section.to_string(),
            text: text.to_string(),
            is_table: false,
            is_caption: false,
            heading_level: 0,
        }
    }

    #[test]
    fn test_is_defined_as_pattern() {
        let extractor = EntityExtractor::new();
        let found = extractor.extract_with_rules(
            &chunk(
                "Photosynthesis is defined as the process by which plants convert light into energy",
                "",
            ),
            Uuid::new_v4(),
        );
        let def = found
            .iter()
            .find(|c| c.kind == NodeKind::Definition)
            .expect("definition candidate");
        assert_eq!(def.name, "Photosynthesis");
        assert!(def.description.contains("plants convert light"));
        assert_eq!(def.confidence, 0.9);
    }

    #[test]
    fn test_colon_definition_pattern() {
        let extractor = EntityExtractor::new();
        let found = extractor.extract_with_rules(
            &chunk("Chlorophyll: the green pigment that absorbs light", ""),
            Uuid::new_v4(),
        );
        assert!(found
            .iter()
            .any(|c| c.kind == NodeKind::Definition && c.name == "Chlorophyll"));
    }

    #[test]
    fn test_numbered_steps_become_processes() {
        let extractor = EntityExtractor::new();
        let found = extractor.extract_with_rules(
            &chunk(
                "Step 1: absorb light through the leaves\nStep 2: split water molecules",
                "",
            ),
            Uuid::new_v4(),
        );
        let steps: Vec<_> = found.iter().filter(|c| c.kind == NodeKind::Process).collect();
        assert_eq!(steps.len(), 2);
    }

    #[test]
    fn test_heading_becomes_concept() {
        let extractor = EntityExtractor::new();
        let found =
            extractor.extract_with_rules(&chunk("Some body text.", "Light Reactions"), Uuid::new_v4());
        assert!(found
            .iter()
            .any(|c| c.kind == NodeKind::Concept && c.name == "Light Reactions"));
    }

    #[test]
    fn test_no_candidates_from_plain_text() {
        let extractor = EntityExtractor::new();
        let found = extractor.extract_with_rules(
            &chunk("it was a quiet afternoon and nothing happened", ""),
            Uuid::new_v4(),
        );
        assert!(found.is_empty());
    }
}
