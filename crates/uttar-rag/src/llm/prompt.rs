//! Prompt composition: persona system prompt, retrieved context, conversation
//! history, current question.

use super::{ChatMessage, ChatRole};
use crate::retrieval::ContextItem;
use crate::types::{MessageRole, Persona, SourceRef};

const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a helpful AI assistant that answers questions based on the provided context.

Guidelines:
1. Only answer based on the provided context
2. If the context doesn't contain enough information, say so honestly
3. Cite your sources using [Source: N] format where N is the source number
4. Be concise but complete in your answers
5. Maintain a professional and helpful tone";

pub struct PromptBuilder<'a> {
    persona: &'a Persona,
}

/// One prior conversation turn, oldest first.
#[derive(Debug, Clone)]
pub struct HistoryTurn {
    pub role: MessageRole,
    pub content: String,
}

impl<'a> PromptBuilder<'a> {
    pub fn new(persona: &'a Persona) -> Self {
        Self { persona }
    }

    /// System prompt: persona override when set, otherwise the default, with
    /// persona name and tone appended.
    pub fn system_prompt(&self) -> String {
        let mut prompt = if self.persona.system_prompt.trim().is_empty() {
            DEFAULT_SYSTEM_PROMPT.to_string()
        } else {
            self.persona.system_prompt.clone()
        };

        if !self.persona.display_name.is_empty() || !self.persona.tone.is_empty() {
            prompt.push_str("\n\nYour persona:");
            if !self.persona.display_name.is_empty() {
                prompt.push_str(&format!("\nName: {}", self.persona.display_name));
            }
            if !self.persona.tone.is_empty() {
                prompt.push_str(&format!("\nTone: {}", self.persona.tone));
            }
        }
        if !self.persona.language.is_empty() {
            prompt.push_str(&format!("\nAnswer in language: {}", self.persona.language));
        }
        prompt
    }

    /// Context section of the user turn. Items arrive already priority-ordered
    /// by the retriever; the order is preserved verbatim.
    fn context_section(&self, context: &[ContextItem], sources: &[SourceRef]) -> String {
        if context.is_empty() {
            return "No relevant context found for this question.".to_string();
        }

        let mut section = String::from("## Retrieved Context\n\n");
        for item in context {
            section.push_str(&item.text);
            section.push_str("\n\n");
        }

        if !sources.is_empty() {
            section.push_str("## Available Sources\n");
            for (i, source) in sources.iter().enumerate() {
                let mut parts = Vec::new();
                if let Some(filename) = &source.filename {
                    parts.push(filename.clone());
                }
                if let Some(page) = source.page {
                    parts.push(format!("page {page}"));
                }
                if let Some(entity) = &source.entity {
                    parts.push(format!("entity: {entity}"));
                }
                if !parts.is_empty() {
                    section.push_str(&format!("[{}] {}\n", i + 1, parts.join(", ")));
                }
            }
        }

        section
    }

    /// Assemble the full message list: system, history (oldest first), then
    /// the context-wrapped current question.
    pub fn build(
        &self,
        user_message: &str,
        context: &[ContextItem],
        sources: &[SourceRef],
        history: &[HistoryTurn],
    ) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(self.system_prompt()));

        for turn in history {
            let role = match turn.role {
                MessageRole::User => ChatRole::User,
                MessageRole::Assistant => ChatRole::Assistant,
            };
            messages.push(ChatMessage {
                role,
                content: turn.content.clone(),
            });
        }

        let full_user_message = format!(
            "{}\n\n## User Question\n{}\n\nPlease answer the question based on the context above. \
             If citing sources, use the format [Source: N] where N is the source number.",
            self.context_section(context, sources),
            user_message
        );
        messages.push(ChatMessage::user(full_user_message));

        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceKind;

    fn item(text: &str) -> ContextItem {
        ContextItem {
            text: text.into(),
            kind: SourceKind::Vector,
            score: 0.9,
            document_id: None,
            entity: None,
            chunk_index: Some(0),
            hop: None,
        }
    }

    #[test]
    fn test_persona_override_replaces_default() {
        let persona = Persona {
            system_prompt: "You are a pirate.".into(),
            ..Default::default()
        };
        let builder = PromptBuilder::new(&persona);
        assert!(builder.system_prompt().starts_with("You are a pirate."));
    }

    #[test]
    fn test_default_prompt_when_no_override() {
        let persona = Persona::default();
        let builder = PromptBuilder::new(&persona);
        assert!(builder.system_prompt().contains("based on the provided context"));
    }

    #[test]
    fn test_message_ordering() {
        let persona = Persona::default();
        let builder = PromptBuilder::new(&persona);
        let history = vec![
            HistoryTurn {
                role: MessageRole::User,
                content: "m1".into(),
            },
            HistoryTurn {
                role: MessageRole::Assistant,
                content: "a1".into(),
            },
        ];
        let messages = builder.build("current question", &[item("ctx")], &[], &history);

        assert_eq!(messages[0].role, ChatRole::System);
        assert_eq!(messages[1].content, "m1");
        assert_eq!(messages[2].content, "a1");
        assert!(messages[3].content.contains("current question"));
        assert!(messages[3].content.contains("ctx"));
    }

    #[test]
    fn test_empty_context_notes_absence() {
        let persona = Persona::default();
        let builder = PromptBuilder::new(&persona);
        let messages = builder.build("q", &[], &[], &[]);
        assert!(messages
            .last()
            .unwrap()
            .content
            .contains("No relevant context found"));
    }
}
