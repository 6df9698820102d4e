//! LLM access: OpenAI-compatible chat + embeddings behind a rate-limited
//! gateway.

mod client;
mod gateway;
pub mod prompt;
mod streaming;
mod think_filter;

pub use client::HttpLlmClient;
pub use gateway::LlmGateway;
pub use streaming::TokenStream;
pub use think_filter::{clean_response, StreamingThinkFilter};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Seam between the platform and the model server. The production
/// implementation is [`HttpLlmClient`]; tests substitute stubs.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Complete a chat non-streaming; returns the full assistant text.
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String>;

    /// Complete a chat streaming; tokens arrive on the returned stream.
    async fn chat_stream(&self, messages: &[ChatMessage]) -> Result<TokenStream>;

    /// Embed a batch of texts. Output order matches input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}
