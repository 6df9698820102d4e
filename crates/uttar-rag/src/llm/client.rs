//! OpenAI-compatible HTTP client for chat completion and embeddings.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use super::{ChatMessage, LlmClient, TokenStream};
use crate::config::LlmConfig;
use crate::error::{RagError, Result};

pub struct HttpLlmClient {
    client: Client,
    base_url: String,
    model: String,
    embedding_base_url: String,
    embedding_model: String,
    embedding_dim: usize,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

impl HttpLlmClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| RagError::Internal(format!("http client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            embedding_base_url: config.embedding_base_url.trim_end_matches('/').to_string(),
            embedding_model: config.embedding_model.clone(),
            embedding_dim: config.embedding_dim,
        })
    }

    fn chat_endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn embedding_endpoint(&self) -> String {
        format!("{}/embeddings", self.embedding_base_url)
    }

    /// Probe the model server; used at boot for a soft reachability check.
    pub async fn probe(&self) -> Result<()> {
        let url = format!("{}/models", self.base_url);
        let response = self.client.get(&url).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(RagError::Transient(format!(
                "model server responded {} at {}",
                response.status(),
                url
            )))
        }
    }

    async fn check_response(response: reqwest::Response, endpoint: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let preview: String = body.chars().take(300).collect();
        if status.is_server_error() {
            Err(RagError::Transient(format!(
                "{endpoint} returned HTTP {status}: {preview}"
            )))
        } else {
            Err(RagError::Permanent(format!(
                "{endpoint} returned HTTP {status}: {preview}"
            )))
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        let endpoint = self.chat_endpoint();
        let request = json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
        });

        tracing::debug!(endpoint = %endpoint, model = %self.model, messages = messages.len(), "chat request");

        let response = self.client.post(&endpoint).json(&request).send().await?;
        let response = Self::check_response(response, &endpoint).await?;

        let body = response.text().await?;
        // Gateways sometimes hand back HTML error pages with HTTP 200.
        if body.trim_start().starts_with('<') {
            let preview: String = body.chars().take(200).collect();
            return Err(RagError::Transient(format!(
                "{endpoint} returned HTML instead of JSON: {preview}"
            )));
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&body)
            .map_err(|e| RagError::Permanent(format!("{endpoint} response parse: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| RagError::Permanent(format!("{endpoint} returned no choices")))
    }

    async fn chat_stream(&self, messages: &[ChatMessage]) -> Result<TokenStream> {
        let endpoint = self.chat_endpoint();
        let request = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });

        let response = self.client.post(&endpoint).json(&request).send().await?;
        let response = Self::check_response(response, &endpoint).await?;

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if content_type.contains("text/html") {
            return Err(RagError::Transient(format!(
                "{endpoint} returned HTML instead of an event stream"
            )));
        }

        let (sender, receiver) = mpsc::channel::<String>(256);
        let mut byte_stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut buffer = String::new();

            while let Some(chunk_result) = byte_stream.next().await {
                let chunk = match chunk_result {
                    Ok(c) => c,
                    Err(_) => break,
                };

                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // Process complete SSE lines.
                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer = buffer[line_end + 1..].to_string();

                    if line.is_empty() || !line.starts_with("data: ") {
                        continue;
                    }

                    let data = &line[6..];
                    if data == "[DONE]" {
                        return;
                    }

                    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(data) {
                        if let Some(content) = parsed["choices"][0]["delta"]["content"].as_str() {
                            if !content.is_empty()
                                && sender.send(content.to_string()).await.is_err()
                            {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(TokenStream::new(receiver))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let endpoint = self.embedding_endpoint();
        let request = json!({
            "model": self.embedding_model,
            "input": texts,
        });

        let response = self.client.post(&endpoint).json(&request).send().await?;
        let response = Self::check_response(response, &endpoint).await?;

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| RagError::Permanent(format!("{endpoint} response parse: {e}")))?;

        let mut items = parsed.data;
        if items.len() != texts.len() {
            return Err(RagError::Permanent(format!(
                "{endpoint} returned {} embeddings for {} inputs",
                items.len(),
                texts.len()
            )));
        }
        items.sort_by_key(|item| item.index);

        for item in &items {
            if item.embedding.len() != self.embedding_dim {
                return Err(RagError::Validation(format!(
                    "embedding dimension mismatch: model returned {}, configured {}",
                    item.embedding.len(),
                    self.embedding_dim
                )));
            }
        }

        Ok(items.into_iter().map(|item| item.embedding).collect())
    }
}
