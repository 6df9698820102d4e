//! Rate-limited entry point to the model server.
//!
//! The model server is the bottleneck resource: a single counting semaphore
//! caps concurrent calls across chat and embedding alike, independent of how
//! many ingest workers or request handlers are contending. Timeouts release
//! the permit.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::timeout;

use super::{ChatMessage, LlmClient, TokenStream};
use crate::error::{RagError, Result};

pub struct LlmGateway {
    client: Arc<dyn LlmClient>,
    permits: Arc<Semaphore>,
    request_timeout: Duration,
}

impl LlmGateway {
    pub fn new(client: Arc<dyn LlmClient>, concurrency: usize, request_timeout_secs: u64) -> Self {
        Self {
            client,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            request_timeout: Duration::from_secs(request_timeout_secs),
        }
    }

    /// Currently available permits; exposed for tests and health reporting.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        let _permit = self.acquire().await?;
        timeout(self.request_timeout, self.client.chat(messages))
            .await
            .map_err(|_| RagError::Transient("LLM chat timed out".into()))?
    }

    /// Start a streaming chat. The permit is held until the stream is set up;
    /// the underlying connection keeps the model busy after that, which is
    /// what the cap is actually protecting.
    pub async fn chat_stream(&self, messages: &[ChatMessage]) -> Result<TokenStream> {
        let _permit = self.acquire().await?;
        timeout(self.request_timeout, self.client.chat_stream(messages))
            .await
            .map_err(|_| RagError::Transient("LLM stream setup timed out".into()))?
    }

    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let _permit = self.acquire().await?;
        timeout(self.request_timeout, self.client.embed(texts))
            .await
            .map_err(|_| RagError::Transient("embedding request timed out".into()))?
    }

    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(std::slice::from_ref(&text.to_string())).await?;
        vectors
            .pop()
            .ok_or_else(|| RagError::Permanent("embedding endpoint returned nothing".into()))
    }

    async fn acquire(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RagError::Internal("LLM semaphore closed".into()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;

    /// Stub that records the peak number of in-flight calls.
    struct CountingClient {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    impl CountingClient {
        fn new(delay: Duration) -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay,
            }
        }

        async fn enter(&self) {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl LlmClient for CountingClient {
        async fn chat(&self, _messages: &[ChatMessage]) -> Result<String> {
            self.enter().await;
            Ok("ok".into())
        }

        async fn chat_stream(&self, _messages: &[ChatMessage]) -> Result<TokenStream> {
            self.enter().await;
            let (_tx, rx) = mpsc::channel(1);
            Ok(TokenStream::new(rx))
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.enter().await;
            Ok(texts.iter().map(|_| vec![0.0; 4]).collect())
        }
    }

    #[tokio::test]
    async fn test_semaphore_caps_concurrency() {
        let client = Arc::new(CountingClient::new(Duration::from_millis(20)));
        let gateway = Arc::new(LlmGateway::new(client.clone(), 2, 30));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gw = gateway.clone();
            handles.push(tokio::spawn(async move {
                gw.chat(&[ChatMessage::user("hi")]).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(client.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_embedding_shares_the_cap() {
        let client = Arc::new(CountingClient::new(Duration::from_millis(20)));
        let gateway = Arc::new(LlmGateway::new(client.clone(), 1, 30));

        let gw1 = gateway.clone();
        let gw2 = gateway.clone();
        let a = tokio::spawn(async move { gw1.chat(&[ChatMessage::user("x")]).await });
        let b = tokio::spawn(async move { gw2.embed(&["y".to_string()]).await });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(client.peak.load(Ordering::SeqCst), 1);
    }

    struct SlowClient;

    #[async_trait]
    impl LlmClient for SlowClient {
        async fn chat(&self, _messages: &[ChatMessage]) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(String::new())
        }

        async fn chat_stream(&self, _messages: &[ChatMessage]) -> Result<TokenStream> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            let (_tx, rx) = mpsc::channel(1);
            Ok(TokenStream::new(rx))
        }

        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_permit() {
        let gateway = LlmGateway::new(Arc::new(SlowClient), 1, 1);
        let err = gateway.chat(&[ChatMessage::user("hi")]).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(gateway.available_permits(), 1);
    }
}
