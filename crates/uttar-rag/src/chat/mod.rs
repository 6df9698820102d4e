//! Answer streaming: session checks, retrieval, prompt composition, token
//! fan-out with cancellation, and message persistence with metrics.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::bus::ProgressBus;
use crate::config::ChatConfig;
use crate::error::{RagError, Result};
use crate::llm::prompt::{HistoryTurn, PromptBuilder};
use crate::llm::{LlmGateway, StreamingThinkFilter};
use crate::retrieval::HybridRetriever;
use crate::storage::meta::NewMessage;
use crate::storage::MetaStore;
use crate::token_counter::calculate_usage;
use crate::types::{Chatbot, ConversationSession, Message, MessageRole, SourceRef};

/// Typed events delivered to the client channel, in order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    ThinkingStatus {
        stage: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        source_count: Option<usize>,
    },
    Content {
        content: String,
    },
    Sources {
        sources: Vec<SourceRef>,
    },
    Done {
        message_id: Uuid,
    },
    Error {
        kind: String,
        error: String,
    },
}

impl ChatEvent {
    fn status(stage: &str, message: &str) -> Self {
        ChatEvent::ThinkingStatus {
            stage: stage.into(),
            message: message.into(),
            source_count: None,
        }
    }
}

pub struct ChatService {
    meta: Arc<MetaStore>,
    retriever: Arc<HybridRetriever>,
    gateway: Arc<LlmGateway>,
    bus: Arc<ProgressBus>,
    config: ChatConfig,
}

impl ChatService {
    pub fn new(
        meta: Arc<MetaStore>,
        retriever: Arc<HybridRetriever>,
        gateway: Arc<LlmGateway>,
        bus: Arc<ProgressBus>,
        config: ChatConfig,
    ) -> Self {
        Self {
            meta,
            retriever,
            gateway,
            bus,
            config,
        }
    }

    pub async fn create_session(&self, chatbot_id: Uuid) -> Result<ConversationSession> {
        self.meta
            .create_session(chatbot_id, self.config.session_ttl_min)
            .await
    }

    /// Validate the session and persist the user message (with its
    /// synchronous counter increments). Returns the stored user message.
    async fn accept_user_message(
        &self,
        chatbot: &Chatbot,
        session_id: Uuid,
        text: &str,
    ) -> Result<Message> {
        let session = self.meta.get_session(session_id).await?;
        if session.chatbot_id != chatbot.id {
            return Err(RagError::not_found(format!("session {session_id}")));
        }
        if session.is_expired(chrono::Utc::now()) {
            return Err(RagError::validation("session expired"));
        }
        if text.trim().is_empty() {
            return Err(RagError::validation("message must not be empty"));
        }

        self.meta.add_message(&NewMessage::user(session_id, text)).await
    }

    /// Stream a response for `text` in `session_id`. Events flow through
    /// `events`; the transport layer frames them. Errors before the user
    /// message persists are returned; errors after become an `error` event
    /// plus a failed assistant message, per the propagation policy.
    pub async fn stream_response(
        &self,
        chatbot: &Chatbot,
        session_id: Uuid,
        text: &str,
        events: mpsc::Sender<ChatEvent>,
    ) -> Result<()> {
        // A fresh request invalidates any stop left over from the last one.
        self.bus.clear(session_id);
        let user_message = self.accept_user_message(chatbot, session_id, text).await?;

        match self
            .respond(chatbot, session_id, &user_message, &events)
            .await
        {
            Ok(()) => Ok(()),
            Err(RagError::Cancelled) => Ok(()),
            Err(e) => {
                tracing::warn!(session = %session_id, error = %e, "generation failed");
                let _ = events
                    .send(ChatEvent::Error {
                        kind: error_kind(&e).into(),
                        error: e.to_string(),
                    })
                    .await;
                let failed = NewMessage {
                    role: MessageRole::Assistant,
                    content: "",
                    failed: true,
                    ..NewMessage::user(session_id, "")
                };
                let _ = self.meta.add_message(&failed).await;
                Ok(())
            }
        }
    }

    async fn respond(
        &self,
        chatbot: &Chatbot,
        session_id: Uuid,
        user_message: &Message,
        events: &mpsc::Sender<ChatEvent>,
    ) -> Result<()> {
        let started = Instant::now();

        send(events, ChatEvent::status("history", "Reviewing the conversation...")).await?;
        let tail = self
            .meta
            .session_messages_tail(session_id, self.config.history_turns)
            .await?;
        let history: Vec<HistoryTurn> = tail
            .iter()
            .filter(|m| m.id != user_message.id && !m.failed)
            .map(|m| HistoryTurn {
                role: m.role,
                content: m.content.clone(),
            })
            .collect();

        send(events, ChatEvent::status("retrieval", "Searching the documents...")).await?;
        let retrieval_started = Instant::now();
        let retrieval = self
            .retriever
            .retrieve(&user_message.content, chatbot.id, chatbot.active_version, true)
            .await?;
        let retrieval_time_ms = retrieval_started.elapsed().as_millis() as i64;
        let retrieval_count = (retrieval.vector_count + retrieval.graph_count) as i64;

        if !retrieval.sources.is_empty() {
            send(
                events,
                ChatEvent::ThinkingStatus {
                    stage: "context_found".into(),
                    message: format!("Found {} relevant sources.", retrieval.sources.len()),
                    source_count: Some(retrieval.sources.len()),
                },
            )
            .await?;
        }

        // Nothing retrieved at all: answer with the persona fallback.
        if retrieval.items.is_empty() {
            let fallback = chatbot.persona.fallback_message.clone();
            send(events, ChatEvent::Content { content: fallback.clone() }).await?;
            send(events, ChatEvent::Sources { sources: Vec::new() }).await?;

            let stored = self
                .persist_assistant(
                    session_id,
                    &fallback,
                    &[],
                    false,
                    started.elapsed().as_millis() as i64,
                    0,
                    retrieval_time_ms,
                    &user_message.content,
                )
                .await?;
            send(events, ChatEvent::Done { message_id: stored.id }).await?;
            return Ok(());
        }

        send(events, ChatEvent::status("generating", "Writing the answer...")).await?;

        let builder = PromptBuilder::new(&chatbot.persona);
        let messages = builder.build(
            &user_message.content,
            &retrieval.items,
            &retrieval.sources,
            &history,
        );
        let prompt_text: String = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        // The stop endpoint publishes on the session key; the stream polls
        // the bus before every token it hands out.
        let stop_bus = self.bus.clone();
        let mut stream = self
            .gateway
            .chat_stream(&messages)
            .await?
            .with_stop_check(move || stop_bus.is_cancelled(session_id));
        let mut filter = StreamingThinkFilter::new();

        while let Some(token) = stream.next().await {
            let visible = filter.process_chunk(&token);
            if !visible.is_empty() {
                send(events, ChatEvent::Content { content: visible }).await?;
            }
        }
        let cancelled = stream.was_stopped();

        if !cancelled {
            let remaining = filter.flush();
            if !remaining.is_empty() {
                send(events, ChatEvent::Content { content: remaining }).await?;
            }
        }

        let content = filter.clean_full_response();
        let response_time_ms = started.elapsed().as_millis() as i64;

        if cancelled {
            // Persist what streamed, flagged; no further events.
            self.persist_assistant(
                session_id,
                &content,
                &retrieval.sources,
                true,
                response_time_ms,
                retrieval_count,
                retrieval_time_ms,
                &prompt_text,
            )
            .await?;
            return Err(RagError::Cancelled);
        }

        send(
            events,
            ChatEvent::Sources {
                sources: retrieval.sources.clone(),
            },
        )
        .await?;

        let stored = self
            .persist_assistant(
                session_id,
                &content,
                &retrieval.sources,
                false,
                response_time_ms,
                retrieval_count,
                retrieval_time_ms,
                &prompt_text,
            )
            .await?;
        send(events, ChatEvent::Done { message_id: stored.id }).await?;

        tracing::info!(
            session = %session_id,
            response_ms = response_time_ms,
            retrieval_ms = retrieval_time_ms,
            sources = retrieval.sources.len(),
            stream_tokens = stream.tokens_emitted(),
            "answer streamed"
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist_assistant(
        &self,
        session_id: Uuid,
        content: &str,
        sources: &[SourceRef],
        cancelled: bool,
        response_time_ms: i64,
        retrieval_count: i64,
        retrieval_time_ms: i64,
        prompt_text: &str,
    ) -> Result<Message> {
        let usage = calculate_usage(prompt_text, content);
        let message = NewMessage {
            role: MessageRole::Assistant,
            content,
            sources: Some(sources),
            cancelled,
            response_time_ms: Some(response_time_ms),
            input_tokens: Some(usage.input_tokens as i64),
            output_tokens: Some(usage.output_tokens as i64),
            retrieval_count: Some(retrieval_count),
            retrieval_time_ms: Some(retrieval_time_ms),
            ..NewMessage::user(session_id, "")
        };
        self.meta.add_message(&message).await
    }

    /// Publish a stop for the session's in-flight generation.
    pub fn request_stop(&self, session_id: Uuid) {
        self.bus.request_cancel(session_id);
    }
}

async fn send(events: &mpsc::Sender<ChatEvent>, event: ChatEvent) -> Result<()> {
    events
        .send(event)
        .await
        .map_err(|_| RagError::Cancelled)
}

fn error_kind(e: &RagError) -> &'static str {
    match e {
        RagError::Validation(_) => "validation",
        RagError::NotFound(_) => "not_found",
        RagError::Conflict(_) => "conflict",
        RagError::Transient(_) => "transient",
        RagError::Permanent(_) => "permanent",
        RagError::Cancelled => "cancelled",
        RagError::Internal(_) => "internal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;

    use crate::config::RetrievalConfig;
    use crate::llm::{ChatMessage, LlmClient, TokenStream};
    use crate::storage::{SqliteGraphStore, VectorIndex};
    use crate::types::{normalize_name, ChunkRecord, GraphNode, NodeKind, Persona, SearchHit};

    /// Records chat_stream calls and streams canned tokens, optionally with
    /// a pause after the first one so cancellation can land mid-stream.
    struct ScriptedLlm {
        tokens: Vec<&'static str>,
        pause_after_first: bool,
        calls: SyncMutex<Vec<Vec<ChatMessage>>>,
        resume: tokio::sync::Notify,
    }

    impl ScriptedLlm {
        fn new(tokens: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                tokens,
                pause_after_first: false,
                calls: SyncMutex::new(Vec::new()),
                resume: tokio::sync::Notify::new(),
            })
        }

        fn pausing(tokens: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                tokens,
                pause_after_first: true,
                calls: SyncMutex::new(Vec::new()),
                resume: tokio::sync::Notify::new(),
            })
        }

        fn last_call(&self) -> Vec<ChatMessage> {
            self.calls.lock().last().cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl LlmClient for Arc<ScriptedLlm> {
        async fn chat(&self, _messages: &[ChatMessage]) -> Result<String> {
            Ok("[]".into())
        }

        async fn chat_stream(&self, messages: &[ChatMessage]) -> Result<TokenStream> {
            self.calls.lock().push(messages.to_vec());
            let (tx, rx) = mpsc::channel(8);
            let this = self.clone();
            tokio::spawn(async move {
                for (i, token) in this.tokens.iter().enumerate() {
                    if tx.send(token.to_string()).await.is_err() {
                        return;
                    }
                    if this.pause_after_first && i == 0 {
                        this.resume.notified().await;
                    }
                }
            });
            Ok(TokenStream::new(rx))
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.1, 0.2, 0.3, 0.4]).collect())
        }
    }

    struct StubIndex {
        hits: Vec<SearchHit>,
    }

    #[async_trait]
    impl VectorIndex for StubIndex {
        async fn ensure_collection(&self, _c: Uuid, _v: i64) -> Result<()> {
            Ok(())
        }
        async fn upsert_chunks(&self, _c: Uuid, _v: i64, _r: &[ChunkRecord]) -> Result<()> {
            Ok(())
        }
        async fn search(
            &self,
            _c: Uuid,
            _v: i64,
            _q: &[f32],
            top_k: usize,
            threshold: f32,
        ) -> Result<Vec<SearchHit>> {
            Ok(self
                .hits
                .iter()
                .filter(|h| h.score >= threshold)
                .take(top_k)
                .cloned()
                .collect())
        }
        async fn count_chunks(&self, _c: Uuid, _v: i64, _d: Option<Uuid>) -> Result<usize> {
            Ok(self.hits.len())
        }
        async fn delete_document(&self, _c: Uuid, _v: i64, _d: Uuid) -> Result<usize> {
            Ok(0)
        }
        async fn drop_collection(&self, _c: Uuid, _v: i64) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        service: ChatService,
        meta: Arc<MetaStore>,
        bus: Arc<ProgressBus>,
        chatbot: Chatbot,
        llm: Arc<ScriptedLlm>,
    }

    async fn fixture(llm: Arc<ScriptedLlm>, hits: Vec<SearchHit>, seed_graph: bool) -> Fixture {
        let meta = Arc::new(MetaStore::connect_in_memory().await.unwrap());
        let graph = {
            let store = SqliteGraphStore::new(meta.pool().clone());
            store.migrate().await.unwrap();
            Arc::new(store)
        };
        let chatbot = meta
            .create_chatbot("helpbot", "", &Persona::default(), "help")
            .await
            .unwrap();

        if seed_graph {
            graph
                .upsert_node(&GraphNode {
                    id: Uuid::new_v4(),
                    chatbot_id: chatbot.id,
                    version: 0,
                    kind: NodeKind::Definition,
                    name: "GraphRAG".into(),
                    normalized_name: normalize_name("GraphRAG"),
                    description: "retrieval augmented by a knowledge graph".into(),
                    chunk_ids: Vec::new(),
                    confidence: 0.9,
                })
                .await
                .unwrap();
        }

        let gateway = Arc::new(LlmGateway::new(Arc::new(llm.clone()), 2, 30));
        let retriever = Arc::new(HybridRetriever::new(
            gateway.clone(),
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
        ));
        let bus = Arc::new(ProgressBus::new());
        let service = ChatService::new(
            meta.clone(),
            retriever,
            gateway,
            bus.clone(),
            ChatConfig {
                session_ttl_min: 30,
                history_turns: 10,
            },
        );

        Fixture {
            service,
            meta,
            bus,
            chatbot,
            llm,
        }
    }

    fn hit(text: &str) -> SearchHit {
        SearchHit {
            id: Uuid::new_v4(),
            document_id: Uuid::new_v4(),
            chunk_index: 0,
            page: 1,
            section: String::new(),
            filename: "bio.pdf".into(),
            text: text.to_string(),
            score: 0.9,
        }
    }

    async fn collect_events(
        fx: &Fixture,
        session_id: Uuid,
        text: &str,
    ) -> Vec<ChatEvent> {
        let (tx, mut rx) = mpsc::channel(64);
        fx.service
            .stream_response(&fx.chatbot, session_id, text, tx)
            .await
            .unwrap();
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_event_sequence_and_persistence() {
        let llm = ScriptedLlm::new(vec!["Photosynthesis ", "is the ", "process."]);
        let fx = fixture(llm, vec![hit("Photosynthesis is the process ...")], false).await;
        let session = fx.service.create_session(fx.chatbot.id).await.unwrap();

        let events = collect_events(&fx, session.id, "Define photosynthesis").await;

        let stages: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::ThinkingStatus { stage, .. } => Some(stage.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(stages, vec!["history", "retrieval", "context_found", "generating"]);

        let content: String = events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::Content { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(content, "Photosynthesis is the process.");

        let sources = events.iter().find_map(|e| match e {
            ChatEvent::Sources { sources } => Some(sources),
            _ => None,
        });
        let sources = sources.expect("sources event");
        assert_eq!(sources[0].filename.as_deref(), Some("bio.pdf"));
        assert_eq!(sources[0].page, Some(1));

        let done_id = events
            .iter()
            .find_map(|e| match e {
                ChatEvent::Done { message_id } => Some(*message_id),
                _ => None,
            })
            .expect("done event");

        // Both the user and assistant messages persisted, metrics attached.
        let tail = fx.meta.session_messages_tail(session.id, 10).await.unwrap();
        assert_eq!(tail.len(), 2);
        let assistant = tail.iter().find(|m| m.role == MessageRole::Assistant).unwrap();
        assert_eq!(assistant.id, done_id);
        assert_eq!(assistant.content, "Photosynthesis is the process.");
        assert!(assistant.response_time_ms.is_some());
        assert!(assistant.retrieval_count.unwrap() >= 1);
        assert_eq!(fx.meta.get_session(session.id).await.unwrap().message_count, 2);
    }

    #[tokio::test]
    async fn test_fallback_when_nothing_retrieved() {
        let llm = ScriptedLlm::new(vec!["never used"]);
        let fx = fixture(llm, Vec::new(), false).await;
        let session = fx.service.create_session(fx.chatbot.id).await.unwrap();

        let events = collect_events(&fx, session.id, "completely unrelated").await;

        let content: String = events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::Content { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(content, Persona::default().fallback_message);
        assert!(events.iter().any(|e| matches!(e, ChatEvent::Done { .. })));
        // Sources event is present and empty.
        assert!(events
            .iter()
            .any(|e| matches!(e, ChatEvent::Sources { sources } if sources.is_empty())));
    }

    #[tokio::test]
    async fn test_graph_only_corpus_still_answers_with_sources() {
        let llm = ScriptedLlm::new(vec!["GraphRAG is retrieval augmented by a graph."]);
        let fx = fixture(llm, Vec::new(), true).await;
        let session = fx.service.create_session(fx.chatbot.id).await.unwrap();

        let events = collect_events(&fx, session.id, "What is GraphRAG?").await;

        let sources = events
            .iter()
            .find_map(|e| match e {
                ChatEvent::Sources { sources } => Some(sources.clone()),
                _ => None,
            })
            .expect("sources event");
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].entity.as_deref(), Some("GraphRAG"));
    }

    #[tokio::test]
    async fn test_expired_session_rejects_messages() {
        let llm = ScriptedLlm::new(vec!["x"]);
        let fx = fixture(llm, Vec::new(), false).await;
        // TTL of zero: expired one second later.
        let session = fx.meta.create_session(fx.chatbot.id, 0).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

        let (tx, _rx) = mpsc::channel(8);
        let err = fx
            .service
            .stream_response(&fx.chatbot, session.id, "hello", tx)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Validation(_)));
        // The rejected message was never persisted.
        assert_eq!(fx.meta.message_count(session.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_persists_partial_flagged() {
        let llm = ScriptedLlm::pausing(vec!["Hello ", "world ", "never"]);
        let fx = fixture(
            llm.clone(),
            vec![hit("greetings text")],
            false,
        )
        .await;
        let session = fx.service.create_session(fx.chatbot.id).await.unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        let service_chatbot = fx.chatbot.clone();
        let handle = {
            let service = fx.service;
            tokio::spawn(async move {
                service
                    .stream_response(&service_chatbot, session.id, "say hello", tx)
                    .await
            })
        };

        // Wait for the first content token, then stop.
        let mut saw_first = false;
        while let Some(event) = rx.recv().await {
            if let ChatEvent::Content { content } = &event {
                assert_eq!(content, "Hello ");
                saw_first = true;
                fx.bus.request_cancel(session.id);
                llm.resume.notify_one();
                break;
            }
        }
        assert!(saw_first);
        handle.await.unwrap().unwrap();

        // No content after the stop, no sources/done.
        let mut later = Vec::new();
        while let Ok(event) = rx.try_recv() {
            later.push(event);
        }
        assert!(later
            .iter()
            .all(|e| !matches!(e, ChatEvent::Content { .. } | ChatEvent::Done { .. })));

        let tail = fx.meta.session_messages_tail(session.id, 10).await.unwrap();
        let assistant = tail.iter().find(|m| m.role == MessageRole::Assistant).unwrap();
        assert!(assistant.cancelled);
        assert_eq!(assistant.content, "Hello");
    }

    #[tokio::test]
    async fn test_history_is_the_chronological_tail() {
        let llm = ScriptedLlm::new(vec!["ok"]);
        let fx = fixture(llm.clone(), vec![hit("some context")], false).await;
        let session = fx.service.create_session(fx.chatbot.id).await.unwrap();

        for i in 1..=12 {
            collect_events(&fx, session.id, &format!("m{i}")).await;
        }

        let prompt = fx.llm.last_call();
        let user_texts: Vec<&str> = prompt
            .iter()
            .filter(|m| m.role == crate::llm::ChatRole::User)
            .map(|m| m.content.as_str())
            .collect();

        // The oldest turns fell off; recent ones are present in order.
        let joined = user_texts.join("\n");
        assert!(!joined.contains("m1\n") && !user_texts.contains(&"m1"));
        assert!(user_texts.contains(&"m10"));
        assert!(user_texts.contains(&"m11"));
        // The current question arrives wrapped with the context block.
        assert!(joined.contains("m12"));

        let index_of = |needle: &str| user_texts.iter().position(|t| *t == needle);
        let (Some(a), Some(b)) = (index_of("m10"), index_of("m11")) else {
            panic!("expected m10 and m11 as history turns");
        };
        assert!(a < b, "history must stay chronological");
    }
}
