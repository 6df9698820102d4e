//! Staged, resumable ingestion pipeline with a durable job queue.
//!
//! parse(10) → chunk(30) → embed(50) → extract(70) → graph(90) →
//! finalize(100). Stage transitions hit the relational store before the bus;
//! transient failures retry with exponential backoff at stage boundaries;
//! validation failures are terminal. Stage effects are idempotent, so a
//! crashed worker's requeued job redoes work without duplicating it.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::time::timeout;
use uuid::Uuid;

use crate::bus::{BusEvent, ProgressBus};
use crate::config::RagConfig;
use crate::error::{RagError, Result};
use crate::extract::{fuse_entities, EntityCandidate, EntityExtractor, RelationCandidate, RelationExtractor};
use crate::graph::GraphBuilder;
use crate::llm::LlmGateway;
use crate::processing::{parse_pdf, Chunk, ParsedDocument, TextChunker};
use crate::storage::{GraphStore, IngestJob, MetaStore, VectorIndex};
use crate::types::{chunk_id, ChunkRecord, Document, DocumentStatus};
use crate::version::VersionManager;

/// Embedding batch size per gateway call.
const EMBED_BATCH: usize = 16;

struct Stage {
    status: DocumentStatus,
    progress: i64,
}

const STAGES: [Stage; 5] = [
    Stage { status: DocumentStatus::Parsing, progress: 10 },
    Stage { status: DocumentStatus::Chunking, progress: 30 },
    Stage { status: DocumentStatus::Embedding, progress: 50 },
    Stage { status: DocumentStatus::Extracting, progress: 70 },
    Stage { status: DocumentStatus::Graphing, progress: 90 },
];

pub struct IngestOrchestrator {
    meta: Arc<MetaStore>,
    vector: Arc<dyn VectorIndex>,
    graph: Arc<dyn GraphStore>,
    gateway: Arc<LlmGateway>,
    bus: Arc<ProgressBus>,
    versions: Arc<VersionManager>,
    config: RagConfig,
    /// Graph writes serialize per tenant to keep node dedup race-free.
    tenant_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    worker_permits: Arc<Semaphore>,
}

impl IngestOrchestrator {
    pub fn new(
        meta: Arc<MetaStore>,
        vector: Arc<dyn VectorIndex>,
        graph: Arc<dyn GraphStore>,
        gateway: Arc<LlmGateway>,
        bus: Arc<ProgressBus>,
        versions: Arc<VersionManager>,
        config: RagConfig,
    ) -> Self {
        let worker_permits = Arc::new(Semaphore::new(config.ingest.worker_concurrency));
        Self {
            meta,
            vector,
            graph,
            gateway,
            bus,
            versions,
            config,
            tenant_locks: DashMap::new(),
            worker_permits,
        }
    }

    /// Register an uploaded document: open (or join) a building version,
    /// create the row, enqueue the job. The caller owns the id because the
    /// stored file is named after it.
    pub async fn enqueue_document(
        &self,
        document_id: Uuid,
        chatbot_id: Uuid,
        filename: &str,
        file_path: &str,
        size_bytes: i64,
    ) -> Result<Document> {
        if size_bytes > self.config.ingest.max_document_bytes as i64 {
            return Err(RagError::validation(format!(
                "document exceeds {} bytes",
                self.config.ingest.max_document_bytes
            )));
        }

        let (version, created) = self.versions.open_build_version(chatbot_id).await?;
        if created {
            // A fresh version rebuilds the whole corpus: still-present older
            // documents re-ingest alongside the new one.
            self.carry_over_documents(chatbot_id, version.version).await?;
        }

        let document = self
            .meta
            .create_document(
                document_id,
                chatbot_id,
                filename,
                file_path,
                size_bytes,
                version.version,
            )
            .await?;
        self.meta
            .enqueue_job(document.id, chatbot_id, version.version)
            .await?;
        self.bus.publish(
            document.id,
            BusEvent::Progress {
                progress: 0,
                stage: DocumentStatus::Pending.as_str().into(),
                error: None,
            },
        );

        tracing::info!(
            chatbot = %chatbot_id,
            document = %document.id,
            version = version.version,
            filename,
            "document enqueued"
        );
        Ok(document)
    }

    /// Move the previous active version's documents into the new build
    /// version and queue them for re-ingestion.
    async fn carry_over_documents(&self, chatbot_id: Uuid, new_version: i64) -> Result<()> {
        let chatbot = self.meta.get_chatbot(chatbot_id).await?;
        if chatbot.active_version == 0 || chatbot.active_version == new_version {
            return Ok(());
        }
        let older = self
            .meta
            .documents_in_version(chatbot_id, chatbot.active_version)
            .await?;
        for document in older {
            self.meta
                .reassign_document_version(document.id, new_version)
                .await?;
            self.meta
                .enqueue_job(document.id, chatbot_id, new_version)
                .await?;
            tracing::info!(
                chatbot = %chatbot_id,
                document = %document.id,
                version = new_version,
                "carrying document into new build version"
            );
        }
        Ok(())
    }

    /// Spawn the worker pool. Workers drain the durable queue until the
    /// shutdown signal flips.
    pub fn spawn_workers(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let count = self.config.ingest.worker_concurrency;
        (0..count)
            .map(|worker| {
                let orchestrator = Arc::clone(self);
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        if *shutdown.borrow() {
                            break;
                        }
                        match orchestrator.step().await {
                            Ok(true) => {}
                            Ok(false) => {
                                // Queue empty; idle until poked or shut down.
                                tokio::select! {
                                    _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                                    _ = shutdown.changed() => {}
                                }
                            }
                            Err(e) => {
                                tracing::error!(worker, error = %e, "worker step failed");
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        }
                    }
                    tracing::debug!(worker, "ingest worker stopped");
                })
            })
            .collect()
    }

    /// Claim and process one job. Returns false when the queue is empty.
    pub async fn step(&self) -> Result<bool> {
        let permit = self
            .worker_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RagError::Internal("worker semaphore closed".into()))?;

        let Some(job) = self.meta.claim_job().await? else {
            drop(permit);
            return Ok(false);
        };

        let result = self.process_job(&job).await;
        drop(permit);

        match result {
            Ok(()) => {
                self.meta.complete_job(job.id).await?;
            }
            Err(RagError::Cancelled) => {
                tracing::info!(document = %job.document_id, "ingestion cancelled between stages");
                self.meta.fail_job(job.id, "cancelled").await?;
                self.meta
                    .set_document_failed(job.document_id, "cancelled")
                    .await?;
            }
            Err(e) => {
                tracing::warn!(document = %job.document_id, error = %e, "ingestion failed");
                self.meta.fail_job(job.id, &e.to_string()).await?;
                self.meta
                    .set_document_failed(job.document_id, &e.to_string())
                    .await?;
                self.bus.publish(
                    job.document_id,
                    BusEvent::Progress {
                        progress: -1,
                        stage: DocumentStatus::Failed.as_str().into(),
                        error: Some(e.to_string()),
                    },
                );
            }
        }
        Ok(true)
    }

    async fn process_job(&self, job: &IngestJob) -> Result<()> {
        let document = self.meta.get_document(job.document_id).await?;

        // Stage 1: parse.
        self.enter_stage(&document, &STAGES[0]).await?;
        let parsed = self
            .with_stage_retries("parse", || {
                let path = std::path::PathBuf::from(document.file_path.clone());
                async move {
                    tokio::task::spawn_blocking(move || parse_pdf(&path))
                        .await
                        .map_err(|e| RagError::Internal(format!("parse task: {e}")))?
                }
            })
            .await?;
        self.meta
            .set_document_parsed(document.id, parsed.page_count as i64)
            .await?;

        // Stage 2: chunk.
        self.enter_stage(&document, &STAGES[1]).await?;
        let chunks = self.chunk_stage(&parsed).await?;
        if chunks.is_empty() {
            return Err(RagError::Permanent("no chunks produced from document".into()));
        }
        tracing::info!(document = %document.id, chunks = chunks.len(), "chunking done");

        // Stage 3: embed.
        self.enter_stage(&document, &STAGES[2]).await?;
        self.with_stage_retries("embed", || {
            let chunks = chunks.clone();
            let document = document.clone();
            async move { self.embed_stage(&document, &chunks).await }
        })
        .await?;

        // Stage 4: extract.
        self.enter_stage(&document, &STAGES[3]).await?;
        let (entities, relations) = self
            .with_stage_retries("extract", || {
                let chunks = chunks.clone();
                let document = document.clone();
                async move { self.extract_stage(&document, &chunks).await }
            })
            .await?;
        let entity_count = entities.len();

        // Stage 5: graph. Serialized per tenant.
        self.enter_stage(&document, &STAGES[4]).await?;
        self.with_stage_retries("graph", || {
            let entities = entities.clone();
            let relations = relations.clone();
            let document = document.clone();
            async move {
                let lock = self.tenant_lock(document.chatbot_id);
                let _guard = lock.lock().await;
                GraphBuilder::new(self.graph.as_ref())
                    .build(document.chatbot_id, document.version, entities, relations)
                    .await?;
                Ok(())
            }
        })
        .await?;

        // Stage 6: finalize.
        self.meta
            .set_document_completed(document.id, chunks.len() as i64, entity_count as i64)
            .await?;
        self.bus.publish(
            document.id,
            BusEvent::Progress {
                progress: 100,
                stage: DocumentStatus::Completed.as_str().into(),
                error: None,
            },
        );
        self.versions
            .finalize_if_complete(document.chatbot_id, document.version)
            .await?;

        tracing::info!(document = %document.id, "ingestion complete");
        Ok(())
    }

    /// Transition into a stage: cancellation check, transactional status
    /// write, then the bus event, in that order.
    async fn enter_stage(&self, document: &Document, stage: &Stage) -> Result<()> {
        if self.bus.is_cancelled(document.id) {
            return Err(RagError::Cancelled);
        }
        self.meta
            .set_document_stage(document.id, stage.status, stage.progress)
            .await?;
        self.bus.publish(
            document.id,
            BusEvent::Progress {
                progress: stage.progress,
                stage: stage.status.as_str().into(),
                error: None,
            },
        );
        tracing::debug!(document = %document.id, stage = stage.status.as_str(), "entering stage");
        Ok(())
    }

    /// Run one stage with the retry policy: the first attempt plus up to
    /// `stage_max_retries` retries on transient errors, doubling the backoff
    /// each time (60s, 120s, 240s at the defaults), with a wall-clock
    /// timeout per attempt. Non-transient errors are terminal immediately.
    async fn with_stage_retries<T, F, Fut>(&self, stage: &str, mut attempt_fn: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let max_retries = self.config.ingest.stage_max_retries;
        let stage_timeout = Duration::from_secs(self.config.ingest.stage_timeout_secs);
        let mut delay = Duration::from_secs(self.config.ingest.retry_base_secs);

        let mut retries = 0;
        loop {
            let result = timeout(stage_timeout, attempt_fn())
                .await
                .unwrap_or_else(|_| Err(RagError::Transient(format!("{stage} stage timed out"))));

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && retries < max_retries => {
                    retries += 1;
                    tracing::warn!(stage, retries, delay_secs = delay.as_secs(), error = %e, "stage retry");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn chunk_stage(&self, parsed: &ParsedDocument) -> Result<Vec<Chunk>> {
        let chunker = TextChunker::new(&self.config.chunking);
        let segments = parsed.segments.clone();
        tokio::task::spawn_blocking(move || chunker.chunk_document(&segments))
            .await
            .map_err(|e| RagError::Internal(format!("chunk task: {e}")))
    }

    async fn embed_stage(&self, document: &Document, chunks: &[Chunk]) -> Result<()> {
        for batch in chunks.chunks(EMBED_BATCH) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self.gateway.embed(&texts).await?;

            let records: Vec<ChunkRecord> = batch
                .iter()
                .zip(vectors)
                .map(|(chunk, vector)| ChunkRecord {
                    id: chunk_id(document.id, chunk.chunk_index),
                    chatbot_id: document.chatbot_id,
                    document_id: document.id,
                    version: document.version,
                    chunk_index: chunk.chunk_index,
                    page: chunk.page,
                    section: chunk.section.clone(),
                    filename: document.filename.clone(),
                    text: chunk.text.clone(),
                    vector,
                    is_table: chunk.is_table,
                    is_caption: chunk.is_caption,
                    heading_level: chunk.heading_level,
                })
                .collect();

            self.vector
                .upsert_chunks(document.chatbot_id, document.version, &records)
                .await?;
        }
        Ok(())
    }

    async fn extract_stage(
        &self,
        document: &Document,
        chunks: &[Chunk],
    ) -> Result<(Vec<EntityCandidate>, Vec<RelationCandidate>)> {
        let entity_extractor = EntityExtractor::new();
        let relation_extractor = RelationExtractor::new();

        let mut entities: Vec<EntityCandidate> = Vec::new();
        for chunk in chunks {
            let id = chunk_id(document.id, chunk.chunk_index);
            entities.extend(entity_extractor.extract_with_rules(chunk, id));
            entities.extend(entity_extractor.extract_with_llm(&self.gateway, chunk, id).await?);
        }
        let fused = fuse_entities(entities);

        let mut relations: Vec<RelationCandidate> = Vec::new();
        for chunk in chunks {
            relations.extend(relation_extractor.extract_with_rules(&chunk.text, &fused));
            relations.extend(
                relation_extractor
                    .extract_with_llm(&self.gateway, &chunk.text, &fused)
                    .await?,
            );
        }

        tracing::info!(
            document = %document.id,
            entities = fused.len(),
            relations = relations.len(),
            "extraction done"
        );
        Ok((fused, relations))
    }

    fn tenant_lock(&self, chatbot_id: Uuid) -> Arc<Mutex<()>> {
        self.tenant_locks
            .entry(chatbot_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
