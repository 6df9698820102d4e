use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};

/// Full platform configuration, loaded from environment variables.
/// Every knob has a default except the admin bootstrap credentials, which
/// are validated separately by the server at boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    pub llm: LlmConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub ingest: IngestConfig,
    pub chat: ChatConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub embedding_base_url: String,
    pub embedding_model: String,
    pub embedding_dim: usize,
    /// Global cap on concurrent LLM calls (chat and embedding share it).
    pub concurrency: usize,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub min_chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub vector_score_threshold: f32,
    pub max_hops: u32,
    /// Edges below this score are not traversed during expansion.
    pub expansion_edge_threshold: f32,
    /// Hard cap on nodes collected during expansion.
    pub max_expansion_nodes: usize,
    pub context_token_budget: usize,
    pub vector_timeout_secs: u64,
    pub graph_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub worker_concurrency: usize,
    pub max_document_bytes: u64,
    pub stage_max_retries: u32,
    /// Base of the exponential backoff (60s, then 120s, 240s). Tests shrink it.
    pub retry_base_secs: u64,
    pub stage_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    pub session_ttl_min: i64,
    pub history_turns: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    pub vector_data_dir: PathBuf,
    pub storage_root: PathBuf,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig {
                base_url: "http://localhost:11434/v1".into(),
                model: "qwen3:32b".into(),
                embedding_base_url: "http://localhost:11434/v1".into(),
                embedding_model: "bge-m3".into(),
                embedding_dim: 1024,
                concurrency: 2,
                request_timeout_secs: 120,
            },
            chunking: ChunkingConfig {
                chunk_size: 1000,
                chunk_overlap: 200,
                min_chunk_size: 50,
            },
            retrieval: RetrievalConfig {
                top_k: 8,
                vector_score_threshold: 0.7,
                max_hops: 2,
                expansion_edge_threshold: 0.7,
                max_expansion_nodes: 20,
                context_token_budget: 3000,
                vector_timeout_secs: 5,
                graph_timeout_secs: 10,
            },
            ingest: IngestConfig {
                worker_concurrency: 3,
                max_document_bytes: 104_857_600,
                stage_max_retries: 3,
                retry_base_secs: 60,
                stage_timeout_secs: 15 * 60,
            },
            chat: ChatConfig {
                session_ttl_min: 30,
                history_turns: 10,
            },
            storage: StorageConfig {
                database_path: PathBuf::from("data/uttar.db"),
                vector_data_dir: PathBuf::from("data/vectors"),
                storage_root: PathBuf::from("data/files"),
            },
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env_var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| RagError::Validation(format!("{name} has an invalid value: {raw:?}"))),
        None => Ok(default),
    }
}

impl RagConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            llm: LlmConfig {
                base_url: env_var("LLM_BASE_URL").unwrap_or(defaults.llm.base_url),
                model: env_var("LLM_MODEL").unwrap_or(defaults.llm.model),
                embedding_base_url: env_var("EMBEDDING_BASE_URL")
                    .unwrap_or(defaults.llm.embedding_base_url),
                embedding_model: env_var("EMBEDDING_MODEL").unwrap_or(defaults.llm.embedding_model),
                embedding_dim: env_parse("EMBEDDING_DIM", defaults.llm.embedding_dim)?,
                concurrency: env_parse("LLM_CONCURRENCY", defaults.llm.concurrency)?,
                request_timeout_secs: env_parse(
                    "LLM_REQUEST_TIMEOUT_SECS",
                    defaults.llm.request_timeout_secs,
                )?,
            },
            chunking: ChunkingConfig {
                chunk_size: env_parse("CHUNK_SIZE", defaults.chunking.chunk_size)?,
                chunk_overlap: env_parse("CHUNK_OVERLAP", defaults.chunking.chunk_overlap)?,
                min_chunk_size: env_parse("MIN_CHUNK_SIZE", defaults.chunking.min_chunk_size)?,
            },
            retrieval: RetrievalConfig {
                top_k: env_parse("TOP_K", defaults.retrieval.top_k)?,
                vector_score_threshold: env_parse(
                    "VECTOR_SCORE_THRESHOLD",
                    defaults.retrieval.vector_score_threshold,
                )?,
                max_hops: env_parse("MAX_HOPS", defaults.retrieval.max_hops)?,
                expansion_edge_threshold: defaults.retrieval.expansion_edge_threshold,
                max_expansion_nodes: defaults.retrieval.max_expansion_nodes,
                context_token_budget: env_parse(
                    "CONTEXT_TOKEN_BUDGET",
                    defaults.retrieval.context_token_budget,
                )?,
                vector_timeout_secs: defaults.retrieval.vector_timeout_secs,
                graph_timeout_secs: defaults.retrieval.graph_timeout_secs,
            },
            ingest: IngestConfig {
                worker_concurrency: env_parse(
                    "WORKER_CONCURRENCY",
                    defaults.ingest.worker_concurrency,
                )?,
                max_document_bytes: env_parse(
                    "MAX_DOCUMENT_BYTES",
                    defaults.ingest.max_document_bytes,
                )?,
                stage_max_retries: defaults.ingest.stage_max_retries,
                retry_base_secs: env_parse("RETRY_BASE_SECS", defaults.ingest.retry_base_secs)?,
                stage_timeout_secs: defaults.ingest.stage_timeout_secs,
            },
            chat: ChatConfig {
                session_ttl_min: env_parse("SESSION_TTL_MIN", defaults.chat.session_ttl_min)?,
                history_turns: env_parse("HISTORY_TURNS", defaults.chat.history_turns)?,
            },
            storage: StorageConfig {
                database_path: env_var("DATABASE_PATH")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.database_path),
                vector_data_dir: env_var("VECTOR_DATA_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.vector_data_dir),
                storage_root: env_var("STORAGE_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.storage_root),
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.llm.embedding_dim == 0 {
            return Err(RagError::validation("EMBEDDING_DIM must be > 0"));
        }
        if self.llm.concurrency == 0 {
            return Err(RagError::validation("LLM_CONCURRENCY must be > 0"));
        }
        if self.ingest.worker_concurrency == 0 {
            return Err(RagError::validation("WORKER_CONCURRENCY must be > 0"));
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err(RagError::validation("CHUNK_OVERLAP must be < CHUNK_SIZE"));
        }
        if self.retrieval.top_k == 0 {
            return Err(RagError::validation("TOP_K must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.retrieval.vector_score_threshold) {
            return Err(RagError::validation(
                "VECTOR_SCORE_THRESHOLD must be in [0.0, 1.0]",
            ));
        }
        if self.chat.session_ttl_min <= 0 {
            return Err(RagError::validation("SESSION_TTL_MIN must be > 0"));
        }
        if self.chat.history_turns == 0 {
            return Err(RagError::validation("HISTORY_TURNS must be > 0"));
        }
        Ok(())
    }
}
