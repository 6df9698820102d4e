//! GraphRAG core: document ingestion, hybrid retrieval, answer streaming,
//! and versioned per-tenant index lifecycle.
//!
//! The `server` crate wires these pieces to an HTTP surface; everything in
//! here is transport-agnostic.

pub mod bus;
pub mod chat;
pub mod config;
pub mod error;
pub mod extract;
pub mod graph;
pub mod ingest;
pub mod llm;
pub mod processing;
pub mod retrieval;
pub mod stats;
pub mod storage;
pub mod token_counter;
pub mod types;
pub mod version;

// Re-export the primary entry points.
pub use bus::{BusEvent, ProgressBus};
pub use chat::{ChatEvent, ChatService};
pub use config::RagConfig;
pub use error::{RagError, Result};
pub use ingest::IngestOrchestrator;
pub use llm::{HttpLlmClient, LlmClient, LlmGateway};
pub use retrieval::HybridRetriever;
pub use storage::{GraphStore, LanceVectorIndex, MetaStore, SqliteGraphStore, VectorIndex};
pub use version::VersionManager;

pub use uuid::Uuid;
