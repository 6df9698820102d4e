//! Shared application state handed to every handler.

use std::sync::Arc;

use uttar_rag::chat::ChatService;
use uttar_rag::{
    GraphStore, HybridRetriever, IngestOrchestrator, LlmGateway, MetaStore, ProgressBus,
    RagConfig, VectorIndex, VersionManager,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RagConfig>,
    pub meta: Arc<MetaStore>,
    pub vector: Arc<dyn VectorIndex>,
    pub graph: Arc<dyn GraphStore>,
    pub gateway: Arc<LlmGateway>,
    pub bus: Arc<ProgressBus>,
    pub orchestrator: Arc<IngestOrchestrator>,
    pub versions: Arc<VersionManager>,
    pub retriever: Arc<HybridRetriever>,
    pub chat: Arc<ChatService>,
    pub admin_token: Arc<str>,
}
