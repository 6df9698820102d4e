use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Tenant (chatbot service) ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatbotStatus {
    Processing,
    Active,
    Inactive,
    /// Cleanup of vector/graph/file artifacts did not finish; a janitor
    /// retries until it does. The id is not reused in this state.
    CleanupPending,
}

impl ChatbotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatbotStatus::Processing => "processing",
            ChatbotStatus::Active => "active",
            ChatbotStatus::Inactive => "inactive",
            ChatbotStatus::CleanupPending => "cleanup_pending",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(ChatbotStatus::Processing),
            "active" => Some(ChatbotStatus::Active),
            "inactive" => Some(ChatbotStatus::Inactive),
            "cleanup_pending" => Some(ChatbotStatus::CleanupPending),
            _ => None,
        }
    }
}

/// Public-facing persona of a chatbot. Stored as JSON on the tenant row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub tone: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub greeting: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default = "default_fallback")]
    pub fallback_message: String,
}

fn default_language() -> String {
    "en".to_string()
}

fn default_fallback() -> String {
    "I could not find anything about that in the uploaded documents. \
     Please try a question related to the document contents."
        .to_string()
}

impl Default for Persona {
    fn default() -> Self {
        Self {
            display_name: String::new(),
            tone: String::new(),
            language: default_language(),
            greeting: String::new(),
            system_prompt: String::new(),
            fallback_message: default_fallback(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chatbot {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub persona: Persona,
    /// URL-safe public slug, unique across tenants.
    pub access_url: String,
    pub status: ChatbotStatus,
    /// Version number of the sole active build version, or 0 if none.
    pub active_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Documents ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Parsing,
    Chunking,
    Embedding,
    Extracting,
    Graphing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Parsing => "parsing",
            DocumentStatus::Chunking => "chunking",
            DocumentStatus::Embedding => "embedding",
            DocumentStatus::Extracting => "extracting",
            DocumentStatus::Graphing => "graphing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DocumentStatus::Pending),
            "parsing" => Some(DocumentStatus::Parsing),
            "chunking" => Some(DocumentStatus::Chunking),
            "embedding" => Some(DocumentStatus::Embedding),
            "extracting" => Some(DocumentStatus::Extracting),
            "graphing" => Some(DocumentStatus::Graphing),
            "completed" => Some(DocumentStatus::Completed),
            "failed" => Some(DocumentStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub chatbot_id: Uuid,
    pub filename: String,
    /// Stored content locator: `{storage_root}/{tenant_id}/{document_id}.pdf`.
    pub file_path: String,
    pub size_bytes: i64,
    pub status: DocumentStatus,
    /// Build version this document contributes to.
    pub version: i64,
    pub page_count: i64,
    /// [0..100]
    pub progress: i64,
    pub error_message: Option<String>,
    pub chunk_count: i64,
    pub entity_count: i64,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ── Build versions ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Building,
    Ready,
    Active,
    Archived,
    Failed,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::Building => "building",
            VersionStatus::Ready => "ready",
            VersionStatus::Active => "active",
            VersionStatus::Archived => "archived",
            VersionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "building" => Some(VersionStatus::Building),
            "ready" => Some(VersionStatus::Ready),
            "active" => Some(VersionStatus::Active),
            "archived" => Some(VersionStatus::Archived),
            "failed" => Some(VersionStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildVersion {
    pub id: Uuid,
    pub chatbot_id: Uuid,
    /// Monotonically increasing per tenant, starting at 1.
    pub version: i64,
    pub status: VersionStatus,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
}

/// Vector collection name for a (tenant, version) pair.
pub fn collection_name(chatbot_id: Uuid, version: i64) -> String {
    format!("chatbot_{}_v{}", chatbot_id.simple(), version)
}

// ── Chunks ─────────────────────────────────────────────────────────────────

/// Namespace for deterministic chunk ids (UUIDv5 of document id + index).
pub const CHUNK_ID_NS: Uuid = Uuid::from_bytes([
    0x6e, 0x5b, 0x1c, 0x0a, 0x2f, 0x67, 0x4d, 0x2b, 0x8f, 0x31, 0xc4, 0x9a, 0x7d, 0x55, 0x10,
    0xe2,
]);

/// Deterministic chunk id: re-running the chunk or embed stage for the same
/// document yields the same ids, so upserts replace instead of duplicating.
pub fn chunk_id(document_id: Uuid, chunk_index: u32) -> Uuid {
    let mut name = document_id.as_bytes().to_vec();
    name.extend_from_slice(&chunk_index.to_be_bytes());
    Uuid::new_v5(&CHUNK_ID_NS, &name)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: Uuid,
    pub chatbot_id: Uuid,
    pub document_id: Uuid,
    pub version: i64,
    pub chunk_index: u32,
    pub page: u32,
    pub section: String,
    pub filename: String,
    pub text: String,
    pub vector: Vec<f32>,
    pub is_table: bool,
    pub is_caption: bool,
    pub heading_level: u8,
}

/// A chunk returned from vector search, with its similarity score.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: Uuid,
    pub document_id: Uuid,
    pub chunk_index: u32,
    pub page: u32,
    pub section: String,
    pub filename: String,
    pub text: String,
    pub score: f32,
}

// ── Knowledge graph ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Concept,
    Definition,
    Process,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Concept => "Concept",
            NodeKind::Definition => "Definition",
            NodeKind::Process => "Process",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Concept" => Some(NodeKind::Concept),
            "Definition" => Some(NodeKind::Definition),
            "Process" => Some(NodeKind::Process),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeKind {
    #[serde(rename = "RELATED_TO")]
    RelatedTo,
    #[serde(rename = "DEFINES")]
    Defines,
    #[serde(rename = "DEPENDS_ON")]
    DependsOn,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::RelatedTo => "RELATED_TO",
            EdgeKind::Defines => "DEFINES",
            EdgeKind::DependsOn => "DEPENDS_ON",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RELATED_TO" => Some(EdgeKind::RelatedTo),
            "DEFINES" => Some(EdgeKind::Defines),
            "DEPENDS_ON" => Some(EdgeKind::DependsOn),
            _ => None,
        }
    }
}

/// Minimum score an edge must carry to be written to the graph.
pub const MIN_EDGE_SCORE: f32 = 0.5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: Uuid,
    pub chatbot_id: Uuid,
    pub version: i64,
    pub kind: NodeKind,
    /// Display casing as extracted.
    pub name: String,
    /// Dedup key within (tenant, version, kind).
    pub normalized_name: String,
    pub description: String,
    /// Chunks that contributed this node; merged on dedup.
    pub chunk_ids: Vec<Uuid>,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: Uuid,
    pub chatbot_id: Uuid,
    pub version: i64,
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub kind: EdgeKind,
    pub score: f32,
    pub context: Option<String>,
    pub dependency_kind: Option<String>,
}

/// A node reached by graph expansion, with how far from a seed it sits.
#[derive(Debug, Clone)]
pub struct ExpandedNode {
    pub node: GraphNode,
    /// 0 for seeds, 1..=max_hops for neighbors.
    pub hop: u32,
    /// Highest score among the edges traversed to reach this node.
    pub via_score: f32,
}

/// Normalize an entity name for dedup: lowercase, collapse whitespace,
/// strip punctuation. Display casing is kept on the node itself.
pub fn normalize_name(name: &str) -> String {
    let lowered = name.to_lowercase();
    let stripped: String = lowered
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Sessions and messages ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            _ => None,
        }
    }
}

pub const MAX_MESSAGE_CHARS: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSession {
    pub id: Uuid,
    pub chatbot_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub message_count: i64,
}

impl ConversationSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    /// Assistant messages only.
    pub sources: Option<Vec<SourceRef>>,
    pub cancelled: bool,
    pub failed: bool,
    pub response_time_ms: Option<i64>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub retrieval_count: Option<i64>,
    pub retrieval_time_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

// ── Sources and retrieval context ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Vector,
    Graph,
}

/// Citation attached to an assistant message and streamed in the `sources`
/// event. Optional fields are present only when they apply to the kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub kind: SourceKind,
    pub score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relationship: Option<String>,
    /// ≤200-char preview of the cited text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_text: Option<String>,
}

// ── Daily stats ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStats {
    pub chatbot_id: Uuid,
    pub date: NaiveDate,
    pub sessions: i64,
    pub messages: i64,
    pub avg_response_ms: i64,
    pub p95_response_ms: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub retrieval_count: i64,
}

// ── Text hygiene ───────────────────────────────────────────────────────────

/// Strip NUL characters before persistence. SQLite tolerates them but JSON
/// round-trips and downstream consumers do not.
pub fn sanitize_text(text: &str) -> String {
    if text.contains('\u{0}') {
        text.replace('\u{0}', "")
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_deterministic() {
        let doc = Uuid::new_v4();
        assert_eq!(chunk_id(doc, 3), chunk_id(doc, 3));
        assert_ne!(chunk_id(doc, 3), chunk_id(doc, 4));
        assert_ne!(chunk_id(doc, 0), chunk_id(Uuid::new_v4(), 0));
    }

    #[test]
    fn test_collection_name_format() {
        let id = Uuid::parse_str("a1a2a3a4-b1b2-c1c2-d1d2-d3d4d5d6d7d8").unwrap();
        assert_eq!(
            collection_name(id, 2),
            "chatbot_a1a2a3a4b1b2c1c2d1d2d3d4d5d6d7d8_v2"
        );
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("  GraphRAG  Pipeline! "), "graphrag pipeline");
        assert_eq!(normalize_name("Photo-synthesis"), "photo synthesis");
        assert_eq!(normalize_name("A.B.C"), "a b c");
    }

    #[test]
    fn test_session_expiry_boundary() {
        let now = Utc::now();
        let session = ConversationSession {
            id: Uuid::new_v4(),
            chatbot_id: Uuid::new_v4(),
            created_at: now,
            expires_at: now + chrono::Duration::minutes(30),
            message_count: 0,
        };
        assert!(!session.is_expired(now + chrono::Duration::minutes(30)));
        assert!(session.is_expired(now + chrono::Duration::minutes(30) + chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_sanitize_strips_nul() {
        assert_eq!(sanitize_text("a\u{0}b"), "ab");
        assert_eq!(sanitize_text("clean"), "clean");
    }

    #[test]
    fn test_edge_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&EdgeKind::DependsOn).unwrap(),
            "\"DEPENDS_ON\""
        );
        assert_eq!(EdgeKind::parse("RELATED_TO"), Some(EdgeKind::RelatedTo));
    }
}
