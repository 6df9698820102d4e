//! SQLite-backed relational store: tenants, documents, versions, sessions,
//! messages, daily stats, and the durable ingest-job queue.
//!
//! All lifecycle transitions go through here, transactionally. Timestamps
//! are stored as fixed-width RFC 3339 UTC strings so lexicographic ordering
//! matches chronological ordering; UUIDs are stored as hyphenated text.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{RagError, Result};
use crate::types::{
    sanitize_text, Chatbot, ChatbotStatus, ConversationSession, DailyStats, Document,
    DocumentStatus, Message, MessageRole, BuildVersion, Persona, SourceRef, VersionStatus,
};

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS schema_meta (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS chatbots (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    persona TEXT NOT NULL,
    access_url TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL,
    active_version INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    chatbot_id TEXT NOT NULL REFERENCES chatbots(id) ON DELETE CASCADE,
    filename TEXT NOT NULL,
    file_path TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    status TEXT NOT NULL,
    version INTEGER NOT NULL,
    page_count INTEGER NOT NULL DEFAULT 0,
    progress INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    chunk_count INTEGER NOT NULL DEFAULT 0,
    entity_count INTEGER NOT NULL DEFAULT 0,
    processed_at TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_documents_chatbot ON documents(chatbot_id, version);

CREATE TABLE IF NOT EXISTS versions (
    id TEXT PRIMARY KEY,
    chatbot_id TEXT NOT NULL REFERENCES chatbots(id) ON DELETE CASCADE,
    version INTEGER NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    activated_at TEXT,
    UNIQUE (chatbot_id, version)
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    chatbot_id TEXT NOT NULL REFERENCES chatbots(id) ON DELETE CASCADE,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    message_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    sources TEXT,
    cancelled INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    response_time_ms INTEGER,
    input_tokens INTEGER,
    output_tokens INTEGER,
    retrieval_count INTEGER,
    retrieval_time_ms INTEGER,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, created_at);

CREATE TABLE IF NOT EXISTS daily_stats (
    chatbot_id TEXT NOT NULL,
    date TEXT NOT NULL,
    sessions INTEGER NOT NULL DEFAULT 0,
    messages INTEGER NOT NULL DEFAULT 0,
    avg_response_ms INTEGER NOT NULL DEFAULT 0,
    p95_response_ms INTEGER NOT NULL DEFAULT 0,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    retrieval_count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (chatbot_id, date)
);

CREATE TABLE IF NOT EXISTS ingest_jobs (
    id TEXT PRIMARY KEY,
    document_id TEXT NOT NULL,
    chatbot_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    claimed_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ingest_jobs_status ON ingest_jobs(status, created_at);
"#;

pub struct MetaStore {
    pool: SqlitePool,
}

#[derive(Debug, Clone)]
pub struct IngestJob {
    pub id: Uuid,
    pub document_id: Uuid,
    pub chatbot_id: Uuid,
    pub version: i64,
    pub attempts: i64,
}

fn now_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_string(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| RagError::Internal(format!("bad timestamp {raw:?}: {e}")))
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| RagError::Internal(format!("bad uuid {raw:?}: {e}")))
}

impl MetaStore {
    pub async fn connect(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// In-memory store for tests: one connection, since each `:memory:`
    /// connection is its own database.
    pub async fn connect_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply the schema. An existing database with a newer schema version
    /// than this binary understands is a migration error (exit code 2).
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;

        let existing: Option<i64> = sqlx::query_scalar("SELECT version FROM schema_meta LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        match existing {
            None => {
                sqlx::query("INSERT INTO schema_meta (version) VALUES (?)")
                    .bind(SCHEMA_VERSION)
                    .execute(&self.pool)
                    .await?;
            }
            Some(v) if v > SCHEMA_VERSION => {
                return Err(RagError::Internal(format!(
                    "database schema version {v} is newer than supported {SCHEMA_VERSION}; migration required"
                )));
            }
            Some(_) => {}
        }
        Ok(())
    }

    // ── Chatbots ───────────────────────────────────────────────────────────

    pub async fn create_chatbot(
        &self,
        name: &str,
        description: &str,
        persona: &Persona,
        access_url: &str,
    ) -> Result<Chatbot> {
        if name.trim().is_empty() {
            return Err(RagError::validation("chatbot name must not be empty"));
        }
        if access_url.is_empty()
            || !access_url
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(RagError::validation(
                "access_url must be non-empty and URL-safe ([a-zA-Z0-9_-])",
            ));
        }

        let chatbot = Chatbot {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: description.to_string(),
            persona: persona.clone(),
            access_url: access_url.to_string(),
            status: ChatbotStatus::Processing,
            active_version: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let result = sqlx::query(
            "INSERT INTO chatbots (id, name, description, persona, access_url, status, active_version, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(chatbot.id.to_string())
        .bind(&chatbot.name)
        .bind(&chatbot.description)
        .bind(serde_json::to_string(&chatbot.persona)?)
        .bind(&chatbot.access_url)
        .bind(chatbot.status.as_str())
        .bind(chatbot.active_version)
        .bind(ts_string(chatbot.created_at))
        .bind(ts_string(chatbot.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(chatbot),
            Err(e) => {
                let err: RagError = e.into();
                if matches!(err, RagError::Conflict(_)) {
                    Err(RagError::conflict(format!(
                        "access_url {access_url:?} already exists"
                    )))
                } else {
                    Err(err)
                }
            }
        }
    }

    fn row_to_chatbot(row: &sqlx::sqlite::SqliteRow) -> Result<Chatbot> {
        let status_raw: String = row.get("status");
        Ok(Chatbot {
            id: parse_id(&row.get::<String, _>("id"))?,
            name: row.get("name"),
            description: row.get("description"),
            persona: serde_json::from_str(&row.get::<String, _>("persona"))?,
            access_url: row.get("access_url"),
            status: ChatbotStatus::parse(&status_raw)
                .ok_or_else(|| RagError::Internal(format!("bad chatbot status {status_raw:?}")))?,
            active_version: row.get("active_version"),
            created_at: parse_ts(&row.get::<String, _>("created_at"))?,
            updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
        })
    }

    pub async fn get_chatbot(&self, id: Uuid) -> Result<Chatbot> {
        let row = sqlx::query("SELECT * FROM chatbots WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RagError::not_found(format!("chatbot {id}")))?;
        Self::row_to_chatbot(&row)
    }

    pub async fn get_chatbot_by_slug(&self, access_url: &str) -> Result<Chatbot> {
        let row = sqlx::query("SELECT * FROM chatbots WHERE access_url = ?")
            .bind(access_url)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RagError::not_found(format!("chatbot {access_url:?}")))?;
        Self::row_to_chatbot(&row)
    }

    pub async fn list_chatbots(&self) -> Result<Vec<Chatbot>> {
        let rows = sqlx::query("SELECT * FROM chatbots ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_chatbot).collect()
    }

    pub async fn update_chatbot(
        &self,
        id: Uuid,
        name: Option<&str>,
        description: Option<&str>,
        persona: Option<&Persona>,
    ) -> Result<Chatbot> {
        let current = self.get_chatbot(id).await?;
        let name = name.unwrap_or(&current.name);
        let description = description.unwrap_or(&current.description);
        let persona = persona.unwrap_or(&current.persona);

        sqlx::query(
            "UPDATE chatbots SET name = ?, description = ?, persona = ?, updated_at = ? WHERE id = ?",
        )
        .bind(name)
        .bind(description)
        .bind(serde_json::to_string(persona)?)
        .bind(now_string())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        self.get_chatbot(id).await
    }

    pub async fn set_chatbot_status(&self, id: Uuid, status: ChatbotStatus) -> Result<()> {
        let changed = sqlx::query("UPDATE chatbots SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now_string())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if changed == 0 {
            return Err(RagError::not_found(format!("chatbot {id}")));
        }
        Ok(())
    }

    /// Delete the relational rows for a tenant. Vector/graph/file cleanup is
    /// the version manager's job; it calls this last.
    pub async fn delete_chatbot(&self, id: Uuid) -> Result<()> {
        let changed = sqlx::query("DELETE FROM chatbots WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if changed == 0 {
            return Err(RagError::not_found(format!("chatbot {id}")));
        }
        Ok(())
    }

    pub async fn list_chatbots_with_status(&self, status: ChatbotStatus) -> Result<Vec<Chatbot>> {
        let rows = sqlx::query("SELECT * FROM chatbots WHERE status = ? ORDER BY created_at")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_chatbot).collect()
    }

    // ── Documents ──────────────────────────────────────────────────────────

    /// The caller supplies the id so the stored file can live at
    /// `{storage_root}/{tenant}/{document_id}.pdf` before the row exists.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_document(
        &self,
        id: Uuid,
        chatbot_id: Uuid,
        filename: &str,
        file_path: &str,
        size_bytes: i64,
        version: i64,
    ) -> Result<Document> {
        let document = Document {
            id,
            chatbot_id,
            filename: filename.to_string(),
            file_path: file_path.to_string(),
            size_bytes,
            status: DocumentStatus::Pending,
            version,
            page_count: 0,
            progress: 0,
            error_message: None,
            chunk_count: 0,
            entity_count: 0,
            processed_at: None,
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO documents (id, chatbot_id, filename, file_path, size_bytes, status, version, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(document.id.to_string())
        .bind(chatbot_id.to_string())
        .bind(filename)
        .bind(file_path)
        .bind(size_bytes)
        .bind(document.status.as_str())
        .bind(version)
        .bind(ts_string(document.created_at))
        .execute(&self.pool)
        .await?;

        Ok(document)
    }

    fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Result<Document> {
        let status_raw: String = row.get("status");
        let processed_at: Option<String> = row.get("processed_at");
        Ok(Document {
            id: parse_id(&row.get::<String, _>("id"))?,
            chatbot_id: parse_id(&row.get::<String, _>("chatbot_id"))?,
            filename: row.get("filename"),
            file_path: row.get("file_path"),
            size_bytes: row.get("size_bytes"),
            status: DocumentStatus::parse(&status_raw)
                .ok_or_else(|| RagError::Internal(format!("bad document status {status_raw:?}")))?,
            version: row.get("version"),
            page_count: row.get("page_count"),
            progress: row.get("progress"),
            error_message: row.get("error_message"),
            chunk_count: row.get("chunk_count"),
            entity_count: row.get("entity_count"),
            processed_at: processed_at.as_deref().map(parse_ts).transpose()?,
            created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        })
    }

    pub async fn get_document(&self, id: Uuid) -> Result<Document> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RagError::not_found(format!("document {id}")))?;
        Self::row_to_document(&row)
    }

    pub async fn list_documents(&self, chatbot_id: Uuid) -> Result<Vec<Document>> {
        let rows = sqlx::query("SELECT * FROM documents WHERE chatbot_id = ? ORDER BY created_at")
            .bind(chatbot_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_document).collect()
    }

    pub async fn documents_in_version(&self, chatbot_id: Uuid, version: i64) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            "SELECT * FROM documents WHERE chatbot_id = ? AND version = ? ORDER BY created_at",
        )
        .bind(chatbot_id.to_string())
        .bind(version)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_document).collect()
    }

    /// Transition a document to a pipeline stage. Written before the progress
    /// event is published on the bus.
    pub async fn set_document_stage(
        &self,
        id: Uuid,
        status: DocumentStatus,
        progress: i64,
    ) -> Result<()> {
        let changed = sqlx::query("UPDATE documents SET status = ?, progress = ?, error_message = NULL WHERE id = ?")
            .bind(status.as_str())
            .bind(progress)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if changed == 0 {
            return Err(RagError::not_found(format!("document {id}")));
        }
        Ok(())
    }

    pub async fn set_document_failed(&self, id: Uuid, error: &str) -> Result<()> {
        let truncated: String = error.chars().take(500).collect();
        sqlx::query("UPDATE documents SET status = 'failed', error_message = ? WHERE id = ?")
            .bind(truncated)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_document_parsed(&self, id: Uuid, page_count: i64) -> Result<()> {
        sqlx::query("UPDATE documents SET page_count = ? WHERE id = ?")
            .bind(page_count)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_document_completed(
        &self,
        id: Uuid,
        chunk_count: i64,
        entity_count: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE documents SET status = 'completed', progress = 100, chunk_count = ?, entity_count = ?, processed_at = ? WHERE id = ?",
        )
        .bind(chunk_count)
        .bind(entity_count)
        .bind(now_string())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Point an existing document at a new build version and reset its
    /// pipeline state, for re-ingestion when a fresh version opens.
    pub async fn reassign_document_version(&self, id: Uuid, version: i64) -> Result<()> {
        let changed = sqlx::query(
            "UPDATE documents SET version = ?, status = 'pending', progress = 0,
                                  error_message = NULL, chunk_count = 0, entity_count = 0,
                                  processed_at = NULL
             WHERE id = ?",
        )
        .bind(version)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if changed == 0 {
            return Err(RagError::not_found(format!("document {id}")));
        }
        Ok(())
    }

    pub async fn delete_document(&self, id: Uuid) -> Result<()> {
        let changed = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if changed == 0 {
            return Err(RagError::not_found(format!("document {id}")));
        }
        Ok(())
    }

    // ── Build versions ─────────────────────────────────────────────────────

    fn row_to_version(row: &sqlx::sqlite::SqliteRow) -> Result<BuildVersion> {
        let status_raw: String = row.get("status");
        let activated_at: Option<String> = row.get("activated_at");
        Ok(BuildVersion {
            id: parse_id(&row.get::<String, _>("id"))?,
            chatbot_id: parse_id(&row.get::<String, _>("chatbot_id"))?,
            version: row.get("version"),
            status: VersionStatus::parse(&status_raw)
                .ok_or_else(|| RagError::Internal(format!("bad version status {status_raw:?}")))?,
            created_at: parse_ts(&row.get::<String, _>("created_at"))?,
            activated_at: activated_at.as_deref().map(parse_ts).transpose()?,
        })
    }

    pub async fn next_version_number(&self, chatbot_id: Uuid) -> Result<i64> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM versions WHERE chatbot_id = ?")
                .bind(chatbot_id.to_string())
                .fetch_one(&self.pool)
                .await?;
        Ok(max.unwrap_or(0) + 1)
    }

    pub async fn create_version(&self, chatbot_id: Uuid) -> Result<BuildVersion> {
        // The UNIQUE (chatbot_id, version) constraint turns a racing
        // double-create into a retryable conflict.
        let number = self.next_version_number(chatbot_id).await?;
        let version = BuildVersion {
            id: Uuid::new_v4(),
            chatbot_id,
            version: number,
            status: VersionStatus::Building,
            created_at: Utc::now(),
            activated_at: None,
        };

        sqlx::query(
            "INSERT INTO versions (id, chatbot_id, version, status, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(version.id.to_string())
        .bind(chatbot_id.to_string())
        .bind(number)
        .bind(version.status.as_str())
        .bind(ts_string(version.created_at))
        .execute(&self.pool)
        .await?;

        tracing::info!(chatbot = %chatbot_id, version = number, "created build version");
        Ok(version)
    }

    pub async fn get_version(&self, chatbot_id: Uuid, version: i64) -> Result<BuildVersion> {
        let row = sqlx::query("SELECT * FROM versions WHERE chatbot_id = ? AND version = ?")
            .bind(chatbot_id.to_string())
            .bind(version)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RagError::not_found(format!("version {version} of {chatbot_id}")))?;
        Self::row_to_version(&row)
    }

    pub async fn list_versions(&self, chatbot_id: Uuid) -> Result<Vec<BuildVersion>> {
        let rows = sqlx::query("SELECT * FROM versions WHERE chatbot_id = ? ORDER BY version DESC")
            .bind(chatbot_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_version).collect()
    }

    pub async fn get_active_version(&self, chatbot_id: Uuid) -> Result<Option<BuildVersion>> {
        let row = sqlx::query("SELECT * FROM versions WHERE chatbot_id = ? AND status = 'active'")
            .bind(chatbot_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_version).transpose()
    }

    pub async fn set_version_status(
        &self,
        chatbot_id: Uuid,
        version: i64,
        status: VersionStatus,
    ) -> Result<()> {
        let changed =
            sqlx::query("UPDATE versions SET status = ? WHERE chatbot_id = ? AND version = ?")
                .bind(status.as_str())
                .bind(chatbot_id.to_string())
                .bind(version)
                .execute(&self.pool)
                .await?
                .rows_affected();
        if changed == 0 {
            return Err(RagError::not_found(format!("version {version} of {chatbot_id}")));
        }
        Ok(())
    }

    /// Delete a version row. Active versions cannot be deleted.
    pub async fn delete_version(&self, chatbot_id: Uuid, version: i64) -> Result<()> {
        let current = self.get_version(chatbot_id, version).await?;
        if current.status == VersionStatus::Active {
            return Err(RagError::conflict(format!(
                "version {version} is active and cannot be deleted"
            )));
        }
        sqlx::query("DELETE FROM versions WHERE chatbot_id = ? AND version = ?")
            .bind(chatbot_id.to_string())
            .bind(version)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Atomic activation: flip the version to active, archive the previous
    /// active one, and point the tenant at the new number in one transaction,
    /// so readers never observe a torn (status, active_version) pair.
    pub async fn activate_version(&self, chatbot_id: Uuid, version: i64) -> Result<BuildVersion> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM versions WHERE chatbot_id = ? AND version = ?")
            .bind(chatbot_id.to_string())
            .bind(version)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| RagError::not_found(format!("version {version} of {chatbot_id}")))?;
        let target = Self::row_to_version(&row)?;

        if !matches!(target.status, VersionStatus::Ready | VersionStatus::Active) {
            return Err(RagError::conflict(format!(
                "cannot activate version {version} with status {}",
                target.status.as_str()
            )));
        }

        sqlx::query(
            "UPDATE versions SET status = 'archived' WHERE chatbot_id = ? AND status = 'active' AND version != ?",
        )
        .bind(chatbot_id.to_string())
        .bind(version)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE versions SET status = 'active', activated_at = ? WHERE chatbot_id = ? AND version = ?",
        )
        .bind(now_string())
        .bind(chatbot_id.to_string())
        .bind(version)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE chatbots SET active_version = ?, status = 'active', updated_at = ? WHERE id = ?",
        )
        .bind(version)
        .bind(now_string())
        .bind(chatbot_id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!(chatbot = %chatbot_id, version, "activated version");
        self.get_version(chatbot_id, version).await
    }

    // ── Sessions and messages ──────────────────────────────────────────────

    pub async fn create_session(&self, chatbot_id: Uuid, ttl_min: i64) -> Result<ConversationSession> {
        let now = Utc::now();
        let session = ConversationSession {
            id: Uuid::new_v4(),
            chatbot_id,
            created_at: now,
            expires_at: now + chrono::Duration::minutes(ttl_min),
            message_count: 0,
        };

        sqlx::query(
            "INSERT INTO sessions (id, chatbot_id, created_at, expires_at, message_count) VALUES (?, ?, ?, ?, 0)",
        )
        .bind(session.id.to_string())
        .bind(chatbot_id.to_string())
        .bind(ts_string(session.created_at))
        .bind(ts_string(session.expires_at))
        .execute(&self.pool)
        .await?;

        Ok(session)
    }

    fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> Result<ConversationSession> {
        Ok(ConversationSession {
            id: parse_id(&row.get::<String, _>("id"))?,
            chatbot_id: parse_id(&row.get::<String, _>("chatbot_id"))?,
            created_at: parse_ts(&row.get::<String, _>("created_at"))?,
            expires_at: parse_ts(&row.get::<String, _>("expires_at"))?,
            message_count: row.get("message_count"),
        })
    }

    pub async fn get_session(&self, id: Uuid) -> Result<ConversationSession> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RagError::not_found(format!("session {id}")))?;
        Self::row_to_session(&row)
    }

    /// Purge sessions expired for longer than `grace`.
    pub async fn purge_expired_sessions(&self, grace: chrono::Duration) -> Result<u64> {
        let cutoff = ts_string(Utc::now() - grace);
        let deleted = sqlx::query("DELETE FROM sessions WHERE expires_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted)
    }

    fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<Message> {
        let role_raw: String = row.get("role");
        let sources_raw: Option<String> = row.get("sources");
        let sources: Option<Vec<SourceRef>> = sources_raw
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(Message {
            id: parse_id(&row.get::<String, _>("id"))?,
            session_id: parse_id(&row.get::<String, _>("session_id"))?,
            role: MessageRole::parse(&role_raw)
                .ok_or_else(|| RagError::Internal(format!("bad message role {role_raw:?}")))?,
            content: row.get("content"),
            sources,
            cancelled: row.get::<i64, _>("cancelled") != 0,
            failed: row.get::<i64, _>("failed") != 0,
            response_time_ms: row.get("response_time_ms"),
            input_tokens: row.get("input_tokens"),
            output_tokens: row.get("output_tokens"),
            retrieval_count: row.get("retrieval_count"),
            retrieval_time_ms: row.get("retrieval_time_ms"),
            created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        })
    }

    /// Persist a message. In the same transaction the session message count
    /// increments and the tenant's daily-stats row for today is recomputed;
    /// the single-writer rule for counters lives here.
    pub async fn add_message(&self, message: &NewMessage<'_>) -> Result<Message> {
        if message.content.chars().count() > crate::types::MAX_MESSAGE_CHARS {
            return Err(RagError::validation(format!(
                "message exceeds {} characters",
                crate::types::MAX_MESSAGE_CHARS
            )));
        }

        let mut tx = self.pool.begin().await?;

        let session_row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(message.session_id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| RagError::not_found(format!("session {}", message.session_id)))?;
        let session = Self::row_to_session(&session_row)?;

        let stored = Message {
            id: Uuid::new_v4(),
            session_id: message.session_id,
            role: message.role,
            content: sanitize_text(message.content),
            sources: message.sources.map(|s| s.to_vec()),
            cancelled: message.cancelled,
            failed: message.failed,
            response_time_ms: message.response_time_ms,
            input_tokens: message.input_tokens,
            output_tokens: message.output_tokens,
            retrieval_count: message.retrieval_count,
            retrieval_time_ms: message.retrieval_time_ms,
            created_at: Utc::now(),
        };

        let sources_json = stored
            .sources
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            "INSERT INTO messages (id, session_id, role, content, sources, cancelled, failed,
                                   response_time_ms, input_tokens, output_tokens, retrieval_count,
                                   retrieval_time_ms, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(stored.id.to_string())
        .bind(stored.session_id.to_string())
        .bind(stored.role.as_str())
        .bind(&stored.content)
        .bind(sources_json)
        .bind(stored.cancelled as i64)
        .bind(stored.failed as i64)
        .bind(stored.response_time_ms)
        .bind(stored.input_tokens)
        .bind(stored.output_tokens)
        .bind(stored.retrieval_count)
        .bind(stored.retrieval_time_ms)
        .bind(ts_string(stored.created_at))
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE sessions SET message_count = message_count + 1 WHERE id = ?")
            .bind(stored.session_id.to_string())
            .execute(&mut *tx)
            .await?;

        let today = stored.created_at.date_naive();
        Self::recompute_day_tx(&mut tx, session.chatbot_id, today).await?;

        tx.commit().await?;
        Ok(stored)
    }

    /// The most recent `n` messages of a session, in chronological order:
    /// the tail of the history, not the head.
    pub async fn session_messages_tail(&self, session_id: Uuid, n: usize) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM (
                 SELECT * FROM messages WHERE session_id = ? ORDER BY created_at DESC, id LIMIT ?
             ) ORDER BY created_at ASC, id",
        )
        .bind(session_id.to_string())
        .bind(n as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_message).collect()
    }

    pub async fn message_count(&self, session_id: Uuid) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE session_id = ?")
            .bind(session_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ── Daily stats ────────────────────────────────────────────────────────

    /// Recompute the (tenant, date) aggregates from message rows. Used by
    /// both the synchronous writer (inside `add_message`) and the rebuild
    /// path, so the two can never disagree.
    async fn recompute_day_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        chatbot_id: Uuid,
        date: NaiveDate,
    ) -> Result<()> {
        let date_str = date.format("%Y-%m-%d").to_string();

        // Every message counts, both roles.
        let message_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages m
             JOIN sessions s ON s.id = m.session_id
             WHERE s.chatbot_id = ? AND substr(m.created_at, 1, 10) = ?",
        )
        .bind(chatbot_id.to_string())
        .bind(&date_str)
        .fetch_one(&mut **tx)
        .await?;

        // A session counts on the day of its first message.
        let session_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM (
                 SELECT m.session_id, MIN(m.created_at) AS first_at FROM messages m
                 JOIN sessions s ON s.id = m.session_id
                 WHERE s.chatbot_id = ?
                 GROUP BY m.session_id
             ) WHERE substr(first_at, 1, 10) = ?",
        )
        .bind(chatbot_id.to_string())
        .bind(&date_str)
        .fetch_one(&mut **tx)
        .await?;

        let rows = sqlx::query(
            "SELECT m.response_time_ms, m.input_tokens, m.output_tokens, m.retrieval_count
             FROM messages m JOIN sessions s ON s.id = m.session_id
             WHERE s.chatbot_id = ? AND m.role = 'assistant' AND substr(m.created_at, 1, 10) = ?",
        )
        .bind(chatbot_id.to_string())
        .bind(&date_str)
        .fetch_all(&mut **tx)
        .await?;

        let mut response_times: Vec<i64> = Vec::new();
        let mut input_tokens = 0i64;
        let mut output_tokens = 0i64;
        let mut retrieval_count = 0i64;
        for row in &rows {
            if let Some(ms) = row.get::<Option<i64>, _>("response_time_ms") {
                response_times.push(ms);
            }
            input_tokens += row.get::<Option<i64>, _>("input_tokens").unwrap_or(0);
            output_tokens += row.get::<Option<i64>, _>("output_tokens").unwrap_or(0);
            retrieval_count += row.get::<Option<i64>, _>("retrieval_count").unwrap_or(0);
        }

        let (avg_ms, p95_ms) = crate::stats::response_time_aggregates(&mut response_times);

        sqlx::query(
            "INSERT INTO daily_stats (chatbot_id, date, sessions, messages, avg_response_ms,
                                      p95_response_ms, input_tokens, output_tokens, retrieval_count)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (chatbot_id, date) DO UPDATE SET
                 sessions = excluded.sessions,
                 messages = excluded.messages,
                 avg_response_ms = excluded.avg_response_ms,
                 p95_response_ms = excluded.p95_response_ms,
                 input_tokens = excluded.input_tokens,
                 output_tokens = excluded.output_tokens,
                 retrieval_count = excluded.retrieval_count",
        )
        .bind(chatbot_id.to_string())
        .bind(&date_str)
        .bind(session_count)
        .bind(message_count)
        .bind(avg_ms)
        .bind(p95_ms)
        .bind(input_tokens)
        .bind(output_tokens)
        .bind(retrieval_count)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    fn row_to_stats(row: &sqlx::sqlite::SqliteRow) -> Result<DailyStats> {
        let date_raw: String = row.get("date");
        Ok(DailyStats {
            chatbot_id: parse_id(&row.get::<String, _>("chatbot_id"))?,
            date: NaiveDate::parse_from_str(&date_raw, "%Y-%m-%d")
                .map_err(|e| RagError::Internal(format!("bad stats date {date_raw:?}: {e}")))?,
            sessions: row.get("sessions"),
            messages: row.get("messages"),
            avg_response_ms: row.get("avg_response_ms"),
            p95_response_ms: row.get("p95_response_ms"),
            input_tokens: row.get("input_tokens"),
            output_tokens: row.get("output_tokens"),
            retrieval_count: row.get("retrieval_count"),
        })
    }

    pub async fn daily_stats(&self, chatbot_id: Uuid, days: u32) -> Result<Vec<DailyStats>> {
        let cutoff = (Utc::now().date_naive() - chrono::Duration::days(days as i64 - 1))
            .format("%Y-%m-%d")
            .to_string();
        let rows = sqlx::query(
            "SELECT * FROM daily_stats WHERE chatbot_id = ? AND date >= ? ORDER BY date",
        )
        .bind(chatbot_id.to_string())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_stats).collect()
    }

    /// Rebuild every stats row for a tenant from raw messages. Idempotent;
    /// the result is identical to what the synchronous writer maintained.
    pub async fn rebuild_daily_stats(&self, chatbot_id: Uuid) -> Result<usize> {
        let dates: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT substr(m.created_at, 1, 10) FROM messages m
             JOIN sessions s ON s.id = m.session_id WHERE s.chatbot_id = ?",
        )
        .bind(chatbot_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM daily_stats WHERE chatbot_id = ?")
            .bind(chatbot_id.to_string())
            .execute(&mut *tx)
            .await?;
        for date_str in &dates {
            let date = NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
                .map_err(|e| RagError::Internal(format!("bad message date {date_str:?}: {e}")))?;
            Self::recompute_day_tx(&mut tx, chatbot_id, date).await?;
        }
        tx.commit().await?;
        Ok(dates.len())
    }

    // ── Ingest job queue ───────────────────────────────────────────────────

    pub async fn enqueue_job(
        &self,
        document_id: Uuid,
        chatbot_id: Uuid,
        version: i64,
    ) -> Result<IngestJob> {
        let job = IngestJob {
            id: Uuid::new_v4(),
            document_id,
            chatbot_id,
            version,
            attempts: 0,
        };
        sqlx::query(
            "INSERT INTO ingest_jobs (id, document_id, chatbot_id, version, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, 'queued', ?, ?)",
        )
        .bind(job.id.to_string())
        .bind(document_id.to_string())
        .bind(chatbot_id.to_string())
        .bind(version)
        .bind(now_string())
        .bind(now_string())
        .execute(&self.pool)
        .await?;
        Ok(job)
    }

    /// Claim the oldest queued job. Jobs ack late: the row stays `running`
    /// until completed or failed, and stale claims are requeued at startup.
    pub async fn claim_job(&self) -> Result<Option<IngestJob>> {
        let row = sqlx::query(
            "UPDATE ingest_jobs SET status = 'running', claimed_at = ?, updated_at = ?,
                                    attempts = attempts + 1
             WHERE id = (SELECT id FROM ingest_jobs WHERE status = 'queued' ORDER BY created_at LIMIT 1)
             RETURNING id, document_id, chatbot_id, version, attempts",
        )
        .bind(now_string())
        .bind(now_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(IngestJob {
                id: parse_id(&row.get::<String, _>("id"))?,
                document_id: parse_id(&row.get::<String, _>("document_id"))?,
                chatbot_id: parse_id(&row.get::<String, _>("chatbot_id"))?,
                version: row.get("version"),
                attempts: row.get("attempts"),
            })
        })
        .transpose()
    }

    pub async fn complete_job(&self, job_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE ingest_jobs SET status = 'done', updated_at = ? WHERE id = ?")
            .bind(now_string())
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn fail_job(&self, job_id: Uuid, error: &str) -> Result<()> {
        let truncated: String = error.chars().take(500).collect();
        sqlx::query(
            "UPDATE ingest_jobs SET status = 'failed', last_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(truncated)
        .bind(now_string())
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Requeue `running` jobs whose claim is older than `stale_after`; called
    /// once at startup so work interrupted by a crash resumes.
    pub async fn requeue_stale_jobs(&self, stale_after: chrono::Duration) -> Result<u64> {
        let cutoff = ts_string(Utc::now() - stale_after);
        let requeued = sqlx::query(
            "UPDATE ingest_jobs SET status = 'queued', claimed_at = NULL, updated_at = ?
             WHERE status = 'running' AND claimed_at < ?",
        )
        .bind(now_string())
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(requeued)
    }

    pub async fn queued_job_counts(&self) -> Result<HashMap<String, i64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM ingest_jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get::<String, _>("status"), row.get::<i64, _>("n")))
            .collect())
    }
}

/// Insert payload for `add_message`.
#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub session_id: Uuid,
    pub role: MessageRole,
    pub content: &'a str,
    pub sources: Option<&'a [SourceRef]>,
    pub cancelled: bool,
    pub failed: bool,
    pub response_time_ms: Option<i64>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub retrieval_count: Option<i64>,
    pub retrieval_time_ms: Option<i64>,
}

impl<'a> NewMessage<'a> {
    pub fn user(session_id: Uuid, content: &'a str) -> Self {
        Self {
            session_id,
            role: MessageRole::User,
            content,
            sources: None,
            cancelled: false,
            failed: false,
            response_time_ms: None,
            input_tokens: None,
            output_tokens: None,
            retrieval_count: None,
            retrieval_time_ms: None,
        }
    }
}
