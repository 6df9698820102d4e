//! Administrator surface: tenants, documents, versions, stats.

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use uttar_rag::types::{ChatbotStatus, Persona};
use uttar_rag::{BusEvent, RagError};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateChatbotRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub persona: Persona,
    pub access_url: String,
}

pub async fn create_chatbot(
    State(state): State<AppState>,
    Json(body): Json<CreateChatbotRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let chatbot = state
        .meta
        .create_chatbot(&body.name, &body.description, &body.persona, &body.access_url)
        .await?;
    Ok((StatusCode::CREATED, Json(json!(chatbot))))
}

pub async fn list_chatbots(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let chatbots = state.meta.list_chatbots().await?;
    Ok(Json(json!({ "chatbots": chatbots })))
}

pub async fn get_chatbot(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let chatbot = state.meta.get_chatbot(id).await?;
    Ok(Json(json!(chatbot)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateChatbotRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub persona: Option<Persona>,
}

pub async fn update_chatbot(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateChatbotRequest>,
) -> ApiResult<Json<Value>> {
    let chatbot = state
        .meta
        .update_chatbot(
            id,
            body.name.as_deref(),
            body.description.as_deref(),
            body.persona.as_ref(),
        )
        .await?;
    Ok(Json(json!(chatbot)))
}

#[derive(Debug, Deserialize)]
pub struct SetStatusRequest {
    pub status: String,
}

pub async fn set_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<SetStatusRequest>,
) -> ApiResult<StatusCode> {
    let status = match body.status.as_str() {
        "active" => ChatbotStatus::Active,
        "inactive" => ChatbotStatus::Inactive,
        other => {
            return Err(RagError::Validation(format!(
                "status must be active or inactive, got {other:?}"
            ))
            .into())
        }
    };
    state.meta.set_chatbot_status(id, status).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Cascade delete: every artifact across all three stores. Substep failure
/// parks the tenant for the janitor and still returns 202.
pub async fn delete_chatbot(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    // Verify existence first so a bad id is a clean 404.
    state.meta.get_chatbot(id).await?;
    match state.versions.cleanup_chatbot(id).await {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(e) if e.is_transient() => {
            tracing::warn!(chatbot = %id, error = %e, "cleanup deferred to janitor");
            Ok(StatusCode::ACCEPTED)
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn upload_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let chatbot = state.meta.get_chatbot(id).await?;
    let max_bytes = state.config.ingest.max_document_bytes;

    let mut stored: Option<(Uuid, String, std::path::PathBuf, u64)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError(RagError::Validation(format!("multipart: {e}"))))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(|f| f.to_string())
            .unwrap_or_else(|| "document.pdf".to_string());
        if !filename.to_lowercase().ends_with(".pdf") {
            return Err(RagError::Validation("only PDF uploads are accepted".into()).into());
        }

        let document_id = Uuid::new_v4();
        let dir = state.config.storage.storage_root.join(chatbot.id.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ApiError(RagError::Transient(format!("storage: {e}"))))?;
        let path = dir.join(format!("{document_id}.pdf"));

        // Stream to disk with the size cap enforced before a byte over the
        // limit is kept.
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| ApiError(RagError::Transient(format!("storage: {e}"))))?;
        let mut written: u64 = 0;
        let mut field = field;
        while let Some(bytes) = field
            .chunk()
            .await
            .map_err(|e| ApiError(RagError::Validation(format!("upload: {e}"))))?
        {
            written += bytes.len() as u64;
            if written > max_bytes {
                drop(file);
                let _ = tokio::fs::remove_file(&path).await;
                return Err(
                    RagError::Validation(format!("document exceeds {max_bytes} bytes")).into(),
                );
            }
            tokio::io::AsyncWriteExt::write_all(&mut file, &bytes)
                .await
                .map_err(|e| ApiError(RagError::Transient(format!("storage: {e}"))))?;
        }
        tokio::io::AsyncWriteExt::flush(&mut file)
            .await
            .map_err(|e| ApiError(RagError::Transient(format!("storage: {e}"))))?;

        stored = Some((document_id, filename, path, written));
        break;
    }

    let Some((document_id, filename, path, size)) = stored else {
        return Err(RagError::Validation("multipart field 'file' is required".into()).into());
    };
    if size == 0 {
        let _ = tokio::fs::remove_file(&path).await;
        return Err(RagError::Validation("uploaded file is empty".into()).into());
    }

    let document = state
        .orchestrator
        .enqueue_document(
            document_id,
            chatbot.id,
            &filename,
            &path.to_string_lossy(),
            size as i64,
        )
        .await?;

    Ok((StatusCode::ACCEPTED, Json(json!(document))))
}

pub async fn list_documents(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let chatbot = state.meta.get_chatbot(id).await?;
    let documents = state.meta.list_documents(id).await?;
    let graph_stats = state.graph.stats(id, chatbot.active_version).await?;
    Ok(Json(json!({
        "documents": documents,
        "graph": {
            "node_count": graph_stats.node_count,
            "edge_count": graph_stats.edge_count,
            "nodes_by_kind": graph_stats.nodes_by_kind,
        },
    })))
}

/// Remove a document: its vectors in its build version, its stored file, and
/// the row. Graph contributions fade out with the next rebuilt version.
pub async fn delete_document(
    State(state): State<AppState>,
    Path((id, doc_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    let document = state.meta.get_document(doc_id).await?;
    if document.chatbot_id != id {
        return Err(RagError::not_found(format!("document {doc_id}")).into());
    }

    state
        .vector
        .delete_document(id, document.version, doc_id)
        .await?;
    let _ = tokio::fs::remove_file(&document.file_path).await;
    state.meta.delete_document(doc_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn document_progress(
    State(state): State<AppState>,
    Path((id, doc_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Value>> {
    let document = state.meta.get_document(doc_id).await?;
    if document.chatbot_id != id {
        return Err(RagError::not_found(format!("document {doc_id}")).into());
    }

    // The bus has the freshest state; the row is the durable fallback.
    let (progress, stage, error) = match state.bus.poll(doc_id) {
        Some(BusEvent::Progress {
            progress,
            stage,
            error,
        }) => (progress, stage, error),
        _ => (
            document.progress,
            document.status.as_str().to_string(),
            document.error_message.clone(),
        ),
    };

    Ok(Json(json!({
        "progress": progress,
        "stage": stage,
        "error": error,
    })))
}

pub async fn list_versions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    state.meta.get_chatbot(id).await?;
    let versions = state.meta.list_versions(id).await?;
    Ok(Json(json!({ "versions": versions })))
}

pub async fn activate_version(
    State(state): State<AppState>,
    Path((id, version)): Path<(Uuid, i64)>,
) -> ApiResult<Json<Value>> {
    let activated = state.versions.activate(id, version).await?;
    Ok(Json(json!(activated)))
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    #[serde(default = "default_days")]
    pub days: u32,
}

fn default_days() -> u32 {
    7
}

pub async fn stats(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Json<Value>> {
    state.meta.get_chatbot(id).await?;
    let days = query.days.clamp(1, 365);
    let stats = state.meta.daily_stats(id, days).await?;
    Ok(Json(json!({ "days": days, "stats": stats })))
}

/// Repair path: recompute every stats row from raw messages. Idempotent.
pub async fn rebuild_stats(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    state.meta.get_chatbot(id).await?;
    let rebuilt_days = state.meta.rebuild_daily_stats(id).await?;
    Ok(Json(json!({ "rebuilt_days": rebuilt_days })))
}
